//! Copy-out access to bulk data reachable from decoded references.
//!
//! With force-copy on, native code never sees managed memory directly. It gets
//! a private copy with red zones on both sides, which are checked when the copy
//! is handed back so overruns are caught at the boundary.
use crate::{
    error::{jni_abort, Error, Result},
    guard::ThreadStateGuard,
};

pub const RED_ZONE_SIZE: usize = 256;

const CANARY: &[u8] = b"JNI BUFFER RED ZONE-";

fn canary(i: usize) -> u8 {
    CANARY[i % CANARY.len()]
}

/// Heap copy of `len` bytes with a red zone before and after the data.
pub struct GuardedCopy {
    buf: Box<[u8]>,
    len: usize,
}

impl GuardedCopy {
    pub fn create(data: &[u8]) -> Self {
        let len = data.len();
        let mut buf = vec![0u8; len + 2 * RED_ZONE_SIZE].into_boxed_slice();
        for i in 0..RED_ZONE_SIZE {
            buf[i] = canary(i);
            buf[RED_ZONE_SIZE + len + i] = canary(i);
        }
        buf[RED_ZONE_SIZE..RED_ZONE_SIZE + len].copy_from_slice(data);
        Self { buf, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[RED_ZONE_SIZE..RED_ZONE_SIZE + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[RED_ZONE_SIZE..RED_ZONE_SIZE + self.len]
    }

    pub fn as_ptr(&self) -> *const u8 {
        // in bounds: the buffer always holds both red zones
        unsafe { self.buf.as_ptr().add(RED_ZONE_SIZE) }
    }

    /// Pointer handed to native code. Writes outside `len` bytes land in the
    /// red zones.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.buf.as_mut_ptr().add(RED_ZONE_SIZE) }
    }

    pub fn check(&self) -> Result<()> {
        let (front, rest) = self.buf.split_at(RED_ZONE_SIZE);
        let back = &rest[self.len..];

        if front.iter().enumerate().any(|(i, &b)| b != canary(i)) {
            return Err(Error::GuardedCopyCorrupted {
                len: self.len,
                reason: "red zone before the data was overwritten",
            });
        }

        if back.iter().enumerate().any(|(i, &b)| b != canary(i)) {
            return Err(Error::GuardedCopyCorrupted {
                len: self.len,
                reason: "red zone after the data was overwritten",
            });
        }

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReleaseMode {
    /// Write the data back and free the copy.
    CopyBack,
    /// Free the copy without writing back.
    Abort,
}

/// Array elements handed to native code: a direct view into the array, or a
/// guarded copy when force-copy is on.
///
/// Dropping without [`Elements::release`] behaves like [`ReleaseMode::Abort`].
#[must_use]
pub enum Elements<'g> {
    Direct(&'g mut [u8]),
    Copied {
        copy: GuardedCopy,
        original: &'g mut [u8],
        check_jni: bool,
    },
}

impl<'g> Elements<'g> {
    pub fn is_copy(&self) -> bool {
        matches!(self, Self::Copied { .. })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Direct(data) => data,
            Self::Copied { copy, .. } => copy.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Direct(data) => data,
            Self::Copied { copy, .. } => copy.as_mut_slice(),
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Self::Direct(data) => data.as_mut_ptr(),
            Self::Copied { copy, .. } => copy.as_mut_ptr(),
        }
    }

    /// Writes the copy back and keeps it for further use.
    pub fn commit(&mut self) -> Result<()> {
        if let Self::Copied {
            copy,
            original,
            check_jni,
        } = self
        {
            verify(copy, *check_jni, "ReleaseArrayElements")?;
            original.copy_from_slice(copy.as_slice());
        }

        Ok(())
    }

    pub fn release(self, mode: ReleaseMode) -> Result<()> {
        match self {
            Self::Direct(_) => Ok(()),
            Self::Copied {
                copy,
                original,
                check_jni,
            } => {
                verify(&copy, check_jni, "ReleaseArrayElements")?;
                if mode == ReleaseMode::CopyBack {
                    original.copy_from_slice(copy.as_slice());
                }
                Ok(())
            }
        }
    }
}

/// Read-only characters of a string handed to native code.
#[must_use]
pub enum StringChars<'g> {
    Direct(&'g [u8]),
    Copied {
        copy: GuardedCopy,
        original: &'g [u8],
        check_jni: bool,
    },
}

impl<'g> StringChars<'g> {
    pub fn is_copy(&self) -> bool {
        matches!(self, Self::Copied { .. })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Direct(data) => data,
            Self::Copied { copy, .. } => copy.as_slice(),
        }
    }

    /// Pointer handed to native code. Only a copy can be written through, and
    /// doing so is reported on release.
    pub fn as_ptr(&mut self) -> *const u8 {
        match self {
            Self::Direct(data) => data.as_ptr(),
            Self::Copied { copy, .. } => copy.as_mut_ptr(),
        }
    }

    pub fn release(self) -> Result<()> {
        match self {
            Self::Direct(_) => Ok(()),
            Self::Copied {
                copy,
                original,
                check_jni,
            } => {
                verify(&copy, check_jni, "ReleaseStringUTFChars")?;
                if copy.as_slice() != original {
                    let err = Error::ModifiedReadOnlyCopy(copy.len());
                    if check_jni {
                        jni_abort("ReleaseStringUTFChars", &err);
                    }
                    return Err(err);
                }
                Ok(())
            }
        }
    }
}

fn verify(copy: &GuardedCopy, check_jni: bool, function: &str) -> Result<()> {
    copy.check().map_err(|err| {
        log::error!(target: "jni", "{} in call to {}", err, function);
        if check_jni {
            jni_abort(function, &err);
        }
        err
    })
}

/// Gives native code access to array data. The result borrows the guard, so
/// it cannot be kept past the Runnable scope.
pub fn get_array_elements<'g>(
    guard: &'g ThreadStateGuard<'_>,
    data: &'g mut [u8],
) -> Result<Elements<'g>> {
    guard.ensure_runnable()?;

    Ok(if guard.force_copy_required() {
        Elements::Copied {
            copy: GuardedCopy::create(data),
            original: data,
            check_jni: guard.runtime().config().check_jni,
        }
    } else {
        Elements::Direct(data)
    })
}

pub fn get_string_utf_chars<'g>(
    guard: &'g ThreadStateGuard<'_>,
    chars: &'g [u8],
) -> Result<StringChars<'g>> {
    guard.ensure_runnable()?;

    Ok(if guard.force_copy_required() {
        StringChars::Copied {
            copy: GuardedCopy::create(chars),
            original: chars,
            check_jni: guard.runtime().config().check_jni,
        }
    } else {
        StringChars::Direct(chars)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, runtime::Runtime, state::ThreadState};

    fn runtime(force_copy: bool) -> Runtime {
        let runtime = Runtime::new(
            Config::default()
                .with_force_copy(force_copy)
                .with_check_jni(false),
        );
        runtime.attach_current_thread(None).unwrap();
        runtime
    }

    #[test]
    fn guarded_copy_detects_overruns() {
        let mut copy = GuardedCopy::create(b"hello");
        assert_eq!(copy.as_slice(), b"hello");
        assert!(copy.check().is_ok());

        unsafe {
            *copy.as_mut_ptr().add(5) = 0;
        }
        assert_eq!(
            copy.check(),
            Err(Error::GuardedCopyCorrupted {
                len: 5,
                reason: "red zone after the data was overwritten"
            })
        );

        let mut copy = GuardedCopy::create(&[]);
        assert!(copy.is_empty());
        unsafe {
            *copy.as_mut_ptr().sub(1) = 0;
        }
        assert!(matches!(
            copy.check(),
            Err(Error::GuardedCopyCorrupted { len: 0, .. })
        ));
    }

    #[test]
    fn direct_view_without_force_copy() {
        let runtime = runtime(false);
        let mut data = [1u8, 2, 3];
        runtime
            .with_state(ThreadState::Runnable, |guard| {
                let mut elements = get_array_elements(guard, &mut data).unwrap();
                assert!(!elements.is_copy());
                elements.as_mut_slice()[0] = 9;
                elements.release(ReleaseMode::Abort).unwrap();
            })
            .unwrap();
        assert_eq!(data, [9, 2, 3]);
        runtime.detach_current_thread().unwrap();
    }

    #[test]
    fn copy_back_and_abort() {
        let runtime = runtime(true);
        let mut data = [1u8, 2, 3];
        runtime
            .with_state(ThreadState::Runnable, |guard| {
                let mut elements = get_array_elements(guard, &mut data).unwrap();
                assert!(elements.is_copy());
                elements.as_mut_slice()[0] = 7;
                elements.release(ReleaseMode::Abort).unwrap();
            })
            .unwrap();
        assert_eq!(data, [1, 2, 3]);

        runtime
            .with_state(ThreadState::Runnable, |guard| {
                let mut elements = get_array_elements(guard, &mut data).unwrap();
                elements.as_mut_slice()[1] = 8;
                elements.commit().unwrap();
                elements.as_mut_slice()[2] = 9;
                elements.release(ReleaseMode::CopyBack).unwrap();
            })
            .unwrap();
        assert_eq!(data, [1, 8, 9]);
        runtime.detach_current_thread().unwrap();
    }

    #[test]
    fn overrun_is_reported_on_release() {
        let runtime = runtime(true);
        let mut data = [0u8; 4];
        let result = runtime
            .with_state(ThreadState::Runnable, |guard| {
                let mut elements = get_array_elements(guard, &mut data).unwrap();
                unsafe {
                    *elements.as_mut_ptr().add(4) = 0xff;
                }
                elements.release(ReleaseMode::CopyBack)
            })
            .unwrap();
        assert!(matches!(result, Err(Error::GuardedCopyCorrupted { .. })));
        assert_eq!(data, [0; 4]);
        runtime.detach_current_thread().unwrap();
    }

    #[test]
    fn read_only_chars_must_not_change() {
        let runtime = runtime(true);
        let text = b"managed".to_vec();
        runtime
            .with_state(ThreadState::Runnable, |guard| {
                let chars = get_string_utf_chars(guard, &text).unwrap();
                assert_eq!(chars.as_bytes(), b"managed");
                chars.release().unwrap();

                let mut chars = get_string_utf_chars(guard, &text).unwrap();
                unsafe {
                    *(chars.as_ptr() as *mut u8) = b'M';
                }
                assert_eq!(chars.release(), Err(Error::ModifiedReadOnlyCopy(7)));
            })
            .unwrap();
        runtime.detach_current_thread().unwrap();
    }

    #[test]
    fn needs_runnable() {
        let runtime = runtime(true);
        let mut data = [0u8; 1];
        let guard = runtime.enter_boundary(ThreadState::Native).unwrap();
        assert!(matches!(
            get_array_elements(&guard, &mut data),
            Err(Error::NotRunnable(ThreadState::Native))
        ));
        drop(guard);
        runtime.detach_current_thread().unwrap();
    }
}
