use std::{fmt, marker::PhantomData};

use crate::{
    error::{jni_abort, Error, Result},
    guard::ThreadStateGuard,
    reference::{Handle, ObjectRef, RefKind, ReferenceTable},
};

/// A decoded reference. It borrows the guard it was decoded under, so it
/// cannot outlive the Runnable scope that makes it valid, and it cannot be
/// held across a call that leaves Runnable (those need the guard mutably).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Decoded<'g> {
    object: ObjectRef,
    kind: RefKind,
    scope: PhantomData<&'g ()>,
}

impl<'g> Decoded<'g> {
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn as_ptr<T>(&self) -> *mut T {
        self.object.as_ptr()
    }
}

impl fmt::Debug for Decoded<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decoded({} {})", self.kind, self.object)
    }
}

/// Turns handles received from native code into direct references.
///
/// Decoding only reads the table: it does not allocate, block or pass a
/// checkpoint.
pub struct ReferenceDecoder<'t, R: ReferenceTable + ?Sized> {
    table: &'t R,
    check_jni: bool,
}

impl<'t, R: ReferenceTable + ?Sized> ReferenceDecoder<'t, R> {
    pub fn new(table: &'t R) -> Self {
        Self {
            table,
            check_jni: false,
        }
    }

    /// With check-JNI on, errors other than null and cleared weak references
    /// abort the call-in instead of being returned.
    pub fn with_check_jni(mut self, check_jni: bool) -> Self {
        self.check_jni = check_jni;
        self
    }

    pub fn decode<'g>(
        &self,
        guard: &'g ThreadStateGuard<'_>,
        handle: Handle,
    ) -> Result<Decoded<'g>> {
        self.decode_inner(guard, handle).map_err(|err| self.report(err))
    }

    /// Decodes a raw handle value. Zero is the null reference.
    pub fn decode_raw<'g>(
        &self,
        guard: &'g ThreadStateGuard<'_>,
        raw: usize,
    ) -> Result<Decoded<'g>> {
        let result = guard.ensure_runnable().and_then(|_| Handle::from_raw(raw));
        match result {
            Ok(Some(handle)) => self.decode(guard, handle),
            Ok(None) => Err(Error::NullReference),
            Err(err) => Err(self.report(err)),
        }
    }

    fn decode_inner<'g>(
        &self,
        guard: &'g ThreadStateGuard<'_>,
        handle: Handle,
    ) -> Result<Decoded<'g>> {
        guard.ensure_runnable()?;

        let resolved = self.table.resolve(handle)?;
        if resolved.kind != handle.kind() {
            return Err(Error::InvalidReference {
                raw: handle.into_raw(),
                reason: "reference kind does not match its table",
            });
        }

        if resolved.kind == RefKind::WeakGlobal && resolved.cleared {
            return Err(Error::ClearedWeakReference(handle));
        }

        match resolved.target {
            Some(object) => Ok(Decoded {
                object,
                kind: resolved.kind,
                scope: PhantomData,
            }),
            None => Err(Error::NullReference),
        }
    }

    fn report(&self, err: Error) -> Error {
        if self.check_jni && err.is_fatal() {
            jni_abort("DecodeJObject", &err);
        }

        err
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        config::Config, reference::Resolved, runtime::Runtime, state::ThreadState,
    };

    /// Table backed by a map, with whatever contents a test wants.
    #[derive(Default)]
    struct MapTable {
        entries: HashMap<Handle, Resolved>,
    }

    impl MapTable {
        fn insert(&mut self, handle: Handle, cleared: bool, target: Option<usize>) {
            self.entries.insert(
                handle,
                Resolved {
                    kind: handle.kind(),
                    cleared,
                    target: target.and_then(ObjectRef::from_addr),
                },
            );
        }
    }

    impl ReferenceTable for MapTable {
        fn resolve(&self, handle: Handle) -> Result<Resolved> {
            self.entries
                .get(&handle)
                .copied()
                .ok_or(Error::InvalidReference {
                    raw: handle.into_raw(),
                    reason: "unknown handle",
                })
        }
    }

    fn with_runnable<R>(f: impl FnOnce(&ThreadStateGuard<'_>) -> R) -> R {
        let runtime = Runtime::new(Config::default().with_check_jni(false));
        runtime.attach_current_thread(None).unwrap();
        let result = runtime.with_state(ThreadState::Runnable, |guard| f(guard)).unwrap();
        runtime.detach_current_thread().unwrap();
        result
    }

    #[test]
    fn live_targets_decode() {
        let local = Handle::new(RefKind::Local, 1, 0);
        let global = Handle::new(RefKind::Global, 2, 7);
        let mut table = MapTable::default();
        table.insert(local, false, Some(0x1000));
        table.insert(global, false, Some(0x2000));

        with_runnable(|guard| {
            let decoder = ReferenceDecoder::new(&table);
            let decoded = decoder.decode(guard, local).unwrap();
            assert_eq!(decoded.object().addr(), 0x1000);
            assert_eq!(decoded.kind(), RefKind::Local);
            assert_eq!(decoder.decode(guard, global).unwrap().object().addr(), 0x2000);
        });
    }

    #[test]
    fn null_targets_fail() {
        let global = Handle::new(RefKind::Global, 0, 1);
        let mut table = MapTable::default();
        table.insert(global, false, None);

        with_runnable(|guard| {
            let decoder = ReferenceDecoder::new(&table);
            assert_eq!(decoder.decode(guard, global), Err(Error::NullReference));
            assert_eq!(decoder.decode_raw(guard, 0), Err(Error::NullReference));
        });
    }

    #[test]
    fn cleared_weak_global_fails_every_time() {
        let weak = Handle::new(RefKind::WeakGlobal, 3, 4);
        let mut table = MapTable::default();
        // a stale target is still reported, decode must not return it
        table.entries.insert(
            weak,
            Resolved {
                kind: RefKind::WeakGlobal,
                cleared: true,
                target: ObjectRef::from_addr(0xdead0),
            },
        );

        with_runnable(|guard| {
            let decoder = ReferenceDecoder::new(&table);
            for _ in 0..3 {
                assert_eq!(
                    decoder.decode(guard, weak),
                    Err(Error::ClearedWeakReference(weak))
                );
            }
            assert_eq!(
                decoder.decode_raw(guard, weak.into_raw()),
                Err(Error::ClearedWeakReference(weak))
            );
        });
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let handle = Handle::new(RefKind::Global, 0, 0);
        let mut table = MapTable::default();
        table.entries.insert(
            handle,
            Resolved {
                kind: RefKind::Local,
                cleared: false,
                target: ObjectRef::from_addr(0x10),
            },
        );

        with_runnable(|guard| {
            assert!(matches!(
                ReferenceDecoder::new(&table).decode(guard, handle),
                Err(Error::InvalidReference { .. })
            ));
        });
    }

    #[test]
    fn decode_requires_runnable() {
        let local = Handle::new(RefKind::Local, 0, 0);
        let mut table = MapTable::default();
        table.insert(local, false, Some(0x1000));

        let runtime = Runtime::new(Config::default());
        runtime.attach_current_thread(None).unwrap();
        {
            let guard = runtime.enter_boundary(ThreadState::Native).unwrap();
            let decoder = ReferenceDecoder::new(&table);
            assert_eq!(
                decoder.decode(&guard, local),
                Err(Error::NotRunnable(ThreadState::Native))
            );
            assert_eq!(
                decoder.decode_raw(&guard, 0),
                Err(Error::NotRunnable(ThreadState::Native))
            );
        }
        runtime.detach_current_thread().unwrap();
    }

    #[test]
    #[should_panic(expected = "JNI DETECTED ERROR IN APPLICATION")]
    fn check_jni_aborts_on_invalid_reference() {
        let table = MapTable::default();
        with_runnable(|guard| {
            let decoder = ReferenceDecoder::new(&table).with_check_jni(true);
            let _ = decoder.decode(guard, Handle::new(RefKind::Local, 0, 9));
        });
    }

    #[test]
    fn check_jni_still_returns_recoverable_errors() {
        let weak = Handle::new(RefKind::WeakGlobal, 0, 0);
        let mut table = MapTable::default();
        table.insert(weak, true, None);

        with_runnable(|guard| {
            let decoder = ReferenceDecoder::new(&table).with_check_jni(true);
            assert_eq!(
                decoder.decode(guard, weak),
                Err(Error::ClearedWeakReference(weak))
            );
        });
    }
}
