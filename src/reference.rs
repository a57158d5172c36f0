use std::{fmt, num::NonZeroUsize};

use crate::error::{Error, Result};

/// Kind of a reference handle. The discriminant is the tag stored in the low
/// bits of a raw handle; zero is reserved for invalid handles.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RefKind {
    Local = 1,
    Global = 2,
    WeakGlobal = 3,
}

impl RefKind {
    pub const fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            1 => Some(Self::Local),
            2 => Some(Self::Global),
            3 => Some(Self::WeakGlobal),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Global => "Global",
            Self::WeakGlobal => "WeakGlobal",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const KIND_BITS: usize = 2;
pub const KIND_MASK: usize = (1 << KIND_BITS) - 1;
pub const SERIAL_BITS: usize = 3;
pub const SERIAL_MASK: usize = (1 << SERIAL_BITS) - 1;
pub const INDEX_SHIFT: usize = KIND_BITS + SERIAL_BITS;

/// Opaque reference handed to native code.
///
/// A handle names a slot of the reference table of its kind. The serial is a
/// few bits of the slot's reuse counter, which lets the table reject a handle
/// that outlived its slot and now points at an unrelated reuse of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    kind: RefKind,
    serial: u8,
    index: u32,
}

impl Handle {
    pub const fn new(kind: RefKind, serial: u8, index: u32) -> Self {
        Self {
            kind,
            serial: serial & SERIAL_MASK as u8,
            index,
        }
    }

    pub const fn kind(&self) -> RefKind {
        self.kind
    }

    pub const fn serial(&self) -> u8 {
        self.serial
    }

    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Packs the handle into the pointer-sized value native code sees. The
    /// result is never zero.
    pub const fn into_raw(self) -> usize {
        ((self.index as usize) << INDEX_SHIFT)
            | ((self.serial as usize) << KIND_BITS)
            | self.kind as usize
    }

    /// Unpacks a raw handle. Returns `Ok(None)` for the null handle.
    pub fn from_raw(raw: usize) -> Result<Option<Self>> {
        if raw == 0 {
            return Ok(None);
        }

        let kind = RefKind::from_tag(raw & KIND_MASK).ok_or(Error::InvalidReference {
            raw,
            reason: "invalid kind tag",
        })?;
        let index = raw >> INDEX_SHIFT;
        if index > u32::MAX as usize {
            return Err(Error::InvalidReference {
                raw,
                reason: "index out of range",
            });
        }

        Ok(Some(Self::new(
            kind,
            ((raw >> KIND_BITS) & SERIAL_MASK) as u8,
            index as u32,
        )))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({})", self.into_raw(), self.kind)
    }
}

/// Direct reference to a managed object. The object model is owned by the
/// embedder; this crate only moves the address around.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::from_addr(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0.get()
    }

    pub const fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Result of resolving a handle through a [`ReferenceTable`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Resolved {
    pub kind: RefKind,
    /// The collector cleared this weak global's target.
    pub cleared: bool,
    pub target: Option<ObjectRef>,
}

/// Storage for reference slots. Resolution is a read-only operation and must
/// not allocate or block for long; implementations synchronize with the
/// collector as their own contract requires.
pub trait ReferenceTable {
    fn resolve(&self, handle: Handle) -> Result<Resolved>;
}

impl<T: ReferenceTable + ?Sized> ReferenceTable for &T {
    fn resolve(&self, handle: Handle) -> Result<Resolved> {
        (**self).resolve(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_handles_are_tagged() {
        let handle = Handle::new(RefKind::WeakGlobal, 5, 1234);
        let raw = handle.into_raw();

        assert_ne!(raw, 0);
        assert_eq!(raw & KIND_MASK, RefKind::WeakGlobal as usize);
        assert_eq!(Handle::from_raw(raw), Ok(Some(handle)));
    }

    #[test]
    fn null_and_untagged_raw_handles() {
        assert_eq!(Handle::from_raw(0), Ok(None));
        assert!(matches!(
            Handle::from_raw(0x40),
            Err(Error::InvalidReference { raw: 0x40, .. })
        ));
    }

    #[test]
    fn serial_wraps_into_its_bits() {
        let handle = Handle::new(RefKind::Local, 9, 0);
        assert_eq!(handle.serial(), 1);
    }

    #[test]
    fn object_refs_are_non_null() {
        assert!(ObjectRef::from_addr(0).is_none());
        let value = 42u64;
        let obj = ObjectRef::from_ptr(&value).unwrap();
        assert_eq!(unsafe { *obj.as_ptr::<u64>() }, 42);
    }
}
