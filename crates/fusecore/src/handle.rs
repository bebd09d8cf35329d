//! The table of open file and directory handles.

use crate::{errno::Errno, node::NodeId, reply::DirEntryOut, util::lock};
use bitflags::bitflags;
use slab::Slab;
use std::{fmt, sync::Arc, sync::Mutex};

/// An opaque identifier of an open file or directory session.
///
/// The raw value carries the slot index in the lower half and an allocation
/// generation in the upper half, so the value of a released handle is never
/// handed out again even when its slot is reused.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl Handle {
    fn new(key: usize, generation: u32) -> Self {
        debug_assert!(key < u32::MAX as usize);
        Self((u64::from(generation) << 32) | (key as u64 + 1))
    }

    /// Create a `Handle` from the raw value.
    #[inline]
    pub const fn from_raw(fh: u64) -> Self {
        Self(fh)
    }

    /// Take the raw value of this handle.
    #[inline]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    fn key(self) -> Option<usize> {
        match self.0 & 0xffff_ffff {
            0 => None,
            slot => Some(slot as usize - 1),
        }
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

bitflags! {
    /// The access mode a file handle was opened with.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct OpenMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
    }
}

impl OpenMode {
    /// Derive the access mode from the flags of `open(2)`.
    pub fn from_flags(flags: i32) -> Result<Self, Errno> {
        let mut mode = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Self::READ,
            libc::O_WRONLY => Self::WRITE,
            libc::O_RDWR => Self::READ | Self::WRITE,
            _ => return Err(Errno::InvalidArgument),
        };
        if flags & libc::O_APPEND != 0 {
            mode |= Self::APPEND;
        }
        Ok(mode)
    }
}

/// What an open handle refers to.
#[derive(Clone, Debug)]
pub enum HandleKind {
    File(OpenMode),
    /// A directory stream over the listing captured at `opendir`.
    Dir(Arc<[DirEntryOut]>),
}

/// The state behind an open handle.
#[derive(Clone, Debug)]
pub struct OpenHandle {
    pub node: NodeId,
    pub kind: HandleKind,
}

struct Slot {
    generation: u32,
    handle: OpenHandle,
}

struct Inner {
    slots: Slab<Slot>,
    generation: u32,
}

/// The table mapping handles to their open state.
pub struct HandleTable {
    inner: Mutex<Inner>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("len", &self.len())
            .finish()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Slab::new(),
                generation: 0,
            }),
        }
    }

    /// Register a new open session on `node`.
    pub fn allocate(&self, node: NodeId, kind: HandleKind) -> Handle {
        let inner = &mut *lock(&self.inner);
        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;
        let key = inner.slots.insert(Slot {
            generation,
            handle: OpenHandle { node, kind },
        });
        Handle::new(key, generation)
    }

    /// Return a copy of the state behind `fh`.
    pub fn resolve(&self, fh: Handle) -> Result<OpenHandle, Errno> {
        let inner = lock(&self.inner);
        let key = fh.key().ok_or(Errno::InvalidHandle)?;
        match inner.slots.get(key) {
            Some(slot) if slot.generation == fh.generation() => Ok(slot.handle.clone()),
            _ => Err(Errno::InvalidHandle),
        }
    }

    /// Close `fh`, returning the state it referred to.
    pub fn release(&self, fh: Handle) -> Result<OpenHandle, Errno> {
        let inner = &mut *lock(&self.inner);
        let key = fh.key().ok_or(Errno::InvalidHandle)?;
        match inner.slots.get(key) {
            Some(slot) if slot.generation == fh.generation() => {
                Ok(inner.slots.remove(key).handle)
            }
            _ => Err(Errno::InvalidHandle),
        }
    }

    /// Drop every handle that refers to `node`, returning how many were dropped.
    pub fn invalidate_node(&self, node: NodeId) -> usize {
        let inner = &mut *lock(&self.inner);
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| slot.handle.node != node);
        before - inner.slots.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.inner).slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(node: u64) -> (NodeId, HandleKind) {
        (NodeId::from_raw(node), HandleKind::File(OpenMode::READ))
    }

    #[test]
    fn resolve_after_release_fails() {
        let table = HandleTable::new();
        let (node, kind) = file(2);
        let fh = table.allocate(node, kind);
        assert_eq!(table.resolve(fh).map(|h| h.node), Ok(node));

        table.release(fh).unwrap();
        assert_eq!(table.resolve(fh).err(), Some(Errno::InvalidHandle));
    }

    #[test]
    fn double_release_keeps_table_intact() {
        let table = HandleTable::new();
        let (node, kind) = file(2);
        let a = table.allocate(node, kind.clone());
        let b = table.allocate(node, kind);

        table.release(a).unwrap();
        assert_eq!(table.release(a).err(), Some(Errno::InvalidHandle));
        assert_eq!(table.len(), 1);
        assert!(table.resolve(b).is_ok());
    }

    #[test]
    fn reused_slot_gets_fresh_value() {
        let table = HandleTable::new();
        let (node, kind) = file(2);
        let old = table.allocate(node, kind.clone());
        table.release(old).unwrap();

        let new = table.allocate(node, kind);
        assert_eq!(old.key(), new.key());
        assert_ne!(old, new);
        assert!(table.resolve(old).is_err());
        assert!(table.resolve(new).is_ok());
    }

    #[test]
    fn bogus_values_are_rejected() {
        let table = HandleTable::new();
        assert!(table.resolve(Handle::from_raw(0)).is_err());
        assert!(table.resolve(Handle::from_raw(42)).is_err());
        assert!(table.release(Handle::from_raw(u64::MAX)).is_err());
    }

    #[test]
    fn invalidate_by_node() {
        let table = HandleTable::new();
        let a = table.allocate(NodeId::from_raw(2), HandleKind::File(OpenMode::READ));
        let b = table.allocate(NodeId::from_raw(2), HandleKind::File(OpenMode::WRITE));
        let c = table.allocate(NodeId::from_raw(3), HandleKind::File(OpenMode::READ));

        assert_eq!(table.invalidate_node(NodeId::from_raw(2)), 2);
        assert!(table.resolve(a).is_err());
        assert!(table.resolve(b).is_err());
        assert!(table.resolve(c).is_ok());
    }

    #[test]
    fn open_mode_from_flags() {
        assert_eq!(OpenMode::from_flags(libc::O_RDONLY), Ok(OpenMode::READ));
        assert_eq!(
            OpenMode::from_flags(libc::O_RDWR | libc::O_APPEND),
            Ok(OpenMode::READ | OpenMode::WRITE | OpenMode::APPEND)
        );
        assert_eq!(
            OpenMode::from_flags(libc::O_ACCMODE),
            Err(Errno::InvalidArgument)
        );
    }
}
