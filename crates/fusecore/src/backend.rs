//! The capability set of the data/metadata store behind the filesystem.

use crate::node::{NodeAttr, NodeId, NodeKind, SetAttr};
use bitflags::bitflags;
use std::{
    ffi::{OsStr, OsString},
    io,
    sync::Arc,
};

/// A failure reported by a backend store.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("node not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("directory is not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("read-only store")]
    ReadOnly,

    #[error("no space left in store")]
    NoSpace,

    #[error("file too large")]
    FileTooLarge,

    #[error("invalid input")]
    InvalidInput,

    #[error("name too long")]
    NameTooLong,

    #[error("cross-device link")]
    CrossDevice,

    #[error("operation not supported by the store")]
    Unsupported,

    #[error("node is no longer available")]
    Stale,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// A child entry of a directory, as listed by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub id: NodeId,
    pub kind: NodeKind,
}

/// The description of a node to be created.
#[derive(Clone, Debug)]
pub struct NewNode {
    pub kind: NodeKind,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    /// The target of a symbolic link.
    pub target: Option<OsString>,
}

impl NewNode {
    pub fn new(kind: NodeKind, perm: u32, uid: u32, gid: u32) -> Self {
        Self {
            kind,
            perm,
            uid,
            gid,
            rdev: 0,
            target: None,
        }
    }
}

bitflags! {
    /// Flags of the `rename` operation.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RenameFlags: u32 {
        /// Fail with `AlreadyExists` instead of replacing the target.
        const NOREPLACE = fusecore_kernel::RENAME_NOREPLACE;
        /// Atomically exchange the source and the target.
        const EXCHANGE = fusecore_kernel::RENAME_EXCHANGE;
        const WHITEOUT = fusecore_kernel::RENAME_WHITEOUT;
    }
}

/// The outcome of a successful rename.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Renamed {
    /// The node that moved to the new name.
    pub moved: NodeId,
    /// The node previously bound to the new name, if it was replaced.
    pub replaced: Option<NodeId>,
}

/// Filesystem statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        }
    }
}

/// The store behind the filesystem.
///
/// Calls may block. The driver never holds its own locks while a backend
/// call is in flight, so implementations are free to take their time.
///
/// Implementations own the metadata and are responsible for timestamp
/// maintenance: every successful mutation updates the modification time of
/// the affected node (the file for writes and truncation, the parent
/// directories for namespace changes).
pub trait Backend: Send + Sync {
    /// Return the attributes of a node.
    fn stat(&self, id: NodeId) -> Result<NodeAttr>;

    /// List the children of a directory, excluding `.` and `..`.
    fn read_children(&self, id: NodeId) -> Result<Vec<DirEntry>>;

    /// Read up to `len` bytes at `offset`.
    ///
    /// Reading at or past the end of the content returns an empty buffer.
    fn read_bytes(&self, id: NodeId, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    ///
    /// A short write is legal; the caller retries the remainder.
    fn write_bytes(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize>;

    /// Create a child node under `parent`.
    fn create_child(&self, parent: NodeId, name: &OsStr, node: &NewNode) -> Result<NodeAttr>;

    /// Remove the entry `name` from `parent`, returning the unlinked node.
    ///
    /// `dir` selects the `rmdir` flavor: the entry must then be an empty
    /// directory, otherwise it must not be a directory.
    fn remove_child(&self, parent: NodeId, name: &OsStr, dir: bool) -> Result<NodeId>;

    /// Move the entry `name` of `parent` to `newname` under `newparent`.
    fn rename_child(
        &self,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        flags: RenameFlags,
    ) -> Result<Renamed>;

    /// Apply attribute changes, returning the updated attributes.
    fn set_attrs(&self, id: NodeId, attr: &SetAttr) -> Result<NodeAttr>;

    /// Resolve the entry `name` of `parent`.
    fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<NodeAttr> {
        let child = self
            .read_children(parent)?
            .into_iter()
            .find(|entry| entry.name.as_os_str() == name)
            .ok_or(BackendError::NotFound)?;
        self.stat(child.id)
    }

    /// Return the parent directory of a directory, if the store tracks it.
    fn parent(&self, _id: NodeId) -> Result<Option<NodeId>> {
        Ok(None)
    }

    /// Return the target of a symbolic link.
    fn read_link(&self, _id: NodeId) -> Result<OsString> {
        Err(BackendError::Unsupported)
    }

    /// Create a hard link to `id` named `newname` under `newparent`.
    fn link_child(&self, _id: NodeId, _newparent: NodeId, _newname: &OsStr) -> Result<NodeAttr> {
        Err(BackendError::Unsupported)
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(StatFs::default())
    }

    /// Flush the content of a node to stable storage.
    fn sync(&self, _id: NodeId, _datasync: bool) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

impl<B: ?Sized> Backend for Arc<B>
where
    B: Backend,
{
    #[inline]
    fn stat(&self, id: NodeId) -> Result<NodeAttr> {
        (**self).stat(id)
    }

    #[inline]
    fn read_children(&self, id: NodeId) -> Result<Vec<DirEntry>> {
        (**self).read_children(id)
    }

    #[inline]
    fn read_bytes(&self, id: NodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(id, offset, len)
    }

    #[inline]
    fn write_bytes(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        (**self).write_bytes(id, offset, data)
    }

    #[inline]
    fn create_child(&self, parent: NodeId, name: &OsStr, node: &NewNode) -> Result<NodeAttr> {
        (**self).create_child(parent, name, node)
    }

    #[inline]
    fn remove_child(&self, parent: NodeId, name: &OsStr, dir: bool) -> Result<NodeId> {
        (**self).remove_child(parent, name, dir)
    }

    #[inline]
    fn rename_child(
        &self,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        flags: RenameFlags,
    ) -> Result<Renamed> {
        (**self).rename_child(parent, name, newparent, newname, flags)
    }

    #[inline]
    fn set_attrs(&self, id: NodeId, attr: &SetAttr) -> Result<NodeAttr> {
        (**self).set_attrs(id, attr)
    }

    #[inline]
    fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<NodeAttr> {
        (**self).lookup(parent, name)
    }

    #[inline]
    fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        (**self).parent(id)
    }

    #[inline]
    fn read_link(&self, id: NodeId) -> Result<OsString> {
        (**self).read_link(id)
    }

    #[inline]
    fn link_child(&self, id: NodeId, newparent: NodeId, newname: &OsStr) -> Result<NodeAttr> {
        (**self).link_child(id, newparent, newname)
    }

    #[inline]
    fn statfs(&self) -> Result<StatFs> {
        (**self).statfs()
    }

    #[inline]
    fn sync(&self, id: NodeId, datasync: bool) -> Result<()> {
        (**self).sync(id, datasync)
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}
