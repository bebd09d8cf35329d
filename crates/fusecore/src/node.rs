//! Logical filesystem entries.

use bitflags::bitflags;
use fusecore_kernel::FUSE_ROOT_ID;
use std::{fmt, time::SystemTime};

/// The identifier of a node, stable for the node's lifetime in a mount session.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl NodeId {
    /// The identifier of the root directory.
    pub const ROOT: Self = Self(FUSE_ROOT_ID);

    /// Create a `NodeId` from the raw value.
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Take the raw value of this identifier.
    #[inline]
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

/// The kind of a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

impl NodeKind {
    /// Extract the kind from the `S_IFMT` bits of a mode value.
    ///
    /// A mode without file type bits is treated as a regular file.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT {
            0 | libc::S_IFREG => Some(Self::File),
            libc::S_IFDIR => Some(Self::Directory),
            libc::S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    /// Return the `S_IFMT` bits of this kind.
    pub const fn type_bits(self) -> u32 {
        match self {
            Self::File => libc::S_IFREG,
            Self::Directory => libc::S_IFDIR,
            Self::Symlink => libc::S_IFLNK,
        }
    }

    /// Return the `d_type` value used in directory entries.
    pub const fn dirent_type(self) -> u32 {
        match self {
            Self::File => libc::DT_REG as u32,
            Self::Directory => libc::DT_DIR as u32,
            Self::Symlink => libc::DT_LNK as u32,
        }
    }
}

bitflags! {
    /// The access mask of `access(2)`.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const READ = libc::R_OK as u32;
        const WRITE = libc::W_OK as u32;
        const EXEC = libc::X_OK as u32;
    }
}

/// Attributes of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeAttr {
    pub id: NodeId,
    pub kind: NodeKind,
    pub size: u64,
    pub blocks: u64,
    /// Permission bits, without the file type.
    pub perm: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl NodeAttr {
    /// Create the attributes of a fresh node owned by `uid:gid`.
    pub fn new(id: NodeId, kind: NodeKind, perm: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            kind,
            size: 0,
            blocks: 0,
            perm: perm & 0o7777,
            nlink: match kind {
                NodeKind::Directory => 2,
                _ => 1,
            },
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Return the full mode value, file type included.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | (self.perm & 0o7777)
    }

    /// Check whether a caller with the given credentials is granted `mask`.
    ///
    /// The superuser is granted read and write unconditionally, and execute
    /// when any execute bit is set or the node is a directory.
    pub fn permits(&self, uid: u32, gid: u32, mask: AccessMask) -> bool {
        if uid == 0 {
            return !mask.contains(AccessMask::EXEC)
                || self.kind == NodeKind::Directory
                || self.perm & 0o111 != 0;
        }

        let bits = if uid == self.uid {
            (self.perm >> 6) & 0o7
        } else if gid == self.gid {
            (self.perm >> 3) & 0o7
        } else {
            self.perm & 0o7
        };

        AccessMask::from_bits_truncate(bits).contains(mask)
    }
}

/// A timestamp value passed to `setattr`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TimeOrNow {
    Now,
    Time(SystemTime),
}

impl TimeOrNow {
    pub(crate) fn resolve(self, now: SystemTime) -> SystemTime {
        match self {
            Self::Now => now,
            Self::Time(time) => time,
        }
    }
}

/// The set of attribute changes requested by `setattr`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
}

impl SetAttr {
    /// Return whether no attribute is requested to change.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Return whether the change touches ownership or permission bits.
    pub(crate) fn changes_owner_or_mode(&self) -> bool {
        self.mode.is_some() || self.uid.is_some() || self.gid.is_some()
    }
}
