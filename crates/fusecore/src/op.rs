//! Filesystem operations requested by the kernel.

use crate::{
    handle::Handle,
    node::{AccessMask, NodeId, SetAttr},
};
use fusecore_kernel::fuse_opcode;
use std::ffi::OsString;

/// The kind of filesystem operation requested by the kernel.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Operation {
    Lookup {
        parent: NodeId,
        name: OsString,
    },
    /// Drop `nlookup` references handed out by entry replies.
    Forget {
        node: NodeId,
        nlookup: u64,
    },
    Getattr {
        node: NodeId,
        fh: Option<Handle>,
    },
    Setattr {
        node: NodeId,
        fh: Option<Handle>,
        attr: SetAttr,
    },
    Readlink {
        node: NodeId,
    },
    Symlink {
        parent: NodeId,
        name: OsString,
        target: OsString,
    },
    Mknod {
        parent: NodeId,
        name: OsString,
        mode: u32,
        rdev: u32,
    },
    Mkdir {
        parent: NodeId,
        name: OsString,
        mode: u32,
    },
    Unlink {
        parent: NodeId,
        name: OsString,
    },
    Rmdir {
        parent: NodeId,
        name: OsString,
    },
    Rename {
        parent: NodeId,
        name: OsString,
        newparent: NodeId,
        newname: OsString,
        /// `RENAME_*` flags.
        flags: u32,
    },
    Link {
        node: NodeId,
        newparent: NodeId,
        newname: OsString,
    },
    Open {
        node: NodeId,
        /// The flags of `open(2)`.
        flags: i32,
    },
    Read {
        fh: Handle,
        offset: u64,
        size: u32,
    },
    Write {
        fh: Handle,
        offset: u64,
        data: Vec<u8>,
    },
    Flush {
        fh: Handle,
    },
    Fsync {
        fh: Handle,
        datasync: bool,
    },
    Release {
        fh: Handle,
    },
    Statfs {
        node: NodeId,
    },
    Access {
        node: NodeId,
        mask: AccessMask,
    },
    Create {
        parent: NodeId,
        name: OsString,
        mode: u32,
        flags: i32,
    },
    Opendir {
        node: NodeId,
    },
    Readdir {
        fh: Handle,
        offset: u64,
        size: u32,
    },
    Releasedir {
        fh: Handle,
    },
    Fsyncdir {
        fh: Handle,
        datasync: bool,
    },
    Destroy,
}

impl Operation {
    /// Return the protocol opcode of this operation.
    pub fn opcode(&self) -> fuse_opcode {
        match self {
            Self::Lookup { .. } => fuse_opcode::FUSE_LOOKUP,
            Self::Forget { .. } => fuse_opcode::FUSE_FORGET,
            Self::Getattr { .. } => fuse_opcode::FUSE_GETATTR,
            Self::Setattr { .. } => fuse_opcode::FUSE_SETATTR,
            Self::Readlink { .. } => fuse_opcode::FUSE_READLINK,
            Self::Symlink { .. } => fuse_opcode::FUSE_SYMLINK,
            Self::Mknod { .. } => fuse_opcode::FUSE_MKNOD,
            Self::Mkdir { .. } => fuse_opcode::FUSE_MKDIR,
            Self::Unlink { .. } => fuse_opcode::FUSE_UNLINK,
            Self::Rmdir { .. } => fuse_opcode::FUSE_RMDIR,
            Self::Rename { flags: 0, .. } => fuse_opcode::FUSE_RENAME,
            Self::Rename { .. } => fuse_opcode::FUSE_RENAME2,
            Self::Link { .. } => fuse_opcode::FUSE_LINK,
            Self::Open { .. } => fuse_opcode::FUSE_OPEN,
            Self::Read { .. } => fuse_opcode::FUSE_READ,
            Self::Write { .. } => fuse_opcode::FUSE_WRITE,
            Self::Flush { .. } => fuse_opcode::FUSE_FLUSH,
            Self::Fsync { .. } => fuse_opcode::FUSE_FSYNC,
            Self::Release { .. } => fuse_opcode::FUSE_RELEASE,
            Self::Statfs { .. } => fuse_opcode::FUSE_STATFS,
            Self::Access { .. } => fuse_opcode::FUSE_ACCESS,
            Self::Create { .. } => fuse_opcode::FUSE_CREATE,
            Self::Opendir { .. } => fuse_opcode::FUSE_OPENDIR,
            Self::Readdir { .. } => fuse_opcode::FUSE_READDIR,
            Self::Releasedir { .. } => fuse_opcode::FUSE_RELEASEDIR,
            Self::Fsyncdir { .. } => fuse_opcode::FUSE_FSYNCDIR,
            Self::Destroy => fuse_opcode::FUSE_DESTROY,
        }
    }

    /// Return whether the kernel expects no reply to this operation.
    pub fn is_oneway(&self) -> bool {
        matches!(self, Self::Forget { .. })
    }
}
