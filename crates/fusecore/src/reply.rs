//! Replies to the kernel.

use crate::{
    backend::StatFs,
    errno::Errno,
    handle::Handle,
    node::{NodeAttr, NodeId, NodeKind},
};
use std::{ffi::OsString, time::Duration};

/// The reply of operations that bind a name to a node.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryOut {
    pub attr: NodeAttr,
    /// Distinguishes the node from a past one that reused its identifier.
    pub generation: u64,
    /// The validity timeout of the name.
    pub entry_ttl: Duration,
    /// The validity timeout of the attributes.
    pub attr_ttl: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttrOut {
    pub attr: NodeAttr,
    pub ttl: Duration,
}

/// The reply of `open`, `opendir` and `create`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpenOut {
    pub fh: Handle,
    /// `FOPEN_*` flags.
    pub flags: u32,
}

/// A directory entry returned by `readdir`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryOut {
    pub name: OsString,
    pub id: NodeId,
    pub kind: NodeKind,
    /// The cookie to pass as `offset` to continue after this entry.
    pub offset: u64,
}

/// The reply of an operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Success without payload.
    Empty,
    /// The request does not take a reply (`forget`).
    None,
    Entry(EntryOut),
    Attr(AttrOut),
    Data(Vec<u8>),
    Open(OpenOut),
    Create(EntryOut, OpenOut),
    Write(u32),
    Dir(Vec<DirEntryOut>),
    Statfs(StatFs),
    Error(Errno),
}

impl Reply {
    /// Return the failure carried by this reply, if any.
    pub fn error(&self) -> Option<Errno> {
        match *self {
            Self::Error(errno) => Some(errno),
            _ => None,
        }
    }
}

impl From<Errno> for Reply {
    fn from(errno: Errno) -> Self {
        Self::Error(errno)
    }
}
