//! A userspace filesystem driver core for the FUSE operation table.
//!
//! The crate translates FUSE requests into calls on a [`Backend`] store.
//! A [`Driver`] owns the shared state of a mount session (the handle table
//! and the name resolution cache), an [`OperationTable`] maps every protocol
//! verb onto a plain function taking that state explicitly, and a
//! [`Transport`] feeds requests into the table until the filesystem is
//! unmounted.

#![forbid(clippy::todo, clippy::unimplemented)]

mod util;

pub mod backend;
pub mod channel;
pub mod config;
pub mod driver;
pub mod encode;
pub mod errno;
pub mod handle;
pub mod memstore;
pub mod node;
pub mod op;
pub mod ops;
pub mod reply;
pub mod request;
pub mod resolver;
pub mod table;
pub mod transport;

pub use crate::{
    backend::{Backend, BackendError, DirEntry, NewNode, RenameFlags, Renamed, StatFs},
    config::Config,
    driver::Driver,
    errno::Errno,
    handle::{Handle, HandleKind, HandleTable, OpenHandle, OpenMode},
    memstore::MemStore,
    node::{AccessMask, NodeAttr, NodeId, NodeKind, SetAttr, TimeOrNow},
    op::Operation,
    reply::Reply,
    request::{Interrupt, Request},
    resolver::Resolver,
    table::OperationTable,
    transport::{main, Transport},
};
