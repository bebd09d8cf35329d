//! The operation table: one function pointer per protocol verb.

use crate::{
    backend::{Backend, StatFs},
    driver::Driver,
    errno::Errno,
    handle::Handle,
    node::{AccessMask, NodeId, SetAttr},
    op::Operation,
    ops,
    reply::{AttrOut, DirEntryOut, EntryOut, OpenOut, Reply},
    request::Request,
};
use fusecore_kernel::fuse_opcode;
use std::{
    any::Any,
    ffi::OsStr,
    fmt,
    panic::{self, AssertUnwindSafe},
};

macro_rules! define_table {
    ($(
        $(#[$m:meta])*
        $name:ident: $Alias:ident ($($arg:ty),*) -> $ret:ty => $($OPCODE:ident)|+;
    )*) => {
        $(
            $(#[$m])*
            pub type $Alias<B> = fn(&Driver<B>, &Request, $($arg),*) -> Result<$ret, Errno>;
        )*

        /// The set of functions that serve each protocol verb.
        ///
        /// A verb without a function is answered with `ENOSYS`.
        pub struct OperationTable<B> {
            $( $name: Option<$Alias<B>>, )*
        }

        impl<B> Clone for OperationTable<B> {
            fn clone(&self) -> Self {
                Self {
                    $( $name: self.$name, )*
                }
            }
        }

        impl<B> fmt::Debug for OperationTable<B> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                $(
                    if self.$name.is_some() {
                        set.entry(&stringify!($name));
                    }
                )*
                set.finish()
            }
        }

        impl<B> OperationTable<B> {
            /// Create a table serving no verb at all.
            pub fn empty() -> Self {
                Self {
                    $( $name: None, )*
                }
            }

            /// Return whether a function serves `opcode`.
            pub fn is_set(&self, opcode: fuse_opcode) -> bool {
                match opcode {
                    $( $(fuse_opcode::$OPCODE)|+ => self.$name.is_some(), )*
                    _ => false,
                }
            }

            fn unset(&mut self, opcode: fuse_opcode) {
                match opcode {
                    $( $(fuse_opcode::$OPCODE)|+ => self.$name = None, )*
                    _ => (),
                }
            }
        }

        impl<B: Backend> OperationTable<B> {
            fn defaults() -> Self {
                Self {
                    $( $name: Some(ops::$name as $Alias<B>), )*
                }
            }
        }

        impl<B: Backend> Builder<B> {
            $(
                #[doc = concat!("Serve `", stringify!($name), "` with `f`.")]
                pub fn $name(mut self, f: $Alias<B>) -> Self {
                    self.table.$name = Some(f);
                    self
                }
            )*
        }
    };
}

define_table! {
    lookup: Lookup(NodeId, &OsStr) -> EntryOut => FUSE_LOOKUP;
    forget: Forget(NodeId, u64) -> () => FUSE_FORGET;
    getattr: Getattr(NodeId, Option<Handle>) -> AttrOut => FUSE_GETATTR;
    setattr: Setattr(NodeId, Option<Handle>, &SetAttr) -> AttrOut => FUSE_SETATTR;
    readlink: Readlink(NodeId) -> Vec<u8> => FUSE_READLINK;
    symlink: Symlink(NodeId, &OsStr, &OsStr) -> EntryOut => FUSE_SYMLINK;
    mknod: Mknod(NodeId, &OsStr, u32, u32) -> EntryOut => FUSE_MKNOD;
    mkdir: Mkdir(NodeId, &OsStr, u32) -> EntryOut => FUSE_MKDIR;
    unlink: Unlink(NodeId, &OsStr) -> () => FUSE_UNLINK;
    rmdir: Rmdir(NodeId, &OsStr) -> () => FUSE_RMDIR;
    rename: Rename(NodeId, &OsStr, NodeId, &OsStr, u32) -> () => FUSE_RENAME | FUSE_RENAME2;
    link: Link(NodeId, NodeId, &OsStr) -> EntryOut => FUSE_LINK;
    open: Open(NodeId, i32) -> OpenOut => FUSE_OPEN;
    read: Read(Handle, u64, u32) -> Vec<u8> => FUSE_READ;
    write: Write(Handle, u64, &[u8]) -> u32 => FUSE_WRITE;
    flush: Flush(Handle) -> () => FUSE_FLUSH;
    fsync: Fsync(Handle, bool) -> () => FUSE_FSYNC;
    release: Release(Handle) -> () => FUSE_RELEASE;
    statfs: Statfs(NodeId) -> StatFs => FUSE_STATFS;
    access: Access(NodeId, AccessMask) -> () => FUSE_ACCESS;
    create: Create(NodeId, &OsStr, u32, i32) -> (EntryOut, OpenOut) => FUSE_CREATE;
    opendir: Opendir(NodeId) -> OpenOut => FUSE_OPENDIR;
    readdir: Readdir(Handle, u64, u32) -> Vec<DirEntryOut> => FUSE_READDIR;
    releasedir: Releasedir(Handle) -> () => FUSE_RELEASEDIR;
    fsyncdir: Fsyncdir(Handle, bool) -> () => FUSE_FSYNCDIR;
    destroy: Destroy() -> () => FUSE_DESTROY;
}

/// A builder of [`OperationTable`], starting from the default functions.
pub struct Builder<B> {
    table: OperationTable<B>,
}

impl<B: Backend> Builder<B> {
    /// Stop serving `opcode`; requests of that verb get `ENOSYS`.
    pub fn disable(mut self, opcode: fuse_opcode) -> Self {
        self.table.unset(opcode);
        self
    }

    pub fn build(self) -> OperationTable<B> {
        self.table
    }
}

impl<B: Backend> Default for OperationTable<B> {
    fn default() -> Self {
        Self::defaults()
    }
}

macro_rules! call {
    ($slot:expr, |$f:ident| $body:expr) => {
        match $slot {
            Some($f) => $body,
            None => Err(Errno::NotSupported),
        }
    };
}

impl<B: Backend> OperationTable<B> {
    /// Start building a table from the default functions.
    pub fn builder() -> Builder<B> {
        Builder {
            table: Self::defaults(),
        }
    }

    /// Serve a single request.
    ///
    /// Failures, panics included, are turned into an error reply.
    pub fn dispatch(&self, driver: &Driver<B>, req: &Request, op: Operation) -> Reply {
        let span = tracing::debug_span!("handle_request", unique = req.unique());
        let _enter = span.enter();

        tracing::debug!(?op);
        let oneway = op.is_oneway();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.call(driver, req, op)))
            .unwrap_or_else(|payload| {
                tracing::error!(panic = panic_message(&*payload), "operation panicked");
                Err(Errno::IoError)
            });

        match result {
            Ok(..) | Err(..) if oneway => Reply::None,
            Ok(reply) => reply,
            Err(errno) => {
                tracing::debug!(errno = errno.code(), "{}", errno);
                Reply::Error(errno)
            }
        }
    }

    fn call(&self, driver: &Driver<B>, req: &Request, op: Operation) -> Result<Reply, Errno> {
        match op {
            Operation::Lookup { parent, name } => {
                call!(self.lookup, |f| f(driver, req, parent, &name).map(Reply::Entry))
            }
            Operation::Forget { node, nlookup } => {
                call!(self.forget, |f| f(driver, req, node, nlookup).map(|()| Reply::None))
            }
            Operation::Getattr { node, fh } => {
                call!(self.getattr, |f| f(driver, req, node, fh).map(Reply::Attr))
            }
            Operation::Setattr { node, fh, attr } => {
                call!(self.setattr, |f| f(driver, req, node, fh, &attr).map(Reply::Attr))
            }
            Operation::Readlink { node } => {
                call!(self.readlink, |f| f(driver, req, node).map(Reply::Data))
            }
            Operation::Symlink {
                parent,
                name,
                target,
            } => call!(self.symlink, |f| f(driver, req, parent, &name, &target)
                .map(Reply::Entry)),
            Operation::Mknod {
                parent,
                name,
                mode,
                rdev,
            } => call!(self.mknod, |f| f(driver, req, parent, &name, mode, rdev)
                .map(Reply::Entry)),
            Operation::Mkdir { parent, name, mode } => {
                call!(self.mkdir, |f| f(driver, req, parent, &name, mode).map(Reply::Entry))
            }
            Operation::Unlink { parent, name } => {
                call!(self.unlink, |f| f(driver, req, parent, &name).map(|()| Reply::Empty))
            }
            Operation::Rmdir { parent, name } => {
                call!(self.rmdir, |f| f(driver, req, parent, &name).map(|()| Reply::Empty))
            }
            Operation::Rename {
                parent,
                name,
                newparent,
                newname,
                flags,
            } => call!(self.rename, |f| f(
                driver, req, parent, &name, newparent, &newname, flags
            )
            .map(|()| Reply::Empty)),
            Operation::Link {
                node,
                newparent,
                newname,
            } => call!(self.link, |f| f(driver, req, node, newparent, &newname)
                .map(Reply::Entry)),
            Operation::Open { node, flags } => {
                call!(self.open, |f| f(driver, req, node, flags).map(Reply::Open))
            }
            Operation::Read { fh, offset, size } => {
                call!(self.read, |f| f(driver, req, fh, offset, size).map(Reply::Data))
            }
            Operation::Write { fh, offset, data } => {
                call!(self.write, |f| f(driver, req, fh, offset, &data).map(Reply::Write))
            }
            Operation::Flush { fh } => {
                call!(self.flush, |f| f(driver, req, fh).map(|()| Reply::Empty))
            }
            Operation::Fsync { fh, datasync } => {
                call!(self.fsync, |f| f(driver, req, fh, datasync).map(|()| Reply::Empty))
            }
            Operation::Release { fh } => {
                call!(self.release, |f| f(driver, req, fh).map(|()| Reply::Empty))
            }
            Operation::Statfs { node } => {
                call!(self.statfs, |f| f(driver, req, node).map(Reply::Statfs))
            }
            Operation::Access { node, mask } => {
                call!(self.access, |f| f(driver, req, node, mask).map(|()| Reply::Empty))
            }
            Operation::Create {
                parent,
                name,
                mode,
                flags,
            } => call!(self.create, |f| f(driver, req, parent, &name, mode, flags)
                .map(|(entry, open)| Reply::Create(entry, open))),
            Operation::Opendir { node } => {
                call!(self.opendir, |f| f(driver, req, node).map(Reply::Open))
            }
            Operation::Readdir { fh, offset, size } => {
                call!(self.readdir, |f| f(driver, req, fh, offset, size).map(Reply::Dir))
            }
            Operation::Releasedir { fh } => {
                call!(self.releasedir, |f| f(driver, req, fh).map(|()| Reply::Empty))
            }
            Operation::Fsyncdir { fh, datasync } => {
                call!(self.fsyncdir, |f| f(driver, req, fh, datasync).map(|()| Reply::Empty))
            }
            Operation::Destroy => {
                call!(self.destroy, |f| f(driver, req).map(|()| Reply::Empty))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<unknown>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, memstore::MemStore};
    use std::ffi::OsString;

    fn driver() -> Driver<MemStore> {
        Driver::new(MemStore::new(), Config::default())
    }

    #[test]
    fn unset_verb_replies_enosys() {
        let table = OperationTable::<MemStore>::builder()
            .disable(fuse_opcode::FUSE_MKDIR)
            .build();
        assert!(!table.is_set(fuse_opcode::FUSE_MKDIR));
        assert!(table.is_set(fuse_opcode::FUSE_LOOKUP));
        assert!(table.is_set(fuse_opcode::FUSE_RENAME2));

        let reply = table.dispatch(
            &driver(),
            &Request::new(1),
            Operation::Mkdir {
                parent: NodeId::ROOT,
                name: "d".into(),
                mode: 0o755,
            },
        );
        assert_eq!(reply, Reply::Error(Errno::NotSupported));
    }

    #[test]
    fn empty_table() {
        let table = OperationTable::<MemStore>::empty();
        let reply = table.dispatch(
            &driver(),
            &Request::new(1),
            Operation::Statfs { node: NodeId::ROOT },
        );
        assert_eq!(reply.error(), Some(Errno::NotSupported));
    }

    #[test]
    fn override_entry() {
        fn deny(
            _: &Driver<MemStore>,
            _: &Request,
            _: NodeId,
            _: &OsStr,
        ) -> Result<EntryOut, Errno> {
            Err(Errno::PermissionDenied)
        }
        let table = OperationTable::<MemStore>::builder().lookup(deny).build();
        let reply = table.dispatch(
            &driver(),
            &Request::new(1),
            Operation::Lookup {
                parent: NodeId::ROOT,
                name: OsString::from("x"),
            },
        );
        assert_eq!(reply.error(), Some(Errno::PermissionDenied));
    }

    #[test]
    fn panics_become_eio() {
        fn boom(_: &Driver<MemStore>, _: &Request, _: NodeId) -> Result<StatFs, Errno> {
            panic!("boom")
        }
        let table = OperationTable::<MemStore>::builder().statfs(boom).build();
        let reply = table.dispatch(
            &driver(),
            &Request::new(1),
            Operation::Statfs { node: NodeId::ROOT },
        );
        assert_eq!(reply.error(), Some(Errno::IoError));
    }

    #[test]
    fn forget_has_no_reply() {
        let table = OperationTable::<MemStore>::default();
        let reply = table.dispatch(
            &driver(),
            &Request::new(1),
            Operation::Forget {
                node: NodeId::from_raw(42),
                nlookup: 1,
            },
        );
        assert_eq!(reply, Reply::None);
    }
}
