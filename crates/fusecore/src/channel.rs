//! An in-process transport.
//!
//! [`pair`] returns the two ends of a loopback connection: a [`Loopback`]
//! transport to hand to [`main`](crate::main), and a [`Client`] through
//! which operations are issued as if they came from the kernel.

use crate::{
    backend::{Backend, StatFs},
    driver::Driver,
    errno::Errno,
    handle::Handle,
    node::{NodeAttr, NodeId, SetAttr},
    op::Operation,
    reply::{DirEntryOut, OpenOut, Reply},
    request::{Interrupt, Request},
    table::OperationTable,
    transport::Transport,
    util::lock,
};
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};

enum Message {
    Request {
        unique: u64,
        uid: u32,
        gid: u32,
        op: Operation,
        interrupt: Interrupt,
        reply: mpsc::Sender<Reply>,
    },
    Unmount,
}

/// Create a connected transport and client.
pub fn pair() -> (Loopback, Client) {
    let (tx, rx) = mpsc::channel();
    let client = Client {
        tx,
        shared: Arc::new(Shared {
            next_unique: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }),
        uid: 0,
        gid: 0,
    };
    (Loopback { rx }, client)
}

/// The serving end of a loopback connection.
///
/// Every request is served on its own thread, so overlapping operations
/// run concurrently.
#[derive(Debug)]
pub struct Loopback {
    rx: mpsc::Receiver<Message>,
}

impl Transport for Loopback {
    fn run<B: Backend>(
        self,
        args: &[OsString],
        table: &OperationTable<B>,
        driver: &Arc<Driver<B>>,
    ) -> i32 {
        tracing::debug!(?args, "loopback transport started");
        let driver = &**driver;

        thread::scope(|scope| {
            for msg in self.rx.iter() {
                let (req, op, reply) = match msg {
                    Message::Unmount => {
                        tracing::debug!("unmount requested");
                        return 0;
                    }
                    Message::Request {
                        unique,
                        uid,
                        gid,
                        op,
                        interrupt,
                        reply,
                    } => {
                        let req = Request::new(unique)
                            .credentials(uid, gid, 0)
                            .with_interrupt(interrupt);
                        (req, op, reply)
                    }
                };

                scope.spawn(move || {
                    let unique = req.unique();
                    let out = table.dispatch(driver, &req, op);

                    let mut buf = Vec::new();
                    out.encode(unique, &mut buf);
                    tracing::trace!(unique, len = buf.len(), "reply encoded");

                    if reply.send(out).is_err() {
                        tracing::debug!(unique, "the caller went away before the reply");
                    }
                });
            }

            tracing::warn!("every client disconnected without unmounting");
            1
        })
    }
}

struct Shared {
    next_unique: AtomicU64,
    pending: Mutex<HashMap<u64, Interrupt>>,
}

/// The issuing end of a loopback connection.
#[derive(Clone)]
pub struct Client {
    tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    uid: u32,
    gid: u32,
}

/// An issued request waiting for its reply.
pub struct Pending {
    unique: u64,
    rx: mpsc::Receiver<Reply>,
    shared: Arc<Shared>,
}

impl Pending {
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// Signal that the caller gave up on this request.
    pub fn interrupt(&self) {
        if let Some(token) = lock(&self.shared.pending).get(&self.unique) {
            token.interrupt();
        }
    }

    /// Block until the reply arrives.
    pub fn wait(self) -> Reply {
        self.rx.recv().unwrap_or(Reply::Error(Errno::IoError))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.unique);
    }
}

macro_rules! expect_reply {
    ($reply:expr, $pat:pat => $out:expr) => {
        match $reply {
            $pat => Ok($out),
            Reply::Error(errno) => Err(errno),
            reply => {
                tracing::warn!(?reply, "unexpected reply");
                Err(Errno::IoError)
            }
        }
    };
}

impl Client {
    /// Return a client issuing requests with the given credentials.
    pub fn credentials(&self, uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            ..self.clone()
        }
    }

    /// Issue `op` without waiting for the reply.
    pub fn submit(&self, op: Operation) -> Pending {
        let unique = self.shared.next_unique.fetch_add(1, Ordering::SeqCst);
        let interrupt = Interrupt::new();
        let (reply, rx) = mpsc::channel();
        lock(&self.shared.pending).insert(unique, interrupt.clone());

        let msg = Message::Request {
            unique,
            uid: self.uid,
            gid: self.gid,
            op,
            interrupt,
            reply,
        };
        if self.tx.send(msg).is_err() {
            tracing::debug!(unique, "the transport is gone");
        }

        Pending {
            unique,
            rx,
            shared: self.shared.clone(),
        }
    }

    /// Issue `op` and wait for the reply.
    pub fn call(&self, op: Operation) -> Reply {
        self.submit(op).wait()
    }

    /// Interrupt the in-flight request `unique`.
    ///
    /// Returns `false` when no such request is pending.
    pub fn interrupt(&self, unique: u64) -> bool {
        match lock(&self.shared.pending).get(&unique) {
            Some(token) => {
                token.interrupt();
                true
            }
            None => false,
        }
    }

    /// Ask the transport to end the session cleanly.
    pub fn unmount(&self) {
        let _ = self.tx.send(Message::Unmount);
    }

    pub fn lookup(&self, parent: NodeId, name: impl AsRef<OsStr>) -> Result<NodeAttr, Errno> {
        let op = Operation::Lookup {
            parent,
            name: name.as_ref().to_owned(),
        };
        expect_reply!(self.call(op), Reply::Entry(entry) => entry.attr)
    }

    pub fn forget(&self, node: NodeId, nlookup: u64) {
        self.call(Operation::Forget { node, nlookup });
    }

    pub fn getattr(&self, node: NodeId) -> Result<NodeAttr, Errno> {
        let op = Operation::Getattr { node, fh: None };
        expect_reply!(self.call(op), Reply::Attr(out) => out.attr)
    }

    pub fn setattr(&self, node: NodeId, attr: SetAttr) -> Result<NodeAttr, Errno> {
        let op = Operation::Setattr {
            node,
            fh: None,
            attr,
        };
        expect_reply!(self.call(op), Reply::Attr(out) => out.attr)
    }

    pub fn readlink(&self, node: NodeId) -> Result<Vec<u8>, Errno> {
        expect_reply!(self.call(Operation::Readlink { node }), Reply::Data(data) => data)
    }

    pub fn symlink(
        &self,
        parent: NodeId,
        name: impl AsRef<OsStr>,
        target: impl AsRef<OsStr>,
    ) -> Result<NodeAttr, Errno> {
        let op = Operation::Symlink {
            parent,
            name: name.as_ref().to_owned(),
            target: target.as_ref().to_owned(),
        };
        expect_reply!(self.call(op), Reply::Entry(entry) => entry.attr)
    }

    pub fn mkdir(
        &self,
        parent: NodeId,
        name: impl AsRef<OsStr>,
        mode: u32,
    ) -> Result<NodeAttr, Errno> {
        let op = Operation::Mkdir {
            parent,
            name: name.as_ref().to_owned(),
            mode,
        };
        expect_reply!(self.call(op), Reply::Entry(entry) => entry.attr)
    }

    pub fn create(
        &self,
        parent: NodeId,
        name: impl AsRef<OsStr>,
        mode: u32,
        flags: i32,
    ) -> Result<(NodeAttr, Handle), Errno> {
        let op = Operation::Create {
            parent,
            name: name.as_ref().to_owned(),
            mode,
            flags,
        };
        expect_reply!(self.call(op), Reply::Create(entry, open) => (entry.attr, open.fh))
    }

    pub fn unlink(&self, parent: NodeId, name: impl AsRef<OsStr>) -> Result<(), Errno> {
        let op = Operation::Unlink {
            parent,
            name: name.as_ref().to_owned(),
        };
        expect_reply!(self.call(op), Reply::Empty => ())
    }

    pub fn rmdir(&self, parent: NodeId, name: impl AsRef<OsStr>) -> Result<(), Errno> {
        let op = Operation::Rmdir {
            parent,
            name: name.as_ref().to_owned(),
        };
        expect_reply!(self.call(op), Reply::Empty => ())
    }

    pub fn rename(
        &self,
        parent: NodeId,
        name: impl AsRef<OsStr>,
        newparent: NodeId,
        newname: impl AsRef<OsStr>,
        flags: u32,
    ) -> Result<(), Errno> {
        let op = Operation::Rename {
            parent,
            name: name.as_ref().to_owned(),
            newparent,
            newname: newname.as_ref().to_owned(),
            flags,
        };
        expect_reply!(self.call(op), Reply::Empty => ())
    }

    pub fn link(
        &self,
        node: NodeId,
        newparent: NodeId,
        newname: impl AsRef<OsStr>,
    ) -> Result<NodeAttr, Errno> {
        let op = Operation::Link {
            node,
            newparent,
            newname: newname.as_ref().to_owned(),
        };
        expect_reply!(self.call(op), Reply::Entry(entry) => entry.attr)
    }

    pub fn open(&self, node: NodeId, flags: i32) -> Result<Handle, Errno> {
        let op = Operation::Open { node, flags };
        expect_reply!(self.call(op), Reply::Open(OpenOut { fh, .. }) => fh)
    }

    pub fn read(&self, fh: Handle, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let op = Operation::Read { fh, offset, size };
        expect_reply!(self.call(op), Reply::Data(data) => data)
    }

    pub fn write(&self, fh: Handle, offset: u64, data: impl Into<Vec<u8>>) -> Result<u32, Errno> {
        let op = Operation::Write {
            fh,
            offset,
            data: data.into(),
        };
        expect_reply!(self.call(op), Reply::Write(size) => size)
    }

    pub fn release(&self, fh: Handle) -> Result<(), Errno> {
        expect_reply!(self.call(Operation::Release { fh }), Reply::Empty => ())
    }

    pub fn opendir(&self, node: NodeId) -> Result<Handle, Errno> {
        let op = Operation::Opendir { node };
        expect_reply!(self.call(op), Reply::Open(OpenOut { fh, .. }) => fh)
    }

    pub fn readdir(&self, fh: Handle, offset: u64, size: u32) -> Result<Vec<DirEntryOut>, Errno> {
        let op = Operation::Readdir { fh, offset, size };
        expect_reply!(self.call(op), Reply::Dir(entries) => entries)
    }

    /// Read the whole listing of a directory, page by page.
    pub fn list(&self, node: NodeId) -> Result<Vec<DirEntryOut>, Errno> {
        let fh = self.opendir(node)?;
        let mut entries = vec![];
        let result = loop {
            let offset = entries.last().map_or(0, |e: &DirEntryOut| e.offset);
            match self.readdir(fh, offset, 4096) {
                Ok(page) if page.is_empty() => break Ok(()),
                Ok(page) => entries.extend(page),
                Err(errno) => break Err(errno),
            }
        };
        self.releasedir(fh)?;
        result.map(|()| entries)
    }

    pub fn releasedir(&self, fh: Handle) -> Result<(), Errno> {
        expect_reply!(self.call(Operation::Releasedir { fh }), Reply::Empty => ())
    }

    pub fn statfs(&self, node: NodeId) -> Result<StatFs, Errno> {
        expect_reply!(self.call(Operation::Statfs { node }), Reply::Statfs(st) => st)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, memstore::MemStore, transport::main};

    #[test]
    fn unmount_ends_cleanly() {
        let (transport, client) = pair();
        let driver = Arc::new(Driver::new(MemStore::new(), Config::default()));
        let table = OperationTable::default();

        let status = thread::scope(|scope| {
            let server = scope.spawn(|| main(&[], &table, &driver, transport));
            let attr = client.mkdir(NodeId::ROOT, "d", 0o755).unwrap();
            assert_eq!(client.lookup(NodeId::ROOT, "d").unwrap().id, attr.id);
            client.unmount();
            server.join().unwrap()
        });
        assert_eq!(status, 0);
        assert!(driver.resolver().is_empty());
    }

    #[test]
    fn dropped_clients_end_abnormally() {
        let (transport, client) = pair();
        let driver = Arc::new(Driver::new(MemStore::new(), Config::default()));
        let table = OperationTable::default();
        drop(client);
        assert_eq!(main(&[], &table, &driver, transport), 1);
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let (transport, client) = pair();
        let driver = Arc::new(Driver::new(MemStore::new(), Config::default()));
        let table = OperationTable::default();
        client.unmount();
        assert_eq!(main(&[], &table, &driver, transport), 0);
        assert_eq!(client.getattr(NodeId::ROOT).err(), Some(Errno::IoError));
    }
}
