//! An in-memory backend store.

use crate::{
    backend::{Backend, BackendError, DirEntry, NewNode, RenameFlags, Renamed, Result, StatFs},
    node::{NodeAttr, NodeId, NodeKind, SetAttr},
    util::lock,
};
use dashmap::DashMap;
use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, SystemTime},
};

const BLOCK_SIZE: u64 = 512;

/// The default upper bound of a single file's size (1 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

struct INode {
    attr: NodeAttr,
    kind: INodeKind,
}

enum INodeKind {
    RegularFile(Vec<u8>),
    Directory(Directory),
    Symlink(OsString),
}

struct Directory {
    children: BTreeMap<OsString, NodeId>,
    parent: NodeId,
}

/// A backend keeping the whole tree in memory.
///
/// Namespace mutations (create, remove, rename, link) are serialized by a
/// single lock; data and attribute operations only touch the entry of the
/// node they target.
pub struct MemStore {
    nodes: DashMap<NodeId, INode>,
    namespace: Mutex<()>,
    next_id: AtomicU64,
    used: AtomicU64,
    capacity: Option<u64>,
    max_file_size: u64,
    read_only: bool,
    latency: Option<Duration>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Create a store containing an empty root directory owned by root.
    pub fn new() -> Self {
        Self::with_root_owner(0, 0)
    }

    /// Create a store whose root directory is owned by `uid:gid`.
    pub fn with_root_owner(uid: u32, gid: u32) -> Self {
        let nodes = DashMap::new();
        nodes.insert(
            NodeId::ROOT,
            INode {
                attr: NodeAttr::new(NodeId::ROOT, NodeKind::Directory, 0o755, uid, gid),
                kind: INodeKind::Directory(Directory {
                    children: BTreeMap::new(),
                    parent: NodeId::ROOT,
                }),
            },
        );
        Self {
            nodes,
            namespace: Mutex::new(()),
            next_id: AtomicU64::new(NodeId::ROOT.into_raw() + 1),
            used: AtomicU64::new(0),
            capacity: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            read_only: false,
            latency: None,
        }
    }

    /// Limit the total size of file contents to `bytes`.
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Limit the size of a single file to `bytes`.
    ///
    /// Writes and truncations reaching past it fail with `FileTooLarge`.
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Reject every mutation with `ReadOnly`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Delay every call by `latency`, to mimic a remote store.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Return the number of live nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn delay(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        Ok(())
    }

    /// Check that a file may grow to `len` bytes, and make room for it.
    fn ensure_room(&self, content: &mut Vec<u8>, len: u64) -> Result<usize> {
        if len > self.max_file_size {
            return Err(BackendError::FileTooLarge);
        }
        let len = usize::try_from(len).map_err(|_| BackendError::FileTooLarge)?;
        if let Some(additional) = len.checked_sub(content.len()) {
            content
                .try_reserve(additional)
                .map_err(|_| BackendError::NoSpace)?;
        }
        Ok(len)
    }

    /// Reserve `bytes` of content space, returning how much was granted.
    fn reserve(&self, bytes: u64) -> u64 {
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => {
                self.used.fetch_add(bytes, Ordering::SeqCst);
                return bytes;
            }
        };
        let mut granted = 0;
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                granted = bytes.min(capacity.saturating_sub(used));
                Some(used + granted)
            });
        granted
    }

    fn unreserve(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Return the child bound to `name` in the directory `parent`.
    fn child_of(&self, parent: NodeId, name: &OsStr) -> Result<Option<NodeId>> {
        let parent = self.nodes.get(&parent).ok_or(BackendError::NotFound)?;
        match parent.kind {
            INodeKind::Directory(ref dir) => Ok(dir.children.get(name).copied()),
            _ => Err(BackendError::NotADirectory),
        }
    }

    fn kind_of(&self, id: NodeId) -> Result<NodeKind> {
        self.nodes
            .get(&id)
            .map(|inode| inode.attr.kind)
            .ok_or(BackendError::NotFound)
    }

    fn is_empty_dir(&self, id: NodeId) -> bool {
        match self.nodes.get(&id) {
            Some(inode) => match inode.kind {
                INodeKind::Directory(ref dir) => dir.children.is_empty(),
                _ => false,
            },
            None => true,
        }
    }

    /// Return whether `ancestor` is `id` or one of its ancestors.
    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            let parent = match self.nodes.get(&id) {
                Some(inode) => match inode.kind {
                    INodeKind::Directory(ref dir) => dir.parent,
                    _ => return false,
                },
                None => return false,
            };
            if parent == id {
                return false;
            }
            id = parent;
        }
    }

    /// Run `f` on the directory entry of `id` and touch its timestamps.
    fn update_dir<T>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut Directory, &mut NodeAttr) -> T,
    ) -> Result<T> {
        let mut inode = self.nodes.get_mut(&id).ok_or(BackendError::NotFound)?;
        let INode { attr, kind } = &mut *inode;
        match kind {
            INodeKind::Directory(dir) => {
                let ret = f(dir, attr);
                let now = SystemTime::now();
                attr.mtime = now;
                attr.ctime = now;
                Ok(ret)
            }
            _ => Err(BackendError::NotADirectory),
        }
    }

    /// Drop one link of `id`, destroying the node when none remains.
    fn drop_link(&self, id: NodeId) {
        let destroyed = match self.nodes.get_mut(&id) {
            Some(mut inode) => {
                if inode.attr.kind == NodeKind::Directory {
                    inode.attr.nlink = 0;
                } else {
                    inode.attr.nlink = inode.attr.nlink.saturating_sub(1);
                }
                inode.attr.ctime = SystemTime::now();
                inode.attr.nlink == 0
            }
            None => false,
        };
        if destroyed {
            if let Some((_, inode)) = self.nodes.remove(&id) {
                if let INodeKind::RegularFile(content) = inode.kind {
                    self.unreserve(content.len() as u64);
                }
            }
        }
    }
}

fn blocks(size: u64) -> u64 {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE
}

impl Backend for MemStore {
    fn stat(&self, id: NodeId) -> Result<NodeAttr> {
        self.delay();
        self.nodes
            .get(&id)
            .map(|inode| inode.attr.clone())
            .ok_or(BackendError::NotFound)
    }

    fn read_children(&self, id: NodeId) -> Result<Vec<DirEntry>> {
        self.delay();
        let _guard = lock(&self.namespace);

        let children: Vec<(OsString, NodeId)> = {
            let inode = self.nodes.get(&id).ok_or(BackendError::NotFound)?;
            match inode.kind {
                INodeKind::Directory(ref dir) => dir
                    .children
                    .iter()
                    .map(|(name, &id)| (name.clone(), id))
                    .collect(),
                _ => return Err(BackendError::NotADirectory),
            }
        };

        children
            .into_iter()
            .map(|(name, id)| {
                Ok(DirEntry {
                    name,
                    id,
                    kind: self.kind_of(id)?,
                })
            })
            .collect()
    }

    fn read_bytes(&self, id: NodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.delay();
        let inode = self.nodes.get(&id).ok_or(BackendError::Stale)?;
        let content = match inode.kind {
            INodeKind::RegularFile(ref content) => content,
            INodeKind::Directory(..) => return Err(BackendError::IsADirectory),
            INodeKind::Symlink(..) => return Err(BackendError::InvalidInput),
        };

        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let content = content.get(offset..).unwrap_or(&[]);
        Ok(content[..content.len().min(len)].to_vec())
    }

    fn write_bytes(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        self.delay();
        self.ensure_writable()?;

        let mut inode = self.nodes.get_mut(&id).ok_or(BackendError::Stale)?;
        let INode { attr, kind } = &mut *inode;
        let content = match kind {
            INodeKind::RegularFile(content) => content,
            INodeKind::Directory(..) => return Err(BackendError::IsADirectory),
            INodeKind::Symlink(..) => return Err(BackendError::InvalidInput),
        };

        if data.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(BackendError::FileTooLarge)?;
        let end = self.ensure_room(content, end)?;
        let offset = end - data.len();

        let mut data = data;
        if end > content.len() {
            let wanted = (end - content.len()) as u64;
            let granted = self.reserve(wanted) as usize;
            if granted < wanted as usize {
                let short = wanted as usize - granted;
                if short >= data.len() {
                    self.unreserve(granted as u64);
                    return Err(BackendError::NoSpace);
                }
                data = &data[..data.len() - short];
            }
            content.resize(offset + data.len(), 0);
        }

        content[offset..offset + data.len()].copy_from_slice(data);

        let now = SystemTime::now();
        attr.size = content.len() as u64;
        attr.blocks = blocks(attr.size);
        attr.mtime = now;
        attr.ctime = now;

        Ok(data.len())
    }

    fn create_child(&self, parent: NodeId, name: &OsStr, node: &NewNode) -> Result<NodeAttr> {
        self.delay();
        self.ensure_writable()?;
        let _guard = lock(&self.namespace);

        if self.child_of(parent, name)?.is_some() {
            return Err(BackendError::AlreadyExists);
        }

        let id = NodeId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut attr = NodeAttr::new(id, node.kind, node.perm, node.uid, node.gid);
        attr.rdev = node.rdev;
        let kind = match node.kind {
            NodeKind::File => INodeKind::RegularFile(vec![]),
            NodeKind::Directory => INodeKind::Directory(Directory {
                children: BTreeMap::new(),
                parent,
            }),
            NodeKind::Symlink => {
                let target = node.target.clone().ok_or(BackendError::InvalidInput)?;
                attr.size = target.len() as u64;
                INodeKind::Symlink(target)
            }
        };

        self.nodes.insert(id, INode {
            attr: attr.clone(),
            kind,
        });
        self.update_dir(parent, |dir, parent_attr| {
            dir.children.insert(name.to_owned(), id);
            if node.kind == NodeKind::Directory {
                parent_attr.nlink += 1;
            }
        })?;

        Ok(attr)
    }

    fn remove_child(&self, parent: NodeId, name: &OsStr, dir: bool) -> Result<NodeId> {
        self.delay();
        self.ensure_writable()?;
        let _guard = lock(&self.namespace);

        let id = self.child_of(parent, name)?.ok_or(BackendError::NotFound)?;
        let is_dir = self.kind_of(id)? == NodeKind::Directory;
        match (dir, is_dir) {
            (true, false) => return Err(BackendError::NotADirectory),
            (false, true) => return Err(BackendError::IsADirectory),
            (true, true) if !self.is_empty_dir(id) => return Err(BackendError::NotEmpty),
            _ => (),
        }

        self.update_dir(parent, |dir, parent_attr| {
            dir.children.remove(name);
            if is_dir {
                parent_attr.nlink = parent_attr.nlink.saturating_sub(1);
            }
        })?;
        self.drop_link(id);

        Ok(id)
    }

    fn rename_child(
        &self,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        flags: RenameFlags,
    ) -> Result<Renamed> {
        self.delay();
        self.ensure_writable()?;
        if flags.intersects(RenameFlags::EXCHANGE | RenameFlags::WHITEOUT) {
            return Err(BackendError::InvalidInput);
        }
        let _guard = lock(&self.namespace);

        let moved = self.child_of(parent, name)?.ok_or(BackendError::NotFound)?;
        let target = self.child_of(newparent, newname)?;
        if target == Some(moved) {
            return Ok(Renamed {
                moved,
                replaced: None,
            });
        }

        let moved_is_dir = self.kind_of(moved)? == NodeKind::Directory;
        if moved_is_dir && self.is_ancestor(moved, newparent) {
            return Err(BackendError::InvalidInput);
        }

        if let Some(target) = target {
            if flags.contains(RenameFlags::NOREPLACE) {
                return Err(BackendError::AlreadyExists);
            }
            let target_is_dir = self.kind_of(target)? == NodeKind::Directory;
            match (moved_is_dir, target_is_dir) {
                (true, false) => return Err(BackendError::NotADirectory),
                (false, true) => return Err(BackendError::IsADirectory),
                (true, true) if !self.is_empty_dir(target) => {
                    return Err(BackendError::NotEmpty)
                }
                _ => (),
            }
        }

        let cross = parent != newparent;
        self.update_dir(parent, |dir, attr| {
            dir.children.remove(name);
            if moved_is_dir && cross {
                attr.nlink = attr.nlink.saturating_sub(1);
            }
        })?;
        self.update_dir(newparent, |dir, attr| {
            dir.children.insert(newname.to_owned(), moved);
            if moved_is_dir && target.is_some() {
                attr.nlink = attr.nlink.saturating_sub(1);
            }
            if moved_is_dir && cross {
                attr.nlink += 1;
            }
        })?;

        if let Some(mut inode) = self.nodes.get_mut(&moved) {
            inode.attr.ctime = SystemTime::now();
            if let INodeKind::Directory(ref mut dir) = inode.kind {
                dir.parent = newparent;
            }
        }
        if let Some(target) = target {
            self.drop_link(target);
        }

        Ok(Renamed {
            moved,
            replaced: target,
        })
    }

    fn set_attrs(&self, id: NodeId, changes: &SetAttr) -> Result<NodeAttr> {
        self.delay();
        self.ensure_writable()?;

        let mut inode = self.nodes.get_mut(&id).ok_or(BackendError::NotFound)?;
        let INode { attr, kind } = &mut *inode;
        let now = SystemTime::now();

        if let Some(size) = changes.size {
            let content = match kind {
                INodeKind::RegularFile(content) => content,
                INodeKind::Directory(..) => return Err(BackendError::IsADirectory),
                INodeKind::Symlink(..) => return Err(BackendError::InvalidInput),
            };
            let size = self.ensure_room(content, size)?;
            if size > content.len() {
                let wanted = (size - content.len()) as u64;
                let granted = self.reserve(wanted);
                if granted < wanted {
                    self.unreserve(granted);
                    return Err(BackendError::NoSpace);
                }
            } else {
                self.unreserve((content.len() - size) as u64);
            }
            content.resize(size, 0);
            attr.size = size as u64;
            attr.blocks = blocks(attr.size);
            attr.mtime = now;
        }

        if let Some(mode) = changes.mode {
            attr.perm = mode & 0o7777;
        }
        if let Some(uid) = changes.uid {
            attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            attr.gid = gid;
        }
        if let Some(atime) = changes.atime {
            attr.atime = atime.resolve(now);
        }
        if let Some(mtime) = changes.mtime {
            attr.mtime = mtime.resolve(now);
        }
        attr.ctime = changes.ctime.unwrap_or(now);

        Ok(attr.clone())
    }

    fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<NodeAttr> {
        let id = self.child_of(parent, name)?.ok_or(BackendError::NotFound)?;
        self.stat(id)
    }

    fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        let inode = self.nodes.get(&id).ok_or(BackendError::NotFound)?;
        match inode.kind {
            INodeKind::Directory(ref dir) => Ok(Some(dir.parent)),
            _ => Ok(None),
        }
    }

    fn read_link(&self, id: NodeId) -> Result<OsString> {
        self.delay();
        let inode = self.nodes.get(&id).ok_or(BackendError::NotFound)?;
        match inode.kind {
            INodeKind::Symlink(ref target) => Ok(target.clone()),
            _ => Err(BackendError::InvalidInput),
        }
    }

    fn link_child(&self, id: NodeId, newparent: NodeId, newname: &OsStr) -> Result<NodeAttr> {
        self.delay();
        self.ensure_writable()?;
        let _guard = lock(&self.namespace);

        if self.kind_of(id)? == NodeKind::Directory {
            return Err(BackendError::PermissionDenied);
        }
        if self.child_of(newparent, newname)?.is_some() {
            return Err(BackendError::AlreadyExists);
        }

        self.update_dir(newparent, |dir, _| {
            dir.children.insert(newname.to_owned(), id);
        })?;

        let mut inode = self.nodes.get_mut(&id).ok_or(BackendError::NotFound)?;
        inode.attr.nlink += 1;
        inode.attr.ctime = SystemTime::now();
        Ok(inode.attr.clone())
    }

    fn statfs(&self) -> Result<StatFs> {
        let used = self.used.load(Ordering::SeqCst);
        let st = StatFs::default();
        let bsize = u64::from(st.bsize);
        let (blocks, bfree) = match self.capacity {
            Some(capacity) => {
                let blocks = capacity / bsize;
                (blocks, blocks.saturating_sub((used + bsize - 1) / bsize))
            }
            None => (u64::MAX / bsize, u64::MAX / bsize - (used + bsize - 1) / bsize),
        };
        Ok(StatFs {
            blocks,
            bfree,
            bavail: bfree,
            files: self.nodes.len() as u64,
            ffree: u64::MAX - self.nodes.len() as u64,
            ..st
        })
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
