//! Resolution of names to nodes, backed by a lease-based cache.

use crate::{
    backend::{Backend, BackendError, Result},
    node::{NodeAttr, NodeId, NodeKind},
    util::lock,
};
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fmt,
    path::{Component, Path},
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug)]
struct Entry {
    child: NodeId,
    expires: Instant,
}

#[derive(Debug, Default)]
struct Dir {
    /// The clock value of the last structural mutation of this directory.
    epoch: u64,
    children: HashMap<OsString, Entry>,
}

#[derive(Debug, Default)]
struct Cache {
    clock: u64,
    /// The epoch assumed for directories without a record.
    floor: u64,
    dirs: HashMap<NodeId, Dir>,
    lookups: HashMap<NodeId, u64>,
}

impl Cache {
    fn epoch(&self, parent: NodeId) -> u64 {
        self.dirs.get(&parent).map_or(self.floor, |dir| dir.epoch)
    }

    /// Record a structural mutation of `parent`.
    fn touch(&mut self, parent: NodeId) -> &mut Dir {
        self.clock += 1;
        let clock = self.clock;
        let dir = self.dirs.entry(parent).or_default();
        dir.epoch = clock;
        dir
    }

    fn evict(&mut self, parent: NodeId, name: &OsStr, child: NodeId) {
        if let Some(dir) = self.dirs.get_mut(&parent) {
            if dir.children.get(name).map(|e| e.child) == Some(child) {
                dir.children.remove(name);
            }
        }
    }

    fn drop_node(&mut self, id: NodeId) {
        for dir in self.dirs.values_mut() {
            dir.children.retain(|_, entry| entry.child != id);
        }
        if self.dirs.remove(&id).is_some() {
            self.clock += 1;
            self.floor = self.clock;
        }
    }
}

/// The name resolution layer between operations and the backend.
///
/// Every cached binding carries a lease. Within its lease a binding is
/// trusted without resolving the name again; the attributes are always
/// fetched fresh. Each directory carries an epoch, bumped by every
/// structural mutation, and a lookup commits its result only when the
/// epoch of the parent did not move while the backend was queried.
pub struct Resolver {
    cache: Mutex<Cache>,
    lease: Duration,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("lease", &self.lease)
            .field("len", &self.len())
            .finish()
    }
}

impl Resolver {
    pub fn new(lease: Duration) -> Self {
        Self {
            cache: Mutex::new(Cache::default()),
            lease,
        }
    }

    /// Resolve the entry `name` of the directory `parent`.
    pub fn lookup<B>(&self, backend: &B, parent: NodeId, name: &OsStr) -> Result<NodeAttr>
    where
        B: Backend + ?Sized,
    {
        let now = Instant::now();
        let (cached, ticket) = {
            let cache = lock(&self.cache);
            let cached = cache
                .dirs
                .get(&parent)
                .and_then(|dir| dir.children.get(name))
                .filter(|entry| entry.expires > now)
                .map(|entry| entry.child);
            (cached, cache.clock)
        };

        if let Some(child) = cached {
            match backend.stat(child) {
                Ok(attr) => {
                    tracing::trace!(?parent, ?name, ?child, "resolved from cache");
                    return Ok(attr);
                }
                Err(BackendError::NotFound) | Err(BackendError::Stale) => {
                    tracing::debug!(?parent, ?name, ?child, "cached node vanished");
                    lock(&self.cache).evict(parent, name, child);
                }
                Err(err) => return Err(err),
            }
        }

        let result = backend.lookup(parent, name);

        let mut cache = lock(&self.cache);
        if cache.epoch(parent) > ticket {
            tracing::debug!(?parent, ?name, "directory changed during lookup; not caching");
            return result;
        }
        match result {
            Ok(ref attr) if !self.lease.is_zero() => {
                let expires = Instant::now() + self.lease;
                cache
                    .dirs
                    .entry(parent)
                    .or_default()
                    .children
                    .insert(name.to_owned(), Entry {
                        child: attr.id,
                        expires,
                    });
            }
            Err(BackendError::NotFound) => {
                if let Some(dir) = cache.dirs.get_mut(&parent) {
                    dir.children.remove(name);
                }
            }
            _ => (),
        }
        result
    }

    /// Resolve an absolute path by walking its components from the root.
    pub fn resolve_path<B>(&self, backend: &B, path: impl AsRef<Path>) -> Result<NodeAttr>
    where
        B: Backend + ?Sized,
    {
        let mut attr = backend.stat(NodeId::ROOT)?;
        for component in path.as_ref().components() {
            match component {
                Component::RootDir | Component::CurDir => continue,
                Component::Prefix(..) => return Err(BackendError::InvalidInput),
                Component::ParentDir => {
                    let parent = backend.parent(attr.id)?.unwrap_or(NodeId::ROOT);
                    attr = backend.stat(parent)?;
                }
                Component::Normal(name) => {
                    if attr.kind != NodeKind::Directory {
                        return Err(BackendError::NotADirectory);
                    }
                    attr = self.lookup(backend, attr.id, name)?;
                }
            }
        }
        Ok(attr)
    }

    /// Bind `name` under `parent` to a freshly created `child`.
    pub fn insert(&self, parent: NodeId, name: &OsStr, child: NodeId) {
        let lease = self.lease;
        let mut cache = lock(&self.cache);
        let dir = cache.touch(parent);
        if lease.is_zero() {
            dir.children.remove(name);
        } else {
            dir.children.insert(name.to_owned(), Entry {
                child,
                expires: Instant::now() + lease,
            });
        }
    }

    /// Drop the binding of `name` under `parent`.
    pub fn invalidate(&self, parent: NodeId, name: &OsStr) {
        let mut cache = lock(&self.cache);
        cache.touch(parent).children.remove(name);
    }

    /// Move the binding of `name` under `parent` to `newname` under `newparent`.
    ///
    /// Both directories change in a single critical section, so no reader
    /// observes the node under both names or under neither.
    pub fn rename(
        &self,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        moved: NodeId,
    ) {
        let lease = self.lease;
        let mut cache = lock(&self.cache);
        cache.touch(parent).children.remove(name);
        let dir = cache.touch(newparent);
        if lease.is_zero() {
            dir.children.remove(newname);
        } else {
            dir.children.insert(newname.to_owned(), Entry {
                child: moved,
                expires: Instant::now() + lease,
            });
        }
    }

    /// Count one more reference handed out to the kernel for `id`.
    pub fn remember(&self, id: NodeId) {
        *lock(&self.cache).lookups.entry(id).or_insert(0) += 1;
    }

    /// Drop `nlookup` references to `id`.
    ///
    /// When no reference remains every cached binding to the node is dropped.
    pub fn forget(&self, id: NodeId, nlookup: u64) {
        let mut cache = lock(&self.cache);
        let remaining = match cache.lookups.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            cache.lookups.remove(&id);
            if id != NodeId::ROOT {
                cache.drop_node(id);
            }
        }
    }

    /// Return the number of outstanding references to `id`.
    pub fn lookup_count(&self, id: NodeId) -> u64 {
        lock(&self.cache).lookups.get(&id).copied().unwrap_or(0)
    }

    /// Return the node bound to `name` under `parent`, if its lease is live.
    pub fn cached(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        let now = Instant::now();
        lock(&self.cache)
            .dirs
            .get(&parent)
            .and_then(|dir| dir.children.get(name))
            .filter(|entry| entry.expires > now)
            .map(|entry| entry.child)
    }

    /// Return the number of cached bindings, expired ones included.
    pub fn len(&self) -> usize {
        lock(&self.cache)
            .dirs
            .values()
            .map(|dir| dir.children.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every binding and reference count.
    pub fn clear(&self) {
        let mut cache = lock(&self.cache);
        cache.clock += 1;
        cache.floor = cache.clock;
        cache.dirs.clear();
        cache.lookups.clear();
    }
}
