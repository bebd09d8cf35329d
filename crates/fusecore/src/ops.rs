//! The default implementation of every operation.
//!
//! Each operation is a plain function taking the driver state and the
//! request context explicitly. Driver locks are only taken to copy state in
//! or out; no lock is held while the backend is called. The interrupt token
//! is checked once the backend call completed and its outcome has been
//! committed to the resolver, right before a handle is allocated or a
//! reference is handed out.

use crate::{
    backend::{Backend, BackendError, NewNode, RenameFlags, StatFs},
    driver::Driver,
    encode::dirent_size,
    errno::Errno,
    handle::{Handle, HandleKind, OpenMode},
    node::{AccessMask, NodeAttr, NodeId, NodeKind, SetAttr, TimeOrNow},
    reply::{AttrOut, DirEntryOut, EntryOut, OpenOut},
    request::Request,
};
use std::{
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt as _, OsStringExt as _},
    sync::Arc,
};

pub type Result<T> = std::result::Result<T, Errno>;

#[derive(Copy, Clone)]
enum Dots {
    None,
    Dot,
    DotDot,
}

/// Validate an entry name received from the kernel.
fn check_name<B: Backend>(driver: &Driver<B>, name: &OsStr) -> Result<Dots> {
    let bytes = name.as_bytes();
    if bytes.len() > driver.config().get_max_name_len() {
        return Err(Errno::NameTooLong);
    }
    if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
        return Err(Errno::InvalidArgument);
    }
    Ok(match bytes {
        b"." => Dots::Dot,
        b".." => Dots::DotDot,
        _ => Dots::None,
    })
}

/// Validate the name of an entry about to be created.
fn check_new_name<B: Backend>(driver: &Driver<B>, name: &OsStr) -> Result<()> {
    match check_name(driver, name)? {
        Dots::None => Ok(()),
        _ => Err(Errno::AlreadyExists),
    }
}

/// Validate the name of an entry about to be removed or moved.
fn check_existing_name<B: Backend>(driver: &Driver<B>, name: &OsStr) -> Result<()> {
    match check_name(driver, name)? {
        Dots::None => Ok(()),
        _ => Err(Errno::InvalidArgument),
    }
}

fn ensure_writable<B: Backend>(driver: &Driver<B>) -> Result<()> {
    if driver.is_read_only() {
        return Err(Errno::ReadOnly);
    }
    Ok(())
}

fn check_access<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    attr: &NodeAttr,
    mask: AccessMask,
) -> Result<()> {
    if driver.config().checks_permissions() && !attr.permits(req.uid(), req.gid(), mask) {
        tracing::debug!(node = ?attr.id, ?mask, uid = req.uid(), "access denied");
        return Err(Errno::PermissionDenied);
    }
    Ok(())
}

/// Fetch the attributes of the directory `parent` and check `mask` on it.
fn parent_dir<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    mask: AccessMask,
) -> Result<NodeAttr> {
    let attr = driver.backend().stat(parent)?;
    if attr.kind != NodeKind::Directory {
        return Err(Errno::NotADirectory);
    }
    check_access(driver, req, &attr, mask)?;
    Ok(attr)
}

fn entry_out<B: Backend>(driver: &Driver<B>, attr: NodeAttr) -> EntryOut {
    EntryOut {
        attr,
        generation: 0,
        entry_ttl: driver.config().get_entry_ttl(),
        attr_ttl: driver.config().get_attr_ttl(),
    }
}

fn attr_out<B: Backend>(driver: &Driver<B>, attr: NodeAttr) -> AttrOut {
    AttrOut {
        attr,
        ttl: driver.config().get_attr_ttl(),
    }
}

/// Hand a reference to `attr` out to the kernel.
fn reply_entry<B: Backend>(driver: &Driver<B>, req: &Request, attr: NodeAttr) -> Result<EntryOut> {
    req.check_interrupt()?;
    driver.resolver().remember(attr.id);
    Ok(entry_out(driver, attr))
}

/// The node behind an open handle went away.
fn lost(err: BackendError) -> Errno {
    match err {
        BackendError::NotFound | BackendError::Stale => Errno::InvalidHandle,
        err => err.into(),
    }
}

/// Invalidate the handles of `id` when the node no longer exists.
fn drop_handles_if_destroyed<B: Backend>(driver: &Driver<B>, id: NodeId) {
    let destroyed = match driver.backend().stat(id) {
        Ok(attr) => attr.nlink == 0,
        Err(BackendError::NotFound) | Err(BackendError::Stale) => true,
        Err(..) => false,
    };
    if destroyed {
        let n = driver.handles().invalidate_node(id);
        if n > 0 {
            tracing::debug!(node = ?id, handles = n, "invalidated handles of a destroyed node");
        }
    }
}

/// Resolve `fh` to a file handle opened with at least `access`.
fn file_handle<B: Backend>(
    driver: &Driver<B>,
    fh: Handle,
    access: OpenMode,
) -> Result<(NodeId, OpenMode)> {
    let handle = driver.handles().resolve(fh)?;
    match handle.kind {
        HandleKind::File(mode) if mode.contains(access) => Ok((handle.node, mode)),
        HandleKind::File(..) => Err(Errno::InvalidHandle),
        HandleKind::Dir(..) => Err(Errno::IsADirectory),
    }
}

fn dir_handle<B: Backend>(driver: &Driver<B>, fh: Handle) -> Result<(NodeId, Arc<[DirEntryOut]>)> {
    let handle = driver.handles().resolve(fh)?;
    match handle.kind {
        HandleKind::Dir(entries) => Ok((handle.node, entries)),
        HandleKind::File(..) => Err(Errno::NotADirectory),
    }
}

pub fn lookup<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
) -> Result<EntryOut> {
    let dots = check_name(driver, name)?;
    let dir = parent_dir(driver, req, parent, AccessMask::EXEC)?;

    let attr = match dots {
        Dots::Dot => dir,
        Dots::DotDot => {
            let up = driver.backend().parent(parent)?.unwrap_or(NodeId::ROOT);
            driver.backend().stat(up)?
        }
        Dots::None => driver.resolver().lookup(driver.backend(), parent, name)?,
    };

    reply_entry(driver, req, attr)
}

pub fn forget<B: Backend>(
    driver: &Driver<B>,
    _req: &Request,
    node: NodeId,
    nlookup: u64,
) -> Result<()> {
    driver.resolver().forget(node, nlookup);
    Ok(())
}

pub fn getattr<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    node: NodeId,
    fh: Option<Handle>,
) -> Result<AttrOut> {
    if let Some(fh) = fh {
        if driver.handles().resolve(fh)?.node != node {
            return Err(Errno::InvalidHandle);
        }
    }
    let attr = driver.backend().stat(node)?;
    req.check_interrupt()?;
    Ok(attr_out(driver, attr))
}

pub fn setattr<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    node: NodeId,
    fh: Option<Handle>,
    changes: &SetAttr,
) -> Result<AttrOut> {
    ensure_writable(driver)?;

    let mut writable_handle = false;
    if let Some(fh) = fh {
        let handle = driver.handles().resolve(fh)?;
        if handle.node != node {
            return Err(Errno::InvalidHandle);
        }
        writable_handle = matches!(
            handle.kind,
            HandleKind::File(mode) if mode.contains(OpenMode::WRITE)
        );
        if changes.size.is_some() && !writable_handle {
            return Err(Errno::InvalidHandle);
        }
    }

    let current = driver.backend().stat(node)?;
    if changes.is_empty() {
        return Ok(attr_out(driver, current));
    }

    if driver.config().checks_permissions() && req.uid() != 0 {
        let owner = req.uid() == current.uid;
        if changes.changes_owner_or_mode() && !owner {
            return Err(Errno::PermissionDenied);
        }
        if changes.uid.map_or(false, |uid| uid != current.uid) {
            return Err(Errno::PermissionDenied);
        }
        if changes.size.is_some() && !writable_handle {
            check_access(driver, req, &current, AccessMask::WRITE)?;
        }
        let explicit_times = matches!(changes.atime, Some(TimeOrNow::Time(..)))
            || matches!(changes.mtime, Some(TimeOrNow::Time(..)));
        if explicit_times && !owner {
            return Err(Errno::PermissionDenied);
        }
        if (changes.atime.is_some() || changes.mtime.is_some()) && !owner {
            check_access(driver, req, &current, AccessMask::WRITE)?;
        }
    }
    if changes.size.is_some() && current.kind == NodeKind::Directory {
        return Err(Errno::IsADirectory);
    }

    let attr = driver.backend().set_attrs(node, changes)?;
    req.check_interrupt()?;
    Ok(attr_out(driver, attr))
}

pub fn readlink<B: Backend>(driver: &Driver<B>, req: &Request, node: NodeId) -> Result<Vec<u8>> {
    let attr = driver.backend().stat(node)?;
    if attr.kind != NodeKind::Symlink {
        return Err(Errno::InvalidArgument);
    }
    let target = driver.backend().read_link(node)?;
    req.check_interrupt()?;
    Ok(target.into_vec())
}

/// Create a child under `parent` and bind it in the resolver.
fn make_node<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    node: NewNode,
) -> Result<NodeAttr> {
    ensure_writable(driver)?;
    check_new_name(driver, name)?;
    parent_dir(driver, req, parent, AccessMask::WRITE | AccessMask::EXEC)?;

    let attr = driver.backend().create_child(parent, name, &node)?;
    driver.resolver().insert(parent, name, attr.id);
    tracing::debug!(?parent, ?name, node = ?attr.id, kind = ?attr.kind, "created");
    Ok(attr)
}

pub fn mknod<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    mode: u32,
    rdev: u32,
) -> Result<EntryOut> {
    // device nodes and fifos are not representable by the store.
    if NodeKind::from_mode(mode) != Some(NodeKind::File) {
        return Err(Errno::PermissionDenied);
    }
    let mut node = NewNode::new(NodeKind::File, mode, req.uid(), req.gid());
    node.rdev = rdev;
    let attr = make_node(driver, req, parent, name, node)?;
    reply_entry(driver, req, attr)
}

pub fn mkdir<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    mode: u32,
) -> Result<EntryOut> {
    let node = NewNode::new(NodeKind::Directory, mode, req.uid(), req.gid());
    let attr = make_node(driver, req, parent, name, node)?;
    reply_entry(driver, req, attr)
}

pub fn symlink<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    target: &OsStr,
) -> Result<EntryOut> {
    if target.is_empty() {
        return Err(Errno::NotFound);
    }
    let mut node = NewNode::new(NodeKind::Symlink, 0o777, req.uid(), req.gid());
    node.target = Some(target.to_owned());
    let attr = make_node(driver, req, parent, name, node)?;
    reply_entry(driver, req, attr)
}

pub fn create<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    mode: u32,
    flags: i32,
) -> Result<(EntryOut, OpenOut)> {
    let open_mode = OpenMode::from_flags(flags)?;
    if NodeKind::from_mode(mode) != Some(NodeKind::File) {
        return Err(Errno::InvalidArgument);
    }
    let node = NewNode::new(NodeKind::File, mode, req.uid(), req.gid());
    let attr = make_node(driver, req, parent, name, node)?;

    req.check_interrupt()?;
    let fh = driver.handles().allocate(attr.id, HandleKind::File(open_mode));
    let entry = reply_entry(driver, req, attr)?;
    Ok((entry, OpenOut { fh, flags: 0 }))
}

/// Remove the entry `name` of `parent`, `dir` selecting the `rmdir` flavor.
fn remove<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    dir: bool,
) -> Result<()> {
    ensure_writable(driver)?;
    check_existing_name(driver, name)?;
    parent_dir(driver, req, parent, AccessMask::WRITE | AccessMask::EXEC)?;

    let result = driver.backend().remove_child(parent, name, dir);
    if matches!(result, Ok(..) | Err(BackendError::NotFound)) {
        driver.resolver().invalidate(parent, name);
    }
    let id = result?;
    tracing::debug!(?parent, ?name, node = ?id, "removed");

    drop_handles_if_destroyed(driver, id);
    req.check_interrupt()
}

pub fn unlink<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
) -> Result<()> {
    remove(driver, req, parent, name, false)
}

pub fn rmdir<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
) -> Result<()> {
    remove(driver, req, parent, name, true)
}

pub fn rename<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    parent: NodeId,
    name: &OsStr,
    newparent: NodeId,
    newname: &OsStr,
    flags: u32,
) -> Result<()> {
    ensure_writable(driver)?;
    let flags = RenameFlags::from_bits(flags).ok_or(Errno::InvalidArgument)?;
    if flags.intersects(RenameFlags::EXCHANGE | RenameFlags::WHITEOUT) {
        return Err(Errno::InvalidArgument);
    }
    check_existing_name(driver, name)?;
    check_existing_name(driver, newname)?;
    parent_dir(driver, req, parent, AccessMask::WRITE | AccessMask::EXEC)?;
    if newparent != parent {
        parent_dir(driver, req, newparent, AccessMask::WRITE | AccessMask::EXEC)?;
    }

    let renamed = driver
        .backend()
        .rename_child(parent, name, newparent, newname, flags)?;
    driver
        .resolver()
        .rename(parent, name, newparent, newname, renamed.moved);
    tracing::debug!(
        ?parent,
        ?name,
        ?newparent,
        ?newname,
        moved = ?renamed.moved,
        replaced = ?renamed.replaced,
        "renamed"
    );

    if let Some(replaced) = renamed.replaced {
        drop_handles_if_destroyed(driver, replaced);
    }
    req.check_interrupt()
}

pub fn link<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    node: NodeId,
    newparent: NodeId,
    newname: &OsStr,
) -> Result<EntryOut> {
    ensure_writable(driver)?;
    check_new_name(driver, newname)?;
    parent_dir(driver, req, newparent, AccessMask::WRITE | AccessMask::EXEC)?;

    let attr = driver.backend().link_child(node, newparent, newname)?;
    driver.resolver().insert(newparent, newname, attr.id);
    reply_entry(driver, req, attr)
}

pub fn open<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    node: NodeId,
    flags: i32,
) -> Result<OpenOut> {
    let mode = OpenMode::from_flags(flags)?;
    let truncate = flags & libc::O_TRUNC != 0;

    let attr = driver.backend().stat(node)?;
    match attr.kind {
        NodeKind::Directory => return Err(Errno::IsADirectory),
        NodeKind::Symlink => return Err(Errno::InvalidArgument),
        NodeKind::File => (),
    }

    let mut mask = AccessMask::empty();
    if mode.contains(OpenMode::READ) {
        mask |= AccessMask::READ;
    }
    if mode.contains(OpenMode::WRITE) || truncate {
        ensure_writable(driver)?;
        mask |= AccessMask::WRITE;
    }
    check_access(driver, req, &attr, mask)?;

    if truncate && attr.size > 0 {
        let changes = SetAttr {
            size: Some(0),
            ..Default::default()
        };
        driver.backend().set_attrs(node, &changes)?;
    }

    req.check_interrupt()?;
    let fh = driver.handles().allocate(node, HandleKind::File(mode));
    tracing::debug!(?node, ?fh, ?mode, "opened");
    Ok(OpenOut { fh, flags: 0 })
}

pub fn read<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    fh: Handle,
    offset: u64,
    size: u32,
) -> Result<Vec<u8>> {
    let (node, _) = file_handle(driver, fh, OpenMode::READ)?;
    let data = driver
        .backend()
        .read_bytes(node, offset, size as usize)
        .map_err(lost)?;
    req.check_interrupt()?;
    Ok(data)
}

pub fn write<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    fh: Handle,
    offset: u64,
    data: &[u8],
) -> Result<u32> {
    let (node, mode) = file_handle(driver, fh, OpenMode::WRITE)?;
    ensure_writable(driver)?;

    let offset = if mode.contains(OpenMode::APPEND) {
        driver.backend().stat(node).map_err(lost)?.size
    } else {
        offset
    };
    let max_write = driver.config().get_max_write() as usize;
    let data = &data[..data.len().min(max_write)];

    let written = driver
        .backend()
        .write_bytes(node, offset, data)
        .map_err(lost)?;
    req.check_interrupt()?;
    Ok(written as u32)
}

pub fn flush<B: Backend>(driver: &Driver<B>, _req: &Request, fh: Handle) -> Result<()> {
    let (node, _) = file_handle(driver, fh, OpenMode::empty())?;
    driver.backend().sync(node, true).map_err(lost)
}

pub fn fsync<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    fh: Handle,
    datasync: bool,
) -> Result<()> {
    let (node, _) = file_handle(driver, fh, OpenMode::empty())?;
    driver.backend().sync(node, datasync).map_err(lost)?;
    req.check_interrupt()
}

pub fn release<B: Backend>(driver: &Driver<B>, _req: &Request, fh: Handle) -> Result<()> {
    file_handle(driver, fh, OpenMode::empty())?;
    let handle = driver.handles().release(fh)?;
    tracing::debug!(node = ?handle.node, ?fh, "released");
    Ok(())
}

pub fn opendir<B: Backend>(driver: &Driver<B>, req: &Request, node: NodeId) -> Result<OpenOut> {
    let attr = driver.backend().stat(node)?;
    if attr.kind != NodeKind::Directory {
        return Err(Errno::NotADirectory);
    }
    check_access(driver, req, &attr, AccessMask::READ)?;

    let children = driver.backend().read_children(node)?;
    let mut entries = Vec::with_capacity(children.len() + 2);
    if driver.config().has_dot_entries() {
        let up = driver.backend().parent(node)?.unwrap_or(node);
        entries.push((OsString::from("."), node, NodeKind::Directory));
        entries.push((OsString::from(".."), up, NodeKind::Directory));
    }
    entries.extend(children.into_iter().map(|e| (e.name, e.id, e.kind)));

    let entries: Arc<[DirEntryOut]> = entries
        .into_iter()
        .enumerate()
        .map(|(i, (name, id, kind))| DirEntryOut {
            name,
            id,
            kind,
            offset: i as u64 + 1,
        })
        .collect();

    req.check_interrupt()?;
    let fh = driver.handles().allocate(node, HandleKind::Dir(entries));
    tracing::debug!(?node, ?fh, "opened directory");
    Ok(OpenOut { fh, flags: 0 })
}

pub fn readdir<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    fh: Handle,
    offset: u64,
    size: u32,
) -> Result<Vec<DirEntryOut>> {
    let (_, entries) = dir_handle(driver, fh)?;

    let mut budget = size as usize;
    let mut out = vec![];
    for entry in entries.iter().skip(offset as usize) {
        let len = dirent_size(entry);
        if len > budget {
            break;
        }
        budget -= len;
        out.push(entry.clone());
    }

    req.check_interrupt()?;
    Ok(out)
}

pub fn releasedir<B: Backend>(driver: &Driver<B>, _req: &Request, fh: Handle) -> Result<()> {
    dir_handle(driver, fh)?;
    driver.handles().release(fh)?;
    Ok(())
}

pub fn fsyncdir<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    fh: Handle,
    datasync: bool,
) -> Result<()> {
    let (node, _) = dir_handle(driver, fh)?;
    driver.backend().sync(node, datasync).map_err(lost)?;
    req.check_interrupt()
}

pub fn statfs<B: Backend>(driver: &Driver<B>, req: &Request, node: NodeId) -> Result<StatFs> {
    driver.backend().stat(node)?;
    let mut st = driver.backend().statfs()?;
    st.namelen = st.namelen.min(driver.config().get_max_name_len() as u32);
    req.check_interrupt()?;
    Ok(st)
}

pub fn access<B: Backend>(
    driver: &Driver<B>,
    req: &Request,
    node: NodeId,
    mask: AccessMask,
) -> Result<()> {
    let attr = driver.backend().stat(node)?;
    if mask.contains(AccessMask::WRITE) {
        ensure_writable(driver)?;
    }
    check_access(driver, req, &attr, mask)
}

pub fn destroy<B: Backend>(driver: &Driver<B>, _req: &Request) -> Result<()> {
    driver.teardown();
    Ok(())
}
