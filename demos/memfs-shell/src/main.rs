//! An interactive shell over an in-memory filesystem.
//!
//! The filesystem is served through the loopback transport, and every shell
//! command is carried out as a sequence of protocol requests.

#![deny(clippy::unimplemented)]

use anyhow::{anyhow, Context as _, Result};
use fusecore::{
    channel::{self, Client},
    Config, Driver, Errno, MemStore, NodeAttr, NodeId, NodeKind, OperationTable, SetAttr,
};
use std::{
    cell::RefCell,
    ffi::{OsStr, OsString},
    io::{self, BufRead, Write},
    path::{Component, Path},
    sync::Arc,
    thread,
    time::{Duration, UNIX_EPOCH},
};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
    ls [PATH]               list a directory
    cat PATH                print the content of a file
    write PATH TEXT...      replace the content of a file
    append PATH TEXT...     append to a file
    truncate PATH SIZE      resize a file
    mkdir PATH              create a directory
    rm PATH                 remove a file
    rmdir PATH              remove an empty directory
    mv SRC DST              rename an entry
    ln [-s] TARGET PATH     create a hard or symbolic link
    readlink PATH           print the target of a symbolic link
    stat PATH               print the attributes of an entry
    df                      print filesystem statistics
    help                    show this message
    exit                    unmount and quit
";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        eprintln!("usage: memfs-shell [--read-only] [--lease-ms N] [--capacity BYTES]");
        eprint!("{}", HELP);
        return Ok(());
    }

    let mut config = Config::default();
    config.read_only(args.contains("--read-only"));
    if let Some(lease) = args.opt_value_from_str::<_, u64>("--lease-ms")? {
        config.lease(Duration::from_millis(lease));
    }
    let mut store = MemStore::new();
    if let Some(capacity) = args.opt_value_from_str::<_, u64>("--capacity")? {
        store = store.capacity(capacity);
    }
    let rest: Vec<OsString> = args.finish();
    tracing::debug!(?rest, "unparsed arguments");

    let (transport, client) = channel::pair();
    let driver = Arc::new(Driver::new(store, config));
    let table = OperationTable::default();

    let status = thread::scope(|scope| -> Result<i32> {
        let server = scope.spawn(|| fusecore::main(&rest, &table, &driver, transport));

        let result = repl(&Shell::new(&client));
        client.unmount();

        let status = server
            .join()
            .map_err(|_| anyhow!("the filesystem server panicked"))?;
        result?;
        Ok(status)
    })?;

    anyhow::ensure!(status == 0, "the session ended with status {}", status);
    Ok(())
}

/// A client that keeps track of the node references handed out to it.
///
/// Every entry reply counts one lookup on the node. The shell holds no node
/// across commands, so the references are forgotten after each command.
struct Shell<'a> {
    client: &'a Client,
    looked_up: RefCell<Vec<NodeId>>,
}

impl<'a> Shell<'a> {
    fn new(client: &'a Client) -> Self {
        Self {
            client,
            looked_up: RefCell::new(vec![]),
        }
    }

    fn remember(&self, id: NodeId) {
        self.looked_up.borrow_mut().push(id);
    }

    fn lookup(&self, parent: NodeId, name: impl AsRef<OsStr>) -> Result<NodeAttr, Errno> {
        let attr = self.client.lookup(parent, name)?;
        self.remember(attr.id);
        Ok(attr)
    }

    fn forget_all(&self) {
        for id in self.looked_up.borrow_mut().drain(..) {
            self.client.forget(id, 1);
        }
    }
}

fn repl(sh: &Shell<'_>) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line.context("failed to read a command")?;
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["exit"] | ["quit"] => break,
            ["help"] => write!(out, "{}", HELP)?,
            words => {
                tracing::debug!(?words, "run command");
                let result = run(sh, words, &mut out);
                sh.forget_all();
                if let Err(errno) = result? {
                    writeln!(out, "{}: {}", words[0], errno)?;
                }
            }
        }
        out.flush()?;
    }

    Ok(())
}

/// Run a single command. The outer error is an I/O failure of the shell,
/// the inner one a failure of the filesystem.
fn run(sh: &Shell<'_>, words: &[&str], out: &mut impl Write) -> io::Result<Result<(), Errno>> {
    match words {
        ["ls"] => ls(sh, "/", out),
        ["ls", path] => ls(sh, path, out),
        ["cat", path] => cat(sh, path, out),
        ["write", path, text @ ..] => put(sh, path, &text.join(" "), false),
        ["append", path, text @ ..] => put(sh, path, &text.join(" "), true),
        ["truncate", path, size] => match size.parse() {
            Ok(size) => truncate(sh, path, size),
            Err(..) => Ok(Err(Errno::InvalidArgument)),
        },
        ["mkdir", path] => Ok(mkdir(sh, path)),
        ["rm", path] => Ok(remove(sh, path, false)),
        ["rmdir", path] => Ok(remove(sh, path, true)),
        ["mv", src, dst] => Ok(rename(sh, src, dst)),
        ["ln", "-s", target, path] => Ok(symlink(sh, target, path)),
        ["ln", target, path] => Ok(link(sh, target, path)),
        ["readlink", path] => readlink(sh, path, out),
        ["stat", path] => stat(sh, path, out),
        ["df"] => df(sh, out),
        _ => {
            writeln!(out, "unknown command; try `help`")?;
            Ok(Ok(()))
        }
    }
}

/// Walk `path` from the root, one lookup per component.
fn resolve(sh: &Shell<'_>, path: &str) -> Result<NodeAttr, Errno> {
    let mut attr = sh.client.getattr(NodeId::ROOT)?;
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => (),
            Component::ParentDir => attr = sh.lookup(attr.id, "..")?,
            Component::Normal(name) => attr = sh.lookup(attr.id, name)?,
            Component::Prefix(..) => return Err(Errno::InvalidArgument),
        }
    }
    Ok(attr)
}

/// Resolve the directory containing `path`, and return it with the last component.
fn resolve_parent<'a>(sh: &Shell<'_>, path: &'a str) -> Result<(NodeId, &'a str), Errno> {
    let path = path.trim_end_matches('/');
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    };
    if name.is_empty() {
        return Err(Errno::InvalidArgument);
    }
    let parent = resolve(sh, dir)?;
    Ok((parent.id, name))
}

fn ls(sh: &Shell<'_>, path: &str, out: &mut impl Write) -> io::Result<Result<(), Errno>> {
    let entries = match resolve(sh, path).and_then(|dir| sh.client.list(dir.id)) {
        Ok(entries) => entries,
        Err(errno) => return Ok(Err(errno)),
    };
    for entry in entries {
        let suffix = match entry.kind {
            NodeKind::Directory => "/",
            NodeKind::Symlink => "@",
            NodeKind::File => "",
        };
        writeln!(out, "{}{}", entry.name.to_string_lossy(), suffix)?;
    }
    Ok(Ok(()))
}

fn cat(sh: &Shell<'_>, path: &str, out: &mut impl Write) -> io::Result<Result<(), Errno>> {
    let attr = match resolve(sh, path) {
        Ok(attr) => attr,
        Err(errno) => return Ok(Err(errno)),
    };
    let fh = match sh.client.open(attr.id, libc::O_RDONLY) {
        Ok(fh) => fh,
        Err(errno) => return Ok(Err(errno)),
    };

    let mut offset = 0;
    let result = loop {
        match sh.client.read(fh, offset, 4096) {
            Ok(data) if data.is_empty() => break Ok(()),
            Ok(data) => {
                out.write_all(&data)?;
                offset += data.len() as u64;
            }
            Err(errno) => break Err(errno),
        }
    };
    Ok(result.and(sh.client.release(fh)))
}

fn put(sh: &Shell<'_>, path: &str, text: &str, append: bool) -> io::Result<Result<(), Errno>> {
    let (parent, name) = match resolve_parent(sh, path) {
        Ok(found) => found,
        Err(errno) => return Ok(Err(errno)),
    };

    let fh = match sh.lookup(parent, name) {
        Ok(attr) => {
            let flags = if append {
                libc::O_WRONLY | libc::O_APPEND
            } else {
                libc::O_WRONLY | libc::O_TRUNC
            };
            sh.client.open(attr.id, flags)
        }
        Err(Errno::NotFound) => sh
            .client
            .create(parent, name, 0o644, libc::O_WRONLY)
            .map(|(attr, fh)| {
                sh.remember(attr.id);
                fh
            }),
        Err(errno) => Err(errno),
    };
    let fh = match fh {
        Ok(fh) => fh,
        Err(errno) => return Ok(Err(errno)),
    };

    // short writes are legal; retry the remainder.
    let mut data = format!("{}\n", text).into_bytes();
    let mut offset = 0;
    let result = loop {
        if data.is_empty() {
            break Ok(());
        }
        match sh.client.write(fh, offset, data.clone()) {
            Ok(0) => break Err(Errno::NoSpace),
            Ok(n) => {
                data.drain(..n as usize);
                offset += u64::from(n);
            }
            Err(errno) => break Err(errno),
        }
    };
    Ok(result.and(sh.client.release(fh)))
}

fn truncate(sh: &Shell<'_>, path: &str, size: u64) -> io::Result<Result<(), Errno>> {
    let changes = SetAttr {
        size: Some(size),
        ..Default::default()
    };
    Ok(resolve(sh, path).and_then(|attr| sh.client.setattr(attr.id, changes).map(drop)))
}

fn mkdir(sh: &Shell<'_>, path: &str) -> Result<(), Errno> {
    let (parent, name) = resolve_parent(sh, path)?;
    sh.client.mkdir(parent, name, 0o755).map(|attr| sh.remember(attr.id))
}

fn remove(sh: &Shell<'_>, path: &str, dir: bool) -> Result<(), Errno> {
    let (parent, name) = resolve_parent(sh, path)?;
    if dir {
        sh.client.rmdir(parent, name)
    } else {
        sh.client.unlink(parent, name)
    }
}

fn rename(sh: &Shell<'_>, src: &str, dst: &str) -> Result<(), Errno> {
    let (parent, name) = resolve_parent(sh, src)?;
    let (newparent, newname) = resolve_parent(sh, dst)?;
    sh.client.rename(parent, name, newparent, newname, 0)
}

fn symlink(sh: &Shell<'_>, target: &str, path: &str) -> Result<(), Errno> {
    let (parent, name) = resolve_parent(sh, path)?;
    sh.client
        .symlink(parent, name, target)
        .map(|attr| sh.remember(attr.id))
}

fn link(sh: &Shell<'_>, target: &str, path: &str) -> Result<(), Errno> {
    let target = resolve(sh, target)?;
    let (parent, name) = resolve_parent(sh, path)?;
    sh.client
        .link(target.id, parent, name)
        .map(|attr| sh.remember(attr.id))
}

fn readlink(sh: &Shell<'_>, path: &str, out: &mut impl Write) -> io::Result<Result<(), Errno>> {
    match resolve(sh, path).and_then(|attr| sh.client.readlink(attr.id)) {
        Ok(target) => {
            out.write_all(&target)?;
            writeln!(out)?;
            Ok(Ok(()))
        }
        Err(errno) => Ok(Err(errno)),
    }
}

fn stat(sh: &Shell<'_>, path: &str, out: &mut impl Write) -> io::Result<Result<(), Errno>> {
    let attr = match resolve(sh, path) {
        Ok(attr) => attr,
        Err(errno) => return Ok(Err(errno)),
    };
    let mtime = attr
        .mtime
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    writeln!(
        out,
        "node={} kind={:?} mode={:o} nlink={} uid={} gid={} size={} mtime={}",
        attr.id.into_raw(),
        attr.kind,
        attr.mode(),
        attr.nlink,
        attr.uid,
        attr.gid,
        attr.size,
        mtime,
    )?;
    Ok(Ok(()))
}

fn df(sh: &Shell<'_>, out: &mut impl Write) -> io::Result<Result<(), Errno>> {
    match sh.client.statfs(NodeId::ROOT) {
        Ok(st) => {
            writeln!(
                out,
                "bsize={} blocks={} bfree={} files={} namelen={}",
                st.bsize, st.blocks, st.bfree, st.files, st.namelen
            )?;
            Ok(Ok(()))
        }
        Err(errno) => Ok(Err(errno)),
    }
}
