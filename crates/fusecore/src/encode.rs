//! Marshalling of replies into the kernel wire format.

use crate::{
    backend::StatFs,
    node::NodeAttr,
    reply::{AttrOut, DirEntryOut, EntryOut, OpenOut, Reply},
    util::to_raw_time,
};
use fusecore_kernel::{
    fuse_attr, fuse_attr_out, fuse_dirent, fuse_dirent_size, fuse_entry_out, fuse_kstatfs,
    fuse_open_out, fuse_out_header, fuse_statfs_out, fuse_write_out,
};
use std::{mem, os::unix::ffi::OsStrExt as _};
use zerocopy::IntoBytes as _;

/// Return the number of bytes `entry` occupies in a `readdir` reply.
#[inline]
pub fn dirent_size(entry: &DirEntryOut) -> usize {
    fuse_dirent_size(entry.name.as_bytes().len())
}

impl Reply {
    /// Append the wire representation of this reply to `out`.
    ///
    /// A reply to a request without reply (`forget`) writes nothing.
    pub fn encode(&self, unique: u64, out: &mut Vec<u8>) {
        let start = out.len();
        let mut header = fuse_out_header {
            len: 0,
            error: 0,
            unique,
        };
        out.extend_from_slice(header.as_bytes());

        match self {
            Self::None => {
                out.truncate(start);
                return;
            }
            Self::Empty => (),
            Self::Error(errno) => header.error = -errno.code(),
            Self::Entry(entry) => out.extend_from_slice(entry_out(entry).as_bytes()),
            Self::Attr(attr) => out.extend_from_slice(attr_out(attr).as_bytes()),
            Self::Data(data) => out.extend_from_slice(data),
            Self::Open(open) => out.extend_from_slice(open_out(open).as_bytes()),
            Self::Create(entry, open) => {
                out.extend_from_slice(entry_out(entry).as_bytes());
                out.extend_from_slice(open_out(open).as_bytes());
            }
            Self::Write(size) => {
                let write_out = fuse_write_out {
                    size: *size,
                    padding: 0,
                };
                out.extend_from_slice(write_out.as_bytes());
            }
            Self::Dir(entries) => {
                for entry in entries {
                    encode_dirent(entry, out);
                }
            }
            Self::Statfs(st) => out.extend_from_slice(statfs_out(st).as_bytes()),
        }

        header.len = (out.len() - start) as u32;
        out[start..start + mem::size_of::<fuse_out_header>()].copy_from_slice(header.as_bytes());
    }
}

fn encode_dirent(entry: &DirEntryOut, out: &mut Vec<u8>) {
    let name = entry.name.as_bytes();
    let dirent = fuse_dirent {
        ino: entry.id.into_raw(),
        off: entry.offset,
        namelen: name.len() as u32,
        typ: entry.kind.dirent_type(),
        name: [],
    };
    let start = out.len();
    out.extend_from_slice(dirent.as_bytes());
    out.extend_from_slice(name);
    out.resize(start + fuse_dirent_size(name.len()), 0);
}

pub(crate) fn fill_attr(attr: &NodeAttr) -> fuse_attr {
    let (atime, atimensec) = to_raw_time(attr.atime);
    let (mtime, mtimensec) = to_raw_time(attr.mtime);
    let (ctime, ctimensec) = to_raw_time(attr.ctime);
    fuse_attr {
        ino: attr.id.into_raw(),
        size: attr.size,
        blocks: attr.blocks,
        atime,
        mtime,
        ctime,
        atimensec,
        mtimensec,
        ctimensec,
        mode: attr.mode(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn entry_out(entry: &EntryOut) -> fuse_entry_out {
    fuse_entry_out {
        nodeid: entry.attr.id.into_raw(),
        generation: entry.generation,
        entry_valid: entry.entry_ttl.as_secs(),
        attr_valid: entry.attr_ttl.as_secs(),
        entry_valid_nsec: entry.entry_ttl.subsec_nanos(),
        attr_valid_nsec: entry.attr_ttl.subsec_nanos(),
        attr: fill_attr(&entry.attr),
    }
}

fn attr_out(attr: &AttrOut) -> fuse_attr_out {
    fuse_attr_out {
        attr_valid: attr.ttl.as_secs(),
        attr_valid_nsec: attr.ttl.subsec_nanos(),
        dummy: 0,
        attr: fill_attr(&attr.attr),
    }
}

fn open_out(open: &OpenOut) -> fuse_open_out {
    fuse_open_out {
        fh: open.fh.into_raw(),
        open_flags: open.flags,
        padding: 0,
    }
}

fn statfs_out(st: &StatFs) -> fuse_statfs_out {
    fuse_statfs_out {
        st: fuse_kstatfs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
            padding: 0,
            spare: [0; 6],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errno::Errno, handle::Handle, node::NodeId, node::NodeKind};

    #[inline]
    fn bytes(bytes: &[u8]) -> &[u8] {
        bytes
    }
    macro_rules! b {
        ($($b:expr),*$(,)?) => ( *bytes(&[$($b),*]) );
    }

    #[test]
    fn encode_error() {
        let mut buf = vec![];
        Reply::Error(Errno::NotFound).encode(42, &mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf[0..4], b![0x10, 0x00, 0x00, 0x00], "header.len");
        assert_eq!(buf[4..8], (-libc::ENOENT).to_ne_bytes(), "header.error");
        assert_eq!(
            buf[8..16],
            b![0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            "header.unique"
        );
    }

    #[test]
    fn encode_data() {
        let mut buf = vec![];
        Reply::Data(b"hello".to_vec()).encode(26, &mut buf);
        assert_eq!(buf[0..4], b![0x15, 0x00, 0x00, 0x00], "header.len");
        assert_eq!(buf[4..8], b![0x00, 0x00, 0x00, 0x00], "header.error");
        assert_eq!(buf[16..], *b"hello", "payload");
    }

    #[test]
    fn encode_dirents() {
        let entries = vec![
            DirEntryOut {
                name: "hello".into(),
                id: NodeId::from_raw(1),
                kind: NodeKind::File,
                offset: 42,
            },
            DirEntryOut {
                name: "good evening".into(),
                id: NodeId::from_raw(2),
                kind: NodeKind::Directory,
                offset: 43,
            },
        ];
        assert_eq!(dirent_size(&entries[0]), 32);
        assert_eq!(dirent_size(&entries[1]), 40);

        let mut buf = vec![];
        Reply::Dir(entries).encode(1, &mut buf);
        assert_eq!(buf.len(), 16 + 32 + 40);

        let payload = &buf[16..];
        assert_eq!(
            payload[..32],
            b![
                1, 0, 0, 0, 0, 0, 0, 0, // ino
                42, 0, 0, 0, 0, 0, 0, 0, // off
                5, 0, 0, 0, // namelen
                libc::DT_REG, 0, 0, 0, // typ
                104, 101, 108, 108, 111, // name
                0, 0, 0, // padding
            ]
        );
        assert_eq!(
            payload[32..],
            b![
                2, 0, 0, 0, 0, 0, 0, 0, // ino
                43, 0, 0, 0, 0, 0, 0, 0, // off
                12, 0, 0, 0, // namelen
                libc::DT_DIR, 0, 0, 0, // typ
                103, 111, 111, 100, 32, 101, 118, 101, 110, 105, 110, 103, // name
                0, 0, 0, 0, // padding
            ]
        );
    }

    #[test]
    fn encode_open_and_forget() {
        let fh = Handle::from_raw(0x1_0000_0001);
        let mut buf = vec![];
        Reply::Open(OpenOut { fh, flags: 0 }).encode(3, &mut buf);
        assert_eq!(buf.len(), 16 + 16);
        assert_eq!(buf[16..24], 0x1_0000_0001u64.to_ne_bytes());

        let mut buf = vec![0xff];
        Reply::None.encode(4, &mut buf);
        assert_eq!(buf, vec![0xff]);
    }

    #[test]
    fn encode_entry() {
        let attr = NodeAttr::new(NodeId::from_raw(7), NodeKind::File, 0o644, 1, 2);
        let entry = EntryOut {
            attr,
            generation: 0,
            entry_ttl: std::time::Duration::from_millis(1500),
            attr_ttl: std::time::Duration::from_secs(1),
        };
        let mut buf = vec![];
        Reply::Entry(entry).encode(5, &mut buf);
        assert_eq!(buf.len(), 16 + 128);
        assert_eq!(buf[16..24], 7u64.to_ne_bytes(), "nodeid");
        assert_eq!(buf[32..40], 1u64.to_ne_bytes(), "entry_valid");
        assert_eq!(buf[48..52], 500_000_000u32.to_ne_bytes(), "entry_valid_nsec");
    }
}
