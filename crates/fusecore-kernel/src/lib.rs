//! FUSE protocol vocabulary for `fusecore`.
//!
//! Only the subset of the kernel ABI (7.31 and later) that the driver core
//! replies with is described here: opcodes, error codes, request flag
//! bitmasks and the reply payload layouts.

#![allow(nonstandard_style, clippy::identity_op)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The major version number of FUSE protocol.
pub const FUSE_KERNEL_VERSION: u32 = 7;

/// The minor version number of FUSE protocol.
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

/// The inode number of the root directory.
pub const FUSE_ROOT_ID: u64 = 1;

// Bitmasks for fuse_setattr_in.valid
pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;
pub const FATTR_ATIME: u32 = 1 << 4;
pub const FATTR_MTIME: u32 = 1 << 5;
pub const FATTR_FH: u32 = 1 << 6;
pub const FATTR_ATIME_NOW: u32 = 1 << 7;
pub const FATTR_MTIME_NOW: u32 = 1 << 8;
pub const FATTR_LOCKOWNER: u32 = 1 << 9;
pub const FATTR_CTIME: u32 = 1 << 10;

// Flags returned by the OPEN request.
pub const FOPEN_DIRECT_IO: u32 = 1 << 0;
pub const FOPEN_KEEP_CACHE: u32 = 1 << 1;
pub const FOPEN_NONSEEKABLE: u32 = 1 << 2;
pub const FOPEN_CACHE_DIR: u32 = 1 << 3;

// Flags for RENAME2.
pub const RENAME_NOREPLACE: u32 = 1 << 0;
pub const RENAME_EXCHANGE: u32 = 1 << 1;
pub const RENAME_WHITEOUT: u32 = 1 << 2;

// Error codes carried in fuse_out_header.error (negated on the wire).
pub const ENOENT: i32 = libc::ENOENT;
pub const EACCES: i32 = libc::EACCES;
pub const EBADF: i32 = libc::EBADF;
pub const EEXIST: i32 = libc::EEXIST;
pub const ENOTEMPTY: i32 = libc::ENOTEMPTY;
pub const EIO: i32 = libc::EIO;
pub const EROFS: i32 = libc::EROFS;
pub const EINTR: i32 = libc::EINTR;
pub const ENOTDIR: i32 = libc::ENOTDIR;
pub const EISDIR: i32 = libc::EISDIR;
pub const EINVAL: i32 = libc::EINVAL;
pub const ENAMETOOLONG: i32 = libc::ENAMETOOLONG;
pub const ENOSPC: i32 = libc::ENOSPC;
pub const EFBIG: i32 = libc::EFBIG;
pub const EXDEV: i32 = libc::EXDEV;
pub const ENOSYS: i32 = libc::ENOSYS;

/// The size of the fixed part of `fuse_dirent`.
pub const FUSE_NAME_OFFSET: usize = std::mem::size_of::<fuse_dirent>();

/// Return the size of a `fuse_dirent` record carrying a name of `namelen` bytes,
/// including the padding up to the 8-byte record alignment.
#[inline]
pub const fn fuse_dirent_size(namelen: usize) -> usize {
    let unaligned = FUSE_NAME_OFFSET + namelen;
    (unaligned + 7) & !7
}

macro_rules! define_opcode {
    ($(
        $(#[$m:meta])*
        $VARIANT:ident = $val:expr,
    )*) => {
        $(
            #[doc(hidden)]
            pub const $VARIANT: u32 = $val;
        )*

        #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, IntoBytes, Immutable)]
        #[repr(u32)]
        pub enum fuse_opcode {
            $(
                $(#[$m])*
                $VARIANT = $val,
            )*
        }

        impl TryFrom<u32> for fuse_opcode {
            type Error = UnknownOpcode;

            fn try_from(opcode: u32) -> Result<Self, Self::Error> {
                match opcode {
                    $(
                        opcode if opcode == $val => Ok(Self::$VARIANT),
                    )*
                    opcode => Err(UnknownOpcode(opcode)),
                }
            }
        }
    };
}

define_opcode! {
    FUSE_LOOKUP = 1,
    FUSE_FORGET = 2,
    FUSE_GETATTR = 3,
    FUSE_SETATTR = 4,
    FUSE_READLINK = 5,
    FUSE_SYMLINK = 6,
    // _ = 7,
    FUSE_MKNOD = 8,
    FUSE_MKDIR = 9,
    FUSE_UNLINK = 10,
    FUSE_RMDIR = 11,
    FUSE_RENAME = 12,
    FUSE_LINK = 13,
    FUSE_OPEN = 14,
    FUSE_READ = 15,
    FUSE_WRITE = 16,
    FUSE_STATFS = 17,
    FUSE_RELEASE = 18,
    // _ = 19,
    FUSE_FSYNC = 20,
    FUSE_FLUSH = 25,
    FUSE_INIT = 26,
    FUSE_OPENDIR = 27,
    FUSE_READDIR = 28,
    FUSE_RELEASEDIR = 29,
    FUSE_FSYNCDIR = 30,
    FUSE_ACCESS = 34,
    FUSE_CREATE = 35,
    FUSE_INTERRUPT = 36,
    FUSE_DESTROY = 38,
    FUSE_RENAME2 = 45,
}

/// The error value returned when converting an unsupported opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownOpcode(pub u32);

impl std::fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown opcode: {}", self.0)
    }
}

impl std::error::Error for UnknownOpcode {}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_in_header {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub total_extlen: u16,
    pub padding: u16,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_out_header {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_entry_out {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: fuse_attr,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_attr_out {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: fuse_attr,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_open_out {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_write_out {
    pub size: u32,
    pub padding: u32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_kstatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub padding: u32,
    pub spare: [u32; 6usize],
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_statfs_out {
    pub st: fuse_kstatfs,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct fuse_dirent {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub typ: u32,
    pub name: [u8; 0],
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<fuse_in_header>(), 40);
        assert_eq!(size_of::<fuse_out_header>(), 16);
        assert_eq!(size_of::<fuse_attr>(), 88);
        assert_eq!(size_of::<fuse_entry_out>(), 128);
        assert_eq!(size_of::<fuse_attr_out>(), 104);
        assert_eq!(size_of::<fuse_open_out>(), 16);
        assert_eq!(size_of::<fuse_write_out>(), 8);
        assert_eq!(size_of::<fuse_statfs_out>(), 80);
        assert_eq!(size_of::<fuse_dirent>(), 24);
    }

    #[test]
    fn dirent_size_is_aligned() {
        assert_eq!(fuse_dirent_size(0), 24);
        assert_eq!(fuse_dirent_size(1), 32);
        assert_eq!(fuse_dirent_size(5), 32);
        assert_eq!(fuse_dirent_size(8), 32);
        assert_eq!(fuse_dirent_size(9), 40);
        assert_eq!(fuse_dirent_size(12), 40);
    }

    #[test]
    fn opcode_conversion() {
        assert_eq!(fuse_opcode::try_from(1), Ok(fuse_opcode::FUSE_LOOKUP));
        assert_eq!(fuse_opcode::try_from(35), Ok(fuse_opcode::FUSE_CREATE));
        assert_eq!(fuse_opcode::try_from(7), Err(UnknownOpcode(7)));
        assert_eq!(fuse_opcode::FUSE_RENAME2 as u32, FUSE_RENAME2);
    }
}
