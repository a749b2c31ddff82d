//! Storage core of a Minix v1 file system: a shared buffer cache over
//! block devices, bitmap allocation of zones and inodes, and the
//! direct/indirect/double indirect block map of an inode.

mod bitmap; // first-fit bitmaps over cached blocks
mod block_cache; // Cache for block devices
mod block_dev; // raw device byte I/O
mod block_device;
mod block_map; // file block -> device block
mod buf;
mod common;
mod disk; // on-disk records, mkfs
mod error;
mod file_dev; // file byte I/O
mod fs; // file system
mod inode;
mod request; // I/O requests

pub use bitmap::BitMap;
pub use block_cache::{BufferCache, BufferHandle, FlushStats};
pub use block_device::{BlockDevice, FileDisk, MemDisk};
pub use common::*;
pub use disk::{mkfs, DiskInode, SuperBlock};
pub use error::{FsError, Result};
pub use fs::FileSystem;
pub use inode::{Inode, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFMT, S_IFREG};
