use super::*;
use disk::DiskInode;

/// device number, 0 means "no device"
pub type DeviceId = u16;

/// block (zone) number on a device
pub type BlockNo = u32;

/// inode number, 1-based
pub type InodeNo = u32;

/// block size
pub const BLOCK_SIZE: usize = 1024;

pub type BlockData = [u8; BLOCK_SIZE];

/// bits per bitmap block
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// inode bitmap blocks a device may have
pub const I_MAP_SLOTS: usize = 8;

/// zone bitmap blocks a device may have
pub const Z_MAP_SLOTS: usize = 8;

pub const SUPER_MAGIC: u16 = 0x137F;

/// block holding the superblock
pub const SUPER_BLOCK: BlockNo = 1;

pub const ROOT_INO: InodeNo = 1;

/// zone slots per inode
pub const NR_ZONES: usize = 9;

/// direct blocks in inode
pub const NR_DIRECT: usize = 7;

/// block numbers per indirect block
pub const NR_INDIRECT: usize = BLOCK_SIZE / size_of::<u16>();

/// max # of blocks a file can address
pub const MAX_FILE_BLOCKS: usize = NR_DIRECT + NR_INDIRECT + NR_INDIRECT * NR_INDIRECT;

/// buffers a mounted device needs besides its pinned bitmaps: an inode
/// block, two levels of tables and a data block
pub const WORK_BUFFERS: usize = 4;

/// on-disk inode record size
pub const INODE_SIZE: usize = DiskInode::SIZE;

/// inodes per block
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

pub(crate) fn current_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
