//! Disk layout:
//! [ boot block | super block | inode bit map | zone bit map | inode blocks | data zones ]
//! the data zones start at `firstdatazone`.

use super::*;
use bitmap::set_bit;
use block_device::BlockDevice;

use log::info;
use serde::{Deserialize, Serialize};

#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    /// Number of inodes
    pub ninodes: u16,
    /// Size of file system image (zones)
    pub nzones: u16,
    /// Number of inode bit map blocks
    pub imap_blocks: u16,
    /// Number of zone bit map blocks
    pub zmap_blocks: u16,
    /// Zone number of first data zone
    pub firstdatazone: u16,
    pub log_zone_size: u16,
    /// Max file size (bytes)
    pub max_size: u32,
    /// Must be SUPER_MAGIC
    pub magic: u16,
}

impl SuperBlock {
    pub fn decode(data: &BlockData) -> Result<Self> {
        Ok(bincode::deserialize(&data[..])?)
    }

    pub fn encode(&self, data: &mut BlockData) -> Result<()> {
        bincode::serialize_into(&mut data[..], self)?;
        Ok(())
    }

    pub fn is_sane(&self) -> bool {
        self.magic == SUPER_MAGIC
            && self.imap_blocks as usize <= I_MAP_SLOTS
            && self.zmap_blocks as usize <= Z_MAP_SLOTS
            && self.firstdatazone as u32 == self.inode_start() + self.inode_blocks()
            && self.firstdatazone < self.nzones
    }

    pub fn imap_start(&self) -> BlockNo {
        SUPER_BLOCK + 1
    }

    pub fn zmap_start(&self) -> BlockNo {
        self.imap_start() + self.imap_blocks as BlockNo
    }

    pub fn inode_start(&self) -> BlockNo {
        self.zmap_start() + self.zmap_blocks as BlockNo
    }

    pub fn inode_blocks(&self) -> BlockNo {
        (self.ninodes as usize).div_ceil(INODES_PER_BLOCK) as BlockNo
    }

    /// block holding inode `ino`
    pub fn iblock(&self, ino: InodeNo) -> BlockNo {
        self.inode_start() + (ino - 1) / INODES_PER_BLOCK as BlockNo
    }
}

/// inode on disk
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    /// Size of file (bytes)
    pub size: u32,
    pub mtime: u32,
    pub gid: u8,
    pub nlinks: u8,
    /// Zone numbers: 7 direct, single indirect, double indirect
    pub zone: [u16; NR_ZONES],
}

impl DiskInode {
    pub const SIZE: usize = 32;

    /// `ino`'s record within its inode block
    pub fn read_from(data: &BlockData, ino: InodeNo) -> Result<Self> {
        let offset = Self::offset(ino);
        Ok(bincode::deserialize(&data[offset..offset + Self::SIZE])?)
    }

    pub fn write_to(&self, data: &mut BlockData, ino: InodeNo) -> Result<()> {
        let offset = Self::offset(ino);
        bincode::serialize_into(&mut data[offset..offset + Self::SIZE], self)?;
        Ok(())
    }

    fn offset(ino: InodeNo) -> usize {
        ((ino as usize - 1) % INODES_PER_BLOCK) * Self::SIZE
    }
}

/// Lay out an empty file system of `nzones` blocks with `ninodes` inodes on
/// `device`. Bit 0 of both maps and every bit past the last inode or zone
/// are set so they are never allocated.
pub fn mkfs(device: &dyn BlockDevice, ninodes: u16, nzones: u16) -> Result<SuperBlock> {
    if ninodes == 0 || device.block_count() < nzones as usize {
        return Err(FsError::Geometry(format!(
            "{} inodes on {} zones, device has {} blocks",
            ninodes,
            nzones,
            device.block_count()
        )));
    }
    let mut sb = SuperBlock {
        ninodes,
        nzones,
        imap_blocks: (ninodes as usize + 1).div_ceil(BITS_PER_BLOCK) as u16,
        zmap_blocks: 1,
        firstdatazone: 0,
        log_zone_size: 0,
        max_size: (MAX_FILE_BLOCKS * BLOCK_SIZE) as u32,
        magic: SUPER_MAGIC,
    };
    loop {
        let first = sb.inode_start() + sb.inode_blocks();
        let zones = (nzones as usize).saturating_sub(first as usize) + 1;
        let needed = zones.div_ceil(BITS_PER_BLOCK) as u16;
        sb.firstdatazone = first as u16;
        if needed <= sb.zmap_blocks {
            break;
        }
        sb.zmap_blocks = needed;
    }
    if !sb.is_sane() {
        return Err(FsError::Geometry(format!("cannot lay out {:?}", sb)));
    }

    let zero = [0u8; BLOCK_SIZE];
    for block in 0..sb.firstdatazone as BlockNo {
        device.write_block(block, &zero)?;
    }

    let mut data = [0u8; BLOCK_SIZE];
    sb.encode(&mut data)?;
    device.write_block(SUPER_BLOCK, &data)?;

    // inode ordinal n is inode n
    write_map(device, sb.imap_start(), sb.imap_blocks, |ordinal| {
        ordinal == 0 || ordinal > ninodes as usize
    })?;
    // zone ordinal n is zone firstdatazone - 1 + n
    let base = sb.firstdatazone as usize - 1;
    write_map(device, sb.zmap_start(), sb.zmap_blocks, |ordinal| {
        ordinal == 0 || base + ordinal >= nzones as usize
    })?;

    info!(
        "mkfs: {} inodes, {} zones, first data zone {}",
        ninodes, nzones, sb.firstdatazone
    );
    Ok(sb)
}

fn write_map(
    device: &dyn BlockDevice,
    start: BlockNo,
    blocks: u16,
    reserved: impl Fn(usize) -> bool,
) -> Result<()> {
    for slot in 0..blocks as usize {
        let mut data = [0u8; BLOCK_SIZE];
        for bit in 0..BITS_PER_BLOCK {
            if reserved(slot * BITS_PER_BLOCK + bit) {
                set_bit(&mut data, bit);
            }
        }
        device.write_block(start + slot as BlockNo, &data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmap::test_bit;
    use block_device::MemDisk;

    #[test]
    fn records_have_on_disk_sizes() {
        assert_eq!(
            bincode::serialized_size(&DiskInode::default()).unwrap(),
            DiskInode::SIZE as u64
        );
        assert_eq!(bincode::serialized_size(&SuperBlock::default()).unwrap(), 18);
        assert_eq!(INODES_PER_BLOCK, 32);
    }

    #[test]
    fn superblock_survives_a_block() {
        let sb = SuperBlock {
            ninodes: 64,
            nzones: 360,
            imap_blocks: 1,
            zmap_blocks: 1,
            firstdatazone: 6,
            log_zone_size: 0,
            max_size: 7,
            magic: SUPER_MAGIC,
        };
        let mut data = [0u8; BLOCK_SIZE];
        sb.encode(&mut data).unwrap();
        assert_eq!(&data[..2], &64u16.to_le_bytes());
        assert_eq!(SuperBlock::decode(&data).unwrap(), sb);
    }

    #[test]
    fn inode_records_pack_32_per_block() {
        let mut data = [0u8; BLOCK_SIZE];
        let mut dinode = DiskInode {
            mode: 0o100644,
            size: 3000,
            nlinks: 1,
            ..Default::default()
        };
        dinode.zone[8] = 0x1234;
        dinode.write_to(&mut data, 34).unwrap();
        assert_eq!(&data[32 + 30..32 + 32], &0x1234u16.to_le_bytes());
        assert_eq!(DiskInode::read_from(&data, 34).unwrap(), dinode);
        assert_eq!(DiskInode::read_from(&data, 33).unwrap(), DiskInode::default());
    }

    #[test]
    fn mkfs_lays_out_maps_and_reserves_tail_bits() {
        let disk = MemDisk::new(360);
        let sb = mkfs(&disk, 100, 360).unwrap();
        assert_eq!((sb.imap_blocks, sb.zmap_blocks), (1, 1));
        // 2 + 1 + 1 + ceil(100 / 32)
        assert_eq!(sb.firstdatazone, 8);
        assert_eq!(sb.iblock(1), 4);
        assert_eq!(sb.iblock(33), 5);

        let mut data = [0u8; BLOCK_SIZE];
        disk.read_block(SUPER_BLOCK, &mut data).unwrap();
        assert_eq!(SuperBlock::decode(&data).unwrap(), sb);

        disk.read_block(sb.imap_start(), &mut data).unwrap();
        assert!(test_bit(&data, 0));
        assert!(!test_bit(&data, 1) && !test_bit(&data, 100));
        assert!(test_bit(&data, 101) && test_bit(&data, BITS_PER_BLOCK - 1));

        disk.read_block(sb.zmap_start(), &mut data).unwrap();
        let last = 360 - 8; // ordinal of zone 359
        assert!(test_bit(&data, 0));
        assert!(!test_bit(&data, 1) && !test_bit(&data, last));
        assert!(test_bit(&data, last + 1));
    }

    #[test]
    fn mkfs_rejects_devices_smaller_than_the_zone_count() {
        let disk = MemDisk::new(10);
        assert!(matches!(mkfs(&disk, 16, 100), Err(FsError::Geometry(_))));
    }

    #[test]
    fn large_fs_uses_several_zone_map_blocks() {
        let disk = MemDisk::new(40000);
        let sb = mkfs(&disk, 1000, 40000).unwrap();
        assert_eq!(sb.zmap_blocks, 5);
        assert!(sb.is_sane());
    }
}
