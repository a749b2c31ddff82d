use super::*;
use disk::DiskInode;
use fs::FileSystem;

use log::debug;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

/// inode in memory
#[derive(Clone, Debug, Default)]
pub struct Inode {
    pub dev: DeviceId,
    /// Inode number
    pub num: InodeNo,
    pub mode: u16,
    pub uid: u16,
    /// Size of file (bytes)
    pub size: u32,
    pub mtime: u32,
    /// not on disk
    pub atime: u32,
    /// not on disk
    pub ctime: u32,
    pub gid: u8,
    pub nlinks: u8,
    pub zone: [u16; NR_ZONES],
    /// differs from the inode table
    pub dirty: bool,
}

impl Inode {
    /// A fresh, empty inode; the caller owns the number.
    pub fn new(dev: DeviceId, num: InodeNo, mode: u16) -> Self {
        let now = current_time();
        Inode {
            dev,
            num,
            mode,
            nlinks: 1,
            mtime: now,
            atime: now,
            ctime: now,
            dirty: true,
            ..Default::default()
        }
    }

    fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    pub fn is_reg(&self) -> bool {
        self.file_type() == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_chr(&self) -> bool {
        self.file_type() == S_IFCHR
    }

    pub fn is_blk(&self) -> bool {
        self.file_type() == S_IFBLK
    }

    pub fn is_fifo(&self) -> bool {
        self.file_type() == S_IFIFO
    }

    /// zone slots hold block numbers
    pub fn has_data_zones(&self) -> bool {
        !(self.is_chr() || self.is_blk() || self.is_fifo())
    }

    fn to_disk(&self) -> DiskInode {
        DiskInode {
            mode: self.mode,
            uid: self.uid,
            size: self.size,
            mtime: self.mtime,
            gid: self.gid,
            nlinks: self.nlinks,
            zone: self.zone,
        }
    }
}

impl FileSystem {
    fn check_ino(&self, num: InodeNo) {
        if num < 1 || num > self.super_blk().ninodes as InodeNo {
            panic!("inode {} out of range on dev {}", num, self.dev());
        }
    }

    pub fn read_inode(&self, num: InodeNo) -> Result<Inode> {
        self.check_ino(num);
        let bh = self.cache().fetch(self.dev(), self.super_blk().iblock(num))?;
        let dinode = bh.read(|data| DiskInode::read_from(data, num))?;
        Ok(Inode {
            dev: self.dev(),
            num,
            mode: dinode.mode,
            uid: dinode.uid,
            size: dinode.size,
            mtime: dinode.mtime,
            atime: dinode.mtime,
            ctime: dinode.mtime,
            gid: dinode.gid,
            nlinks: dinode.nlinks,
            zone: dinode.zone,
            dirty: false,
        })
    }

    /// Copy `inode` into its inode table block and mark the block dirty.
    pub fn write_inode(&self, inode: &mut Inode) -> Result<()> {
        self.check_ino(inode.num);
        let bh = self
            .cache()
            .fetch(self.dev(), self.super_blk().iblock(inode.num))?;
        let dinode = inode.to_disk();
        bh.modify(|data| dinode.write_to(data, inode.num))?;
        bh.mark_dirty();
        inode.dirty = false;
        debug!("write inode {} of dev {}", inode.num, self.dev());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_cache::BufferCache;
    use block_device::MemDisk;
    use disk::mkfs;
    use fs::tests::{init_log, new_fs};

    use std::sync::Arc;

    #[test]
    fn file_types() {
        let file = Inode::new(1, 2, S_IFREG | 0o644);
        assert!(file.is_reg() && file.has_data_zones());
        assert!(Inode::new(1, 3, S_IFDIR | 0o755).is_dir());
        for mode in [S_IFCHR, S_IFBLK, S_IFIFO] {
            assert!(!Inode::new(1, 4, mode).has_data_zones());
        }
    }

    #[test]
    fn written_inode_reads_back() {
        let fs = new_fs(16, 64, 300);
        let mut inode = Inode::new(1, 40, S_IFREG | 0o600);
        inode.size = 4096;
        inode.zone[0] = 123;
        inode.zone[8] = 250;
        fs.write_inode(&mut inode).unwrap();
        assert!(!inode.dirty);

        let back = fs.read_inode(40).unwrap();
        assert_eq!((back.mode, back.size, back.nlinks), (inode.mode, 4096, 1));
        assert_eq!(back.zone, inode.zone);
        assert_eq!(back.mtime, inode.mtime);
        assert!(!back.dirty);
        assert_eq!(fs.read_inode(39).unwrap().mode, 0);
    }

    #[test]
    fn inode_survives_close() {
        init_log();
        let disk = Arc::new(MemDisk::new(100));
        mkfs(disk.as_ref(), 32, 100).unwrap();
        let cache = BufferCache::new(8);
        cache.register_device(1, disk);

        let fs = FileSystem::open(Arc::clone(&cache), 1).unwrap();
        let mut inode = Inode::new(1, ROOT_INO, S_IFDIR | 0o755);
        fs.write_inode(&mut inode).unwrap();
        fs.close();
        cache.invalidate(1);

        let fs = FileSystem::open(cache, 1).unwrap();
        assert!(fs.read_inode(ROOT_INO).unwrap().is_dir());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn inode_past_the_table_is_fatal() {
        let fs = new_fs(16, 64, 300);
        let _ = fs.read_inode(65);
    }
}
