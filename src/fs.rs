use super::*;
use bitmap::BitMap;
use block_cache::{BufferCache, BufferHandle, FlushStats};
use disk::SuperBlock;

use log::{debug, info, warn};
use std::sync::Arc;

/// One opened device: its superblock and pinned inode/zone bitmaps.
pub struct FileSystem {
    cache: Arc<BufferCache>,
    dev: DeviceId,
    super_blk: SuperBlock,
    imap: BitMap,
    zmap: BitMap,
}

impl FileSystem {
    pub fn open(cache: Arc<BufferCache>, dev: DeviceId) -> Result<Self> {
        if cache.device(dev).is_none() {
            return Err(FsError::NoDevice(dev));
        }
        let bh = cache.fetch(dev, SUPER_BLOCK)?;
        let super_blk = bh.read(SuperBlock::decode)?;
        drop(bh);
        if !super_blk.is_sane() {
            return Err(FsError::BadSuperBlock(dev));
        }
        let pinned = (super_blk.imap_blocks + super_blk.zmap_blocks) as usize;
        if cache.nr_buffers() < pinned + WORK_BUFFERS {
            return Err(FsError::Geometry(format!(
                "{} buffers cannot hold {} bitmap blocks of dev {}",
                cache.nr_buffers(),
                pinned,
                dev
            )));
        }

        let pin = |start: BlockNo, count: u16| -> Result<Vec<BufferHandle>> {
            (start..start + count as BlockNo)
                .map(|block| cache.fetch(dev, block))
                .collect()
        };
        let imap = BitMap::new(
            pin(super_blk.imap_start(), super_blk.imap_blocks)?,
            0,
            super_blk.ninodes as u32 + 1,
        );
        let zmap = BitMap::new(
            pin(super_blk.zmap_start(), super_blk.zmap_blocks)?,
            super_blk.firstdatazone as u32 - 1,
            super_blk.nzones as u32,
        );
        info!(
            "dev {}: {} inodes, {} zones, first data zone {}",
            dev, super_blk.ninodes, super_blk.nzones, super_blk.firstdatazone
        );

        Ok(FileSystem {
            cache,
            dev,
            super_blk,
            imap,
            zmap,
        })
    }

    /// Unpin the bitmaps and write back the device.
    pub fn close(self) -> FlushStats {
        let FileSystem {
            cache, imap, zmap, dev, ..
        } = self;
        drop((imap, zmap));
        cache.flush(dev)
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn super_blk(&self) -> &SuperBlock {
        &self.super_blk
    }

    /// Take the lowest free zone and hand it out zeroed.
    pub fn allocate_block(&self) -> Option<BlockNo> {
        let block = self.zmap.alloc()?;
        let bh = self.cache.fetch_uninitialized(self.dev, block);
        bh.zero();
        debug!("dev {}: new block {}", self.dev, block);
        Some(block)
    }

    /// Drop any cached copy of `block`, then clear its bit. A block that is
    /// still referenced elsewhere is reported and left allocated.
    pub fn free_block(&self, block: BlockNo) -> Result<()> {
        let sb = &self.super_blk;
        if block < sb.firstdatazone as BlockNo || block >= sb.nzones as BlockNo {
            panic!("trying to free block {} not in datazone", block);
        }
        if let Some(bh) = self.cache.lookup(self.dev, block) {
            let count = bh.ref_count();
            if count != 1 {
                warn!(
                    "trying to free block ({}:{}), count={}",
                    self.dev, block, count
                );
                return Err(FsError::BlockBusy {
                    dev: self.dev,
                    block,
                    count,
                });
            }
            bh.discard();
        }
        self.zmap.free(block);
        debug!("dev {}: free block {}", self.dev, block);
        Ok(())
    }

    pub fn allocate_inode(&self) -> Option<InodeNo> {
        let ino = self.imap.alloc()?;
        debug!("dev {}: new inode {}", self.dev, ino);
        Some(ino)
    }

    pub fn free_inode(&self, ino: InodeNo) {
        if ino < 1 || ino > self.super_blk.ninodes as InodeNo {
            panic!("trying to free inode 0 or nonexistent inode {}", ino);
        }
        self.imap.free(ino);
        debug!("dev {}: free inode {}", self.dev, ino);
    }

    pub fn is_block_allocated(&self, block: BlockNo) -> bool {
        self.zmap.is_set(block)
    }

    pub fn is_inode_allocated(&self, ino: InodeNo) -> bool {
        self.imap.is_set(ino)
    }

    pub fn free_blocks(&self) -> usize {
        self.zmap.count_free()
    }

    pub fn free_inodes(&self) -> usize {
        self.imap.count_free()
    }
}
