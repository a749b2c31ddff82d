use super::*;
use block_cache::BufferCache;

use std::sync::Arc;

/// blocks read ahead of a raw device read
const READ_AHEAD: BlockNo = 2;

impl BufferCache {
    fn blocks_of(&self, dev: DeviceId) -> Result<usize> {
        self.device(dev)
            .map(|device| device.block_count())
            .ok_or(FsError::NoDevice(dev))
    }

    /// block holding byte `pos`, `None` past the end of the device
    fn block_at(pos: u64, nblocks: usize) -> Option<BlockNo> {
        let block = pos / BLOCK_SIZE as u64;
        if block >= nblocks as u64 {
            return None;
        }
        BlockNo::try_from(block).ok()
    }

    fn ahead_of(block: BlockNo, nblocks: usize) -> Vec<BlockNo> {
        (block + 1..=block + READ_AHEAD)
            .filter(|&b| (b as usize) < nblocks)
            .collect()
    }

    /// Read raw bytes of `dev` at byte `pos`, stopping at the end of the
    /// device.
    pub fn block_read(self: &Arc<Self>, dev: DeviceId, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let nblocks = self.blocks_of(dev)?;
        let mut done = 0;
        while done < buf.len() {
            let at = pos + done as u64;
            let Some(block) = Self::block_at(at, nblocks) else {
                break;
            };
            let offset = (at % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - offset).min(buf.len() - done);

            let bh = match self.fetch_ahead(dev, block, &Self::ahead_of(block, nblocks)) {
                Ok(bh) => bh,
                Err(err) if done == 0 => return Err(err),
                Err(_) => break,
            };
            bh.read(|data| buf[done..done + chunk].copy_from_slice(&data[offset..offset + chunk]));
            done += chunk;
        }
        Ok(done)
    }

    /// Write raw bytes to `dev` at byte `pos`. Whole blocks are not read
    /// first. A write starting at or past the end of the device fails with
    /// `NoSpace`; one crossing the end is cut short.
    pub fn block_write(self: &Arc<Self>, dev: DeviceId, pos: u64, data: &[u8]) -> Result<usize> {
        let nblocks = self.blocks_of(dev)?;
        let mut done = 0;
        while done < data.len() {
            let at = pos + done as u64;
            let Some(block) = Self::block_at(at, nblocks) else {
                if done == 0 {
                    return Err(FsError::NoSpace(dev));
                }
                break;
            };
            let offset = (at % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - offset).min(data.len() - done);
            let src = &data[done..done + chunk];

            let bh = if chunk == BLOCK_SIZE {
                let bh = self.fetch_uninitialized(dev, block);
                bh.modify(|data| data.copy_from_slice(src));
                bh.set_valid();
                bh
            } else {
                match self.fetch_ahead(dev, block, &Self::ahead_of(block, nblocks)) {
                    Ok(bh) => {
                        bh.modify(|data| data[offset..offset + chunk].copy_from_slice(src));
                        bh
                    }
                    Err(err) if done == 0 => return Err(err),
                    Err(_) => break,
                }
            };
            bh.mark_dirty();
            done += chunk;
        }
        Ok(done)
    }
}
