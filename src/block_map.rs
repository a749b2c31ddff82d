//! File block index -> device block.
//!
//! zone[0..7] map blocks 0..7 directly, zone[7] is a table of 512 block
//! numbers and zone[8] a table of 512 such tables. A 0 entry is a hole.

use super::*;
use fs::FileSystem;
use inode::Inode;

use log::{debug, warn};

fn read_entry(data: &BlockData, entry: usize) -> BlockNo {
    u16::from_le_bytes([data[entry * 2], data[entry * 2 + 1]]) as BlockNo
}

fn write_entry(data: &mut BlockData, entry: usize, block: BlockNo) {
    data[entry * 2..entry * 2 + 2].copy_from_slice(&(block as u16).to_le_bytes());
}

impl FileSystem {
    /// Device block backing block `index` of `inode`. With `create`, holes
    /// on the way are filled with fresh zeroed blocks; without it a hole is
    /// `None`.
    pub fn resolve(
        &self,
        inode: &mut Inode,
        index: usize,
        create: bool,
    ) -> Result<Option<BlockNo>> {
        if index >= MAX_FILE_BLOCKS {
            panic!("block index {} out of range", index);
        }

        if index < NR_DIRECT {
            return self.map_slot(inode, index, create);
        }

        let index = index - NR_DIRECT;
        if index < NR_INDIRECT {
            let Some(table) = self.map_slot(inode, NR_DIRECT, create)? else {
                return Ok(None);
            };
            return self.map_entry(inode, table, index, create);
        }

        let index = index - NR_INDIRECT;
        let Some(outer) = self.map_slot(inode, NR_DIRECT + 1, create)? else {
            return Ok(None);
        };
        let Some(table) = self.map_entry(inode, outer, index / NR_INDIRECT, create)? else {
            return Ok(None);
        };
        self.map_entry(inode, table, index % NR_INDIRECT, create)
    }

    fn new_zone(&self, inode: &mut Inode) -> Result<BlockNo> {
        let block = self
            .allocate_block()
            .ok_or(FsError::NoSpace(self.dev()))?;
        inode.ctime = current_time();
        inode.dirty = true;
        Ok(block)
    }

    fn map_slot(&self, inode: &mut Inode, slot: usize, create: bool) -> Result<Option<BlockNo>> {
        if inode.zone[slot] == 0 {
            if !create {
                return Ok(None);
            }
            let block = self.new_zone(inode)?;
            inode.zone[slot] = block as u16;
        }
        Ok(Some(inode.zone[slot] as BlockNo))
    }

    fn map_entry(
        &self,
        inode: &mut Inode,
        table: BlockNo,
        entry: usize,
        create: bool,
    ) -> Result<Option<BlockNo>> {
        let bh = self.cache().fetch(self.dev(), table)?;
        let block = bh.read(|data| read_entry(data, entry));
        if block != 0 {
            return Ok(Some(block));
        }
        if !create {
            return Ok(None);
        }
        let block = self.new_zone(inode)?;
        bh.modify(|data| write_entry(data, entry, block));
        bh.mark_dirty();
        Ok(Some(block))
    }

    /// Free every block of `inode`: the direct blocks, then the single
    /// indirect tree, then the double indirect tree, each table after the
    /// blocks it lists. A table that cannot be read is still freed but its
    /// blocks are not; the first such error is returned once the inode has
    /// been emptied. Blocks still referenced elsewhere stay allocated and
    /// are counted in the returned value.
    pub fn release_all(&self, inode: &mut Inode) -> Result<usize> {
        if !inode.has_data_zones() {
            return Ok(0);
        }

        let mut busy = 0;
        let mut result = Ok(());
        for slot in 0..NR_DIRECT {
            if inode.zone[slot] != 0 {
                self.release_block(inode.zone[slot] as BlockNo, &mut busy);
            }
        }
        for (slot, depth) in [(NR_DIRECT, 1), (NR_DIRECT + 1, 2)] {
            if inode.zone[slot] != 0 {
                let table = inode.zone[slot] as BlockNo;
                result = result.and(self.release_table(table, depth, &mut busy));
            }
        }
        if busy > 0 {
            warn!(
                "dev {}: inode {} released with {} busy blocks left allocated",
                self.dev(),
                inode.num,
                busy
            );
        }

        inode.zone = [0; NR_ZONES];
        inode.size = 0;
        inode.mtime = current_time();
        inode.ctime = inode.mtime;
        inode.dirty = true;
        debug!("released blocks of inode {}", inode.num);
        result.map(|()| busy)
    }

    fn release_table(&self, table: BlockNo, depth: u32, busy: &mut usize) -> Result<()> {
        let entries = self.cache().fetch(self.dev(), table).map(|bh| {
            bh.read(|data| {
                (0..NR_INDIRECT)
                    .map(|entry| read_entry(data, entry))
                    .filter(|&block| block != 0)
                    .collect::<Vec<_>>()
            })
        });

        let mut result = Ok(());
        match entries {
            Ok(entries) => {
                for block in entries {
                    if depth > 1 {
                        result = result.and(self.release_table(block, depth - 1, busy));
                    } else {
                        self.release_block(block, busy);
                    }
                }
            }
            Err(err) => {
                warn!(
                    "dev {}: cannot read table {}, its blocks are lost",
                    self.dev(),
                    table
                );
                result = Err(err);
            }
        }
        self.release_block(table, busy);
        result
    }

    /// busy blocks are skipped and counted
    fn release_block(&self, block: BlockNo, busy: &mut usize) {
        if self.free_block(block).is_err() {
            *busy += 1;
        }
    }
}
