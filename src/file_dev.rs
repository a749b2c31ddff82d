use super::*;
use fs::FileSystem;
use inode::Inode;

use log::warn;

const MAX_FILE_BYTES: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

impl FileSystem {
    /// Read from `inode` at byte `pos` into `buf`, up to the file size.
    /// Holes read as zeros. Returns the bytes read; an error after some
    /// bytes were read ends the read short instead.
    pub fn read_at(&self, inode: &mut Inode, pos: usize, buf: &mut [u8]) -> Result<usize> {
        let end = (inode.size as usize).min(MAX_FILE_BYTES);
        if pos >= end {
            return Ok(0);
        }
        let len = buf.len().min(end - pos);
        let mut done = 0;

        while done < len {
            let at = pos + done;
            let offset = at % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - offset).min(len - done);
            let dst = &mut buf[done..done + chunk];

            let step = self.resolve(inode, at / BLOCK_SIZE, false).and_then(|block| {
                match block {
                    Some(block) => {
                        let bh = self.cache().fetch(self.dev(), block)?;
                        bh.read(|data| dst.copy_from_slice(&data[offset..offset + chunk]));
                    }
                    None => dst.fill(0),
                }
                Ok(())
            });
            if let Err(err) = step {
                if done == 0 {
                    return Err(err);
                }
                warn!("read of inode {} stopped at {}: {}", inode.num, at, err);
                break;
            }
            done += chunk;
        }

        inode.atime = current_time();
        Ok(done)
    }

    /// Write `data` to `inode` at byte `pos`, allocating blocks as needed
    /// and growing the file. Returns the bytes written; running out of
    /// space or range after some bytes were written ends the write short.
    pub fn write_at(&self, inode: &mut Inode, pos: usize, data: &[u8]) -> Result<usize> {
        let mut done = 0;

        while done < data.len() {
            let at = pos + done;
            let offset = at % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - offset).min(data.len() - done);
            let src = &data[done..done + chunk];

            let step = if at / BLOCK_SIZE >= MAX_FILE_BLOCKS {
                Err(FsError::FileTooBig)
            } else {
                self.write_block_part(inode, at / BLOCK_SIZE, offset, src)
            };
            if let Err(err) = step {
                if done == 0 {
                    return Err(err);
                }
                warn!("write to inode {} stopped at {}: {}", inode.num, at, err);
                break;
            }

            done += chunk;
            if at + chunk > inode.size as usize {
                inode.size = (at + chunk) as u32;
                inode.dirty = true;
            }
        }

        if done > 0 {
            inode.mtime = current_time();
            inode.ctime = inode.mtime;
            inode.dirty = true;
        }
        Ok(done)
    }

    fn write_block_part(
        &self,
        inode: &mut Inode,
        index: usize,
        offset: usize,
        src: &[u8],
    ) -> Result<()> {
        let Some(block) = self.resolve(inode, index, true)? else {
            return Err(FsError::NoSpace(self.dev()));
        };
        let bh = if src.len() == BLOCK_SIZE {
            let bh = self.cache().fetch_uninitialized(self.dev(), block);
            bh.modify(|data| data.copy_from_slice(src));
            bh.set_valid();
            bh
        } else {
            let bh = self.cache().fetch(self.dev(), block)?;
            bh.modify(|data| data[offset..offset + src.len()].copy_from_slice(src));
            bh
        };
        bh.mark_dirty();
        Ok(())
    }
}
