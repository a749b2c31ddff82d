use super::*;

use std::any::Any;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// The lower block-device layer. Transfers are always whole blocks of
/// `BLOCK_SIZE` bytes.
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, blockno: BlockNo, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, blockno: BlockNo, buf: &[u8]) -> io::Result<()>;
    /// # of blocks on the device
    fn block_count(&self) -> usize;
}

fn out_of_range(blockno: BlockNo) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("block {} beyond end of device", blockno),
    )
}

/// ram disk
pub struct MemDisk {
    blocks: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![0; nblocks * BLOCK_SIZE]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// # of block reads served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// # of block writes served so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: BlockNo, buf: &mut [u8]) -> io::Result<()> {
        let blocks = self.blocks.lock().unwrap();
        let start = blockno as usize * BLOCK_SIZE;
        let src = blocks
            .get(start..start + BLOCK_SIZE)
            .ok_or_else(|| out_of_range(blockno))?;
        buf[..BLOCK_SIZE].copy_from_slice(src);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, blockno: BlockNo, buf: &[u8]) -> io::Result<()> {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blockno as usize * BLOCK_SIZE;
        let dst = blocks
            .get_mut(start..start + BLOCK_SIZE)
            .ok_or_else(|| out_of_range(blockno))?;
        dst.copy_from_slice(&buf[..BLOCK_SIZE]);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len() / BLOCK_SIZE
    }
}

/// disk image in a host file
pub struct FileDisk {
    file: File,
    nblocks: usize,
}

impl FileDisk {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let nblocks = file.metadata()?.len() as usize / BLOCK_SIZE;
        Ok(Self { file, nblocks })
    }

    /// create (or truncate) an image of `nblocks` zeroed blocks
    pub fn create<P: AsRef<Path>>(path: P, nblocks: usize) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((nblocks * BLOCK_SIZE) as u64)?;
        Ok(Self { file, nblocks })
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: BlockNo, buf: &mut [u8]) -> io::Result<()> {
        if blockno as usize >= self.nblocks {
            return Err(out_of_range(blockno));
        }
        self.file
            .read_exact_at(&mut buf[..BLOCK_SIZE], blockno as u64 * BLOCK_SIZE as u64)
    }

    fn write_block(&self, blockno: BlockNo, buf: &[u8]) -> io::Result<()> {
        if blockno as usize >= self.nblocks {
            return Err(out_of_range(blockno));
        }
        self.file
            .write_all_at(&buf[..BLOCK_SIZE], blockno as u64 * BLOCK_SIZE as u64)
    }

    fn block_count(&self) -> usize {
        self.nblocks
    }
}
