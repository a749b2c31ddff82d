//! Buffer cache.
//!
//! A fixed pool of block buffers, each caching one `(dev, blockno)`.
//! Interface:
//! - `fetch` returns a handle with the block's content, reading it if needed.
//! - `fetch_uninitialized` skips the read, for callers overwriting the block.
//! - after changing the content, `mark_dirty`; the write happens on flush or
//!   when the buffer is evicted.
//! - dropping the handle releases it.

use super::*;
use block_device::BlockDevice;
use buf::{BufferHead, BufferTable};
use request::{Op, RequestQueue};

use log::{debug, warn};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

pub struct Slot {
    pub data: Mutex<Box<BlockData>>,
    /// waiters for this buffer to unlock
    pub wait: Condvar,
}

/// State shared between the cache and the request worker.
pub struct Shared {
    pub table: Mutex<BufferTable>,
    pub slots: Vec<Slot>,
    /// waiters for any buffer to become unreferenced
    buffer_wait: Condvar,
    devices: RwLock<HashMap<DeviceId, Arc<dyn BlockDevice>>>,
}

impl Shared {
    pub fn device(&self, dev: DeviceId) -> Option<Arc<dyn BlockDevice>> {
        self.devices.read().unwrap().get(&dev).cloned()
    }

    pub fn wait_on_buffer<'a>(
        &self,
        mut table: MutexGuard<'a, BufferTable>,
        index: usize,
    ) -> MutexGuard<'a, BufferTable> {
        while table.head(index).locked {
            table = self.slots[index].wait.wait(table).unwrap();
        }
        table
    }

    pub fn lock_buffer<'a>(
        &self,
        table: MutexGuard<'a, BufferTable>,
        index: usize,
    ) -> MutexGuard<'a, BufferTable> {
        let mut table = self.wait_on_buffer(table, index);
        table.head_mut(index).locked = true;
        table
    }

    pub fn unlock_buffer(&self, table: &mut BufferTable, index: usize) {
        let head = table.head_mut(index);
        if !head.locked {
            warn!("buffer ({}:{}) not locked", head.dev, head.blockno);
        }
        head.locked = false;
        self.slots[index].wait.notify_all();
    }

    /// Record the outcome of a transfer and unlock the buffer.
    pub fn end_request(
        &self,
        table: &mut BufferTable,
        index: usize,
        op: Op,
        result: io::Result<()>,
    ) {
        let head = table.head_mut(index);
        match result {
            Ok(()) => {
                head.valid = true;
                head.io_error = false;
            }
            Err(err) => {
                warn!(
                    "I/O error: {:?} dev {} block {}: {}",
                    op, head.dev, head.blockno, err
                );
                head.valid = false;
                head.io_error = true;
            }
        }
        self.unlock_buffer(table, index);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub written: usize,
    pub failed: usize,
}

pub struct BufferCache {
    shared: Arc<Shared>,
    requests: RequestQueue,
}

impl BufferCache {
    pub fn new(nr_buffers: usize) -> Arc<Self> {
        let shared = Arc::new(Shared {
            table: Mutex::new(BufferTable::new(nr_buffers)),
            slots: (0..nr_buffers)
                .map(|_| Slot {
                    data: Mutex::new(Box::new([0; BLOCK_SIZE])),
                    wait: Condvar::new(),
                })
                .collect(),
            buffer_wait: Condvar::new(),
            devices: RwLock::new(HashMap::new()),
        });
        let requests = RequestQueue::new(Arc::clone(&shared));
        Arc::new(BufferCache { shared, requests })
    }

    /// As many buffers as fit in `bytes` of memory, but never fewer than a
    /// device with full bitmaps needs.
    pub fn with_memory(bytes: usize) -> Arc<Self> {
        let per_buffer = BLOCK_SIZE + size_of::<BufferHead>();
        let floor = I_MAP_SLOTS + Z_MAP_SLOTS + WORK_BUFFERS;
        Self::new((bytes / per_buffer).max(floor))
    }

    pub fn nr_buffers(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn register_device(&self, dev: DeviceId, device: Arc<dyn BlockDevice>) {
        assert!(dev != 0, "device 0 is reserved");
        self.shared.devices.write().unwrap().insert(dev, device);
    }

    pub fn device(&self, dev: DeviceId) -> Option<Arc<dyn BlockDevice>> {
        self.shared.device(dev)
    }

    fn handle(self: &Arc<Self>, table: &BufferTable, index: usize) -> BufferHandle {
        let head = table.head(index);
        BufferHandle {
            cache: Arc::clone(self),
            index,
            generation: head.generation,
            dev: head.dev,
            blockno: head.blockno,
            background: false,
        }
    }

    /// Find the buffer for `(dev, blockno)` or bind a free one to it. Every
    /// wait may let other parties run, so each check is redone afterwards and
    /// the lookup restarts whenever it no longer holds.
    fn get_block(self: &Arc<Self>, dev: DeviceId, blockno: BlockNo) -> BufferHandle {
        assert!(dev != 0, "getblk on device 0");
        let shared = &*self.shared;
        let mut table = shared.table.lock().unwrap();

        for attempt in 0u64.. {
            if attempt > 0 {
                debug!("getblk ({}:{}) retry #{}", dev, blockno, attempt);
            }

            if let Some(index) = table.find(dev, blockno) {
                table.head_mut(index).refcnt += 1;
                table = shared.wait_on_buffer(table, index);
                let head = table.head(index);
                if head.dev == dev && head.blockno == blockno {
                    return self.handle(&table, index);
                }
                table.head_mut(index).refcnt -= 1;
                continue;
            }

            let Some(index) = table.pick_victim() else {
                table = shared.buffer_wait.wait(table).unwrap();
                continue;
            };
            table = shared.wait_on_buffer(table, index);
            if table.head(index).refcnt > 0 {
                continue;
            }

            let mut taken = false;
            while table.head(index).dirty {
                let head = table.head(index);
                debug!("write back ({}:{}) before reuse", head.dev, head.blockno);
                table = self.requests.submit(shared, table, index, Op::Write).0;
                table = shared.wait_on_buffer(table, index);
                if table.head(index).refcnt > 0 {
                    taken = true;
                    break;
                }
            }
            if taken || table.find(dev, blockno).is_some() {
                continue;
            }

            table.rebind(index, dev, blockno);
            let head = table.head_mut(index);
            head.refcnt = 1;
            head.dirty = false;
            head.valid = false;
            head.io_error = false;
            debug!("bind buffer {} to ({}:{})", index, dev, blockno);
            return self.handle(&table, index);
        }
        unreachable!()
    }

    /// Handle to the block's content, read from the device unless cached.
    pub fn fetch(self: &Arc<Self>, dev: DeviceId, blockno: BlockNo) -> Result<BufferHandle> {
        let handle = self.get_block(dev, blockno);
        let shared = &*self.shared;
        let mut table = shared.table.lock().unwrap();
        if !table.head(handle.index).valid {
            table = self.requests.submit(shared, table, handle.index, Op::Read).0;
            table = shared.wait_on_buffer(table, handle.index);
        }
        let valid = table.head(handle.index).valid;
        drop(table);
        if valid {
            Ok(handle)
        } else {
            Err(FsError::Io {
                dev,
                block: blockno,
            })
        }
    }

    /// Handle for a block the caller overwrites entirely; a newly bound
    /// buffer is not valid until the caller says so.
    pub fn fetch_uninitialized(self: &Arc<Self>, dev: DeviceId, blockno: BlockNo) -> BufferHandle {
        self.get_block(dev, blockno)
    }

    /// Handle to `(dev, blockno)` if it is cached, without binding a buffer.
    pub fn lookup(self: &Arc<Self>, dev: DeviceId, blockno: BlockNo) -> Option<BufferHandle> {
        let shared = &*self.shared;
        let mut table = shared.table.lock().unwrap();
        loop {
            let index = table.find(dev, blockno)?;
            table.head_mut(index).refcnt += 1;
            table = shared.wait_on_buffer(table, index);
            let head = table.head(index);
            if head.dev == dev && head.blockno == blockno {
                return Some(self.handle(&table, index));
            }
            table.head_mut(index).refcnt -= 1;
        }
    }

    /// Start reading `(dev, blockno)` without waiting for it.
    pub fn read_ahead(self: &Arc<Self>, dev: DeviceId, blockno: BlockNo) {
        let mut handle = self.get_block(dev, blockno);
        let table = self.shared.table.lock().unwrap();
        let table = self
            .requests
            .submit(&self.shared, table, handle.index, Op::ReadAhead)
            .0;
        drop(table);
        handle.background = true;
    }

    /// `fetch`, with reads of the `ahead` blocks started in the background.
    pub fn fetch_ahead(
        self: &Arc<Self>,
        dev: DeviceId,
        blockno: BlockNo,
        ahead: &[BlockNo],
    ) -> Result<BufferHandle> {
        let handle = self.get_block(dev, blockno);
        let shared = &*self.shared;
        let table = shared.table.lock().unwrap();
        let table = self.requests.submit(shared, table, handle.index, Op::Read).0;
        drop(table);
        for &block in ahead {
            self.read_ahead(dev, block);
        }
        let table = shared.table.lock().unwrap();
        let table = shared.wait_on_buffer(table, handle.index);
        let valid = table.head(handle.index).valid;
        drop(table);
        if valid {
            Ok(handle)
        } else {
            Err(FsError::Io {
                dev,
                block: blockno,
            })
        }
    }

    pub fn release(&self, handle: BufferHandle) {
        drop(handle);
    }

    pub fn mark_dirty(&self, handle: &BufferHandle) {
        handle.mark_dirty();
    }

    fn brelse(&self, index: usize, generation: u64, wait: bool) {
        let shared = &*self.shared;
        let mut table = shared.table.lock().unwrap();
        assert_eq!(
            table.head(index).generation,
            generation,
            "releasing a stale buffer handle"
        );
        if wait {
            table = shared.wait_on_buffer(table, index);
        }
        let head = table.head_mut(index);
        if head.refcnt == 0 {
            panic!("trying to free free buffer");
        }
        head.refcnt -= 1;
        if head.refcnt == 0 {
            shared.buffer_wait.notify_all();
        }
    }

    /// Write back every dirty buffer of `dev`.
    pub fn flush(&self, dev: DeviceId) -> FlushStats {
        self.sync_buffers(|d| d == dev)
    }

    /// Write back every dirty buffer.
    pub fn flush_all(&self) -> FlushStats {
        self.sync_buffers(|d| d != 0)
    }

    fn sync_buffers(&self, matches: impl Fn(DeviceId) -> bool) -> FlushStats {
        let shared = &*self.shared;
        let mut stats = FlushStats::default();
        let mut table = shared.table.lock().unwrap();
        for index in 0..table.len() {
            if !matches(table.head(index).dev) {
                continue;
            }
            table = shared.wait_on_buffer(table, index);
            let head = table.head(index);
            if !matches(head.dev) || !head.dirty {
                continue;
            }
            let (guard, queued) = self.requests.submit(shared, table, index, Op::Write);
            table = shared.wait_on_buffer(guard, index);
            let head = table.head(index);
            if head.io_error {
                warn!("flush: write of ({}:{}) failed", head.dev, head.blockno);
                stats.failed += 1;
            } else if queued {
                stats.written += 1;
            }
        }
        stats
    }

    /// Forget the content of every buffer of `dev`, e.g. after a media
    /// change. Identities stay bound.
    pub fn invalidate(&self, dev: DeviceId) {
        let shared = &*self.shared;
        let mut table = shared.table.lock().unwrap();
        for index in 0..table.len() {
            if table.head(index).dev != dev {
                continue;
            }
            table = shared.wait_on_buffer(table, index);
            let head = table.head_mut(index);
            if head.dev == dev {
                head.valid = false;
                head.dirty = false;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_unique_mappings(&self) {
        let mut ids = self.shared.table.lock().unwrap().identities();
        let n = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), n, "a block is cached in two buffers");
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self, dev: DeviceId, blockno: BlockNo) -> Option<u32> {
        let table = self.shared.table.lock().unwrap();
        table.find(dev, blockno).map(|i| table.head(i).refcnt)
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        if std::thread::panicking() && self.shared.table.is_poisoned() {
            return;
        }
        let stats = self.flush_all();
        if stats.failed > 0 {
            warn!("{} dirty buffers lost on cache shutdown", stats.failed);
        }
    }
}

/// A referenced buffer. Dropping it releases the reference.
pub struct BufferHandle {
    cache: Arc<BufferCache>,
    index: usize,
    generation: u64,
    dev: DeviceId,
    blockno: BlockNo,
    /// release without waiting for pending I/O
    background: bool,
}

impl BufferHandle {
    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn blockno(&self) -> BlockNo {
        self.blockno
    }

    fn with_head<V>(&self, f: impl FnOnce(&mut BufferHead) -> V) -> V {
        let mut table = self.cache.shared.table.lock().unwrap();
        let head = table.head_mut(self.index);
        assert_eq!(head.generation, self.generation, "stale buffer handle");
        f(head)
    }

    fn wait_unlocked(&self) {
        let shared = &*self.cache.shared;
        let table = shared.table.lock().unwrap();
        assert_eq!(
            table.head(self.index).generation,
            self.generation,
            "stale buffer handle"
        );
        drop(shared.wait_on_buffer(table, self.index));
    }

    pub fn read<V>(&self, f: impl FnOnce(&BlockData) -> V) -> V {
        self.wait_unlocked();
        let data = self.cache.shared.slots[self.index].data.lock().unwrap();
        f(&data)
    }

    pub fn modify<V>(&self, f: impl FnOnce(&mut BlockData) -> V) -> V {
        self.wait_unlocked();
        let mut data = self.cache.shared.slots[self.index].data.lock().unwrap();
        f(&mut data)
    }

    pub fn mark_dirty(&self) {
        self.with_head(|head| head.dirty = true);
    }

    /// The content is now up to date, typically after a full overwrite.
    pub fn set_valid(&self) {
        self.with_head(|head| head.valid = true);
    }

    /// Clear the block and schedule it for writing.
    pub fn zero(&self) {
        self.modify(|data| data.fill(0));
        self.with_head(|head| {
            head.valid = true;
            head.dirty = true;
        });
    }

    /// Drop the cached content without writing it.
    pub fn discard(&self) {
        self.with_head(|head| {
            head.valid = false;
            head.dirty = false;
        });
    }

    /// # of holders, this handle included
    pub fn ref_count(&self) -> u32 {
        self.with_head(|head| head.refcnt)
    }

    pub fn is_valid(&self) -> bool {
        self.with_head(|head| head.valid)
    }

    pub fn is_dirty(&self) -> bool {
        self.with_head(|head| head.dirty)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if std::thread::panicking() && self.cache.shared.table.is_poisoned() {
            return;
        }
        self.cache.brelse(self.index, self.generation, !self.background);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;

    use rand::Rng;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct FaultyDisk {
        inner: MemDisk,
        bad_block: BlockNo,
    }

    impl BlockDevice for FaultyDisk {
        fn read_block(&self, blockno: BlockNo, buf: &mut [u8]) -> io::Result<()> {
            if blockno == self.bad_block {
                return Err(io::Error::new(io::ErrorKind::Other, "bad sector"));
            }
            self.inner.read_block(blockno, buf)
        }

        fn write_block(&self, blockno: BlockNo, buf: &[u8]) -> io::Result<()> {
            if blockno == self.bad_block {
                return Err(io::Error::new(io::ErrorKind::Other, "bad sector"));
            }
            self.inner.write_block(blockno, buf)
        }

        fn block_count(&self) -> usize {
            self.inner.block_count()
        }
    }

    /// device whose writes stall until the gate opens
    struct GatedDisk {
        inner: MemDisk,
        /// (write started, gate open)
        state: Mutex<(bool, bool)>,
        changed: Condvar,
    }

    impl GatedDisk {
        fn wait_for_write(&self) {
            let mut state = self.state.lock().unwrap();
            while !state.0 {
                state = self.changed.wait(state).unwrap();
            }
        }

        fn open(&self) {
            self.state.lock().unwrap().1 = true;
            self.changed.notify_all();
        }
    }

    impl BlockDevice for GatedDisk {
        fn read_block(&self, blockno: BlockNo, buf: &mut [u8]) -> io::Result<()> {
            self.inner.read_block(blockno, buf)
        }

        fn write_block(&self, blockno: BlockNo, buf: &[u8]) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.0 = true;
            self.changed.notify_all();
            while !state.1 {
                state = self.changed.wait(state).unwrap();
            }
            drop(state);
            self.inner.write_block(blockno, buf)
        }

        fn block_count(&self) -> usize {
            self.inner.block_count()
        }
    }

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup(nr_buffers: usize, nblocks: usize) -> (Arc<BufferCache>, Arc<MemDisk>) {
        init_log();
        let disk = Arc::new(MemDisk::new(nblocks));
        for i in 0..nblocks {
            disk.write_block(i as BlockNo, &[i as u8; BLOCK_SIZE]).unwrap();
        }
        let cache = BufferCache::new(nr_buffers);
        cache.register_device(1, disk.clone());
        (cache, disk)
    }

    #[test]
    fn fetch_reads_once_then_hits() {
        let (cache, disk) = setup(4, 8);
        let writes = disk.writes();
        let bh = cache.fetch(1, 3).unwrap();
        assert_eq!(bh.read(|data| data[0]), 3);
        drop(bh);
        let bh = cache.fetch(1, 3).unwrap();
        assert_eq!(bh.read(|data| data[BLOCK_SIZE - 1]), 3);
        assert_eq!(disk.reads(), 1);
        assert_eq!(disk.writes(), writes);
    }

    #[test]
    fn handles_share_one_buffer_and_count_references() {
        let (cache, _disk) = setup(4, 8);
        let a = cache.fetch(1, 2).unwrap();
        let b = cache.fetch(1, 2).unwrap();
        assert_eq!(cache.refcnt(1, 2), Some(2));
        a.modify(|data| data[0] = 0xee);
        assert_eq!(b.read(|data| data[0]), 0xee);
        cache.release(a);
        assert_eq!(cache.refcnt(1, 2), Some(1));
        drop(b);
        assert_eq!(cache.refcnt(1, 2), Some(0));
    }

    #[test]
    fn fetch_uninitialized_skips_device_read() {
        let (cache, disk) = setup(2, 8);
        let bh = cache.fetch_uninitialized(1, 5);
        assert!(!bh.is_valid());
        bh.zero();
        assert!(bh.is_valid() && bh.is_dirty());
        assert_eq!(disk.reads(), 0);
    }

    #[test]
    fn dirty_buffer_is_written_on_flush() {
        let (cache, disk) = setup(4, 8);
        let bh = cache.fetch(1, 1).unwrap();
        bh.modify(|data| data.fill(0x5a));
        cache.mark_dirty(&bh);
        drop(bh);
        let stats = cache.flush(1);
        assert_eq!(stats, FlushStats { written: 1, failed: 0 });
        let mut back = [0u8; BLOCK_SIZE];
        disk.read_block(1, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0x5a));
        assert_eq!(cache.flush_all(), FlushStats::default());
    }

    #[test]
    fn flush_only_touches_the_given_device() {
        let (cache, disk) = setup(4, 8);
        let other = Arc::new(MemDisk::new(8));
        cache.register_device(2, other.clone());
        let a = cache.fetch(1, 1).unwrap();
        let b = cache.fetch(2, 1).unwrap();
        a.mark_dirty();
        b.mark_dirty();
        drop((a, b));
        let before = disk.writes();
        assert_eq!(cache.flush(2).written, 1);
        assert_eq!(disk.writes(), before);
        assert_eq!(other.writes(), 1);
        assert_eq!(cache.flush_all().written, 1);
        assert_eq!(disk.writes(), before + 1);
    }

    #[test]
    fn eviction_prefers_clean_buffer_without_write_back() {
        let (cache, disk) = setup(4, 16);
        let clean = cache.fetch(1, 1).unwrap();
        let dirty = cache.fetch(1, 2).unwrap();
        let _pin3 = cache.fetch(1, 3).unwrap();
        let _pin4 = cache.fetch(1, 4).unwrap();
        dirty.modify(|data| data[0] = 0xdd);
        dirty.mark_dirty();
        drop(clean);
        drop(dirty);

        let writes = disk.writes();
        let bh = cache.fetch(1, 9).unwrap();
        assert_eq!(bh.read(|data| data[0]), 9);
        assert_eq!(disk.writes(), writes);
        assert!(cache.lookup(1, 1).is_none());
        let still = cache.lookup(1, 2).expect("dirty buffer kept");
        assert!(still.is_dirty());
    }

    #[test]
    fn dirty_victim_is_written_back_before_reuse() {
        let (cache, disk) = setup(1, 8);
        let bh = cache.fetch(1, 6).unwrap();
        bh.modify(|data| data.fill(0x66));
        bh.mark_dirty();
        drop(bh);
        let bh = cache.fetch(1, 7).unwrap();
        assert_eq!(bh.read(|data| data[0]), 7);
        drop(bh);
        let mut back = [0u8; BLOCK_SIZE];
        disk.read_block(6, &mut back).unwrap();
        assert_eq!(back[0], 0x66);
    }

    #[test]
    fn victim_taken_during_write_back_restarts_the_lookup() {
        init_log();
        let disk = Arc::new(GatedDisk {
            inner: MemDisk::new(8),
            state: Mutex::new((false, false)),
            changed: Condvar::new(),
        });
        disk.inner.write_block(2, &[2; BLOCK_SIZE]).unwrap();
        let cache = BufferCache::new(1);
        cache.register_device(1, disk.clone());

        let bh = cache.fetch_uninitialized(1, 1);
        bh.modify(|data| data.fill(0xee));
        bh.set_valid();
        bh.mark_dirty();
        drop(bh);

        // the only buffer is dirty, so this fetch stalls writing it back
        let a = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.fetch(1, 2).unwrap().read(|data| data[0]))
        };
        disk.wait_for_write();

        // meanwhile the old block is looked up again and held
        let (got, release) = (mpsc::channel(), mpsc::channel::<()>());
        let b = {
            let cache = Arc::clone(&cache);
            let (got, release) = (got.0, release.1);
            thread::spawn(move || {
                let bh = cache.fetch(1, 1).unwrap();
                got.send(bh.read(|data| data[0])).unwrap();
                release.recv().unwrap();
            })
        };
        while cache.refcnt(1, 1) != Some(1) {
            thread::sleep(Duration::from_millis(1));
        }
        disk.open();

        assert_eq!(got.1.recv().unwrap(), 0xee);
        thread::sleep(Duration::from_millis(50));
        assert!(!a.is_finished());
        assert_eq!(cache.refcnt(1, 2), None);
        cache.assert_unique_mappings();

        release.0.send(()).unwrap();
        b.join().unwrap();
        assert_eq!(a.join().unwrap(), 2);
        assert_eq!(cache.refcnt(1, 1), None);
        cache.assert_unique_mappings();
        let mut back = [0u8; BLOCK_SIZE];
        disk.inner.read_block(1, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0xee));
    }

    #[test]
    fn buffer_waiters_wake_on_the_last_release_only() {
        let (cache, _disk) = setup(1, 8);
        let first = cache.fetch(1, 1).unwrap();
        let second = cache.fetch(1, 1).unwrap();
        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.fetch(1, 2).unwrap().read(|data| data[0]))
        };
        thread::sleep(Duration::from_millis(20));
        drop(first);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        assert_eq!(cache.refcnt(1, 1), Some(1));
        drop(second);
        assert_eq!(waiter.join().unwrap(), 2);
    }

    #[test]
    fn fetch_waits_for_a_free_buffer() {
        let (cache, _disk) = setup(1, 8);
        let held = cache.fetch(1, 1).unwrap();
        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.fetch(1, 2).unwrap().read(|data| data[0]))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.join().unwrap(), 2);
    }

    #[test]
    fn read_failure_is_reported_not_fatal() {
        init_log();
        let cache = BufferCache::new(4);
        cache.register_device(
            1,
            Arc::new(FaultyDisk {
                inner: MemDisk::new(8),
                bad_block: 3,
            }),
        );
        match cache.fetch(1, 3) {
            Err(FsError::Io { dev: 1, block: 3 }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(cache.refcnt(1, 3), Some(0));
        assert!(cache.fetch(1, 2).is_ok());
    }

    #[test]
    fn failed_flush_write_is_counted_and_others_continue() {
        init_log();
        let cache = BufferCache::new(4);
        cache.register_device(
            1,
            Arc::new(FaultyDisk {
                inner: MemDisk::new(8),
                bad_block: 4,
            }),
        );
        for block in [4, 5] {
            let bh = cache.fetch(1, block).unwrap_or_else(|_| cache.fetch_uninitialized(1, block));
            bh.mark_dirty();
        }
        assert_eq!(cache.flush(1), FlushStats { written: 1, failed: 1 });
    }

    #[test]
    fn unregistered_device_fails_the_read() {
        init_log();
        let cache = BufferCache::new(2);
        assert!(matches!(cache.fetch(7, 0), Err(FsError::Io { dev: 7, .. })));
    }

    #[test]
    fn invalidate_forgets_content_but_keeps_identity() {
        let (cache, disk) = setup(4, 8);
        let bh = cache.fetch(1, 2).unwrap();
        bh.modify(|data| data[0] = 0x77);
        bh.mark_dirty();
        drop(bh);
        cache.invalidate(1);
        let bh = cache.lookup(1, 2).expect("still bound");
        assert!(!bh.is_valid() && !bh.is_dirty());
        drop(bh);
        let bh = cache.fetch(1, 2).unwrap();
        assert_eq!(bh.read(|data| data[0]), 2);
        assert_eq!(disk.reads(), 2);
    }

    #[test]
    fn read_ahead_fills_buffer_in_background() {
        let (cache, disk) = setup(4, 8);
        cache.read_ahead(1, 5);
        let bh = cache.fetch(1, 5).unwrap();
        assert_eq!(bh.read(|data| data[0]), 5);
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn fetch_ahead_starts_following_reads() {
        let (cache, disk) = setup(8, 8);
        let bh = cache.fetch_ahead(1, 1, &[2, 3]).unwrap();
        assert_eq!(bh.read(|data| data[0]), 1);
        drop(bh);
        for block in [2, 3] {
            assert_eq!(cache.fetch(1, block).unwrap().read(|data| data[0]), block as u8);
        }
        assert_eq!(disk.reads(), 3);
    }

    #[test]
    fn with_memory_derives_capacity() {
        let cache = BufferCache::with_memory(64 * 1024);
        assert!(cache.nr_buffers() > 0 && cache.nr_buffers() <= 64);
        assert_eq!(
            BufferCache::with_memory(0).nr_buffers(),
            I_MAP_SLOTS + Z_MAP_SLOTS + WORK_BUFFERS
        );
    }

    #[test]
    fn dropping_the_cache_flushes_dirty_buffers() {
        let (cache, disk) = setup(2, 8);
        let bh = cache.fetch_uninitialized(1, 4);
        bh.modify(|data| data.fill(0x44));
        bh.set_valid();
        bh.mark_dirty();
        drop(bh);
        drop(cache);
        let mut back = [0u8; BLOCK_SIZE];
        disk.read_block(4, &mut back).unwrap();
        assert_eq!(back[0], 0x44);
    }

    #[test]
    #[should_panic(expected = "getblk on device 0")]
    fn device_zero_is_rejected() {
        let cache = BufferCache::new(2);
        cache.fetch_uninitialized(0, 1);
    }

    #[test]
    fn concurrent_fetches_never_map_a_block_twice() {
        let (cache, _disk) = setup(6, 64);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..300 {
                        let block = rng.gen_range(0..24);
                        let bh = cache.fetch(1, block).unwrap();
                        assert_eq!(bh.blockno(), block);
                        if rng.gen_bool(0.3) {
                            bh.modify(|data| data[0] = block as u8);
                            bh.mark_dirty();
                        }
                        assert_eq!(bh.read(|data| data[0]), block as u8);
                        cache.assert_unique_mappings();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        cache.assert_unique_mappings();
    }
}
