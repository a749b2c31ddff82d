//! Buffer descriptors and the two structures threading them together: the
//! hash index keyed by `(dev, blockno)` and the circular free/LRU ring.
//!
//! Every descriptor is always on the ring, referenced or not. Rebinding a
//! descriptor moves it to the tail, so a scan from `free_list` sees the
//! longest-unbound descriptors first.

use super::*;

use std::collections::HashMap;

pub struct BufferHead {
    pub dev: DeviceId,
    pub blockno: BlockNo,
    /// content matches the device
    pub valid: bool,
    /// content not yet written to the device
    pub dirty: bool,
    pub refcnt: u32,
    /// I/O or rebind in progress
    pub locked: bool,
    /// last transfer on this buffer failed
    pub io_error: bool,
    /// bumped on every rebind, stale handles are detected with it
    pub generation: u64,
    prev_free: usize,
    next_free: usize,
}

impl BufferHead {
    fn new(index: usize, nr: usize) -> Self {
        BufferHead {
            dev: 0,
            blockno: 0,
            valid: false,
            dirty: false,
            refcnt: 0,
            locked: false,
            io_error: false,
            generation: 0,
            prev_free: (index + nr - 1) % nr,
            next_free: (index + 1) % nr,
        }
    }

    /// eviction preference, lower is better
    pub fn badness(&self) -> u8 {
        ((self.dirty as u8) << 1) + self.locked as u8
    }
}

pub struct BufferTable {
    heads: Vec<BufferHead>,
    hash: HashMap<(DeviceId, BlockNo), usize>,
    free_list: usize,
}

impl BufferTable {
    pub fn new(nr: usize) -> Self {
        assert!(nr > 0, "buffer cache needs at least one buffer");
        BufferTable {
            heads: (0..nr).map(|i| BufferHead::new(i, nr)).collect(),
            hash: HashMap::with_capacity(nr),
            free_list: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn head(&self, index: usize) -> &BufferHead {
        &self.heads[index]
    }

    pub fn head_mut(&mut self, index: usize) -> &mut BufferHead {
        &mut self.heads[index]
    }

    pub fn find(&self, dev: DeviceId, blockno: BlockNo) -> Option<usize> {
        if dev == 0 {
            return None;
        }
        self.hash.get(&(dev, blockno)).copied()
    }

    /// walk the ring once, starting from its head
    pub fn free_ring(&self) -> impl Iterator<Item = usize> + '_ {
        let start = self.free_list;
        std::iter::successors(Some(start), move |&i| {
            let next = self.heads[i].next_free;
            (next != start).then_some(next)
        })
    }

    /// Unreferenced buffer with the lowest badness, or `None` when every
    /// buffer is referenced.
    pub fn pick_victim(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for i in self.free_ring() {
            let head = &self.heads[i];
            if head.refcnt > 0 {
                continue;
            }
            if best.map_or(true, |b| head.badness() < self.heads[b].badness()) {
                best = Some(i);
                if head.badness() == 0 {
                    break;
                }
            }
        }
        best
    }

    /// Give `index` a new identity. The caller owns it exclusively: nobody
    /// references it and it is not locked.
    pub fn rebind(&mut self, index: usize, dev: DeviceId, blockno: BlockNo) {
        self.remove_from_queues(index);
        let head = &mut self.heads[index];
        head.dev = dev;
        head.blockno = blockno;
        head.generation += 1;
        self.insert_into_queues(index);
    }

    fn remove_from_queues(&mut self, index: usize) {
        let head = &self.heads[index];
        let key = (head.dev, head.blockno);
        if head.dev != 0 && self.hash.get(&key) == Some(&index) {
            self.hash.remove(&key);
        }

        if self.heads.len() == 1 {
            return;
        }
        let (prev, next) = (head.prev_free, head.next_free);
        if self.heads[prev].next_free != index || self.heads[next].prev_free != index {
            panic!("free block list corrupted");
        }
        self.heads[prev].next_free = next;
        self.heads[next].prev_free = prev;
        if self.free_list == index {
            self.free_list = next;
        }
    }

    /// put at the ring tail and into the hash index
    fn insert_into_queues(&mut self, index: usize) {
        if self.heads.len() > 1 {
            let tail = self.heads[self.free_list].prev_free;
            self.heads[index].prev_free = tail;
            self.heads[index].next_free = self.free_list;
            self.heads[tail].next_free = index;
            let free_list = self.free_list;
            self.heads[free_list].prev_free = index;
        }

        let head = &self.heads[index];
        if head.dev != 0 {
            let old = self.hash.insert((head.dev, head.blockno), index);
            assert!(
                old.is_none(),
                "block ({}:{}) mapped twice",
                head.dev,
                head.blockno
            );
        }
    }

    /// `(dev, blockno)` of every bound descriptor
    #[cfg(test)]
    pub fn identities(&self) -> Vec<(DeviceId, BlockNo)> {
        self.heads
            .iter()
            .filter(|h| h.dev != 0)
            .map(|h| (h.dev, h.blockno))
            .collect()
    }
}
