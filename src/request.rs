//! Block request layer. A submitted request locks its buffer and is handed to
//! a worker thread; completion unlocks the buffer and wakes the parties
//! waiting on that buffer only. Synchronous callers wait on the buffer after
//! submitting, read-ahead callers walk away.

use super::*;
use block_cache::Shared;
use block_device::BlockDevice;
use buf::BufferTable;

use log::{trace, warn};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    /// read nobody waits for
    ReadAhead,
    Write,
}

struct Request {
    index: usize,
    op: Op,
    dev: DeviceId,
    blockno: BlockNo,
    device: Arc<dyn BlockDevice>,
}

pub struct RequestQueue {
    sender: Mutex<Option<Sender<Request>>>,
    worker: Option<JoinHandle<()>>,
}

impl RequestQueue {
    pub fn new(shared: Arc<Shared>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("blk-request".into())
            .spawn(move || run(shared, receiver))
            .expect("cannot spawn block request worker");
        RequestQueue {
            sender: Mutex::new(Some(sender)),
            worker: Some(worker),
        }
    }

    /// Lock buffer `index` and queue `op` for it. Moot requests (reading a
    /// valid buffer, writing a clean one) only lock and unlock. Returns the
    /// table guard and whether a transfer was queued.
    pub fn submit<'a>(
        &self,
        shared: &'a Shared,
        table: MutexGuard<'a, BufferTable>,
        index: usize,
        op: Op,
    ) -> (MutexGuard<'a, BufferTable>, bool) {
        let mut table = shared.lock_buffer(table, index);
        let head = table.head_mut(index);
        let moot = match op {
            Op::Write => !head.dirty,
            Op::Read | Op::ReadAhead => head.valid,
        };
        if moot {
            shared.unlock_buffer(&mut table, index);
            return (table, false);
        }
        if op == Op::Write {
            head.dirty = false;
        }
        let (dev, blockno) = (head.dev, head.blockno);

        let Some(device) = shared.device(dev) else {
            shared.end_request(
                &mut table,
                index,
                op,
                Err(io::Error::new(io::ErrorKind::NotFound, "no such device")),
            );
            return (table, false);
        };
        let request = Request {
            index,
            op,
            dev,
            blockno,
            device,
        };
        trace!("submit {:?} ({}:{})", op, dev, blockno);

        let sent = match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(request).is_ok(),
            None => false,
        };
        if !sent {
            shared.end_request(
                &mut table,
                index,
                op,
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "request queue is gone")),
            );
            return (table, false);
        }
        (table, true)
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.sender.lock().unwrap().take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("block request worker panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>, receiver: Receiver<Request>) {
    for request in receiver {
        let result = {
            let mut data = shared.slots[request.index].data.lock().unwrap();
            match request.op {
                Op::Read | Op::ReadAhead => request.device.read_block(request.blockno, &mut data[..]),
                Op::Write => request.device.write_block(request.blockno, &data[..]),
            }
        };
        trace!(
            "complete {:?} ({}:{}) ok={}",
            request.op,
            request.dev,
            request.blockno,
            result.is_ok()
        );
        let mut table = shared.table.lock().unwrap();
        shared.end_request(&mut table, request.index, request.op, result);
    }
}
