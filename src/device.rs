//! Block device layer and asynchronous submission worker
//!
//! The journal consumes a narrow device interface: positioned block reads and
//! writes plus a cache flush. Submission is asynchronous; each device is
//! fronted by a dedicated worker thread fed over a bounded channel, and every
//! write request carries a responder the submitter can block on. A `Plug`
//! batches adjacent submissions and releases them to the worker in one burst.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Depth of the submission channel feeding a device worker.
const IO_QUEUE_DEPTH: usize = 4096;

/// Write ordering strength for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Ordinary synchronous write.
    Sync,
    /// Write followed by a device cache flush before completion.
    FlushFua,
}

/// A block-addressable device.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;
    fn read_block(&self, blocknr: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, blocknr: u64, data: &[u8]) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

/// File-backed block device.
pub struct FileDevice {
    file: File,
    block_size: usize,
}

impl FileDevice {
    /// Create (or truncate) a device file preallocated to `nblocks` blocks.
    pub fn create(path: &Path, block_size: usize, nblocks: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks * block_size as u64)?;
        Ok(Self { file, block_size })
    }

    /// Open an existing device file.
    pub fn open(path: &Path, block_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, block_size })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, blocknr: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.file.read_exact_at(buf, blocknr * self.block_size as u64)
    }

    fn write_block(&self, blocknr: u64, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len(), self.block_size);
        self.file.write_all_at(data, blocknr * self.block_size as u64)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Event trace a `MemDevice` records, in submission-completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Write { blocknr: u64 },
    Flush,
}

/// In-memory block device for tests. Records every write and flush so
/// ordering contracts can be asserted, and can inject write failures.
pub struct MemDevice {
    block_size: usize,
    blocks: Mutex<Vec<Vec<u8>>>,
    events: Mutex<Vec<DeviceEvent>>,
    write_delay: Option<Duration>,
    fail_writes: AtomicBool,
}

impl MemDevice {
    pub fn new(block_size: usize, nblocks: usize) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(vec![vec![0u8; block_size]; nblocks]),
            events: Mutex::new(Vec::new()),
            write_delay: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Slow every write down, to hold a commit open while a test races it.
    pub fn with_write_delay(block_size: usize, nblocks: usize, delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::new(block_size, nblocks)
        }
    }

    /// Make all subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the recorded event trace.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().expect("mem device events lock poisoned").clone()
    }

    /// Copy of one block's contents.
    pub fn block(&self, blocknr: u64) -> Vec<u8> {
        self.blocks.lock().expect("mem device blocks lock poisoned")[blocknr as usize].clone()
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, blocknr: u64, buf: &mut [u8]) -> io::Result<()> {
        let blocks = self.blocks.lock().expect("mem device blocks lock poisoned");
        let block = blocks
            .get(blocknr as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "block out of range"))?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&self, blocknr: u64, data: &[u8]) -> io::Result<()> {
        if let Some(delay) = self.write_delay {
            thread::sleep(delay);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut blocks = self.blocks.lock().expect("mem device blocks lock poisoned");
        let block = blocks
            .get_mut(blocknr as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "block out of range"))?;
        block.copy_from_slice(data);
        self.events
            .lock()
            .expect("mem device events lock poisoned")
            .push(DeviceEvent::Write { blocknr });
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.events
            .lock()
            .expect("mem device events lock poisoned")
            .push(DeviceEvent::Flush);
        Ok(())
    }
}

struct WriteRequest {
    op: WriteOp,
    blocknr: u64,
    data: Vec<u8>,
    completion: SyncSender<io::Result<()>>,
}

enum IoMessage {
    Write(WriteRequest),
    Flush(SyncSender<io::Result<()>>),
    Shutdown,
}

/// Pending completion of one submitted write.
pub struct IoCompletion {
    receiver: Receiver<io::Result<()>>,
}

impl IoCompletion {
    /// Block until the write completes and return its result.
    pub fn wait(self) -> io::Result<()> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "I/O worker exited before completing the request",
            )),
        }
    }
}

/// Dedicated submission thread for one device.
pub struct IoWorker {
    sender: SyncSender<IoMessage>,
    device: Arc<dyn BlockDevice>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    /// Spawn the worker thread for `device`.
    pub fn spawn(device: Arc<dyn BlockDevice>) -> Self {
        let (tx, rx) = mpsc::sync_channel::<IoMessage>(IO_QUEUE_DEPTH);
        let worker_device = Arc::clone(&device);
        let handle = thread::spawn(move || io_worker_thread(worker_device, rx));
        Self {
            sender: tx,
            device,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Queue one write; the returned completion resolves when it is on the
    /// device (and, for `FlushFua`, after the device cache flush).
    pub fn submit(&self, op: WriteOp, blocknr: u64, data: Vec<u8>) -> IoCompletion {
        let (tx, rx) = mpsc::sync_channel(1);
        let request = WriteRequest {
            op,
            blocknr,
            data,
            completion: tx.clone(),
        };
        if self.sender.send(IoMessage::Write(request)).is_err() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "I/O worker has shut down",
            )));
        }
        IoCompletion { receiver: rx }
    }

    /// Flush the device cache; blocks until done.
    pub fn flush(&self) -> io::Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(IoMessage::Flush(tx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O worker has shut down"))?;
        rx.recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "flush response lost"))?
    }

    /// Open a plug scope that coalesces submissions until finished.
    pub fn plug(&self) -> Plug<'_> {
        Plug {
            worker: self,
            pending: Vec::new(),
        }
    }

    fn shutdown(&self) {
        let _ = self.sender.send(IoMessage::Shutdown);
        if let Some(handle) = self.handle.lock().expect("I/O worker handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Batches write submissions and releases them to the worker in one burst.
pub struct Plug<'a> {
    worker: &'a IoWorker,
    pending: Vec<IoMessage>,
}

impl Plug<'_> {
    pub fn submit(&mut self, op: WriteOp, blocknr: u64, data: Vec<u8>) -> IoCompletion {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pending.push(IoMessage::Write(WriteRequest {
            op,
            blocknr,
            data,
            completion: tx,
        }));
        IoCompletion { receiver: rx }
    }

    /// Release the batch. Dropping the plug does the same.
    pub fn finish(self) {}
}

impl Drop for Plug<'_> {
    fn drop(&mut self) {
        for message in self.pending.drain(..) {
            // A failed send resolves the request's completion with an error
            // when the responder is dropped here.
            let _ = self.worker.sender.send(message);
        }
    }
}

fn io_worker_thread(device: Arc<dyn BlockDevice>, rx: Receiver<IoMessage>) {
    loop {
        match rx.recv() {
            Ok(IoMessage::Write(request)) => {
                let mut result = device.write_block(request.blocknr, &request.data);
                if result.is_ok() && request.op == WriteOp::FlushFua {
                    result = device.sync();
                }
                if let Err(ref e) = result {
                    log::error!("device write of block {} failed: {}", request.blocknr, e);
                }
                let _ = request.completion.send(result);
            }
            Ok(IoMessage::Flush(responder)) => {
                let _ = responder.send(device.sync());
            }
            Ok(IoMessage::Shutdown) | Err(_) => break,
        }
    }
}
