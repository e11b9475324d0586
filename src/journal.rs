//! The journal object and its transaction API
//!
//! A `Journal` owns the circular log region of one device, the running and
//! committing transaction pointers, the sequence counters, and the dedicated
//! commit thread. Writers open handles against the running transaction;
//! commits are requested by tid and waited on through a condvar latch, so
//! many waiters share one commit the way many transactions share one fsync
//! in a group-commit engine.
//!
//! Lock order: journal state lock, then transaction lists, then buffer
//! state. Latch mutexes are leaves and never held across other locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::buffer::{BufferList, JournalBuffer};
use crate::checksum::{fletcher32, CHECKSUM_SEED};
use crate::commit;
use crate::device::{BlockDevice, IoWorker, WriteOp};
use crate::error::{JournalError, Result};
use crate::revoke::RevokeTables;
use crate::tag::{BlockType, Superblock};
use crate::transaction::{DataTag, InodeMapping, Transaction, TxnState};

/// Durability mode of a requested commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Ordering only: the commit record is written, the device flush is
    /// deferred to the checkpoint deadline.
    Osync,
    /// Ordering plus immediate persistence: a journal-device flush follows
    /// the commit record's completion.
    Dsync,
}

/// Negotiated journal features.
#[derive(Debug, Clone)]
pub struct JournalFeatures {
    /// Fold a transaction-wide rolling checksum into the commit record.
    pub checksum: bool,
    /// Checksum data blocks and emit data tags (explicit toggle).
    pub data_checksum: bool,
    /// Submit the commit record before the metadata wait.
    pub async_commit: bool,
    /// Use device barriers around the commit record.
    pub barrier: bool,
    /// Use the wide tag format (64-bit block numbers, per-tag checksums).
    pub wide_blocks: bool,
}

impl Default for JournalFeatures {
    fn default() -> Self {
        Self {
            checksum: true,
            data_checksum: false,
            async_commit: false,
            barrier: true,
            wide_blocks: true,
        }
    }
}

/// Journal construction parameters.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub block_size: usize,
    /// Log area is blocks `[first, maxlen)` of the journal device.
    pub maxlen: u64,
    pub first: u64,
    /// Metadata submit batch size (the write-batch scratch).
    pub wbufsize: usize,
    pub max_transaction_buffers: u32,
    /// Deferred-writeback deadline for non-durable commits (milliseconds).
    pub checkpoint_interval_ms: u64,
    /// Data buffers submitted per plug in the data writeout phase.
    pub data_batch: usize,
    /// Abort the journal when ordered-data writeback fails.
    pub abort_on_syncdata_err: bool,
    pub features: JournalFeatures,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            maxlen: 1024,
            first: 1,
            wbufsize: 256,
            max_transaction_buffers: 256,
            checkpoint_interval_ms: 5000,
            data_batch: 8,
            abort_on_syncdata_err: false,
            features: JournalFeatures::default(),
        }
    }
}

impl JournalConfig {
    /// Commit record submitted concurrently with metadata writes.
    pub fn async_commit() -> Self {
        Self {
            features: JournalFeatures {
                async_commit: true,
                ..JournalFeatures::default()
            },
            ..Default::default()
        }
    }

    /// Data-block checksumming on: the write path emits data tags and the
    /// commit pipeline writes data blocks itself.
    pub fn data_checksummed() -> Self {
        Self {
            features: JournalFeatures {
                data_checksum: true,
                ..JournalFeatures::default()
            },
            ..Default::default()
        }
    }
}

/// Condvar latch in front of atomic state, shared by all wait queues.
pub(crate) struct Latch {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock().expect("latch lock poisoned");
        self.cond.notify_all();
    }

    /// Block while `blocked()` answers true.
    pub(crate) fn wait_while<F: FnMut() -> bool>(&self, mut blocked: F) {
        let mut guard = self.lock.lock().expect("latch lock poisoned");
        while blocked() {
            guard = self.cond.wait(guard).expect("latch wait poisoned");
        }
    }
}

/// Fields guarded by the journal state lock.
pub(crate) struct JournalState {
    pub head: u64,
    pub free: u64,
    pub sequence: u64,
    pub running: Option<Arc<Transaction>>,
    pub committing: Option<Arc<Transaction>>,
    pub flushed: bool,
    pub average_commit_time: Duration,
}

/// Journal history counters, folded in as transactions finish.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JournalStats {
    pub commits: u64,
    pub wait_ms: u64,
    pub running_ms: u64,
    pub locked_ms: u64,
    pub flushing_ms: u64,
    pub logging_ms: u64,
    pub handle_count: u64,
    pub blocks: u64,
    pub blocks_logged: u64,
    pub average_commit_time_us: u64,
}

pub(crate) struct JournalInner {
    pub(crate) config: JournalConfig,
    /// Journal device submission worker.
    pub(crate) io: Arc<IoWorker>,
    /// Filesystem device submission worker; the same worker when the
    /// filesystem shares the journal device.
    pub(crate) fs_io: Arc<IoWorker>,
    pub(crate) same_device: bool,
    pub(crate) uuid: [u8; 16],
    pub(crate) state: RwLock<JournalState>,
    /// Ring of transactions with checkpoint work outstanding.
    pub(crate) checkpoint_ring: Mutex<Vec<Arc<Transaction>>>,
    pub(crate) revoke: RevokeTables,
    pub(crate) commit_request: AtomicU64,
    pub(crate) commit_sequence: AtomicU64,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) wait_updates: Latch,
    pub(crate) wait_done_commit: Latch,
    pub(crate) wait_transaction_locked: Latch,
    pub(crate) commit_latch: Latch,
    pub(crate) stats: Mutex<JournalStats>,
    pub(crate) commit_callback: Mutex<Option<Box<dyn Fn(u64) + Send + Sync>>>,
}

impl JournalInner {
    pub(crate) fn state(&self) -> std::sync::RwLockReadGuard<'_, JournalState> {
        self.state.read().expect("journal state lock poisoned")
    }

    pub(crate) fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, JournalState> {
        self.state.write().expect("journal state lock poisoned")
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn abort(&self, reason: &str) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("journal aborted: {}", reason);
        *self.abort_reason.lock().expect("abort reason lock poisoned") = Some(reason.to_string());
        // Waiters must observe the poisoning, whatever they wait on.
        self.wait_updates.notify_all();
        self.wait_done_commit.notify_all();
        self.wait_transaction_locked.notify_all();
        self.commit_latch.notify_all();
    }

    /// Advance the log head and hand out the next free log block.
    pub(crate) fn next_log_block(&self) -> Result<u64> {
        let mut state = self.state_mut();
        if state.free == 0 {
            return Err(JournalError::NoSpace);
        }
        let blocknr = state.head;
        state.head += 1;
        if state.head >= self.config.maxlen {
            state.head = self.config.first;
        }
        state.free -= 1;
        Ok(blocknr)
    }

    /// A fresh, zeroed journal block bound to the next free log position.
    pub(crate) fn get_descriptor_buffer(&self) -> Result<Arc<JournalBuffer>> {
        let blocknr = self.next_log_block()?;
        Ok(JournalBuffer::new(blocknr, vec![0u8; self.config.block_size]))
    }

    /// Rewrite the journal superblock from current state.
    pub(crate) fn write_superblock(&self) -> Result<()> {
        let block = {
            let state = self.state();
            Superblock {
                sequence: state.sequence as u32,
                head: state.head as u32,
                free: state.free as u32,
            }
            .encode_block(self.config.block_size)
        };
        let op = if self.config.features.barrier {
            WriteOp::FlushFua
        } else {
            WriteOp::Sync
        };
        self.io.submit(op, 0, block).wait()?;
        Ok(())
    }

    /// Return a finished checkpoint transaction's log span to the free pool.
    pub(crate) fn reclaim_log_space(&self, blocks: u64) {
        let mut state = self.state_mut();
        state.free += blocks;
        state.flushed = true;
    }
}

/// A block-level write-ahead journal with split-durability commits.
pub struct Journal {
    inner: Arc<JournalInner>,
    commit_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Open a journal over `device`, with the filesystem blocks living on
    /// `fs_device` (or on the same device when `None`).
    pub fn create(
        device: Arc<dyn BlockDevice>,
        fs_device: Option<Arc<dyn BlockDevice>>,
        config: JournalConfig,
    ) -> Result<Journal> {
        if config.first == 0 || config.first >= config.maxlen {
            return Err(JournalError::InvalidState("log geometry leaves no room"));
        }
        if device.block_size() != config.block_size {
            return Err(JournalError::InvalidState("device block size mismatch"));
        }

        let io = Arc::new(IoWorker::spawn(device));
        let (fs_io, same_device) = match fs_device {
            Some(fs) => (Arc::new(IoWorker::spawn(fs)), false),
            None => (Arc::clone(&io), true),
        };

        let free = config.maxlen - config.first;
        let head = config.first;
        let inner = Arc::new(JournalInner {
            uuid: rand::random(),
            io,
            fs_io,
            same_device,
            state: RwLock::new(JournalState {
                head,
                free,
                sequence: 1,
                running: None,
                committing: None,
                flushed: false,
                average_commit_time: Duration::ZERO,
            }),
            checkpoint_ring: Mutex::new(Vec::new()),
            revoke: RevokeTables::new(),
            commit_request: AtomicU64::new(0),
            commit_sequence: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            wait_updates: Latch::new(),
            wait_done_commit: Latch::new(),
            wait_transaction_locked: Latch::new(),
            commit_latch: Latch::new(),
            stats: Mutex::new(JournalStats::default()),
            commit_callback: Mutex::new(None),
            config,
        });

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("bedrock-commit".to_string())
            .spawn(move || commit::commit_thread_loop(thread_inner))
            .map_err(JournalError::Io)?;

        log::info!(
            "journal created: {} log blocks of {} bytes",
            inner.config.maxlen - inner.config.first,
            inner.config.block_size
        );

        Ok(Journal {
            inner,
            commit_thread: Mutex::new(Some(handle)),
        })
    }

    /// Open a handle against the running transaction, reserving `nblocks`
    /// of log credits. Opens a new transaction if none is running; blocks
    /// while the running transaction is being locked down or is full.
    pub fn start(&self, nblocks: u32) -> Result<TxnHandle> {
        let started_at = std::time::Instant::now();
        loop {
            if self.inner.is_aborted() {
                return Err(JournalError::Aborted);
            }

            let candidate = {
                let mut state = self.inner.state_mut();
                if state.running.is_none() {
                    let tid = state.sequence;
                    state.sequence += 1;
                    state.running = Some(Transaction::new(tid));
                    log::debug!("opened transaction {}", tid);
                }
                let txn = state.running.clone().expect("running transaction just installed");

                if txn.state() == TxnState::Running {
                    let credits = txn.outstanding_credits.load(Ordering::SeqCst);
                    if credits + nblocks <= self.inner.config.max_transaction_buffers {
                        txn.updates.fetch_add(1, Ordering::SeqCst);
                        txn.handle_count.fetch_add(1, Ordering::SeqCst);
                        txn.outstanding_credits.fetch_add(nblocks, Ordering::SeqCst);
                        let waited = started_at.elapsed();
                        {
                            let mut max_wait =
                                txn.max_wait.lock().expect("max wait lock poisoned");
                            if waited > *max_wait {
                                *max_wait = waited;
                            }
                        }
                        return Ok(TxnHandle {
                            journal: Arc::clone(&self.inner),
                            txn,
                            done: false,
                        });
                    }
                }
                txn
            };

            // The running transaction is locked down or out of credits:
            // push it to commit and wait for the next one to open.
            let stale_tid = candidate.tid();
            self.log_start_commit(stale_tid);
            let inner = &self.inner;
            self.inner.wait_transaction_locked.wait_while(|| {
                if inner.is_aborted() || inner.shutdown.load(Ordering::SeqCst) {
                    return false;
                }
                match &inner.state().running {
                    Some(running) => running.tid() == stale_tid,
                    None => false,
                }
            });
        }
    }

    /// Request a commit of the transaction `tid`. Returns true if this call
    /// started the commit.
    pub fn log_start_commit(&self, tid: u64) -> bool {
        let prior = self.inner.commit_request.fetch_max(tid, Ordering::SeqCst);
        if prior < tid {
            log::debug!("commit of transaction {} requested", tid);
            self.inner.commit_latch.notify_all();
            true
        } else {
            false
        }
    }

    /// Block until transaction `tid` has committed.
    pub fn log_wait_commit(&self, tid: u64) -> Result<()> {
        let inner = &self.inner;
        inner.wait_done_commit.wait_while(|| {
            inner.commit_sequence.load(Ordering::SeqCst) < tid
                && !inner.is_aborted()
                && !inner.shutdown.load(Ordering::SeqCst)
        });
        if inner.is_aborted() {
            Err(JournalError::Aborted)
        } else if inner.commit_sequence.load(Ordering::SeqCst) >= tid {
            Ok(())
        } else {
            Err(JournalError::Shutdown)
        }
    }

    /// Request a split-durability commit: OSYNC promises ordering only,
    /// DSYNC adds a journal-device flush after the commit record.
    pub fn log_start_optfs_commit(&self, tid: u64, mode: CommitMode) -> bool {
        if mode == CommitMode::Dsync {
            let state = self.inner.state();
            for txn in state.running.iter().chain(state.committing.iter()) {
                if txn.tid() == tid {
                    txn.set_durable();
                }
            }
        }
        self.log_start_commit(tid)
    }

    /// Commit the running transaction and wait for it (ordering semantics).
    pub fn force_commit(&self) -> Result<()> {
        self.force_commit_mode(CommitMode::Osync)
    }

    /// Commit the running transaction and wait for it to be durable.
    pub fn force_commit_durable(&self) -> Result<()> {
        self.force_commit_mode(CommitMode::Dsync)
    }

    fn force_commit_mode(&self, mode: CommitMode) -> Result<()> {
        if self.inner.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let tid = {
            let state = self.inner.state();
            match &state.running {
                Some(running) => running.tid(),
                None => return Ok(()),
            }
        };
        self.log_start_optfs_commit(tid, mode);
        self.log_wait_commit(tid)
    }

    /// Poison the journal. Sticky: all future commits become no-ops and all
    /// transaction-API calls answer `Aborted`.
    pub fn abort(&self, reason: &str) {
        self.inner.abort(reason);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.inner
            .abort_reason
            .lock()
            .expect("abort reason lock poisoned")
            .clone()
    }

    /// Highest committed transaction id.
    pub fn commit_sequence(&self) -> u64 {
        self.inner.commit_sequence.load(Ordering::SeqCst)
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.inner.uuid
    }

    /// Snapshot of the journal history counters.
    pub fn stats(&self) -> JournalStats {
        self.inner.stats.lock().expect("journal stats lock poisoned").clone()
    }

    /// Install a callback fired after each commit finishes.
    pub fn set_commit_callback<F: Fn(u64) + Send + Sync + 'static>(&self, callback: F) {
        *self
            .inner
            .commit_callback
            .lock()
            .expect("commit callback lock poisoned") = Some(Box::new(callback));
    }

    /// Write back checkpoint buffers whose deadline has passed, then drop
    /// what the log no longer needs.
    pub fn checkpoint_writeback(&self) -> Result<()> {
        crate::checkpoint::writeback_due(&self.inner)
    }

    pub(crate) fn inner(&self) -> &Arc<JournalInner> {
        &self.inner
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        // Push any open transaction through a final commit, then stop the
        // daemon.
        if !self.inner.is_aborted() {
            let tid = self.inner.state().running.as_ref().map(|t| t.tid());
            if let Some(tid) = tid {
                self.log_start_commit(tid);
            }
        }
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.commit_latch.notify_all();
        self.inner.wait_done_commit.notify_all();
        self.inner.wait_transaction_locked.notify_all();
        if let Some(handle) = self
            .commit_thread
            .lock()
            .expect("commit thread handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

/// Writer-side handle on the running transaction.
pub struct TxnHandle {
    journal: Arc<JournalInner>,
    txn: Arc<Transaction>,
    done: bool,
}

impl TxnHandle {
    pub fn tid(&self) -> u64 {
        self.txn.tid()
    }

    /// Declare intent to modify a metadata buffer. A buffer parked on a
    /// checkpoint list is pulled off it first; one still owned by the
    /// committing transaction is only marked for hand-off, since its frozen
    /// copy keeps the in-flight log write stable.
    pub fn get_write_access(&self, buf: &Arc<JournalBuffer>) -> Result<()> {
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        if buf.list() == BufferList::Checkpoint {
            crate::checkpoint::remove_checkpoint(&self.journal, buf);
        }
        let owner = buf.state().txn_tid;
        match owner {
            None => {
                self.txn.file_buffer(buf, BufferList::Reserved);
                Ok(())
            }
            Some(tid) if tid == self.txn.tid() => Ok(()),
            Some(_) => {
                buf.state().next_txn_tid = Some(self.txn.tid());
                Ok(())
            }
        }
    }

    /// Like `get_write_access`, but keeps an undo copy of the committed
    /// contents.
    pub fn get_undo_access(&self, buf: &Arc<JournalBuffer>) -> Result<()> {
        self.get_write_access(buf)?;
        let mut state = buf.state();
        if state.committed_data.is_none() {
            drop(state);
            let undo = buf.data();
            buf.state().committed_data = Some(undo);
        }
        Ok(())
    }

    /// File a modified metadata buffer for journaling by this transaction.
    pub fn dirty_metadata(&self, buf: &Arc<JournalBuffer>) -> Result<()> {
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let owner = buf.state().txn_tid;
        match owner {
            Some(tid) if tid == self.txn.tid() => {
                buf.set_dirty();
                if buf.list() != BufferList::Metadata {
                    self.txn.file_buffer(buf, BufferList::Metadata);
                }
                Ok(())
            }
            Some(_) => {
                // Owned by the committing transaction; it migrates through
                // the checkpoint hand-off.
                buf.set_dirty();
                buf.state().next_txn_tid = Some(self.txn.tid());
                Ok(())
            }
            None => Err(JournalError::Transaction(format!(
                "buffer {} dirtied without write access",
                buf.blocknr()
            ))),
        }
    }

    /// File a data buffer on the ordered-data list. Newly appended data
    /// gets a data tag when data checksumming is enabled.
    pub fn dirty_data(&self, buf: &Arc<JournalBuffer>, block_type: BlockType) -> Result<()> {
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        if buf.list() == BufferList::Checkpoint {
            crate::checkpoint::remove_checkpoint(&self.journal, buf);
        }
        {
            let mut state = buf.state();
            state.block_type = block_type;
            state.dirty = true;
        }
        self.txn.file_buffer(buf, BufferList::DirtyData);
        self.txn.set_need_data_flush();
        if self.journal.config.features.data_checksum && block_type == BlockType::DataNewlyAppended
        {
            let checksum = fletcher32(CHECKSUM_SEED, &buf.data());
            self.txn.add_data_tag(DataTag {
                blocknr: buf.blocknr(),
                checksum,
            });
        }
        Ok(())
    }

    /// Attach an inode whose dirty pages must be written before the commit
    /// record.
    pub fn add_inode(&self, inode: Arc<InodeMapping>) -> Result<()> {
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        self.txn.add_inode(inode);
        Ok(())
    }

    /// Record a data tag directly; the data write path's hook when it has
    /// already checksummed the block.
    pub fn add_data_tag(&self, blocknr: u64, checksum: u32) -> Result<()> {
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        self.txn.add_data_tag(DataTag { blocknr, checksum });
        Ok(())
    }

    /// Record that a previously journaled block must not be replayed.
    pub fn revoke(&self, blocknr: u64) -> Result<()> {
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        self.journal.revoke.record(blocknr);
        Ok(())
    }

    /// Mark this transaction as requiring durable commit semantics.
    pub fn set_durable(&self) {
        self.txn.set_durable();
    }

    fn detach(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.txn.updates.fetch_sub(1, Ordering::SeqCst);
        self.journal.wait_updates.notify_all();
    }

    /// Close the handle, letting the transaction quiesce.
    pub fn stop(mut self) -> Result<()> {
        self.detach();
        if self.journal.is_aborted() {
            return Err(JournalError::Aborted);
        }
        Ok(())
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn small_config() -> JournalConfig {
        JournalConfig {
            block_size: 512,
            maxlen: 64,
            first: 1,
            ..Default::default()
        }
    }

    fn open_journal() -> (Arc<MemDevice>, Journal) {
        let device = Arc::new(MemDevice::new(512, 128));
        let journal = Journal::create(
            Arc::clone(&device) as Arc<dyn BlockDevice>,
            None,
            small_config(),
        )
        .unwrap();
        (device, journal)
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        let device = Arc::new(MemDevice::new(512, 8));
        let config = JournalConfig {
            block_size: 512,
            maxlen: 1,
            first: 1,
            ..Default::default()
        };
        assert!(Journal::create(device as Arc<dyn BlockDevice>, None, config).is_err());
    }

    #[test]
    fn test_create_rejects_block_size_mismatch() {
        let device = Arc::new(MemDevice::new(512, 8));
        let config = JournalConfig {
            block_size: 4096,
            ..small_config()
        };
        assert!(Journal::create(device as Arc<dyn BlockDevice>, None, config).is_err());
    }

    #[test]
    fn test_start_opens_running_transaction() {
        let (_device, journal) = open_journal();
        let handle = journal.start(4).unwrap();
        assert_eq!(handle.tid(), 1);
        handle.stop().unwrap();
    }

    #[test]
    fn test_handles_share_running_transaction() {
        let (_device, journal) = open_journal();
        let h1 = journal.start(1).unwrap();
        let h2 = journal.start(1).unwrap();
        assert_eq!(h1.tid(), h2.tid());
        h1.stop().unwrap();
        h2.stop().unwrap();
    }

    #[test]
    fn test_next_log_block_wraps_and_exhausts() {
        let (_device, journal) = open_journal();
        let inner = journal.inner();
        let total = inner.config.maxlen - inner.config.first;
        for i in 0..total {
            let blocknr = inner.next_log_block().unwrap();
            assert!(blocknr >= inner.config.first && blocknr < inner.config.maxlen);
            if i == 0 {
                assert_eq!(blocknr, inner.config.first);
            }
        }
        match inner.next_log_block() {
            Err(JournalError::NoSpace) => {}
            other => panic!("expected NoSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_is_sticky_and_fails_api() {
        let (_device, journal) = open_journal();
        journal.abort("test poisoning");
        assert!(journal.is_aborted());
        assert_eq!(journal.abort_reason().as_deref(), Some("test poisoning"));
        match journal.start(1) {
            Err(JournalError::Aborted) => {}
            other => panic!("expected Aborted, got {:?}", other.map(|_| ())),
        }
        match journal.force_commit() {
            Err(JournalError::Aborted) => {}
            other => panic!("expected Aborted, got {:?}", other),
        }
    }

    #[test]
    fn test_dirty_metadata_requires_write_access() {
        let (_device, journal) = open_journal();
        let handle = journal.start(2).unwrap();
        let buf = JournalBuffer::new(40, vec![0u8; 512]);
        assert!(handle.dirty_metadata(&buf).is_err());
        handle.get_write_access(&buf).unwrap();
        handle.dirty_metadata(&buf).unwrap();
        assert_eq!(buf.list(), BufferList::Metadata);
        handle.stop().unwrap();
    }

    #[test]
    fn test_force_commit_with_no_transaction_is_noop() {
        let (_device, journal) = open_journal();
        journal.force_commit().unwrap();
        assert_eq!(journal.commit_sequence(), 0);
    }

    #[test]
    fn test_handle_drop_releases_updates() {
        let (_device, journal) = open_journal();
        let handle = journal.start(1).unwrap();
        let txn = {
            let state = journal.inner().state();
            state.running.clone().unwrap()
        };
        assert_eq!(txn.updates.load(Ordering::SeqCst), 1);
        drop(handle);
        assert_eq!(txn.updates.load(Ordering::SeqCst), 0);
    }
}
