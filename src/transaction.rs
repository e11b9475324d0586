//! Transaction object and buffer-list bookkeeping
//!
//! A transaction aggregates the buffers, inodes, revokes and data tags that
//! must land in the log atomically. Its state advances once per commit-phase
//! boundary; writers attach while it is Running and drain away before it is
//! Locked. All list-membership transitions go through `file_buffer` /
//! `unfile_buffer` / `refile_buffer` so a buffer is never on two lists.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::buffer::{BufferList, JournalBuffer};

/// Commit progress of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Running,
    Locked,
    Flush,
    Commit,
    CommitDflush,
    CommitJflush,
    Finished,
}

/// A (block number, checksum) pair recorded by the data write path and
/// drained into descriptor tags at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTag {
    pub blocknr: u64,
    pub checksum: u32,
}

/// Stand-in for an inode's page-cache mapping: the dirty data pages a
/// committing transaction must write back, plus the sticky error slot a
/// later fsync re-observes.
pub struct InodeMapping {
    ino: u64,
    pages: Mutex<Vec<Arc<JournalBuffer>>>,
    error: Mutex<Option<io::ErrorKind>>,
}

impl InodeMapping {
    pub fn new(ino: u64) -> Arc<Self> {
        Arc::new(Self {
            ino,
            pages: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn add_dirty_page(&self, page: Arc<JournalBuffer>) {
        self.pages.lock().expect("inode pages lock poisoned").push(page);
    }

    pub fn dirty_pages(&self) -> Vec<Arc<JournalBuffer>> {
        self.pages.lock().expect("inode pages lock poisoned").clone()
    }

    pub fn nrpages(&self) -> usize {
        self.pages.lock().expect("inode pages lock poisoned").len()
    }

    pub fn record_error(&self, kind: io::ErrorKind) {
        let mut slot = self.error.lock().expect("inode error lock poisoned");
        if slot.is_none() {
            *slot = Some(kind);
        }
    }

    /// Consume the recorded writeback error, if any.
    pub fn take_error(&self) -> Option<io::Error> {
        self.error
            .lock()
            .expect("inode error lock poisoned")
            .take()
            .map(|kind| io::Error::new(kind, "deferred data writeback error"))
    }
}

/// The buffer lists a transaction owns. Guarded by one lock per
/// transaction; buffer state locks nest inside it.
#[derive(Default)]
pub struct TxnLists {
    pub reserved: VecDeque<Arc<JournalBuffer>>,
    pub metadata: VecDeque<Arc<JournalBuffer>>,
    pub io: VecDeque<Arc<JournalBuffer>>,
    pub shadow: VecDeque<Arc<JournalBuffer>>,
    pub log_ctl: VecDeque<Arc<JournalBuffer>>,
    pub forget: VecDeque<Arc<JournalBuffer>>,
    pub checkpoint: VecDeque<Arc<JournalBuffer>>,
    pub dirty_data: VecDeque<Arc<JournalBuffer>>,
    pub inodes: Vec<Arc<InodeMapping>>,
    pub data_tags: VecDeque<DataTag>,
}

impl TxnLists {
    fn list_mut(&mut self, list: BufferList) -> Option<&mut VecDeque<Arc<JournalBuffer>>> {
        match list {
            BufferList::Reserved => Some(&mut self.reserved),
            BufferList::Metadata => Some(&mut self.metadata),
            BufferList::Io => Some(&mut self.io),
            BufferList::Shadow => Some(&mut self.shadow),
            BufferList::LogCtl => Some(&mut self.log_ctl),
            BufferList::Forget => Some(&mut self.forget),
            BufferList::Checkpoint => Some(&mut self.checkpoint),
            BufferList::DirtyData => Some(&mut self.dirty_data),
            BufferList::None => None,
        }
    }

    fn remove(&mut self, list: BufferList, buf: &Arc<JournalBuffer>) {
        if let Some(queue) = self.list_mut(list) {
            if let Some(pos) = queue.iter().position(|b| Arc::ptr_eq(b, buf)) {
                queue.remove(pos);
            }
        }
    }
}

/// Per-transaction timing and volume counters, folded into the journal
/// history when the transaction finishes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TransactionStats {
    pub wait_ms: u64,
    pub running_ms: u64,
    pub locked_ms: u64,
    pub flushing_ms: u64,
    pub logging_ms: u64,
    pub handle_count: u64,
    pub blocks: u64,
    pub blocks_logged: u64,
}

/// One journal transaction.
pub struct Transaction {
    tid: u64,
    state: Mutex<TxnState>,
    lists: Mutex<TxnLists>,
    pub updates: AtomicU32,
    pub outstanding_credits: AtomicU32,
    pub handle_count: AtomicU32,
    durable: AtomicBool,
    need_data_flush: AtomicBool,
    pub log_start: AtomicU64,
    /// Log blocks consumed by this transaction, for space reclaim when its
    /// checkpoint record is dropped.
    pub blocks_used: AtomicU64,
    pub checkpoint_deadline: Mutex<Option<Instant>>,
    pub start_time: Instant,
    pub max_wait: Mutex<Duration>,
    pub stats: Mutex<TransactionStats>,
    /// Serializes the ordered-data path against commit; held by the commit
    /// thread for the whole pipeline.
    pub dirty_data_mutex: Mutex<()>,
}

impl Transaction {
    pub fn new(tid: u64) -> Arc<Self> {
        Arc::new(Self {
            tid,
            state: Mutex::new(TxnState::Running),
            lists: Mutex::new(TxnLists::default()),
            updates: AtomicU32::new(0),
            outstanding_credits: AtomicU32::new(0),
            handle_count: AtomicU32::new(0),
            durable: AtomicBool::new(false),
            need_data_flush: AtomicBool::new(false),
            log_start: AtomicU64::new(0),
            blocks_used: AtomicU64::new(0),
            checkpoint_deadline: Mutex::new(None),
            start_time: Instant::now(),
            max_wait: Mutex::new(Duration::ZERO),
            stats: Mutex::new(TransactionStats::default()),
            dirty_data_mutex: Mutex::new(()),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().expect("transaction state lock poisoned")
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock().expect("transaction state lock poisoned") = state;
    }

    pub fn set_durable(&self) {
        self.durable.store(true, Ordering::SeqCst);
    }

    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    pub fn set_need_data_flush(&self) {
        self.need_data_flush.store(true, Ordering::SeqCst);
    }

    pub fn need_data_flush(&self) -> bool {
        self.need_data_flush.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> MutexGuard<'_, TxnLists> {
        self.lists.lock().expect("transaction lists lock poisoned")
    }

    /// Place a buffer on `list`, removing it from whichever list it was on.
    pub fn file_buffer(&self, buf: &Arc<JournalBuffer>, list: BufferList) {
        let mut lists = self.lists();
        let mut state = buf.state();
        if state.list != BufferList::None {
            lists.remove(state.list, buf);
        }
        if let Some(queue) = lists.list_mut(list) {
            queue.push_back(Arc::clone(buf));
        }
        state.list = list;
        state.txn_tid = if list == BufferList::None {
            None
        } else {
            Some(self.tid)
        };
    }

    /// Drop a buffer from its current list.
    pub fn unfile_buffer(&self, buf: &Arc<JournalBuffer>) {
        self.file_buffer(buf, BufferList::None);
    }

    /// Move a buffer to the list its current state calls for: spent
    /// reservations unfile, written-out working buffers go to Forget.
    pub fn refile_buffer(&self, buf: &Arc<JournalBuffer>) {
        let current = buf.list();
        let target = match current {
            BufferList::Reserved => BufferList::None,
            BufferList::Metadata | BufferList::DirtyData | BufferList::Shadow => BufferList::Forget,
            _ => BufferList::None,
        };
        self.file_buffer(buf, target);
    }

    pub fn add_data_tag(&self, tag: DataTag) {
        self.lists().data_tags.push_back(tag);
    }

    pub fn add_inode(&self, inode: Arc<InodeMapping>) {
        let mut lists = self.lists();
        if !lists.inodes.iter().any(|i| Arc::ptr_eq(i, &inode)) {
            lists.inodes.push(inode);
        }
        self.set_need_data_flush();
    }
}
