//! Per-block journaling state
//!
//! A `JournalBuffer` is the journaling view of one filesystem block: its
//! list membership inside a transaction, its dirty/uptodate/jwrite flags,
//! frozen and undo copies, and the in-flight I/O completion that stands in
//! for the buffer lock. Handles are `Arc`-shared; a buffer is never freed
//! while a list or an I/O completion still holds a reference.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::device::IoCompletion;
use crate::tag::{BlockType, JOURNAL_MAGIC};

/// Which journaling list a buffer currently sits on. A buffer is on at most
/// one list at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferList {
    None,
    Reserved,
    Metadata,
    Io,
    Shadow,
    LogCtl,
    Forget,
    Checkpoint,
    DirtyData,
}

/// Mutable journaling state of one buffer, guarded by the buffer state lock.
pub struct BufferState {
    pub list: BufferList,
    pub block_type: BlockType,
    pub dirty: bool,
    pub uptodate: bool,
    pub jwrite: bool,
    /// Honored by the writeback path: do not write before the deadline.
    pub delayed_write: bool,
    /// Snapshot taken when the shadow/IO pair was created.
    pub frozen_data: Option<Vec<u8>>,
    /// Undo copy kept for get-undo-access callers.
    pub committed_data: Option<Vec<u8>>,
    pub checkpoint_deadline: Option<Instant>,
    /// Transaction currently owning this buffer.
    pub txn_tid: Option<u64>,
    /// Transaction that touched the buffer while it was being committed.
    pub next_txn_tid: Option<u64>,
    /// Checkpoint transaction this buffer is recorded against.
    pub checkpoint_tid: Option<u64>,
    pending_io: Option<IoCompletion>,
    /// On an IO twin, the shadowed original it was copied from.
    pub shadow_of: Option<Arc<JournalBuffer>>,
}

impl BufferState {
    fn new(block_type: BlockType) -> Self {
        Self {
            list: BufferList::None,
            block_type,
            dirty: false,
            uptodate: true,
            jwrite: false,
            delayed_write: false,
            frozen_data: None,
            committed_data: None,
            checkpoint_deadline: None,
            txn_tid: None,
            next_txn_tid: None,
            checkpoint_tid: None,
            pending_io: None,
            shadow_of: None,
        }
    }
}

/// Journaling handle for one block.
pub struct JournalBuffer {
    blocknr: u64,
    data: Mutex<Vec<u8>>,
    state: Mutex<BufferState>,
}

impl JournalBuffer {
    pub fn new(blocknr: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            blocknr,
            data: Mutex::new(data),
            state: Mutex::new(BufferState::new(BlockType::NotData)),
        })
    }

    pub fn new_data(blocknr: u64, data: Vec<u8>, block_type: BlockType) -> Arc<Self> {
        Arc::new(Self {
            blocknr,
            data: Mutex::new(data),
            state: Mutex::new(BufferState::new(block_type)),
        })
    }

    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    /// Copy of the current contents.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().expect("buffer data lock poisoned").clone()
    }

    pub fn set_data(&self, data: Vec<u8>) {
        *self.data.lock().expect("buffer data lock poisoned") = data;
    }

    pub fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().expect("buffer state lock poisoned")
    }

    pub fn list(&self) -> BufferList {
        self.state().list
    }

    pub fn block_type(&self) -> BlockType {
        self.state().block_type
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn set_dirty(&self) {
        self.state().dirty = true;
    }

    pub fn clear_dirty(&self) {
        self.state().dirty = false;
    }

    /// Attach an in-flight write; the buffer counts as locked until waited.
    pub fn set_pending_io(&self, completion: IoCompletion) {
        let mut state = self.state();
        debug_assert!(state.pending_io.is_none(), "buffer already has I/O in flight");
        state.pending_io = Some(completion);
    }

    pub fn locked(&self) -> bool {
        self.state().pending_io.is_some()
    }

    /// Block until any in-flight write completes. Updates uptodate from the
    /// result; a buffer without pending I/O returns immediately.
    pub fn wait_on_buffer(&self) -> io::Result<()> {
        let pending = self.state().pending_io.take();
        match pending {
            Some(completion) => {
                let result = completion.wait();
                self.state().uptodate = result.is_ok();
                result
            }
            None => Ok(()),
        }
    }
}

/// Flags returned by `write_metadata_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataCopyFlags {
    /// The first word of the buffer collided with the journal magic; the
    /// on-log copy has it zeroed and the tag must say so.
    pub escaped: bool,
}

/// Create the shadow/IO pair for a metadata buffer bound for `dest_blocknr`
/// in the log. The original keeps the frozen snapshot and is marked Shadow
/// by the caller; the returned twin carries the (possibly escaped) copy.
pub fn write_metadata_buffer(
    original: &Arc<JournalBuffer>,
    dest_blocknr: u64,
) -> (Arc<JournalBuffer>, MetadataCopyFlags) {
    let snapshot = original.data();

    let mut copy = snapshot.clone();
    let escaped = copy.len() >= 4
        && u32::from_be_bytes([copy[0], copy[1], copy[2], copy[3]]) == JOURNAL_MAGIC;
    if escaped {
        copy[0..4].copy_from_slice(&[0u8; 4]);
    }

    original.state().frozen_data = Some(snapshot);

    let twin = JournalBuffer::new(dest_blocknr, copy);
    twin.state().shadow_of = Some(Arc::clone(original));

    (twin, MetadataCopyFlags { escaped })
}
