//! Checkpoint hand-off and reclaim
//!
//! Committed buffers wait on a checkpoint list until they reach their home
//! locations, after which the log span that described them can be reused.
//! Non-durable commits stamp a deferred deadline on each buffer; the
//! writeback pass honors it, which is what buys an ordered commit its
//! cheapness.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{BufferList, JournalBuffer};
use crate::device::WriteOp;
use crate::error::Result;
use crate::journal::JournalInner;
use crate::transaction::Transaction;

/// Record a still-dirty committed buffer against `txn` for later writeback.
pub(crate) fn insert_checkpoint(txn: &Arc<Transaction>, buf: &Arc<JournalBuffer>) {
    buf.state().checkpoint_tid = Some(txn.tid());
    txn.file_buffer(buf, BufferList::Checkpoint);
}

/// Drop a buffer from whatever checkpoint transaction it is recorded
/// against. Safe to call when it is recorded against none.
pub(crate) fn remove_checkpoint(inner: &JournalInner, buf: &Arc<JournalBuffer>) {
    let tid = buf.state().checkpoint_tid;
    let tid = match tid {
        Some(tid) => tid,
        None => return,
    };
    let owner = {
        let ring = inner
            .checkpoint_ring
            .lock()
            .expect("checkpoint ring lock poisoned");
        ring.iter().find(|txn| txn.tid() == tid).cloned()
    };
    if let Some(owner) = owner {
        if buf.list() == BufferList::Checkpoint {
            owner.unfile_buffer(buf);
        }
    }
    buf.state().checkpoint_tid = None;
}

/// One cleanup pass over the checkpoint ring: drop buffers that are already
/// clean, then retire transactions whose checkpoint lists have emptied and
/// return their log spans to the free pool.
pub(crate) fn clean_checkpoint_list(inner: &JournalInner) {
    let ring: Vec<Arc<Transaction>> = inner
        .checkpoint_ring
        .lock()
        .expect("checkpoint ring lock poisoned")
        .clone();

    for txn in &ring {
        let buffers: Vec<Arc<JournalBuffer>> =
            txn.lists().checkpoint.iter().cloned().collect();
        for buf in buffers {
            if !buf.is_dirty() && !buf.locked() {
                buf.state().checkpoint_tid = None;
                txn.unfile_buffer(&buf);
            }
        }
    }

    drop_finished_transactions(inner);
}

/// Write back checkpoint buffers whose deadline has passed, then reclaim.
pub(crate) fn writeback_due(inner: &JournalInner) -> Result<()> {
    let now = Instant::now();
    let ring: Vec<Arc<Transaction>> = inner
        .checkpoint_ring
        .lock()
        .expect("checkpoint ring lock poisoned")
        .clone();

    for txn in &ring {
        let buffers: Vec<Arc<JournalBuffer>> =
            txn.lists().checkpoint.iter().cloned().collect();
        let mut pending = Vec::new();
        for buf in &buffers {
            let due = buf
                .state()
                .checkpoint_deadline
                .map(|deadline| deadline <= now)
                .unwrap_or(true);
            if !due || !buf.is_dirty() {
                continue;
            }
            let completion = inner.fs_io.submit(WriteOp::Sync, buf.blocknr(), buf.data());
            buf.set_pending_io(completion);
            pending.push(Arc::clone(buf));
        }
        for buf in pending {
            buf.wait_on_buffer()?;
            {
                let mut state = buf.state();
                state.dirty = false;
                state.delayed_write = false;
                state.checkpoint_tid = None;
            }
            txn.unfile_buffer(&buf);
        }
    }

    drop_finished_transactions(inner);
    Ok(())
}

/// Retire ring entries whose checkpoint lists are empty, reclaiming their
/// log space.
fn drop_finished_transactions(inner: &JournalInner) {
    let mut dropped: Vec<Arc<Transaction>> = Vec::new();
    {
        let mut ring = inner
            .checkpoint_ring
            .lock()
            .expect("checkpoint ring lock poisoned");
        ring.retain(|txn| {
            if txn.lists().checkpoint.is_empty() {
                dropped.push(Arc::clone(txn));
                false
            } else {
                true
            }
        });
    }
    for txn in dropped {
        let blocks = txn.blocks_used.load(std::sync::atomic::Ordering::SeqCst);
        log::debug!(
            "dropping checkpointed transaction {}, reclaiming {} log blocks",
            txn.tid(),
            blocks
        );
        inner.reclaim_log_space(blocks);
    }
}
