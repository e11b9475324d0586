//! The commit pipeline
//!
//! The primary routine for committing a transaction to the log, run to
//! completion on the journal's dedicated commit thread. Seven phases: lock
//! down the running transaction, switch the revoke table and publish the
//! next transaction slot, write out ordered data, write inode data and
//! revoke records, journal the metadata through descriptor-tagged log
//! writes, wait out the log I/O and emit the commit record, then hand the
//! surviving buffers to the checkpoint list with their writeback deadline.
//!
//! Blocking is permitted only at the stated wait points; no spin-guarded
//! state is held across them.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::buffer::{self, BufferList, JournalBuffer};
use crate::checkpoint;
use crate::checksum::{fletcher32, CHECKSUM_SEED};
use crate::device::{IoCompletion, WriteOp};
use crate::journal::JournalInner;
use crate::tag::{
    encode_revoke_block, max_revoke_entries, tag_bytes, BlockType, CommitBlock, DescriptorBuilder,
    CHECKSUM_SIZE, CHECKSUM_TYPE_FLETCHER32, TAG_FLAG_ESCAPE, UUID_SIZE,
};
use crate::transaction::{Transaction, TxnState};

/// Daemon loop: sleep until a commit is requested or the journal shuts
/// down, then run one full commit. Pending requests are drained before a
/// shutdown is honored.
pub(crate) fn commit_thread_loop(inner: Arc<JournalInner>) {
    loop {
        inner.commit_latch.wait_while(|| {
            !inner.shutdown.load(Ordering::SeqCst)
                && inner.commit_request.load(Ordering::SeqCst)
                    <= inner.commit_sequence.load(Ordering::SeqCst)
        });

        if inner.commit_request.load(Ordering::SeqCst) > inner.commit_sequence.load(Ordering::SeqCst)
        {
            journal_commit_transaction(&inner);
            continue;
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            log::debug!("commit thread exiting");
            return;
        }
    }
}

/// Commit the running transaction to the log.
fn journal_commit_transaction(inner: &Arc<JournalInner>) {
    // Erase the effects of a prior wholesale log flush before locking down.
    if inner.state().flushed {
        log::debug!("superblock deferred update");
        if let Err(e) = inner.write_superblock() {
            inner.abort(&format!("superblock update failed: {}", e));
        }
        inner.state_mut().flushed = false;
    }

    let commit_transaction = match inner.state().running.clone() {
        Some(txn) => txn,
        None => {
            // Nothing to commit; satisfy the waiters for this request.
            let request = inner.commit_request.load(Ordering::SeqCst);
            inner.commit_sequence.fetch_max(request, Ordering::SeqCst);
            inner.wait_done_commit.notify_all();
            return;
        }
    };
    let tid = commit_transaction.tid();
    debug_assert!(inner.state().committing.is_none());
    debug_assert_eq!(commit_transaction.state(), TxnState::Running);

    let start_time = Instant::now();
    let _dirty_data_guard = commit_transaction
        .dirty_data_mutex
        .lock()
        .expect("dirty data mutex poisoned");
    log::debug!("starting commit of transaction {}", tid);

    // Phase 1: lock down the transaction and wait for all outstanding
    // updates to complete.
    {
        let _state = inner.state_mut();
        commit_transaction.set_state(TxnState::Locked);
    }
    let locked_at = Instant::now();
    {
        let mut stats = commit_transaction.stats.lock().expect("transaction stats poisoned");
        stats.wait_ms = commit_transaction
            .max_wait
            .lock()
            .expect("max wait lock poisoned")
            .as_millis() as u64;
        stats.running_ms = locked_at
            .duration_since(commit_transaction.start_time)
            .as_millis() as u64;
    }

    let waiting_on = Arc::clone(&commit_transaction);
    inner
        .wait_updates
        .wait_while(|| waiting_on.updates.load(Ordering::SeqCst) > 0);

    debug_assert!(
        commit_transaction.outstanding_credits.load(Ordering::SeqCst)
            <= inner.config.max_transaction_buffers,
        "transaction overran its credit reservation"
    );

    // Discard remaining reserved buffers: a restart may leave them behind,
    // and they must be released cleanly from this transaction.
    loop {
        let buf = commit_transaction.lists().reserved.front().cloned();
        match buf {
            None => break,
            Some(buf) => {
                buf.state().committed_data = None;
                commit_transaction.refile_buffer(&buf);
            }
        }
    }

    // Drop written-back buffers from the checkpoint lists before we start
    // filling the log again.
    checkpoint::clean_checkpoint_list(inner);

    // Phase 2: switch the revoke table and open the next transaction slot.
    log::debug!("commit phase 2: transaction {} flushing", tid);
    inner.revoke.switch_table();
    let flushing_at = Instant::now();
    {
        let mut state = inner.state_mut();
        commit_transaction.set_state(TxnState::Flush);
        state.committing = Some(Arc::clone(&commit_transaction));
        state.running = None;
        commit_transaction
            .log_start
            .store(state.head, Ordering::SeqCst);
    }
    inner.wait_transaction_locked.notify_all();
    {
        let mut stats = commit_transaction.stats.lock().expect("transaction stats poisoned");
        stats.locked_ms = flushing_at.duration_since(locked_at).as_millis() as u64;
    }

    // Phase 3: write out this transaction's data blocks to their home
    // locations, batched under a plug.
    if inner.config.features.data_checksum {
        log::debug!("commit phase 3: transaction {} data writeout", tid);
        let dirty: Vec<Arc<JournalBuffer>> = commit_transaction
            .lists()
            .dirty_data
            .iter()
            .cloned()
            .collect();
        let mut batch: Vec<Arc<JournalBuffer>> = Vec::new();
        for buf in dirty {
            let block_type = buf.block_type();
            if block_type == BlockType::DataOverwrite
                || block_type == BlockType::DataNewlyAppended
            {
                buf.state().jwrite = true;
                batch.push(buf);
                if batch.len() == inner.config.data_batch {
                    flush_data_batch(inner, &mut batch);
                }
            } else {
                commit_transaction.refile_buffer(&buf);
            }
        }
        if !batch.is_empty() {
            flush_data_batch(inner, &mut batch);
        }
    }

    // Phase 4: inode data writeback and revoke records.
    log::debug!("commit phase 4: transaction {} inode data and revokes", tid);
    let inodes = commit_transaction.lists().inodes.clone();
    for inode in &inodes {
        for page in inode.dirty_pages() {
            if page.is_dirty() && !page.locked() {
                let completion = inner.fs_io.submit(WriteOp::Sync, page.blocknr(), page.data());
                page.set_pending_io(completion);
            }
        }
    }
    write_revoke_records(inner, &commit_transaction);

    // Phase 5: journal the metadata.
    log::debug!("commit phase 5: transaction {} journaling metadata", tid);
    {
        let _state = inner.state_mut();
        commit_transaction.set_state(TxnState::Commit);
    }
    let logging_at = Instant::now();
    {
        let mut stats = commit_transaction.stats.lock().expect("transaction stats poisoned");
        stats.flushing_ms = logging_at.duration_since(flushing_at).as_millis() as u64;
        stats.blocks = u64::from(commit_transaction.outstanding_credits.load(Ordering::SeqCst));
    }

    let wide = inner.config.features.wide_blocks;
    let tagsz = tag_bytes(wide);
    let mut io_err: Option<io::Error> = None;
    let mut crc32_sum: u32 = CHECKSUM_SEED;
    let mut descriptor: Option<(Arc<JournalBuffer>, DescriptorBuilder)> = None;
    let mut wbuf: Vec<Arc<JournalBuffer>> = Vec::new();

    loop {
        let jh = commit_transaction.lists().metadata.front().cloned();
        let jh = match jh {
            Some(jh) => jh,
            None => break,
        };

        // In abort mode, un-journal the buffer and keep draining so any
        // allocated descriptor still gets released below.
        if inner.is_aborted() {
            jh.clear_dirty();
            commit_transaction.refile_buffer(&jh);
            continue;
        }

        // Make sure we have a descriptor block to record the buffer in.
        if descriptor.is_none() {
            let desc_buf = match inner.get_descriptor_buffer() {
                Ok(buf) => buf,
                Err(e) => {
                    inner.abort(&format!("descriptor allocation failed: {}", e));
                    continue;
                }
            };
            log::debug!("got descriptor at log block {}", desc_buf.blocknr());
            commit_transaction.blocks_used.fetch_add(1, Ordering::SeqCst);
            desc_buf.set_dirty();
            desc_buf.state().jwrite = true;
            commit_transaction.file_buffer(&desc_buf, BufferList::LogCtl);

            let mut builder =
                DescriptorBuilder::new(inner.config.block_size, tid as u32, wide);
            // Drain pending data tags onto this descriptor first.
            loop {
                if builder.space_left() < tagsz + UUID_SIZE {
                    break;
                }
                let data_tag = commit_transaction.lists().data_tags.pop_front();
                match data_tag {
                    None => break,
                    Some(data_tag) => {
                        if let Err(e) = builder.add_tag(
                            data_tag.blocknr,
                            0,
                            data_tag.checksum,
                            BlockType::DataNewlyAppended,
                            &inner.uuid,
                        ) {
                            inner.abort(&format!("data tag packing failed: {}", e));
                            break;
                        }
                    }
                }
            }
            descriptor = Some((desc_buf, builder));
        }

        // Where on the log does this buffer go?
        let blocknr = match inner.next_log_block() {
            Ok(blocknr) => blocknr,
            Err(e) => {
                inner.abort(&format!("no log space for metadata block: {}", e));
                continue;
            }
        };
        let credits = &commit_transaction.outstanding_credits;
        credits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .ok();
        commit_transaction.blocks_used.fetch_add(1, Ordering::SeqCst);

        // Make the shadow/IO pair: the original freezes on the Shadow list
        // while the twin carries the copy to the log.
        jh.state().jwrite = true;
        let source_type = jh.block_type();
        let (twin, copy_flags) = buffer::write_metadata_buffer(&jh, blocknr);
        twin.state().jwrite = true;
        commit_transaction.file_buffer(&jh, BufferList::Shadow);
        commit_transaction.file_buffer(&twin, BufferList::Io);

        let base_flags = if copy_flags.escaped { TAG_FLAG_ESCAPE } else { 0 };
        let tag_type = if source_type == BlockType::DataOverwrite
            || source_type == BlockType::DataNewlyAppended
        {
            BlockType::DataOverwrite
        } else {
            BlockType::NotData
        };
        // Ordinary metadata tags carry no per-block checksum; the rolling
        // sum in the commit record certifies them. Only data tags carry one.
        if let Some((_, builder)) = descriptor.as_mut() {
            if let Err(e) = builder.add_tag(
                jh.blocknr(),
                base_flags,
                0,
                tag_type,
                &inner.uuid,
            ) {
                inner.abort(&format!("metadata tag packing failed: {}", e));
                continue;
            }
        }
        wbuf.push(twin);

        // If the batch is full, the source list is drained, or the
        // descriptor has no room left, let the I/O rip.
        let list_drained = commit_transaction.lists().metadata.is_empty();
        let descriptor_full = descriptor
            .as_ref()
            .map(|(_, b)| b.space_left() < tagsz + UUID_SIZE)
            .unwrap_or(false);
        if wbuf.len() + 1 >= inner.config.wbufsize || list_drained || descriptor_full {
            submit_journal_batch(inner, &commit_transaction, &mut descriptor, &mut wbuf, &mut crc32_sum);
            thread::yield_now();
        }
    }

    // Drain any data tags left over when the metadata list was shorter than
    // the tag stream, and release a descriptor the abort path left behind.
    while !inner.is_aborted() && !commit_transaction.lists().data_tags.is_empty() {
        if descriptor.is_none() {
            match inner.get_descriptor_buffer() {
                Ok(desc_buf) => {
                    commit_transaction.blocks_used.fetch_add(1, Ordering::SeqCst);
                    desc_buf.set_dirty();
                    desc_buf.state().jwrite = true;
                    commit_transaction.file_buffer(&desc_buf, BufferList::LogCtl);
                    descriptor = Some((
                        desc_buf,
                        DescriptorBuilder::new(inner.config.block_size, tid as u32, wide),
                    ));
                }
                Err(e) => {
                    inner.abort(&format!("descriptor allocation failed: {}", e));
                    break;
                }
            }
        }
        let (_, builder) = descriptor.as_mut().expect("descriptor just installed");
        if builder.space_left() < tagsz + UUID_SIZE {
            submit_journal_batch(inner, &commit_transaction, &mut descriptor, &mut wbuf, &mut crc32_sum);
            continue;
        }
        let data_tag = commit_transaction
            .lists()
            .data_tags
            .pop_front()
            .expect("data tag list checked non-empty");
        if let Err(e) = builder.add_tag(
            data_tag.blocknr,
            0,
            data_tag.checksum,
            BlockType::DataNewlyAppended,
            &inner.uuid,
        ) {
            inner.abort(&format!("data tag packing failed: {}", e));
            break;
        }
    }
    if descriptor.is_some() || !wbuf.is_empty() {
        submit_journal_batch(inner, &commit_transaction, &mut descriptor, &mut wbuf, &mut crc32_sum);
    }

    // Finish the per-inode data writeback started in phase 4.
    let mut syncdata_err = false;
    for inode in &inodes {
        for page in inode.dirty_pages() {
            match page.wait_on_buffer() {
                Ok(()) => {
                    page.clear_dirty();
                    page.state().jwrite = false;
                }
                Err(e) => {
                    // Keep the error on the mapping so a later fsync
                    // re-observes it.
                    inode.record_error(e.kind());
                    syncdata_err = true;
                }
            }
        }
    }
    if syncdata_err {
        log::warn!("detected I/O errors while flushing file data");
        if inner.config.abort_on_syncdata_err {
            inner.abort("file data writeback failed");
        }
    }

    // Wait on the remaining dirty-data buffers, tail first.
    loop {
        let buf = commit_transaction.lists().dirty_data.back().cloned();
        let buf = match buf {
            Some(buf) => buf,
            None => break,
        };
        log::debug!("waiting for write of data block {}", buf.blocknr());
        if let Err(e) = buf.wait_on_buffer() {
            io_err.get_or_insert(e);
        }
        buf.state().jwrite = false;
        commit_transaction.refile_buffer(&buf);
        thread::yield_now();
    }

    {
        let _state = inner.state_mut();
        debug_assert_eq!(commit_transaction.state(), TxnState::Commit);
        commit_transaction.set_state(TxnState::CommitDflush);
    }

    // If the filesystem lives on a different device, its cache must be
    // flushed before the commit record can go out.
    if commit_transaction.need_data_flush()
        && !inner.same_device
        && inner.config.features.barrier
    {
        if let Err(e) = inner.fs_io.flush() {
            log::warn!("filesystem device flush failed: {}", e);
        }
    }

    // With async commit negotiated the commit record races the metadata
    // writes; ordering is re-established by the wait below.
    let mut commit_record: Option<IoCompletion> = None;
    if inner.config.features.async_commit && !inner.is_aborted() {
        match submit_commit_record(inner, &commit_transaction, crc32_sum) {
            Ok(completion) => commit_record = Some(completion),
            Err(e) => inner.abort(&format!("commit record submission failed: {}", e)),
        }
    }

    // Phase 6: wait for the metadata and log-control I/O, tail first.
    log::debug!("commit phase 6: transaction {} waiting for log I/O", tid);
    loop {
        let twin = commit_transaction.lists().io.back().cloned();
        let twin = match twin {
            Some(twin) => twin,
            None => break,
        };
        if let Err(e) = twin.wait_on_buffer() {
            io_err.get_or_insert(e);
        }
        twin.state().jwrite = false;
        commit_transaction.unfile_buffer(&twin);

        // The twin was a scratch buffer; tear it down and remember its
        // shadowed original against this transaction for checkpointing.
        let shadow = twin.state().shadow_of.take();
        if let Some(shadow) = shadow {
            shadow.state().jwrite = false;
            commit_transaction.file_buffer(&shadow, BufferList::Forget);
        }
    }
    debug_assert!(commit_transaction.lists().shadow.is_empty());

    loop {
        let ctl = commit_transaction.lists().log_ctl.back().cloned();
        let ctl = match ctl {
            Some(ctl) => ctl,
            None => break,
        };
        log::debug!("waiting for write of log control block {}", ctl.blocknr());
        if let Err(e) = ctl.wait_on_buffer() {
            io_err.get_or_insert(e);
        }
        ctl.state().jwrite = false;
        commit_transaction.unfile_buffer(&ctl);
    }

    if let Some(e) = io_err.take() {
        inner.abort(&format!("I/O error writing journal log blocks: {}", e));
    }

    {
        let _state = inner.state_mut();
        debug_assert_eq!(commit_transaction.state(), TxnState::CommitDflush);
        commit_transaction.set_state(TxnState::CommitJflush);
    }

    if !inner.config.features.async_commit && !inner.is_aborted() {
        match submit_commit_record(inner, &commit_transaction, crc32_sum) {
            Ok(completion) => commit_record = Some(completion),
            Err(e) => inner.abort(&format!("commit record submission failed: {}", e)),
        }
    }
    let mut commit_record_err = None;
    if let Some(completion) = commit_record.take() {
        if let Err(e) = completion.wait() {
            commit_record_err = Some(e);
        }
    }

    // Post-record barrier: always for durable commits, and for async
    // commits whose ordering the record write itself did not enforce.
    if (inner.config.features.async_commit && inner.config.features.barrier)
        || commit_transaction.is_durable()
    {
        if let Err(e) = inner.io.flush() {
            log::warn!("journal device flush failed: {}", e);
        }
    }

    if let Some(e) = commit_record_err {
        inner.abort(&format!("I/O error writing commit record: {}", e));
    }

    // Phase 7: checkpoint hand-off.
    log::debug!("commit phase 7: transaction {} checkpoint hand-off", tid);
    let durable = commit_transaction.is_durable();
    let interval = Duration::from_millis(inner.config.checkpoint_interval_ms);
    let deadline = if durable {
        Instant::now()
    } else {
        Instant::now() + interval
    };
    *commit_transaction
        .checkpoint_deadline
        .lock()
        .expect("checkpoint deadline lock poisoned") = Some(deadline);

    if inner.is_aborted() {
        // Strip dirty flags but leave the buffers filed on Forget; nothing
        // below them reached the log.
        let lists = commit_transaction.lists();
        for buf in lists.forget.iter() {
            buf.clear_dirty();
        }
    } else {
        loop {
            loop {
                let jh = commit_transaction.lists().forget.front().cloned();
                let jh = match jh {
                    Some(jh) => jh,
                    None => break,
                };

                {
                    let mut state = jh.state();
                    if !durable {
                        // Tag the block so ordinary writeback holds off
                        // until the checkpoint deadline.
                        state.block_type = BlockType::DurableCheckpoint;
                        state.checkpoint_deadline = Some(deadline);
                        state.delayed_write = true;
                    }
                    // Rotate the frozen copy into the undo slot, or free it.
                    if state.committed_data.is_some() {
                        state.committed_data = state.frozen_data.take();
                    } else {
                        state.frozen_data = None;
                    }
                }

                // Drop the buffer from any earlier checkpoint transaction.
                checkpoint::remove_checkpoint(inner, &jh);

                if jh.is_dirty() {
                    checkpoint::insert_checkpoint(&commit_transaction, &jh);
                } else {
                    commit_transaction.unfile_buffer(&jh);
                }
                thread::yield_now();
            }

            // A concurrent writer may have pushed more onto the Forget list
            // while it was being drained.
            if commit_transaction.lists().forget.is_empty() {
                break;
            }
        }
    }

    // Done with this transaction.
    let commit_time = start_time.elapsed();
    {
        let mut state = inner.state_mut();
        debug_assert!(inner.is_aborted() || commit_transaction.state() == TxnState::CommitJflush);
        commit_transaction.set_state(TxnState::Finished);
        state.average_commit_time = if state.average_commit_time.is_zero() {
            commit_time
        } else {
            (commit_time + 3 * state.average_commit_time) / 4
        };
        state.committing = None;
    }

    {
        let mut stats = commit_transaction.stats.lock().expect("transaction stats poisoned");
        stats.logging_ms = logging_at.elapsed().as_millis() as u64;
        stats.handle_count = u64::from(commit_transaction.handle_count.load(Ordering::SeqCst));
        let snapshot = stats.clone();
        drop(stats);

        let mut journal_stats = inner.stats.lock().expect("journal stats lock poisoned");
        journal_stats.commits += 1;
        journal_stats.wait_ms += snapshot.wait_ms;
        journal_stats.running_ms += snapshot.running_ms;
        journal_stats.locked_ms += snapshot.locked_ms;
        journal_stats.flushing_ms += snapshot.flushing_ms;
        journal_stats.logging_ms += snapshot.logging_ms;
        journal_stats.handle_count += snapshot.handle_count;
        journal_stats.blocks += snapshot.blocks;
        journal_stats.blocks_logged += snapshot.blocks_logged;
        journal_stats.average_commit_time_us =
            inner.state().average_commit_time.as_micros() as u64;
    }

    // Splice into the checkpoint ring, or free the transaction's log span
    // right away when nothing is left to write back.
    let has_checkpoint_work = !commit_transaction.lists().checkpoint.is_empty();
    if has_checkpoint_work {
        inner
            .checkpoint_ring
            .lock()
            .expect("checkpoint ring lock poisoned")
            .push(Arc::clone(&commit_transaction));
    } else {
        inner.reclaim_log_space(commit_transaction.blocks_used.load(Ordering::SeqCst));
    }

    inner.commit_sequence.fetch_max(tid, Ordering::SeqCst);
    log::debug!("commit {} complete", tid);

    drop(_dirty_data_guard);

    if let Some(callback) = inner
        .commit_callback
        .lock()
        .expect("commit callback lock poisoned")
        .as_ref()
    {
        callback(tid);
    }
    inner.wait_done_commit.notify_all();
}

/// Submit a batch of data buffers to their home locations under one plug.
fn flush_data_batch(inner: &JournalInner, batch: &mut Vec<Arc<JournalBuffer>>) {
    let mut plug = inner.fs_io.plug();
    for buf in batch.drain(..) {
        buf.clear_dirty();
        let completion = plug.submit(WriteOp::Sync, buf.blocknr(), buf.data());
        buf.set_pending_io(completion);
    }
    plug.finish();
}

/// Pack this commit's revoke records into log blocks and submit them.
fn write_revoke_records(inner: &JournalInner, txn: &Arc<Transaction>) {
    let records = inner.revoke.take_committing();
    if records.is_empty() {
        return;
    }
    log::debug!("writing {} revoke records", records.len());
    let mut plug = inner.io.plug();
    for chunk in records.chunks(max_revoke_entries(inner.config.block_size)) {
        let blocknr = match inner.next_log_block() {
            Ok(blocknr) => blocknr,
            Err(e) => {
                inner.abort(&format!("no log space for revoke block: {}", e));
                return;
            }
        };
        txn.blocks_used.fetch_add(1, Ordering::SeqCst);
        let block = encode_revoke_block(inner.config.block_size, txn.tid() as u32, chunk);
        let buf = JournalBuffer::new(blocknr, block.clone());
        buf.state().jwrite = true;
        txn.file_buffer(&buf, BufferList::LogCtl);
        let completion = plug.submit(WriteOp::Sync, blocknr, block);
        buf.set_pending_io(completion);
    }
    plug.finish();
}

/// Close out the current descriptor and submit it with its metadata twins.
fn submit_journal_batch(
    inner: &JournalInner,
    txn: &Arc<Transaction>,
    descriptor: &mut Option<(Arc<JournalBuffer>, DescriptorBuilder)>,
    wbuf: &mut Vec<Arc<JournalBuffer>>,
    crc32_sum: &mut u32,
) {
    let (desc_buf, mut builder) = match descriptor.take() {
        Some(descriptor) => descriptor,
        None => {
            debug_assert!(wbuf.is_empty(), "metadata twins without a descriptor");
            return;
        }
    };

    // Write the end-of-descriptor marker before the I/O goes out.
    builder.mark_last_tag();
    let count = builder.count();
    let desc_bytes = builder.finish();
    desc_buf.set_data(desc_bytes.clone());
    log::debug!("submitting descriptor with {} tags and {} buffers", count, wbuf.len());

    let mut plug = inner.io.plug();
    desc_buf.clear_dirty();
    desc_buf.state().uptodate = true;
    let completion = plug.submit(WriteOp::Sync, desc_buf.blocknr(), desc_bytes);
    desc_buf.set_pending_io(completion);

    let mut blocks_logged = 1u64;
    for twin in wbuf.drain(..) {
        let data = twin.data();
        if inner.config.features.checksum {
            *crc32_sum = fletcher32(*crc32_sum, &data);
        }
        twin.clear_dirty();
        twin.state().uptodate = true;
        let completion = plug.submit(WriteOp::Sync, twin.blocknr(), data);
        twin.set_pending_io(completion);
        blocks_logged += 1;
    }
    plug.finish();

    let mut stats = txn.stats.lock().expect("transaction stats poisoned");
    stats.blocks_logged += blocks_logged;
}

/// Build and submit the commit record. FUA when barriers are on and the
/// record itself must carry the ordering; plain synchronous otherwise.
fn submit_commit_record(
    inner: &JournalInner,
    txn: &Arc<Transaction>,
    crc32_sum: u32,
) -> crate::error::Result<IoCompletion> {
    let blocknr = inner.next_log_block()?;
    txn.blocks_used.fetch_add(1, Ordering::SeqCst);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let with_checksum = inner.config.features.checksum;
    let record = CommitBlock {
        sequence: txn.tid() as u32,
        commit_sec: now.as_secs(),
        commit_nsec: now.subsec_nanos(),
        checksum_type: if with_checksum { CHECKSUM_TYPE_FLETCHER32 } else { 0 },
        checksum_size: if with_checksum { CHECKSUM_SIZE } else { 0 },
        checksum: if with_checksum { crc32_sum } else { 0 },
    };
    let block = record.encode_block(inner.config.block_size);

    let op = if inner.config.features.barrier && !inner.config.features.async_commit {
        WriteOp::FlushFua
    } else {
        WriteOp::Sync
    };
    log::debug!("submitting commit record for transaction {} at log block {}", txn.tid(), blocknr);
    Ok(inner.io.submit(op, blocknr, block))
}
