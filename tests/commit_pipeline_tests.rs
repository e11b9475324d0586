//! End-to-end commit pipeline tests against an in-memory device.

use std::sync::Arc;
use std::time::Duration;

use bedrock::checksum::{fletcher32, CHECKSUM_SEED};
use bedrock::device::{BlockDevice, DeviceEvent, MemDevice};
use bedrock::journal::{Journal, JournalConfig};
use bedrock::tag::{
    decode_descriptor_tags, BlockHeader, CommitBlock, Superblock, BLOCKTYPE_COMMIT,
    BLOCKTYPE_DESCRIPTOR, CHECKSUM_TYPE_FLETCHER32, JOURNAL_MAGIC, TAG_FLAG_ESCAPE,
    TAG_FLAG_LAST_TAG,
};
use bedrock::{BlockType, BufferList, JournalBuffer, JournalError};

const BLOCK_SIZE: usize = 512;

fn test_config() -> JournalConfig {
    JournalConfig {
        block_size: BLOCK_SIZE,
        maxlen: 64,
        first: 1,
        ..Default::default()
    }
}

fn open_journal(config: JournalConfig) -> (Arc<MemDevice>, Journal) {
    let device = Arc::new(MemDevice::new(BLOCK_SIZE, 256));
    let journal = Journal::create(Arc::clone(&device) as Arc<dyn BlockDevice>, None, config)
        .expect("journal creation failed");
    (device, journal)
}

fn patterned_block() -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| (i % 256) as u8).collect()
}

#[test]
fn test_single_buffer_commit_log_layout() {
    let (device, journal) = open_journal(test_config());
    let content = patterned_block();

    let handle = journal.start(4).unwrap();
    let buf = JournalBuffer::new(42, content.clone());
    handle.get_write_access(&buf).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();

    journal.log_start_commit(tid);
    journal.log_wait_commit(tid).unwrap();

    // Log block 1: one descriptor with a single LAST_TAG tag for block 42.
    let descriptor = device.block(1);
    let header = BlockHeader::decode(&descriptor).unwrap();
    assert_eq!(header.blocktype, BLOCKTYPE_DESCRIPTOR);
    assert_eq!(header.sequence, 1);

    let tags = decode_descriptor_tags(&descriptor, true).unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].blocknr, 42);
    assert_eq!(tags[0].flags & TAG_FLAG_LAST_TAG, TAG_FLAG_LAST_TAG);
    // Metadata tags carry no per-block checksum; the commit record's
    // rolling sum certifies the block.
    assert_eq!(tags[0].checksum, 0);
    assert_eq!(tags[0].block_type, BlockType::NotData);

    // Log block 2: the metadata copy, byte-identical to the frozen content.
    assert_eq!(device.block(2), content);

    // Log block 3: the commit record carrying the rolling checksum.
    let commit = CommitBlock::decode(&device.block(3)).unwrap();
    assert_eq!(commit.sequence, 1);
    assert_eq!(commit.checksum_type, CHECKSUM_TYPE_FLETCHER32);
    assert_eq!(commit.checksum, fletcher32(CHECKSUM_SEED, &content));
    assert!(commit.commit_sec > 0);
}

#[test]
fn test_magic_colliding_buffer_is_escaped() {
    let (device, journal) = open_journal(test_config());

    let mut colliding = vec![0u8; BLOCK_SIZE];
    colliding[0..4].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
    colliding[4] = 0xEE;

    let handle = journal.start(4).unwrap();
    let plain = JournalBuffer::new(10, vec![0x11u8; BLOCK_SIZE]);
    let magic = JournalBuffer::new(11, colliding.clone());
    handle.get_write_access(&plain).unwrap();
    handle.dirty_metadata(&plain).unwrap();
    handle.get_write_access(&magic).unwrap();
    handle.dirty_metadata(&magic).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();

    journal.log_start_commit(tid);
    journal.log_wait_commit(tid).unwrap();

    let tags = decode_descriptor_tags(&device.block(1), true).unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].blocknr, 10);
    assert_eq!(tags[0].flags & TAG_FLAG_ESCAPE, 0);
    assert_eq!(tags[1].blocknr, 11);
    assert_eq!(tags[1].flags & TAG_FLAG_ESCAPE, TAG_FLAG_ESCAPE);

    // The on-log copy of the colliding buffer has its first word zeroed;
    // the rest is intact.
    let logged = device.block(3);
    assert_eq!(&logged[0..4], &[0u8; 4]);
    assert_eq!(logged[4], 0xEE);
    // The in-memory buffer still carries the magic.
    assert_eq!(&magic.data()[0..4], &JOURNAL_MAGIC.to_be_bytes());
}

#[test]
fn test_aborted_commit_writes_nothing_and_strips_dirty() {
    let (device, journal) = open_journal(test_config());

    let handle = journal.start(16).unwrap();
    let buffers: Vec<_> = (0..10)
        .map(|i| JournalBuffer::new(100 + i, vec![i as u8; BLOCK_SIZE]))
        .collect();
    for buf in &buffers {
        handle.get_write_access(buf).unwrap();
        handle.dirty_metadata(buf).unwrap();
    }
    let tid = handle.tid();
    drop(handle);

    journal.abort("forced mid-commit abort");
    journal.log_start_commit(tid);
    match journal.log_wait_commit(tid) {
        Err(JournalError::Aborted) => {}
        other => panic!("expected Aborted, got {:?}", other),
    }

    // Nothing reached the log: no descriptor tags, no commit record.
    assert!(device.events().is_empty());
    for buf in &buffers {
        assert_eq!(buf.list(), BufferList::Forget);
        assert!(!buf.is_dirty());
    }
}

#[test]
fn test_concurrent_writer_attaches_to_next_transaction() {
    let device = Arc::new(MemDevice::with_write_delay(
        BLOCK_SIZE,
        256,
        Duration::from_millis(10),
    ));
    let journal = Journal::create(
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        None,
        test_config(),
    )
    .unwrap();

    let handle = journal.start(4).unwrap();
    let buf = JournalBuffer::new(50, vec![1u8; BLOCK_SIZE]);
    handle.get_write_access(&buf).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();
    journal.log_start_commit(tid);

    // A writer arriving before lock-down may still join the running
    // transaction; once the commit has locked it, every new handle must
    // land on the next transaction, never the committing one.
    let late = loop {
        let candidate = journal.start(4).unwrap();
        if candidate.tid() > tid {
            break candidate;
        }
        candidate.stop().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(late.tid(), tid + 1);
    let late_buf = JournalBuffer::new(60, vec![2u8; BLOCK_SIZE]);
    late.get_write_access(&late_buf).unwrap();
    late.dirty_metadata(&late_buf).unwrap();
    assert_eq!(late_buf.state().txn_tid, Some(tid + 1));
    late.stop().unwrap();

    journal.log_wait_commit(tid).unwrap();
    assert_eq!(journal.commit_sequence(), tid);

    // The second transaction commits independently afterwards.
    journal.log_start_commit(tid + 1);
    journal.log_wait_commit(tid + 1).unwrap();
    assert_eq!(journal.commit_sequence(), tid + 1);
}

#[test]
fn test_commit_publishes_sequence_and_fires_callback() {
    let (_device, journal) = open_journal(test_config());
    let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
    let fired_clone = Arc::clone(&fired);
    journal.set_commit_callback(move |tid| {
        fired_clone.lock().unwrap().push(tid);
    });

    let handle = journal.start(2).unwrap();
    let buf = JournalBuffer::new(77, vec![9u8; BLOCK_SIZE]);
    handle.get_write_access(&buf).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();

    journal.log_start_commit(tid);
    journal.log_wait_commit(tid).unwrap();

    assert_eq!(journal.commit_sequence(), tid);
    assert_eq!(*fired.lock().unwrap(), vec![tid]);

    let stats = journal.stats();
    assert_eq!(stats.commits, 1);
    // Descriptor plus one metadata block.
    assert_eq!(stats.blocks_logged, 2);
}

#[test]
fn test_empty_transaction_commit_writes_bare_commit_record() {
    let (device, journal) = open_journal(test_config());

    let handle = journal.start(1).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();

    journal.log_start_commit(tid);
    journal.log_wait_commit(tid).unwrap();

    let commit = CommitBlock::decode(&device.block(1)).unwrap();
    assert_eq!(commit.sequence, tid as u32);
    let header = BlockHeader::decode(&device.block(1)).unwrap();
    assert_eq!(header.blocktype, BLOCKTYPE_COMMIT);
}

#[test]
fn test_log_reclaim_defers_a_superblock_update_to_the_next_commit() {
    let (device, journal) = open_journal(test_config());

    // An empty transaction leaves nothing to checkpoint, so its log span
    // is reclaimed as soon as the commit finishes. That reclaim leaves a
    // deferred superblock update behind; nothing touches block 0 yet.
    let first = journal.start(1).unwrap();
    let tid1 = first.tid();
    first.stop().unwrap();
    journal.log_start_commit(tid1);
    journal.log_wait_commit(tid1).unwrap();
    assert!(!device
        .events()
        .contains(&DeviceEvent::Write { blocknr: 0 }));

    // The next commit drains the deferred update before locking down.
    let second = journal.start(2).unwrap();
    let buf = JournalBuffer::new(45, vec![6u8; BLOCK_SIZE]);
    second.get_write_access(&buf).unwrap();
    second.dirty_metadata(&buf).unwrap();
    let tid2 = second.tid();
    second.stop().unwrap();
    journal.log_start_commit(tid2);
    journal.log_wait_commit(tid2).unwrap();

    // The empty commit's record sat at log block 1, so the snapshot shows
    // the head at block 2, every log block free again after the reclaim,
    // and two tids handed out.
    let sb = Superblock::decode(&device.block(0)).unwrap();
    assert_eq!(sb.head, 2);
    assert_eq!(sb.free, 63);
    assert_eq!(sb.sequence, 3);

    // The drain is one-shot: with the second transaction parked on the
    // checkpoint ring, a third commit must not rewrite block 0.
    let third = journal.start(2).unwrap();
    let buf2 = JournalBuffer::new(46, vec![7u8; BLOCK_SIZE]);
    third.get_write_access(&buf2).unwrap();
    third.dirty_metadata(&buf2).unwrap();
    let tid3 = third.tid();
    third.stop().unwrap();
    journal.log_start_commit(tid3);
    journal.log_wait_commit(tid3).unwrap();

    let superblock_writes = device
        .events()
        .iter()
        .filter(|e| **e == DeviceEvent::Write { blocknr: 0 })
        .count();
    assert_eq!(superblock_writes, 1);
    assert_eq!(Superblock::decode(&device.block(0)).unwrap().head, 2);
}

#[test]
fn test_metadata_copy_is_frozen_at_commit_entry() {
    // Redirtying the original buffer after the shadow pair is made must not
    // change what lands on the log.
    let device = Arc::new(MemDevice::with_write_delay(
        BLOCK_SIZE,
        256,
        Duration::from_millis(5),
    ));
    let journal = Journal::create(
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        None,
        test_config(),
    )
    .unwrap();

    let content = vec![0x33u8; BLOCK_SIZE];
    let handle = journal.start(2).unwrap();
    let buf = JournalBuffer::new(90, content.clone());
    handle.get_write_access(&buf).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    let tid = handle.tid();
    handle.stop().unwrap();

    journal.log_start_commit(tid);
    // Scribble on the in-memory buffer while the commit is in flight. The
    // frozen copy, not this, must reach the log.
    buf.set_data(vec![0x44u8; BLOCK_SIZE]);
    journal.log_wait_commit(tid).unwrap();

    let logged = device.block(2);
    // The log holds whichever snapshot commit took; the commit record's
    // rolling checksum certifies exactly that copy.
    let commit = CommitBlock::decode(&device.block(3)).unwrap();
    assert_eq!(commit.checksum, fletcher32(CHECKSUM_SEED, &logged));
}
