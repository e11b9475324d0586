//! On-disk journal block formats
//!
//! Everything the journal writes is big-endian: a shared 12-byte header
//! (magic, blocktype, sequence) followed by a type-specific body. Descriptor
//! blocks carry a stream of fixed-width tags naming the home location of each
//! subsequent log block; the commit block carries the commit timestamp and
//! the transaction-wide rolling checksum; revoke blocks carry a count plus
//! 64-bit block numbers.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{JournalError, Result};

/// Magic number stamped on every journal block header.
pub const JOURNAL_MAGIC: u32 = 0xC03B_3998;

pub const BLOCKTYPE_DESCRIPTOR: u32 = 1;
pub const BLOCKTYPE_COMMIT: u32 = 2;
pub const BLOCKTYPE_SUPERBLOCK: u32 = 4;
pub const BLOCKTYPE_REVOKE: u32 = 5;

/// Shared header prefix length.
pub const HEADER_SIZE: usize = 12;
/// Journal UUID length, written once after the first tag of a descriptor.
pub const UUID_SIZE: usize = 16;

// Tag flags.
pub const TAG_FLAG_ESCAPE: u16 = 1;
pub const TAG_FLAG_SAME_UUID: u16 = 2;
pub const TAG_FLAG_DELETED: u16 = 4;
pub const TAG_FLAG_LAST_TAG: u16 = 8;

pub const CHECKSUM_TYPE_CRC32: u8 = 1;
pub const CHECKSUM_TYPE_FLETCHER32: u8 = 2;
pub const CHECKSUM_SIZE: u8 = 4;
/// Checksum slots reserved in wide tags and the commit header.
pub const CHECKSUM_SLOTS: usize = 8;

/// Wide tag: blocknr_low, flags, pad, blocknr_high, chksum_type,
/// chksum_size, pad, chksum[8], blocktype.
pub const WIDE_TAG_SIZE: usize = 4 + 2 + 2 + 4 + 1 + 1 + 2 + 4 * CHECKSUM_SLOTS + 4;
/// Narrow tag: blocknr, flags, pad.
pub const NARROW_TAG_SIZE: usize = 4 + 2 + 2;

/// Bytes one tag occupies in the negotiated tag format.
pub fn tag_bytes(wide: bool) -> usize {
    if wide {
        WIDE_TAG_SIZE
    } else {
        NARROW_TAG_SIZE
    }
}

/// Block-type code shared between descriptor tags and buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    NotData,
    DataOverwrite,
    DataNewlyAppended,
    DurableCheckpoint,
}

impl BlockType {
    pub fn as_u32(self) -> u32 {
        match self {
            BlockType::NotData => 0,
            BlockType::DataOverwrite => 1,
            BlockType::DataNewlyAppended => 2,
            BlockType::DurableCheckpoint => 3,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(BlockType::NotData),
            1 => Some(BlockType::DataOverwrite),
            2 => Some(BlockType::DataNewlyAppended),
            3 => Some(BlockType::DurableCheckpoint),
            _ => None,
        }
    }
}

/// The 12-byte header prefix shared by every journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub blocktype: u32,
    pub sequence: u32,
}

impl BlockHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(JOURNAL_MAGIC);
        buf.put_u32(self.blocktype);
        buf.put_u32(self.sequence);
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(JournalError::InvalidState("journal block shorter than header"));
        }
        let magic = data.get_u32();
        if magic != JOURNAL_MAGIC {
            return Err(JournalError::InvalidState("bad journal block magic"));
        }
        Ok(Self {
            blocktype: data.get_u32(),
            sequence: data.get_u32(),
        })
    }
}

/// One descriptor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalTag {
    pub blocknr: u64,
    pub flags: u16,
    pub checksum: u32,
    pub block_type: BlockType,
}

impl JournalTag {
    /// Encode in the negotiated format. Narrow tags cannot express block
    /// numbers past 32 bits and carry neither checksum nor block type.
    pub fn encode(&self, buf: &mut impl BufMut, wide: bool) -> Result<()> {
        if wide {
            buf.put_u32((self.blocknr & u64::from(u32::MAX)) as u32);
            buf.put_u16(self.flags);
            buf.put_u16(0);
            buf.put_u32((self.blocknr >> 32) as u32);
            buf.put_u8(CHECKSUM_TYPE_FLETCHER32);
            buf.put_u8(CHECKSUM_SIZE);
            buf.put_u16(0);
            buf.put_u32(self.checksum);
            for _ in 1..CHECKSUM_SLOTS {
                buf.put_u32(0);
            }
            buf.put_u32(self.block_type.as_u32());
        } else {
            if self.blocknr > u64::from(u32::MAX) {
                return Err(JournalError::TooLarge(self.blocknr));
            }
            buf.put_u32(self.blocknr as u32);
            buf.put_u16(self.flags);
            buf.put_u16(0);
        }
        Ok(())
    }

    pub fn decode(mut data: &[u8], wide: bool) -> Result<Self> {
        if data.len() < tag_bytes(wide) {
            return Err(JournalError::InvalidState("descriptor truncated inside a tag"));
        }
        if wide {
            let low = data.get_u32();
            let flags = data.get_u16();
            let _pad = data.get_u16();
            let high = data.get_u32();
            let _chksum_type = data.get_u8();
            let _chksum_size = data.get_u8();
            let _pad2 = data.get_u16();
            let checksum = data.get_u32();
            for _ in 1..CHECKSUM_SLOTS {
                let _ = data.get_u32();
            }
            let raw_type = data.get_u32();
            Ok(Self {
                blocknr: (u64::from(high) << 32) | u64::from(low),
                flags,
                checksum,
                block_type: BlockType::from_u32(raw_type)
                    .ok_or(JournalError::InvalidState("unknown tag block type"))?,
            })
        } else {
            let blocknr = data.get_u32();
            let flags = data.get_u16();
            Ok(Self {
                blocknr: u64::from(blocknr),
                flags,
                checksum: 0,
                block_type: BlockType::NotData,
            })
        }
    }
}

/// Builds one descriptor block: header, tags, UUID after the first tag,
/// LAST_TAG patched onto the final tag right before submission.
pub struct DescriptorBuilder {
    buf: BytesMut,
    block_size: usize,
    wide: bool,
    first_tag: bool,
    last_tag_offset: Option<usize>,
    count: usize,
}

impl DescriptorBuilder {
    pub fn new(block_size: usize, sequence: u32, wide: bool) -> Self {
        let mut buf = BytesMut::with_capacity(block_size);
        BlockHeader {
            blocktype: BLOCKTYPE_DESCRIPTOR,
            sequence,
        }
        .encode(&mut buf);
        Self {
            buf,
            block_size,
            wide,
            first_tag: true,
            last_tag_offset: None,
            count: 0,
        }
    }

    pub fn space_left(&self) -> usize {
        self.block_size - self.buf.len()
    }

    /// Room check the packing loop uses: a tag plus a potential UUID.
    pub fn has_room(&self) -> bool {
        self.space_left() >= tag_bytes(self.wide) + UUID_SIZE
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Append a tag. SAME_UUID is added to every tag after the first; the
    /// journal UUID is written immediately after the first tag only.
    pub fn add_tag(
        &mut self,
        blocknr: u64,
        base_flags: u16,
        checksum: u32,
        block_type: BlockType,
        uuid: &[u8; UUID_SIZE],
    ) -> Result<()> {
        let mut flags = base_flags;
        if !self.first_tag {
            flags |= TAG_FLAG_SAME_UUID;
        }
        let tag = JournalTag {
            blocknr,
            flags,
            checksum,
            block_type,
        };
        let offset = self.buf.len();
        tag.encode(&mut self.buf, self.wide)?;
        self.last_tag_offset = Some(offset);
        if self.first_tag {
            self.buf.put_slice(uuid);
            self.first_tag = false;
        }
        self.count += 1;
        Ok(())
    }

    /// Set LAST_TAG on the most recently written tag. The flags field sits
    /// four bytes into a tag in both formats.
    pub fn mark_last_tag(&mut self) {
        if let Some(offset) = self.last_tag_offset {
            let pos = offset + 4;
            let mut flags = u16::from_be_bytes([self.buf[pos], self.buf[pos + 1]]);
            flags |= TAG_FLAG_LAST_TAG;
            self.buf[pos..pos + 2].copy_from_slice(&flags.to_be_bytes());
        }
    }

    /// Zero-pad to a full block and hand back the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.resize(self.block_size, 0);
        self.buf.to_vec()
    }
}

/// Walk a descriptor block and return its tags, stopping at LAST_TAG.
pub fn decode_descriptor_tags(block: &[u8], wide: bool) -> Result<Vec<JournalTag>> {
    let header = BlockHeader::decode(block)?;
    if header.blocktype != BLOCKTYPE_DESCRIPTOR {
        return Err(JournalError::InvalidState("not a descriptor block"));
    }
    let mut tags = Vec::new();
    let mut offset = HEADER_SIZE;
    loop {
        let tag = JournalTag::decode(&block[offset..], wide)?;
        offset += tag_bytes(wide);
        if tag.flags & TAG_FLAG_SAME_UUID == 0 {
            offset += UUID_SIZE;
        }
        let done = tag.flags & TAG_FLAG_LAST_TAG != 0;
        tags.push(tag);
        if done {
            return Ok(tags);
        }
        if offset + tag_bytes(wide) > block.len() {
            return Err(JournalError::InvalidState("descriptor missing LAST_TAG"));
        }
    }
}

/// The commit block body following the shared header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitBlock {
    pub sequence: u32,
    pub commit_sec: u64,
    pub commit_nsec: u32,
    pub checksum_type: u8,
    pub checksum_size: u8,
    pub checksum: u32,
}

impl CommitBlock {
    pub fn encode_block(&self, block_size: usize) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(block_size);
        BlockHeader {
            blocktype: BLOCKTYPE_COMMIT,
            sequence: self.sequence,
        }
        .encode(&mut buf);
        buf.put_u64(self.commit_sec);
        buf.put_u32(self.commit_nsec);
        buf.put_u8(self.checksum_type);
        buf.put_u8(self.checksum_size);
        buf.put_u16(0);
        buf.put_u32(self.checksum);
        for _ in 1..CHECKSUM_SLOTS {
            buf.put_u32(0);
        }
        buf.resize(block_size, 0);
        buf.to_vec()
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(block)?;
        if header.blocktype != BLOCKTYPE_COMMIT {
            return Err(JournalError::InvalidState("not a commit block"));
        }
        let mut data = &block[HEADER_SIZE..];
        if data.len() < 8 + 4 + 1 + 1 + 2 + 4 {
            return Err(JournalError::InvalidState("commit block truncated"));
        }
        Ok(Self {
            sequence: header.sequence,
            commit_sec: data.get_u64(),
            commit_nsec: data.get_u32(),
            checksum_type: data.get_u8(),
            checksum_size: data.get_u8(),
            checksum: {
                let _pad = data.get_u16();
                data.get_u32()
            },
        })
    }
}

/// Minimal journal superblock: sequence, head, free block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub sequence: u32,
    pub head: u32,
    pub free: u32,
}

impl Superblock {
    pub fn encode_block(&self, block_size: usize) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(block_size);
        BlockHeader {
            blocktype: BLOCKTYPE_SUPERBLOCK,
            sequence: self.sequence,
        }
        .encode(&mut buf);
        buf.put_u32(self.head);
        buf.put_u32(self.free);
        buf.resize(block_size, 0);
        buf.to_vec()
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(block)?;
        if header.blocktype != BLOCKTYPE_SUPERBLOCK {
            return Err(JournalError::InvalidState("not a superblock"));
        }
        let mut data = &block[HEADER_SIZE..];
        Ok(Self {
            sequence: header.sequence,
            head: data.get_u32(),
            free: data.get_u32(),
        })
    }
}

/// Entries one revoke block can carry after its header and count word.
pub fn max_revoke_entries(block_size: usize) -> usize {
    (block_size - HEADER_SIZE - 4) / 8
}

/// Encode one revoke block holding the given block numbers.
pub fn encode_revoke_block(block_size: usize, sequence: u32, blocknrs: &[u64]) -> Vec<u8> {
    debug_assert!(blocknrs.len() <= max_revoke_entries(block_size));
    let mut buf = BytesMut::with_capacity(block_size);
    BlockHeader {
        blocktype: BLOCKTYPE_REVOKE,
        sequence,
    }
    .encode(&mut buf);
    buf.put_u32(blocknrs.len() as u32);
    for &blocknr in blocknrs {
        buf.put_u64(blocknr);
    }
    buf.resize(block_size, 0);
    buf.to_vec()
}

/// Decode a revoke block back into block numbers.
pub fn decode_revoke_block(block: &[u8]) -> Result<Vec<u64>> {
    let header = BlockHeader::decode(block)?;
    if header.blocktype != BLOCKTYPE_REVOKE {
        return Err(JournalError::InvalidState("not a revoke block"));
    }
    let mut data = &block[HEADER_SIZE..];
    let count = data.get_u32() as usize;
    if data.len() < count * 8 {
        return Err(JournalError::InvalidState("revoke block truncated"));
    }
    Ok((0..count).map(|_| data.get_u64()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: [u8; UUID_SIZE] = [7u8; UUID_SIZE];

    #[test]
    fn test_header_roundtrip() {
        let mut buf = BytesMut::new();
        let header = BlockHeader {
            blocktype: BLOCKTYPE_DESCRIPTOR,
            sequence: 9,
        };
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..4], &JOURNAL_MAGIC.to_be_bytes());
        assert_eq!(BlockHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let block = vec![0u8; HEADER_SIZE];
        assert!(BlockHeader::decode(&block).is_err());
    }

    #[test]
    fn test_narrow_tag_rejects_wide_blocknr() {
        let tag = JournalTag {
            blocknr: (1u64 << 33) + 17,
            flags: 0,
            checksum: 0,
            block_type: BlockType::NotData,
        };
        let mut buf = BytesMut::new();
        match tag.encode(&mut buf, false) {
            Err(JournalError::TooLarge(nr)) => assert_eq!(nr, (1u64 << 33) + 17),
            other => panic!("expected TooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_wide_tag_splits_blocknr_halves() {
        let tag = JournalTag {
            blocknr: (1u64 << 33) + 17,
            flags: TAG_FLAG_LAST_TAG,
            checksum: 0xAABBCCDD,
            block_type: BlockType::DataNewlyAppended,
        };
        let mut buf = BytesMut::new();
        tag.encode(&mut buf, true).unwrap();
        assert_eq!(buf.len(), WIDE_TAG_SIZE);
        // Low half, then high half at its fixed offset.
        assert_eq!(&buf[0..4], &17u32.to_be_bytes());
        assert_eq!(&buf[8..12], &2u32.to_be_bytes());
        let decoded = JournalTag::decode(&buf, true).unwrap();
        assert_eq!(decoded, tag);
    }

    #[test]
    fn test_descriptor_builder_uuid_after_first_tag_only() {
        let mut builder = DescriptorBuilder::new(512, 1, true);
        builder
            .add_tag(42, 0, 0, BlockType::NotData, &UUID)
            .unwrap();
        builder
            .add_tag(43, 0, 0, BlockType::NotData, &UUID)
            .unwrap();
        builder.mark_last_tag();
        let block = builder.finish();
        assert_eq!(block.len(), 512);

        let tags = decode_descriptor_tags(&block, true).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].flags & TAG_FLAG_SAME_UUID, 0);
        assert_eq!(tags[1].flags & TAG_FLAG_SAME_UUID, TAG_FLAG_SAME_UUID);
        assert_eq!(tags[1].flags & TAG_FLAG_LAST_TAG, TAG_FLAG_LAST_TAG);
        // UUID sits right after the first tag.
        let uuid_off = HEADER_SIZE + WIDE_TAG_SIZE;
        assert_eq!(&block[uuid_off..uuid_off + UUID_SIZE], &UUID);
    }

    #[test]
    fn test_descriptor_builder_room_accounting() {
        let block_size = 256;
        let mut builder = DescriptorBuilder::new(block_size, 1, true);
        let mut added = 0;
        while builder.has_room() {
            builder
                .add_tag(added as u64, 0, 0, BlockType::NotData, &UUID)
                .unwrap();
            added += 1;
        }
        // Header + first tag + UUID + further tags never overflow the block.
        assert!(added >= 1);
        builder.mark_last_tag();
        let block = builder.finish();
        assert_eq!(decode_descriptor_tags(&block, true).unwrap().len(), added);
    }

    #[test]
    fn test_commit_block_roundtrip() {
        let commit = CommitBlock {
            sequence: 3,
            commit_sec: 1_700_000_000,
            commit_nsec: 123_456_789,
            checksum_type: CHECKSUM_TYPE_FLETCHER32,
            checksum_size: CHECKSUM_SIZE,
            checksum: 0xDEADBEEF,
        };
        let block = commit.encode_block(1024);
        assert_eq!(block.len(), 1024);
        assert_eq!(CommitBlock::decode(&block).unwrap(), commit);
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock {
            sequence: 12,
            head: 7,
            free: 100,
        };
        let block = sb.encode_block(512);
        assert_eq!(Superblock::decode(&block).unwrap(), sb);
    }

    #[test]
    fn test_revoke_block_roundtrip() {
        let blocknrs = vec![5u64, 99, (1 << 40) + 3];
        let block = encode_revoke_block(512, 2, &blocknrs);
        assert_eq!(decode_revoke_block(&block).unwrap(), blocknrs);
    }
}
