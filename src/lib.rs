//! bedrock - a block-level write-ahead journaling engine
//!
//! Bedrock implements the commit side of a crash-consistent journaling
//! layer: a running transaction accumulates metadata and data buffer
//! mutations, and the commit pipeline atomically writes a durable record of
//! it to an on-disk circular log before releasing the buffers for lazy
//! writeback to their home locations.
//!
//! Core concepts:
//! - Descriptor-tagged log writes: each run of journaled blocks is indexed
//!   by a descriptor block of (home block number, checksum, type) tags.
//! - Shadow/IO pairing: log I/O proceeds on a frozen copy while the
//!   original buffer can be re-dirtied by the next transaction.
//! - Split durability: an ordered commit (OSYNC) writes the commit record
//!   but defers the device flush to a checkpoint deadline; a durable commit
//!   (DSYNC) flushes the journal device before the caller is released.
//! - A dedicated commit thread runs the seven-phase pipeline; writers
//!   attach to the running transaction and wait on condvar latches.

pub mod buffer;
pub mod checkpoint;
pub mod checksum;
mod commit;
pub mod device;
pub mod error;
pub mod journal;
pub mod revoke;
pub mod tag;
pub mod transaction;

pub use buffer::{BufferList, JournalBuffer};
pub use device::{BlockDevice, DeviceEvent, FileDevice, MemDevice};
pub use error::{JournalError, Result};
pub use journal::{CommitMode, Journal, JournalConfig, JournalFeatures, JournalStats, TxnHandle};
pub use tag::BlockType;
pub use transaction::{DataTag, InodeMapping, Transaction, TxnState};
