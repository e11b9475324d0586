//! Error types for bedrock
//!
//! Defines a unified error type covering every component of the journaling
//! layer. I/O failures on metadata or the commit record poison the journal;
//! after that, every entry point answers `Aborted`.

use std::fmt;
use std::io;

/// Unified error type for journal operations
#[derive(Debug)]
pub enum JournalError {
    /// I/O error (device submit/wait/flush failure)
    Io(io::Error),
    /// The log has no free blocks left for a descriptor or metadata block
    NoSpace,
    /// A block number does not fit the narrow tag format
    TooLarge(u64),
    /// The journal has been aborted; sticky until the journal is recreated
    Aborted,
    /// The transaction is not in a state that permits the operation
    Transaction(String),
    /// Internal invariant violated
    InvalidState(&'static str),
    /// The commit daemon or an I/O worker has shut down
    Shutdown,
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::Io(e) => write!(f, "{}", e),
            JournalError::NoSpace => write!(f, "journal has no free log blocks"),
            JournalError::TooLarge(blocknr) => {
                write!(f, "block number {} does not fit a 32-bit tag", blocknr)
            }
            JournalError::Aborted => write!(f, "journal has been aborted"),
            JournalError::Transaction(msg) => write!(f, "{}", msg),
            JournalError::InvalidState(msg) => write!(f, "invalid journal state: {}", msg),
            JournalError::Shutdown => write!(f, "journal is shut down"),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<io::Error> for JournalError {
    fn from(e: io::Error) -> Self {
        JournalError::Io(e)
    }
}

/// Result type alias for journal operations
pub type Result<T> = std::result::Result<T, JournalError>;
