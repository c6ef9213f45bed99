//! Error kinds surfaced across the engine (spec.md §7).

use std::ops::Bound;

/// Reasons a transaction may be retried without the caller having done
/// anything wrong. Distinct from `RaftError` so that callers can pattern
/// match on exactly the five retry classes in spec.md §4.6.5.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    #[error("log entry at index {index} was overwritten by a later leader")]
    LogOverwritten { index: u64 },

    #[error("a conflicting write was committed to a key this transaction read")]
    Conflict { ranges: Vec<(Bound<Vec<u8>>, Bound<Vec<u8>>)> },

    #[error("local store failed to apply the transaction's writes")]
    MutableDataIo,

    #[error("snapshot install invalidated this transaction's base")]
    SnapshotInstalled,

    #[error("this server was deposed as leader while waiting on a read lease")]
    LeaderDeposed,

    #[error("transaction exceeded its commit timeout")]
    TimeoutExceeded,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// The transaction is no longer open (already committed, rolled back, or
    /// failed) and the caller is re-issuing an operation against it.
    #[error("transaction is no longer open")]
    Stale,

    /// Non-fatal: caller should re-open and retry.
    #[error("retry: {0}")]
    Retry(#[from] RetryReason),

    /// This server is not the leader.
    #[error("not the leader")]
    NotLeader { leader_hint: Option<crate::proto::ServerId> },

    /// Removing the last voting member of a configuration is rejected.
    #[error("cannot remove the last member of the cluster")]
    LastMemberRemoval,

    /// Another process already holds the log directory's `DirLock`.
    #[error("data directory {0} is locked by another process")]
    DirectoryLocked(String),

    /// A malformed wire message, log record, or persisted key was decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Local store or filesystem failure. Logged with detail internally;
    /// surfaced to clients only as a retry per spec.md §7.
    #[error("io error: {0}")]
    Io(String),
}

impl RaftError {
    /// Whether this error should be reported to the client as a retryable
    /// condition (spec.md §7: "Transport/IO: surfaced ... only as retry").
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaftError::Retry(_) | RaftError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
