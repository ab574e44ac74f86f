//! Client-visible error codes and the node's abort path.

use thiserror::Error;
use tracing::error;

/// Errors surfaced by the client SDK. Success is `Ok(..)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    #[error("cluster is down: no member answered as leader")]
    ClusterDown,
    #[error("no such key")]
    NoSuchKey,
    #[error("operation timed out")]
    Timeout,
    #[error("lock is held by another session")]
    LockFail,
    #[error("binlog could not be cleaned")]
    CleanBinlogFail,
    #[error("user already exists")]
    UserExists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("wrong password")]
    PasswordError,
    #[error("unknown user")]
    UnknownUser,
    #[error("leader is busy, retry later")]
    Busy,
}

/// Transport-level failures, kept apart from application responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    #[error("rpc to {0} timed out")]
    Timeout(String),
    #[error("frame codec error: {0}")]
    Codec(String),
}

/// Logs an invariant violation and aborts the process.
///
/// Used when continuing could let this replica silently diverge, e.g. a
/// missing slot below the log length or a failed durable write.
pub fn fatal(context: &str, err: &anyhow::Error) -> ! {
    error!(error = ?err, "{context}; aborting");
    std::process::abort()
}
