//! Error taxonomy for the sync layer.
//!
//! Only transport/retrieval errors are surfaced to query observers. Decode
//! failures are absorbed at the channel bus (a single bad message must not
//! take down shared infrastructure), and stale retrieval results are
//! discarded silently rather than reported.

use thiserror::Error;

/// Errors produced by the synchronization and caching layer.
///
/// `Clone` so a single in-flight result can be delivered to every observer
/// attached to the same request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Request/response call against the remote failed (connection lost,
    /// endpoint rejected the request, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// A channel payload failed schema validation.
    #[error("decode error: {0}")]
    Decode(String),

    /// The underlying change-notification stream ended.
    #[error("stream closed")]
    StreamClosed,

    /// No live connection to the remote.
    #[error("not connected")]
    Disconnected,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_from_serde() {
        let bad: Result<u32, _> = serde_json::from_str("not json");
        let err: SyncError = bad.unwrap_err().into();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn test_display() {
        let err = SyncError::Transport("connection reset".into());
        assert_eq!(err.to_string(), "transport error: connection reset");
    }
}
