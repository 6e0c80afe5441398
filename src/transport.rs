//! Narrow contract against the external RPC client.
//!
//! The wire transport itself (framing, connection management, retry/backoff)
//! lives outside this crate; everything here consumes it through `Transport`.
//! Timeout policy is the transport's job, not ours.

use crate::error::SyncError;

/// One raw batch delivered on a named channel.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// Channel the batch arrived on.
    pub channel: String,
    /// Opaque payload; decoding is channel-specific and supplied by the
    /// bus registrant.
    pub payload: Vec<u8>,
}

impl RawBatch {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { channel: channel.into(), payload: payload.into() }
    }
}

/// Blocking reader over an open change-notification stream.
///
/// `Ok(None)` means the stream ended cleanly; batches for one channel are
/// yielded in arrival order.
pub trait StreamReader: Send {
    fn next_batch(&mut self) -> Result<Option<RawBatch>, SyncError>;
}

/// Request/response plus streaming handle onto the remote system.
pub trait Transport: Send + Sync {
    /// Issue a request and return the raw response payload. Callers decode
    /// with the schema they expect.
    fn send(&self, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, SyncError>;

    /// Open a change-notification stream for the named channels.
    fn open_stream(&self, channels: &[String]) -> Result<Box<dyn StreamReader>, SyncError>;

    /// Current connection state, as reported by the RPC client.
    fn is_connected(&self) -> bool;
}
