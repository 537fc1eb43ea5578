use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::error::RemotingError;

/// Abstraction over the byte I/O of one established connection (TCP stream, connected
///  UDP socket, TLS session, ...), introduced to keep the connection state machine free
///  of socket specifics and to facilitate mocking it away for testing.
///
/// Read and write are synchronized independently by the caller: the connection holds a
///  dedicated send lane so that a slow write never stalls inbound processing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transceiver: Send + Sync + 'static {
    /// Reads exactly `len` bytes, waiting as long as it takes unless a timeout is given.
    /// A peer hangup or short read surfaces as `ConnectionLost`.
    async fn read_exact(&self, len: usize, timeout: Option<Duration>) -> Result<Bytes, RemotingError>;

    /// Writes the whole buffer. Ordering across calls is the caller's responsibility.
    async fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<(), RemotingError>;

    /// Releases the underlying socket. Idempotent; any blocked read or write fails
    ///  afterwards.
    async fn close(&self);

    /// Half-closes the write direction so the peer observes an orderly end of stream
    ///  after the final CloseConnection frame. No-op for datagram transports.
    async fn shutdown_write(&self);

    /// Human-readable endpoint description (host:port pairs), stable for the lifetime
    ///  of the transceiver.
    fn descriptor(&self) -> String;
}
