use std::time::Duration;

use anyhow::bail;

use crate::protocol::HEADER_SIZE;

/// Per-endpoint configuration of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounds the validation handshake (and the TCP connect of [`crate::tcp::TcpTransceiver`]).
    pub connect_timeout: Option<Duration>,

    /// How long `wait_until_finished` waits for the peer to complete the close handshake
    ///  before the connection is forcibly closed with `CloseTimeout`.
    pub close_timeout: Option<Duration>,

    /// Active connection management: a connection with no traffic, no outstanding
    ///  requests, no buffered batch and no dispatch in flight for this long is closed
    ///  gracefully. `None` disables idle monitoring.
    pub idle_timeout: Option<Duration>,

    /// Bounds individual transceiver writes. `None` means a write may block until the
    ///  socket accepts the bytes.
    pub write_timeout: Option<Duration>,

    /// Upper bound for a single message, header included. Inbound messages above this
    ///  are a protocol violation; outbound batches split themselves to stay below it.
    pub max_message_size: usize,

    /// Datagram connections skip validation and skip the Closing handshake: there is no
    ///  peer connection state to negotiate with.
    pub datagram: bool,

    /// Upper bound on requests buffered while the connection is Holding. A peer that
    ///  keeps sending into a held connection beyond this limit fails the connection
    ///  instead of growing the buffer without bound.
    pub max_held_requests: usize,

    /// Log a warning for unexpected connection errors and stray protocol messages.
    pub warn_connections: bool,

    /// Number of marshaling buffers kept in the per-connection pool.
    pub buffer_pool_size: usize,
}

impl ConnectionConfig {
    /// Defaults for stream-oriented (TCP) endpoints.
    pub fn tcp() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Some(Duration::from_secs(10)),
            close_timeout: Some(Duration::from_secs(10)),
            idle_timeout: Some(Duration::from_secs(60)),
            write_timeout: None,
            max_message_size: 1024 * 1024,
            datagram: false,
            max_held_requests: 1024,
            warn_connections: true,
            buffer_pool_size: 16,
        }
    }

    /// Defaults for connectionless (UDP) endpoints.
    pub fn datagram() -> ConnectionConfig {
        ConnectionConfig {
            // no handshake to time out, and nothing to wait for on close
            connect_timeout: None,
            close_timeout: None,
            idle_timeout: Some(Duration::from_secs(60)),
            write_timeout: None,
            max_message_size: 60 * 1024,
            datagram: true,
            max_held_requests: 1024,
            warn_connections: true,
            buffer_pool_size: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size < HEADER_SIZE + 8 {
            bail!("max message size of {} bytes cannot hold a single request", self.max_message_size);
        }
        if self.buffer_pool_size == 0 {
            bail!("buffer pool size must be at least 1");
        }
        if self.max_held_requests == 0 {
            bail!("a held request limit of zero would fail every held connection on its first request");
        }
        if let Some(idle) = self.idle_timeout {
            if idle.is_zero() {
                bail!("idle timeout of zero would close every connection immediately - use None to disable monitoring");
            }
        }
        Ok(())
    }
}
