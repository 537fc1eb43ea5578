use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::watch;
use tracing::debug;

use crate::error::RemotingError;
use crate::transceiver::Transceiver;

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM_SIZE: usize = 65507;

/// [`Transceiver`] over a connected UDP socket.
///
/// Each outbound frame is sent as one datagram. Inbound, a whole datagram is received
///  at once and buffered, so that the connection's header read and the subsequent body
///  read are both served from the same datagram. A message must fit into a single
///  datagram; reads that would span a datagram boundary are a protocol violation.
///
/// There must be at most one reader at a time, which holds for the owning connection's
///  single read loop.
pub struct UdpTransceiver {
    socket: UdpSocket,
    /// Unconsumed remainder of the most recently received datagram.
    pending: Mutex<BytesMut>,
    closed: watch::Sender<bool>,
    desc: String,
}

impl UdpTransceiver {
    pub async fn bind_and_connect(
        local: impl ToSocketAddrs,
        remote: impl ToSocketAddrs,
    ) -> Result<UdpTransceiver, RemotingError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        UdpTransceiver::from_socket(socket)
    }

    /// Wraps a socket that is already connected to its peer.
    pub fn from_socket(socket: UdpSocket) -> Result<UdpTransceiver, RemotingError> {
        let desc = match (socket.local_addr(), socket.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("local {} <-> remote {}", local, peer),
            _ => "udp".to_string(),
        };
        debug!("udp endpoint ready: {}", desc);

        Ok(UdpTransceiver {
            socket,
            pending: Mutex::new(BytesMut::new()),
            closed: watch::channel(false).0,
            desc,
        })
    }

    fn closed_error(&self) -> RemotingError {
        RemotingError::ConnectionLost { detail: "transceiver closed locally".to_string() }
    }

    async fn recv_datagram(&self) -> Result<Bytes, RemotingError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let received = self.socket.recv(&mut buf).await?;
        buf.truncate(received);
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn read_exact(&self, len: usize, timeout: Option<Duration>) -> Result<Bytes, RemotingError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }

        let io = async {
            loop {
                {
                    let mut pending = self.pending.lock().unwrap();
                    if pending.len() >= len {
                        return Ok(pending.split_to(len).freeze());
                    }
                    if !pending.is_empty() {
                        // the message claims more bytes than its datagram carried
                        return Err(RemotingError::TransportFailure {
                            detail: format!(
                                "message spans datagram boundary: {} bytes requested, {} left in datagram",
                                len,
                                pending.len()
                            ),
                        });
                    }
                }

                let datagram = tokio::select! {
                    result = self.recv_datagram() => result?,
                    _ = closed.wait_for(|c| *c) => return Err(self.closed_error()),
                };
                self.pending.lock().unwrap().extend_from_slice(&datagram);
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, io)
                .await
                .map_err(|_| RemotingError::ConnectTimeout)?,
            None => io.await,
        }
    }

    async fn write(&self, buf: &[u8], _timeout: Option<Duration>) -> Result<(), RemotingError> {
        if *self.closed.borrow() {
            return Err(self.closed_error());
        }
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(RemotingError::MessageTooLarge { size: buf.len(), limit: MAX_DATAGRAM_SIZE });
        }

        let sent = self.socket.send(buf).await?;
        if sent != buf.len() {
            return Err(RemotingError::TransportFailure {
                detail: format!("datagram truncated on send: {} of {} bytes", sent, buf.len()),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        debug!("closing udp transceiver: {}", self.desc);
        self.closed.send_replace(true);
    }

    /// Datagram sockets have no write direction to shut down.
    async fn shutdown_write(&self) {}

    fn descriptor(&self) -> String {
        self.desc.clone()
    }
}
