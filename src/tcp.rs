use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use crate::error::RemotingError;
use crate::transceiver::Transceiver;

/// [`Transceiver`] over a TCP stream.
///
/// The two stream halves are guarded independently so reads and writes proceed in
///  parallel. `close` does not wait for the halves to become free: it flips a flag that
///  every blocked operation selects on, so in-flight I/O aborts promptly, and the OS
///  socket is released when the transceiver is dropped.
pub struct TcpTransceiver {
    read_half: AsyncMutex<OwnedReadHalf>,
    write_half: AsyncMutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
    desc: String,
}

impl TcpTransceiver {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpTransceiver, RemotingError> {
        let connect = TcpStream::connect(addr);
        let stream = match connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| RemotingError::ConnectTimeout)??,
            None => connect.await?,
        };
        TcpTransceiver::from_stream(stream)
    }

    /// Wraps an established stream, typically fresh from a listener's `accept`.
    pub fn from_stream(stream: TcpStream) -> Result<TcpTransceiver, RemotingError> {
        // favor latency: frames are small and marshaled in one piece
        stream.set_nodelay(true)?;

        let desc = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("local {} <-> remote {}", local, peer),
            _ => "tcp".to_string(),
        };
        debug!("tcp connection established: {}", desc);

        let (read_half, write_half) = stream.into_split();
        Ok(TcpTransceiver {
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
            closed: watch::channel(false).0,
            desc,
        })
    }

    fn closed_error(&self) -> RemotingError {
        RemotingError::ConnectionLost { detail: "transceiver closed locally".to_string() }
    }
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    async fn read_exact(&self, len: usize, timeout: Option<Duration>) -> Result<Bytes, RemotingError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }

        let io = async {
            tokio::select! {
                result = async {
                    let mut half = self.read_half.lock().await;
                    let mut buf = BytesMut::zeroed(len);
                    half.read_exact(&mut buf).await?;
                    Ok(buf.freeze())
                } => result,
                _ = closed.wait_for(|c| *c) => Err(self.closed_error()),
            }
        };

        match timeout {
            // a read timeout is only ever imposed on the validation handshake
            Some(timeout) => tokio::time::timeout(timeout, io)
                .await
                .map_err(|_| RemotingError::ConnectTimeout)?,
            None => io.await,
        }
    }

    async fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<(), RemotingError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }

        let io = async {
            tokio::select! {
                result = async {
                    let mut half = self.write_half.lock().await;
                    half.write_all(buf).await?;
                    Ok(())
                } => result,
                _ = closed.wait_for(|c| *c) => Err(self.closed_error()),
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, io)
                .await
                .map_err(|_| RemotingError::WriteTimeout)?,
            None => io.await,
        }
    }

    async fn close(&self) {
        debug!("closing tcp transceiver: {}", self.desc);
        self.closed.send_replace(true);

        // best effort FIN so the peer observes end of stream right away; if a write is
        //  in flight it aborts through the closed flag and the socket closes on drop
        if let Ok(mut half) = self.write_half.try_lock() {
            let _ = half.shutdown().await;
        }
    }

    async fn shutdown_write(&self) {
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
    }

    fn descriptor(&self) -> String {
        self.desc.clone()
    }
}
