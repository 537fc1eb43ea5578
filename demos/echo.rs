//! Minimal echo setup: a server connection dispatching to an upper-casing servant, a
//!  client connection invoking it, both over a real TCP socket on localhost.
//!
//! ```text
//! cargo run --example echo
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{info, Level};

use remoting::connection::{Connection, ConnectionRole};
use remoting::tcp::TcpTransceiver;
use remoting::{ConnectionConfig, ConnectionMonitor, DispatchOutcome, Dispatcher};

struct UppercaseServant;

#[async_trait]
impl Dispatcher for UppercaseServant {
    async fn invoke(&self, request: &[u8]) -> DispatchOutcome {
        match std::str::from_utf8(request) {
            Ok(text) => {
                info!("dispatching request: {:?}", text);
                DispatchOutcome::success(Bytes::from(text.to_uppercase()))
            }
            Err(_) => DispatchOutcome::failure(Bytes::from_static(b"request payload is not utf-8")),
        }
    }
}

/// Dispatcher for the client side, which never receives requests.
struct NoServant;

#[async_trait]
impl Dispatcher for NoServant {
    async fn invoke(&self, _request: &[u8]) -> DispatchOutcome {
        DispatchOutcome::failure(Bytes::from_static(b"no servant on this side"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let config = ConnectionConfig::tcp();
    config.validate()?;

    let monitor = ConnectionMonitor::new(Duration::from_secs(5));
    monitor.spawn();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!("echo server listening on {}", addr);

    let server_task = tokio::spawn({
        let config = config.clone();
        let monitor = monitor.clone();
        async move {
            let (stream, _) = listener.accept().await?;
            let transceiver = Arc::new(TcpTransceiver::from_stream(stream)?);
            let server = Connection::new(transceiver, Arc::new(UppercaseServant), config, ConnectionRole::Inbound);
            server.start().await?;
            server.activate().await;
            monitor.add(server.clone());
            anyhow::Ok(server)
        }
    });

    let transceiver = Arc::new(TcpTransceiver::connect(addr, config.connect_timeout).await?);
    let client = Connection::new(transceiver, Arc::new(NoServant), config, ConnectionRole::Outbound);
    client.start().await?;
    monitor.add(client.clone());
    let server = server_task.await??;

    // a couple of twoway invocations, multiplexed over the one connection
    for text in ["hello", "remote objects", "over one socket"] {
        let reply = client.send_request(text.as_bytes()).await?;
        info!("reply (ok={}): {:?}", reply.ok, String::from_utf8_lossy(&reply.payload));
    }

    // batched oneways: nothing hits the wire until the flush
    client.add_batch_request(b"batched one", false).await?;
    client.add_batch_request(b"batched two", false).await?;
    client.flush_batch_requests().await?;

    client.close(false).await;
    client.wait_until_finished().await;
    server.wait_until_finished().await;
    info!("both connections closed cleanly");

    Ok(())
}
