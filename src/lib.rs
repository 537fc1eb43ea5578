//! Connection engine for a distributed-object RPC middleware: the per-socket state
//!  machine that multiplexes concurrent requests over one transport connection.
//!
//! A [`Connection`] wraps one [`Transceiver`] (a TCP stream or a connected UDP socket)
//!  and drives it through its life cycle:
//!
//! * **validation** - a fresh connection is not used until the handshake completes: the
//!   accepting side sends a ValidateConnection frame, the connecting side reads and
//!   verifies it. Datagram connections are implicitly validated.
//! * **request multiplexing** - any number of twoway requests may be outstanding at
//!   once; each carries a connection-scoped request id and its reply is routed back to
//!   the waiting caller through the outstanding-request table. Oneway requests (id 0)
//!   expect no reply, and oneways can be accumulated into a batch that travels as a
//!   single message.
//! * **dispatch** - inbound requests are handed to a [`Dispatcher`]; the connection
//!   never holds internal locks while user code runs, so servants can make nested
//!   invocations over the same connection.
//! * **shutdown** - closing drains in-flight dispatches, announces the closure with a
//!   CloseConnection frame and fails everything still outstanding with the *first*
//!   fatal error, exactly once per caller. An idle monitor reaps connections with no
//!   traffic, and every blocking wait in the shutdown path is bounded by a timeout.
//!
//! ## Wire format
//!
//! Every message starts with a fixed 14-byte header, integers big-endian:
//!
//! ```text
//! +----------+------+------+------+------+------+----------+-----------+
//! | magic    | pMaj | pMin | eMaj | eMin | type | compress | size      |
//! | 4 bytes  | 1    | 1    | 1    | 1    | 1    | 1        | 4 bytes   |
//! +----------+------+------+------+------+------+----------+-----------+
//! ```
//!
//! `size` is the total message size including the header. Message types:
//!
//! * `0` CloseConnection - no body
//! * `1` Request - request id (4 bytes), then the opaque request payload
//! * `2` RequestBatch - request count (4 bytes), then length-prefixed payloads
//! * `3` Reply - request id (4 bytes), dispatch status (1 byte), reply payload
//! * `4` ValidateConnection - no body

pub mod batch;
mod buffer_pool;
pub mod config;
pub mod connection;
pub mod connection_monitor;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod request_map;
pub mod tcp;
pub mod transceiver;
pub mod udp;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionRole, ConnectionState, DestructionReason, ReplyHandle};
pub use connection_monitor::ConnectionMonitor;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::RemotingError;
pub use request_map::Reply;
pub use transceiver::Transceiver;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
