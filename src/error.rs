use std::io;

/// The crate-wide error type.
///
/// A connection captures the *first* fatal error and re-delivers that same value to every
///  caller that subsequently fails on it, so the type is `Clone` and carries owned data
///  rather than source errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemotingError {
    // protocol violations - always fatal to the connection, never retried
    #[error("bad magic in message header: {found:02x?}")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported protocol version {found_major}.{found_minor}, supported is {supported_major}.x")]
    UnsupportedProtocolVersion { found_major: u8, found_minor: u8, supported_major: u8 },
    #[error("unsupported encoding version {found_major}.{found_minor}, supported is {supported_major}.x")]
    UnsupportedEncodingVersion { found_major: u8, found_minor: u8, supported_major: u8 },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("connection validation expected, received message type {0}")]
    ConnectionNotValidated(u8),
    #[error("illegal message size {size} (limit {limit})")]
    IllegalMessageSize { size: u32, limit: u32 },
    #[error("received reply for unknown request id {0}")]
    UnknownRequestId(u32),
    #[error("negative request count {0} in batch message")]
    NegativeBatchCount(i32),
    #[error("peer sent a compressed message but compression is not supported")]
    CompressionNotSupported,

    // capacity violations - fatal to the offending send, not necessarily to the connection
    #[error("message of {size} bytes exceeds the configured maximum of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("peer sent more than {limit} requests while the connection was held")]
    HeldRequestOverflow { limit: usize },

    // transport failures
    #[error("connection lost: {detail}")]
    ConnectionLost { detail: String },
    #[error("transport failure: {detail}")]
    TransportFailure { detail: String },

    // timeouts
    #[error("timeout establishing or validating the connection")]
    ConnectTimeout,
    #[error("timeout writing to the transport")]
    WriteTimeout,
    #[error("timeout waiting for the connection to close")]
    CloseTimeout,
    #[error("connection closed because it was idle")]
    IdleTimeout,

    // orderly shutdown
    #[error("connection closed by the peer")]
    ClosedByPeer,
    #[error("connection gracefully closed locally")]
    ClosedLocally,
    #[error("connection forcefully closed locally")]
    ForcedClose,
    #[error("object adapter deactivated")]
    AdapterDeactivated,
    #[error("runtime destroyed")]
    RuntimeDestroyed,
}

impl RemotingError {
    /// Errors that are part of a regular connection life cycle: they terminate the
    ///  connection but are not worth a warning in the log.
    pub fn is_expected_close(&self) -> bool {
        matches!(
            self,
            RemotingError::ClosedByPeer
                | RemotingError::IdleTimeout
                | RemotingError::ClosedLocally
                | RemotingError::AdapterDeactivated
                | RemotingError::RuntimeDestroyed
        )
    }

    pub fn from_io(e: io::Error) -> RemotingError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => RemotingError::ConnectionLost { detail: e.to_string() },
            io::ErrorKind::TimedOut => RemotingError::WriteTimeout,
            _ => RemotingError::TransportFailure { detail: e.to_string() },
        }
    }
}

impl From<io::Error> for RemotingError {
    fn from(e: io::Error) -> Self {
        RemotingError::from_io(e)
    }
}

pub type Result<T> = std::result::Result<T, RemotingError>;
