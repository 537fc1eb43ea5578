use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

/// Result of dispatching one inbound request to user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// `false` marks a user exception; the reply payload then carries the marshaled
    ///  failure instead of return values.
    pub ok: bool,
    pub reply: Bytes,
}

impl DispatchOutcome {
    pub fn success(reply: Bytes) -> DispatchOutcome {
        DispatchOutcome { ok: true, reply }
    }

    pub fn failure(reply: Bytes) -> DispatchOutcome {
        DispatchOutcome { ok: false, reply }
    }
}

/// Servant dispatch behind a connection: invoked for every inbound request with the
///  opaque operation payload.
///
/// The connection never holds its internal lock while calling this, so implementations
///  are free to make nested invocations on the same or another connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn invoke(&self, request: &[u8]) -> DispatchOutcome;
}
