use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::RemotingError;

/// A decoded reply as delivered to the caller of a twoway invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Dispatch status byte from the wire: `true` if the servant completed normally.
    pub ok: bool,
    pub payload: Bytes,
}

/// How the caller consumes the completion. Sync callers block on the sink inside
///  `send_request`, async callers hold a [`ReplyHandle`] and await it later. The
///  distinction only matters for tracing - both are fulfilled the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Async,
}

pub type CallOutcome = Result<Reply, RemotingError>;

/// One in-flight twoway call: the tag plus the completion sink it is fulfilled through.
#[derive(Debug)]
pub struct PendingCall {
    pub mode: CallMode,
    sink: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    pub fn new(mode: CallMode) -> (PendingCall, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (PendingCall { mode, sink: tx }, rx)
    }

    /// Fulfills the call. Exactly one of `complete` / `fail` is invoked per call; a
    ///  dropped receiver (caller went away) is not an error.
    pub fn complete(self, reply: Reply) {
        let _ = self.sink.send(Ok(reply));
    }

    pub fn fail(self, error: RemotingError) {
        let _ = self.sink.send(Err(error));
    }
}

/// The outstanding-request table of one connection: request id to pending caller.
///
/// All mutation happens under the owning connection's state lock.
pub struct RequestMap {
    next_request_id: u32,
    pending: FxHashMap<u32, PendingCall>,
}

impl Default for RequestMap {
    fn default() -> Self {
        RequestMap {
            next_request_id: 1,
            pending: FxHashMap::default(),
        }
    }
}

impl RequestMap {
    /// Allocates a fresh request id. Id 0 is reserved on the wire to mean "no response
    ///  expected", so the counter wraps from `u32::MAX` back to 1. Uniqueness among
    ///  concurrently pending ids holds by construction: the id space is far larger than
    ///  any realistic number of in-flight calls.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = match self.next_request_id.checked_add(1) {
            Some(next) => next,
            None => 1,
        };
        id
    }

    pub fn register(&mut self, request_id: u32, call: PendingCall) {
        let previous = self.pending.insert(request_id, call);
        debug_assert!(previous.is_none(), "request id {} registered twice", request_id);
    }

    /// Removes and returns the pending call for a reply, if any. The caller fulfills it
    ///  outside the state lock.
    pub fn complete(&mut self, request_id: u32) -> Option<PendingCall> {
        self.pending.remove(&request_id)
    }

    /// Detaches all pending calls so they can be failed outside the lock with the
    ///  connection's terminal exception (drain-by-swap).
    pub fn drain(&mut self) -> Vec<PendingCall> {
        trace!("draining {} outstanding requests", self.pending.len());
        let detached = std::mem::take(&mut self.pending);
        detached.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
