use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::batch::BatchBuffer;
use crate::buffer_pool::MessagePool;
use crate::config::ConnectionConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::RemotingError;
use crate::protocol::{self, CompressionStatus, MessageHeader, MessageType, HEADER_SIZE};
use crate::request_map::{CallMode, CallOutcome, PendingCall, Reply, RequestMap};
use crate::transceiver::Transceiver;

/// Life cycle states of a connection. Monotonic except Active⇄Holding, which are
///  reversible while the connection is alive; Closed is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Transport handshake (TCP connect, TLS negotiation, ...) not finished yet.
    Initializing,
    /// Validation frame in flight. Datagram connections skip this state.
    Validating,
    /// Accepting new requests and dispatching inbound messages.
    Active,
    /// Dispatch paused (owning adapter is held); the socket is still read so peer
    ///  closure and in-flight replies are observed.
    Holding,
    /// Graceful shutdown: no new requests, in-flight dispatches drain, then a
    ///  CloseConnection frame goes to the peer.
    Closing,
    /// Terminal: transceiver closed (or closing), all outstanding requests failed.
    Closed,
}

/// Which side of the socket this connection is. Determines the validation role:
///  accepted connections actively send the ValidateConnection frame, outbound
///  connections passively read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Outbound,
    Inbound,
}

/// Why the owning runtime is destroying this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructionReason {
    AdapterDeactivated,
    RuntimeDestroyed,
}

impl From<DestructionReason> for RemotingError {
    fn from(reason: DestructionReason) -> Self {
        match reason {
            DestructionReason::AdapterDeactivated => RemotingError::AdapterDeactivated,
            DestructionReason::RuntimeDestroyed => RemotingError::RuntimeDestroyed,
        }
    }
}

/// A twoway invocation whose reply is consumed later. Returned by
///  [`Connection::send_async_request`].
pub struct ReplyHandle {
    receiver: oneshot::Receiver<CallOutcome>,
}

impl ReplyHandle {
    pub async fn await_reply(self) -> CallOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            // the connection was dropped without fulfilling the call
            Err(_) => Err(RemotingError::ConnectionLost { detail: "connection dropped".to_string() }),
        }
    }
}

struct ConnectionInner {
    state: ConnectionState,
    /// The first fatal error. Captured once, immutable thereafter, delivered to every
    ///  caller that subsequently fails on this connection.
    exception: Option<RemotingError>,
    requests: RequestMap,
    batch: BatchBuffer,
    /// Inbound requests currently being handled by the dispatcher, batch entries
    ///  counted individually.
    dispatch_count: usize,
    /// Requests that arrived while Holding; dispatched on activation, dropped on close.
    held_requests: Vec<(u32, Bytes)>,
    last_activity: Instant,
    /// When the current state was entered; bounds the close handshake.
    state_entered: Instant,
    transceiver_closed: bool,
    close_frame_sent: bool,
}

/// Deferred effects of a state transition, executed after the state lock is released.
enum FollowUp {
    FailPending(Vec<PendingCall>, RemotingError),
    Dispatch(Vec<(u32, Bytes)>),
    SendCloseFrame,
    CloseTransceiver,
}

/// Result of classifying an inbound message under the state lock. The actual work -
///  dispatching to user code or fulfilling a pending caller - happens outside the lock
///  so that nested invocations on this connection remain possible.
enum InboundWork {
    Nothing,
    Dispatch(Vec<(u32, Bytes)>),
    CompleteReply(PendingCall, Reply),
}

enum ParsedMessage {
    Close,
    /// One request, or the entries of a batch in envelope order. Request id 0 means no
    ///  response is expected.
    Requests(Vec<(u32, Bytes)>),
    Reply { request_id: u32, ok: bool, payload: Bytes },
    Validate,
}

/// The per-socket state machine at the heart of the middleware: validates a fresh
///  connection, multiplexes concurrent outstanding requests and their replies over one
///  transceiver, accumulates batched oneway requests, monitors idleness and executes
///  the shutdown sequence with bounded-blocking drain semantics.
///
/// Concurrency rules:
/// * every state-mutating operation is atomic under one internal mutex,
/// * that mutex is never held across an `.await` and never while user code (the
///   dispatcher, a caller's completion sink) runs,
/// * transceiver writes serialize on a dedicated send lane so a slow write never
///   stalls inbound processing or state queries.
pub struct Connection {
    id: Uuid,
    config: ConnectionConfig,
    role: ConnectionRole,
    transceiver: Arc<dyn Transceiver>,
    dispatcher: Arc<dyn Dispatcher>,
    desc: String,
    pool: MessagePool,
    inner: Mutex<ConnectionInner>,
    /// Bumped on every observable change; waiters subscribe and re-check their predicate.
    changed: watch::Sender<u64>,
    /// Serializes transceiver writes; also doubles as the "send in progress" signal for
    ///  the idle check.
    send_lane: AsyncMutex<()>,
    transceiver_open: AtomicBool,
}

impl Connection {
    pub fn new(
        transceiver: Arc<dyn Transceiver>,
        dispatcher: Arc<dyn Dispatcher>,
        config: ConnectionConfig,
        role: ConnectionRole,
    ) -> Arc<Connection> {
        let desc = transceiver.descriptor();
        let now = Instant::now();

        Arc::new(Connection {
            id: Uuid::new_v4(),
            pool: MessagePool::new(4 * 1024, config.buffer_pool_size),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Initializing,
                exception: None,
                requests: RequestMap::default(),
                batch: BatchBuffer::new(config.max_message_size),
                dispatch_count: 0,
                held_requests: Vec::new(),
                last_activity: now,
                state_entered: now,
                transceiver_closed: false,
                close_frame_sent: false,
            }),
            changed: watch::channel(0).0,
            send_lane: AsyncMutex::new(()),
            transceiver_open: AtomicBool::new(true),
            config,
            role,
            transceiver,
            dispatcher,
            desc,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &str {
        &self.desc
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_active_or_holding(&self) -> bool {
        matches!(self.state(), ConnectionState::Active | ConnectionState::Holding)
    }

    /// The first fatal error recorded on this connection, if any.
    pub fn terminal_exception(&self) -> Option<RemotingError> {
        self.inner.lock().unwrap().exception.clone()
    }

    /// Runs the validation handshake and starts the reader task.
    ///
    /// Outbound connections come out of this in Active; inbound connections park in
    ///  Holding until their adapter calls [`Self::activate`]. Datagram connections are
    ///  implicitly validated. Handshake errors are reported synchronously and leave the
    ///  connection Closed without it ever having been Active.
    pub async fn start(self: &Arc<Self>) -> Result<(), RemotingError> {
        self.set_state(ConnectionState::Validating, None).await;

        if !self.config.datagram {
            if let Err(e) = self.validate().await {
                self.set_state(ConnectionState::Closed, Some(e)).await;
                // report the captured exception so all observers see the same cause
                return Err(self.terminal_exception().expect("closed connection has an exception"));
            }
        }

        match self.role {
            ConnectionRole::Outbound => self.set_state(ConnectionState::Active, None).await,
            ConnectionRole::Inbound => self.set_state(ConnectionState::Holding, None).await,
        }

        let conn = self.clone();
        let conn_span = span!(Level::DEBUG, "connection", id = %self.id, desc = %self.desc);
        tokio::spawn(async move { conn.read_loop().await }.instrument(conn_span));

        Ok(())
    }

    async fn validate(&self) -> Result<(), RemotingError> {
        match self.role {
            ConnectionRole::Inbound => {
                // accepted connections play the active role in validation
                let mut buf = self.pool.acquire();
                protocol::marshal_validate_frame(&mut buf);

                let result = {
                    let _lane = self.send_lane.lock().await;
                    self.transceiver.write(&buf, self.config.connect_timeout).await
                };
                self.pool.release(buf);
                result?;
                trace!("sent validate connection");
            }
            ConnectionRole::Outbound => {
                let bytes = self.transceiver.read_exact(HEADER_SIZE, self.config.connect_timeout).await?;
                let mut b: &[u8] = &bytes;
                let header = MessageHeader::deser(&mut b)?;
                if header.message_type != MessageType::ValidateConnection {
                    return Err(RemotingError::ConnectionNotValidated(header.message_type.into()));
                }
                if header.size as usize != HEADER_SIZE {
                    return Err(RemotingError::IllegalMessageSize {
                        size: header.size,
                        limit: HEADER_SIZE as u32,
                    });
                }
                trace!("received validate connection");
            }
        }
        Ok(())
    }

    pub async fn activate(self: &Arc<Self>) {
        self.set_state(ConnectionState::Active, None).await;
    }

    pub async fn hold(self: &Arc<Self>) {
        self.set_state(ConnectionState::Holding, None).await;
    }

    /// Initiates a graceful shutdown on behalf of the owning runtime.
    pub async fn destroy(self: &Arc<Self>, reason: DestructionReason) {
        self.set_state(ConnectionState::Closing, Some(reason.into())).await;
    }

    /// Closes the connection.
    ///
    /// Graceful (`force == false`): blocks until all outstanding twoway requests have
    ///  drained naturally, then transitions to Closing - this prevents spurious retries
    ///  of requests the peer may already have processed. Forced: transitions straight
    ///  to Closed, failing everything outstanding with `ForcedClose`.
    pub async fn close(self: &Arc<Self>, force: bool) {
        if force {
            self.set_state(ConnectionState::Closed, Some(RemotingError::ForcedClose)).await;
        } else {
            self.wait_until(|inner| inner.requests.is_empty()).await;
            self.set_state(ConnectionState::Closing, Some(RemotingError::ClosedLocally)).await;
        }
    }

    /// Sends a twoway request and waits for its reply (or for the connection's terminal
    ///  exception - exactly one of the two is delivered).
    pub async fn send_request(self: &Arc<Self>, payload: &[u8]) -> CallOutcome {
        let receiver = self.send_twoway(payload, CallMode::Sync).await?;
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemotingError::ConnectionLost { detail: "connection dropped".to_string() }),
        }
    }

    /// Sends a twoway request without waiting; the reply is consumed through the
    ///  returned handle.
    pub async fn send_async_request(self: &Arc<Self>, payload: &[u8]) -> Result<ReplyHandle, RemotingError> {
        let receiver = self.send_twoway(payload, CallMode::Async).await?;
        Ok(ReplyHandle { receiver })
    }

    async fn send_twoway(
        self: &Arc<Self>,
        payload: &[u8],
        mode: CallMode,
    ) -> Result<oneshot::Receiver<CallOutcome>, RemotingError> {
        debug_assert!(!self.config.datagram, "twoway requests cannot be datagrams");
        self.check_outbound_size(HEADER_SIZE + 4 + payload.len())?;

        let (request_id, receiver) = {
            let mut inner = self.inner.lock().unwrap();
            self.check_sendable(&inner)?;

            let request_id = inner.requests.allocate_id();
            let (call, receiver) = PendingCall::new(mode);
            inner.requests.register(request_id, call);
            inner.last_activity = Instant::now();
            (request_id, receiver)
        };

        let mut buf = self.pool.acquire();
        protocol::marshal_request_frame(&mut buf, payload, false);
        protocol::patch_request_id(&mut buf, request_id);
        trace!("sending {:?} twoway request {}, {} bytes", mode, request_id, buf.len());

        let write_result = self.locked_write(&buf).await;
        self.pool.release(buf);

        match write_result {
            Ok(()) => Ok(receiver),
            Err(e) => {
                self.set_state(ConnectionState::Closed, Some(e)).await;

                // If closing the connection already failed this call through its sink,
                //  the terminal exception arrives via the receiver and must not also be
                //  raised here. Only if the call is still registered do we take it back
                //  and report directly.
                let still_registered = self.inner.lock().unwrap().requests.complete(request_id);
                match still_registered {
                    Some(_call) => Err(self.terminal_exception().expect("closed connection has an exception")),
                    None => Ok(receiver),
                }
            }
        }
    }

    /// Sends a fire-and-forget request (request id 0, no reply path).
    pub async fn send_oneway_request(self: &Arc<Self>, payload: &[u8]) -> Result<(), RemotingError> {
        self.check_outbound_size(HEADER_SIZE + 4 + payload.len())?;

        {
            let mut inner = self.inner.lock().unwrap();
            self.check_sendable(&inner)?;
            inner.last_activity = Instant::now();
        }

        let mut buf = self.pool.acquire();
        protocol::marshal_request_frame(&mut buf, payload, false);
        trace!("sending oneway request, {} bytes", buf.len());

        let write_result = self.locked_write(&buf).await;
        self.pool.release(buf);

        if let Err(e) = write_result {
            self.set_state(ConnectionState::Closed, Some(e.clone())).await;
            return Err(self.terminal_exception().unwrap_or(e));
        }
        Ok(())
    }

    /// Appends a oneway request to the in-progress batch. Nothing goes on the wire
    ///  until [`Self::flush_batch_requests`], unless the size limit forces an eager
    ///  split flush. A request too large for even an empty batch fails only this call.
    pub async fn add_batch_request(self: &Arc<Self>, payload: &[u8], compress: bool) -> Result<(), RemotingError> {
        let split_flush = {
            let mut inner = self.inner.lock().unwrap();
            self.check_sendable(&inner)?;
            inner.batch.append(payload, compress)?
        };

        if let Some(frame) = split_flush {
            self.write_frame(&frame).await?;
        }
        Ok(())
    }

    /// Removes the most recently added batch request again, for callers that fail
    ///  after reserving their slot in the batch. No-op on an empty batch.
    pub fn abort_batch_request(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.batch.request_count() > 0 {
            inner.batch.rollback_last();
        }
    }

    /// Transmits the accumulated batch as one RequestBatch message. No-op if the batch
    ///  is empty - a batch with count 0 is never sent.
    pub async fn flush_batch_requests(self: &Arc<Self>) -> Result<(), RemotingError> {
        let frame = {
            let mut inner = self.inner.lock().unwrap();
            self.check_sendable(&inner)?;
            let frame = inner.batch.flush();
            if frame.is_some() {
                inner.last_activity = Instant::now();
            }
            frame
        };

        match frame {
            Some(frame) => self.write_frame(&frame).await,
            None => Ok(()),
        }
    }

    fn check_outbound_size(&self, frame_size: usize) -> Result<(), RemotingError> {
        if frame_size > self.config.max_message_size {
            return Err(RemotingError::MessageTooLarge {
                size: frame_size,
                limit: self.config.max_message_size,
            });
        }
        Ok(())
    }

    /// Requests are only accepted strictly between validation and closing; once closing
    ///  has begun callers must retry on a fresh connection.
    fn check_sendable(&self, inner: &ConnectionInner) -> Result<(), RemotingError> {
        if let Some(exception) = &inner.exception {
            return Err(exception.clone());
        }
        match inner.state {
            ConnectionState::Active | ConnectionState::Holding => Ok(()),
            ConnectionState::Initializing | ConnectionState::Validating => {
                debug_assert!(false, "request sent before validation completed");
                Err(RemotingError::TransportFailure { detail: "connection not validated".to_string() })
            }
            ConnectionState::Closing | ConnectionState::Closed => Err(RemotingError::ClosedLocally),
        }
    }

    /// Writes one frame under the send lane. Fails with the terminal exception if the
    ///  transceiver is already gone.
    async fn locked_write(&self, frame: &[u8]) -> Result<(), RemotingError> {
        let _lane = self.send_lane.lock().await;
        if !self.transceiver_open.load(Ordering::SeqCst) {
            return Err(self
                .terminal_exception()
                .unwrap_or(RemotingError::ConnectionLost { detail: "transceiver closed".to_string() }));
        }
        self.transceiver.write(frame, self.config.write_timeout).await
    }

    async fn write_frame(self: &Arc<Self>, frame: &[u8]) -> Result<(), RemotingError> {
        if let Err(e) = self.locked_write(frame).await {
            self.set_state(ConnectionState::Closed, Some(e.clone())).await;
            return Err(self.terminal_exception().unwrap_or(e));
        }
        Ok(())
    }

    /// Periodic liveness check, driven by the [`crate::connection_monitor::ConnectionMonitor`].
    ///
    /// No-op unless the connection is Active and truly idle: no outstanding requests,
    ///  no batch mid-use, no send in progress, no dispatch in flight. A truly idle
    ///  connection past its idle timeout is closed *gracefully* so the peer gets to see
    ///  the CloseConnection frame.
    pub async fn check_idle(self: &Arc<Self>) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };

        // a send in progress holds the lane and counts as activity
        match self.send_lane.try_lock() {
            Ok(guard) => drop(guard),
            Err(_) => return,
        }

        let follow_ups = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnectionState::Active {
                return;
            }
            if !inner.requests.is_empty() || !inner.batch.is_empty() || inner.dispatch_count > 0 {
                return;
            }
            if inner.last_activity.elapsed() < idle_timeout {
                return;
            }

            debug!("closing idle connection {}", self.desc);
            self.transition(&mut inner, ConnectionState::Closing, Some(RemotingError::IdleTimeout))
        };
        self.apply(follow_ups).await;
    }

    /// Blocks until the connection has at least reached Holding and no dispatch is in
    ///  flight.
    pub async fn wait_until_holding(&self) {
        self.wait_until(|inner| inner.state >= ConnectionState::Holding && inner.dispatch_count == 0)
            .await;
    }

    /// Blocks until the connection is fully terminated: closing initiated, dispatches
    ///  drained, and the transceiver actually closed. The last wait is bounded by the
    ///  configured close timeout, after which the connection is forcibly closed with
    ///  `CloseTimeout` - this bounds how long a caller can be stuck regardless of peer
    ///  behavior.
    pub async fn wait_until_finished(self: &Arc<Self>) {
        self.wait_until(|inner| inner.state >= ConnectionState::Closing && inner.dispatch_count == 0)
            .await;

        if let Some(close_timeout) = self.config.close_timeout {
            let deadline = self.inner.lock().unwrap().state_entered + close_timeout;
            let closed = self.wait_until(|inner| inner.transceiver_closed);
            if tokio::time::timeout_at(deadline, closed).await.is_err() {
                debug!("peer did not complete the close handshake in time: {}", self.desc);
                self.set_state(ConnectionState::Closed, Some(RemotingError::CloseTimeout)).await;
                self.wait_until(|inner| inner.transceiver_closed).await;
            }
        } else {
            self.wait_until(|inner| inner.transceiver_closed).await;
        }

        debug_assert_eq!(self.state(), ConnectionState::Closed);
    }

    async fn wait_until(&self, predicate: impl Fn(&ConnectionInner) -> bool) {
        let mut rx = self.changed.subscribe();
        loop {
            if predicate(&self.inner.lock().unwrap()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    async fn set_state(self: &Arc<Self>, target: ConnectionState, exception: Option<RemotingError>) {
        let follow_ups = {
            let mut inner = self.inner.lock().unwrap();
            self.transition(&mut inner, target, exception)
        };
        self.apply(follow_ups).await;
    }

    /// The transition function of the state machine. Must be called under the state
    ///  lock; returns the effects to run once the lock is released.
    fn transition(
        &self,
        inner: &mut ConnectionInner,
        mut target: ConnectionState,
        exception: Option<RemotingError>,
    ) -> Vec<FollowUp> {
        use ConnectionState::*;

        if let Some(exception) = exception {
            debug_assert!(target >= Closing, "an exception only accompanies closing transitions");

            if inner.exception.is_none() {
                if self.config.warn_connections
                    && inner.state >= Active // never validated - not worth a warning
                    && !exception.is_expected_close()
                    && !(matches!(exception, RemotingError::ConnectionLost { .. }) && inner.state == Closing)
                {
                    warn!("connection error on {}: {}", self.desc, exception);
                }
                inner.exception = Some(exception);
            }
        }

        // there is no close handshake to perform on a datagram connection
        if self.config.datagram && target == Closing {
            target = Closed;
        }

        if inner.state == target || inner.state == Closed {
            return Vec::new();
        }

        let mut follow_ups = Vec::new();
        match target {
            Initializing => {
                debug_assert!(false, "cannot transition back to Initializing");
                return Vec::new();
            }
            Validating => {
                if inner.state != Initializing {
                    return Vec::new();
                }
            }
            Active => {
                if !matches!(inner.state, Validating | Holding) {
                    return Vec::new();
                }
                if !inner.held_requests.is_empty() {
                    let held = std::mem::take(&mut inner.held_requests);
                    inner.dispatch_count += held.len();
                    follow_ups.push(FollowUp::Dispatch(held));
                }
            }
            Holding => {
                if !matches!(inner.state, Validating | Active) {
                    return Vec::new();
                }
            }
            Closing => {
                // reachable from every live state; requests deferred while Holding
                //  never dispatch once closing begins
                inner.held_requests.clear();
            }
            Closed => {
                let terminal = inner
                    .exception
                    .clone()
                    .unwrap_or(RemotingError::ClosedLocally);
                inner.held_requests.clear();
                follow_ups.push(FollowUp::FailPending(inner.requests.drain(), terminal));
                follow_ups.push(FollowUp::CloseTransceiver);
            }
        }

        debug!("connection {}: {:?} -> {:?}", self.desc, inner.state, target);
        inner.state = target;
        inner.state_entered = Instant::now();

        if target == Closing && inner.dispatch_count == 0 && !inner.close_frame_sent {
            inner.close_frame_sent = true;
            follow_ups.push(FollowUp::SendCloseFrame);
        }

        self.notify();
        follow_ups
    }

    /// Runs the effects of one or more transitions. Processed as a work queue rather
    ///  than recursively: a failing close frame transitions to Closed, whose own
    ///  follow-ups are appended here.
    async fn apply(self: &Arc<Self>, follow_ups: Vec<FollowUp>) {
        let mut queue = VecDeque::from(follow_ups);
        while let Some(follow_up) = queue.pop_front() {
            match follow_up {
                FollowUp::FailPending(calls, exception) => {
                    // outside the lock: completion sinks may run caller code
                    for call in calls {
                        call.fail(exception.clone());
                    }
                }
                FollowUp::Dispatch(entries) => self.spawn_dispatch(entries),
                FollowUp::SendCloseFrame => queue.extend(self.send_close_frame().await),
                FollowUp::CloseTransceiver => {
                    if self.transceiver_open.swap(false, Ordering::SeqCst) {
                        self.transceiver.close().await;
                    }
                    self.inner.lock().unwrap().transceiver_closed = true;
                    self.notify();
                }
            }
        }
    }

    /// The active side of the close handshake: one CloseConnection frame, then the
    ///  write direction is shut down. Triggered when Closing is entered with no
    ///  dispatch in flight, or when the last in-flight dispatch finishes while Closing.
    ///  Returns the follow-ups of the Closed transition if the write fails.
    async fn send_close_frame(self: &Arc<Self>) -> Vec<FollowUp> {
        debug!("sending close connection");

        let mut buf = self.pool.acquire();
        protocol::marshal_close_frame(&mut buf);

        let result = {
            let _lane = self.send_lane.lock().await;
            if !self.transceiver_open.load(Ordering::SeqCst) {
                self.pool.release(buf);
                return Vec::new();
            }
            let result = self.transceiver.write(&buf, self.config.write_timeout).await;
            if result.is_ok() {
                self.transceiver.shutdown_write().await;
            }
            result
        };
        self.pool.release(buf);

        match result {
            Ok(()) => Vec::new(),
            Err(e) => {
                let mut inner = self.inner.lock().unwrap();
                self.transition(&mut inner, ConnectionState::Closed, Some(e))
            }
        }
    }

    /// Drives inbound messages until the transceiver fails or the connection closes.
    ///  Any read or protocol error collapses into the terminal state; in-flight callers
    ///  are failed exactly once through the outstanding-request table.
    async fn read_loop(self: Arc<Self>) {
        debug!("starting read loop");
        loop {
            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    self.set_state(ConnectionState::Closed, Some(e)).await;
                    break;
                }
            };

            self.handle_frame(frame).await;

            if self.state() == ConnectionState::Closed {
                break;
            }
        }
        debug!("read loop terminated");
    }

    async fn read_frame(&self) -> Result<(MessageHeader, Bytes), RemotingError> {
        let header_bytes = self.transceiver.read_exact(HEADER_SIZE, None).await?;
        let mut b: &[u8] = &header_bytes;
        let header = MessageHeader::deser(&mut b)?;

        if header.size as usize > self.config.max_message_size {
            return Err(RemotingError::IllegalMessageSize {
                size: header.size,
                limit: self.config.max_message_size as u32,
            });
        }
        if header.compress == CompressionStatus::Compressed {
            return Err(RemotingError::CompressionNotSupported);
        }

        let body = if header.size as usize > HEADER_SIZE {
            self.transceiver.read_exact(header.size as usize - HEADER_SIZE, None).await?
        } else {
            Bytes::new()
        };
        trace!("received {:?} message, {} bytes", header.message_type, header.size);

        Ok((header, body))
    }

    fn parse_message(&self, header: &MessageHeader, mut body: Bytes) -> Result<ParsedMessage, RemotingError> {
        let truncated = RemotingError::IllegalMessageSize {
            size: header.size,
            limit: self.config.max_message_size as u32,
        };

        match header.message_type {
            MessageType::CloseConnection => Ok(ParsedMessage::Close),
            MessageType::Request => {
                let request_id = body.try_get_u32().map_err(|_| truncated.clone())?;
                Ok(ParsedMessage::Requests(vec![(request_id, body)]))
            }
            MessageType::RequestBatch => {
                let count = body.try_get_i32().map_err(|_| truncated.clone())?;
                if count < 0 {
                    return Err(RemotingError::NegativeBatchCount(count));
                }

                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let len = body.try_get_u32().map_err(|_| truncated.clone())? as usize;
                    if body.remaining() < len {
                        return Err(truncated);
                    }
                    // batched entries are all oneway: request id 0 implied
                    entries.push((0u32, body.split_to(len)));
                }
                Ok(ParsedMessage::Requests(entries))
            }
            MessageType::Reply => {
                let request_id = body.try_get_u32().map_err(|_| truncated.clone())?;
                let ok = body.try_get_u8().map_err(|_| truncated)? != 0;
                Ok(ParsedMessage::Reply { request_id, ok, payload: body })
            }
            MessageType::ValidateConnection => Ok(ParsedMessage::Validate),
        }
    }

    async fn handle_frame(self: &Arc<Self>, (header, body): (MessageHeader, Bytes)) {
        let parsed = match self.parse_message(&header, body) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.set_state(ConnectionState::Closed, Some(e)).await;
                return;
            }
        };

        // Classification happens under the state lock, the work itself afterwards.
        let (work, follow_ups) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnectionState::Closed {
                return;
            }
            // idle refresh per fully parsed logical message - deliberately not per read
            //  syscall, which would need this lock on the hot path
            inner.last_activity = Instant::now();

            match parsed {
                ParsedMessage::Close => {
                    if self.config.datagram {
                        if self.config.warn_connections {
                            warn!("ignoring close connection message for datagram connection: {}", self.desc);
                        }
                        (InboundWork::Nothing, Vec::new())
                    } else {
                        trace!("received close connection");
                        let follow_ups =
                            self.transition(&mut inner, ConnectionState::Closed, Some(RemotingError::ClosedByPeer));
                        (InboundWork::Nothing, follow_ups)
                    }
                }
                ParsedMessage::Requests(entries) => {
                    if inner.state == ConnectionState::Closing {
                        // dropped on purpose: a reply must not race past the half-closed
                        //  socket, and the sender will retry elsewhere
                        trace!("received request during closing, ignoring (peer will retry)");
                        (InboundWork::Nothing, Vec::new())
                    } else if inner.state == ConnectionState::Holding {
                        if inner.held_requests.len() + entries.len() > self.config.max_held_requests {
                            let follow_ups = self.transition(
                                &mut inner,
                                ConnectionState::Closed,
                                Some(RemotingError::HeldRequestOverflow { limit: self.config.max_held_requests }),
                            );
                            (InboundWork::Nothing, follow_ups)
                        } else {
                            trace!("received request while holding, deferring dispatch");
                            inner.held_requests.extend(entries);
                            (InboundWork::Nothing, Vec::new())
                        }
                    } else {
                        inner.dispatch_count += entries.len();
                        (InboundWork::Dispatch(entries), Vec::new())
                    }
                }
                ParsedMessage::Reply { request_id, ok, payload } => match inner.requests.complete(request_id) {
                    Some(call) => (InboundWork::CompleteReply(call, Reply { ok, payload }), Vec::new()),
                    None => {
                        let follow_ups = self.transition(
                            &mut inner,
                            ConnectionState::Closed,
                            Some(RemotingError::UnknownRequestId(request_id)),
                        );
                        (InboundWork::Nothing, follow_ups)
                    }
                },
                ParsedMessage::Validate => {
                    // only meaningful during validation; harmless but worth a warning later
                    if self.config.warn_connections {
                        warn!("ignoring unexpected validate connection message: {}", self.desc);
                    }
                    (InboundWork::Nothing, Vec::new())
                }
            }
        };

        // every inbound message is an observable change (activity, dispatch count, state)
        self.notify();
        self.apply(follow_ups).await;

        match work {
            InboundWork::Nothing => {}
            InboundWork::CompleteReply(call, reply) => {
                trace!("received reply for {:?} request", call.mode);
                call.complete(reply);
            }
            InboundWork::Dispatch(entries) => self.spawn_dispatch(entries),
        }
    }

    /// Hands dispatch work to its own task. The read loop must never await user code:
    ///  replies and further requests keep flowing while a dispatcher runs, which is
    ///  also what lets a dispatcher make nested invocations over this same connection.
    fn spawn_dispatch(self: &Arc<Self>, entries: Vec<(u32, Bytes)>) {
        let conn = self.clone();
        tokio::spawn(async move { conn.run_dispatch(entries).await });
    }

    /// Batch entries execute in envelope order within one task; user code runs without
    ///  the state lock.
    async fn run_dispatch(self: &Arc<Self>, entries: Vec<(u32, Bytes)>) {
        for (request_id, payload) in entries {
            let outcome = self.dispatcher.invoke(&payload).await;

            if request_id != 0 && !self.config.datagram {
                self.send_response(request_id, outcome).await;
            } else {
                self.send_no_response().await;
            }
        }
    }

    async fn send_response(self: &Arc<Self>, request_id: u32, outcome: DispatchOutcome) {
        let mut buf = self.pool.acquire();
        protocol::marshal_reply_frame(&mut buf, request_id, outcome.ok, &outcome.reply);
        trace!("sending reply for request {}, {} bytes", request_id, buf.len());

        let result = if buf.len() > self.config.max_message_size {
            Err(RemotingError::MessageTooLarge { size: buf.len(), limit: self.config.max_message_size })
        } else {
            self.locked_write(&buf).await
        };
        self.pool.release(buf);

        if let Err(e) = result {
            self.set_state(ConnectionState::Closed, Some(e)).await;
        }

        self.finish_dispatch().await;
    }

    async fn send_no_response(self: &Arc<Self>) {
        self.finish_dispatch().await;
    }

    /// Bookkeeping after one unit of dispatch work. Reaching a dispatch count of zero
    ///  while Closing is what lets the passive side of the close handshake terminate.
    async fn finish_dispatch(self: &Arc<Self>) {
        let follow_ups = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.dispatch_count > 0);
            inner.dispatch_count -= 1;
            inner.last_activity = Instant::now();

            if inner.state == ConnectionState::Closing && inner.dispatch_count == 0 && !inner.close_frame_sent {
                inner.close_frame_sent = true;
                vec![FollowUp::SendCloseFrame]
            } else {
                Vec::new()
            }
        };
        self.notify();
        self.apply(follow_ups).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The factory owning this connection is responsible for closing it; this is
        //  diagnosis, not cleanup.
        if let Ok(inner) = self.inner.get_mut() {
            if inner.state != ConnectionState::Closed {
                warn!("connection dropped before reaching Closed: {}", self.desc);
            }
        }
    }
}
