// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Long-lived duplex channel between the agent and its collector.
//!
//! # Architecture
//!
//! After the handshake the channel is split and driven by two tasks:
//! - **Writer**: the only task touching the sink. Pushes, responses and agent-initiated
//!   requests reach it through one bounded queue, so concurrent producers never
//!   interleave frames.
//! - **Reader**: decodes inbound frames. Collector requests are handed to spawned
//!   handler tasks and answered asynchronously through the queue, so a slow handler
//!   never blocks the reader and responses may go out of order. Responses to
//!   agent-initiated requests complete the matching entry of the pending table.
//!
//! ```text
//! producers ──push/request──► queue ──► writer ──► collector
//!                               ▲                      │
//!                 handler tasks ┘◄── reader ◄──────────┘
//! ```
//!
//! # Lifecycle
//!
//! `DISCONNECTED → HANDSHAKING → CONNECTED → CLOSING → CLOSED`. A fatal channel error
//! moves straight through `CLOSING` to `CLOSED`. A connection is never reopened; pushes
//! still queued when it failed can be recovered with
//! [`StreamingConnection::take_unsent`], and [`crate::stream::StreamingSupervisor`]
//! builds replacement connections.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{OverflowPolicy, StreamingConfig};
use crate::errors::{CodecError, ConnectionError};
use crate::rollup::RollupPayload;
use crate::stream::codec::{length_codec, Frame};
use crate::stream::handler::RequestRouter;
use crate::stream::message::{
    DataPush, GaugeSample, Hello, LogEvent, Request, Response, TraceRecord, PROTOCOL_VERSION,
};
use crate::stream::state::{
    Compatibility, ConnectionSlot, ConnectionState, ConnectionStatus, SlotGuard,
};

type Transport<T> = Framed<T, LengthDelimitedCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full under [`OverflowPolicy::DropNewest`].
    Dropped,
    /// The collector cannot understand this message kind.
    Skipped,
    /// No connection was up; the supervisor holds the push for the next one.
    Buffered,
}

struct Shared {
    config: StreamingConfig,
    router: RequestRouter,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
    compatibility: OnceLock<Compatibility>,
    outbound: OnceLock<mpsc::Sender<Frame>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_request_id: AtomicU64,
    dropped_pushes: AtomicU64,
    in_flight: AtomicUsize,
    // cancels collector request handlers
    handlers: CancellationToken,
    // asks the writer to flush its queue and half-close
    drain: CancellationToken,
    // stops both loops without draining
    terminate: CancellationToken,
    // aborts a handshake that is still in progress
    handshake: CancellationToken,
    // pushes stranded in the queue of a failed channel
    unsent: Mutex<Vec<DataPush>>,
    slot: Mutex<Option<SlotGuard>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    #[allow(clippy::expect_used)]
    mutex.lock().expect("lock poisoned")
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Collector connection state changed");
        }
    }

    fn record_error(&self, err: &impl Display) {
        *lock(&self.last_error) = Some(err.to_string());
    }

    /// Tears the channel down after a fatal error.
    fn fail(&self, err: ConnectionError) {
        match self.state() {
            ConnectionState::Closed => return,
            // close() is already tearing down and will finish the transition
            ConnectionState::Closing => {
                warn!(error = %err, "Collector channel error while closing");
                self.record_error(&err);
                return;
            }
            _ => {}
        }
        error!(error = %err, "Collector connection failed");
        self.record_error(&err);
        self.set_state(ConnectionState::Closing);
        self.handlers.cancel();
        self.drain.cancel();
        self.terminate.cancel();
        self.finish();
    }

    fn finish(&self) {
        // dropping the senders fails every waiting request with `Closed`
        lock(&self.pending).clear();
        lock(&self.slot).take();
        self.set_state(ConnectionState::Closed);
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let tag = frame.tag();
        match frame {
            Frame::Request(request) => self.spawn_request(request),
            Frame::Response(response) => {
                let request_id = response.request_id;
                match lock(&self.pending).remove(&request_id) {
                    Some(waiter) => {
                        // the requester may have given up already
                        let _ = waiter.send(response);
                    }
                    None => debug!(request_id, "Dropping response for unknown or expired request"),
                }
            }
            Frame::HelloAck(ack) => debug!(
                collector_version = %ack.collector_version,
                "Ignoring hello acknowledgement outside of handshake"
            ),
            Frame::Hello(_) | Frame::DataPush(_) => {
                warn!(tag, "Ignoring unexpected message from collector");
            }
        }
    }

    fn respond_empty(&self, request_id: u64) {
        let Some(outbound) = self.outbound.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            let response = Frame::Response(Response::empty(request_id));
            if outbound.send(response).await.is_err() {
                debug!(request_id, "Outbound queue closed before response was sent");
            }
        });
    }

    fn spawn_request(self: &Arc<Self>, request: Request) {
        let Some(outbound) = self.outbound.get().cloned() else {
            return;
        };
        let handler = self.router.route(&request.kind);
        if handler.is_none() {
            debug!(
                request_id = request.request_id,
                kind = %request.kind,
                "Unrecognized request kind, sending empty response"
            );
        }

        let shared = Arc::clone(self);
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let Request {
                request_id,
                kind,
                payload,
            } = request;
            let work = async move {
                let payload = match handler {
                    Some(handler) => match handler.handle(payload).await {
                        Ok(body) => body,
                        Err(err) => {
                            warn!(
                                request_id,
                                %kind,
                                error = %err,
                                "Request handler failed, sending empty response"
                            );
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                };
                let response = Frame::Response(Response {
                    request_id,
                    payload,
                });
                if outbound.send(response).await.is_err() {
                    debug!(request_id, "Outbound queue closed before response was sent");
                }
            };
            tokio::select! {
                _ = shared.handlers.cancelled() => {
                    debug!(request_id, "Request handler cancelled");
                }
                _ = work => {}
            }
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

struct Tasks {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

pub struct StreamingConnection {
    shared: Arc<Shared>,
    slot: Arc<ConnectionSlot>,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

impl StreamingConnection {
    /// Creates a disconnected connection bound to the process-wide slot.
    #[must_use]
    pub fn new(config: StreamingConfig, router: RequestRouter) -> Self {
        Self::with_slot(config, router, ConnectionSlot::process())
    }

    #[must_use]
    pub fn with_slot(
        config: StreamingConfig,
        router: RequestRouter,
        slot: Arc<ConnectionSlot>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                router,
                state,
                last_error: Mutex::new(None),
                compatibility: OnceLock::new(),
                outbound: OnceLock::new(),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                dropped_pushes: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                handlers: CancellationToken::new(),
                drain: CancellationToken::new(),
                terminate: CancellationToken::new(),
                handshake: CancellationToken::new(),
                unsent: Mutex::new(Vec::new()),
                slot: Mutex::new(None),
            }),
            slot,
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens a TCP channel to the configured collector and performs the handshake.
    pub async fn connect_tcp(&self) -> Result<Compatibility, ConnectionError> {
        let stream = TcpStream::connect(&self.shared.config.collector_address).await?;
        stream.set_nodelay(true)?;
        self.connect(stream).await
    }

    /// Performs the handshake over `io` and starts the reader and writer loops.
    ///
    /// A [`close`](Self::close) issued during the handshake aborts it with
    /// [`ConnectionError::Closed`].
    pub async fn connect<T>(&self, io: T) -> Result<Compatibility, ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // held until the loops are registered, so close() cannot slip in between
        let mut tasks = self.tasks.lock().await;
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(ConnectionError::InvalidState(state));
        }
        let guard = self.slot.acquire()?;
        *lock(&self.shared.slot) = Some(guard);

        let handshake = tokio::select! {
            biased;
            () = self.shared.handshake.cancelled() => Err(ConnectionError::Closed),
            result = self.handshake_and_start(io) => result,
        };
        match handshake {
            Ok((compatibility, started)) => {
                *tasks = Some(started);
                Ok(compatibility)
            }
            Err(ConnectionError::Closed) => {
                debug!("Collector handshake aborted by close");
                self.shared.finish();
                Err(ConnectionError::Closed)
            }
            Err(err) => {
                error!(error = %err, "Collector handshake failed");
                self.shared.record_error(&err);
                self.shared.finish();
                Err(err)
            }
        }
    }

    async fn handshake_and_start<T>(
        &self,
        io: T,
    ) -> Result<(Compatibility, Tasks), ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = &self.shared.config;
        let mut transport = Framed::new(io, length_codec(config.max_frame_bytes));

        self.shared.set_state(ConnectionState::Handshaking);
        let hello = Frame::Hello(Hello {
            agent_id: config.agent_id.clone(),
            agent_version: config.agent_version.clone(),
            protocol_version: PROTOCOL_VERSION,
        });
        match timeout(config.write_stall_timeout, transport.send(hello.encode()?)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Stalled(config.write_stall_timeout)),
        }

        let (compatibility, first) = match timeout(config.handshake_timeout, transport.next()).await
        {
            Ok(Some(Ok(bytes))) => match Frame::decode(&bytes) {
                Ok(Frame::HelloAck(ack)) => (
                    Compatibility::negotiate(&config.agent_version, &ack.collector_version),
                    None,
                ),
                Ok(frame) => {
                    debug!("Collector did not acknowledge hello, assuming a legacy collector");
                    (Compatibility::legacy(), Some(frame))
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        "Unreadable first message from collector, assuming a legacy collector"
                    );
                    (Compatibility::legacy(), None)
                }
            },
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(None) => return Err(ConnectionError::ClosedDuringHandshake),
            Err(_) => {
                debug!(
                    timeout = ?config.handshake_timeout,
                    "No hello acknowledgement, assuming a legacy collector"
                );
                (Compatibility::legacy(), None)
            }
        };
        debug!(?compatibility, "Collector handshake complete");

        let _ = self.shared.compatibility.set(compatibility.clone());
        let (tx, rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let _ = self.shared.outbound.set(tx);

        // CONNECTED before the loops start, so they can tell a failure from a close
        self.shared.set_state(ConnectionState::Connected);
        let (sink, stream) = transport.split();
        let writer = tokio::spawn(run_writer(Arc::clone(&self.shared), sink, rx));
        let reader = tokio::spawn(run_reader(Arc::clone(&self.shared), stream, first));

        Ok((compatibility, Tasks { writer, reader }))
    }

    pub async fn push(&self, data: DataPush) -> Result<PushOutcome, ConnectionError> {
        self.ensure_connected()?;
        let kind = data.kind();
        if matches!(data, DataPush::Logs(_)) && !self.gated_features_enabled() {
            debug!(kind, "Collector does not accept this message kind, skipping push");
            return Ok(PushOutcome::Skipped);
        }
        let outbound = self.outbound()?;
        let frame = Frame::DataPush(data);

        match self.shared.config.overflow_policy {
            OverflowPolicy::DropNewest => match outbound.try_send(frame) {
                Ok(()) => Ok(PushOutcome::Queued),
                Err(TrySendError::Full(_)) => {
                    let dropped = self.shared.dropped_pushes.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(kind, dropped, "Outbound queue full, dropping push");
                    Ok(PushOutcome::Dropped)
                }
                Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
            },
            OverflowPolicy::Block => {
                let stall = self.shared.config.write_stall_timeout;
                match timeout(stall, outbound.send(frame)).await {
                    Ok(Ok(())) => Ok(PushOutcome::Queued),
                    Ok(Err(_)) => Err(ConnectionError::Closed),
                    Err(_) => {
                        self.shared.fail(ConnectionError::Stalled(stall));
                        Err(ConnectionError::Stalled(stall))
                    }
                }
            }
        }
    }

    pub async fn push_rollups(
        &self,
        rollups: Vec<RollupPayload>,
    ) -> Result<PushOutcome, ConnectionError> {
        self.push(DataPush::Rollups(rollups)).await
    }

    pub async fn push_traces(
        &self,
        traces: Vec<TraceRecord>,
    ) -> Result<PushOutcome, ConnectionError> {
        self.push(DataPush::Traces(traces)).await
    }

    pub async fn push_gauges(
        &self,
        gauges: Vec<GaugeSample>,
    ) -> Result<PushOutcome, ConnectionError> {
        self.push(DataPush::Gauges(gauges)).await
    }

    pub async fn push_logs(&self, logs: Vec<LogEvent>) -> Result<PushOutcome, ConnectionError> {
        self.push(DataPush::Logs(logs)).await
    }

    /// Sends a request to the collector and waits for its response.
    ///
    /// A timeout is a soft error: the connection stays up and a late response is
    /// discarded.
    pub async fn request(&self, kind: &str, payload: Vec<u8>) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_connected()?;
        let outbound = self.outbound()?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);

        let frame = Frame::Request(Request {
            request_id,
            kind: kind.to_string(),
            payload,
        });
        let exchange = async {
            outbound
                .send(frame)
                .await
                .map_err(|_| ConnectionError::Closed)?;
            rx.await.map_err(|_| ConnectionError::Closed)
        };

        match timeout(self.shared.config.request_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response.payload),
            Ok(Err(err)) => {
                lock(&self.shared.pending).remove(&request_id);
                Err(err)
            }
            Err(_) => {
                lock(&self.shared.pending).remove(&request_id);
                warn!(request_id, kind, "Request to collector timed out");
                Err(ConnectionError::RequestTimeout {
                    request_id,
                    kind: kind.to_string(),
                })
            }
        }
    }

    /// Half-closes the channel, waits for the collector to finish, then tears down.
    ///
    /// In-flight request handlers are cancelled and a handshake still in progress is
    /// aborted. Calling `close` again is a no-op. If the collector does not finish
    /// within the shutdown timeout the channel is dropped and
    /// [`ConnectionError::ShutdownTimeout`] is returned.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.shared.handshake.cancel();
        // waits for a concurrent connect() to either register its loops or give up
        let Some(Tasks { writer, reader }) = self.tasks.lock().await.take() else {
            if self.state() == ConnectionState::Disconnected {
                self.shared.set_state(ConnectionState::Closed);
            }
            return Ok(());
        };

        let writer_abort = writer.abort_handle();
        let reader_abort = reader.abort_handle();
        let shutdown_timeout = self.shared.config.shutdown_timeout;
        let both = async move {
            let _ = writer.await;
            let _ = reader.await;
        };

        if self.state() != ConnectionState::Connected {
            // the channel already failed; let the loops park unsent pushes and exit
            self.shared.terminate.cancel();
            if timeout(shutdown_timeout, both).await.is_err() {
                writer_abort.abort();
                reader_abort.abort();
            }
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Closing);
        self.shared.handlers.cancel();
        self.shared.drain.cancel();

        let result = match timeout(shutdown_timeout, both).await {
            Ok(()) => {
                debug!("Collector connection closed");
                Ok(())
            }
            Err(_) => {
                self.shared.terminate.cancel();
                writer_abort.abort();
                reader_abort.abort();
                let err = ConnectionError::ShutdownTimeout(shutdown_timeout);
                error!(error = %err, "Forcing collector connection down");
                self.shared.record_error(&err);
                Err(err)
            }
        };
        self.shared.finish();
        result
    }

    /// Pushes that were queued but never written when the channel failed.
    ///
    /// Complete once [`close`](Self::close) has returned. The push being written at
    /// the moment of failure is included and may reach the collector twice.
    pub fn take_unsent(&self) -> Vec<DataPush> {
        std::mem::take(&mut *lock(&self.shared.unsent))
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    #[must_use]
    pub fn compatibility(&self) -> Option<Compatibility> {
        self.shared.compatibility.get().cloned()
    }

    #[must_use]
    pub fn gated_features_enabled(&self) -> bool {
        self.shared
            .compatibility
            .get()
            .is_some_and(|c| c.gated_features_enabled)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            last_error: self.last_error(),
            compatibility: self.compatibility(),
            dropped_pushes: self.shared.dropped_pushes.load(Ordering::Acquire),
            pending_requests: lock(&self.shared.pending).len(),
            in_flight_handlers: self.shared.in_flight.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::to_value(self.status())
            .unwrap_or_else(|err| serde_json::json!({ "error": err.to_string() }))
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(ConnectionError::InvalidState(state)),
        }
    }

    fn outbound(&self) -> Result<mpsc::Sender<Frame>, ConnectionError> {
        self.shared
            .outbound
            .get()
            .cloned()
            .ok_or(ConnectionError::InvalidState(self.state()))
    }
}

impl Drop for StreamingConnection {
    fn drop(&mut self) {
        self.shared.handlers.cancel();
        self.shared.terminate.cancel();
        lock(&self.shared.slot).take();
    }
}

impl std::fmt::Debug for StreamingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingConnection")
            .field("agent_id", &self.shared.config.agent_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_frame<T>(
    shared: &Shared,
    sink: &mut SplitSink<Transport<T>, Bytes>,
    frame: &Frame,
) -> Result<(), ConnectionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, tag = frame.tag(), "Dropping message that failed to encode");
            return Ok(());
        }
    };
    let stall = shared.config.write_stall_timeout;
    match timeout(stall, sink.send(bytes)).await {
        Ok(result) => result.map_err(ConnectionError::Io),
        Err(_) => Err(ConnectionError::Stalled(stall)),
    }
}

async fn run_writer<T>(
    shared: Arc<Shared>,
    mut sink: SplitSink<Transport<T>, Bytes>,
    mut rx: mpsc::Receiver<Frame>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shared.terminate.cancelled() => {
                park_unsent(&shared, None, &mut rx);
                return;
            }
            _ = shared.drain.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let written = tokio::select! {
                        biased;
                        _ = shared.terminate.cancelled() => None,
                        result = write_frame(&shared, &mut sink, &frame) => Some(result),
                    };
                    match written {
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            shared.fail(err);
                            park_unsent(&shared, Some(frame), &mut rx);
                            return;
                        }
                        None => {
                            park_unsent(&shared, Some(frame), &mut rx);
                            return;
                        }
                    }
                }
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(frame) = rx.try_recv() {
        if let Err(err) = write_frame(&shared, &mut sink, &frame).await {
            shared.fail(err);
            park_unsent(&shared, Some(frame), &mut rx);
            return;
        }
    }

    let stall = shared.config.write_stall_timeout;
    match timeout(stall, sink.close()).await {
        Ok(Ok(())) => debug!("Signalled end of stream to collector"),
        Ok(Err(err)) => shared.fail(ConnectionError::Io(err)),
        Err(_) => shared.fail(ConnectionError::Stalled(stall)),
    }
}

/// Keeps the pushes of a failed channel so they can be replayed on a new one.
fn park_unsent(shared: &Shared, failed: Option<Frame>, rx: &mut mpsc::Receiver<Frame>) {
    rx.close();
    let mut unsent = lock(&shared.unsent);
    let before = unsent.len();
    unsent.extend(
        failed
            .into_iter()
            .chain(std::iter::from_fn(|| rx.try_recv().ok()))
            .filter_map(|frame| match frame {
                Frame::DataPush(data) => Some(data),
                _ => None,
            }),
    );
    if unsent.len() > before {
        debug!(count = unsent.len() - before, "Kept unsent pushes of failed channel");
    }
}

async fn run_reader<T>(
    shared: Arc<Shared>,
    mut stream: SplitStream<Transport<T>>,
    first: Option<Frame>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(frame) = first {
        shared.dispatch(frame);
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.terminate.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => shared.dispatch(frame),
                Err(CodecError::UnknownTag(tag)) => {
                    warn!(tag, "Ignoring message of unknown kind from collector");
                }
                Err(err) => match Frame::salvage_request_id(&bytes) {
                    Some(request_id) => {
                        warn!(
                            request_id,
                            error = %err,
                            "Malformed request from collector, sending empty response"
                        );
                        shared.respond_empty(request_id);
                    }
                    // without an id no response can be correlated, so the frame is dropped
                    None => warn!(error = %err, "Ignoring malformed message from collector"),
                },
            },
            Some(Err(err)) => {
                shared.fail(ConnectionError::Io(err));
                return;
            }
            None => {
                if shared.state() == ConnectionState::Connected {
                    shared.fail(ConnectionError::PeerClosed);
                } else {
                    debug!("Collector finished the stream");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::stream::handler::RequestHandler;
    use crate::stream::message::HelloAck;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tracing_test::traced_test;

    struct FakeCollector {
        transport: Transport<DuplexStream>,
    }

    impl FakeCollector {
        fn new(io: DuplexStream) -> Self {
            Self {
                transport: Framed::new(io, length_codec(1024 * 1024)),
            }
        }

        async fn recv(&mut self) -> Frame {
            let bytes = timeout(Duration::from_secs(5), self.transport.next())
                .await
                .expect("timed out waiting for agent")
                .expect("agent closed the channel")
                .expect("read failed");
            Frame::decode(&bytes).expect("undecodable frame")
        }

        async fn send(&mut self, frame: Frame) {
            self.send_raw(frame.encode().unwrap()).await;
        }

        async fn send_raw(&mut self, bytes: impl Into<Bytes>) {
            self.transport.send(bytes.into()).await.unwrap();
        }

        async fn request(&mut self, request_id: u64, kind: &str) {
            self.send(Frame::Request(Request {
                request_id,
                kind: kind.to_string(),
                payload: Vec::new(),
            }))
            .await;
        }

        async fn recv_response(&mut self) -> Response {
            match self.recv().await {
                Frame::Response(response) => response,
                other => panic!("expected response, got {other:?}"),
            }
        }

        /// Reads until the agent half-closes, then drops the channel.
        async fn drain_until_eof(mut self) {
            while let Some(Ok(_)) = self.transport.next().await {}
        }
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
            Ok(if payload.is_empty() { b"pong".to_vec() } else { payload })
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl RequestHandler for Slow {
        async fn handle(&self, _payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(b"slow".to_vec())
        }
    }

    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        async fn handle(&self, _payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
            Err(HandlerError::InvalidPayload("bad".to_string()))
        }
    }

    fn test_config() -> StreamingConfig {
        let mut config = StreamingConfig::new("web::host-1");
        config.agent_version = "1.10.2".to_string();
        config.handshake_timeout = Duration::from_millis(200);
        config.request_timeout = Duration::from_millis(200);
        config.write_stall_timeout = Duration::from_millis(500);
        config.shutdown_timeout = Duration::from_millis(500);
        config
    }

    fn test_router() -> RequestRouter {
        RequestRouter::new()
            .register("echo", Arc::new(Echo))
            .register("slow", Arc::new(Slow(Duration::from_millis(150))))
            .register("hang", Arc::new(Slow(Duration::from_secs(3600))))
            .register("failing", Arc::new(Failing))
    }

    async fn connect_with(
        config: StreamingConfig,
        collector_version: Option<&str>,
        buffer: usize,
    ) -> (StreamingConnection, FakeCollector, Hello) {
        let (agent_io, collector_io) = tokio::io::duplex(buffer);
        let connection =
            StreamingConnection::with_slot(config, test_router(), Arc::new(ConnectionSlot::new()));
        let mut collector = FakeCollector::new(collector_io);

        let accept = async {
            let Frame::Hello(hello) = collector.recv().await else {
                panic!("expected hello");
            };
            if let Some(version) = collector_version {
                collector
                    .send(Frame::HelloAck(HelloAck {
                        collector_version: version.to_string(),
                        protocol_version: PROTOCOL_VERSION,
                    }))
                    .await;
            }
            hello
        };
        let (result, hello) = tokio::join!(connection.connect(agent_io), accept);
        result.expect("connect failed");
        (connection, collector, hello)
    }

    async fn connected(collector_version: Option<&str>) -> (StreamingConnection, FakeCollector) {
        let (connection, collector, _) =
            connect_with(test_config(), collector_version, 64 * 1024).await;
        (connection, collector)
    }

    fn gauge(name: &str) -> GaugeSample {
        GaugeSample {
            name: name.to_string(),
            value: 1.0,
            capture_time_ms: 0,
        }
    }

    async fn wait_for_state(connection: &StreamingConnection, state: ConnectionState) {
        let mut rx = connection.subscribe_state();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_sends_hello_and_negotiates() {
        let (connection, _collector, hello) =
            connect_with(test_config(), Some("1.10.2"), 64 * 1024).await;
        assert_eq!(hello.agent_id, "web::host-1");
        assert_eq!(hello.agent_version, "1.10.2");
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(connection.gated_features_enabled());
        assert_eq!(
            connection.compatibility().unwrap().collector_version.as_deref(),
            Some("1.10.2")
        );
    }

    #[tokio::test]
    async fn test_older_collector_disables_gated_features() {
        let (connection, _collector) = connected(Some("1.10.1")).await;
        assert!(!connection.gated_features_enabled());
        let outcome = connection.push_logs(Vec::new()).await.unwrap();
        assert_eq!(outcome, PushOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_missing_ack_infers_legacy_collector() {
        let (connection, _collector) = connected(None).await;
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.compatibility(), Some(Compatibility::legacy()));
    }

    #[tokio::test]
    async fn test_unknown_request_kind_gets_one_empty_response() {
        let (connection, mut collector) = connected(Some("1.10.2")).await;

        collector.request(41, "heap_histogram_v9").await;
        let response = collector.recv_response().await;
        assert_eq!(response, Response::empty(41));

        // the next frame is our push, not a duplicate response
        connection.push_gauges(vec![gauge("after")]).await.unwrap();
        assert!(matches!(collector.recv().await, Frame::DataPush(DataPush::Gauges(_))));
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_registered_handler_answers_with_same_id() {
        let (_connection, mut collector) = connected(Some("1.10.2")).await;
        collector.request(7, "echo").await;
        let response = collector.recv_response().await;
        assert_eq!(response.request_id, 7);
        assert_eq!(response.payload, b"pong".to_vec());
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_other_requests() {
        let (_connection, mut collector) = connected(Some("1.10.2")).await;
        collector.request(1, "slow").await;
        collector.request(2, "echo").await;

        let first = collector.recv_response().await;
        let second = collector.recv_response().await;
        assert_eq!(first.request_id, 2);
        assert_eq!(second.request_id, 1);
        assert_eq!(second.payload, b"slow".to_vec());
    }

    #[tokio::test]
    async fn test_failing_handler_still_responds() {
        let (_connection, mut collector) = connected(Some("1.10.2")).await;
        collector.request(3, "failing").await;
        assert_eq!(collector.recv_response().await, Response::empty(3));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_message_tag_is_ignored() {
        let (connection, mut collector) = connected(Some("1.10.2")).await;
        collector.send_raw(vec![99u8, 1, 2, 3]).await;
        collector.request(5, "echo").await;
        assert_eq!(collector.recv_response().await.request_id, 5);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(logs_contain("Ignoring message of unknown kind from collector"));
    }

    #[tokio::test]
    async fn test_agent_request_round_trip() {
        let (connection, mut collector) = connected(Some("1.10.2")).await;
        let collector_side = async {
            let Frame::Request(request) = collector.recv().await else {
                panic!("expected request");
            };
            assert_eq!(request.kind, "agent_config");
            collector
                .send(Frame::Response(Response {
                    request_id: request.request_id,
                    payload: b"config".to_vec(),
                }))
                .await;
        };
        let (result, ()) = tokio::join!(
            connection.request("agent_config", Vec::new()),
            collector_side
        );
        assert_eq!(result.unwrap(), b"config".to_vec());
        assert_eq!(connection.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_agent_request_timeout_is_soft() {
        let (connection, mut collector) = connected(Some("1.10.2")).await;
        let err = connection
            .request("agent_config", Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_soft());
        assert!(matches!(
            err,
            ConnectionError::RequestTimeout { ref kind, .. } if kind == "agent_config"
        ));
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.status().pending_requests, 0);

        // a late response is discarded without harming the connection
        let Frame::Request(request) = collector.recv().await else {
            panic!("expected request");
        };
        collector
            .send(Frame::Response(Response::empty(request.request_id)))
            .await;
        collector.request(8, "echo").await;
        assert_eq!(collector.recv_response().await.request_id, 8);
    }

    #[tokio::test]
    async fn test_pushes_arrive_in_order() {
        let (connection, mut collector) = connected(Some("1.10.2")).await;
        connection
            .push_rollups(vec![RollupPayload {
                transaction_type: "Web".to_string(),
                transaction_count: 3,
                timers: Vec::new(),
                calls: Vec::new(),
            }])
            .await
            .unwrap();
        connection.push_gauges(vec![gauge("heap")]).await.unwrap();

        let Frame::DataPush(DataPush::Rollups(rollups)) = collector.recv().await else {
            panic!("expected rollups");
        };
        assert_eq!(rollups[0].transaction_count, 3);
        assert!(matches!(collector.recv().await, Frame::DataPush(DataPush::Gauges(_))));
    }

    #[tokio::test]
    async fn test_close_is_graceful_and_idempotent() {
        let (connection, collector) = connected(Some("1.10.2")).await;
        let collector_task = tokio::spawn(collector.drain_until_eof());

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.last_error().is_none());
        collector_task.await.unwrap();

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            connection.push_gauges(vec![gauge("late")]).await,
            Err(ConnectionError::InvalidState(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_handlers() {
        let (connection, mut collector) = connected(Some("1.10.2")).await;
        collector.request(11, "hang").await;
        timeout(Duration::from_secs(5), async {
            while connection.status().in_flight_handlers == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let collector_task = tokio::spawn(collector.drain_until_eof());
        connection.close().await.unwrap();
        collector_task.await.unwrap();
        timeout(Duration::from_secs(5), async {
            while connection.status().in_flight_handlers != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_times_out_when_collector_never_finishes() {
        let (connection, _collector) = connected(Some("1.10.2")).await;
        let err = connection.close().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ShutdownTimeout(_)));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.last_error().unwrap().contains("graceful shutdown"));
    }

    #[tokio::test]
    async fn test_peer_close_fails_connection() {
        let (connection, collector) = connected(Some("1.10.2")).await;
        drop(collector);
        wait_for_state(&connection, ConnectionState::Closed).await;
        assert_eq!(
            connection.last_error().as_deref(),
            Some("collector closed the channel")
        );
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_connection_is_rejected_while_connected() {
        let slot = Arc::new(ConnectionSlot::new());
        let (agent_io, collector_io) = tokio::io::duplex(64 * 1024);
        let first =
            StreamingConnection::with_slot(test_config(), test_router(), Arc::clone(&slot));
        let mut collector = FakeCollector::new(collector_io);
        let (result, _) = tokio::join!(first.connect(agent_io), collector.recv());
        result.unwrap();

        let (other_io, _other_collector) = tokio::io::duplex(1024);
        let second =
            StreamingConnection::with_slot(test_config(), test_router(), Arc::clone(&slot));
        assert!(matches!(
            second.connect(other_io).await,
            Err(ConnectionError::AlreadyConnected)
        ));
        assert!(matches!(
            first.connect(tokio::io::duplex(16).0).await,
            Err(ConnectionError::InvalidState(ConnectionState::Connected))
        ));

        let collector_task = tokio::spawn(collector.drain_until_eof());
        first.close().await.unwrap();
        collector_task.await.unwrap();
        assert!(!slot.is_occupied());
    }

    #[tokio::test]
    async fn test_drop_policy_bounds_the_queue() {
        let mut config = test_config();
        config.overflow_policy = OverflowPolicy::DropNewest;
        config.outbound_queue_capacity = 1;
        config.write_stall_timeout = Duration::from_secs(5);
        // the collector stops reading after the handshake, so the writer backs up
        let (connection, _collector, _) = connect_with(config, Some("1.10.2"), 256).await;

        let big = "x".repeat(4096);
        let mut dropped = 0;
        for _ in 0..10 {
            if connection.push_gauges(vec![gauge(&big)]).await.unwrap() == PushOutcome::Dropped {
                dropped += 1;
            }
        }
        assert!(dropped > 0);
        assert_eq!(connection.status().dropped_pushes, dropped);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stalled_channel_fails_connection() {
        let mut config = test_config();
        config.outbound_queue_capacity = 1;
        config.write_stall_timeout = Duration::from_millis(100);
        let (connection, _collector, _) = connect_with(config, Some("1.10.2"), 256).await;

        let big = "x".repeat(4096);
        let mut failure = None;
        for _ in 0..10 {
            if let Err(err) = connection.push_gauges(vec![gauge(&big)]).await {
                failure = Some(err);
                break;
            }
        }
        assert!(matches!(
            failure,
            Some(ConnectionError::Stalled(_))
                | Some(ConnectionError::Closed)
                | Some(ConnectionError::InvalidState(ConnectionState::Closed))
        ));
        wait_for_state(&connection, ConnectionState::Closed).await;
        assert!(connection.last_error().unwrap().contains("stalled"));

        // the frame stuck in the write and the queued one are kept for a new channel
        connection.close().await.unwrap();
        let unsent = connection.take_unsent();
        assert!(!unsent.is_empty());
        assert!(unsent.iter().all(|data| matches!(data, DataPush::Gauges(_))));
        assert!(connection.take_unsent().is_empty());
    }

    #[tokio::test]
    async fn test_status_json() {
        let (connection, _collector) = connected(Some("1.10.1")).await;
        let json = connection.status_json();
        assert_eq!(json["state"], "CONNECTED");
        assert_eq!(json["compatibility"]["collector_version"], "1.10.1");
        assert_eq!(json["compatibility"]["gated_features_enabled"], false);
        assert_eq!(json["dropped_pushes"], 0);
    }

    #[tokio::test]
    async fn test_handshake_failure_releases_slot() {
        let slot = Arc::new(ConnectionSlot::new());
        let (agent_io, collector_io) = tokio::io::duplex(64 * 1024);
        let connection =
            StreamingConnection::with_slot(test_config(), test_router(), Arc::clone(&slot));
        let mut collector = FakeCollector::new(collector_io);
        let refuse = async move {
            collector.recv().await;
            drop(collector);
        };
        let (result, ()) = tokio::join!(connection.connect(agent_io), refuse);
        assert!(matches!(result, Err(ConnectionError::ClosedDuringHandshake)));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!slot.is_occupied());
    }

    #[tokio::test]
    async fn test_close_during_handshake_aborts_it() {
        let slot = Arc::new(ConnectionSlot::new());
        let (agent_io, collector_io) = tokio::io::duplex(64 * 1024);
        let mut config = test_config();
        config.handshake_timeout = Duration::from_secs(5);
        let connection = StreamingConnection::with_slot(config, test_router(), Arc::clone(&slot));
        let mut collector = FakeCollector::new(collector_io);

        let late_ack = async move {
            collector.recv().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let ack = Frame::HelloAck(HelloAck {
                collector_version: "1.10.2".to_string(),
                protocol_version: PROTOCOL_VERSION,
            });
            // the agent has already hung up
            let _ = collector.transport.send(ack.encode().unwrap()).await;
        };
        let closer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(connection.state(), ConnectionState::Handshaking);
            connection.close().await
        };
        let (result, closed, ()) = tokio::join!(connection.connect(agent_io), closer, late_ack);

        assert!(matches!(result, Err(ConnectionError::Closed)));
        closed.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.last_error().is_none());
        assert!(!slot.is_occupied());
        assert!(matches!(
            connection.push_gauges(vec![gauge("late")]).await,
            Err(ConnectionError::InvalidState(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_request_gets_empty_response() {
        #[derive(serde::Serialize)]
        struct BadRequest {
            request_id: u64,
            kind: u32,
        }

        let (connection, mut collector) = connected(Some("1.10.2")).await;
        let request_tag = Frame::Request(Request {
            request_id: 0,
            kind: String::new(),
            payload: Vec::new(),
        })
        .tag();

        let mut bytes = vec![request_tag];
        bytes.extend(
            rmp_serde::to_vec_named(&BadRequest {
                request_id: 9,
                kind: 42,
            })
            .unwrap(),
        );
        collector.send_raw(bytes).await;
        assert_eq!(collector.recv_response().await, Response::empty(9));
        assert!(logs_contain("Malformed request from collector"));

        // no readable id: nothing to answer, the channel carries on
        collector.send_raw(vec![request_tag, 0xc1]).await;
        collector.request(10, "echo").await;
        assert_eq!(collector.recv_response().await.request_id, 10);
        assert!(logs_contain("Ignoring malformed message from collector"));
        assert_eq!(connection.state(), ConnectionState::Connected);
    }
}
