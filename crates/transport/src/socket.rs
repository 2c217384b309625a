//! Duplex socket transport.
//!
//! Keeps one persistent connection per session, with a heartbeat while
//! open, jittered reconnect when the far end drops, and a FIFO queue for
//! envelopes produced while the socket is anything but open.
//!
//! The concrete socket implementation is resolved exactly once, at
//! construction: an emit-style client factory wins over an explicit
//! connector override, which wins over the built-in implementation behind
//! the `native-socket` feature. When none of the three is present the
//! transport exists but every `connect` fails.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    base64::Engine as _,
    bytes::Bytes,
    serde_json::Value,
    tokio::{sync::mpsc, time::sleep},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use wicket_protocol::{
    ChatMessage, ClientFrame, SOCKET_RETRY_BASE_MS, SOCKET_RETRY_MAX_MS, SendReply, SendRequest,
    ServerFrame, TelemetryEvent, TransportState, telemetry_events,
};

use crate::{
    backoff::compute_backoff,
    error::{Error, Result},
    options::TransportOptions,
    traits::{ChatTransport, FilePayload, InboundPayload, TransportEvents, noop_sink},
};

// ── Session plumbing ─────────────────────────────────────────────────────────

/// Outbound traffic for a frame-oriented session.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Send half of a frame-oriented session. Cheap to clone; all clones feed
/// the same writer.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl FrameSender {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self { tx }
    }

    /// False when the session's write half is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(OutboundFrame::Text(text)).is_ok()
    }

    pub fn send_binary(&self, bytes: Bytes) -> bool {
        self.tx.send(OutboundFrame::Binary(bytes)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

/// Inbound notifications from a live session. `Closed` and `Error` are
/// terminal; nothing after them is processed.
#[derive(Debug)]
pub enum SocketEvent {
    /// The session reached its open state. Emit-style sessions never
    /// report it.
    Opened,
    /// One inbound text frame.
    Frame(String),
    Closed { reason: Option<String> },
    Error { message: String },
}

/// A live session, tagged by capability when the connector resolves it.
#[derive(Clone)]
pub enum SocketHandle {
    /// Full-duplex frame socket: reports open and flushes the queue.
    Frames(FrameSender),
    /// Emit-style client: sends bypass the open state entirely.
    Emitter(Arc<dyn EmitterSocket>),
}

/// Opens one session and feeds its lifecycle through `events`.
///
/// Implemented by the built-in native connector and by test or host
/// overrides installed via [`SocketTransport::with_connector`].
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<SocketHandle>;
}

/// Emit-style socket client, the shape adapter shims expose.
#[async_trait]
pub trait EmitterSocket: Send + Sync {
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;
    async fn close(&self);
}

/// Produces emit-style clients; highest priority in implementation
/// resolution.
#[async_trait]
pub trait EmitterFactory: Send + Sync {
    async fn open(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<Arc<dyn EmitterSocket>>;
}

enum SocketImpl {
    Emitter(Arc<dyn EmitterFactory>),
    Custom(Arc<dyn SocketConnector>),
    #[cfg(feature = "native-socket")]
    Native,
}

fn resolve_impl(
    emitter: Option<Arc<dyn EmitterFactory>>,
    connector: Option<Arc<dyn SocketConnector>>,
) -> Option<SocketImpl> {
    emitter
        .map(SocketImpl::Emitter)
        .or(connector.map(SocketImpl::Custom))
        .or(native_impl())
}

#[cfg(feature = "native-socket")]
fn native_impl() -> Option<SocketImpl> {
    Some(SocketImpl::Native)
}

#[cfg(not(feature = "native-socket"))]
fn native_impl() -> Option<SocketImpl> {
    None
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Duplex socket transport.
pub struct SocketTransport {
    shared: Arc<Shared>,
}

struct Shared {
    options: TransportOptions,
    /// Capability resolved once at construction; `None` means every
    /// connect is refused.
    resolved: Option<SocketImpl>,
    state: Mutex<TransportState>,
    sink: RwLock<Arc<dyn TransportEvents>>,
    /// Suppresses reconnects after a user-initiated disconnect.
    closed_by_user: AtomicBool,
    /// Reconnect schedulings since the last successful open.
    reconnect_attempt: AtomicU32,
    /// Bumped on every connect and disconnect. A session carries the value
    /// current at its spawn; once the values diverge the session is
    /// superseded and its remaining events are dropped.
    generation: AtomicU64,
    /// Envelopes produced while the socket was not open.
    queue: Mutex<VecDeque<ClientFrame>>,
    session: Mutex<Option<SocketHandle>>,
    /// Cancels per-connection helpers, currently the heartbeat.
    conn_cancel: Mutex<CancellationToken>,
}

impl SocketTransport {
    /// Built-in resolution: the native implementation when compiled in.
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self::with_impls(options, None, None)
    }

    /// Route all sessions through an emit-style client factory.
    #[must_use]
    pub fn with_emitter(options: TransportOptions, factory: Arc<dyn EmitterFactory>) -> Self {
        Self::with_impls(options, Some(factory), None)
    }

    /// Explicit connector override.
    #[must_use]
    pub fn with_connector(options: TransportOptions, connector: Arc<dyn SocketConnector>) -> Self {
        Self::with_impls(options, None, Some(connector))
    }

    fn with_impls(
        options: TransportOptions,
        emitter: Option<Arc<dyn EmitterFactory>>,
        connector: Option<Arc<dyn SocketConnector>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                resolved: resolve_impl(emitter, connector),
                state: Mutex::new(TransportState::Idle),
                sink: RwLock::new(noop_sink()),
                closed_by_user: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
                session: Mutex::new(None),
                conn_cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shared.closed_by_user.store(true, Ordering::SeqCst);
        self.shared.next_generation();
        self.shared.cancel_conn_tasks();
        if let Some(SocketHandle::Frames(sender)) = self.shared.take_session() {
            sender.close();
        }
    }
}

impl Shared {
    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: TransportState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn sink(&self) -> Arc<dyn TransportEvents> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn session_handle(&self) -> Option<SocketHandle> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install_session(&self, handle: SocketHandle) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn take_session(&self) -> Option<SocketHandle> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Invalidate every live session and return the tag for the next one.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn push_queued(&self, frame: ClientFrame) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(frame);
    }

    fn pop_queued(&self) -> Option<ClientFrame> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn requeue_front(&self, frame: ClientFrame) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_front(frame);
    }

    fn reset_conn_cancel(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.conn_cancel.lock().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        fresh
    }

    fn cancel_conn_tasks(&self) {
        self.conn_cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    /// Open frame sessions take the envelope immediately, emit-style
    /// sessions route through `emit`, anything else queues it.
    async fn send_or_queue(&self, frame: ClientFrame) -> Result<()> {
        match self.session_handle() {
            Some(SocketHandle::Frames(sender)) if self.state() == TransportState::Open => {
                let text = serde_json::to_string(&frame)?;
                if !sender.send_text(text) {
                    // Write half vanished under us; keep the envelope.
                    self.push_queued(frame);
                }
                Ok(())
            }
            Some(SocketHandle::Emitter(socket)) => {
                let (event, payload) = emit_parts(&frame)?;
                socket.emit(event, payload).await
            }
            _ => {
                self.push_queued(frame);
                Ok(())
            }
        }
    }
}

fn emit_parts(frame: &ClientFrame) -> Result<(&'static str, Value)> {
    let event = match frame {
        ClientFrame::Message { .. } => "message",
        ClientFrame::File { .. } => "file",
        ClientFrame::Ping { .. } => "ping",
    };
    Ok((event, serde_json::to_value(frame)?))
}

#[async_trait]
impl ChatTransport for SocketTransport {
    fn set_event_sink(&self, sink: Arc<dyn TransportEvents>) {
        *self.shared.sink.write().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    async fn connect(&self) -> Result<()> {
        start_connect(&self.shared).await
    }

    async fn disconnect(&self, reason: Option<&str>) {
        let shared = &self.shared;
        shared.closed_by_user.store(true, Ordering::SeqCst);
        shared.next_generation();
        shared.cancel_conn_tasks();
        if let Some(handle) = shared.take_session() {
            close_handle(&handle).await;
        }
        shared.set_state(TransportState::Closed);
        debug!(reason = ?reason, "socket: disconnected");
        shared.sink().on_close(reason).await;
    }

    async fn send(&self, request: SendRequest) -> Result<Option<SendReply>> {
        self.shared.send_or_queue(ClientFrame::message(request)).await?;
        // Replies come back asynchronously through the event sink.
        Ok(None)
    }

    async fn send_file(
        &self,
        file: FilePayload,
        metadata: Option<Value>,
    ) -> Result<Option<ChatMessage>> {
        let shared = &self.shared;
        let header = ClientFrame::file(
            shared.options.session_id.clone(),
            file.name.clone(),
            file.size(),
            metadata,
        );
        match shared.session_handle() {
            Some(SocketHandle::Frames(sender)) if shared.state() == TransportState::Open => {
                let text = serde_json::to_string(&header)?;
                // Header first, raw bytes right behind it.
                if sender.send_text(text) {
                    sender.send_binary(file.bytes.clone());
                }
                Ok(None)
            }
            Some(SocketHandle::Emitter(socket)) => {
                let mut frame = header;
                if let ClientFrame::File { data, .. } = &mut frame {
                    *data = Some(base64::engine::general_purpose::STANDARD.encode(&file.bytes));
                }
                let (event, payload) = emit_parts(&frame)?;
                socket.emit(event, payload).await?;
                Ok(None)
            }
            _ => {
                warn!(name = %file.name, "socket: not open, queueing file header without bytes");
                shared.push_queued(header);
                Ok(None)
            }
        }
    }
}

async fn close_handle(handle: &SocketHandle) {
    match handle {
        SocketHandle::Frames(sender) => sender.close(),
        SocketHandle::Emitter(socket) => socket.close().await,
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────────────

async fn start_connect(shared: &Arc<Shared>) -> Result<()> {
    if shared.state().is_active() {
        return Ok(());
    }
    if shared.resolved.is_none() {
        let error = Error::unavailable("no socket implementation available");
        shared.set_state(TransportState::Error);
        shared.sink().on_error(&error).await;
        return Err(error);
    }
    shared.closed_by_user.store(false, Ordering::SeqCst);
    shared.set_state(TransportState::Connecting);
    let url = match shared.options.socket_endpoint() {
        Ok(url) => url.to_string(),
        Err(error) => {
            shared.set_state(TransportState::Error);
            shared.sink().on_error(&error).await;
            return Err(error);
        }
    };
    let generation = shared.next_generation();
    debug!(url = %url, generation, "socket: connecting");
    tokio::spawn(run_session(shared.clone(), url, generation));
    Ok(())
}

async fn run_session(shared: Arc<Shared>, url: String, generation: u64) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connected = match &shared.resolved {
        Some(SocketImpl::Emitter(factory)) => {
            factory.open(&url, event_tx).await.map(SocketHandle::Emitter)
        }
        Some(SocketImpl::Custom(connector)) => connector.connect(&url, event_tx).await,
        #[cfg(feature = "native-socket")]
        Some(SocketImpl::Native) => native::connect(&url, event_tx).await,
        None => return,
    };
    match connected {
        Ok(handle) => {
            if !shared.is_current(generation) {
                // A disconnect or a newer connect superseded this session
                // while the handshake was in flight.
                close_handle(&handle).await;
                return;
            }
            shared.install_session(handle);
            pump_events(shared, event_rx, generation).await;
        }
        Err(error) => {
            if !shared.is_current(generation) {
                return;
            }
            shared.set_state(TransportState::Error);
            shared.sink().on_error(&error).await;
            schedule_reconnect(&shared).await;
        }
    }
}

async fn pump_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if !shared.is_current(generation) {
            debug!(generation, "socket: dropping event from a superseded session");
            return;
        }
        match event {
            SocketEvent::Opened => on_session_open(&shared).await,
            SocketEvent::Frame(text) => on_inbound_frame(&shared, &text).await,
            SocketEvent::Closed { reason } => {
                on_session_closed(&shared, reason).await;
                return;
            }
            SocketEvent::Error { message } => {
                on_session_error(&shared, message).await;
                return;
            }
        }
    }
    // Event channel dropped without a close frame; treat as one.
    if shared.is_current(generation) {
        on_session_closed(&shared, None).await;
    }
}

async fn on_session_open(shared: &Arc<Shared>) {
    shared.set_state(TransportState::Open);
    shared.reconnect_attempt.store(0, Ordering::Relaxed);
    info!(session_id = %shared.options.session_id, "socket: open");
    shared.sink().on_open().await;
    flush_queue(shared).await;
    start_heartbeat(shared);
}

async fn on_inbound_frame(shared: &Arc<Shared>, text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Batch(messages)) => {
            shared.sink().on_message(InboundPayload::Batch(messages)).await;
        }
        Ok(ServerFrame::Reply(frame)) => {
            let message = ChatMessage::bot(frame.reply);
            shared.sink().on_message(InboundPayload::Single(message)).await;
        }
        Ok(ServerFrame::Raw(value)) => {
            shared.sink().on_message(InboundPayload::Raw(value)).await;
        }
        Err(error) => {
            shared.sink().on_error(&Error::Json(error)).await;
        }
    }
}

async fn on_session_closed(shared: &Arc<Shared>, reason: Option<String>) {
    shared.take_session();
    shared.cancel_conn_tasks();
    shared.set_state(TransportState::Closed);
    debug!(reason = ?reason, "socket: session closed");
    shared.sink().on_close(reason.as_deref()).await;
    schedule_reconnect(shared).await;
}

async fn on_session_error(shared: &Arc<Shared>, message: String) {
    shared.take_session();
    shared.cancel_conn_tasks();
    shared.set_state(TransportState::Error);
    let error = Error::connection(message);
    shared.sink().on_error(&error).await;
    schedule_reconnect(shared).await;
}

/// Queue a delayed reconnect unless the user asked for the close. The
/// attempt counter moves only here and resets on open.
async fn schedule_reconnect(shared: &Arc<Shared>) {
    if shared.closed_by_user.load(Ordering::SeqCst) {
        return;
    }
    let attempt = shared.reconnect_attempt.fetch_add(1, Ordering::Relaxed);
    let delay = compute_backoff(attempt, SOCKET_RETRY_BASE_MS, SOCKET_RETRY_MAX_MS);
    debug!(
        attempt = attempt + 1,
        delay_ms = delay.as_millis() as u64,
        "socket: reconnect scheduled"
    );
    shared
        .sink()
        .on_telemetry(
            TelemetryEvent::new(telemetry_events::SOCKET_RECONNECT_SCHEDULED).with_detail(
                serde_json::json!({
                    "attempt": attempt + 1,
                    "delayMs": delay.as_millis() as u64,
                }),
            ),
        )
        .await;
    let shared = shared.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        if shared.closed_by_user.load(Ordering::SeqCst) {
            return;
        }
        respawn_connect(shared).await;
    });
}

/// Reconnect-timer entry back into `start_connect`, boxed so the
/// connect/session/reconnect call cycle bottoms out in one concrete
/// future type.
fn respawn_connect(shared: Arc<Shared>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = start_connect(&shared).await;
    })
}

// ── Queue flush ──────────────────────────────────────────────────────────────

/// Drain queued envelopes strictly FIFO. Stops at the first refusal; the
/// refused envelope and everything behind it wait for the next open.
async fn flush_queue(shared: &Arc<Shared>) {
    loop {
        if shared.state() != TransportState::Open {
            return;
        }
        let Some(frame) = shared.pop_queued() else { return };
        let delivered = match shared.session_handle() {
            Some(SocketHandle::Frames(sender)) => match serde_json::to_string(&frame) {
                Ok(text) => sender.send_text(text),
                Err(error) => {
                    warn!(error = %error, "socket: dropping unserializable queued frame");
                    continue;
                }
            },
            Some(SocketHandle::Emitter(socket)) => match emit_parts(&frame) {
                Ok((event, payload)) => socket.emit(event, payload).await.is_ok(),
                Err(error) => {
                    warn!(error = %error, "socket: dropping unserializable queued frame");
                    continue;
                }
            },
            None => false,
        };
        if !delivered {
            shared.requeue_front(frame);
            return;
        }
    }
}

// ── Heartbeat ────────────────────────────────────────────────────────────────

fn start_heartbeat(shared: &Arc<Shared>) {
    let interval_ms = shared.options.heartbeat_interval_ms;
    if interval_ms == 0 {
        return;
    }
    let cancel = shared.reset_conn_cancel();
    let shared = shared.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if shared.state() != TransportState::Open {
                        continue;
                    }
                    if let Some(SocketHandle::Frames(sender)) = shared.session_handle()
                        && let Ok(text) = serde_json::to_string(&ClientFrame::ping())
                    {
                        let _ = sender.send_text(text);
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

// ── Native implementation ────────────────────────────────────────────────────

#[cfg(feature = "native-socket")]
mod native {
    use {
        futures::{SinkExt, StreamExt},
        tokio::sync::mpsc,
        tokio_tungstenite::{connect_async, tungstenite::Message},
    };

    use super::{FrameSender, OutboundFrame, SocketEvent, SocketHandle};
    use crate::error::{Error, Result};

    /// Open a native socket and bridge it onto the transport's channels.
    pub(super) async fn connect(
        url: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<SocketHandle> {
        let (stream, _) = connect_async(url).await.map_err(Error::connection)?;
        let (mut ws_writer, mut ws_reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

        // Writer half: drains outbound frames into the socket.
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text.into()),
                    OutboundFrame::Binary(bytes) => Message::Binary(bytes),
                    OutboundFrame::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                };
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        // A finished handshake is the native open signal. Sent before the
        // reader exists, so it precedes every forwarded frame.
        let _ = events.send(SocketEvent::Opened);

        // Reader half: forwards inbound frames until the socket ends.
        tokio::spawn(async move {
            while let Some(next) = ws_reader.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        if events.send(SocketEvent::Frame(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                        let _ = events.send(SocketEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        let _ = events.send(SocketEvent::Error { message: error.to_string() });
                        return;
                    }
                }
            }
            let _ = events.send(SocketEvent::Closed { reason: None });
        });

        Ok(SocketHandle::Frames(FrameSender::new(tx)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
