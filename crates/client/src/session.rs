//! One chat session: a transport, its plugin pipeline, and an event stream.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::sync::broadcast,
    tracing::{debug, info},
};

use {
    wicket_plugins::{ConnectionEvent, ContextUpdate, PluginContext, PluginRunner, WidgetPlugin},
    wicket_protocol::{
        ChatMessage, SendReply, SendRequest, TelemetryEvent, TransportKind, TransportState,
    },
    wicket_transport::{
        ChatTransport, Error, FilePayload, InboundPayload, TransportEvents, TransportOptions,
        build_transport,
    },
};

// ── Events ───────────────────────────────────────────────────────────────────

/// What a session broadcasts to its subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The transport reached its open state.
    Connected,
    /// The transport closed.
    Disconnected { reason: Option<String> },
    /// Inbound messages, already run through the plugin transforms. Never
    /// empty.
    Batch(Vec<ChatMessage>),
    /// Inbound data that did not parse as messages, forwarded untouched.
    Raw(Value),
    /// A transport-level failure. The transport keeps retrying on its own;
    /// this is informational.
    Failed { message: String },
    /// Diagnostic breadcrumb from inside the transport.
    Telemetry(TelemetryEvent),
}

/// Bridges transport notifications into the plugin runner and the
/// subscriber channel.
struct SessionSink {
    runner: Arc<PluginRunner>,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl TransportEvents for SessionSink {
    async fn on_open(&self) {
        self.runner
            .notify_connection(&ConnectionEvent::new(TransportState::Open))
            .await;
        let _ = self.events.send(SessionEvent::Connected);
    }

    async fn on_close(&self, reason: Option<&str>) {
        let mut event = ConnectionEvent::new(TransportState::Closed);
        if let Some(reason) = reason {
            event = event.with_detail(reason);
        }
        self.runner.notify_connection(&event).await;
        let _ = self
            .events
            .send(SessionEvent::Disconnected { reason: reason.map(str::to_string) });
    }

    async fn on_error(&self, error: &Error) {
        self.runner
            .notify_connection(
                &ConnectionEvent::new(TransportState::Error).with_detail(error.to_string()),
            )
            .await;
        let _ = self.events.send(SessionEvent::Failed { message: error.to_string() });
    }

    async fn on_message(&self, payload: InboundPayload) {
        match payload {
            InboundPayload::Raw(value) => {
                let _ = self.events.send(SessionEvent::Raw(value));
            }
            other => {
                let messages = other.into_messages();
                // Quiet poll rounds deliver empty lists; nothing to do.
                if messages.is_empty() {
                    return;
                }
                let processed = self.runner.process_messages(&messages).await;
                if processed.is_empty() {
                    debug!("plugins filtered out the whole inbound batch");
                    return;
                }
                let _ = self.events.send(SessionEvent::Batch(processed));
            }
        }
    }

    async fn on_telemetry(&self, event: TelemetryEvent) {
        self.runner.notify_telemetry(&event).await;
        let _ = self.events.send(SessionEvent::Telemetry(event));
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// A live conversation bound to one transport and one plugin set.
///
/// The session owns the glue: transport events feed the plugins and the
/// subscriber channel, outbound sends run through the plugin pipeline, and
/// widget lifecycle moments fan out as hooks.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    runner: Arc<PluginRunner>,
    events: broadcast::Sender<SessionEvent>,
    started: AtomicBool,
}

impl ChatSession {
    /// Session over one of the built-in transports.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        options: TransportOptions,
        plugins: Vec<Arc<dyn WidgetPlugin>>,
    ) -> Self {
        let mut context =
            PluginContext::new(options.api_url.as_str(), options.session_id.as_str(), kind);
        context.user_identifier = options.user_identifier.clone();
        Self::with_transport(build_transport(kind, options), context, plugins)
    }

    /// Session over any transport implementation. The sink is installed
    /// here, before the first connect can race an event past it.
    #[must_use]
    pub fn with_transport(
        transport: Arc<dyn ChatTransport>,
        context: PluginContext,
        plugins: Vec<Arc<dyn WidgetPlugin>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let runner = Arc::new(PluginRunner::new(plugins, context));
        transport.set_event_sink(Arc::new(SessionSink {
            runner: runner.clone(),
            events: events.clone(),
        }));
        Self { transport, runner, events, started: AtomicBool::new(false) }
    }

    /// Subscribe to session events. Slow consumers may observe lag, never
    /// blockage.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current context snapshot as the plugins see it.
    #[must_use]
    pub fn context(&self) -> PluginContext {
        self.runner.context()
    }

    /// Layer a partial update over the plugin context.
    pub fn update_context(&self, update: ContextUpdate) {
        self.runner.update_context(update);
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    /// Boot the session and begin connecting. Init and mount hooks run on
    /// the first call only; later calls just re-enter the connect path.
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.runner.context().session_id, "session starting");
            self.runner.notify_init().await;
            self.runner.notify_mount().await;
        }
        self.transport.connect().await?;
        Ok(())
    }

    /// Send a text message authored by the current user.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
    ) -> anyhow::Result<Option<SendReply>> {
        let cx = self.runner.context();
        let mut request = SendRequest::new(cx.session_id, text);
        if let Some(user) = cx.user_identifier {
            request = request.with_user(user);
        }
        self.send_request(request).await
    }

    /// Send a prebuilt request through the plugin pipeline and the
    /// transport.
    pub async fn send_request(
        &self,
        request: SendRequest,
    ) -> anyhow::Result<Option<SendReply>> {
        let transport = self.transport.clone();
        self.runner
            .send(request, move |payload| {
                let transport = transport.clone();
                async move { transport.send(payload).await.map_err(anyhow::Error::from) }
            })
            .await
    }

    /// Upload a file over the transport. Bypasses the plugin send pipeline;
    /// the resulting message comes back to the caller and the backend echoes
    /// it into the inbound flow.
    pub async fn send_file(
        &self,
        file: FilePayload,
        metadata: Option<Value>,
    ) -> anyhow::Result<Option<ChatMessage>> {
        let message = self.transport.send_file(file, metadata).await?;
        Ok(message)
    }

    /// Record the widget surface opening or closing and notify plugins.
    pub async fn set_widget_open(&self, open: bool) {
        self.runner.update_context(ContextUpdate::default().open(open));
        if open {
            self.runner.notify_widget_open().await;
        } else {
            self.runner.notify_widget_close().await;
        }
    }

    /// Tear the session down: close the transport, then let plugins
    /// unmount. A later [`start`](Self::start) boots a fresh lifecycle.
    pub async fn shutdown(&self, reason: Option<&str>) {
        info!(reason = ?reason, "session shutting down");
        self.transport.disconnect(reason).await;
        self.runner.notify_unmount().await;
        self.started.store(false, Ordering::SeqCst);
    }
}
