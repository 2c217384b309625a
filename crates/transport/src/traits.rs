//! The transport contract: one resilient channel between widget and
//! backend, plus the event sink it reports through.

use std::sync::Arc;

use {async_trait::async_trait, bytes::Bytes, serde_json::Value};

use wicket_protocol::{
    ChatMessage, SendReply, SendRequest, TelemetryEvent, TransportKind, TransportState,
};

use crate::{
    error::{Error, Result},
    options::TransportOptions,
    polling::PollingTransport,
    socket::SocketTransport,
};

/// Inbound payload delivered to [`TransportEvents::on_message`].
#[derive(Debug, Clone)]
pub enum InboundPayload {
    /// A full message batch, fetched by a poll or pushed as a list.
    Batch(Vec<ChatMessage>),
    /// A single message, synthesized from a duplex reply frame.
    Single(ChatMessage),
    /// An unrecognized inbound value, forwarded unchanged.
    Raw(Value),
}

impl InboundPayload {
    /// Flatten to a batch; raw payloads flatten to empty.
    #[must_use]
    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Self::Batch(messages) => messages,
            Self::Single(message) => vec![message],
            Self::Raw(_) => Vec::new(),
        }
    }
}

/// Receives transport lifecycle notifications.
///
/// Installed wholesale through [`ChatTransport::set_event_sink`]; there is
/// no partial registration. Every hook defaults to a no-op so sinks
/// implement only what they care about.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    /// The channel reached its open state.
    async fn on_open(&self) {}

    /// The channel closed, by request or otherwise.
    async fn on_close(&self, _reason: Option<&str>) {}

    /// A request or connection attempt failed.
    async fn on_error(&self, _error: &Error) {}

    /// Inbound data arrived.
    async fn on_message(&self, _payload: InboundPayload) {}

    /// Diagnostic breadcrumb from inside the transport.
    async fn on_telemetry(&self, _event: TelemetryEvent) {}
}

struct NoopEvents;

#[async_trait]
impl TransportEvents for NoopEvents {}

/// Sink installed until the host provides one.
pub(crate) fn noop_sink() -> Arc<dyn TransportEvents> {
    Arc::new(NoopEvents)
}

/// File handed to [`ChatTransport::send_file`].
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub name: String,
    pub bytes: Bytes,
    /// MIME type; treated as `application/octet-stream` when absent.
    pub mime: Option<String>,
}

impl FilePayload {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { name: name.into(), bytes: bytes.into(), mime: None }
    }

    #[must_use]
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// One resilient channel between the widget and the backend.
///
/// [`PollingTransport`] implements it over repeated HTTP requests and
/// [`SocketTransport`] over a persistent duplex socket; hosts may install
/// any other implementation behind the same contract.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Replace the event sink. Full replacement, never a merge.
    fn set_event_sink(&self, sink: Arc<dyn TransportEvents>);

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Begin connecting. A no-op while already connecting or open. Fails
    /// only when no implementation is available; transient trouble
    /// surfaces through [`TransportEvents`] and the retry machinery.
    async fn connect(&self) -> Result<()>;

    /// Stop the channel. Idempotent; always lands in the closed state and
    /// always notifies the sink.
    async fn disconnect(&self, reason: Option<&str>);

    /// Send one chat request. `Ok(None)` means the channel accepted the
    /// request without producing a synchronous reply.
    async fn send(&self, request: SendRequest) -> Result<Option<SendReply>>;

    /// Upload a file. Optional; the default refuses.
    async fn send_file(
        &self,
        _file: FilePayload,
        _metadata: Option<Value>,
    ) -> Result<Option<ChatMessage>> {
        Err(Error::unsupported("file upload"))
    }
}

/// Build one of the built-in transports for `kind`.
#[must_use]
pub fn build_transport(kind: TransportKind, options: TransportOptions) -> Arc<dyn ChatTransport> {
    match kind {
        TransportKind::Polling => Arc::new(PollingTransport::new(options)),
        TransportKind::Socket => Arc::new(SocketTransport::new(options)),
    }
}
