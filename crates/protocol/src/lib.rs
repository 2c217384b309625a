//! Chat widget wire contract.
//!
//! Shared vocabulary for the transports and the plugin pipeline. All
//! payloads are JSON with camelCase field names on the wire.
//!
//! Duplex frame types:
//! - `ClientFrame`: widget-to-backend envelope (message, file, or ping)
//! - `ServerFrame`: backend-to-widget payload (batch, reply, or raw)

use {
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
pub const POLL_RETRY_BASE_MS: u64 = 1_000;
pub const POLL_RETRY_MAX_MS: u64 = 30_000;
pub const SOCKET_RETRY_BASE_MS: u64 = 500;
pub const SOCKET_RETRY_MAX_MS: u64 = 15_000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000; // 30s
/// Retries allowed beyond the first dispatch attempt of an outbound send.
pub const SEND_RETRY_LIMIT: u32 = 2;

// ── Telemetry event names ────────────────────────────────────────────────────

pub mod telemetry_events {
    pub const POLLING_CONNECT: &str = "polling_connect";
    pub const POLLING_TICK: &str = "polling_tick";
    pub const POLLING_RETRY_SCHEDULED: &str = "polling_retry_scheduled";
    pub const SOCKET_RECONNECT_SCHEDULED: &str = "socket_reconnect_scheduled";
    pub const UPLOAD_RESPONSE_UNPARSED: &str = "upload_response_unparsed";
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }
}

/// A single chat message as displayed in the conversation.
///
/// Immutable once placed in history; copy to mutate. Inbound parsing is
/// lenient: `text` and `createdAt` default to empty when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique, sender-prefixed: `user-<uuid>` or `bot-<uuid>`.
    pub id: String,
    pub sender: Sender,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Rich-content discriminator, opaque to this layer.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ChatMessage {
    /// New user-authored message with a fresh sender-prefixed id.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::fresh(Sender::User, text)
    }

    /// New bot-authored message with a fresh sender-prefixed id.
    #[must_use]
    pub fn bot(text: impl Into<String>) -> Self {
        Self::fresh(Sender::Bot, text)
    }

    fn fresh(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", sender.prefix(), Uuid::new_v4()),
            sender,
            text: text.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            file_url: None,
            file_name: None,
            metadata: None,
            kind: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_file(mut self, url: impl Into<String>, name: impl Into<String>) -> Self {
        self.file_url = Some(url.into());
        self.file_name = Some(name.into());
        self
    }
}

// ── Send request/response ────────────────────────────────────────────────────

/// Outbound send payload. The only request shape the plugin pipeline and
/// the transports understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub session_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SendRequest {
    #[must_use]
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            user_identifier: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_identifier: impl Into<String>) -> Self {
        self.user_identifier = Some(user_identifier.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Backend response to a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReply {
    pub reply: String,
}

impl SendReply {
    #[must_use]
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

/// Backend response to a multipart upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReply {
    #[serde(default)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
    pub url: String,
}

// ── Telemetry ────────────────────────────────────────────────────────────────

/// Fire-and-forget diagnostic event. No acknowledgment expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub at: u64,
}

impl TelemetryEvent {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detail: None,
            at: now_ms(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ── Transport vocabulary ─────────────────────────────────────────────────────

/// Connection lifecycle state. Exactly one value at a time per transport
/// instance; transitions are the transport's sole internal invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl TransportState {
    /// True while a connect is in progress or established.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// Which built-in channel moves the messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Polling,
    Socket,
}

// ── Duplex frames ────────────────────────────────────────────────────────────

/// Widget → backend envelope on the duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_identifier: Option<String>,
        payload: SendRequest,
    },
    #[serde(rename_all = "camelCase")]
    File {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        name: String,
        size: u64,
        /// Base64 payload on the emit path. Native sockets omit this and
        /// send the bytes as a separate binary frame.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    Ping { ts: u64 },
}

impl ClientFrame {
    /// Message envelope; session and user identifiers are lifted out of the
    /// request so the backend can route without opening the payload.
    #[must_use]
    pub fn message(request: SendRequest) -> Self {
        Self::Message {
            session_id: request.session_id.clone(),
            user_identifier: request.user_identifier.clone(),
            payload: request,
        }
    }

    #[must_use]
    pub fn file(
        session_id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self::File {
            session_id: session_id.into(),
            metadata,
            name: name.into(),
            size,
            data: None,
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::Ping { ts: now_ms() }
    }
}

/// Backend → widget payload on the duplex channel. Untagged: a JSON array
/// is a message batch, an object carrying a string `reply` is a bot reply,
/// anything else passes through raw.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Batch(Vec<ChatMessage>),
    Reply(ReplyFrame),
    Raw(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyFrame {
    pub reply: String,
}
