//! Transport configuration.

use std::collections::HashMap;

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    url::Url,
};

use wicket_protocol::{DEFAULT_POLL_INTERVAL_MS, HEARTBEAT_INTERVAL_MS};

use crate::error::{Error, Result};

/// Read-only configuration fixed at transport construction.
///
/// Tuning fields carry defaults so hosts can deserialize a minimal
/// `{apiUrl, sessionId}` bag straight out of embed config.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    /// Base API endpoint; sends go here directly.
    pub api_url: String,
    /// Logical conversation identity scoping every request.
    pub session_id: String,
    /// Explicit upload endpoint; derived from `api_url` when absent.
    #[serde(default)]
    pub upload_url: Option<String>,
    /// Explicit socket endpoint; derived from `api_url` when absent.
    #[serde(default)]
    pub socket_url: Option<String>,
    /// Bearer token, redacted from debug output.
    #[serde(default)]
    pub auth_token: Option<Secret<String>>,
    /// Static headers attached to every HTTP request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Stable end-user identity forwarded inside envelopes.
    #[serde(default)]
    pub user_identifier: Option<String>,
    /// Delay between successful polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for one poll request; the poll interval when unset.
    #[serde(default)]
    pub long_poll_timeout_ms: Option<u64>,
    /// Socket ping cadence; `0` disables the heartbeat.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL_MS
}

impl TransportOptions {
    /// Minimal options for one session against one backend.
    #[must_use]
    pub fn new(api_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            session_id: session_id.into(),
            upload_url: None,
            socket_url: None,
            auth_token: None,
            headers: HashMap::new(),
            user_identifier: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            long_poll_timeout_ms: None,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(Secret::new(token.into()));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_identifier: impl Into<String>) -> Self {
        self.user_identifier = Some(user_identifier.into());
        self
    }

    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn with_long_poll_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.long_poll_timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn with_socket_url(mut self, socket_url: impl Into<String>) -> Self {
        self.socket_url = Some(socket_url.into());
        self
    }

    #[must_use]
    pub fn with_upload_url(mut self, upload_url: impl Into<String>) -> Self {
        self.upload_url = Some(upload_url.into());
        self
    }

    /// Deadline for one poll request.
    #[must_use]
    pub fn poll_deadline_ms(&self) -> u64 {
        self.long_poll_timeout_ms.unwrap_or(self.poll_interval_ms)
    }

    /// `Authorization` header value, when a token is configured.
    #[must_use]
    pub fn bearer(&self) -> Option<String> {
        self.auth_token
            .as_ref()
            .map(|token| format!("Bearer {}", token.expose_secret()))
    }

    /// Send endpoint: the API URL itself.
    pub fn send_endpoint(&self) -> Result<Url> {
        Ok(Url::parse(&self.api_url)?)
    }

    /// Message-list endpoint: the API URL with a `/chat` suffix ensured.
    pub fn chat_endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)?;
        let path = url.path().trim_end_matches('/');
        if !path.ends_with("/chat") {
            url.set_path(&format!("{path}/chat"));
        }
        Ok(url)
    }

    /// Upload endpoint: configured explicitly, or derived by swapping the
    /// `/chat` suffix for `/upload`.
    pub fn upload_endpoint(&self) -> Result<Url> {
        if let Some(explicit) = &self.upload_url {
            return Ok(Url::parse(explicit)?);
        }
        let mut url = Url::parse(&self.api_url)?;
        let path = url.path().trim_end_matches('/');
        let base = path.strip_suffix("/chat").unwrap_or(path);
        url.set_path(&format!("{base}/upload"));
        Ok(url)
    }

    /// Socket endpoint: configured explicitly, or derived from the API URL
    /// by switching http(s) to ws(s) and appending a `/ws` segment.
    pub fn socket_endpoint(&self) -> Result<Url> {
        if let Some(explicit) = &self.socket_url {
            return Ok(Url::parse(explicit)?);
        }
        let mut url = Url::parse(&self.api_url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        if url.set_scheme(scheme).is_err() {
            return Err(Error::connection(format!(
                "cannot derive a socket scheme from {}",
                self.api_url
            )));
        }
        let path = url.path().trim_end_matches('/');
        if !path.ends_with("/ws") {
            url.set_path(&format!("{path}/ws"));
        }
        Ok(url)
    }
}
