//! The hook surface widget plugins implement.
//!
//! A plugin is a named bundle of optional lifecycle hooks. Everything
//! defaults to a no-op, so a plugin implements exactly the hooks it cares
//! about. Hooks always run in plugin registration order, and a failure in
//! one plugin's hook never reaches the others.

use {async_trait::async_trait, serde::Serialize};

use wicket_protocol::{
    ChatMessage, SendReply, SendRequest, TelemetryEvent, TransportKind, TransportState,
};

// ── Context ──────────────────────────────────────────────────────────────────

/// Immutable runtime snapshot handed to every hook invocation.
///
/// Hooks receive the snapshot current at call time; they must not hold on
/// to one as a mutation target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    pub api_url: String,
    pub session_id: String,
    pub transport_kind: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_identifier: Option<String>,
    /// Whether the widget surface is currently open.
    pub is_open: bool,
}

impl PluginContext {
    #[must_use]
    pub fn new(
        api_url: impl Into<String>,
        session_id: impl Into<String>,
        transport_kind: TransportKind,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            session_id: session_id.into(),
            transport_kind,
            user_identifier: None,
            is_open: false,
        }
    }

    /// Next snapshot with `update`'s set fields layered over this one.
    #[must_use]
    pub fn merged(&self, update: ContextUpdate) -> Self {
        Self {
            api_url: update.api_url.unwrap_or_else(|| self.api_url.clone()),
            session_id: update.session_id.unwrap_or_else(|| self.session_id.clone()),
            transport_kind: update.transport_kind.unwrap_or(self.transport_kind),
            user_identifier: update.user_identifier.or_else(|| self.user_identifier.clone()),
            is_open: update.is_open.unwrap_or(self.is_open),
        }
    }
}

/// Partial context; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub api_url: Option<String>,
    pub session_id: Option<String>,
    pub transport_kind: Option<TransportKind>,
    pub user_identifier: Option<String>,
    pub is_open: Option<bool>,
}

impl ContextUpdate {
    #[must_use]
    pub fn open(mut self, is_open: bool) -> Self {
        self.is_open = Some(is_open);
        self
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn user(mut self, user_identifier: impl Into<String>) -> Self {
        self.user_identifier = Some(user_identifier.into());
        self
    }
}

/// Connection-state change forwarded to plugins.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub state: TransportState,
    pub detail: Option<String>,
}

impl ConnectionEvent {
    #[must_use]
    pub fn new(state: TransportState) -> Self {
        Self { state, detail: None }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ── Hook outcomes ────────────────────────────────────────────────────────────

/// Outcome of one `before_send` hook.
#[derive(Debug, Clone, Default)]
pub enum BeforeSendAction {
    /// Proceed with the current payload.
    #[default]
    Continue,
    /// Swap the outbound payload; later hooks and the dispatch see the
    /// replacement.
    ReplacePayload(SendRequest),
    /// Complete the send with this reply, skipping the dispatch entirely.
    Respond(SendReply),
    /// Stop the send silently: no dispatch, no error to the caller.
    Abort,
}

/// Outcome of one `on_send_error` hook.
#[derive(Debug, Clone, Default)]
pub enum SendErrorAction {
    /// Let the failure stand.
    #[default]
    Propagate,
    /// Run the attempt again.
    Retry(RetryDirective),
}

/// How to rerun a failed dispatch.
#[derive(Debug, Clone, Default)]
pub struct RetryDirective {
    /// Replacement payload; the current one is kept when absent.
    pub payload: Option<SendRequest>,
    /// Delay before the next attempt.
    pub wait_ms: Option<u64>,
}

// ── Plugin trait ─────────────────────────────────────────────────────────────

/// One widget plugin.
#[async_trait]
pub trait WidgetPlugin: Send + Sync {
    /// Stable name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// The widget script finished booting.
    async fn on_init(&self, _cx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The widget attached to the page.
    async fn on_mount(&self, _cx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The widget is being torn down.
    async fn on_unmount(&self, _cx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The launcher expanded into the chat surface.
    async fn on_widget_open(&self, _cx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The chat surface collapsed back into the launcher.
    async fn on_widget_close(&self, _cx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The transport's connection state changed.
    async fn on_connection_event(
        &self,
        _cx: &PluginContext,
        _event: &ConnectionEvent,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A telemetry breadcrumb left the transport.
    async fn on_telemetry(
        &self,
        _cx: &PluginContext,
        _event: &TelemetryEvent,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe or transform an inbound batch. `Ok(None)` keeps the batch
    /// as the previous hook left it.
    async fn transform_incoming(
        &self,
        _cx: &PluginContext,
        _messages: &[ChatMessage],
    ) -> anyhow::Result<Option<Vec<ChatMessage>>> {
        Ok(None)
    }

    /// Runs before each dispatch attempt of an outbound send.
    async fn before_send(
        &self,
        _cx: &PluginContext,
        _request: &SendRequest,
    ) -> anyhow::Result<BeforeSendAction> {
        Ok(BeforeSendAction::Continue)
    }

    /// Consulted after a failed dispatch attempt.
    async fn on_send_error(
        &self,
        _cx: &PluginContext,
        _request: &SendRequest,
        _error: &anyhow::Error,
    ) -> anyhow::Result<SendErrorAction> {
        Ok(SendErrorAction::Propagate)
    }

    /// Runs once per send after it settles without an error: success,
    /// short-circuit, or abort.
    async fn after_send(
        &self,
        _cx: &PluginContext,
        _request: &SendRequest,
        _reply: Option<&SendReply>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn context_serializes_camel_case_and_skips_unset_user() {
        let cx = PluginContext::new("https://api.example.com", "s-1", TransportKind::Polling);

        let value = serde_json::to_value(&cx).unwrap();
        assert_eq!(
            value,
            json!({
                "apiUrl": "https://api.example.com",
                "sessionId": "s-1",
                "transportKind": "polling",
                "isOpen": false,
            })
        );

        let value = serde_json::to_value(cx.merged(ContextUpdate::default().user("v-7"))).unwrap();
        assert_eq!(value["userIdentifier"], "v-7");
    }

    #[test]
    fn merged_keeps_unset_fields() {
        let cx = PluginContext::new("https://api.example.com", "s-1", TransportKind::Socket)
            .merged(ContextUpdate::default().user("v-7"));

        let next = cx.merged(ContextUpdate::default().open(true).session("s-2"));

        assert!(next.is_open);
        assert_eq!(next.session_id, "s-2");
        assert_eq!(next.api_url, "https://api.example.com");
        assert_eq!(next.user_identifier.as_deref(), Some("v-7"));
        assert_eq!(next.transport_kind, TransportKind::Socket);
    }
}
