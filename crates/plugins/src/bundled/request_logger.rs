//! Logs the send pipeline and connection changes through `tracing`.

use {async_trait::async_trait, tracing::{info, warn}};

use wicket_protocol::{SendReply, SendRequest};

use crate::hooks::{
    BeforeSendAction, ConnectionEvent, PluginContext, SendErrorAction, WidgetPlugin,
};

/// Emits a structured log line around every send and connection change.
///
/// Purely observational: every hook returns its pass-through action.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

#[async_trait]
impl WidgetPlugin for RequestLogger {
    fn name(&self) -> &str {
        "request-logger"
    }

    async fn before_send(
        &self,
        cx: &PluginContext,
        request: &SendRequest,
    ) -> anyhow::Result<BeforeSendAction> {
        info!(
            session_id = %cx.session_id,
            chars = request.message.chars().count(),
            "sending chat message"
        );
        Ok(BeforeSendAction::Continue)
    }

    async fn after_send(
        &self,
        cx: &PluginContext,
        _request: &SendRequest,
        reply: Option<&SendReply>,
    ) -> anyhow::Result<()> {
        info!(session_id = %cx.session_id, replied = reply.is_some(), "send finished");
        Ok(())
    }

    async fn on_send_error(
        &self,
        cx: &PluginContext,
        _request: &SendRequest,
        error: &anyhow::Error,
    ) -> anyhow::Result<SendErrorAction> {
        warn!(session_id = %cx.session_id, error = %error, "send failed");
        Ok(SendErrorAction::Propagate)
    }

    async fn on_connection_event(
        &self,
        cx: &PluginContext,
        event: &ConnectionEvent,
    ) -> anyhow::Result<()> {
        info!(
            session_id = %cx.session_id,
            state = ?event.state,
            detail = ?event.detail,
            "transport state changed"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use wicket_protocol::TransportKind;

    use super::*;

    #[tokio::test]
    async fn every_hook_passes_through() {
        let plugin = RequestLogger;
        let cx = PluginContext::new("https://api.example.com", "s-1", TransportKind::Socket);
        let request = SendRequest::new("s-1", "hello");

        let action = plugin.before_send(&cx, &request).await.unwrap();
        assert!(matches!(action, BeforeSendAction::Continue));

        let action = plugin
            .on_send_error(&cx, &request, &anyhow::anyhow!("boom"))
            .await
            .unwrap();
        assert!(matches!(action, SendErrorAction::Propagate));

        plugin.after_send(&cx, &request, None).await.unwrap();
    }
}
