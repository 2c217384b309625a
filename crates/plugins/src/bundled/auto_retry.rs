//! Retries failed sends after a fixed pause.

use {async_trait::async_trait, tracing::warn};

use wicket_protocol::SendRequest;

use crate::hooks::{PluginContext, RetryDirective, SendErrorAction, WidgetPlugin};

/// Asks the runner to retry every failed send with the original payload.
///
/// The runner's retry budget still applies, so a persistently down backend
/// surfaces its error after the budget is spent.
#[derive(Debug, Clone, Copy)]
pub struct AutoRetry {
    wait_ms: u64,
}

impl AutoRetry {
    #[must_use]
    pub fn new(wait_ms: u64) -> Self {
        Self { wait_ms }
    }
}

#[async_trait]
impl WidgetPlugin for AutoRetry {
    fn name(&self) -> &str {
        "auto-retry"
    }

    async fn on_send_error(
        &self,
        _cx: &PluginContext,
        _request: &SendRequest,
        error: &anyhow::Error,
    ) -> anyhow::Result<SendErrorAction> {
        warn!(error = %error, wait_ms = self.wait_ms, "send failed, asking for a retry");
        Ok(SendErrorAction::Retry(RetryDirective {
            payload: None,
            wait_ms: Some(self.wait_ms),
        }))
    }
}
