//! Runs an ordered set of plugins around the widget lifecycle.

use std::{
    future::Future,
    sync::{Arc, RwLock},
    time::Duration,
};

use {tokio::time::sleep, tracing::{debug, warn}};

use wicket_protocol::{ChatMessage, SEND_RETRY_LIMIT, SendReply, SendRequest, TelemetryEvent};

use crate::hooks::{
    BeforeSendAction, ConnectionEvent, ContextUpdate, PluginContext, RetryDirective,
    SendErrorAction, WidgetPlugin,
};

/// Where a send landed after the before-send phase.
enum BeforeSendOutcome {
    Continue(SendRequest),
    Completed(SendRequest, SendReply),
    Aborted(SendRequest),
}

macro_rules! lifecycle_broadcast {
    ($(#[$doc:meta])* $method:ident => $hook:ident) => {
        $(#[$doc])*
        pub async fn $method(&self) {
            let cx = self.context();
            for plugin in &self.plugins {
                if let Err(error) = plugin.$hook(&cx).await {
                    warn!(
                        plugin = plugin.name(),
                        error = %error,
                        concat!("plugin ", stringify!($hook), " hook failed")
                    );
                }
            }
        }
    };
}

/// Drives a fixed, ordered plugin list.
///
/// The list never changes after construction; ordering is registration
/// ordering everywhere, including the send pipeline.
pub struct PluginRunner {
    plugins: Vec<Arc<dyn WidgetPlugin>>,
    context: RwLock<PluginContext>,
}

impl PluginRunner {
    #[must_use]
    pub fn new(plugins: Vec<Arc<dyn WidgetPlugin>>, context: PluginContext) -> Self {
        Self { plugins, context: RwLock::new(context) }
    }

    /// Current context snapshot.
    #[must_use]
    pub fn context(&self) -> PluginContext {
        self.context.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the context with `update` shallow-merged over the current
    /// snapshot. Hooks already in flight keep the snapshot they were
    /// handed.
    pub fn update_context(&self, update: ContextUpdate) {
        let mut guard = self.context.write().unwrap_or_else(|e| e.into_inner());
        *guard = guard.merged(update);
    }

    lifecycle_broadcast! {
        /// The widget script finished booting.
        notify_init => on_init
    }

    lifecycle_broadcast! {
        /// The widget attached to the page.
        notify_mount => on_mount
    }

    lifecycle_broadcast! {
        /// The widget is being torn down.
        notify_unmount => on_unmount
    }

    lifecycle_broadcast! {
        /// The launcher expanded into the chat surface.
        notify_widget_open => on_widget_open
    }

    lifecycle_broadcast! {
        /// The chat surface collapsed back into the launcher.
        notify_widget_close => on_widget_close
    }

    /// Fan a connection-state change out to every plugin.
    pub async fn notify_connection(&self, event: &ConnectionEvent) {
        let cx = self.context();
        for plugin in &self.plugins {
            if let Err(error) = plugin.on_connection_event(&cx, event).await {
                warn!(plugin = plugin.name(), error = %error, "plugin connection hook failed");
            }
        }
    }

    /// Fan a telemetry breadcrumb out to every plugin.
    pub async fn notify_telemetry(&self, event: &TelemetryEvent) {
        let cx = self.context();
        for plugin in &self.plugins {
            if let Err(error) = plugin.on_telemetry(&cx, event).await {
                warn!(plugin = plugin.name(), error = %error, "plugin telemetry hook failed");
            }
        }
    }

    /// Run an inbound batch through every transform hook in order.
    ///
    /// The caller's slice is never mutated. Each hook sees the accumulated
    /// batch so far; returning a replacement swaps the accumulator, and a
    /// hook failure leaves it untouched.
    pub async fn process_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let cx = self.context();
        let mut accumulator = messages.to_vec();
        for plugin in &self.plugins {
            match plugin.transform_incoming(&cx, &accumulator).await {
                Ok(Some(replacement)) => accumulator = replacement,
                Ok(None) => {}
                Err(error) => {
                    warn!(plugin = plugin.name(), error = %error, "plugin transform hook failed");
                }
            }
        }
        accumulator
    }

    /// Run one outbound send through the plugin pipeline.
    ///
    /// `dispatch` performs the actual delivery. Plugins may rewrite the
    /// payload, answer in place of the backend, abort silently, or request
    /// retries after a failure; at most [`SEND_RETRY_LIMIT`] retries run
    /// beyond the first attempt. When nobody asks for a retry the dispatch
    /// error is returned to the caller unchanged.
    pub async fn send<D, F>(
        &self,
        request: SendRequest,
        dispatch: D,
    ) -> anyhow::Result<Option<SendReply>>
    where
        D: Fn(SendRequest) -> F,
        F: Future<Output = anyhow::Result<Option<SendReply>>>,
    {
        let mut payload = request;
        let mut retries = 0u32;
        loop {
            let cx = self.context();
            let working = match self.run_before_send(&cx, payload).await {
                BeforeSendOutcome::Aborted(working) => {
                    self.broadcast_after_send(&cx, &working, None).await;
                    return Ok(None);
                }
                BeforeSendOutcome::Completed(working, reply) => {
                    self.broadcast_after_send(&cx, &working, Some(&reply)).await;
                    return Ok(Some(reply));
                }
                BeforeSendOutcome::Continue(working) => working,
            };

            match dispatch(working.clone()).await {
                Ok(reply) => {
                    self.broadcast_after_send(&cx, &working, reply.as_ref()).await;
                    return Ok(reply);
                }
                Err(error) => match self.consult_on_error(&cx, &working, &error).await {
                    Some(retry) if retries < SEND_RETRY_LIMIT => {
                        retries += 1;
                        debug!(retries, wait_ms = ?retry.wait_ms, "plugin requested send retry");
                        if let Some(wait_ms) = retry.wait_ms {
                            sleep(Duration::from_millis(wait_ms)).await;
                        }
                        payload = retry.payload.unwrap_or(working);
                    }
                    _ => return Err(error),
                },
            }
        }
    }

    /// Walk the before-send hooks. The first respond or abort outcome ends
    /// the phase; hooks after it never run for this attempt.
    async fn run_before_send(
        &self,
        cx: &PluginContext,
        payload: SendRequest,
    ) -> BeforeSendOutcome {
        let mut working = payload;
        for plugin in &self.plugins {
            match plugin.before_send(cx, &working).await {
                Ok(BeforeSendAction::Continue) => {}
                Ok(BeforeSendAction::ReplacePayload(next)) => working = next,
                Ok(BeforeSendAction::Respond(reply)) => {
                    debug!(plugin = plugin.name(), "before-send answered in place");
                    return BeforeSendOutcome::Completed(working, reply);
                }
                Ok(BeforeSendAction::Abort) => {
                    debug!(plugin = plugin.name(), "before-send aborted");
                    return BeforeSendOutcome::Aborted(working);
                }
                Err(error) => {
                    warn!(plugin = plugin.name(), error = %error, "plugin before-send hook failed");
                }
            }
        }
        BeforeSendOutcome::Continue(working)
    }

    /// Consult every on-error hook. All of them see the failure; when
    /// several ask for a retry the last directive wins wholesale.
    async fn consult_on_error(
        &self,
        cx: &PluginContext,
        payload: &SendRequest,
        error: &anyhow::Error,
    ) -> Option<RetryDirective> {
        let mut directive = None;
        for plugin in &self.plugins {
            match plugin.on_send_error(cx, payload, error).await {
                Ok(SendErrorAction::Propagate) => {}
                Ok(SendErrorAction::Retry(retry)) => directive = Some(retry),
                Err(hook_error) => {
                    warn!(
                        plugin = plugin.name(),
                        error = %hook_error,
                        "plugin on-error hook failed"
                    );
                }
            }
        }
        directive
    }

    async fn broadcast_after_send(
        &self,
        cx: &PluginContext,
        payload: &SendRequest,
        reply: Option<&SendReply>,
    ) {
        for plugin in &self.plugins {
            if let Err(error) = plugin.after_send(cx, payload, reply).await {
                warn!(plugin = plugin.name(), error = %error, "plugin after-send hook failed");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use {anyhow::anyhow, async_trait::async_trait};

    use wicket_protocol::TransportKind;

    use super::*;

    fn test_context() -> PluginContext {
        PluginContext::new("https://api.example.com", "s-1", TransportKind::Polling)
    }

    fn request(text: &str) -> SendRequest {
        SendRequest::new("s-1", text)
    }

    /// Logs every hook it sees as `"<name>:<hook>"`.
    struct Tracker {
        plugin_name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Tracker {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self { plugin_name: name.to_string(), log: log.clone() })
        }

        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}:{hook}", self.plugin_name));
        }
    }

    #[async_trait]
    impl WidgetPlugin for Tracker {
        fn name(&self) -> &str {
            &self.plugin_name
        }

        async fn on_init(&self, _cx: &PluginContext) -> anyhow::Result<()> {
            self.record("init");
            Ok(())
        }

        async fn on_connection_event(
            &self,
            _cx: &PluginContext,
            event: &ConnectionEvent,
        ) -> anyhow::Result<()> {
            self.record(&format!("connection({:?})", event.state));
            Ok(())
        }

        async fn before_send(
            &self,
            _cx: &PluginContext,
            _request: &SendRequest,
        ) -> anyhow::Result<BeforeSendAction> {
            self.record("before");
            Ok(BeforeSendAction::Continue)
        }

        async fn after_send(
            &self,
            _cx: &PluginContext,
            _request: &SendRequest,
            reply: Option<&SendReply>,
        ) -> anyhow::Result<()> {
            self.record(if reply.is_some() { "after(reply)" } else { "after(none)" });
            Ok(())
        }
    }

    struct Aborter;

    #[async_trait]
    impl WidgetPlugin for Aborter {
        fn name(&self) -> &str {
            "aborter"
        }

        async fn before_send(
            &self,
            _cx: &PluginContext,
            _request: &SendRequest,
        ) -> anyhow::Result<BeforeSendAction> {
            Ok(BeforeSendAction::Abort)
        }
    }

    struct Responder {
        canned: String,
    }

    #[async_trait]
    impl WidgetPlugin for Responder {
        fn name(&self) -> &str {
            "responder"
        }

        async fn before_send(
            &self,
            _cx: &PluginContext,
            _request: &SendRequest,
        ) -> anyhow::Result<BeforeSendAction> {
            Ok(BeforeSendAction::Respond(SendReply::new(self.canned.clone())))
        }
    }

    struct Rewriter {
        suffix: &'static str,
    }

    #[async_trait]
    impl WidgetPlugin for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }

        async fn before_send(
            &self,
            _cx: &PluginContext,
            request: &SendRequest,
        ) -> anyhow::Result<BeforeSendAction> {
            let mut replacement = request.clone();
            replacement.message = format!("{}{}", request.message, self.suffix);
            Ok(BeforeSendAction::ReplacePayload(replacement))
        }
    }

    struct RetryRequester {
        replacement: Option<&'static str>,
    }

    #[async_trait]
    impl WidgetPlugin for RetryRequester {
        fn name(&self) -> &str {
            "retry-requester"
        }

        async fn on_send_error(
            &self,
            _cx: &PluginContext,
            request: &SendRequest,
            _error: &anyhow::Error,
        ) -> anyhow::Result<SendErrorAction> {
            let payload = self.replacement.map(|text| {
                let mut replacement = request.clone();
                replacement.message = text.to_string();
                replacement
            });
            Ok(SendErrorAction::Retry(RetryDirective { payload, wait_ms: None }))
        }
    }

    struct FailingBeforeSend;

    #[async_trait]
    impl WidgetPlugin for FailingBeforeSend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_init(&self, _cx: &PluginContext) -> anyhow::Result<()> {
            Err(anyhow!("init exploded"))
        }

        async fn before_send(
            &self,
            _cx: &PluginContext,
            _request: &SendRequest,
        ) -> anyhow::Result<BeforeSendAction> {
            Err(anyhow!("before-send exploded"))
        }
    }

    struct AppendMarker {
        marker: &'static str,
    }

    #[async_trait]
    impl WidgetPlugin for AppendMarker {
        fn name(&self) -> &str {
            self.marker
        }

        async fn transform_incoming(
            &self,
            _cx: &PluginContext,
            messages: &[ChatMessage],
        ) -> anyhow::Result<Option<Vec<ChatMessage>>> {
            let mut out = messages.to_vec();
            for message in &mut out {
                message.text = format!("{}|{}", message.text, self.marker);
            }
            Ok(Some(out))
        }
    }

    struct FailingTransform;

    #[async_trait]
    impl WidgetPlugin for FailingTransform {
        fn name(&self) -> &str {
            "failing-transform"
        }

        async fn transform_incoming(
            &self,
            _cx: &PluginContext,
            _messages: &[ChatMessage],
        ) -> anyhow::Result<Option<Vec<ChatMessage>>> {
            Err(anyhow!("transform exploded"))
        }
    }

    #[tokio::test]
    async fn abort_skips_dispatch_and_later_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = PluginRunner::new(
            vec![
                Tracker::new("a", &log),
                Arc::new(Aborter),
                Tracker::new("c", &log),
            ],
            test_context(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let dispatch_calls = calls.clone();

        let result = runner
            .send(request("hello"), move |_request| {
                let calls = dispatch_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(SendReply::new("never")))
                }
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let log = log.lock().unwrap();
        // Plugin c's before-send never ran, but after-send reached everyone
        // with no reply attached.
        assert_eq!(
            log.as_slice(),
            &["a:before", "a:after(none)", "c:after(none)"]
        );
    }

    #[tokio::test]
    async fn short_circuit_returns_the_plugin_reply_verbatim() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = PluginRunner::new(
            vec![
                Arc::new(Responder { canned: "canned answer".into() }),
                Tracker::new("b", &log),
            ],
            test_context(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let dispatch_calls = calls.clone();

        let result = runner
            .send(request("hello"), move |_request| {
                let calls = dispatch_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.unwrap().reply, "canned answer");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["b:after(reply)"]
        );
    }

    #[tokio::test]
    async fn replaced_payload_reaches_later_hooks_and_the_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatch_seen = seen.clone();
        let runner = PluginRunner::new(
            vec![Arc::new(Rewriter { suffix: "!" })],
            test_context(),
        );

        let result = runner
            .send(request("hi"), move |request| {
                let seen = dispatch_seen.clone();
                async move {
                    seen.lock().unwrap().push(request.message.clone());
                    Ok(Some(SendReply::new("ok")))
                }
            })
            .await
            .unwrap();

        assert_eq!(result.unwrap().reply, "ok");
        assert_eq!(seen.lock().unwrap().as_slice(), &["hi!"]);
    }

    #[tokio::test]
    async fn retry_runs_the_dispatch_again() {
        let runner = PluginRunner::new(
            vec![Arc::new(RetryRequester { replacement: None })],
            test_context(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let dispatch_calls = calls.clone();

        let result = runner
            .send(request("hello"), move |_request| {
                let calls = dispatch_calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(anyhow!("dispatch down"))
                    } else {
                        Ok(Some(SendReply::new("second time lucky")))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.unwrap().reply, "second time lucky");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded_and_the_original_error_survives() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = PluginRunner::new(
            vec![
                Arc::new(RetryRequester { replacement: None }),
                Tracker::new("t", &log),
            ],
            test_context(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let dispatch_calls = calls.clone();

        let error = runner
            .send(request("hello"), move |_request| {
                let calls = dispatch_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Option<SendReply>, _>(anyhow!("dispatch down"))
                }
            })
            .await
            .unwrap_err();

        // One initial attempt plus the full retry budget.
        assert_eq!(calls.load(Ordering::SeqCst), 1 + SEND_RETRY_LIMIT);
        assert_eq!(error.to_string(), "dispatch down");
        // A send that ends in an error never reaches after-send.
        let befores = log.lock().unwrap();
        assert!(befores.iter().all(|entry| entry.ends_with(":before")));
    }

    #[tokio::test]
    async fn no_retry_means_the_error_propagates_immediately() {
        let runner = PluginRunner::new(Vec::new(), test_context());
        let calls = Arc::new(AtomicU32::new(0));
        let dispatch_calls = calls.clone();

        let error = runner
            .send(request("hello"), move |_request| {
                let calls = dispatch_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Option<SendReply>, _>(anyhow!("backend gone"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.to_string(), "backend gone");
    }

    #[tokio::test]
    async fn last_retry_directive_wins_wholesale() {
        let runner = PluginRunner::new(
            vec![
                Arc::new(RetryRequester { replacement: Some("from-first") }),
                Arc::new(RetryRequester { replacement: Some("from-last") }),
            ],
            test_context(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatch_seen = seen.clone();

        let result = runner
            .send(request("original"), move |request| {
                let seen = dispatch_seen.clone();
                async move {
                    let mut seen = seen.lock().unwrap();
                    seen.push(request.message.clone());
                    if seen.len() == 1 {
                        Err(anyhow!("dispatch down"))
                    } else {
                        Ok(Some(SendReply::new("ok")))
                    }
                }
            })
            .await
            .unwrap();

        assert!(result.is_some());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &["original", "from-last"]
        );
    }

    #[tokio::test]
    async fn hook_failures_never_break_the_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = PluginRunner::new(
            vec![Arc::new(FailingBeforeSend), Tracker::new("t", &log)],
            test_context(),
        );

        runner.notify_init().await;

        let result = runner
            .send(request("hello"), |_request| async {
                Ok(Some(SendReply::new("ok")))
            })
            .await
            .unwrap();

        assert_eq!(result.unwrap().reply, "ok");
        let log = log.lock().unwrap();
        assert!(log.contains(&"t:init".to_string()));
        assert!(log.contains(&"t:before".to_string()));
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = PluginRunner::new(
            vec![
                Tracker::new("a", &log),
                Tracker::new("b", &log),
                Tracker::new("c", &log),
            ],
            test_context(),
        );

        runner
            .send(request("hello"), |_request| async {
                Ok(Some(SendReply::new("ok")))
            })
            .await
            .unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                "a:before",
                "b:before",
                "c:before",
                "a:after(reply)",
                "b:after(reply)",
                "c:after(reply)",
            ]
        );
    }

    #[tokio::test]
    async fn process_messages_leaves_the_callers_batch_untouched() {
        let runner = PluginRunner::new(
            vec![Arc::new(AppendMarker { marker: "seen" })],
            test_context(),
        );
        let input = vec![ChatMessage::user("original")];

        let output = runner.process_messages(&input).await;

        assert_eq!(output[0].text, "original|seen");
        assert_eq!(input[0].text, "original");
    }

    #[tokio::test]
    async fn transforms_chain_in_order_and_failures_keep_the_accumulator() {
        let runner = PluginRunner::new(
            vec![
                Arc::new(AppendMarker { marker: "a" }),
                Arc::new(FailingTransform),
                Arc::new(AppendMarker { marker: "b" }),
            ],
            test_context(),
        );
        let input = vec![ChatMessage::bot("m")];

        let output = runner.process_messages(&input).await;

        assert_eq!(output[0].text, "m|a|b");
    }

    #[tokio::test]
    async fn context_updates_shallow_merge() {
        let runner = PluginRunner::new(Vec::new(), test_context());

        runner.update_context(ContextUpdate::default().open(true));
        runner.update_context(ContextUpdate::default().user("visitor-9"));

        let cx = runner.context();
        assert!(cx.is_open);
        assert_eq!(cx.user_identifier.as_deref(), Some("visitor-9"));
        assert_eq!(cx.api_url, "https://api.example.com");
        assert_eq!(cx.session_id, "s-1");
    }

    #[tokio::test]
    async fn connection_events_reach_every_plugin() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = PluginRunner::new(
            vec![Tracker::new("a", &log), Tracker::new("b", &log)],
            test_context(),
        );

        runner
            .notify_connection(
                &ConnectionEvent::new(wicket_protocol::TransportState::Error)
                    .with_detail("socket dropped"),
            )
            .await;

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["a:connection(Error)", "b:connection(Error)"]
        );
    }
}
