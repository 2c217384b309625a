//! Polling transport: the universal fallback.
//!
//! Repeats a timed fetch against the chat endpoint, delivering the full
//! message list each round. Failures back off with jitter and never give
//! up; one success resets the retry clock. Sends go out as direct HTTP
//! requests independent of the poll cycle.

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    reqwest::multipart::{Form, Part},
    serde_json::Value,
    tokio::time::{sleep, timeout},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use wicket_protocol::{
    ChatMessage, POLL_RETRY_BASE_MS, POLL_RETRY_MAX_MS, SendReply, SendRequest, TelemetryEvent,
    TransportState, UploadReply, telemetry_events,
};

use crate::{
    backoff::compute_backoff,
    error::{Error, Result},
    options::TransportOptions,
    traits::{ChatTransport, FilePayload, InboundPayload, TransportEvents, noop_sink},
};

// ── Transport ────────────────────────────────────────────────────────────────

/// HTTP polling transport.
pub struct PollingTransport {
    shared: Arc<Shared>,
}

struct Shared {
    options: TransportOptions,
    http: reqwest::Client,
    state: Mutex<TransportState>,
    sink: RwLock<Arc<dyn TransportEvents>>,
    /// Failures since the last success; keys the backoff delay.
    attempt: AtomicU32,
    /// Replaced on every connect, cancelled on disconnect.
    stop: Mutex<CancellationToken>,
}

impl PollingTransport {
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                http: reqwest::Client::new(),
                state: Mutex::new(TransportState::Idle),
                sink: RwLock::new(noop_sink()),
                attempt: AtomicU32::new(0),
                stop: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.shared.stop_current();
    }
}

impl Shared {
    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: TransportState) -> TransportState {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }

    fn sink(&self) -> Arc<dyn TransportEvents> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a fresh stop token for a new poll cycle. The previous token
    /// is cancelled on the way out, so a cycle left behind by an earlier
    /// connect cannot keep polling next to the new one.
    fn reset_stop(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        let mut guard = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, fresh.clone()).cancel();
        fresh
    }

    fn stop_current(&self) {
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }
}

#[async_trait]
impl ChatTransport for PollingTransport {
    fn set_event_sink(&self, sink: Arc<dyn TransportEvents>) {
        *self.shared.sink.write().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    async fn connect(&self) -> Result<()> {
        if self.shared.state().is_active() {
            return Ok(());
        }
        let stop = self.shared.reset_stop();
        self.shared.set_state(TransportState::Connecting);
        debug!(session_id = %self.shared.options.session_id, "polling: connecting");
        self.shared
            .sink()
            .on_telemetry(TelemetryEvent::new(telemetry_events::POLLING_CONNECT))
            .await;
        tokio::spawn(poll_loop(self.shared.clone(), stop));
        Ok(())
    }

    async fn disconnect(&self, reason: Option<&str>) {
        self.shared.stop_current();
        self.shared.set_state(TransportState::Closed);
        debug!(reason = ?reason, "polling: disconnected");
        self.shared.sink().on_close(reason).await;
    }

    async fn send(&self, request: SendRequest) -> Result<Option<SendReply>> {
        match post_send(&self.shared, &request).await {
            Ok(reply) => Ok(Some(reply)),
            Err(error) => {
                self.shared.sink().on_error(&error).await;
                Err(error)
            }
        }
    }

    async fn send_file(
        &self,
        file: FilePayload,
        metadata: Option<Value>,
    ) -> Result<Option<ChatMessage>> {
        match post_upload(&self.shared, &file, metadata).await {
            Ok(Some(url)) => {
                let message = ChatMessage::user(file.name.clone()).with_file(url, file.name);
                Ok(Some(message))
            }
            Ok(None) => {
                self.shared
                    .sink()
                    .on_telemetry(TelemetryEvent::new(
                        telemetry_events::UPLOAD_RESPONSE_UNPARSED,
                    ))
                    .await;
                Ok(None)
            }
            Err(error) => {
                self.shared.sink().on_error(&error).await;
                Err(error)
            }
        }
    }
}

// ── Poll cycle ───────────────────────────────────────────────────────────────

async fn poll_loop(shared: Arc<Shared>, stop: CancellationToken) {
    loop {
        if stop.is_cancelled() {
            return;
        }
        // A retry after a failed round is a fresh connection attempt.
        if shared.state() == TransportState::Error {
            shared.set_state(TransportState::Connecting);
        }
        let outcome = poll_once(&shared).await;
        // A disconnect that raced the request wins; drop the outcome.
        if stop.is_cancelled() {
            return;
        }
        let delay = match outcome {
            Ok(batch) => on_poll_success(&shared, batch).await,
            Err(error) => on_poll_failure(&shared, error).await,
        };
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.cancelled() => return,
        }
    }
}

async fn poll_once(shared: &Shared) -> Result<Vec<ChatMessage>> {
    let deadline_ms = shared.options.poll_deadline_ms();
    match timeout(Duration::from_millis(deadline_ms), fetch_batch(shared)).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(deadline_ms)),
    }
}

async fn fetch_batch(shared: &Shared) -> Result<Vec<ChatMessage>> {
    let url = shared.options.chat_endpoint()?;
    let builder = shared
        .http
        .get(url)
        .query(&[("sessionId", shared.options.session_id.as_str())]);
    let response = apply_headers(builder, &shared.options).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::status(status, body));
    }
    let value: Value = response.json().await?;
    match value {
        // Anything but a list is tolerated as an empty round.
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        _ => Ok(Vec::new()),
    }
}

async fn on_poll_success(shared: &Shared, batch: Vec<ChatMessage>) -> Duration {
    let previous = shared.set_state(TransportState::Open);
    shared.attempt.store(0, Ordering::Relaxed);
    let sink = shared.sink();
    // Open fires on the transition only, so a recovery after failed rounds
    // announces itself exactly once.
    if previous != TransportState::Open {
        sink.on_open().await;
    }
    let count = batch.len();
    sink.on_message(InboundPayload::Batch(batch)).await;
    sink.on_telemetry(
        TelemetryEvent::new(telemetry_events::POLLING_TICK)
            .with_detail(serde_json::json!({ "messages": count })),
    )
    .await;
    Duration::from_millis(shared.options.poll_interval_ms)
}

async fn on_poll_failure(shared: &Shared, error: Error) -> Duration {
    shared.set_state(TransportState::Error);
    let attempt = shared.attempt.fetch_add(1, Ordering::Relaxed);
    let delay = compute_backoff(attempt, POLL_RETRY_BASE_MS, POLL_RETRY_MAX_MS);
    warn!(
        attempt = attempt + 1,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "polling: request failed, retry scheduled"
    );
    let sink = shared.sink();
    sink.on_error(&error).await;
    sink.on_telemetry(
        TelemetryEvent::new(telemetry_events::POLLING_RETRY_SCHEDULED).with_detail(
            serde_json::json!({
                "attempt": attempt + 1,
                "delayMs": delay.as_millis() as u64,
                "detail": error.to_string(),
            }),
        ),
    )
    .await;
    delay
}

// ── HTTP requests ────────────────────────────────────────────────────────────

fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    options: &TransportOptions,
) -> reqwest::RequestBuilder {
    for (name, value) in &options.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(bearer) = options.bearer() {
        builder = builder.header("Authorization", bearer);
    }
    builder
}

async fn post_send(shared: &Shared, request: &SendRequest) -> Result<SendReply> {
    let url = shared.options.send_endpoint()?;
    let builder = shared.http.post(url).json(request);
    let response = apply_headers(builder, &shared.options).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::status(status, body));
    }
    Ok(response.json().await?)
}

/// Upload the file as multipart form data. Returns the hosted URL when the
/// backend's answer carries one.
async fn post_upload(
    shared: &Shared,
    file: &FilePayload,
    metadata: Option<Value>,
) -> Result<Option<String>> {
    let url = shared.options.upload_endpoint()?;
    let mut form = Form::new().text("sessionId", shared.options.session_id.clone());
    if let Some(Value::Object(fields)) = metadata {
        for (name, value) in fields {
            let rendered = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            form = form.text(name, rendered);
        }
    }
    let mut part = Part::bytes(file.bytes.to_vec()).file_name(file.name.clone());
    if let Some(mime) = &file.mime {
        part = part.mime_str(mime)?;
    }
    form = form.part("file", part);

    let builder = shared.http.post(url).multipart(form);
    let response = apply_headers(builder, &shared.options).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::status(status, body));
    }
    let Ok(reply) = response.json::<UploadReply>().await else {
        return Ok(None);
    };
    Ok(reply.files.first().map(|file| file.url.clone()))
}

// ── Tests ────────────────────────────────────────────────────────────────────
