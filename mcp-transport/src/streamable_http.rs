//! Client half of the Streamable HTTP transport.
//!
//! Every outbound envelope is POSTed to the MCP endpoint. The server answers
//! with a single JSON body, an SSE stream carrying one or more envelopes, or
//! 202 for notifications. A standing GET to the same URL acts as the
//! server-push back-channel once the session is established; losing it is
//! logged and retried, never fatal.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use mcp_types::JSONRPCMessage;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use url::Url;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::LAST_EVENT_ID_HEADER;
use crate::MCP_PROTOCOL_VERSION_HEADER;
use crate::MCP_SESSION_ID_HEADER;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;

/// Delay before reopening the standing GET stream after it drops.
const GET_STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    /// The single MCP endpoint (POST, GET and DELETE all go here).
    pub url: Url,
    /// Bearer token passed through on every request.
    pub auth_token: Option<String>,
    /// Open a long-lived GET stream for server pushes once the session is
    /// initialized.
    pub open_sse_stream: bool,
}

impl StreamableHttpConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            auth_token: None,
            open_sse_stream: true,
        }
    }
}

pub struct StreamableHttpTransport {
    core: Arc<TransportCore>,
    client: reqwest::Client,
    config: StreamableHttpConfig,
    protocol_version: Mutex<Option<String>>,
    session_id: Arc<Mutex<Option<String>>>,
    /// Latest event id seen on the standing GET, replayed on reconnect.
    last_event_id: Arc<Mutex<Option<String>>>,
    get_stream_started: AtomicBool,
    shutdown: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(config: StreamableHttpConfig) -> Self {
        Self {
            core: Arc::new(TransportCore::new()),
            client: reqwest::Client::new(),
            config,
            protocol_version: Mutex::new(None),
            session_id: Arc::new(Mutex::new(None)),
            last_event_id: Arc::new(Mutex::new(None)),
            get_stream_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Pin the negotiated protocol revision; subsequent requests carry it in
    /// `Mcp-Protocol-Version`.
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.into());
    }

    /// Explicitly end the server-side session with an HTTP DELETE. Servers
    /// that do not support termination reply 405, which counts as success.
    /// The local session id is cleared either way.
    pub async fn terminate_session(&self) -> Result<(), TransportError> {
        let session_id = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let result = match session_id {
            Some(session_id) => {
                let mut request = self
                    .client
                    .delete(self.config.url.clone())
                    .header(MCP_SESSION_ID_HEADER, session_id);
                if let Some(token) = &self.config.auth_token {
                    request = request.bearer_auth(token);
                }
                match request.send().await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
                            Ok(())
                        } else {
                            let body = response.text().await.unwrap_or_default();
                            Err(TransportError::Http {
                                status: status.as_u16(),
                                body,
                            })
                        }
                    }
                    Err(e) => Err(TransportError::HttpClient(e)),
                }
            }
            None => Ok(()),
        };
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        result
    }

    fn apply_common_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(session_id) = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
        {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        if let Some(version) = self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
        {
            request = request.header(MCP_PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        request
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut slot = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            debug!("captured MCP session id {session_id}");
            *slot = Some(session_id.to_string());
        }
    }

    /// Open (once) the standing GET stream used for server-initiated pushes.
    fn start_get_stream(&self) {
        if self
            .get_stream_started
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        let client = self.client.clone();
        let url = self.config.url.clone();
        let auth_token = self.config.auth_token.clone();
        let session_id = self.session_id.clone();
        let last_event_id = self.last_event_id.clone();
        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() || core.is_closed() {
                    return;
                }
                let mut request = client
                    .get(url.clone())
                    .header(ACCEPT, "text/event-stream");
                if let Some(session_id) = session_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_deref()
                {
                    request = request.header(MCP_SESSION_ID_HEADER, session_id);
                }
                if let Some(last) = last_event_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_deref()
                {
                    request = request.header(LAST_EVENT_ID_HEADER, last);
                }
                if let Some(token) = &auth_token {
                    request = request.bearer_auth(token);
                }

                match request.send().await {
                    Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                        debug!("server does not offer a push stream (405 on GET)");
                        return;
                    }
                    Ok(response) if !response.status().is_success() => {
                        warn!(
                            "push stream GET failed with status {}; will retry",
                            response.status()
                        );
                    }
                    Ok(response) => {
                        let on_event_id: Arc<dyn Fn(String) + Send + Sync> = {
                            let last_event_id = last_event_id.clone();
                            Arc::new(move |id: String| {
                                *last_event_id
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner) = Some(id);
                            })
                        };
                        process_sse_stream(
                            response.bytes_stream(),
                            core.clone(),
                            on_event_id,
                            shutdown.clone(),
                        )
                        .await;
                        debug!("push stream ended; reconnecting");
                    }
                    Err(e) => {
                        warn!("push stream GET error: {e}; will retry");
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(GET_STREAM_RETRY_DELAY) => {}
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;

        let mut request = self
            .client
            .post(self.config.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&message);
        request = self.apply_common_headers(request);
        if let Some(token) = &options.resumption_token {
            request = request.header(LAST_EVENT_ID_HEADER, token.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        self.capture_session_id(&response);

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            let reply: JSONRPCMessage = response.json().await?;
            self.core.deliver_message(reply).await;
        } else if content_type.starts_with("text/event-stream") {
            // The response stream may outlive this send (progress, streamed
            // responses); pump it in the background.
            let core = self.core.clone();
            let shutdown = self.shutdown.clone();
            let on_event_id: Arc<dyn Fn(String) + Send + Sync> = options
                .on_resumption_token
                .unwrap_or_else(|| Arc::new(|_id: String| {}));
            tokio::spawn(async move {
                process_sse_stream(response.bytes_stream(), core, on_event_id, shutdown).await;
            });
        }
        // Anything else (typically 202 Accepted with an empty body) is a
        // successful no-op.

        if self.config.open_sse_stream && is_initialized_notification(&message) {
            self.start_get_stream();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.begin_close() {
            self.shutdown.cancel();
            self.core.fire_close();
        }
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) {
        self.core.register_message_callback(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.core.register_error_callback(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.core.register_close_callback(callback);
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_protocol_version(&self, version: &str) {
        StreamableHttpTransport::set_protocol_version(self, version);
    }
}

fn is_initialized_notification(message: &JSONRPCMessage) -> bool {
    matches!(
        message,
        JSONRPCMessage::Notification(n) if n.method == "notifications/initialized"
    )
}

/// Pump one SSE body: decode each event's `data` as an envelope and deliver
/// it; `event: error` events surface through `on_error`; every event id is
/// reported so callers can resume.
async fn process_sse_stream<S>(
    stream: S,
    core: Arc<TransportCore>,
    on_event_id: Arc<dyn Fn(String) + Send + Sync>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if !event.id.is_empty() {
                    on_event_id(event.id.clone());
                }
                if event.event == "error" {
                    core.deliver_error(&TransportError::Stream(event.data));
                    continue;
                }
                if event.data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JSONRPCMessage>(&event.data) {
                    Ok(message) => core.deliver_message(message).await,
                    Err(e) => core.deliver_error(&TransportError::InvalidMessage(format!(
                        "{e}; data = {data}",
                        data = event.data
                    ))),
                }
            }
            Some(Err(e)) => {
                core.deliver_error(&TransportError::Stream(e.to_string()));
                return;
            }
            None => return,
        }
    }
}
