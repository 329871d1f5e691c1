//! Client half of the legacy HTTP+SSE transport.
//!
//! The server's event stream is opened with a GET; its first event must be
//! `event: endpoint` whose data names the POST back-channel, resolved against
//! the stream URL. Every later event carries one JSON-RPC envelope. On
//! disconnect the stream is reopened with `Last-Event-ID` after the
//! server-suggested `retry` delay (default one second).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use mcp_types::JSONRPCMessage;
use reqwest::header::ACCEPT;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use url::Url;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::LAST_EVENT_ID_HEADER;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Name of the handshake event announcing the POST back-channel.
const ENDPOINT_EVENT: &str = "endpoint";

pub struct SseClientTransport {
    core: Arc<TransportCore>,
    client: reqwest::Client,
    sse_url: Url,
    auth_token: Option<String>,
    endpoint_url: Arc<Mutex<Option<Url>>>,
    shutdown: CancellationToken,
}

impl SseClientTransport {
    pub fn new(sse_url: Url, auth_token: Option<String>) -> Self {
        Self {
            core: Arc::new(TransportCore::new()),
            client: reqwest::Client::new(),
            sse_url,
            auth_token,
            endpoint_url: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// The resolved POST back-channel URL, once the endpoint event arrived.
    pub fn endpoint_url(&self) -> Option<Url> {
        self.endpoint_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    /// Opens the event stream and waits for the `endpoint` event, so a
    /// successful `start` means `send` has somewhere to POST to.
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<(), TransportError>>();
        tokio::spawn(run_event_stream(StreamTask {
            core: self.core.clone(),
            client: self.client.clone(),
            sse_url: self.sse_url.clone(),
            auth_token: self.auth_token.clone(),
            endpoint_url: self.endpoint_url.clone(),
            shutdown: self.shutdown.clone(),
            endpoint_tx: Some(endpoint_tx),
        }));

        match endpoint_rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Stream(
                "event stream ended before the endpoint event".to_string(),
            )),
        }
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        _options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let Some(endpoint) = self.endpoint_url() else {
            return Err(TransportError::NotStarted);
        };

        let mut request = self.client.post(endpoint).json(&message);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
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
        // The server replies over the event stream; a 2xx body is ignored.
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
}

struct StreamTask {
    core: Arc<TransportCore>,
    client: reqwest::Client,
    sse_url: Url,
    auth_token: Option<String>,
    endpoint_url: Arc<Mutex<Option<Url>>>,
    shutdown: CancellationToken,
    /// Completes the pending `start` call once the first endpoint event is
    /// resolved (or the initial connect fails).
    endpoint_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
}

async fn run_event_stream(mut task: StreamTask) {
    let mut retry_delay = DEFAULT_RETRY_DELAY;
    let mut last_event_id: Option<String> = None;

    loop {
        if task.shutdown.is_cancelled() || task.core.is_closed() {
            return;
        }

        let mut request = task
            .client
            .get(task.sse_url.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(last) = &last_event_id {
            request = request.header(LAST_EVENT_ID_HEADER, last.as_str());
        }
        if let Some(token) = &task.auth_token {
            request = request.bearer_auth(token);
        }

        let connect_error = match request.send().await {
            Ok(response) if response.status().is_success() => {
                let mut stream = response.bytes_stream().eventsource();
                loop {
                    let next = tokio::select! {
                        _ = task.shutdown.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if !event.id.is_empty() {
                                last_event_id = Some(event.id.clone());
                            }
                            if let Some(retry) = event.retry {
                                retry_delay = retry;
                            }
                            handle_event(&mut task, &event.event, &event.data).await;
                        }
                        Some(Err(e)) => {
                            task.core
                                .deliver_error(&TransportError::Stream(e.to_string()));
                            break;
                        }
                        None => break,
                    }
                }
                None
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Some(TransportError::Http {
                    status: status.as_u16(),
                    body,
                })
            }
            Err(e) => Some(TransportError::HttpClient(e)),
        };

        if let Some(error) = connect_error {
            // A failed *initial* connect fails `start`; later failures only
            // delay the reconnect.
            if let Some(endpoint_tx) = task.endpoint_tx.take() {
                let _ = endpoint_tx.send(Err(error));
                close_stream(&task);
                return;
            }
            task.core.deliver_error(&error);
        }

        debug!("SSE stream disconnected; reconnecting in {retry_delay:?}");
        tokio::select! {
            _ = task.shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

async fn handle_event(task: &mut StreamTask, event: &str, data: &str) {
    if event == ENDPOINT_EVENT {
        match task.sse_url.join(data) {
            Ok(resolved) => {
                debug!("resolved message endpoint: {resolved}");
                *task
                    .endpoint_url
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(resolved);
                if let Some(endpoint_tx) = task.endpoint_tx.take() {
                    let _ = endpoint_tx.send(Ok(()));
                }
            }
            Err(e) => {
                let error =
                    TransportError::Stream(format!("invalid endpoint {data:?}: {e}"));
                if let Some(endpoint_tx) = task.endpoint_tx.take() {
                    let _ = endpoint_tx.send(Err(error));
                    close_stream(task);
                } else {
                    task.core.deliver_error(&error);
                }
            }
        }
        return;
    }

    if event == "error" {
        task.core
            .deliver_error(&TransportError::Stream(data.to_string()));
        return;
    }

    if data.is_empty() {
        return;
    }
    match serde_json::from_str::<JSONRPCMessage>(data) {
        Ok(message) => task.core.deliver_message(message).await,
        Err(e) => {
            warn!("dropping malformed SSE message: {e}");
            task.core
                .deliver_error(&TransportError::InvalidMessage(format!("{e}; data = {data}")));
        }
    }
}

fn close_stream(task: &StreamTask) {
    if task.core.begin_close() {
        task.shutdown.cancel();
        task.core.fire_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The endpoint event data is resolved against the stream URL: absolute
    // paths rebase to the origin, relative paths to the stream's directory.
    #[test]
    fn endpoint_resolution() {
        let base = Url::parse("http://h/api/mcp/sse").unwrap();
        assert_eq!(
            base.join("/messages?sid=x").unwrap().as_str(),
            "http://h/messages?sid=x"
        );
        assert_eq!(
            base.join("post?sid=y").unwrap().as_str(),
            "http://h/api/mcp/post?sid=y"
        );
    }
}
