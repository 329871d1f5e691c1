//! Server half of the legacy HTTP+SSE transport.
//!
//! One instance backs one client connection. The HTTP adapter wires two
//! routes to it: the GET event stream drains [`SseServerTransport::take_event_stream`],
//! and the POST back-channel feeds [`SseServerTransport::handle_post_message`].
//! The first emitted event is always `event: endpoint` announcing where to
//! POST, keyed by this transport's session id.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use mcp_types::JSONRPCMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;
use crate::format_sse_event;

/// One event ready to be written to the GET response body.
#[derive(Debug, Clone, PartialEq)]
pub struct SseServerEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseServerEvent {
    /// Render in SSE wire format, trailing blank line included.
    pub fn to_wire(&self) -> String {
        format_sse_event(self.id.as_deref(), self.event.as_deref(), &self.data)
    }
}

pub struct SseServerTransport {
    core: Arc<TransportCore>,
    session_id: String,
    endpoint: String,
    next_event_id: AtomicU64,
    events_tx: Mutex<Option<mpsc::UnboundedSender<SseServerEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SseServerEvent>>>,
}

impl SseServerTransport {
    /// `endpoint` is the POST route the adapter serves, e.g. `/messages`;
    /// clients resolve it against their stream URL.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(TransportCore::new()),
            session_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            next_event_id: AtomicU64::new(1),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// The outbound event stream. The adapter forwards it to the GET
    /// response; it ends when the transport closes.
    pub fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<SseServerEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Entry point for the POST back-channel: parse one envelope and deliver
    /// it. A parse failure is returned so the adapter can answer 400.
    pub async fn handle_post_message(&self, body: &str) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let message: JSONRPCMessage = serde_json::from_str(body)
            .map_err(|e| TransportError::InvalidMessage(format!("{e}; body = {body}")))?;
        self.core.deliver_message(message).await;
        Ok(())
    }

    fn push_event(&self, event: SseServerEvent) -> Result<(), TransportError> {
        let tx = self
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(event)
            .map_err(|_| TransportError::SendFailed("event stream receiver is gone".to_string()))
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()?;
        // The endpoint announcement must precede every message event.
        self.push_event(SseServerEvent {
            id: None,
            event: Some("endpoint".to_string()),
            data: format!(
                "{endpoint}?sessionId={session_id}",
                endpoint = self.endpoint,
                session_id = self.session_id
            ),
        })
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        _options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let data = serde_json::to_string(&message)?;
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        self.push_event(SseServerEvent {
            id: Some(id.to_string()),
            event: Some("message".to_string()),
            data,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.begin_close() {
            // Dropping the sender ends the adapter's event stream.
            self.events_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
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
        Some(self.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::JSONRPC_VERSION;
    use mcp_types::JSONRPCNotification;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn endpoint_event_is_emitted_first() {
        let transport = SseServerTransport::new("/messages");
        let mut events = transport.take_event_stream().expect("stream");
        transport.start().await.expect("start");

        let endpoint = events.recv().await.expect("endpoint event");
        assert_eq!(endpoint.event.as_deref(), Some("endpoint"));
        let expected = format!(
            "/messages?sessionId={}",
            transport.session_id().expect("session id")
        );
        assert_eq!(endpoint.data, expected);

        transport
            .send(
                JSONRPCMessage::Notification(JSONRPCNotification {
                    jsonrpc: JSONRPC_VERSION.into(),
                    method: "notifications/tools/list_changed".into(),
                    params: None,
                }),
                TransportSendOptions::default(),
            )
            .await
            .expect("send");
        let event = events.recv().await.expect("message event");
        assert_eq!(event.event.as_deref(), Some("message"));
        assert_eq!(event.id.as_deref(), Some("1"));
        assert!(event.data.contains("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn close_ends_event_stream() {
        let transport = SseServerTransport::new("/messages");
        let mut events = transport.take_event_stream().expect("stream");
        transport.start().await.expect("start");
        let _ = events.recv().await;
        transport.close().await.expect("close");
        assert!(events.recv().await.is_none());
    }
}
