//! Server half of the Streamable HTTP transport.
//!
//! Framework-agnostic: the HTTP adapter maps POST bodies to
//! [`StreamableHttpServerTransport::handle_post`], the standing GET to
//! [`StreamableHttpServerTransport::handle_get`], and DELETE to
//! [`StreamableHttpServerTransport::handle_delete`], adding the
//! `Mcp-Session-Id` response header from [`Transport::session_id`].
//!
//! Responses are routed back onto the SSE stream opened by the POST that
//! carried the originating request; everything else rides the standalone GET
//! stream. A bounded in-memory event store supports `Last-Event-ID`
//! resumption.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use mcp_types::JSONRPCMessage;
use mcp_types::RequestId;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;
use crate::format_sse_event;

/// Events retained for replay after a dropped stream.
const EVENT_STORE_CAPACITY: usize = 1024;

/// One event on a server-issued SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSseEvent {
    pub id: String,
    pub message: JSONRPCMessage,
}

impl ServerSseEvent {
    pub fn to_wire(&self) -> Result<String, TransportError> {
        let data = serde_json::to_string(&self.message)?;
        Ok(format_sse_event(Some(&self.id), Some("message"), &data))
    }
}

/// What the adapter should answer a POST with.
pub enum PostResponse {
    /// `200` with `Content-Type: application/json`.
    Json(JSONRPCMessage),
    /// `200` with `Content-Type: text/event-stream`; drain the receiver into
    /// the response body until it ends.
    Sse(mpsc::UnboundedReceiver<ServerSseEvent>),
    /// `202 Accepted`, empty body (notifications and client responses).
    Accepted,
}

pub struct StreamableHttpServerTransport {
    core: Arc<TransportCore>,
    session_id: String,
    /// Reply to request POSTs with a plain JSON body instead of an SSE
    /// stream.
    json_response_mode: bool,
    next_event_id: AtomicU64,
    event_store: Mutex<VecDeque<(u64, JSONRPCMessage)>>,
    request_streams: Mutex<HashMap<RequestId, mpsc::UnboundedSender<ServerSseEvent>>>,
    standalone_tx: Mutex<Option<mpsc::UnboundedSender<ServerSseEvent>>>,
}

impl StreamableHttpServerTransport {
    pub fn new(json_response_mode: bool) -> Self {
        Self {
            core: Arc::new(TransportCore::new()),
            session_id: Uuid::new_v4().to_string(),
            json_response_mode,
            next_event_id: AtomicU64::new(1),
            event_store: Mutex::new(VecDeque::new()),
            request_streams: Mutex::new(HashMap::new()),
            standalone_tx: Mutex::new(None),
        }
    }

    /// Handle one POSTed envelope. `last_event_id` is the request's
    /// `Last-Event-ID` header, replayed onto the fresh response stream.
    pub async fn handle_post(
        &self,
        message: JSONRPCMessage,
        last_event_id: Option<&str>,
    ) -> Result<PostResponse, TransportError> {
        self.core.ensure_operational()?;
        match &message {
            JSONRPCMessage::Notification(_)
            | JSONRPCMessage::Response(_)
            | JSONRPCMessage::Error(_) => {
                self.core.deliver_message(message).await;
                Ok(PostResponse::Accepted)
            }
            JSONRPCMessage::Request(request) => {
                let request_id = request.id.clone();
                let (tx, mut rx) = mpsc::unbounded_channel();
                if let Some(last) = last_event_id {
                    self.replay_into(&tx, last)?;
                }
                self.request_streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(request_id, tx);
                self.core.deliver_message(message).await;

                if self.json_response_mode {
                    // Swallow interim notifications; the POST answers with
                    // the single correlated response.
                    loop {
                        match rx.recv().await {
                            Some(event) => match event.message {
                                JSONRPCMessage::Response(_) | JSONRPCMessage::Error(_) => {
                                    return Ok(PostResponse::Json(event.message));
                                }
                                _ => continue,
                            },
                            None => {
                                return Err(TransportError::Stream(
                                    "stream closed before the response was produced".to_string(),
                                ));
                            }
                        }
                    }
                }
                Ok(PostResponse::Sse(rx))
            }
        }
    }

    /// Open (or replace) the standalone server-push stream for the session's
    /// standing GET.
    pub fn handle_get(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<ServerSseEvent>, TransportError> {
        self.core.ensure_operational()?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(last) = last_event_id {
            self.replay_into(&tx, last)?;
        }
        *self
            .standalone_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    /// DELETE terminates the session.
    pub async fn handle_delete(&self) -> Result<(), TransportError> {
        self.close().await
    }

    fn replay_into(
        &self,
        tx: &mpsc::UnboundedSender<ServerSseEvent>,
        last_event_id: &str,
    ) -> Result<(), TransportError> {
        let last: u64 = last_event_id.parse().map_err(|_| {
            TransportError::InvalidMessage(format!("bad Last-Event-ID {last_event_id:?}"))
        })?;
        let store = self.event_store.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, message) in store.iter().filter(|(id, _)| *id > last) {
            let _ = tx.send(ServerSseEvent {
                id: id.to_string(),
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn record_event(&self, message: &JSONRPCMessage) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let mut store = self.event_store.lock().unwrap_or_else(PoisonError::into_inner);
        if store.len() == EVENT_STORE_CAPACITY {
            store.pop_front();
        }
        store.push_back((id, message.clone()));
        id
    }
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let id = self.record_event(&message);
        let event = ServerSseEvent {
            id: id.to_string(),
            message: message.clone(),
        };

        // Responses (and anything explicitly related to a request) belong on
        // the stream opened by that request's POST. The stream is torn down
        // once its response has been written.
        let correlated = match &options.related_request_id {
            Some(rid) => Some((rid.clone(), false)),
            None => match &message {
                JSONRPCMessage::Response(r) => Some((r.id.clone(), true)),
                JSONRPCMessage::Error(e) => Some((e.id.clone(), true)),
                _ => None,
            },
        };

        if let Some((request_id, is_final)) = correlated {
            let sender = {
                let mut streams = self
                    .request_streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if is_final {
                    streams.remove(&request_id)
                } else {
                    streams.get(&request_id).cloned()
                }
            };
            if let Some(sender) = sender {
                if sender.send(event).is_ok() {
                    return Ok(());
                }
                debug!("request stream for {request_id} is gone; using standalone stream");
            }
        }

        let standalone = self
            .standalone_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match standalone {
            Some(tx) => {
                let event = ServerSseEvent {
                    id: id.to_string(),
                    message,
                };
                if tx.send(event).is_err() {
                    // GET stream dropped; the event stays in the store for
                    // replay after the client reconnects.
                    debug!("standalone stream is gone; event {id} retained for replay");
                }
                Ok(())
            }
            None => {
                debug!("no standalone stream open; event {id} retained for replay");
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.begin_close() {
            self.request_streams
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            self.standalone_tx
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
    use mcp_types::JSONRPCRequest;
    use mcp_types::JSONRPCResponse;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(id: i64) -> JSONRPCMessage {
        JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::Integer(id),
            method: "tools/list".into(),
            params: None,
        })
    }

    fn response(id: i64) -> JSONRPCMessage {
        JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::Integer(id),
            result: json!({"tools": []}),
        })
    }

    #[tokio::test]
    async fn response_rides_the_request_stream_and_ends_it() {
        let transport = StreamableHttpServerTransport::new(false);
        transport.start().await.unwrap();
        transport.on_message(Arc::new(|_msg| Box::pin(async { Ok(()) })));

        let post = transport.handle_post(request(1), None).await.unwrap();
        let PostResponse::Sse(mut rx) = post else {
            panic!("expected SSE response");
        };

        transport
            .send(response(1), TransportSendOptions::default())
            .await
            .unwrap();
        let event = rx.recv().await.expect("response event");
        assert_eq!(event.message, response(1));
        // The response closes its request stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn notifications_ride_the_standalone_stream() {
        let transport = StreamableHttpServerTransport::new(false);
        transport.start().await.unwrap();
        let mut standalone = transport.handle_get(None).unwrap();

        let note = JSONRPCMessage::Notification(mcp_types::JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: "notifications/tools/list_changed".into(),
            params: None,
        });
        transport
            .send(note.clone(), TransportSendOptions::default())
            .await
            .unwrap();
        let event = standalone.recv().await.expect("event");
        assert_eq!(event.message, note);
    }

    #[tokio::test]
    async fn dropped_stream_replays_from_last_event_id() {
        let transport = StreamableHttpServerTransport::new(false);
        transport.start().await.unwrap();

        // No GET stream open: events accumulate in the store.
        let note = |m: &str| {
            JSONRPCMessage::Notification(mcp_types::JSONRPCNotification {
                jsonrpc: JSONRPC_VERSION.into(),
                method: m.into(),
                params: None,
            })
        };
        for method in [
            "notifications/resources/updated",
            "notifications/tools/list_changed",
            "notifications/prompts/list_changed",
        ] {
            transport
                .send(note(method), TransportSendOptions::default())
                .await
                .unwrap();
        }

        // Reconnect claiming to have seen event 1: events 2 and 3 replay.
        let mut rx = transport.handle_get(Some("1")).unwrap();
        assert_eq!(rx.recv().await.expect("event 2").id, "2");
        assert_eq!(rx.recv().await.expect("event 3").id, "3");

        assert!(transport.handle_get(Some("not-a-number")).is_err());
    }

    #[tokio::test]
    async fn json_mode_waits_for_the_response() {
        let transport = Arc::new(StreamableHttpServerTransport::new(true));
        transport.start().await.unwrap();

        // Echo-style responder wired straight onto on_message.
        {
            let transport_for_responder = transport.clone();
            let responder: MessageCallback = Arc::new(move |message| {
                let transport = transport_for_responder.clone();
                Box::pin(async move {
                    if let JSONRPCMessage::Request(req) = message {
                        let JSONRPCRequest { id, .. } = req;
                        let reply = JSONRPCMessage::Response(JSONRPCResponse {
                            jsonrpc: JSONRPC_VERSION.into(),
                            id,
                            result: json!({}),
                        });
                        // Respond from a separate task: handle_post is
                        // blocked awaiting this response.
                        tokio::spawn(async move {
                            let _ = transport
                                .send(reply, TransportSendOptions::default())
                                .await;
                        });
                    }
                    Ok(())
                })
            });
            transport.on_message(responder);
        }

        let post = transport.handle_post(request(7), None).await.unwrap();
        let PostResponse::Json(message) = post else {
            panic!("expected JSON response");
        };
        assert_eq!(message.id(), Some(&RequestId::Integer(7)));
    }
}
