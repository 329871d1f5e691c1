//! WebSocket transport: one text frame per envelope, subprotocol `mcp`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use mcp_types::JSONRPCMessage;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;

pub const MCP_SUBPROTOCOL: &str = "mcp";

/// Frames above this size are rejected rather than parsed.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CHANNEL_CAPACITY: usize = 128;

enum Outbound {
    Frame(String),
}

/// Works over any WebSocket stream: `connect` for clients,
/// [`WebSocketTransport::from_stream`] for server-accepted sockets.
pub struct WebSocketTransport<S> {
    core: Arc<TransportCore>,
    stream: Mutex<Option<WebSocketStream<S>>>,
    outgoing_tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    shutdown: CancellationToken,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Dial `url` (`ws://` or `wss://`), negotiating the `mcp` subprotocol.
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(MCP_SUBPROTOCOL),
        );
        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self::from_stream(stream))
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn from_stream(stream: WebSocketStream<S>) -> Self {
        Self {
            core: Arc::new(TransportCore::new()),
            stream: Mutex::new(Some(stream)),
            outgoing_tx: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()?;
        let Some(stream) = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(TransportError::SendFailed(
                "websocket stream already consumed".to_string(),
            ));
        };
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        *self
            .outgoing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outgoing_tx);
        tokio::spawn(run_frame_pump(
            stream,
            outgoing_rx,
            self.core.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        _options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let json = serde_json::to_string(&message)?;
        let tx = self
            .outgoing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotStarted)?;
        tx.send(Outbound::Frame(json))
            .await
            .map_err(|_| TransportError::SendFailed("frame pump is gone".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.begin_close() {
            // The pump sends a Close frame on its way out.
            self.shutdown.cancel();
            self.outgoing_tx
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
}

async fn run_frame_pump<S>(
    stream: WebSocketStream<S>,
    mut outgoing_rx: mpsc::Receiver<Outbound>,
    core: Arc<TransportCore>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = stream.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outbound = outgoing_rx.recv() => match outbound {
                Some(Outbound::Frame(json)) => {
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        core.deliver_error(&TransportError::WebSocket(e));
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        core.deliver_error(&TransportError::MessageTooLarge {
                            size: text.len(),
                            limit: MAX_FRAME_BYTES,
                        });
                        continue;
                    }
                    match serde_json::from_str::<JSONRPCMessage>(&text) {
                        Ok(message) => core.deliver_message(message).await,
                        Err(e) => core.deliver_error(&TransportError::InvalidMessage(
                            format!("{e}; frame = {text}"),
                        )),
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    core.deliver_error(&TransportError::InvalidMessage(
                        "binary frames are not part of the mcp subprotocol".to_string(),
                    ));
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("peer sent a close frame");
                    break;
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    core.deliver_error(&TransportError::WebSocket(e));
                    break;
                }
                None => break,
            },
        }
    }
    if core.begin_close() {
        shutdown.cancel();
        core.fire_close();
    }
}
