//! Pluggable message pipes for MCP sessions.
//!
//! A [`Transport`] moves opaque [`JSONRPCMessage`] envelopes between two
//! peers. The protocol engine owns a transport exclusively once attached:
//! it registers callbacks, calls [`Transport::start`], and from then on the
//! transport delivers inbound envelopes through the `on_message` chain and
//! accepts outbound envelopes through [`Transport::send`].
//!
//! Concrete implementations:
//!   * [`StdioTransport`]: newline-framed JSON over stdio streams, with
//!     optional stderr supervision of a child process.
//!   * [`StreamableHttpTransport`]: POST per message with an optional SSE
//!     return stream and session resumption (client half), paired with
//!     [`StreamableHttpServerTransport`] for the server side.
//!   * [`SseClientTransport`] / [`SseServerTransport`]: the legacy
//!     GET-stream-plus-POST-back-channel flavor.
//!   * [`WebSocketTransport`]: one text frame per envelope, subprotocol
//!     `mcp`.
//!   * [`InMemoryTransport`]: a linked in-process pair for tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use mcp_types::JSONRPCMessage;
use mcp_types::RequestId;

mod error;
mod framing;
mod inmemory;
mod lifecycle;
mod sse_client;
mod sse_server;
mod stdio;
mod streamable_http;
mod streamable_http_server;
mod websocket;

pub use error::TransportError;
pub use lifecycle::TransportCore;
pub use framing::LineBuffer;
pub use framing::format_sse_event;
pub use inmemory::InMemoryTransport;
pub use sse_client::SseClientTransport;
pub use sse_server::SseServerEvent;
pub use sse_server::SseServerTransport;
pub use stdio::StderrClassifier;
pub use stdio::StderrSeverity;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpConfig;
pub use streamable_http::StreamableHttpTransport;
pub use streamable_http_server::PostResponse;
pub use streamable_http_server::ServerSseEvent;
pub use streamable_http_server::StreamableHttpServerTransport;
pub use websocket::MCP_SUBPROTOCOL;
pub use websocket::WebSocketTransport;

/// Header carrying the session identity for Streamable HTTP.
pub const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
/// Header pinning the negotiated protocol revision on HTTP requests.
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "Mcp-Protocol-Version";
/// Header replaying an SSE stream from a known position.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Async message callback. Errors are routed to the `on_error` chain and do
/// not stop the message pump.
pub type MessageCallback =
    Arc<dyn Fn(JSONRPCMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Error callback, invoked for pump-level faults that have no caller to
/// return to.
pub type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Close callback, invoked exactly once when the transport reaches `Closed`.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback receiving the latest server-issued SSE event id, usable later as
/// a resumption token.
pub type ResumptionTokenCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Per-send options. All fields are ignored by transports that have no use
/// for them.
#[derive(Clone, Default)]
pub struct TransportSendOptions {
    /// Route this message onto the SSE stream opened by the given request
    /// (Streamable HTTP server side).
    pub related_request_id: Option<RequestId>,
    /// Replay the response stream from this `Last-Event-ID`.
    pub resumption_token: Option<String>,
    /// Invoked with each server-issued event id observed while this send's
    /// response stream is live.
    pub on_resumption_token: Option<ResumptionTokenCallback>,
}

impl std::fmt::Debug for TransportSendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSendOptions")
            .field("related_request_id", &self.related_request_id)
            .field("resumption_token", &self.resumption_token)
            .field(
                "on_resumption_token",
                &self.on_resumption_token.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// A bidirectional MCP message pipe.
///
/// Lifecycle: `New → Operational → Closed`. `start` enters `Operational` and
/// fails with [`TransportError::AlreadyStarted`] on re-entry; `close` is
/// idempotent and fires the `on_close` chain exactly once. Callback
/// registration is additive: every registered callback runs, in registration
/// order. `on_message` invocations are serialized per transport; `send` is
/// safe from multiple tasks and preserves per-sender FIFO order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Make the transport operational: after `start` returns, `send` is
    /// accepted and inbound messages are delivered.
    async fn start(&self) -> Result<(), TransportError>;

    /// Enqueue one serialized envelope for delivery.
    async fn send(
        &self,
        message: JSONRPCMessage,
        options: TransportSendOptions,
    ) -> Result<(), TransportError>;

    /// Drive the transport to `Closed`, cancelling pending outbound work.
    async fn close(&self) -> Result<(), TransportError>;

    fn on_message(&self, callback: MessageCallback);

    fn on_error(&self, callback: ErrorCallback);

    fn on_close(&self, callback: CloseCallback);

    /// Session identity, for transports that have one (Streamable HTTP).
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Called once the protocol version is negotiated. Transports that carry
    /// the version out-of-band (the `Mcp-Protocol-Version` header) override
    /// this; everyone else ignores it.
    fn set_protocol_version(&self, _version: &str) {}
}

/// Convenience for the common case of sending without options.
pub async fn send_message(
    transport: &dyn Transport,
    message: JSONRPCMessage,
) -> Result<(), TransportError> {
    transport
        .send(message, TransportSendOptions::default())
        .await
}
