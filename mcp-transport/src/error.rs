use thiserror::Error;

/// Errors surfaced by transports, either as the return value of
/// `start`/`send`/`close` or through the `on_error` callback chain.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `start` was called a second time.
    #[error("transport already started")]
    AlreadyStarted,

    /// `send` was called before `start`.
    #[error("transport not started")]
    NotStarted,

    /// `send` was called after the transport reached `Closed`.
    #[error("transport closed")]
    Closed,

    /// The message could not be handed to the writer side.
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Non-2xx HTTP status, body attached.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error(transparent)]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// An inbound line or frame was not a valid JSON-RPC envelope.
    #[error("malformed message: {0}")]
    InvalidMessage(String),

    /// An SSE `event: error` payload or a broken event stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// A WebSocket frame exceeded the per-frame limit.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The stderr supervisor classified a line as fatal.
    #[error("fatal stderr output: {0}")]
    FatalStderr(String),

    /// A registered message callback returned an error.
    #[error("message callback failed: {0}")]
    Callback(String),
}

impl TransportError {
    /// The JSON-RPC error code this transport failure maps to when it has to
    /// be reported on the wire (`-32000 ConnectionClosed` unless a more
    /// specific code applies).
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            TransportError::InvalidMessage(_) => -32700,
            _ => -32000,
        }
    }
}
