use std::time::Duration;

use mcp_transport::TransportError;
use thiserror::Error;

// JSON-RPC error codes used on the wire.
pub const PARSE_ERROR_CODE: i64 = -32700;
pub const INVALID_REQUEST_CODE: i64 = -32600;
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;
pub const INVALID_PARAMS_CODE: i64 = -32602;
pub const INTERNAL_ERROR_CODE: i64 = -32603;
pub const CONNECTION_CLOSED_CODE: i64 = -32000;
pub const REQUEST_TIMEOUT_CODE: i64 = -32001;

pub type Result<T> = std::result::Result<T, McpError>;

/// Errors surfaced by the protocol engine and the role APIs built on it.
#[derive(Debug, Error)]
pub enum McpError {
    /// The peer answered with a JSON-RPC error object.
    #[error("peer error {code}: {message}")]
    Peer {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the request timeout. A best-effort
    /// `notifications/cancelled` has already been sent.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The transport closed while the request was pending, or the session is
    /// not connected.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation needs a capability the relevant peer did not advertise.
    #[error("capability not supported: {0}")]
    CapabilityUnsupported(String),

    /// A caller-supplied argument was rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl McpError {
    /// The JSON-RPC `code` to use when this error is written to the wire.
    pub fn code(&self) -> i64 {
        match self {
            McpError::Peer { code, .. } => *code,
            McpError::RequestTimeout(_) => REQUEST_TIMEOUT_CODE,
            McpError::ConnectionClosed => CONNECTION_CLOSED_CODE,
            McpError::CapabilityUnsupported(_) => INVALID_REQUEST_CODE,
            McpError::InvalidArgument(_) => INVALID_PARAMS_CODE,
            McpError::Transport(e) => e.jsonrpc_code(),
            McpError::Json(_) => PARSE_ERROR_CODE,
            McpError::Internal(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Structured `data` attached to the wire error, if any. Never null:
    /// absent when there is nothing to attach.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            McpError::Peer { data, .. } => data.clone(),
            McpError::RequestTimeout(timeout) => Some(serde_json::json!({
                "timeoutMs": timeout.as_millis() as u64,
            })),
            _ => None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        McpError::Peer {
            code: INVALID_REQUEST_CODE,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        McpError::Peer {
            code: METHOD_NOT_FOUND_CODE,
            message: format!("method not found: {method}"),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_contract() {
        assert_eq!(
            McpError::RequestTimeout(Duration::from_millis(50)).code(),
            -32001
        );
        assert_eq!(McpError::ConnectionClosed.code(), -32000);
        assert_eq!(McpError::Internal("x".into()).code(), -32603);
        assert_eq!(McpError::InvalidArgument("x".into()).code(), -32602);
        assert_eq!(McpError::method_not_found("nope").code(), -32601);
    }

    #[test]
    fn timeout_data_is_an_object() {
        let data = McpError::RequestTimeout(Duration::from_millis(50))
            .data()
            .unwrap();
        assert!(data.is_object());
    }
}
