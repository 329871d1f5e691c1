//! Protocol engine shared by the MCP client and server roles.
//!
//! [`Protocol`] owns one transport and provides request/response correlation,
//! progress-token plumbing, timeouts with peer-visible cancellation, handler
//! registries, and the capability gate. The role crates (`mcp-client`,
//! `mcp-server`) layer typed method surfaces and capability tables on top.

mod engine;
mod error;

pub use engine::AllowAllCapabilities;
pub use engine::CapabilityCheck;
pub use engine::CloseHook;
pub use engine::DEFAULT_REQUEST_TIMEOUT;
pub use engine::ErrorHook;
pub use engine::NotificationHandler;
pub use engine::Peer;
pub use engine::ProgressCallback;
pub use engine::Protocol;
pub use engine::ProtocolOptions;
pub use engine::RequestContext;
pub use engine::RequestHandler;
pub use engine::RequestOptions;
pub use error::CONNECTION_CLOSED_CODE;
pub use error::INTERNAL_ERROR_CODE;
pub use error::INVALID_PARAMS_CODE;
pub use error::INVALID_REQUEST_CODE;
pub use error::METHOD_NOT_FOUND_CODE;
pub use error::McpError;
pub use error::PARSE_ERROR_CODE;
pub use error::REQUEST_TIMEOUT_CODE;
pub use error::Result;
