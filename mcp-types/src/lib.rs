//! Wire-level types for the Model Context Protocol (MCP).
//!
//! This crate defines the JSON-RPC 2.0 envelopes, the MCP domain types
//! exchanged inside them, and the capability descriptors both peers advertise
//! during `initialize`. Everything here is plain data: no I/O, no runtime.
//!
//! Method dispatch is typed twice over:
//!   * [`ModelContextProtocolRequest`] / [`ModelContextProtocolNotification`]
//!     are marker traits pairing a method string with its params and result
//!     types, used by callers that know the method statically.
//!   * [`ClientRequest`], [`ServerRequest`], [`ClientNotification`] and
//!     [`ServerNotification`] are dispatch enums for receivers that must
//!     branch on the method at runtime.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

mod capabilities;
mod completion;
mod content;
mod elicitation;
mod initialize;
mod logging;
mod meta;
mod notifications;
mod prompts;
mod resources;
mod roots;
mod sampling;
mod tools;

pub use capabilities::*;
pub use completion::*;
pub use content::*;
pub use elicitation::*;
pub use initialize::*;
pub use logging::*;
pub use meta::*;
pub use notifications::*;
pub use prompts::*;
pub use resources::*;
pub use roots::*;
pub use sampling::*;
pub use tools::*;

pub const JSONRPC_VERSION: &str = "2.0";

/// Most recent protocol revision this SDK speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// All revisions the SDK will negotiate, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Result payload of a successful JSON-RPC response. MCP responses are always
/// JSON objects, but the envelope does not constrain them further.
pub type Result = serde_json::Value;

/// Pairs a request method with its params/result types so call sites can be
/// checked at compile time.
pub trait ModelContextProtocolRequest {
    const METHOD: &'static str;
    type Params: DeserializeOwned + Serialize + Send + Sync + fmt::Debug;
    type Result: DeserializeOwned + Serialize + Send + Sync + fmt::Debug;
}

/// Like [`ModelContextProtocolRequest`], but for fire-and-forget
/// notifications.
pub trait ModelContextProtocolNotification {
    const METHOD: &'static str;
    type Params: DeserializeOwned + Serialize + Send + Sync + fmt::Debug;
}

/// Unique identifier for an in-flight request. Either peer may use integers
/// or strings; ids are never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Integer(i) => write!(f, "{i}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Integer(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// A progress token is the request id the sender registered its progress
/// callback under.
pub type ProgressToken = RequestId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCErrorError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A single JSON-RPC envelope. The variant order doubles as the envelope
/// discriminator: `id` + `method` is a request, `method` alone a
/// notification, `id` + `result` a success response, `id` + `error` an error
/// response. Anything else fails to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Notification(JSONRPCNotification),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
}

impl JSONRPCMessage {
    /// The request id carried by this envelope, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JSONRPCMessage::Request(r) => Some(&r.id),
            JSONRPCMessage::Notification(_) => None,
            JSONRPCMessage::Response(r) => Some(&r.id),
            JSONRPCMessage::Error(e) => Some(&e.id),
        }
    }
}

impl From<JSONRPCRequest> for JSONRPCMessage {
    fn from(value: JSONRPCRequest) -> Self {
        JSONRPCMessage::Request(value)
    }
}

impl From<JSONRPCNotification> for JSONRPCMessage {
    fn from(value: JSONRPCNotification) -> Self {
        JSONRPCMessage::Notification(value)
    }
}

impl From<JSONRPCResponse> for JSONRPCMessage {
    fn from(value: JSONRPCResponse) -> Self {
        JSONRPCMessage::Response(value)
    }
}

impl From<JSONRPCError> for JSONRPCMessage {
    fn from(value: JSONRPCError) -> Self {
        JSONRPCMessage::Error(value)
    }
}

/// Deserialize the params of a typed method, treating an absent `params`
/// field as JSON `null` so `Option` params types accept it.
fn parse_params<P: DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> std::result::Result<P, serde_json::Error> {
    serde_json::from_value(params.unwrap_or(serde_json::Value::Null))
}

macro_rules! request_marker {
    ($name:ident, $method:literal, $params:ty, $result:ty) => {
        #[derive(Debug)]
        pub enum $name {}

        impl ModelContextProtocolRequest for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
            type Result = $result;
        }
    };
}

macro_rules! notification_marker {
    ($name:ident, $method:literal, $params:ty) => {
        #[derive(Debug)]
        pub enum $name {}

        impl ModelContextProtocolNotification for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
        }
    };
}

// Requests handled by servers.
request_marker!(
    InitializeRequest,
    "initialize",
    InitializeRequestParams,
    InitializeResult
);
request_marker!(PingRequest, "ping", Option<serde_json::Value>, EmptyResult);
request_marker!(
    ListToolsRequest,
    "tools/list",
    Option<ListToolsRequestParams>,
    ListToolsResult
);
request_marker!(
    CallToolRequest,
    "tools/call",
    CallToolRequestParams,
    CallToolResult
);
request_marker!(
    ListPromptsRequest,
    "prompts/list",
    Option<ListPromptsRequestParams>,
    ListPromptsResult
);
request_marker!(
    GetPromptRequest,
    "prompts/get",
    GetPromptRequestParams,
    GetPromptResult
);
request_marker!(
    ListResourcesRequest,
    "resources/list",
    Option<ListResourcesRequestParams>,
    ListResourcesResult
);
request_marker!(
    ListResourceTemplatesRequest,
    "resources/templates/list",
    Option<ListResourceTemplatesRequestParams>,
    ListResourceTemplatesResult
);
request_marker!(
    ReadResourceRequest,
    "resources/read",
    ReadResourceRequestParams,
    ReadResourceResult
);
request_marker!(
    SubscribeRequest,
    "resources/subscribe",
    SubscribeRequestParams,
    EmptyResult
);
request_marker!(
    UnsubscribeRequest,
    "resources/unsubscribe",
    UnsubscribeRequestParams,
    EmptyResult
);
request_marker!(
    CompleteRequest,
    "completion/complete",
    CompleteRequestParams,
    CompleteResult
);
request_marker!(
    SetLevelRequest,
    "logging/setLevel",
    SetLevelRequestParams,
    EmptyResult
);

// Requests handled by clients.
request_marker!(
    CreateMessageRequest,
    "sampling/createMessage",
    CreateMessageRequestParams,
    CreateMessageResult
);
request_marker!(
    ListRootsRequest,
    "roots/list",
    Option<serde_json::Value>,
    ListRootsResult
);
request_marker!(
    ElicitRequest,
    "elicitation/create",
    ElicitRequestParams,
    ElicitResult
);

// Notifications sent by clients.
notification_marker!(
    InitializedNotification,
    "notifications/initialized",
    Option<serde_json::Value>
);
notification_marker!(
    RootsListChangedNotification,
    "notifications/roots/list_changed",
    Option<serde_json::Value>
);

// Notifications sent by either peer.
notification_marker!(
    CancelledNotification,
    "notifications/cancelled",
    CancelledNotificationParams
);
notification_marker!(
    ProgressNotification,
    "notifications/progress",
    ProgressNotificationParams
);

// Notifications sent by servers.
notification_marker!(
    LoggingMessageNotification,
    "notifications/message",
    LoggingMessageNotificationParams
);
notification_marker!(
    ToolListChangedNotification,
    "notifications/tools/list_changed",
    Option<serde_json::Value>
);
notification_marker!(
    PromptListChangedNotification,
    "notifications/prompts/list_changed",
    Option<serde_json::Value>
);
notification_marker!(
    ResourceListChangedNotification,
    "notifications/resources/list_changed",
    Option<serde_json::Value>
);
notification_marker!(
    ResourceUpdatedNotification,
    "notifications/resources/updated",
    ResourceUpdatedNotificationParams
);

/// Result of requests that carry no payload (`ping`, `resources/subscribe`,
/// ...). Serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyResult {}

/// A request a server can receive, parsed into its typed params.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    InitializeRequest(InitializeRequestParams),
    PingRequest(Option<serde_json::Value>),
    ListToolsRequest(Option<ListToolsRequestParams>),
    CallToolRequest(CallToolRequestParams),
    ListPromptsRequest(Option<ListPromptsRequestParams>),
    GetPromptRequest(GetPromptRequestParams),
    ListResourcesRequest(Option<ListResourcesRequestParams>),
    ListResourceTemplatesRequest(Option<ListResourceTemplatesRequestParams>),
    ReadResourceRequest(ReadResourceRequestParams),
    SubscribeRequest(SubscribeRequestParams),
    UnsubscribeRequest(UnsubscribeRequestParams),
    CompleteRequest(CompleteRequestParams),
    SetLevelRequest(SetLevelRequestParams),
}

/// Error produced when a [`JSONRPCRequest`] or [`JSONRPCNotification`] does
/// not correspond to a known method, or its params fail to parse.
#[derive(Debug, thiserror::Error)]
pub enum TryFromMessageError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TryFromMessageError {
    fn invalid_params(method: &str, source: serde_json::Error) -> Self {
        TryFromMessageError::InvalidParams {
            method: method.to_string(),
            source,
        }
    }
}

impl TryFrom<JSONRPCRequest> for ClientRequest {
    type Error = TryFromMessageError;

    fn try_from(req: JSONRPCRequest) -> std::result::Result<Self, Self::Error> {
        let JSONRPCRequest { method, params, .. } = req;
        let parse_err = |e| TryFromMessageError::invalid_params(&method, e);
        let request = match method.as_str() {
            InitializeRequest::METHOD => {
                ClientRequest::InitializeRequest(parse_params(params).map_err(parse_err)?)
            }
            PingRequest::METHOD => {
                ClientRequest::PingRequest(parse_params(params).map_err(parse_err)?)
            }
            ListToolsRequest::METHOD => {
                ClientRequest::ListToolsRequest(parse_params(params).map_err(parse_err)?)
            }
            CallToolRequest::METHOD => {
                ClientRequest::CallToolRequest(parse_params(params).map_err(parse_err)?)
            }
            ListPromptsRequest::METHOD => {
                ClientRequest::ListPromptsRequest(parse_params(params).map_err(parse_err)?)
            }
            GetPromptRequest::METHOD => {
                ClientRequest::GetPromptRequest(parse_params(params).map_err(parse_err)?)
            }
            ListResourcesRequest::METHOD => {
                ClientRequest::ListResourcesRequest(parse_params(params).map_err(parse_err)?)
            }
            ListResourceTemplatesRequest::METHOD => ClientRequest::ListResourceTemplatesRequest(
                parse_params(params).map_err(parse_err)?,
            ),
            ReadResourceRequest::METHOD => {
                ClientRequest::ReadResourceRequest(parse_params(params).map_err(parse_err)?)
            }
            SubscribeRequest::METHOD => {
                ClientRequest::SubscribeRequest(parse_params(params).map_err(parse_err)?)
            }
            UnsubscribeRequest::METHOD => {
                ClientRequest::UnsubscribeRequest(parse_params(params).map_err(parse_err)?)
            }
            CompleteRequest::METHOD => {
                ClientRequest::CompleteRequest(parse_params(params).map_err(parse_err)?)
            }
            SetLevelRequest::METHOD => {
                ClientRequest::SetLevelRequest(parse_params(params).map_err(parse_err)?)
            }
            _ => return Err(TryFromMessageError::UnknownMethod(method.clone())),
        };
        Ok(request)
    }
}

/// A request a client can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    PingRequest(Option<serde_json::Value>),
    CreateMessageRequest(CreateMessageRequestParams),
    ListRootsRequest(Option<serde_json::Value>),
    ElicitRequest(ElicitRequestParams),
}

impl TryFrom<JSONRPCRequest> for ServerRequest {
    type Error = TryFromMessageError;

    fn try_from(req: JSONRPCRequest) -> std::result::Result<Self, Self::Error> {
        let JSONRPCRequest { method, params, .. } = req;
        let parse_err = |e| TryFromMessageError::invalid_params(&method, e);
        let request = match method.as_str() {
            PingRequest::METHOD => {
                ServerRequest::PingRequest(parse_params(params).map_err(parse_err)?)
            }
            CreateMessageRequest::METHOD => {
                ServerRequest::CreateMessageRequest(parse_params(params).map_err(parse_err)?)
            }
            ListRootsRequest::METHOD => {
                ServerRequest::ListRootsRequest(parse_params(params).map_err(parse_err)?)
            }
            ElicitRequest::METHOD => {
                ServerRequest::ElicitRequest(parse_params(params).map_err(parse_err)?)
            }
            _ => return Err(TryFromMessageError::UnknownMethod(method.clone())),
        };
        Ok(request)
    }
}

/// A notification a server can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    InitializedNotification(Option<serde_json::Value>),
    CancelledNotification(CancelledNotificationParams),
    ProgressNotification(ProgressNotificationParams),
    RootsListChangedNotification(Option<serde_json::Value>),
}

impl TryFrom<JSONRPCNotification> for ClientNotification {
    type Error = TryFromMessageError;

    fn try_from(n: JSONRPCNotification) -> std::result::Result<Self, Self::Error> {
        let JSONRPCNotification { method, params, .. } = n;
        let parse_err = |e| TryFromMessageError::invalid_params(&method, e);
        let notification = match method.as_str() {
            InitializedNotification::METHOD => {
                ClientNotification::InitializedNotification(parse_params(params).map_err(parse_err)?)
            }
            CancelledNotification::METHOD => {
                ClientNotification::CancelledNotification(parse_params(params).map_err(parse_err)?)
            }
            ProgressNotification::METHOD => {
                ClientNotification::ProgressNotification(parse_params(params).map_err(parse_err)?)
            }
            RootsListChangedNotification::METHOD => ClientNotification::RootsListChangedNotification(
                parse_params(params).map_err(parse_err)?,
            ),
            _ => return Err(TryFromMessageError::UnknownMethod(method.clone())),
        };
        Ok(notification)
    }
}

/// A notification a client can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    CancelledNotification(CancelledNotificationParams),
    ProgressNotification(ProgressNotificationParams),
    LoggingMessageNotification(LoggingMessageNotificationParams),
    ToolListChangedNotification(Option<serde_json::Value>),
    PromptListChangedNotification(Option<serde_json::Value>),
    ResourceListChangedNotification(Option<serde_json::Value>),
    ResourceUpdatedNotification(ResourceUpdatedNotificationParams),
}

impl TryFrom<JSONRPCNotification> for ServerNotification {
    type Error = TryFromMessageError;

    fn try_from(n: JSONRPCNotification) -> std::result::Result<Self, Self::Error> {
        let JSONRPCNotification { method, params, .. } = n;
        let parse_err = |e| TryFromMessageError::invalid_params(&method, e);
        let notification = match method.as_str() {
            CancelledNotification::METHOD => {
                ServerNotification::CancelledNotification(parse_params(params).map_err(parse_err)?)
            }
            ProgressNotification::METHOD => {
                ServerNotification::ProgressNotification(parse_params(params).map_err(parse_err)?)
            }
            LoggingMessageNotification::METHOD => ServerNotification::LoggingMessageNotification(
                parse_params(params).map_err(parse_err)?,
            ),
            ToolListChangedNotification::METHOD => ServerNotification::ToolListChangedNotification(
                parse_params(params).map_err(parse_err)?,
            ),
            PromptListChangedNotification::METHOD => {
                ServerNotification::PromptListChangedNotification(
                    parse_params(params).map_err(parse_err)?,
                )
            }
            ResourceListChangedNotification::METHOD => {
                ServerNotification::ResourceListChangedNotification(
                    parse_params(params).map_err(parse_err)?,
                )
            }
            ResourceUpdatedNotification::METHOD => {
                ServerNotification::ResourceUpdatedNotification(
                    parse_params(params).map_err(parse_err)?,
                )
            }
            _ => return Err(TryFromMessageError::UnknownMethod(method.clone())),
        };
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn envelope_discrimination() {
        let request: JSONRPCMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
                .expect("request");
        assert!(matches!(request, JSONRPCMessage::Request(_)));

        let notification: JSONRPCMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .expect("notification");
        assert!(matches!(notification, JSONRPCMessage::Notification(_)));

        let response: JSONRPCMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "a", "result": {}}))
                .expect("response");
        assert!(matches!(response, JSONRPCMessage::Response(_)));

        let error: JSONRPCMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "nope"}}),
        )
        .expect("error");
        assert!(matches!(error, JSONRPCMessage::Error(_)));

        // Neither request nor response shaped.
        assert!(serde_json::from_value::<JSONRPCMessage>(json!({"jsonrpc": "2.0"})).is_err());
    }

    #[test]
    fn request_id_round_trip() {
        let int_id: RequestId = serde_json::from_value(json!(7)).expect("int id");
        assert_eq!(int_id, RequestId::Integer(7));
        assert_eq!(serde_json::to_value(&int_id).expect("to_value"), json!(7));

        let str_id: RequestId = serde_json::from_value(json!("req-7")).expect("str id");
        assert_eq!(str_id, RequestId::String("req-7".to_string()));
        assert_eq!(
            serde_json::to_value(&str_id).expect("to_value"),
            json!("req-7")
        );
    }

    #[test]
    fn client_request_from_unknown_method() {
        let req = JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::Integer(1),
            method: "tools/destroy".into(),
            params: None,
        };
        assert!(matches!(
            ClientRequest::try_from(req),
            Err(TryFromMessageError::UnknownMethod(m)) if m == "tools/destroy"
        ));
    }

    #[test]
    fn notification_params_absent_parses_as_none() {
        let n = JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: "notifications/initialized".into(),
            params: None,
        };
        let parsed = ClientNotification::try_from(n).expect("parse");
        assert_eq!(parsed, ClientNotification::InitializedNotification(None));
    }
}
