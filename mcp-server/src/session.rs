//! Per-transport server sessions.
//!
//! A session owns one protocol engine, answers the built-in MCP methods from
//! the shared registries, and tracks per-session state: initialization,
//! negotiated protocol version, logging level, and resource subscriptions.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use mcp_protocol::CapabilityCheck;
use mcp_protocol::McpError;
use mcp_protocol::Protocol;
use mcp_protocol::ProtocolOptions;
use mcp_protocol::RequestContext;
use mcp_protocol::RequestOptions;
use mcp_protocol::Result;
use mcp_transport::Transport;
use mcp_types::CallToolRequestParams;
use mcp_types::ClientCapabilities;
use mcp_types::CompleteCompletion;
use mcp_types::CompleteRequestParams;
use mcp_types::CompleteResult;
use mcp_types::CreateMessageRequest;
use mcp_types::CreateMessageRequestParams;
use mcp_types::CreateMessageResult;
use mcp_types::ElicitRequest;
use mcp_types::ElicitRequestParams;
use mcp_types::ElicitResult;
use mcp_types::EmptyResult;
use mcp_types::GetPromptRequestParams;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::JSONRPCRequest;
use mcp_types::ListPromptsResult;
use mcp_types::ListResourceTemplatesResult;
use mcp_types::ListResourcesResult;
use mcp_types::ListRootsRequest;
use mcp_types::ListRootsResult;
use mcp_types::ListToolsResult;
use mcp_types::LoggingLevel;
use mcp_types::LoggingMessageNotification;
use mcp_types::LoggingMessageNotificationParams;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::PingRequest;
use mcp_types::PromptListChangedNotification;
use mcp_types::ReadResourceRequestParams;
use mcp_types::RequestId;
use mcp_types::ResourceListChangedNotification;
use mcp_types::ResourceUpdatedNotification;
use mcp_types::ResourceUpdatedNotificationParams;
use mcp_types::SUPPORTED_PROTOCOL_VERSIONS;
use mcp_types::SetLevelRequestParams;
use mcp_types::SubscribeRequestParams;
use mcp_types::ToolListChangedNotification;
use mcp_types::UnsubscribeRequestParams;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ServerInner;
use crate::ServerOptions;
use crate::unknown_entity;

#[derive(Default)]
struct SessionState {
    initialized: bool,
    client_capabilities: Option<ClientCapabilities>,
    client_info: Option<Implementation>,
    negotiated_version: Option<String>,
    /// Minimum level for `notifications/message`; everything below is
    /// dropped before serialization.
    logging_level: Option<LoggingLevel>,
    subscriptions: HashSet<String>,
}

pub(crate) struct SessionShared {
    pub(crate) protocol: Protocol,
    server: Weak<ServerInner>,
    state: Mutex<SessionState>,
}

impl SessionShared {
    fn server(&self) -> Result<Arc<ServerInner>> {
        self.server.upgrade().ok_or(McpError::ConnectionClosed)
    }

    fn ensure_initialized(&self) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.initialized {
            Ok(())
        } else {
            Err(McpError::invalid_request(
                "received a request before initialization completed",
            ))
        }
    }

    /// Whether `logging/setLevel` filters this level out.
    fn below_logging_level(&self, level: LoggingLevel) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(state.logging_level, Some(minimum) if level < minimum)
    }
}

/// Capability assertions for the server side of the gate.
struct ServerGate {
    options: ServerOptions,
    shared: Weak<SessionShared>,
}

impl CapabilityCheck for ServerGate {
    fn assert_capability_for_method(&self, method: &str) -> Result<()> {
        let client = self
            .shared
            .upgrade()
            .and_then(|shared| {
                shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .client_capabilities
                    .clone()
            })
            .unwrap_or_default();
        let allowed = match method {
            "sampling/createMessage" => client.sampling.is_some(),
            "roots/list" => client.roots.is_some(),
            "elicitation/create" => client.elicitation.is_some(),
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(McpError::CapabilityUnsupported(format!(
                "client did not advertise the capability required for {method}"
            )))
        }
    }

    fn assert_notification_capability(&self, method: &str) -> Result<()> {
        let capabilities = &self.options.capabilities;
        let allowed = match method {
            "notifications/message" => capabilities.logging.is_some(),
            "notifications/resources/updated" => capabilities.resources.is_some(),
            "notifications/tools/list_changed" => capabilities.tools_list_changed(),
            "notifications/prompts/list_changed" => capabilities.prompts_list_changed(),
            "notifications/resources/list_changed" => capabilities.resources_list_changed(),
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(McpError::CapabilityUnsupported(format!(
                "server did not advertise the capability required to send {method}"
            )))
        }
    }

    fn assert_request_handler_capability(&self, method: &str) -> Result<()> {
        let capabilities = &self.options.capabilities;
        let allowed = match method {
            "initialize" | "ping" => true,
            "resources/subscribe" | "resources/unsubscribe" => capabilities.resources_subscribe(),
            m if m.starts_with("tools/") => capabilities.tools.is_some(),
            m if m.starts_with("prompts/") => capabilities.prompts.is_some(),
            m if m.starts_with("resources/") => capabilities.resources.is_some(),
            "completion/complete" => capabilities.completions.is_some(),
            "logging/setLevel" => capabilities.logging.is_some(),
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(McpError::CapabilityUnsupported(format!(
                "server does not support {method}"
            )))
        }
    }
}

/// Extra context handed to tool/prompt/resource/completion handlers.
#[derive(Clone)]
pub struct RequestHandlerExtra {
    ctx: RequestContext,
    session: Weak<SessionShared>,
}

impl RequestHandlerExtra {
    pub fn request_id(&self) -> &RequestId {
        &self.ctx.request_id
    }

    /// Cancelled when the caller sends `notifications/cancelled` or the
    /// session goes down. Long handlers should poll it at natural points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.ctx.cancellation
    }

    pub fn meta(&self) -> Option<&serde_json::Value> {
        self.ctx.meta.as_ref()
    }

    /// Emit `notifications/progress` against the caller's progress token;
    /// a no-op when the caller did not opt in.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        self.ctx.report_progress(progress, total, message).await
    }

    /// Emit `notifications/message` through the enclosing session, honoring
    /// its logging level. The notification is related to the incoming
    /// request so HTTP server transports keep it on the request's stream.
    pub async fn send_logging_message(
        &self,
        level: LoggingLevel,
        logger: Option<String>,
        data: serde_json::Value,
    ) -> Result<()> {
        let Some(shared) = self.session.upgrade() else {
            return Err(McpError::ConnectionClosed);
        };
        if shared.below_logging_level(level) {
            return Ok(());
        }
        shared
            .protocol
            .notify_with_options::<LoggingMessageNotification>(
                LoggingMessageNotificationParams {
                    level,
                    logger,
                    data,
                },
                mcp_transport::TransportSendOptions {
                    related_request_id: Some(self.ctx.request_id.clone()),
                    ..Default::default()
                },
            )
            .await
    }

    pub fn session(&self) -> Option<ServerSession> {
        self.session
            .upgrade()
            .map(|shared| ServerSession { shared })
    }
}

/// One connected session. Cloning shares the session.
#[derive(Clone)]
pub struct ServerSession {
    shared: Arc<SessionShared>,
}

impl ServerSession {
    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn is_initialized(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .initialized
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .client_capabilities
            .clone()
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .client_info
            .clone()
    }

    pub fn negotiated_protocol_version(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .negotiated_version
            .clone()
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .contains(uri)
    }

    pub fn on_error(&self, hook: mcp_protocol::ErrorHook) {
        self.shared.protocol.on_error(hook);
    }

    pub fn on_close(&self, hook: mcp_protocol::CloseHook) {
        self.shared.protocol.on_close(hook);
    }

    pub async fn ping(&self) -> Result<()> {
        let _: EmptyResult = self
            .shared
            .protocol
            .request::<PingRequest>(None, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Ask the client to sample its model. Requires the client `sampling`
    /// capability.
    pub async fn create_message(
        &self,
        params: CreateMessageRequestParams,
    ) -> Result<CreateMessageResult> {
        self.assert_client_capability(CreateMessageRequest::METHOD)?;
        self.shared
            .protocol
            .request::<CreateMessageRequest>(params, RequestOptions::default())
            .await
    }

    /// List the client's filesystem roots. Requires the client `roots`
    /// capability.
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        self.assert_client_capability(ListRootsRequest::METHOD)?;
        self.shared
            .protocol
            .request::<ListRootsRequest>(None, RequestOptions::default())
            .await
    }

    /// Ask the user (via the client) for structured input. Requires the
    /// client `elicitation` capability.
    pub async fn elicit(&self, params: ElicitRequestParams) -> Result<ElicitResult> {
        self.assert_client_capability(ElicitRequest::METHOD)?;
        self.shared
            .protocol
            .request::<ElicitRequest>(params, RequestOptions::default())
            .await
    }

    /// Emit `notifications/message`, honoring the session's
    /// `logging/setLevel` filter.
    pub async fn send_logging_message(
        &self,
        level: LoggingLevel,
        logger: Option<String>,
        data: serde_json::Value,
    ) -> Result<()> {
        if self.shared.below_logging_level(level) {
            return Ok(());
        }
        self.shared
            .protocol
            .notify::<LoggingMessageNotification>(LoggingMessageNotificationParams {
                level,
                logger,
                data,
            })
            .await
    }

    pub async fn send_tool_list_changed(&self) -> Result<()> {
        self.shared
            .protocol
            .notify::<ToolListChangedNotification>(None)
            .await
    }

    pub async fn send_prompt_list_changed(&self) -> Result<()> {
        self.shared
            .protocol
            .notify::<PromptListChangedNotification>(None)
            .await
    }

    pub async fn send_resource_list_changed(&self) -> Result<()> {
        self.shared
            .protocol
            .notify::<ResourceListChangedNotification>(None)
            .await
    }

    pub async fn send_resource_updated(&self, uri: &str) -> Result<()> {
        self.shared
            .protocol
            .notify::<ResourceUpdatedNotification>(ResourceUpdatedNotificationParams {
                uri: uri.to_string(),
            })
            .await
    }

    /// React to the client's `notifications/roots/list_changed`.
    pub fn on_roots_list_changed(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.shared.protocol.set_notification_handler(
            "notifications/roots/list_changed",
            Arc::new(move |_notification| {
                let callback = callback.clone();
                Box::pin(async move {
                    callback();
                })
            }),
        );
    }

    pub async fn close(&self) -> Result<()> {
        self.shared.protocol.close().await
    }

    fn assert_client_capability(&self, method: &str) -> Result<()> {
        let client = self
            .client_capabilities()
            .ok_or_else(|| McpError::invalid_request("session is not initialized"))?;
        let allowed = match method {
            "sampling/createMessage" => client.sampling.is_some(),
            "roots/list" => client.roots.is_some(),
            "elicitation/create" => client.elicitation.is_some(),
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(McpError::CapabilityUnsupported(format!(
                "client did not advertise the capability required for {method}"
            )))
        }
    }
}

/// Wire a new session: engine, gate, built-in handlers, transport.
pub(crate) async fn build_session(
    server: Arc<ServerInner>,
    transport: Arc<dyn Transport>,
) -> Result<ServerSession> {
    let protocol = Protocol::new(ProtocolOptions {
        enforce_strict_capabilities: server.options.enforce_strict_capabilities,
        default_request_timeout: server.options.default_request_timeout,
    });
    let shared = Arc::new(SessionShared {
        protocol: protocol.clone(),
        server: Arc::downgrade(&server),
        state: Mutex::new(SessionState::default()),
    });
    protocol.set_capability_check(Arc::new(ServerGate {
        options: server.options.clone(),
        shared: Arc::downgrade(&shared),
    }));
    register_handlers(&shared);
    protocol.connect(transport).await?;
    Ok(ServerSession { shared })
}

fn register_handlers(shared: &Arc<SessionShared>) {
    let protocol = &shared.protocol;

    macro_rules! handler {
        ($method:expr, $f:ident) => {{
            let weak = Arc::downgrade(shared);
            protocol.set_request_handler(
                $method,
                Arc::new(move |request, ctx| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let shared = weak.upgrade().ok_or(McpError::ConnectionClosed)?;
                        $f(shared, request, ctx).await
                    })
                }),
            );
        }};
    }

    handler!("initialize", handle_initialize);
    handler!("ping", handle_ping);
    handler!("tools/list", handle_list_tools);
    handler!("tools/call", handle_call_tool);
    handler!("prompts/list", handle_list_prompts);
    handler!("prompts/get", handle_get_prompt);
    handler!("resources/list", handle_list_resources);
    handler!("resources/templates/list", handle_list_resource_templates);
    handler!("resources/read", handle_read_resource);
    handler!("resources/subscribe", handle_subscribe);
    handler!("resources/unsubscribe", handle_unsubscribe);
    handler!("completion/complete", handle_complete);
    handler!("logging/setLevel", handle_set_level);

    let weak = Arc::downgrade(shared);
    protocol.set_notification_handler(
        "notifications/initialized",
        Arc::new(move |_notification| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .initialized = true;
                    debug!("session is ready");
                }
            })
        }),
    );
}

fn parse<P: serde::de::DeserializeOwned>(request: JSONRPCRequest) -> Result<P> {
    serde_json::from_value(request.params.unwrap_or(serde_json::Value::Null)).map_err(|e| {
        McpError::Peer {
            code: mcp_protocol::INVALID_PARAMS_CODE,
            message: format!("invalid params: {e}"),
            data: None,
        }
    })
}

fn extra(shared: &Arc<SessionShared>, ctx: RequestContext) -> RequestHandlerExtra {
    RequestHandlerExtra {
        ctx,
        session: Arc::downgrade(shared),
    }
}

async fn handle_initialize(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    let params: InitializeRequestParams = parse(request)?;
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
        return Err(McpError::Peer {
            code: mcp_protocol::INVALID_REQUEST_CODE,
            message: format!(
                "unsupported protocol version {:?}",
                params.protocol_version
            ),
            data: Some(serde_json::json!({
                "supported": SUPPORTED_PROTOCOL_VERSIONS,
                "requested": params.protocol_version,
            })),
        });
    }
    let InitializeRequestParams {
        capabilities,
        client_info,
        protocol_version,
    } = params;
    debug!(
        "initialize from {} {} (protocol {protocol_version})",
        client_info.name, client_info.version
    );

    let server = shared.server()?;
    {
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.client_capabilities = Some(capabilities);
        state.client_info = Some(client_info);
        state.negotiated_version = Some(protocol_version.clone());
    }

    Ok(serde_json::to_value(InitializeResult {
        capabilities: server.options.capabilities.clone(),
        instructions: server.options.instructions.clone(),
        protocol_version,
        server_info: server.server_info.clone(),
    })?)
}

async fn handle_ping(
    _shared: Arc<SessionShared>,
    _request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    Ok(serde_json::json!({}))
}

async fn handle_list_tools(
    shared: Arc<SessionShared>,
    _request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let server = shared.server()?;
    let snapshot = server.tools.read().unwrap_or_else(PoisonError::into_inner).clone();
    let mut tools: Vec<_> = snapshot.values().map(|t| t.tool.clone()).collect();
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(serde_json::to_value(ListToolsResult {
        tools,
        next_cursor: None,
    })?)
}

async fn handle_call_tool(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: CallToolRequestParams = parse(request)?;
    let server = shared.server()?;
    let registered = {
        let snapshot = server.tools.read().unwrap_or_else(PoisonError::into_inner).clone();
        snapshot.get(&params.name).cloned()
    };
    let Some(registered) = registered else {
        return Err(unknown_entity("tool", &params.name));
    };
    let result = (registered.handler)(params, extra(&shared, ctx)).await?;
    Ok(serde_json::to_value(result)?)
}

async fn handle_list_prompts(
    shared: Arc<SessionShared>,
    _request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let server = shared.server()?;
    let snapshot = server
        .prompts
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let mut prompts: Vec<_> = snapshot.values().map(|p| p.prompt.clone()).collect();
    prompts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(serde_json::to_value(ListPromptsResult {
        prompts,
        next_cursor: None,
    })?)
}

async fn handle_get_prompt(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: GetPromptRequestParams = parse(request)?;
    let server = shared.server()?;
    let registered = {
        let snapshot = server
            .prompts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.get(&params.name).cloned()
    };
    let Some(registered) = registered else {
        return Err(unknown_entity("prompt", &params.name));
    };
    let result = (registered.handler)(params, extra(&shared, ctx)).await?;
    Ok(serde_json::to_value(result)?)
}

async fn handle_list_resources(
    shared: Arc<SessionShared>,
    _request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let server = shared.server()?;
    let snapshot = server
        .resources
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let mut resources: Vec<_> = snapshot.values().map(|r| r.resource.clone()).collect();
    resources.sort_by(|a, b| a.uri.cmp(&b.uri));
    Ok(serde_json::to_value(ListResourcesResult {
        resources,
        next_cursor: None,
    })?)
}

async fn handle_list_resource_templates(
    shared: Arc<SessionShared>,
    _request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let server = shared.server()?;
    let templates = server
        .resource_templates
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Ok(serde_json::to_value(ListResourceTemplatesResult {
        resource_templates: Vec::clone(&templates),
        next_cursor: None,
    })?)
}

async fn handle_read_resource(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: ReadResourceRequestParams = parse(request)?;
    let server = shared.server()?;
    let registered = {
        let snapshot = server
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.get(&params.uri).cloned()
    };
    let Some(registered) = registered else {
        return Err(unknown_entity("resource", &params.uri));
    };
    let result = (registered.handler)(params, extra(&shared, ctx)).await?;
    Ok(serde_json::to_value(result)?)
}

async fn handle_subscribe(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: SubscribeRequestParams = parse(request)?;
    let server = shared.server()?;
    let known = server
        .resources
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(&params.uri);
    if !known {
        return Err(unknown_entity("resource", &params.uri));
    }
    shared
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .subscriptions
        .insert(params.uri);
    Ok(serde_json::to_value(EmptyResult::default())?)
}

async fn handle_unsubscribe(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: UnsubscribeRequestParams = parse(request)?;
    shared
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .subscriptions
        .remove(&params.uri);
    Ok(serde_json::to_value(EmptyResult::default())?)
}

async fn handle_complete(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: CompleteRequestParams = parse(request)?;
    let server = shared.server()?;
    let handler = server
        .completion_handler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let result = match handler {
        Some(handler) => handler(params, extra(&shared, ctx)).await?,
        None => CompleteResult {
            completion: CompleteCompletion {
                values: Vec::new(),
                total: None,
                has_more: None,
            },
        },
    };
    Ok(serde_json::to_value(result)?)
}

async fn handle_set_level(
    shared: Arc<SessionShared>,
    request: JSONRPCRequest,
    _ctx: RequestContext,
) -> Result<serde_json::Value> {
    shared.ensure_initialized()?;
    let params: SetLevelRequestParams = parse(request)?;
    shared
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .logging_level = Some(params.level);
    Ok(serde_json::to_value(EmptyResult::default())?)
}
