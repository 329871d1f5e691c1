//! MCP client role: the agent-host side of a session.
//!
//! A [`Client`] owns one protocol engine. [`Client::connect`] runs the
//! `initialize` handshake (and sends `notifications/initialized` before it
//! returns), after which the typed request surface is available. Every typed
//! method checks the server's advertised capabilities first and fails with
//! [`McpError::CapabilityUnsupported`] before any bytes leave the transport.
//!
//! The client can serve three server-initiated request families, each opted
//! into by declaring the matching capability and installing a handler:
//! sampling (`sampling/createMessage`), elicitation (`elicitation/create`)
//! and roots (`roots/list`, served from a client-held root list).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;

use futures::future::BoxFuture;
use mcp_protocol::CapabilityCheck;
use mcp_protocol::DEFAULT_REQUEST_TIMEOUT;
use mcp_protocol::McpError;
use mcp_protocol::Protocol;
use mcp_protocol::ProtocolOptions;
use mcp_protocol::RequestContext;
use mcp_protocol::RequestOptions;
use mcp_protocol::Result;
use mcp_transport::Transport;
use mcp_types::CallToolRequest;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ClientCapabilities;
use mcp_types::CompleteArgument;
use mcp_types::CompleteRequest;
use mcp_types::CompleteRequestParams;
use mcp_types::CompleteResult;
use mcp_types::CompletionReference;
use mcp_types::CreateMessageRequestParams;
use mcp_types::CreateMessageResult;
use mcp_types::ElicitRequestParams;
use mcp_types::ElicitResult;
use mcp_types::EmptyResult;
use mcp_types::GetPromptRequest;
use mcp_types::GetPromptRequestParams;
use mcp_types::GetPromptResult;
use mcp_types::Implementation;
use mcp_types::InitializeRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::InitializedNotification;
use mcp_types::LATEST_PROTOCOL_VERSION;
use mcp_types::ListPromptsRequest;
use mcp_types::ListPromptsRequestParams;
use mcp_types::ListPromptsResult;
use mcp_types::ListResourceTemplatesRequest;
use mcp_types::ListResourceTemplatesRequestParams;
use mcp_types::ListResourceTemplatesResult;
use mcp_types::ListResourcesRequest;
use mcp_types::ListResourcesRequestParams;
use mcp_types::ListResourcesResult;
use mcp_types::ListRootsResult;
use mcp_types::ListToolsRequest;
use mcp_types::ListToolsRequestParams;
use mcp_types::ListToolsResult;
use mcp_types::LoggingLevel;
use mcp_types::LoggingMessageNotificationParams;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::PingRequest;
use mcp_types::ReadResourceRequest;
use mcp_types::ReadResourceRequestParams;
use mcp_types::ReadResourceResult;
use mcp_types::ResourceUpdatedNotificationParams;
use mcp_types::Root;
use mcp_types::RootsListChangedNotification;
use mcp_types::SUPPORTED_PROTOCOL_VERSIONS;
use mcp_types::ServerCapabilities;
use mcp_types::SetLevelRequest;
use mcp_types::SetLevelRequestParams;
use mcp_types::SubscribeRequest;
use mcp_types::SubscribeRequestParams;
use mcp_types::UnsubscribeRequest;
use mcp_types::UnsubscribeRequestParams;
use mcp_types::validate_meta;
use tracing::debug;

mod capability;

/// Handles `sampling/createMessage` on behalf of the user's model.
pub type SamplingHandler = Arc<
    dyn Fn(CreateMessageRequestParams, RequestContext) -> BoxFuture<'static, Result<CreateMessageResult>>
        + Send
        + Sync,
>;

/// Handles `elicitation/create` by asking the user for input.
pub type ElicitationHandler = Arc<
    dyn Fn(ElicitRequestParams, RequestContext) -> BoxFuture<'static, Result<ElicitResult>>
        + Send
        + Sync,
>;

pub type LoggingMessageCallback = Arc<dyn Fn(LoggingMessageNotificationParams) + Send + Sync>;
pub type ListChangedCallback = Arc<dyn Fn() + Send + Sync>;
pub type ResourceUpdatedCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    pub capabilities: ClientCapabilities,
    /// Additionally gate outbound traffic in the engine against the server's
    /// advertised capabilities. The typed methods below always check.
    pub enforce_strict_capabilities: bool,
    pub default_request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            capabilities: ClientCapabilities::default(),
            enforce_strict_capabilities: false,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct ServerState {
    capabilities: ServerCapabilities,
    server_info: Implementation,
    instructions: Option<String>,
    protocol_version: String,
}

#[derive(Default)]
struct NotificationCallbacks {
    logging: Option<LoggingMessageCallback>,
    tools_list_changed: Option<ListChangedCallback>,
    prompts_list_changed: Option<ListChangedCallback>,
    resources_list_changed: Option<ListChangedCallback>,
    resource_updated: Option<ResourceUpdatedCallback>,
}

struct ClientInner {
    protocol: Protocol,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    server_state: RwLock<Option<ServerState>>,
    roots: Mutex<Vec<Root>>,
    sampling_handler: Mutex<Option<SamplingHandler>>,
    elicitation_handler: Mutex<Option<ElicitationHandler>>,
    callbacks: Mutex<NotificationCallbacks>,
}

struct ClientGate {
    inner: Weak<ClientInner>,
}

impl CapabilityCheck for ClientGate {
    fn assert_capability_for_method(&self, method: &str) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(McpError::ConnectionClosed);
        };
        let state = inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match state.as_ref() {
            Some(state) => capability::check_server_capability(&state.capabilities, method),
            // Only the handshake may run before capabilities are known.
            None if method == "initialize" || method == "ping" => Ok(()),
            None => Err(McpError::CapabilityUnsupported(format!(
                "{method} called before initialization"
            ))),
        }
    }

    fn assert_notification_capability(&self, method: &str) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(McpError::ConnectionClosed);
        };
        capability::check_local_notification_capability(&inner.capabilities, method)
    }

    fn assert_request_handler_capability(&self, method: &str) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(McpError::ConnectionClosed);
        };
        capability::check_local_handler_capability(&inner.capabilities, method)
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(client_info: Implementation, options: ClientOptions) -> Self {
        let protocol = Protocol::new(ProtocolOptions {
            enforce_strict_capabilities: options.enforce_strict_capabilities,
            default_request_timeout: options.default_request_timeout,
        });
        let inner = Arc::new(ClientInner {
            protocol,
            client_info,
            capabilities: options.capabilities,
            server_state: RwLock::new(None),
            roots: Mutex::new(Vec::new()),
            sampling_handler: Mutex::new(None),
            elicitation_handler: Mutex::new(None),
            callbacks: Mutex::new(NotificationCallbacks::default()),
        });
        inner.protocol.set_capability_check(Arc::new(ClientGate {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Install the sampling handler. Requires the `sampling` capability to
    /// have been declared.
    pub fn set_sampling_handler(&self, handler: SamplingHandler) -> Result<()> {
        if self.inner.capabilities.sampling.is_none() {
            return Err(McpError::CapabilityUnsupported(
                "declare the sampling capability before installing a sampling handler".to_string(),
            ));
        }
        *self
            .inner
            .sampling_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        Ok(())
    }

    /// Install the elicitation handler. Requires the `elicitation`
    /// capability.
    pub fn set_elicitation_handler(&self, handler: ElicitationHandler) -> Result<()> {
        if self.inner.capabilities.elicitation.is_none() {
            return Err(McpError::CapabilityUnsupported(
                "declare the elicitation capability before installing an elicitation handler"
                    .to_string(),
            ));
        }
        *self
            .inner
            .elicitation_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        Ok(())
    }

    pub fn on_logging_message(&self, callback: LoggingMessageCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .logging = Some(callback);
    }

    pub fn on_tools_list_changed(&self, callback: ListChangedCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tools_list_changed = Some(callback);
    }

    pub fn on_prompts_list_changed(&self, callback: ListChangedCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prompts_list_changed = Some(callback);
    }

    pub fn on_resources_list_changed(&self, callback: ListChangedCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resources_list_changed = Some(callback);
    }

    pub fn on_resource_updated(&self, callback: ResourceUpdatedCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resource_updated = Some(callback);
    }

    pub fn on_error(&self, hook: mcp_protocol::ErrorHook) {
        self.inner.protocol.on_error(hook);
    }

    pub fn on_close(&self, hook: mcp_protocol::CloseHook) {
        self.inner.protocol.on_close(hook);
    }

    /// Connect the transport and run the handshake. On success the
    /// `initialized` notification has been sent and the session is Ready.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<InitializeResult> {
        self.register_handlers();
        self.inner.protocol.connect(transport.clone()).await?;

        let result = self
            .inner
            .protocol
            .request::<InitializeRequest>(
                InitializeRequestParams {
                    capabilities: self.inner.capabilities.clone(),
                    client_info: self.inner.client_info.clone(),
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                },
                RequestOptions::default(),
            )
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                let _ = self.inner.protocol.close().await;
                return Err(e);
            }
        };

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            let offered = result.protocol_version.clone();
            let _ = self.inner.protocol.close().await;
            return Err(McpError::invalid_request(format!(
                "server offered unsupported protocol version {offered:?}, supported: {SUPPORTED_PROTOCOL_VERSIONS:?}"
            )));
        }

        transport.set_protocol_version(&result.protocol_version);
        *self
            .inner
            .server_state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(ServerState {
            capabilities: result.capabilities.clone(),
            server_info: result.server_info.clone(),
            instructions: result.instructions.clone(),
            protocol_version: result.protocol_version.clone(),
        });

        // `initialized` goes out before connect returns, ahead of any user
        // request.
        self.inner
            .protocol
            .notify::<InitializedNotification>(None)
            .await?;
        debug!(
            "initialized against {} {}",
            result.server_info.name, result.server_info.version
        );
        Ok(result)
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.protocol.close().await
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.capabilities.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.server_info.clone())
    }

    pub fn server_instructions(&self) -> Option<String> {
        self.inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.instructions.clone())
    }

    pub fn negotiated_protocol_version(&self) -> Option<String> {
        self.inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.protocol_version.clone())
    }

    pub async fn ping(&self) -> Result<()> {
        let _: EmptyResult = self
            .inner
            .protocol
            .request::<PingRequest>(None, RequestOptions::default())
            .await?;
        Ok(())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.assert_server_capability(ListToolsRequest::METHOD)?;
        self.inner
            .protocol
            .request::<ListToolsRequest>(
                cursor.map(|cursor| ListToolsRequestParams {
                    cursor: Some(cursor),
                }),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: Option<serde_json::Value>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        self.call_tool_with_options(
            CallToolRequestParams {
                name: name.into(),
                arguments,
                meta,
            },
            RequestOptions::default(),
        )
        .await
    }

    /// `tools/call` with explicit [`RequestOptions`] (timeout, progress).
    /// `_meta` keys are validated against the key grammar before any I/O.
    pub async fn call_tool_with_options(
        &self,
        params: CallToolRequestParams,
        options: RequestOptions,
    ) -> Result<CallToolResult> {
        if let Some(meta) = &params.meta {
            validate_meta(meta).map_err(|e| McpError::InvalidArgument(e.to_string()))?;
        }
        self.assert_server_capability(CallToolRequest::METHOD)?;
        self.inner
            .protocol
            .request::<CallToolRequest>(params, options)
            .await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.assert_server_capability(ListPromptsRequest::METHOD)?;
        self.inner
            .protocol
            .request::<ListPromptsRequest>(
                cursor.map(|cursor| ListPromptsRequestParams {
                    cursor: Some(cursor),
                }),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn get_prompt(
        &self,
        name: impl Into<String>,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult> {
        self.assert_server_capability(GetPromptRequest::METHOD)?;
        self.inner
            .protocol
            .request::<GetPromptRequest>(
                GetPromptRequestParams {
                    name: name.into(),
                    arguments,
                },
                RequestOptions::default(),
            )
            .await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.assert_server_capability(ListResourcesRequest::METHOD)?;
        self.inner
            .protocol
            .request::<ListResourcesRequest>(
                cursor.map(|cursor| ListResourcesRequestParams {
                    cursor: Some(cursor),
                }),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult> {
        self.assert_server_capability(ListResourceTemplatesRequest::METHOD)?;
        self.inner
            .protocol
            .request::<ListResourceTemplatesRequest>(
                cursor.map(|cursor| ListResourceTemplatesRequestParams {
                    cursor: Some(cursor),
                }),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn read_resource(&self, uri: impl Into<String>) -> Result<ReadResourceResult> {
        self.assert_server_capability(ReadResourceRequest::METHOD)?;
        self.inner
            .protocol
            .request::<ReadResourceRequest>(
                ReadResourceRequestParams { uri: uri.into() },
                RequestOptions::default(),
            )
            .await
    }

    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> Result<()> {
        self.assert_server_capability(SubscribeRequest::METHOD)?;
        let _: EmptyResult = self
            .inner
            .protocol
            .request::<SubscribeRequest>(
                SubscribeRequestParams { uri: uri.into() },
                RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> Result<()> {
        self.assert_server_capability(UnsubscribeRequest::METHOD)?;
        let _: EmptyResult = self
            .inner
            .protocol
            .request::<UnsubscribeRequest>(
                UnsubscribeRequestParams { uri: uri.into() },
                RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument_name: impl Into<String>,
        argument_value: impl Into<String>,
    ) -> Result<CompleteResult> {
        self.assert_server_capability(CompleteRequest::METHOD)?;
        self.inner
            .protocol
            .request::<CompleteRequest>(
                CompleteRequestParams {
                    r#ref: reference,
                    argument: CompleteArgument {
                        name: argument_name.into(),
                        value: argument_value.into(),
                    },
                    context: None,
                },
                RequestOptions::default(),
            )
            .await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        self.assert_server_capability(SetLevelRequest::METHOD)?;
        let _: EmptyResult = self
            .inner
            .protocol
            .request::<SetLevelRequest>(
                SetLevelRequestParams { level },
                RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    /// Add a root served to `roots/list`. Emits
    /// `notifications/roots/list_changed` when that capability was declared
    /// and the session is up.
    pub async fn add_root(&self, root: Root) -> Result<()> {
        if self.inner.capabilities.roots.is_none() {
            return Err(McpError::CapabilityUnsupported(
                "declare the roots capability before adding roots".to_string(),
            ));
        }
        self.inner
            .roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(root);
        self.notify_roots_changed().await
    }

    /// Remove a root by uri; `false` when nothing matched (no notification).
    pub async fn remove_root(&self, uri: &str) -> Result<bool> {
        let removed = {
            let mut roots = self.inner.roots.lock().unwrap_or_else(PoisonError::into_inner);
            let before = roots.len();
            roots.retain(|root| root.uri != uri);
            roots.len() != before
        };
        if removed {
            self.notify_roots_changed().await?;
        }
        Ok(removed)
    }

    async fn notify_roots_changed(&self) -> Result<()> {
        if !self.inner.capabilities.roots_list_changed() {
            return Ok(());
        }
        if self
            .inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            // Not connected yet; the server will list roots on demand.
            return Ok(());
        }
        self.inner
            .protocol
            .notify::<RootsListChangedNotification>(None)
            .await
    }

    fn assert_server_capability(&self, method: &str) -> Result<()> {
        let state = self
            .inner
            .server_state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match state.as_ref() {
            Some(state) => capability::check_server_capability(&state.capabilities, method),
            None => Err(McpError::CapabilityUnsupported(format!(
                "{method} called before initialization"
            ))),
        }
    }

    /// Wire the built-in request and notification handlers into the engine.
    fn register_handlers(&self) {
        let protocol = &self.inner.protocol;

        protocol.set_request_handler(
            PingRequest::METHOD,
            Arc::new(|_request, _ctx| Box::pin(async { Ok(serde_json::json!({})) })),
        );

        if self.inner.capabilities.sampling.is_some() {
            let weak = Arc::downgrade(&self.inner);
            protocol.set_request_handler(
                "sampling/createMessage",
                Arc::new(move |request, ctx| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let inner = weak.upgrade().ok_or(McpError::ConnectionClosed)?;
                        let handler = inner
                            .sampling_handler
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone()
                            .ok_or_else(|| {
                                McpError::Internal(
                                    "no sampling handler installed".to_string(),
                                )
                            })?;
                        let params: CreateMessageRequestParams = serde_json::from_value(
                            request.params.unwrap_or(serde_json::Value::Null),
                        )?;
                        let result = handler(params, ctx).await?;
                        Ok(serde_json::to_value(result)?)
                    })
                }),
            );
        }

        if self.inner.capabilities.elicitation.is_some() {
            let weak = Arc::downgrade(&self.inner);
            protocol.set_request_handler(
                "elicitation/create",
                Arc::new(move |request, ctx| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let inner = weak.upgrade().ok_or(McpError::ConnectionClosed)?;
                        let handler = inner
                            .elicitation_handler
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone()
                            .ok_or_else(|| {
                                McpError::Internal(
                                    "no elicitation handler installed".to_string(),
                                )
                            })?;
                        let params: ElicitRequestParams = serde_json::from_value(
                            request.params.unwrap_or(serde_json::Value::Null),
                        )?;
                        let result = handler(params, ctx).await?;
                        Ok(serde_json::to_value(result)?)
                    })
                }),
            );
        }

        if self.inner.capabilities.roots.is_some() {
            let weak = Arc::downgrade(&self.inner);
            protocol.set_request_handler(
                "roots/list",
                Arc::new(move |_request, _ctx| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let inner = weak.upgrade().ok_or(McpError::ConnectionClosed)?;
                        let roots = inner
                            .roots
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        Ok(serde_json::to_value(ListRootsResult { roots })?)
                    })
                }),
            );
        }

        let weak = Arc::downgrade(&self.inner);
        protocol.set_notification_handler(
            "notifications/message",
            Arc::new(move |notification| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let callback = inner
                        .callbacks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .logging
                        .clone();
                    let Some(callback) = callback else { return };
                    match serde_json::from_value::<LoggingMessageNotificationParams>(
                        notification.params.unwrap_or(serde_json::Value::Null),
                    ) {
                        Ok(params) => callback(params),
                        Err(e) => debug!("dropping malformed logging message: {e}"),
                    }
                })
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        protocol.set_notification_handler(
            "notifications/resources/updated",
            Arc::new(move |notification| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let callback = inner
                        .callbacks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .resource_updated
                        .clone();
                    let Some(callback) = callback else { return };
                    match serde_json::from_value::<ResourceUpdatedNotificationParams>(
                        notification.params.unwrap_or(serde_json::Value::Null),
                    ) {
                        Ok(params) => callback(params.uri),
                        Err(e) => debug!("dropping malformed resource update: {e}"),
                    }
                })
            }),
        );

        for (method, pick) in [
            (
                "notifications/tools/list_changed",
                (|callbacks: &NotificationCallbacks| callbacks.tools_list_changed.clone())
                    as fn(&NotificationCallbacks) -> Option<ListChangedCallback>,
            ),
            ("notifications/prompts/list_changed", |callbacks| {
                callbacks.prompts_list_changed.clone()
            }),
            ("notifications/resources/list_changed", |callbacks| {
                callbacks.resources_list_changed.clone()
            }),
        ] {
            let weak = Arc::downgrade(&self.inner);
            protocol.set_notification_handler(
                method,
                Arc::new(move |_notification| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        let callback = pick(
                            &inner.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
                        );
                        if let Some(callback) = callback {
                            callback();
                        }
                    })
                }),
            );
        }
    }
}
