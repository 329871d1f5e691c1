//! MCP server role: the tool/prompt/resource provider side of a session.
//!
//! One [`Server`] holds the registries and can back any number of concurrent
//! transports: [`Server::create_session`] wires a fresh protocol engine to a
//! transport and multiplexes incoming requests over the shared registries.
//! Registry mutations emit the matching `*_list_changed` notification to
//! every live session, iff the corresponding `listChanged` capability was
//! advertised.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;

use futures::future::BoxFuture;
use mcp_protocol::DEFAULT_REQUEST_TIMEOUT;
use mcp_protocol::McpError;
use mcp_protocol::Result;
use mcp_transport::Transport;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CompleteRequestParams;
use mcp_types::CompleteResult;
use mcp_types::GetPromptRequestParams;
use mcp_types::GetPromptResult;
use mcp_types::Implementation;
use mcp_types::Prompt;
use mcp_types::ReadResourceRequestParams;
use mcp_types::ReadResourceResult;
use mcp_types::Resource;
use mcp_types::ResourceTemplate;
use mcp_types::ServerCapabilities;
use mcp_types::Tool;
use tracing::debug;
use tracing::warn;

mod session;

pub use session::RequestHandlerExtra;
pub use session::ServerSession;

/// Executes one `tools/call`. Runs on its own task and is cancelled (at its
/// next await) when the caller cancels the request.
pub type ToolHandler = Arc<
    dyn Fn(CallToolRequestParams, RequestHandlerExtra) -> BoxFuture<'static, Result<CallToolResult>>
        + Send
        + Sync,
>;

/// Renders one `prompts/get`.
pub type PromptHandler = Arc<
    dyn Fn(GetPromptRequestParams, RequestHandlerExtra) -> BoxFuture<'static, Result<GetPromptResult>>
        + Send
        + Sync,
>;

/// Serves one `resources/read`.
pub type ResourceHandler = Arc<
    dyn Fn(ReadResourceRequestParams, RequestHandlerExtra) -> BoxFuture<'static, Result<ReadResourceResult>>
        + Send
        + Sync,
>;

/// Serves `completion/complete` for prompt arguments and resource template
/// variables.
pub type CompletionHandler = Arc<
    dyn Fn(CompleteRequestParams, RequestHandlerExtra) -> BoxFuture<'static, Result<CompleteResult>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct ServerOptions {
    pub capabilities: ServerCapabilities,
    /// Free-form usage hints returned from `initialize`.
    pub instructions: Option<String>,
    pub enforce_strict_capabilities: bool,
    pub default_request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            capabilities: ServerCapabilities::default(),
            instructions: None,
            enforce_strict_capabilities: false,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub(crate) struct RegisteredTool {
    pub tool: Tool,
    pub handler: ToolHandler,
}

pub(crate) struct RegisteredPrompt {
    pub prompt: Prompt,
    pub handler: PromptHandler,
}

pub(crate) struct RegisteredResource {
    pub resource: Resource,
    pub handler: ResourceHandler,
}

pub(crate) struct ServerInner {
    pub server_info: Implementation,
    pub options: ServerOptions,
    // Registries are read-mostly: lookups clone the snapshot Arc, writers
    // swap in a rebuilt map.
    pub tools: RwLock<Arc<HashMap<String, Arc<RegisteredTool>>>>,
    pub prompts: RwLock<Arc<HashMap<String, Arc<RegisteredPrompt>>>>,
    pub resources: RwLock<Arc<HashMap<String, Arc<RegisteredResource>>>>,
    pub resource_templates: RwLock<Arc<Vec<ResourceTemplate>>>,
    pub completion_handler: Mutex<Option<CompletionHandler>>,
    sessions: Mutex<Vec<Weak<session::SessionShared>>>,
}

/// The shared server: registries plus the session factory.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(server_info: Implementation, options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                server_info,
                options,
                tools: RwLock::new(Arc::new(HashMap::new())),
                prompts: RwLock::new(Arc::new(HashMap::new())),
                resources: RwLock::new(Arc::new(HashMap::new())),
                resource_templates: RwLock::new(Arc::new(Vec::new())),
                completion_handler: Mutex::new(None),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind a new session to `transport`. The session serves this server's
    /// registries; many sessions may run concurrently.
    pub async fn create_session(&self, transport: Arc<dyn Transport>) -> Result<ServerSession> {
        let session = session::build_session(self.inner.clone(), transport).await?;
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(session.shared()));
        Ok(session)
    }

    /// Register (or replace) a tool. Emits `notifications/tools/list_changed`
    /// when that capability was advertised.
    pub async fn add_tool(&self, tool: Tool, handler: ToolHandler) {
        let name = tool.name.clone();
        {
            let mut table = self.inner.tools.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = clone_registry(&table);
            next.insert(name, Arc::new(RegisteredTool { tool, handler }));
            *table = Arc::new(next);
        }
        self.broadcast_tools_list_changed().await;
    }

    /// Remove a tool by name. Removing an absent name is a no-op returning
    /// `false`, with no notification.
    pub async fn remove_tool(&self, name: &str) -> bool {
        let removed = {
            let mut table = self.inner.tools.write().unwrap_or_else(PoisonError::into_inner);
            if !table.contains_key(name) {
                return false;
            }
            let mut next = clone_registry(&table);
            next.remove(name);
            *table = Arc::new(next);
            true
        };
        if removed {
            self.broadcast_tools_list_changed().await;
        }
        removed
    }

    /// Remove several tools at once; a single notification covers the batch.
    /// Returns how many were actually present.
    pub async fn remove_tools(&self, names: &[&str]) -> usize {
        let removed = {
            let mut table = self.inner.tools.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = clone_registry(&table);
            let mut removed = 0;
            for name in names {
                if next.remove(*name).is_some() {
                    removed += 1;
                }
            }
            if removed > 0 {
                *table = Arc::new(next);
            }
            removed
        };
        if removed > 0 {
            self.broadcast_tools_list_changed().await;
        }
        removed
    }

    pub async fn add_prompt(&self, prompt: Prompt, handler: PromptHandler) {
        let name = prompt.name.clone();
        {
            let mut table = self
                .inner
                .prompts
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut next = clone_registry(&table);
            next.insert(name, Arc::new(RegisteredPrompt { prompt, handler }));
            *table = Arc::new(next);
        }
        self.broadcast_prompts_list_changed().await;
    }

    pub async fn remove_prompt(&self, name: &str) -> bool {
        let removed = {
            let mut table = self
                .inner
                .prompts
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !table.contains_key(name) {
                return false;
            }
            let mut next = clone_registry(&table);
            next.remove(name);
            *table = Arc::new(next);
            true
        };
        if removed {
            self.broadcast_prompts_list_changed().await;
        }
        removed
    }

    pub async fn add_resource(&self, resource: Resource, handler: ResourceHandler) {
        let uri = resource.uri.clone();
        {
            let mut table = self
                .inner
                .resources
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut next = clone_registry(&table);
            next.insert(uri, Arc::new(RegisteredResource { resource, handler }));
            *table = Arc::new(next);
        }
        self.broadcast_resources_list_changed().await;
    }

    pub async fn remove_resource(&self, uri: &str) -> bool {
        let removed = {
            let mut table = self
                .inner
                .resources
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !table.contains_key(uri) {
                return false;
            }
            let mut next = clone_registry(&table);
            next.remove(uri);
            *table = Arc::new(next);
            true
        };
        if removed {
            self.broadcast_resources_list_changed().await;
            // Subscribers learn that the resource is gone.
            self.notify_resource_updated(uri).await;
        }
        removed
    }

    pub fn add_resource_template(&self, template: ResourceTemplate) {
        let mut templates = self
            .inner
            .resource_templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&templates);
        next.push(template);
        *templates = Arc::new(next);
    }

    /// Serve `completion/complete` with this handler; without one, every
    /// completion request answers with an empty value list.
    pub fn set_completion_handler(&self, handler: CompletionHandler) {
        *self
            .inner
            .completion_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Tell subscribed sessions that a resource's contents changed.
    pub async fn notify_resource_updated(&self, uri: &str) {
        for session in self.live_sessions() {
            if session.is_subscribed(uri) {
                if let Err(e) = session.send_resource_updated(uri).await {
                    warn!("failed to notify resource update: {e}");
                }
            }
        }
    }

    async fn broadcast_tools_list_changed(&self) {
        if !self.inner.options.capabilities.tools_list_changed() {
            return;
        }
        for session in self.live_sessions() {
            if let Err(e) = session.send_tool_list_changed().await {
                debug!("failed to broadcast tools/list_changed: {e}");
            }
        }
    }

    async fn broadcast_prompts_list_changed(&self) {
        if !self.inner.options.capabilities.prompts_list_changed() {
            return;
        }
        for session in self.live_sessions() {
            if let Err(e) = session.send_prompt_list_changed().await {
                debug!("failed to broadcast prompts/list_changed: {e}");
            }
        }
    }

    async fn broadcast_resources_list_changed(&self) {
        if !self.inner.options.capabilities.resources_list_changed() {
            return;
        }
        for session in self.live_sessions() {
            if let Err(e) = session.send_resource_list_changed().await {
                debug!("failed to broadcast resources/list_changed: {e}");
            }
        }
    }

    /// Snapshot the live, initialized sessions, dropping dead weak refs on
    /// the way.
    fn live_sessions(&self) -> Vec<ServerSession> {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions
            .iter()
            .filter_map(Weak::upgrade)
            .map(ServerSession::from_shared)
            .filter(ServerSession::is_initialized)
            .collect()
    }
}

fn clone_registry<V: Clone>(map: &Arc<HashMap<String, V>>) -> HashMap<String, V> {
    HashMap::clone(map)
}

/// Convenience for declaring a tool whose schema is written inline.
pub fn tool(
    name: impl Into<String>,
    description: impl Into<String>,
    properties: serde_json::Value,
    required: &[&str],
) -> Tool {
    Tool {
        name: name.into(),
        title: None,
        description: Some(description.into()),
        input_schema: mcp_types::ToolInputSchema {
            properties: Some(properties),
            required: if required.is_empty() {
                None
            } else {
                Some(required.iter().map(|s| (*s).to_string()).collect())
            },
            ..Default::default()
        },
        output_schema: None,
        annotations: None,
    }
}

pub(crate) fn unknown_entity(kind: &str, id: &str) -> McpError {
    McpError::Peer {
        code: mcp_protocol::INVALID_PARAMS_CODE,
        message: format!("unknown {kind}: {id}"),
        data: None,
    }
}
