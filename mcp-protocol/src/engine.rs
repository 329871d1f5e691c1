//! The protocol engine shared by both peers: request/response correlation,
//! progress routing, timeouts, cancellation, handler dispatch and the
//! capability gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use mcp_transport::Transport;
use mcp_transport::TransportSendOptions;
use mcp_types::CancelledNotification;
use mcp_types::CancelledNotificationParams;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::ProgressNotification;
use mcp_types::ProgressNotificationParams;
use mcp_types::RequestId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::McpError;
use crate::Result;
use crate::error::INTERNAL_ERROR_CODE;
use crate::error::INVALID_REQUEST_CODE;
use crate::error::METHOD_NOT_FOUND_CODE;

/// Applied when `RequestOptions::timeout` is not set.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Handler for one inbound request method. Runs on its own task; the
/// returned value becomes the `result` of the response, an error becomes the
/// error reply.
pub type RequestHandler = Arc<
    dyn Fn(JSONRPCRequest, RequestContext) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Handler for one inbound notification method. Notification handlers are
/// serialized per session.
pub type NotificationHandler =
    Arc<dyn Fn(JSONRPCNotification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives `notifications/progress` payloads for one outstanding request.
pub type ProgressCallback = Arc<dyn Fn(ProgressNotificationParams) + Send + Sync>;

/// Protocol-level error hook (`onError`): malformed peers, unknown ids,
/// transport faults. Never invoked for errors that have a caller to return
/// to.
pub type ErrorHook = Arc<dyn Fn(&McpError) + Send + Sync>;

pub type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Role-specific capability assertions. The engine consults these before
/// letting traffic through; the client and server roles implement them
/// against the negotiated capability sets.
pub trait CapabilityCheck: Send + Sync {
    /// Remote capability required to send a request with this method.
    fn assert_capability_for_method(&self, method: &str) -> Result<()>;
    /// Local capability required to emit this notification.
    fn assert_notification_capability(&self, method: &str) -> Result<()>;
    /// Local capability required to answer requests of this method.
    fn assert_request_handler_capability(&self, method: &str) -> Result<()>;
}

/// Permits everything; used by tests and by peers that negotiate no
/// capabilities.
pub struct AllowAllCapabilities;

impl CapabilityCheck for AllowAllCapabilities {
    fn assert_capability_for_method(&self, _method: &str) -> Result<()> {
        Ok(())
    }
    fn assert_notification_capability(&self, _method: &str) -> Result<()> {
        Ok(())
    }
    fn assert_request_handler_capability(&self, _method: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ProtocolOptions {
    /// Gate outbound requests/notifications on the *remote* peer's advertised
    /// capabilities.
    pub enforce_strict_capabilities: bool,
    pub default_request_timeout: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            enforce_strict_capabilities: false,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Per-request options for [`Protocol::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Opting in injects `params._meta.progressToken` (the request id) and
    /// routes matching `notifications/progress` to this callback.
    pub on_progress: Option<ProgressCallback>,
    pub resumption_token: Option<String>,
    pub on_resumption_token: Option<mcp_transport::ResumptionTokenCallback>,
}

/// Context handed to request handlers.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    /// Cancelled when the peer sends `notifications/cancelled` for this
    /// request or the session closes. Handlers observe it at their next
    /// suspension point.
    pub cancellation: CancellationToken,
    /// The `_meta` object of the incoming params, progress token included.
    pub meta: Option<serde_json::Value>,
    /// Handle for talking back to the peer from inside the handler.
    pub peer: Peer,
}

impl RequestContext {
    /// The progress token the caller attached, if any.
    pub fn progress_token(&self) -> Option<RequestId> {
        let token = self.meta.as_ref()?.get("progressToken")?.clone();
        serde_json::from_value(token).ok()
    }

    /// Emit `notifications/progress` keyed to this request's token. A no-op
    /// when the caller did not opt into progress.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        let Some(token) = self.progress_token() else {
            return Ok(());
        };
        // Related to the incoming request so HTTP server transports put it
        // on the right stream.
        self.peer.upgrade()?
            .notify_with_options::<ProgressNotification>(
                ProgressNotificationParams {
                    progress_token: token,
                    progress,
                    total,
                    message,
                },
                TransportSendOptions {
                    related_request_id: Some(self.request_id.clone()),
                    ..Default::default()
                },
            )
            .await
    }
}

/// Cheap cloneable handle to the session, usable from handler tasks without
/// keeping the session alive.
#[derive(Clone)]
pub struct Peer {
    inner: Weak<ProtocolInner>,
}

impl Peer {
    fn upgrade(&self) -> Result<Protocol> {
        self.inner
            .upgrade()
            .map(|inner| Protocol { inner })
            .ok_or(McpError::ConnectionClosed)
    }

    pub async fn notify<N: ModelContextProtocolNotification>(
        &self,
        params: N::Params,
    ) -> Result<()> {
        self.upgrade()?.notify::<N>(params).await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        self.upgrade()?.send_notification(method, params).await
    }

    pub async fn notify_with_options<N: ModelContextProtocolNotification>(
        &self,
        params: N::Params,
        options: TransportSendOptions,
    ) -> Result<()> {
        self.upgrade()?
            .notify_with_options::<N>(params, options)
            .await
    }
}

struct PendingTables {
    responses: HashMap<RequestId, oneshot::Sender<Result<serde_json::Value>>>,
    progress: HashMap<RequestId, ProgressCallback>,
}

struct ProtocolInner {
    options: ProtocolOptions,
    capabilities: RwLock<Arc<dyn CapabilityCheck>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_request_id: AtomicI64,
    /// Response completions and progress callbacks are removed under the same
    /// lock so a cancellation or timeout never leaves one half behind.
    pending: Mutex<PendingTables>,
    request_handlers: RwLock<Arc<HashMap<String, RequestHandler>>>,
    notification_handlers: RwLock<Arc<HashMap<String, NotificationHandler>>>,
    fallback_request_handler: RwLock<Option<RequestHandler>>,
    fallback_notification_handler: RwLock<Option<NotificationHandler>>,
    /// Inbound requests currently executing locally, cancellable by the peer.
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    error_hooks: Mutex<Vec<ErrorHook>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    /// Session-scoped token; all in-flight handler tokens are children.
    session: CancellationToken,
    cascaded: AtomicBool,
}

/// One protocol session bound to one transport. Cloning is cheap and shares
/// the session.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

impl Protocol {
    pub fn new(options: ProtocolOptions) -> Self {
        Self {
            inner: Arc::new(ProtocolInner {
                options,
                capabilities: RwLock::new(Arc::new(AllowAllCapabilities)),
                transport: RwLock::new(None),
                next_request_id: AtomicI64::new(0),
                pending: Mutex::new(PendingTables {
                    responses: HashMap::new(),
                    progress: HashMap::new(),
                }),
                request_handlers: RwLock::new(Arc::new(HashMap::new())),
                notification_handlers: RwLock::new(Arc::new(HashMap::new())),
                fallback_request_handler: RwLock::new(None),
                fallback_notification_handler: RwLock::new(None),
                in_flight: Mutex::new(HashMap::new()),
                error_hooks: Mutex::new(Vec::new()),
                close_hooks: Mutex::new(Vec::new()),
                session: CancellationToken::new(),
                cascaded: AtomicBool::new(false),
            }),
        }
    }

    /// Install the role's capability assertions. Must happen before
    /// [`Protocol::connect`].
    pub fn set_capability_check(&self, check: Arc<dyn CapabilityCheck>) {
        *self
            .inner
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = check;
    }

    /// A handle for handler tasks.
    pub fn peer(&self) -> Peer {
        Peer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Attach and start the transport. The engine owns it exclusively from
    /// here on.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut slot = self
                .inner
                .transport
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(McpError::Internal(
                    "protocol is already connected to a transport".to_string(),
                ));
            }
            *slot = Some(transport.clone());
        }

        let weak = Arc::downgrade(&self.inner);
        transport.on_message(Arc::new(move |message| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Protocol { inner }.handle_message(message).await;
                }
                Ok(())
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        transport.on_error(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                Protocol { inner }
                    .emit_error(&McpError::Internal(format!("transport error: {error}")));
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        transport.on_close(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Protocol { inner }.run_close_cascade();
            }
        }));

        transport.start().await?;
        Ok(())
    }

    pub fn on_error(&self, hook: ErrorHook) {
        self.inner
            .error_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn on_close(&self, hook: CloseHook) {
        self.inner
            .close_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn set_request_handler(&self, method: &str, handler: RequestHandler) {
        let mut table = self
            .inner
            .request_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&table);
        next.insert(method.to_string(), handler);
        *table = Arc::new(next);
    }

    pub fn remove_request_handler(&self, method: &str) {
        let mut table = self
            .inner
            .request_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&table);
        next.remove(method);
        *table = Arc::new(next);
    }

    pub fn set_notification_handler(&self, method: &str, handler: NotificationHandler) {
        let mut table = self
            .inner
            .notification_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&table);
        next.insert(method.to_string(), handler);
        *table = Arc::new(next);
    }

    pub fn set_fallback_request_handler(&self, handler: RequestHandler) {
        *self
            .inner
            .fallback_request_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_fallback_notification_handler(&self, handler: NotificationHandler) {
        *self
            .inner
            .fallback_notification_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(McpError::ConnectionClosed)
    }

    fn capabilities(&self) -> Arc<dyn CapabilityCheck> {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send a typed request and await its typed result.
    pub async fn request<R: ModelContextProtocolRequest>(
        &self,
        params: R::Params,
        options: RequestOptions,
    ) -> Result<R::Result> {
        if self.inner.options.enforce_strict_capabilities {
            self.capabilities().assert_capability_for_method(R::METHOD)?;
        }
        let transport = self.transport()?;
        let RequestOptions {
            timeout,
            on_progress,
            resumption_token,
            on_resumption_token,
        } = options;

        let id = RequestId::Integer(self.inner.next_request_id.fetch_add(1, Ordering::SeqCst));

        // `Option<T>` params encode as an absent field, and a progress opt-in
        // injects the token into a cloned `_meta` rather than the caller's
        // value.
        let params_json = serde_json::to_value(&params)?;
        let mut params_field = if params_json.is_null() {
            None
        } else {
            Some(params_json)
        };
        if on_progress.is_some() {
            params_field = Some(inject_progress_token(params_field, &id)?);
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.responses.insert(id.clone(), completion_tx);
            if let Some(on_progress) = on_progress {
                pending.progress.insert(id.clone(), on_progress);
            }
        }

        let message = JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.clone(),
            method: R::METHOD.to_string(),
            params: params_field,
        });
        let send_options = TransportSendOptions {
            related_request_id: None,
            resumption_token,
            on_resumption_token,
        };
        if let Err(e) = transport.send(message, send_options).await {
            self.remove_pending(&id);
            return Err(e.into());
        }

        let timeout = timeout.unwrap_or(self.inner.options.default_request_timeout);
        let outcome = match tokio::time::timeout(timeout, completion_rx).await {
            Ok(Ok(outcome)) => {
                // Normal completion: drop the progress registration.
                self.remove_pending(&id);
                outcome
            }
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                self.remove_pending(&id);
                // Best effort: tell the peer to stop working on it.
                let cancel = JSONRPCMessage::Notification(JSONRPCNotification {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method: CancelledNotification::METHOD.to_string(),
                    params: Some(serde_json::to_value(CancelledNotificationParams {
                        request_id: id.clone(),
                        reason: Some(format!("request timed out after {timeout:?}")),
                    })?),
                });
                let _ = transport
                    .send(cancel, TransportSendOptions::default())
                    .await;
                return Err(McpError::RequestTimeout(timeout));
            }
        };

        let value = outcome?;
        serde_json::from_value(value).map_err(McpError::Json)
    }

    /// Send a typed notification.
    pub async fn notify<N: ModelContextProtocolNotification>(
        &self,
        params: N::Params,
    ) -> Result<()> {
        self.notify_with_options::<N>(params, TransportSendOptions::default())
            .await
    }

    /// Send a typed notification with transport routing options (e.g.
    /// `related_request_id`).
    pub async fn notify_with_options<N: ModelContextProtocolNotification>(
        &self,
        params: N::Params,
        options: TransportSendOptions,
    ) -> Result<()> {
        let params_json = serde_json::to_value(&params)?;
        let params_field = if params_json.is_null() {
            None
        } else {
            Some(params_json)
        };
        self.send_notification_with_options(N::METHOD, params_field, options)
            .await
    }

    /// Send a notification with pre-serialized params.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        self.send_notification_with_options(method, params, TransportSendOptions::default())
            .await
    }

    pub async fn send_notification_with_options(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: TransportSendOptions,
    ) -> Result<()> {
        self.capabilities().assert_notification_capability(method)?;
        let transport = self.transport()?;
        let message = JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        });
        transport.send(message, options).await?;
        Ok(())
    }

    /// Close the session: the transport goes down and every pending request
    /// fails with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        let transport = {
            self.inner
                .transport
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        };
        if let Some(transport) = transport {
            transport.close().await?;
        }
        // The transport's on_close runs the cascade; run it directly when no
        // transport was ever attached.
        self.run_close_cascade();
        Ok(())
    }

    /// Single serialized entry point for inbound envelopes.
    pub async fn handle_message(&self, message: JSONRPCMessage) {
        match message {
            JSONRPCMessage::Response(response) => {
                self.handle_response(response.id, Ok(response.result));
            }
            JSONRPCMessage::Error(error) => {
                let JSONRPCErrorError {
                    code,
                    message,
                    data,
                } = error.error;
                self.handle_response(
                    error.id,
                    Err(McpError::Peer {
                        code,
                        message,
                        data,
                    }),
                );
            }
            JSONRPCMessage::Notification(notification) => {
                self.handle_notification(notification).await;
            }
            JSONRPCMessage::Request(request) => {
                self.handle_request(request).await;
            }
        }
    }

    fn handle_response(&self, id: RequestId, outcome: Result<serde_json::Value>) {
        let completion = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let completion = pending.responses.remove(&id);
            if completion.is_some() {
                pending.progress.remove(&id);
            }
            completion
        };
        match completion {
            Some(completion) => {
                // The caller may have timed out and gone away; that is fine.
                let _ = completion.send(outcome);
            }
            None => {
                self.emit_error(&McpError::Internal(format!(
                    "received a response for unknown request id {id}"
                )));
            }
        }
    }

    async fn handle_notification(&self, notification: JSONRPCNotification) {
        // Engine-level notifications are consulted before the role tables.
        if notification.method == ProgressNotification::METHOD {
            self.handle_progress(notification);
            return;
        }
        if notification.method == CancelledNotification::METHOD {
            self.handle_cancelled(notification);
            return;
        }

        let handler = {
            let table = self
                .inner
                .notification_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            table.get(&notification.method).cloned()
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                let fallback = self
                    .inner
                    .fallback_notification_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match fallback {
                    Some(handler) => handler,
                    None => {
                        debug!("dropping unhandled notification {}", notification.method);
                        return;
                    }
                }
            }
        };
        handler(notification).await;
    }

    fn handle_progress(&self, notification: JSONRPCNotification) {
        let params: ProgressNotificationParams =
            match serde_json::from_value(notification.params.unwrap_or(serde_json::Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    self.emit_error(&McpError::Internal(format!(
                        "malformed progress notification: {e}"
                    )));
                    return;
                }
            };
        let callback = {
            let pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.progress.get(&params.progress_token).cloned()
        };
        match callback {
            Some(callback) => callback(params),
            None => {
                self.emit_error(&McpError::Internal(format!(
                    "progress notification for unknown token {}",
                    params.progress_token
                )));
            }
        }
    }

    fn handle_cancelled(&self, notification: JSONRPCNotification) {
        let params: CancelledNotificationParams =
            match serde_json::from_value(notification.params.unwrap_or(serde_json::Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    self.emit_error(&McpError::Internal(format!(
                        "malformed cancelled notification: {e}"
                    )));
                    return;
                }
            };
        let token = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            in_flight.remove(&params.request_id)
        };
        match token {
            Some(token) => {
                debug!(
                    "peer cancelled request {}: {}",
                    params.request_id,
                    params.reason.as_deref().unwrap_or("no reason given")
                );
                token.cancel();
            }
            None => {
                debug!(
                    "cancellation for unknown or finished request {}",
                    params.request_id
                );
            }
        }
    }

    async fn handle_request(&self, request: JSONRPCRequest) {
        let id = request.id.clone();
        if request.jsonrpc != JSONRPC_VERSION {
            self.respond_error(
                id,
                INVALID_REQUEST_CODE,
                format!("unsupported jsonrpc version {:?}", request.jsonrpc),
                None,
            )
            .await;
            return;
        }

        let handler = {
            let table = self
                .inner
                .request_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            table.get(&request.method).cloned()
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                let fallback = self
                    .inner
                    .fallback_request_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match fallback {
                    Some(handler) => handler,
                    None => {
                        self.respond_error(
                            id,
                            METHOD_NOT_FOUND_CODE,
                            format!("method not found: {}", request.method),
                            None,
                        )
                        .await;
                        return;
                    }
                }
            }
        };

        // Answering this method requires the corresponding local capability,
        // independent of strict mode. Without it the method effectively does
        // not exist on this peer.
        if let Err(e) = self
            .capabilities()
            .assert_request_handler_capability(&request.method)
        {
            self.respond_error(id, METHOD_NOT_FOUND_CODE, e.to_string(), None)
                .await;
            return;
        }

        let token = self.inner.session.child_token();
        {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            in_flight.insert(id.clone(), token.clone());
        }

        let context = RequestContext {
            request_id: id.clone(),
            cancellation: token.clone(),
            meta: request
                .params
                .as_ref()
                .and_then(|p| p.get("_meta"))
                .cloned(),
            peer: self.peer(),
        };

        // Request handlers run concurrently, one task each; only the write
        // of the response is serialized (by the transport).
        let engine = self.clone();
        tokio::spawn(async move {
            let invocation =
                std::panic::AssertUnwindSafe(handler(request, context)).catch_unwind();
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                outcome = invocation => Some(outcome),
            };
            {
                let mut in_flight = engine
                    .inner
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                in_flight.remove(&id);
            }
            let Some(outcome) = outcome else {
                // Cancelled: no response goes out for this id.
                return;
            };
            if token.is_cancelled() {
                // The handler finished in a dead heat with the cancellation;
                // the cancelled id still must not be answered.
                return;
            }
            match outcome {
                Ok(Ok(result)) => engine.respond_result(id, result).await,
                Ok(Err(e)) => {
                    engine
                        .respond_error(id, e.code(), e.to_string(), e.data())
                        .await;
                }
                Err(panic) => {
                    let message = panic_message(&panic);
                    engine
                        .respond_error(
                            id,
                            INTERNAL_ERROR_CODE,
                            message.clone(),
                            Some(serde_json::json!({"panic": message})),
                        )
                        .await;
                }
            }
        });
    }

    async fn respond_result(&self, id: RequestId, result: serde_json::Value) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let message = JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        });
        if let Err(e) = transport
            .send(message, TransportSendOptions::default())
            .await
        {
            self.emit_error(&McpError::Transport(e));
        }
    }

    async fn respond_error(
        &self,
        id: RequestId,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    ) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let message = JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JSONRPCErrorError {
                code,
                message,
                data,
            },
        });
        if let Err(e) = transport
            .send(message, TransportSendOptions::default())
            .await
        {
            self.emit_error(&McpError::Transport(e));
        }
    }

    fn remove_pending(&self, id: &RequestId) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.responses.remove(id);
        pending.progress.remove(id);
    }

    fn emit_error(&self, error: &McpError) {
        let hooks: Vec<ErrorHook> = self
            .inner
            .error_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if hooks.is_empty() {
            warn!("protocol error with no onError hook: {error}");
        }
        for hook in hooks {
            hook(error);
        }
    }

    /// Fail everything pending, cancel local handlers, notify close hooks.
    /// Runs at most once per session.
    fn run_close_cascade(&self) {
        if self.inner.cascaded.swap(true, Ordering::SeqCst) {
            return;
        }
        let completions: Vec<oneshot::Sender<Result<serde_json::Value>>> = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.progress.clear();
            pending.responses.drain().map(|(_, tx)| tx).collect()
        };
        for completion in completions {
            let _ = completion.send(Err(McpError::ConnectionClosed));
        }
        self.inner.session.cancel();
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let hooks: Vec<CloseHook> = self
            .inner
            .close_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook();
        }
    }
}

/// Merge the progress token into the request params without touching any
/// caller-owned value; existing `_meta` keys are preserved.
fn inject_progress_token(
    params: Option<serde_json::Value>,
    id: &RequestId,
) -> Result<serde_json::Value> {
    let mut map = match params {
        None => serde_json::Map::new(),
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            return Err(McpError::InvalidArgument(format!(
                "request params must be an object, got {other}"
            )));
        }
    };
    let meta = map
        .entry("_meta".to_string())
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    match meta {
        serde_json::Value::Object(meta) => {
            meta.insert("progressToken".to_string(), serde_json::to_value(id)?);
        }
        other => {
            return Err(McpError::InvalidArgument(format!(
                "_meta must be an object, got {other}"
            )));
        }
    }
    Ok(serde_json::Value::Object(map))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn inject_progress_token_preserves_existing_meta_keys() {
        let params = Some(json!({
            "name": "echo",
            "_meta": {"api.example.com/v": 1},
        }));
        let injected = inject_progress_token(params, &RequestId::Integer(7)).unwrap();
        assert_eq!(
            injected,
            json!({
                "name": "echo",
                "_meta": {"api.example.com/v": 1, "progressToken": 7},
            })
        );
    }

    #[test]
    fn inject_progress_token_creates_params_when_absent() {
        let injected = inject_progress_token(None, &RequestId::Integer(1)).unwrap();
        assert_eq!(injected, json!({"_meta": {"progressToken": 1}}));
    }

    #[test]
    fn inject_progress_token_rejects_non_object_params() {
        assert!(inject_progress_token(Some(json!([1, 2])), &RequestId::Integer(1)).is_err());
    }
}
