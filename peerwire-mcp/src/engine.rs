//! Protocol engine shared by the client and server roles
//!
//! The engine owns everything that does not depend on which side of the
//! connection it runs on:
//!
//! - the pending-request table correlating outbound requests with responses,
//! - the handler registry for inbound requests and notifications,
//! - the in-flight table used to interrupt running handlers on cancellation,
//! - the connection state that gates traffic until the handshake completes.
//!
//! # Resolution of outbound requests
//!
//! Every outbound request is resolved by exactly one of: a matching response,
//! an explicit cancel, its deadline, or the transport closing. All four paths
//! race on [`DashMap::remove`] for the request's entry; whoever removes it
//! resolves the caller, the others find nothing and do nothing. Responses that
//! arrive after their entry is gone are dropped.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::capabilities::{Capability, CapabilityGate};
use crate::protocol::{
    methods, CancelledParams, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
use crate::transport::{CloseCallback, ErrorCallback, Transport};
use crate::{Error, Result};

/// Handshake state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport attached, handshake not started
    Connecting,
    /// Initialize exchange in progress
    Initializing,
    /// Handshake complete; all operations permitted
    Ready,
    /// Handshake rejected; terminal
    Failed,
    /// Transport closed; terminal
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Deadline applied when neither the request nor the role configures one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deadline for the response; `None` falls back to the engine default
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Engine-wide options
#[derive(Debug, Clone, Default)]
pub struct ProtocolOptions {
    /// Deadline applied to requests that do not set their own
    pub default_timeout: Option<Duration>,
}

/// Execution context handed to request handlers
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    method: String,
    token: CancellationToken,
}

impl RequestContext {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Token cancelled when the caller abandons the request or the session closes
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Boxed future returned by request handlers
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;
/// Inbound request handler
pub type RequestHandler = Arc<dyn Fn(RequestContext, Option<Value>) -> HandlerFuture + Send + Sync>;
/// Inbound notification handler, run inline in delivery order
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Decode handler params; an absent params member reads as an empty object.
pub fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P> {
    let value = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| Error::InvalidParams {
        message: e.to_string(),
    })
}

struct HandlerEntry {
    handler: RequestHandler,
    capability: Option<Capability>,
}

/// Bookkeeping for one outbound request awaiting resolution
#[derive(Debug)]
struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Result<Value>>,
    created_at: DateTime<Utc>,
}

/// Inbound request being served; `serial` tells apart dispatches that share an id
struct InFlight {
    serial: u64,
    token: CancellationToken,
}

/// Role-independent session engine
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

struct ProtocolInner {
    session_id: Uuid,
    role: &'static str,
    transport: Arc<dyn Transport>,
    gate: Arc<dyn CapabilityGate>,
    options: ProtocolOptions,
    next_id: AtomicI64,
    state: watch::Sender<ConnectionState>,
    pending: DashMap<RequestId, PendingRequest>,
    in_flight: DashMap<RequestId, InFlight>,
    next_dispatch: AtomicU64,
    request_handlers: DashMap<String, HandlerEntry>,
    notification_handlers: DashMap<String, NotificationHandler>,
    on_close: RwLock<Option<CloseCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Protocol {
    /// Create an engine over `transport`; `role` only labels log lines.
    pub fn new(
        transport: Arc<dyn Transport>,
        gate: Arc<dyn CapabilityGate>,
        role: &'static str,
        options: ProtocolOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let protocol = Self {
            inner: Arc::new(ProtocolInner {
                session_id: Uuid::new_v4(),
                role,
                transport,
                gate,
                options,
                next_id: AtomicI64::new(0),
                state,
                pending: DashMap::new(),
                in_flight: DashMap::new(),
                next_dispatch: AtomicU64::new(0),
                request_handlers: DashMap::new(),
                notification_handlers: DashMap::new(),
                on_close: RwLock::new(None),
                on_error: RwLock::new(None),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        };
        protocol.inner.request_handlers.insert(
            methods::PING.to_string(),
            HandlerEntry {
                handler: Arc::new(|_ctx: RequestContext, _params: Option<Value>| -> HandlerFuture {
                    Box::pin(async { Ok(serde_json::json!({})) })
                }),
                capability: None,
            },
        );
        protocol
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Non-owning handle for handlers that need to reach back into the engine
    pub(crate) fn downgrade(&self) -> WeakProtocol {
        WeakProtocol {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Move to `next` unless the session already reached a terminal state.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.inner.set_state(next);
    }

    /// Claim the handshake: `Connecting` becomes `Initializing` in one step.
    ///
    /// Returns false when another caller already claimed it or the session
    /// left `Connecting` for any other reason.
    pub(crate) fn try_begin_handshake(&self) -> bool {
        let claimed = self.inner.state.send_if_modified(|current| {
            if *current == ConnectionState::Connecting {
                *current = ConnectionState::Initializing;
                true
            } else {
                false
            }
        });
        if claimed {
            info!(
                session = %self.inner.session_id,
                role = self.inner.role,
                state = %ConnectionState::Initializing,
                "Session state changed"
            );
        }
        claimed
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Number of outbound requests still awaiting resolution
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of inbound requests whose handler is still running
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Capability tag recorded for a registered request handler
    pub fn handler_capability(&self, method: &str) -> Option<Option<Capability>> {
        self.inner
            .request_handlers
            .get(method)
            .map(|entry| entry.capability)
    }

    pub fn set_on_close(&self, callback: CloseCallback) {
        *self.inner.on_close.write() = Some(callback);
    }

    pub fn set_on_error(&self, callback: ErrorCallback) {
        *self.inner.on_error.write() = Some(callback);
    }

    /// Install the transport callbacks and start the transport.
    pub async fn start(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::NotConnected {
                state: self.state(),
            });
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .transport
            .set_on_message(Arc::new(move |message| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(message);
                }
            }));

        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.set_on_close(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close();
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.set_on_error(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_error(error);
            }
        }));

        self.inner.transport.start().await?;
        debug!(
            session = %self.inner.session_id,
            role = self.inner.role,
            "Protocol engine attached to transport"
        );
        Ok(())
    }

    /// Register a handler for inbound requests of `method`.
    ///
    /// Fails if the local capabilities do not cover the method or a handler
    /// is already registered for it.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let capability = self.inner.gate.check_request_handler(method)?;
        self.insert_request_handler(method, capability, handler)
    }

    /// Register a handler that takes and returns typed payloads.
    ///
    /// Params that fail to decode are answered with `INVALID_PARAMS`.
    pub fn set_typed_request_handler<P, R, F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.set_request_handler(method, move |ctx, params| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = parse_params(params)?;
                let result = handler(ctx, params).await?;
                serde_json::to_value(result).map_err(|e| Error::Protocol {
                    message: format!("Failed to encode result: {}", e),
                })
            }
        })
    }

    /// Register a handler that is part of the role itself and bypasses the gate.
    pub(crate) fn set_internal_request_handler<F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert_request_handler(method, None, handler)
    }

    fn insert_request_handler<F, Fut>(
        &self,
        method: &str,
        capability: Option<Capability>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;

        let handler: RequestHandler =
            Arc::new(move |ctx: RequestContext, params: Option<Value>| -> HandlerFuture {
                Box::pin(handler(ctx, params))
            });
        match self.inner.request_handlers.entry(method.to_string()) {
            Entry::Occupied(_) => Err(Error::Protocol {
                message: format!("A request handler for {} is already registered", method),
            }),
            Entry::Vacant(slot) => {
                slot.insert(HandlerEntry {
                    handler,
                    capability,
                });
                debug!(
                    session = %self.inner.session_id,
                    role = self.inner.role,
                    method,
                    ?capability,
                    "Registered request handler"
                );
                Ok(())
            }
        }
    }

    /// Register a handler for inbound notifications of `method`, replacing any previous one.
    pub fn set_notification_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.inner
            .notification_handlers
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Send a request and return a handle to await or cancel its response.
    pub async fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<PendingResponse> {
        self.inner.ensure_can_send(method)?;
        self.inner.gate.check_request(method)?;

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (responder, receiver) = oneshot::channel();
        self.inner.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                responder,
                created_at: Utc::now(),
            },
        );

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.inner.transport.send(request.into()).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        debug!(
            session = %self.inner.session_id,
            role = self.inner.role,
            %id,
            method,
            "Sent request"
        );

        Ok(PendingResponse {
            id,
            receiver,
            timeout: options.timeout.or(self.inner.options.default_timeout),
            protocol: Arc::downgrade(&self.inner),
        })
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        self.start_request(method, params, options).await?.wait().await
    }

    /// Send a request and deserialize its result.
    pub async fn request_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<R> {
        let value = self.request(method, params, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification; nothing is awaited from the peer.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.ensure_can_send(method)?;
        self.inner.gate.check_notification(method)?;

        let notification = JsonRpcNotification::new(method, params);
        self.inner.transport.send(notification.into()).await?;
        debug!(
            session = %self.inner.session_id,
            role = self.inner.role,
            method,
            "Sent notification"
        );
        Ok(())
    }

    /// Cancel an outbound request; returns false if it was already resolved.
    pub async fn cancel_request(&self, id: &RequestId, reason: impl Into<String>) -> bool {
        self.inner.cancel(id, reason.into()).await
    }

    /// Close the transport and settle everything still outstanding.
    pub async fn close(&self) -> Result<()> {
        let result = self.inner.transport.close().await;
        // Transports are expected to fire on_close, but settle regardless.
        self.inner.handle_close();
        result
    }
}

#[derive(Clone)]
pub(crate) struct WeakProtocol {
    inner: Weak<ProtocolInner>,
}

impl WeakProtocol {
    pub(crate) fn upgrade(&self) -> Option<Protocol> {
        self.inner.upgrade().map(|inner| Protocol { inner })
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("session_id", &self.inner.session_id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl ProtocolInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(
                session = %self.session_id,
                role = self.role,
                state = %next,
                "Session state changed"
            );
        }
    }

    fn ensure_can_send(&self, method: &str) -> Result<()> {
        let state = self.state();
        let allowed = match method {
            methods::INITIALIZE => matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Initializing
            ),
            _ => state == ConnectionState::Ready,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::NotConnected { state })
        }
    }

    fn accepts(&self, method: &str) -> bool {
        match method {
            methods::INITIALIZE | methods::INITIALIZED | methods::CANCELLED => true,
            _ => self.state() == ConnectionState::Ready,
        }
    }

    fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Request(request) => self.handle_request(request),
            JsonRpcMessage::Notification(notification) => self.handle_notification(notification),
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let id = response.id.clone();
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                let elapsed = Utc::now() - entry.created_at;
                debug!(
                    session = %self.session_id,
                    role = self.role,
                    %id,
                    method = %entry.method,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Received response"
                );
                let outcome = response.into_result().map_err(Error::Remote);
                if entry.responder.send(outcome).is_err() {
                    debug!(session = %self.session_id, %id, "Caller went away before the response");
                }
            }
            None => {
                debug!(
                    session = %self.session_id,
                    role = self.role,
                    %id,
                    "Discarding response for unknown or already settled request"
                );
            }
        }
    }

    fn handle_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let JsonRpcRequest {
            jsonrpc,
            id,
            method,
            params,
        } = request;

        if jsonrpc != JSONRPC_VERSION || method.is_empty() {
            warn!(session = %self.session_id, %id, "Rejecting malformed request");
            self.respond(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Malformed request"),
            ));
            return;
        }

        if !self.accepts(&method) {
            warn!(
                session = %self.session_id,
                role = self.role,
                %id,
                %method,
                "Rejecting request before initialization"
            );
            self.respond(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Session not initialized"),
            ));
            return;
        }

        let handler = self
            .request_handlers
            .get(&method)
            .map(|entry| Arc::clone(&entry.handler));
        let Some(handler) = handler else {
            warn!(session = %self.session_id, role = self.role, %id, %method, "Unknown method");
            self.respond(JsonRpcResponse::error(
                id,
                JsonRpcError::method_not_found(&method),
            ));
            return;
        };

        let token = self.shutdown.child_token();
        let serial = self.next_dispatch.fetch_add(1, Ordering::SeqCst);
        let entry = InFlight {
            serial,
            token: token.clone(),
        };
        if self.in_flight.insert(id.clone(), entry).is_some() {
            warn!(session = %self.session_id, %id, "Peer reused an in-flight request id");
        }
        trace!(session = %self.session_id, role = self.role, %id, %method, "Dispatching request");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = RequestContext {
                request_id: id.clone(),
                method: method.clone(),
                token: token.clone(),
            };
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = handler(ctx, params) => Some(result),
            };
            inner
                .in_flight
                .remove_if(&id, |_, entry| entry.serial == serial);

            let response = match outcome {
                Some(_) if token.is_cancelled() => None,
                Some(Ok(result)) => Some(JsonRpcResponse::success(id.clone(), result)),
                Some(Err(e)) => {
                    debug!(session = %inner.session_id, %id, %method, "Handler failed: {}", e);
                    Some(JsonRpcResponse::error(id.clone(), e.to_rpc_error()))
                }
                None => None,
            };

            match response {
                Some(response) => {
                    if let Err(e) = inner.transport.send(response.into()).await {
                        warn!(session = %inner.session_id, %id, "Failed to send response: {}", e);
                    }
                }
                None => {
                    debug!(
                        session = %inner.session_id,
                        role = inner.role,
                        %id,
                        %method,
                        "Handler interrupted, no response sent"
                    );
                }
            }
        });
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        if notification.method == methods::CANCELLED {
            self.handle_remote_cancel(notification.params);
            return;
        }

        if !self.accepts(&notification.method) {
            debug!(
                session = %self.session_id,
                role = self.role,
                method = %notification.method,
                "Ignoring notification before initialization"
            );
            return;
        }

        let handler = self
            .notification_handlers
            .get(&notification.method)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler(notification.params),
            None => trace!(
                session = %self.session_id,
                method = %notification.method,
                "No handler for notification"
            ),
        }
    }

    fn handle_remote_cancel(&self, params: Option<Value>) {
        let params: CancelledParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            _ => {
                warn!(session = %self.session_id, "Malformed cancellation notification");
                return;
            }
        };

        match self.in_flight.remove(&params.request_id) {
            Some((id, entry)) => {
                entry.token.cancel();
                info!(
                    session = %self.session_id,
                    role = self.role,
                    %id,
                    reason = params.reason.as_deref().unwrap_or(""),
                    "Peer cancelled request"
                );
            }
            None => debug!(
                session = %self.session_id,
                id = %params.request_id,
                "Cancellation for a request that is not running"
            ),
        }
    }

    async fn cancel(&self, id: &RequestId, reason: String) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            debug!(session = %self.session_id, %id, "Cancel ignored, request already settled");
            return false;
        };

        let _ = entry.responder.send(Err(Error::RequestCancelled {
            reason: reason.clone(),
        }));
        info!(session = %self.session_id, role = self.role, %id, %reason, "Cancelled request");

        if entry.method != methods::INITIALIZE {
            self.send_cancelled(id.clone(), reason).await;
        }
        true
    }

    /// Best-effort notice to the peer so it can stop working on `id`.
    async fn send_cancelled(&self, id: RequestId, reason: String) {
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!(session = %self.session_id, %id, "Failed to encode cancellation: {}", e);
                return;
            }
        };
        let notification = JsonRpcNotification::new(methods::CANCELLED, Some(params));
        if let Err(e) = self.transport.send(notification.into()).await {
            debug!(session = %self.session_id, %id, "Could not deliver cancellation: {}", e);
        }
    }

    fn respond(self: &Arc<Self>, response: JsonRpcResponse) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let id = response.id.clone();
            if let Err(e) = inner.transport.send(response.into()).await {
                warn!(session = %inner.session_id, %id, "Failed to send response: {}", e);
            }
        });
    }

    fn handle_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.shutdown.cancel();
        self.in_flight.clear();

        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut settled = 0usize;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.responder.send(Err(Error::ConnectionClosed));
                settled += 1;
            }
        }
        info!(
            session = %self.session_id,
            role = self.role,
            settled,
            "Session closed"
        );

        let callback = self.on_close.read().clone();
        if let Some(cb) = callback {
            cb();
        }
    }

    fn handle_error(&self, error: Error) {
        warn!(session = %self.session_id, role = self.role, "Transport error: {}", error);
        let callback = self.on_error.read().clone();
        if let Some(cb) = callback {
            cb(error);
        }
    }
}

/// Handle to an outbound request awaiting its response
///
/// Dropping the handle before it resolved abandons the request and notifies
/// the peer.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    receiver: oneshot::Receiver<Result<Value>>,
    timeout: Option<Duration>,
    protocol: Weak<ProtocolInner>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Detached handle that can cancel this request from another task
    pub fn canceller(&self) -> RequestCanceller {
        RequestCanceller {
            id: self.id.clone(),
            protocol: self.protocol.clone(),
        }
    }

    /// Wait for the response, the deadline, a cancel or the connection closing.
    pub async fn wait(mut self) -> Result<Value> {
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(outcome) => outcome,
                Err(_) => return self.expire(limit).await,
            },
            None => (&mut self.receiver).await,
        };
        outcome.unwrap_or(Err(Error::ConnectionClosed))
    }

    async fn expire(&mut self, limit: Duration) -> Result<Value> {
        let Some(inner) = self.protocol.upgrade() else {
            return Err(Error::RequestTimedOut { timeout: limit });
        };

        match inner.pending.remove(&self.id) {
            Some((_, entry)) => {
                warn!(
                    session = %inner.session_id,
                    role = inner.role,
                    id = %self.id,
                    method = %entry.method,
                    timeout_ms = limit.as_millis() as u64,
                    "Request timed out"
                );
                if entry.method != methods::INITIALIZE {
                    inner
                        .send_cancelled(self.id.clone(), format!("Request timed out after {:?}", limit))
                        .await;
                }
                Err(Error::RequestTimedOut { timeout: limit })
            }
            // Another path settled the entry as the timer fired; take its outcome.
            None => (&mut self.receiver)
                .await
                .unwrap_or(Err(Error::ConnectionClosed)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let Some(inner) = self.protocol.upgrade() else {
            return;
        };
        if inner.pending.remove(&self.id).is_none() {
            return;
        }
        debug!(session = %inner.session_id, id = %self.id, "Pending response dropped, abandoning request");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let id = self.id.clone();
            handle.spawn(async move {
                inner
                    .send_cancelled(id, "Request abandoned by caller".to_string())
                    .await;
            });
        }
    }
}

/// Cancels one outbound request
#[derive(Debug, Clone)]
pub struct RequestCanceller {
    id: RequestId,
    protocol: Weak<ProtocolInner>,
}

impl RequestCanceller {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Resolve the caller with `RequestCancelled`; false if already settled.
    pub async fn cancel(&self, reason: impl Into<String>) -> bool {
        match self.protocol.upgrade() {
            Some(inner) => inner.cancel(&self.id, reason.into()).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ClientGate;
    use crate::protocol::{error_codes, ClientCapabilities};
    use crate::transport::LoopbackTransport;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Two engines over a loopback pair, both already marked ready.
    async fn ready_pair() -> (Protocol, Protocol) {
        let (a, b) = LoopbackTransport::pair();
        let gate = || Arc::new(ClientGate::new(ClientCapabilities::default()));
        let left = Protocol::new(Arc::new(a), gate(), "left", ProtocolOptions::default());
        let right = Protocol::new(Arc::new(b), gate(), "right", ProtocolOptions::default());
        left.start().await.unwrap();
        right.start().await.unwrap();
        left.set_state(ConnectionState::Ready);
        right.set_state(ConnectionState::Ready);
        (left, right)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (left, right) = ready_pair().await;
        right
            .set_request_handler("echo", |_ctx, params| async move {
                Ok(params.unwrap_or(Value::Null))
            })
            .unwrap();

        let result = left
            .request("echo", Some(json!({"n": 1})), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result, json!({"n": 1}));
        assert_eq!(left.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_is_answered_by_the_engine() {
        let (left, _right) = ready_pair().await;
        let pong = left
            .request(methods::PING, None, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(pong, json!({}));
    }

    #[tokio::test]
    async fn test_unknown_method_returns_method_not_found() {
        let (left, _right) = ready_pair().await;
        let err = left
            .request("does/not/exist", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(error_codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_before_ready() {
        let (a, _b) = LoopbackTransport::pair();
        let protocol = Protocol::new(
            Arc::new(a.clone()),
            Arc::new(ClientGate::default()),
            "client",
            ProtocolOptions::default(),
        );
        protocol.start().await.unwrap();

        let err = protocol
            .request(methods::PING, None, RequestOptions::default())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::NotConnected {
                state: ConnectionState::Connecting
            }
        );
        assert_matches!(
            protocol.notify("custom/event", None).await,
            Err(Error::NotConnected { .. })
        );
        assert_eq!(a.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_reused_request_id_keeps_latest_dispatch_cancellable() {
        let (a, peer) = LoopbackTransport::pair();
        let protocol = Protocol::new(
            Arc::new(a),
            Arc::new(ClientGate::default()),
            "server",
            ProtocolOptions::default(),
        );
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        protocol
            .set_request_handler("hold", move |ctx, params| {
                let started_tx = started_tx.clone();
                let mut release = release_rx.clone();
                async move {
                    let first = params.is_some_and(|p| p["first"] == json!(true));
                    let _ = started_tx.send(ctx.cancellation_token().clone());
                    if first {
                        let _ = release.wait_for(|go| *go).await;
                    } else {
                        ctx.cancelled().await;
                    }
                    Ok(Value::Null)
                }
            })
            .unwrap();
        protocol.start().await.unwrap();
        protocol.set_state(ConnectionState::Ready);

        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
        peer.set_on_message(Arc::new(move |message| {
            let _ = inbox_tx.send(message);
        }));
        peer.start().await.unwrap();

        let id = RequestId::Number(7);
        for first in [true, false] {
            peer.send(JsonRpcRequest::new(id.clone(), "hold", Some(json!({ "first": first }))).into())
                .await
                .unwrap();
            timeout(Duration::from_secs(1), started_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(protocol.in_flight_count(), 1);

        // The first dispatch finishes; its cleanup must leave the second alone.
        release_tx.send(true).unwrap();
        let reply = timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), Some(&id));
        assert_eq!(protocol.in_flight_count(), 1);

        let cancel = CancelledParams {
            request_id: id.clone(),
            reason: Some("stop".to_string()),
        };
        peer.send(
            JsonRpcNotification::new(methods::CANCELLED, Some(serde_json::to_value(cancel).unwrap()))
                .into(),
        )
        .await
        .unwrap();
        timeout(Duration::from_secs(1), async {
            while protocol.in_flight_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("second dispatch should be cancellable by id");
    }

    #[tokio::test]
    async fn test_duplicate_handler_registration_is_rejected() {
        let (left, _right) = ready_pair().await;
        left.set_request_handler("x", |_, _| async { Ok(json!({})) })
            .unwrap();
        assert_matches!(
            left.set_request_handler("x", |_, _| async { Ok(json!({})) }),
            Err(Error::Protocol { .. })
        );
        assert_eq!(left.handler_capability("x"), Some(None));
    }

    #[tokio::test]
    async fn test_handler_errors_become_error_responses() {
        let (left, right) = ready_pair().await;
        right
            .set_request_handler("strict", |_, _| async {
                Err(Error::InvalidParams {
                    message: "expected uri".to_string(),
                })
            })
            .unwrap();

        let err = left
            .request("strict", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Remote(ref e) if e.code == error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_params() {
        #[derive(Deserialize)]
        struct Greet {
            name: String,
        }

        let (left, right) = ready_pair().await;
        right
            .set_typed_request_handler("greet", |_ctx, params: Greet| async move {
                Ok(format!("hello {}", params.name))
            })
            .unwrap();

        let value = left
            .request("greet", Some(json!({"name": "ada"})), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!("hello ada"));

        let err = left
            .request("greet", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_late_response_after_cancel_is_discarded() {
        let (left, right) = ready_pair().await;
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        right
            .set_request_handler("slow", move |_ctx, _| {
                let mut release = release_rx.clone();
                async move {
                    let _ = release.wait_for(|go| *go).await;
                    Ok(json!("late"))
                }
            })
            .unwrap();

        let pending = left
            .start_request("slow", None, RequestOptions::default())
            .await
            .unwrap();
        let id = pending.id().clone();
        assert!(left.cancel_request(&id, "changed my mind").await);
        assert!(!left.cancel_request(&id, "again").await);

        let err = pending.wait().await.unwrap_err();
        assert_matches!(err, Error::RequestCancelled { ref reason } if reason == "changed my mind");
        release_tx.send(true).unwrap();

        // Subsequent traffic is unaffected by the discarded reply.
        right
            .set_request_handler("fast", |_, _| async { Ok(json!("ok")) })
            .unwrap();
        let value = left
            .request("fast", None, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
    }

    #[tokio::test]
    async fn test_notifications_delivered_in_order() {
        let (left, right) = ready_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.set_notification_handler("tick", move |params| {
            let _ = tx.send(params);
        });

        for i in 0..10 {
            left.notify("tick", Some(json!(i))).await.unwrap();
        }
        for i in 0..10 {
            let got = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_close_settles_pending_requests() {
        let (left, right) = ready_pair().await;
        right
            .set_request_handler("never", |ctx, _| async move {
                ctx.cancelled().await;
                Ok(Value::Null)
            })
            .unwrap();

        let first = left
            .start_request("never", None, RequestOptions::default())
            .await
            .unwrap();
        let second = left
            .start_request("never", None, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(left.pending_count(), 2);

        left.close().await.unwrap();
        assert_matches!(first.wait().await, Err(Error::ConnectionClosed));
        assert_matches!(second.wait().await, Err(Error::ConnectionClosed));
        assert_eq!(left.state(), ConnectionState::Closed);
        assert_matches!(
            left.request("never", None, RequestOptions::default()).await,
            Err(Error::NotConnected { state: ConnectionState::Closed })
        );
    }

    #[tokio::test]
    async fn test_dropped_pending_response_is_abandoned() {
        let (left, right) = ready_pair().await;
        let (token_tx, mut token_rx) = mpsc::unbounded_channel();
        right
            .set_request_handler("hang", move |ctx, _| {
                let token_tx = token_tx.clone();
                async move {
                    let _ = token_tx.send(ctx.cancellation_token().clone());
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }
            })
            .unwrap();

        let pending = left
            .start_request("hang", None, RequestOptions::default())
            .await
            .unwrap();
        let token = timeout(Duration::from_secs(1), token_rx.recv())
            .await
            .unwrap()
            .unwrap();
        drop(pending);

        assert_eq!(left.pending_count(), 0);
        timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("handler should be interrupted");
    }

    #[tokio::test]
    async fn test_state_transitions_stop_at_terminal() {
        let (left, _right) = ready_pair().await;
        let mut watcher = left.subscribe_state();
        left.set_state(ConnectionState::Failed);
        left.set_state(ConnectionState::Ready);
        assert_eq!(left.state(), ConnectionState::Failed);
        assert_eq!(*watcher.borrow_and_update(), ConnectionState::Failed);
    }
}
