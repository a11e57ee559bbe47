//! MCP server implementation
//!
//! This module provides the responding side of a session: it answers the
//! initialize handshake, records the client's identity and capabilities,
//! dispatches incoming requests to registered handlers and issues
//! client-bound requests and notifications gated by the negotiated
//! capabilities.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::{CapabilityGate, ServerGate};
use crate::engine::{
    parse_params, ConnectionState, PendingResponse, Protocol, ProtocolOptions, RequestContext,
    RequestOptions, WeakProtocol, DEFAULT_REQUEST_TIMEOUT,
};
use crate::protocol::*;
use crate::transport::{CloseCallback, ErrorCallback, Transport};
use crate::{Error, Result};

/// Server-side session settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Versions the server accepts, newest first
    pub supported_versions: Vec<String>,
    /// Free-form usage hints returned in the initialize result
    pub instructions: Option<String>,
    /// Default deadline for client-bound requests
    pub request_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            instructions: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

/// Client session information
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    pub protocol_version: String,
    pub connected_at: DateTime<Utc>,
}

struct ServerShared {
    gate: Arc<ServerGate>,
    server_info: Implementation,
    options: ServerOptions,
    session: OnceLock<ClientSession>,
    initialized: watch::Sender<bool>,
}

impl ServerShared {
    /// Pick the version to answer with: the client's if we speak it, else our newest.
    fn negotiate(&self, requested: &str) -> String {
        if self.options.supported_versions.iter().any(|v| v == requested) {
            requested.to_string()
        } else {
            self.options
                .supported_versions
                .first()
                .cloned()
                .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
        }
    }

    fn initialize(&self, protocol: &WeakProtocol, params: InitializeParams) -> Result<InitializeResult> {
        let protocol_version = self.negotiate(&params.protocol_version);
        let session = ClientSession {
            client_info: params.client_info.clone(),
            capabilities: params.capabilities.clone(),
            protocol_version: protocol_version.clone(),
            connected_at: Utc::now(),
        };
        if self.session.set(session).is_err() {
            warn!(client = %params.client_info.name, "Rejecting repeated initialize");
            return Err(Error::Remote(JsonRpcError::invalid_request(
                "Session already initialized",
            )));
        }
        self.gate.set_remote(params.capabilities);

        if protocol_version != params.protocol_version {
            warn!(
                requested = %params.protocol_version,
                answered = %protocol_version,
                "Client requested an unsupported protocol version"
            );
        }
        info!(
            "Client initializing: {} v{} (protocol: {})",
            params.client_info.name, params.client_info.version, protocol_version
        );

        if let Some(protocol) = protocol.upgrade() {
            protocol.set_state(ConnectionState::Ready);
        }

        Ok(InitializeResult {
            protocol_version,
            capabilities: self.gate.local().clone(),
            server_info: self.server_info.clone(),
            instructions: self.options.instructions.clone(),
        })
    }
}

/// MCP server bound to one transport
pub struct McpServer {
    protocol: Protocol,
    shared: Arc<ServerShared>,
}

impl McpServer {
    /// Create a new MCP server with the default options
    pub fn new<T>(transport: T, server_info: Implementation, capabilities: ServerCapabilities) -> Self
    where
        T: Transport + 'static,
    {
        Self::with_options(transport, server_info, capabilities, ServerOptions::default())
    }

    pub fn with_options<T>(
        transport: T,
        server_info: Implementation,
        capabilities: ServerCapabilities,
        options: ServerOptions,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let gate = Arc::new(ServerGate::new(capabilities));
        let protocol = Protocol::new(
            Arc::new(transport),
            gate.clone() as Arc<dyn CapabilityGate>,
            "server",
            ProtocolOptions {
                default_timeout: options.request_timeout,
            },
        );
        let (initialized, _) = watch::channel(false);
        Self {
            protocol,
            shared: Arc::new(ServerShared {
                gate,
                server_info,
                options,
                session: OnceLock::new(),
                initialized,
            }),
        }
    }

    /// Install the handshake handlers and start listening on the transport.
    pub async fn start(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let weak = self.protocol.downgrade();
        self.protocol
            .set_internal_request_handler(methods::INITIALIZE, move |_ctx, params| {
                let shared = Arc::clone(&shared);
                let weak = weak.clone();
                async move {
                    let params: InitializeParams = parse_params(params)?;
                    let result = shared.initialize(&weak, params)?;
                    Ok(serde_json::to_value(result)?)
                }
            })?;

        let shared = Arc::clone(&self.shared);
        self.protocol
            .set_notification_handler(methods::INITIALIZED, move |_params| {
                debug!("Client confirmed initialization");
                shared.initialized.send_replace(true);
            });

        self.protocol.start().await?;
        info!(
            session = %self.protocol.session_id(),
            server = %self.shared.server_info.name,
            "MCP server listening"
        );
        Ok(())
    }

    /// Resolves once the client sent `notifications/initialized`.
    pub async fn wait_initialized(&self) -> Result<()> {
        let mut initialized = self.shared.initialized.subscribe();
        let mut state = self.protocol.subscribe_state();
        tokio::select! {
            biased;
            ready = initialized.wait_for(|done| *done) => {
                ready.map(|_| ()).map_err(|_| Error::ConnectionClosed)
            }
            _ = state.wait_for(|s| s.is_terminal()) => Err(Error::ConnectionClosed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.protocol.state()
    }

    pub fn session_id(&self) -> Uuid {
        self.protocol.session_id()
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn server_info(&self) -> &Implementation {
        &self.shared.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        self.shared.gate.local()
    }

    /// Handshake record; `None` until a client initialized
    pub fn client_session(&self) -> Option<&ClientSession> {
        self.shared.session.get()
    }

    pub fn client_info(&self) -> Option<&Implementation> {
        self.client_session().map(|s| &s.client_info)
    }

    pub fn client_capabilities(&self) -> Option<&ClientCapabilities> {
        self.shared.gate.remote()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.client_session().map(|s| s.protocol_version.as_str())
    }

    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.protocol.set_request_handler(method, handler)
    }

    /// Register a handler with typed params and result.
    pub fn set_typed_request_handler<P, R, F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        P: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.protocol.set_typed_request_handler(method, handler)
    }

    /// Register a notification handler; `notifications/initialized` is reserved.
    pub fn set_notification_handler<F>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        if method == methods::INITIALIZED {
            return Err(Error::Protocol {
                message: format!("{} is handled by the server itself", method),
            });
        }
        self.protocol.set_notification_handler(method, handler);
        Ok(())
    }

    pub fn on_close(&self, callback: CloseCallback) {
        self.protocol.set_on_close(callback);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.protocol.set_on_error(callback);
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.protocol
            .request(method, params, RequestOptions::default())
            .await
    }

    pub async fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<PendingResponse> {
        self.protocol.start_request(method, params, options).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.protocol.notify(method, params).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.protocol
            .request(methods::PING, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Ask the client to sample its model; requires the client's `sampling`.
    pub async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        self.protocol
            .request_as(
                methods::CREATE_MESSAGE,
                Some(serde_json::to_value(params)?),
                RequestOptions::default(),
            )
            .await
    }

    /// Ask the client for its roots; requires the client's `roots`.
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        self.protocol
            .request_as(methods::LIST_ROOTS, None, RequestOptions::default())
            .await
    }

    pub async fn send_logging_message(&self, params: LoggingMessageParams) -> Result<()> {
        self.protocol
            .notify(methods::LOGGING_MESSAGE, Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn send_resource_updated(&self, uri: &str) -> Result<()> {
        let params = serde_json::to_value(ResourceUriParams {
            uri: uri.to_string(),
        })?;
        self.protocol
            .notify(methods::RESOURCE_UPDATED, Some(params))
            .await
    }

    pub async fn send_resource_list_changed(&self) -> Result<()> {
        self.protocol
            .notify(methods::RESOURCES_LIST_CHANGED, None)
            .await
    }

    pub async fn send_tool_list_changed(&self) -> Result<()> {
        self.protocol.notify(methods::TOOLS_LIST_CHANGED, None).await
    }

    pub async fn send_prompt_list_changed(&self) -> Result<()> {
        self.protocol
            .notify(methods::PROMPTS_LIST_CHANGED, None)
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await?;
        info!(session = %self.protocol.session_id(), "MCP server connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("server_info", &self.shared.server_info)
            .field("protocol", &self.protocol)
            .field("client", &self.client_info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    /// Raw peer end that records every response it receives.
    async fn raw_peer(peer: &LoopbackTransport) -> mpsc::UnboundedReceiver<JsonRpcResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        peer.set_on_message(Arc::new(move |message| {
            if let JsonRpcMessage::Response(resp) = message {
                let _ = tx.send(resp);
            }
        }));
        peer.start().await.unwrap();
        rx
    }

    fn initialize(id: i64, version: &str) -> JsonRpcMessage {
        let params = InitializeParams {
            protocol_version: version.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("raw", "0.1.0"),
        };
        JsonRpcRequest::new(
            RequestId::Number(id),
            methods::INITIALIZE,
            Some(serde_json::to_value(params).unwrap()),
        )
        .into()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<JsonRpcResponse>) -> JsonRpcResponse {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_falls_back_to_its_newest_version() {
        let (a, b) = LoopbackTransport::pair();
        let server = McpServer::new(
            a,
            Implementation::new("test-server", "1.0.0"),
            ServerCapabilities::default(),
        );
        server.start().await.unwrap();
        let mut responses = raw_peer(&b).await;

        b.send(initialize(1, "1999-01-01")).await.unwrap();
        let result: InitializeResult =
            serde_json::from_value(next(&mut responses).await.result.unwrap()).unwrap();
        assert_eq!(result.protocol_version, LATEST_PROTOCOL_VERSION);
        assert_eq!(server.state(), ConnectionState::Ready);
        assert_eq!(server.client_info().unwrap().name, "raw");
    }

    #[tokio::test]
    async fn test_repeated_initialize_is_rejected() {
        let (a, b) = LoopbackTransport::pair();
        let server = McpServer::new(
            a,
            Implementation::new("test-server", "1.0.0"),
            ServerCapabilities::default(),
        );
        server.start().await.unwrap();
        let mut responses = raw_peer(&b).await;

        b.send(initialize(1, "2024-11-05")).await.unwrap();
        let first = next(&mut responses).await;
        assert_eq!(first.result.unwrap()["protocolVersion"], "2024-11-05");

        b.send(initialize(2, LATEST_PROTOCOL_VERSION)).await.unwrap();
        let second = next(&mut responses).await;
        assert_eq!(second.error.unwrap().code, error_codes::INVALID_REQUEST);
        assert_eq!(server.protocol_version(), Some("2024-11-05"));
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_refused() {
        let (a, b) = LoopbackTransport::pair();
        let server = McpServer::new(
            a,
            Implementation::new("test-server", "1.0.0"),
            ServerCapabilities::default(),
        );
        server
            .set_request_handler("custom/echo", |_, p| async move { Ok(p.unwrap_or(Value::Null)) })
            .unwrap();
        server.start().await.unwrap();
        let mut responses = raw_peer(&b).await;

        b.send(JsonRpcRequest::new(RequestId::Number(9), "custom/echo", None).into())
            .await
            .unwrap();
        let response = next(&mut responses).await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_REQUEST);
        assert_eq!(server.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_initialized_notification_is_reserved() {
        let (a, _b) = LoopbackTransport::pair();
        let server = McpServer::new(
            a,
            Implementation::new("test-server", "1.0.0"),
            ServerCapabilities::default(),
        );
        assert!(server
            .set_notification_handler(methods::INITIALIZED, |_| {})
            .is_err());
        assert!(server.set_notification_handler("custom/tick", |_| {}).is_ok());
    }

    #[tokio::test]
    async fn test_wait_initialized_ends_when_connection_closes() {
        let (a, b) = LoopbackTransport::pair();
        let server = McpServer::new(
            a,
            Implementation::new("test-server", "1.0.0"),
            ServerCapabilities::default(),
        );
        server.start().await.unwrap();
        b.start().await.unwrap();
        b.close().await.unwrap();

        let outcome = timeout(Duration::from_secs(5), server.wait_initialized())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(Error::ConnectionClosed)));
    }
}
