//! MCP client implementation

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::capabilities::ClientGate;
use crate::engine::{
    ConnectionState, PendingResponse, Protocol, ProtocolOptions, RequestContext, RequestOptions,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::protocol::*;
use crate::transport::{CloseCallback, ErrorCallback, Transport};
use crate::{Error, Result};

/// Client-side session settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Versions the client accepts, newest first; the first one is offered
    pub supported_versions: Vec<String>,
    /// Default deadline for outbound requests
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

/// MCP client for connecting to MCP servers
pub struct McpClient {
    protocol: Protocol,
    gate: Arc<ClientGate>,
    client_info: Implementation,
    options: ClientOptions,
    handshake: OnceLock<InitializeResult>,
}

impl McpClient {
    /// Create a new MCP client
    pub fn new<T>(transport: T, client_info: Implementation, capabilities: ClientCapabilities) -> Self
    where
        T: Transport + 'static,
    {
        Self::with_options(transport, client_info, capabilities, ClientOptions::default())
    }

    pub fn with_options<T>(
        transport: T,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        options: ClientOptions,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let gate = Arc::new(ClientGate::new(capabilities));
        let protocol = Protocol::new(
            Arc::new(transport),
            gate.clone(),
            "client",
            ProtocolOptions {
                default_timeout: options.request_timeout,
            },
        );
        Self {
            protocol,
            gate,
            client_info,
            options,
            handshake: OnceLock::new(),
        }
    }

    /// Start the transport and run the initialize handshake.
    ///
    /// On any failure the transport is closed and the client ends up `Failed`
    /// (or `Closed` if the peer went away first). Only one caller runs the
    /// handshake; a concurrent `connect` is refused and leaves it untouched.
    pub async fn connect(&self) -> Result<InitializeResult> {
        if !self.protocol.try_begin_handshake() {
            return match self.protocol.state() {
                state if state.is_terminal() => Err(Error::NotConnected { state }),
                _ => Err(Error::Protocol {
                    message: "Client is already connected".to_string(),
                }),
            };
        }

        if let Err(e) = self.protocol.start().await {
            error!(session = %self.protocol.session_id(), "Transport failed to start: {}", e);
            self.fail().await;
            return Err(e);
        }

        let params = InitializeParams {
            protocol_version: self
                .options
                .supported_versions
                .first()
                .cloned()
                .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string()),
            capabilities: self.gate.local().clone(),
            client_info: self.client_info.clone(),
        };
        debug!(
            session = %self.protocol.session_id(),
            version = %params.protocol_version,
            "Sending initialize"
        );

        let result: InitializeResult = match self
            .protocol
            .request_as(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(session = %self.protocol.session_id(), "Initialization failed: {}", e);
                self.fail().await;
                return Err(e);
            }
        };

        if !self
            .options
            .supported_versions
            .iter()
            .any(|v| *v == result.protocol_version)
        {
            error!(
                session = %self.protocol.session_id(),
                version = %result.protocol_version,
                "Server answered with an unsupported protocol version"
            );
            self.fail().await;
            return Err(Error::VersionUnsupported {
                version: result.protocol_version,
            });
        }

        self.gate.set_remote(result.capabilities.clone());
        let _ = self.handshake.set(result.clone());
        self.protocol.set_state(ConnectionState::Ready);
        info!(
            session = %self.protocol.session_id(),
            version = %result.protocol_version,
            server = %result.server_info.name,
            "MCP client initialized successfully"
        );

        self.protocol.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    async fn fail(&self) {
        self.protocol.set_state(ConnectionState::Failed);
        if let Err(e) = self.protocol.close().await {
            debug!(session = %self.protocol.session_id(), "Error closing failed session: {}", e);
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

    pub fn client_info(&self) -> &Implementation {
        &self.client_info
    }

    pub fn capabilities(&self) -> &ClientCapabilities {
        self.gate.local()
    }

    /// Capabilities the server declared; `None` until the handshake completed
    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.gate.remote()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.handshake.get().map(|r| &r.server_info)
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> Option<&str> {
        self.handshake.get().map(|r| r.protocol_version.as_str())
    }

    pub fn instructions(&self) -> Option<&str> {
        self.handshake.get().and_then(|r| r.instructions.as_deref())
    }

    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.protocol.set_request_handler(method, handler)
    }

    pub fn set_notification_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.protocol.set_notification_handler(method, handler)
    }

    /// Serve `sampling/createMessage`; requires the `sampling` capability.
    pub fn on_create_message<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, CreateMessageParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CreateMessageResult>> + Send + 'static,
    {
        self.protocol
            .set_typed_request_handler(methods::CREATE_MESSAGE, handler)
    }

    /// Serve `roots/list`; requires the `roots` capability.
    pub fn on_list_roots<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ListRootsResult>> + Send + 'static,
    {
        self.protocol.set_typed_request_handler(
            methods::LIST_ROOTS,
            move |ctx, _params: PaginatedParams| handler(ctx),
        )
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

    /// Send a ping message
    pub async fn ping(&self) -> Result<()> {
        self.protocol
            .request(methods::PING, None, RequestOptions::default())
            .await?;
        debug!("Ping successful");
        Ok(())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        let params = serde_json::to_value(PaginatedParams { cursor })?;
        self.protocol
            .request_as(methods::LIST_TOOLS, Some(params), RequestOptions::default())
            .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        self.protocol
            .request_as(methods::CALL_TOOL, Some(params), RequestOptions::default())
            .await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        let params = serde_json::to_value(PaginatedParams { cursor })?;
        self.protocol
            .request_as(methods::LIST_RESOURCES, Some(params), RequestOptions::default())
            .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        let params = serde_json::to_value(ResourceUriParams {
            uri: uri.to_string(),
        })?;
        self.protocol
            .request(methods::SUBSCRIBE_RESOURCE, Some(params), RequestOptions::default())
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        let params = serde_json::to_value(ResourceUriParams {
            uri: uri.to_string(),
        })?;
        self.protocol
            .request(methods::UNSUBSCRIBE_RESOURCE, Some(params), RequestOptions::default())
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        let params = serde_json::to_value(PaginatedParams { cursor })?;
        self.protocol
            .request_as(methods::LIST_PROMPTS, Some(params), RequestOptions::default())
            .await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        let params = serde_json::to_value(SetLevelParams { level })?;
        self.protocol
            .request(methods::SET_LOGGING_LEVEL, Some(params), RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Tell the server the client's roots changed; requires `roots.listChanged`.
    pub async fn send_roots_list_changed(&self) -> Result<()> {
        self.protocol
            .notify(methods::ROOTS_LIST_CHANGED, None)
            .await
    }

    /// Close the client connection
    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await?;
        info!(session = %self.protocol.session_id(), "MCP client connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("client_info", &self.client_info)
            .field("protocol", &self.protocol)
            .field("protocol_version", &self.protocol_version())
            .finish()
    }
}
