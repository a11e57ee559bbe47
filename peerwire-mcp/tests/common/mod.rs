//! Shared harness for the end-to-end session tests.
//!
//! Builds a client and a server wired together over a loopback pair and
//! keeps a handle on both transport ends so tests can inspect traffic.
#![allow(dead_code)]

use std::time::Duration;

use peerwire_mcp::{
    protocol::{ClientCapabilities, Implementation, ServerCapabilities},
    transport::LoopbackTransport,
    ClientOptions, McpClient, McpServer, ServerOptions,
};

/// Upper bound for any single await in the suite
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("peerwire_mcp=debug")
        .try_init();
}

pub fn client_info() -> Implementation {
    Implementation::new("test-client", "1.0.0")
}

pub fn server_info() -> Implementation {
    Implementation::new("test-server", "1.0.0")
}

/// A client and server over one loopback pair, not yet connected
pub struct TestSession {
    pub client: McpClient,
    pub server: McpServer,
    pub client_transport: LoopbackTransport,
    pub server_transport: LoopbackTransport,
}

impl TestSession {
    pub fn new(client_caps: ClientCapabilities, server_caps: ServerCapabilities) -> Self {
        Self::with_options(
            client_caps,
            server_caps,
            ClientOptions::default(),
            ServerOptions::default(),
        )
    }

    pub fn with_options(
        client_caps: ClientCapabilities,
        server_caps: ServerCapabilities,
        client_options: ClientOptions,
        server_options: ServerOptions,
    ) -> Self {
        init_tracing();
        let (client_end, server_end) = LoopbackTransport::pair();
        let client_transport = client_end.clone();
        let server_transport = server_end.clone();

        Self {
            client: McpClient::with_options(client_end, client_info(), client_caps, client_options),
            server: McpServer::with_options(server_end, server_info(), server_caps, server_options),
            client_transport,
            server_transport,
        }
    }

    /// Start the server, run the handshake and wait for `notifications/initialized`.
    pub async fn connect(&self) {
        self.server.start().await.expect("server start");
        tokio::time::timeout(TEST_TIMEOUT, self.client.connect())
            .await
            .expect("handshake timed out")
            .expect("handshake failed");
        tokio::time::timeout(TEST_TIMEOUT, self.server.wait_initialized())
            .await
            .expect("initialized notification timed out")
            .expect("session closed before initialized");
    }

    /// Connected session with the given capabilities
    pub async fn connected(client_caps: ClientCapabilities, server_caps: ServerCapabilities) -> Self {
        let session = Self::new(client_caps, server_caps);
        session.connect().await;
        session
    }
}
