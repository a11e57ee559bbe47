//! Bidirectional MCP session engine
//!
//! This crate lets two peers, an initiating client and a responding server,
//! exchange typed requests, responses and notifications over an abstract
//! duplex channel after negotiating a protocol version and the optional
//! capabilities each side supports.
//!
//! # Architecture
//!
//! - **[`protocol`]**: JSON-RPC 2.0 envelope, MCP payloads, method names and versions
//! - **[`capabilities`]**: capability tags and the method -> capability gates
//! - **[`engine`]**: role-independent engine correlating requests, dispatching
//!   handlers and propagating cancellation
//! - **[`client`]** / **[`server`]**: the two session roles
//! - **[`transport`]**: transport trait plus an in-process loopback pair
//! - **[`config`]**: layered configuration for sessions and logging
//! - **[`error`]**: error type shared by every operation
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |-- initialize {version, caps, info} --->|
//!   |<----- {version, caps, info} -----------|  server: Ready
//!   |  client: Ready                         |
//!   |-- notifications/initialized ---------->|
//!   |                                        |
//!   |-- tools/list ------------------------->|  gated on server `tools`
//!   |<---------------------- tools list -----|
//!   |                                        |
//!   |<-------------- sampling/createMessage -|  gated on client `sampling`
//!   |-- result ----------------------------->|
//!   |                                        |
//!   |-- notifications/cancelled {id} ------->|  handler interrupted
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use peerwire_mcp::{protocol::*, transport::LoopbackTransport, McpClient, McpServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_end, server_end) = LoopbackTransport::pair();
//!
//! let server = McpServer::new(
//!     server_end,
//!     Implementation::new("example-server", "1.0.0"),
//!     ServerCapabilities {
//!         tools: Some(ToolsCapability::default()),
//!         ..Default::default()
//!     },
//! );
//! server.set_typed_request_handler(methods::LIST_TOOLS, |_ctx, _params: PaginatedParams| async {
//!     Ok(ListToolsResult::default())
//! })?;
//! server.start().await?;
//!
//! let client = McpClient::new(
//!     client_end,
//!     Implementation::new("example-client", "1.0.0"),
//!     ClientCapabilities::default(),
//! );
//! let init = client.connect().await?;
//! assert_eq!(init.protocol_version, LATEST_PROTOCOL_VERSION);
//!
//! let tools = client.list_tools(None).await?;
//! assert!(tools.tools.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientOptions, McpClient};
pub use engine::{ConnectionState, PendingResponse, Protocol, RequestCanceller, RequestContext, RequestOptions};
pub use error::{Error, Result};
pub use server::{McpServer, ServerOptions};
