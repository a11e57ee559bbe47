use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use peerwire_mcp::{
    config::Config,
    protocol::{
        ClientCapabilities, EmptyCapability, Implementation, ListToolsResult, PaginatedParams,
        ServerCapabilities, Tool, ToolsCapability,
    },
    transport::LoopbackTransport,
    McpClient, McpServer,
};

#[derive(Parser)]
#[command(name = "peerwire-loopback")]
#[command(about = "Run an MCP client and server against each other over an in-process loopback")]
struct Args {
    /// Configuration file (defaults to config/default and config/local if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(long)]
    log_level: Option<String>,

    /// Number of ping round trips to perform after the handshake
    #[arg(long, default_value = "100")]
    round_trips: usize,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, args.json_logs || config.logging.format == "json");

    info!("Starting peerwire loopback session");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Supported versions: {}",
        config.session.supported_versions.join(", ")
    );

    let (client_end, server_end) = LoopbackTransport::pair();

    let server = McpServer::with_options(
        server_end,
        Implementation::new("peerwire-demo-server", env!("CARGO_PKG_VERSION")),
        ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            logging: Some(EmptyCapability {}),
            ..Default::default()
        },
        config
            .session
            .server_options(Some("Loopback demo server".to_string())),
    );
    server.set_typed_request_handler(
        peerwire_mcp::protocol::methods::LIST_TOOLS,
        |_ctx, _params: PaginatedParams| async {
            Ok(ListToolsResult {
                tools: vec![Tool {
                    name: "echo".to_string(),
                    description: Some("Returns its arguments".to_string()),
                    input_schema: json!({ "type": "object" }),
                }],
                next_cursor: None,
            })
        },
    )?;
    server.start().await?;

    let client = McpClient::with_options(
        client_end,
        Implementation::new("peerwire-demo-client", env!("CARGO_PKG_VERSION")),
        ClientCapabilities::default(),
        config.session.client_options(),
    );

    let handshake = client.connect().await.context("handshake failed")?;
    server.wait_initialized().await?;
    info!(
        "Negotiated protocol {} with {} v{}",
        handshake.protocol_version, handshake.server_info.name, handshake.server_info.version
    );

    let tools = client.list_tools(None).await?;
    info!(
        "Server offers {} tool(s): {}",
        tools.tools.len(),
        tools
            .tools
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let started = Instant::now();
    for _ in 0..args.round_trips {
        client.ping().await?;
    }
    let elapsed = started.elapsed();
    info!(
        "Completed {} ping round trips in {:?}",
        args.round_trips, elapsed
    );

    if let Err(e) = client.list_prompts(None).await {
        warn!("Prompt listing refused as expected: {}", e);
    }

    client.close().await?;
    info!("Server session ended in state {}", server.state());
    Ok(())
}
