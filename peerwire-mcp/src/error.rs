//! Error types for MCP session operations

use std::time::Duration;

use thiserror::Error;

use crate::capabilities::Capability;
use crate::engine::ConnectionState;
use crate::protocol::{error_codes, JsonRpcError};

/// MCP session error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported protocol version from server: {version}")]
    VersionUnsupported { version: String },

    #[error("Local peer does not declare capability '{capability}' (required for {method})")]
    CapabilityMissingLocal {
        capability: Capability,
        method: String,
    },

    #[error("Remote peer does not support capability '{capability}' (required for {method})")]
    CapabilityMissingRemote {
        capability: Capability,
        method: String,
    },

    #[error("Not connected: session is {state}")]
    NotConnected { state: ConnectionState },

    #[error("Request cancelled: {reason}")]
    RequestCancelled { reason: String },

    #[error("Request timed out after {timeout:?}")]
    RequestTimedOut { timeout: Duration },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(JsonRpcError),

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// True for both explicit cancellation and deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::RequestCancelled { .. } | Error::RequestTimedOut { .. }
        )
    }

    /// JSON-RPC error code carried by a remote error response, if any.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            Error::Remote(err) => Some(err.code),
            _ => None,
        }
    }

    /// Convert a handler failure into the error object sent back to the caller.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Error::Remote(err) => err.clone(),
            Error::InvalidParams { message } => JsonRpcError {
                code: error_codes::INVALID_PARAMS,
                message: message.clone(),
                data: None,
            },
            Error::Serialization(e) => JsonRpcError {
                code: error_codes::INVALID_PARAMS,
                message: e.to_string(),
                data: None,
            },
            other => JsonRpcError {
                code: error_codes::INTERNAL_ERROR,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

/// Convenience result type for MCP session operations
pub type Result<T> = std::result::Result<T, Error>;
