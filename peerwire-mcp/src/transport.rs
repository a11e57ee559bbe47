//! Transport layer for MCP sessions
//!
//! A transport is a duplex channel of already-structured [`JsonRpcMessage`]
//! values. The owning engine installs its callbacks first and then calls
//! [`Transport::start`]; inbound messages arrive through `on_message`, one at a
//! time and in the order the peer sent them.

pub mod loopback;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{protocol::JsonRpcMessage, Error, Result};

pub use loopback::LoopbackTransport;

/// Callback invoked for every inbound message
pub type MessageCallback = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;
/// Callback invoked once when the transport closes
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked for transport-level failures that do not close the channel
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Transport trait for MCP communication
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Prepare the channel and begin delivering inbound messages.
    ///
    /// Calling `start` on an already started transport is a no-op.
    async fn start(&self) -> Result<()>;

    /// Send one message; per-direction ordering is preserved.
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Release the channel and fire `on_close` exactly once.
    async fn close(&self) -> Result<()>;

    /// Whether the transport has been closed, locally or by the peer
    fn is_closed(&self) -> bool;

    fn set_on_message(&self, callback: MessageCallback);

    fn set_on_close(&self, callback: CloseCallback);

    fn set_on_error(&self, callback: ErrorCallback);
}

/// Assignable callback slots shared by transport implementations
#[derive(Default)]
pub struct TransportCallbacks {
    on_message: RwLock<Option<MessageCallback>>,
    on_close: RwLock<Option<CloseCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

impl TransportCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_message(&self, callback: MessageCallback) {
        *self.on_message.write() = Some(callback);
    }

    pub fn set_on_close(&self, callback: CloseCallback) {
        *self.on_close.write() = Some(callback);
    }

    pub fn set_on_error(&self, callback: ErrorCallback) {
        *self.on_error.write() = Some(callback);
    }

    /// Deliver a message; returns false when no handler is installed.
    pub fn message(&self, message: JsonRpcMessage) -> bool {
        // Clone the handler out so the lock is not held while it runs.
        let callback = self.on_message.read().clone();
        match callback {
            Some(cb) => {
                cb(message);
                true
            }
            None => false,
        }
    }

    pub fn close(&self) {
        let callback = self.on_close.read().clone();
        if let Some(cb) = callback {
            cb();
        }
    }

    pub fn error(&self, error: Error) {
        let callback = self.on_error.read().clone();
        if let Some(cb) = callback {
            cb(error);
        }
    }
}

impl std::fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCallbacks")
            .field("on_message", &self.on_message.read().is_some())
            .field("on_close", &self.on_close.read().is_some())
            .field("on_error", &self.on_error.read().is_some())
            .finish()
    }
}
