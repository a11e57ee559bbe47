//! In-process loopback transport
//!
//! Two linked ends backed by unbounded tokio channels. Each end runs a single
//! pump task that hands inbound messages to its `on_message` callback in the
//! order the peer sent them. Closing either end closes both; dropping both
//! ends without closing them also ends both pumps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{CloseCallback, ErrorCallback, MessageCallback, Transport, TransportCallbacks};
use crate::{protocol::JsonRpcMessage, Error, Result};

/// One end of a linked loopback pair
#[derive(Clone, Debug)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

#[derive(Debug)]
struct LoopbackInner {
    label: &'static str,
    sender: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    callbacks: TransportCallbacks,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    sent: AtomicU64,
}

impl LoopbackInner {
    fn new(
        label: &'static str,
        sender: mpsc::UnboundedSender<JsonRpcMessage>,
        receiver: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) -> Self {
        Self {
            label,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            callbacks: TransportCallbacks::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            sent: AtomicU64::new(0),
        }
    }

    /// Tear down this end; only the first caller fires `on_close`.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        // Dropping our sender ends the peer's pump once it drained the queue.
        self.sender.lock().take();
        self.receiver.lock().take();
        debug!(end = self.label, "Loopback transport closed");
        self.callbacks.close();
        true
    }
}

impl LoopbackTransport {
    /// Create a pair of connected loopback transports
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        (
            Self {
                inner: Arc::new(LoopbackInner::new("a", tx1, rx2)),
            },
            Self {
                inner: Arc::new(LoopbackInner::new("b", tx2, rx1)),
            },
        )
    }

    /// Number of messages successfully handed to the peer
    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Surface a failure through `on_error` without closing the channel
    pub fn inject_error(&self, error: Error) {
        warn!(end = self.inner.label, "Loopback transport error: {}", error);
        self.inner.callbacks.error(error);
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport(
                "Loopback transport is closed".to_string(),
            ));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut receiver = self.inner.receiver.lock().take().ok_or_else(|| {
            Error::Transport("Loopback transport receiver already taken".to_string())
        })?;

        // Weak: the end owns the sender that feeds the peer's pump.
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let label = self.inner.label;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => {
                            let Some(inner) = weak.upgrade() else { break };
                            trace!(end = label, "Delivering loopback message");
                            if !inner.callbacks.message(message) {
                                warn!(end = label, "No message handler installed, dropping message");
                            }
                        }
                        None => {
                            debug!(end = label, "Loopback peer hung up");
                            break;
                        }
                    }
                }
            }
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.shut();
            }
            trace!(end = label, "Loopback pump stopped");
        });

        debug!(end = self.inner.label, "Loopback transport started");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport(
                "Loopback transport is closed".to_string(),
            ));
        }

        {
            let guard = self.inner.sender.lock();
            let sender = guard.as_ref().ok_or_else(|| {
                Error::Transport("Loopback transport is closed".to_string())
            })?;
            sender.send(message).map_err(|_| {
                Error::Transport("Loopback peer is no longer receiving".to_string())
            })?;
        }

        let total = self.inner.sent.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(end = self.inner.label, total, "Sent loopback message");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.shut();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn set_on_message(&self, callback: MessageCallback) {
        self.inner.callbacks.set_on_message(callback);
    }

    fn set_on_close(&self, callback: CloseCallback) {
        self.inner.callbacks.set_on_close(callback);
    }

    fn set_on_error(&self, callback: ErrorCallback) {
        self.inner.callbacks.set_on_error(callback);
    }
}
