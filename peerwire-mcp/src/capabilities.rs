//! Capability tags and the method -> capability tables
//!
//! Each peer declares its own capabilities up front and learns the remote
//! peer's capabilities from the handshake. Before a request, notification or
//! handler registration touches a gated method, the owning role asks its
//! [`CapabilityGate`] whether the relevant capability set allows it. All
//! checks are synchronous and happen before anything reaches the transport.

use std::fmt;
use std::sync::OnceLock;

use crate::protocol::{methods, ClientCapabilities, ServerCapabilities};
use crate::{Error, Result};

/// A single capability flag or sub-flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Sampling,
    Roots,
    RootsListChanged,
    Logging,
    Resources,
    ResourcesSubscribe,
    ResourcesListChanged,
    Tools,
    ToolsListChanged,
    Prompts,
    PromptsListChanged,
}

impl Capability {
    /// Dotted name matching the serialized capability record
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Sampling => "sampling",
            Capability::Roots => "roots",
            Capability::RootsListChanged => "roots.listChanged",
            Capability::Logging => "logging",
            Capability::Resources => "resources",
            Capability::ResourcesSubscribe => "resources.subscribe",
            Capability::ResourcesListChanged => "resources.listChanged",
            Capability::Tools => "tools",
            Capability::ToolsListChanged => "tools.listChanged",
            Capability::Prompts => "prompts",
            Capability::PromptsListChanged => "prompts.listChanged",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClientCapabilities {
    /// Whether this record declares `capability`; server-side tags are never supported.
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Sampling => self.sampling.is_some(),
            Capability::Roots => self.roots.is_some(),
            Capability::RootsListChanged => self
                .roots
                .as_ref()
                .and_then(|r| r.list_changed)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl ServerCapabilities {
    /// Whether this record declares `capability`; client-side tags are never supported.
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Logging => self.logging.is_some(),
            Capability::Resources => self.resources.is_some(),
            Capability::ResourcesSubscribe => self
                .resources
                .as_ref()
                .and_then(|r| r.subscribe)
                .unwrap_or(false),
            Capability::ResourcesListChanged => self
                .resources
                .as_ref()
                .and_then(|r| r.list_changed)
                .unwrap_or(false),
            Capability::Tools => self.tools.is_some(),
            Capability::ToolsListChanged => self
                .tools
                .as_ref()
                .and_then(|t| t.list_changed)
                .unwrap_or(false),
            Capability::Prompts => self.prompts.is_some(),
            Capability::PromptsListChanged => self
                .prompts
                .as_ref()
                .and_then(|p| p.list_changed)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Capability a server must declare to serve `method`.
///
/// Used both for client-issued requests (against the remote server's
/// capabilities) and for server handler registration (against its own).
pub fn server_capability_for_request(method: &str) -> Option<Capability> {
    match method {
        methods::SET_LOGGING_LEVEL => Some(Capability::Logging),
        methods::LIST_PROMPTS | methods::GET_PROMPT => Some(Capability::Prompts),
        methods::LIST_RESOURCES | methods::LIST_RESOURCE_TEMPLATES | methods::READ_RESOURCE => {
            Some(Capability::Resources)
        }
        methods::SUBSCRIBE_RESOURCE | methods::UNSUBSCRIBE_RESOURCE => {
            Some(Capability::ResourcesSubscribe)
        }
        methods::LIST_TOOLS | methods::CALL_TOOL => Some(Capability::Tools),
        _ => None,
    }
}

/// Capability a client must declare to serve `method`.
pub fn client_capability_for_request(method: &str) -> Option<Capability> {
    match method {
        methods::CREATE_MESSAGE => Some(Capability::Sampling),
        methods::LIST_ROOTS => Some(Capability::Roots),
        _ => None,
    }
}

/// Local server capability required to emit `method`.
pub fn server_capability_for_notification(method: &str) -> Option<Capability> {
    match method {
        methods::LOGGING_MESSAGE => Some(Capability::Logging),
        methods::RESOURCE_UPDATED => Some(Capability::Resources),
        methods::RESOURCES_LIST_CHANGED => Some(Capability::ResourcesListChanged),
        methods::TOOLS_LIST_CHANGED => Some(Capability::ToolsListChanged),
        methods::PROMPTS_LIST_CHANGED => Some(Capability::PromptsListChanged),
        _ => None,
    }
}

/// Local client capability required to emit `method`.
pub fn client_capability_for_notification(method: &str) -> Option<Capability> {
    match method {
        methods::ROOTS_LIST_CHANGED => Some(Capability::RootsListChanged),
        _ => None,
    }
}

/// Role-specific capability checks consulted by the engine
pub trait CapabilityGate: Send + Sync {
    /// Outbound request: the negotiated remote capabilities must allow it.
    fn check_request(&self, method: &str) -> Result<()>;

    /// Outbound notification: the local capabilities must allow it.
    fn check_notification(&self, method: &str) -> Result<()>;

    /// Handler registration: returns the capability tag the handler is gated
    /// on, failing if the local capabilities do not declare it.
    fn check_request_handler(&self, method: &str) -> Result<Option<Capability>>;
}

fn require_local(supported: bool, capability: Capability, method: &str) -> Result<()> {
    if supported {
        Ok(())
    } else {
        Err(Error::CapabilityMissingLocal {
            capability,
            method: method.to_string(),
        })
    }
}

fn require_remote(supported: bool, capability: Capability, method: &str) -> Result<()> {
    if supported {
        Ok(())
    } else {
        Err(Error::CapabilityMissingRemote {
            capability,
            method: method.to_string(),
        })
    }
}

/// Gate for the client role: local client capabilities, remote server capabilities
#[derive(Debug, Default)]
pub struct ClientGate {
    local: ClientCapabilities,
    remote: OnceLock<ServerCapabilities>,
}

impl ClientGate {
    pub fn new(local: ClientCapabilities) -> Self {
        Self {
            local,
            remote: OnceLock::new(),
        }
    }

    pub fn local(&self) -> &ClientCapabilities {
        &self.local
    }

    pub fn remote(&self) -> Option<&ServerCapabilities> {
        self.remote.get()
    }

    /// Record the server's capabilities; later calls are ignored.
    pub(crate) fn set_remote(&self, remote: ServerCapabilities) -> bool {
        self.remote.set(remote).is_ok()
    }
}

impl CapabilityGate for ClientGate {
    fn check_request(&self, method: &str) -> Result<()> {
        let Some(capability) = server_capability_for_request(method) else {
            return Ok(());
        };
        let supported = self
            .remote
            .get()
            .map(|caps| caps.supports(capability))
            .unwrap_or(false);
        require_remote(supported, capability, method)
    }

    fn check_notification(&self, method: &str) -> Result<()> {
        match client_capability_for_notification(method) {
            Some(capability) => require_local(self.local.supports(capability), capability, method),
            None => Ok(()),
        }
    }

    fn check_request_handler(&self, method: &str) -> Result<Option<Capability>> {
        match client_capability_for_request(method) {
            Some(capability) => {
                require_local(self.local.supports(capability), capability, method)?;
                Ok(Some(capability))
            }
            None => Ok(None),
        }
    }
}

/// Gate for the server role: local server capabilities, remote client capabilities
#[derive(Debug, Default)]
pub struct ServerGate {
    local: ServerCapabilities,
    remote: OnceLock<ClientCapabilities>,
}

impl ServerGate {
    pub fn new(local: ServerCapabilities) -> Self {
        Self {
            local,
            remote: OnceLock::new(),
        }
    }

    pub fn local(&self) -> &ServerCapabilities {
        &self.local
    }

    pub fn remote(&self) -> Option<&ClientCapabilities> {
        self.remote.get()
    }

    pub(crate) fn set_remote(&self, remote: ClientCapabilities) -> bool {
        self.remote.set(remote).is_ok()
    }
}

impl CapabilityGate for ServerGate {
    fn check_request(&self, method: &str) -> Result<()> {
        let Some(capability) = client_capability_for_request(method) else {
            return Ok(());
        };
        let supported = self
            .remote
            .get()
            .map(|caps| caps.supports(capability))
            .unwrap_or(false);
        require_remote(supported, capability, method)
    }

    fn check_notification(&self, method: &str) -> Result<()> {
        match server_capability_for_notification(method) {
            Some(capability) => require_local(self.local.supports(capability), capability, method),
            None => Ok(()),
        }
    }

    fn check_request_handler(&self, method: &str) -> Result<Option<Capability>> {
        match server_capability_for_request(method) {
            Some(capability) => {
                require_local(self.local.supports(capability), capability, method)?;
                Ok(Some(capability))
            }
            None => Ok(None),
        }
    }
}
