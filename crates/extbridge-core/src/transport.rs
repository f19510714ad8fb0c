//! Transport seam between the bridge and extension processes.

use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::envelope::{ExtensionRestRequest, ExtensionRestResponse};

/// Action name for forwarded REST requests.
pub const REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION: &str =
    "internal:discovery/restexecuteonextension";

/// Registered extension a request can be sent to.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DiscoveryExtension {
    /// Stable id used for namespacing and token scoping.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Transport address.
    pub address: String,
}

impl DiscoveryExtension {
    /// Creates an extension descriptor.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
        }
    }
}

impl Display for DiscoveryExtension {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.name, self.id, self.address)
    }
}

/// Transport failures, delivered synchronously or through a reply handler.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Extension is not reachable.
    #[error("extension [{0}] is not connected")]
    Disconnected(String),
    /// Sending the request failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Reply bytes could not be decoded.
    #[error("failed to decode reply: {0}")]
    Decode(String),
    /// Extension answered with an error.
    #[error("{0}")]
    Remote(String),
}

/// Where a reply handler wants to run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExecutorHint {
    /// On the thread that received the reply.
    Same,
    /// On a shared general-purpose pool.
    #[default]
    Generic,
}

/// Receives exactly one outcome for a sent request.
pub trait ReplyHandler: Send + 'static {
    /// Decodes raw reply bytes.
    fn decode(&self, bytes: &[u8]) -> Result<ExtensionRestResponse, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Called with the decoded reply.
    fn on_success(self: Box<Self>, reply: ExtensionRestResponse);

    /// Called when no reply can be produced.
    fn on_failure(self: Box<Self>, err: TransportError);

    /// Executor the transport should invoke the callbacks on.
    fn executor(&self) -> ExecutorHint {
        ExecutorHint::Generic
    }
}

/// Asynchronous request/response transport to extensions.
pub trait ExtensionTransport: Send + Sync {
    /// Sends `request` to `target` without waiting for the reply.
    ///
    /// An `Err` means the handler was dropped unused; `Ok` means the
    /// handler will eventually be called once, or dropped if the transport
    /// shuts down.
    fn send(
        &self,
        target: &DiscoveryExtension,
        action: &str,
        request: ExtensionRestRequest,
        handler: Box<dyn ReplyHandler>,
    ) -> Result<(), TransportError>;
}
