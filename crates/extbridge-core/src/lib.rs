//! Core of the extension REST bridge.
//!
//! Extensions register `"<METHOD> <path>"` actions; the bridge exposes them
//! under `/_extensions/_<id>`, forwards matching requests over an
//! asynchronous transport and blocks the caller until the reply arrives or
//! the wait bound elapses. Replies may carry directive headers telling the
//! bridge which parameters and whether the body were consumed.
//!
//! This crate has no async runtime; transports plug in through
//! [`transport::ExtensionTransport`].

pub mod envelope;
pub mod forwarder;
pub mod identity;
pub mod ipc;
pub mod request;
pub mod route;
pub mod transport;

pub use envelope::{
    CONSUMED_CONTENT_KEY, CONSUMED_PARAMS_KEY, ExtensionRestRequest, ExtensionRestResponse,
    HeaderMap,
};
pub use forwarder::{ExtensionRestForwarder, ForwardOutcome, Forwarded, RestResponse};
pub use identity::{
    DefaultPrincipalResolver, ExtensionTokenProcessor, IdentityToken, Principal, PrincipalResolver,
    TokenIssuer,
};
pub use request::RestRequest;
pub use route::{RestMethod, Route, RouteRegistration, RouteSpecError};
pub use transport::{
    DiscoveryExtension, ExecutorHint, ExtensionTransport, ReplyHandler, TransportError,
};
