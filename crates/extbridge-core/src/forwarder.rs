//! Blocking forwarder from REST requests to extension transport calls.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use http::StatusCode;

use crate::envelope::{
    ExtensionRestRequest, ExtensionRestResponse, HeaderMap, TEXT_CONTENT_TYPE,
};
use crate::identity::{
    DefaultPrincipalResolver, ExtensionTokenIssuer, PrincipalResolver, TokenIssuer,
};
use crate::request::{ConsumptionTracker, RestRequest};
use crate::route::{Route, RouteRegistration, RouteSpecError};
use crate::transport::{
    DiscoveryExtension, ExecutorHint, ExtensionTransport, REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION,
    ReplyHandler, TransportError,
};

/// Handler name reported to the REST layer.
pub const SEND_TO_EXTENSION_ACTION: &str = "send_to_extension_action";

/// Default bound on the wait for an extension reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of the response returned when the wait times out.
pub const TIMEOUT_RESPONSE_BODY: &str = "No response from extension to request.";

/// Response handed back to the REST layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestResponse {
    status: StatusCode,
    content_type: String,
    content: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl RestResponse {
    /// Creates a response without headers.
    pub fn new(status: StatusCode, content_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            content,
            headers: Vec::new(),
        }
    }

    /// Creates a plain-text response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, TEXT_CONTENT_TYPE, body.into().into_bytes())
    }

    /// Appends one header entry; repeated names are kept as separate entries.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Body content type.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Body bytes.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Header entries in insertion order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Values of header `name`, in order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Consumes the response into its parts.
    #[must_use]
    pub fn into_parts(self) -> (StatusCode, String, Vec<u8>, Vec<(String, String)>) {
        (self.status, self.content_type, self.content, self.headers)
    }
}

impl From<ExtensionRestResponse> for RestResponse {
    fn from(reply: ExtensionRestResponse) -> Self {
        let mut response = Self::new(reply.status, reply.content_type, reply.content);
        for (name, values) in reply.headers {
            for value in values {
                response.add_header(name.clone(), value);
            }
        }
        response
    }
}

/// How a forwarded request ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForwardOutcome {
    /// Extension replied; its response is returned.
    Replied,
    /// Token or send setup failed; the placeholder is returned.
    InternalError,
    /// Transport reported a failure.
    RemoteFailure,
    /// No reply within the bound.
    Timeout,
}

/// Response plus the path that produced it.
#[derive(Clone, Debug)]
pub struct Forwarded {
    /// How the call ended.
    pub outcome: ForwardOutcome,
    /// Response for the caller.
    pub response: RestResponse,
}

/// Forwards requests for one extension's routes and waits for the reply.
pub struct ExtensionRestForwarder {
    registration: RouteRegistration,
    extension: DiscoveryExtension,
    transport: Arc<dyn ExtensionTransport>,
    token_issuer: Arc<dyn TokenIssuer>,
    principals: Arc<dyn PrincipalResolver>,
    timeout: Duration,
}

impl ExtensionRestForwarder {
    /// Registers `rest_actions` under `unique_id` for `extension`.
    pub fn new<I, S>(
        unique_id: &str,
        rest_actions: I,
        extension: DiscoveryExtension,
        transport: Arc<dyn ExtensionTransport>,
    ) -> Result<Self, RouteSpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            registration: RouteRegistration::build(unique_id, rest_actions)?,
            extension,
            transport,
            token_issuer: Arc::new(ExtensionTokenIssuer),
            principals: Arc::new(DefaultPrincipalResolver::default()),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Overrides the reply wait bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the identity token issuer.
    #[must_use]
    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = issuer;
        self
    }

    /// Overrides how the forwarded principal is resolved.
    #[must_use]
    pub fn with_principal_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.principals = resolver;
        self
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        SEND_TO_EXTENSION_ACTION
    }

    /// Routes served by this forwarder.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        self.registration.routes()
    }

    /// Namespace prefix of the routes.
    #[must_use]
    pub fn path_prefix(&self) -> &str {
        self.registration.path_prefix()
    }

    /// Target extension.
    #[must_use]
    pub fn extension(&self) -> &DiscoveryExtension {
        &self.extension
    }

    /// Reply wait bound.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forwards `request` and returns the response for the caller.
    pub fn forward(&self, request: &RestRequest) -> RestResponse {
        self.execute(request).response
    }

    /// Forwards `request`, blocking up to the timeout.
    pub fn execute(&self, request: &RestRequest) -> Forwarded {
        let method = request.method();
        let path = self.registration.strip_prefix(request.path());
        let message = format!(
            "Forwarding the request {method} {path} to {}",
            self.extension
        );
        tracing::info!(
            extension = %self.extension.id,
            %method,
            path,
            "forwarding request to extension"
        );
        let placeholder = ExtensionRestResponse::text(StatusCode::INTERNAL_SERVER_ERROR, message);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let handler = RestExecuteOnExtensionHandler {
            extension_id: self.extension.id.clone(),
            placeholder: placeholder.clone(),
            consumption: request.consumption(),
            done: done_tx,
        };

        if let Err(err) = self.send(request, path, Box::new(handler)) {
            tracing::info!(
                extension = %self.extension.name,
                error = %err,
                "failed to send REST request to extension"
            );
            return Forwarded {
                outcome: ForwardOutcome::InternalError,
                response: placeholder.into(),
            };
        }

        match done_rx.recv_timeout(self.timeout) {
            Ok((outcome, reply)) => Forwarded {
                outcome,
                response: reply.into(),
            },
            Err(err) => {
                let reason = match err {
                    RecvTimeoutError::Timeout => "timed out",
                    RecvTimeoutError::Disconnected => "reply handler dropped",
                };
                tracing::warn!(
                    extension = %self.extension.id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    reason,
                    "no response from extension"
                );
                Forwarded {
                    outcome: ForwardOutcome::Timeout,
                    response: RestResponse::text(StatusCode::REQUEST_TIMEOUT, TIMEOUT_RESPONSE_BODY),
                }
            }
        }
    }

    fn send(
        &self,
        request: &RestRequest,
        path: &str,
        handler: Box<dyn ReplyHandler>,
    ) -> Result<(), SetupError> {
        let principal = self.principals.resolve();
        let issuer_identity = self.token_issuer.mint(&self.extension.id, &principal)?;
        let outbound = ExtensionRestRequest {
            method: request.method(),
            path: path.to_owned(),
            params: request.params().clone(),
            content_type: request.content_type().map(str::to_owned),
            content: request.raw_content().to_vec(),
            issuer_identity,
        };
        self.transport.send(
            &self.extension,
            REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION,
            outbound,
            handler,
        )?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error("identity token: {0}")]
    Identity(#[from] crate::identity::IdentityError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Reply handler for one forwarded request.
///
/// Owns everything it touches, so a reply arriving after the caller timed
/// out only updates an orphaned tracker and a closed channel.
struct RestExecuteOnExtensionHandler {
    extension_id: String,
    placeholder: ExtensionRestResponse,
    consumption: ConsumptionTracker,
    done: Sender<(ForwardOutcome, ExtensionRestResponse)>,
}

impl RestExecuteOnExtensionHandler {
    fn complete(self, outcome: ForwardOutcome, reply: ExtensionRestResponse) {
        if self.done.try_send((outcome, reply)).is_err() {
            tracing::debug!(
                extension = %self.extension_id,
                "reply arrived after caller stopped waiting"
            );
        }
    }
}

impl ReplyHandler for RestExecuteOnExtensionHandler {
    fn on_success(self: Box<Self>, reply: ExtensionRestResponse) {
        tracing::info!(
            extension = %self.extension_id,
            status = reply.status.as_u16(),
            "received response from extension"
        );
        if let Some(params) = reply.consumed_params() {
            for name in params {
                self.consumption.consume_param(name);
            }
        }
        if reply.content_consumed() {
            self.consumption.consume_content();
        }
        let headers: HeaderMap = reply.forwarded_headers();
        let response = ExtensionRestResponse {
            status: reply.status,
            content_type: reply.content_type,
            content: reply.content,
            headers,
        };
        self.complete(ForwardOutcome::Replied, response);
    }

    fn on_failure(self: Box<Self>, err: TransportError) {
        tracing::debug!(extension = %self.extension_id, error = %err, "REST request failed");
        let response = ExtensionRestResponse {
            content: format!("Request failed: {err}").into_bytes(),
            ..self.placeholder.clone()
        };
        self.complete(ForwardOutcome::RemoteFailure, response);
    }

    fn executor(&self) -> ExecutorHint {
        ExecutorHint::Generic
    }
}
