use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use extbridge_core::envelope::{
    CONSUMED_CONTENT_KEY, CONSUMED_PARAMS_KEY, ExtensionRestRequest, ExtensionRestResponse,
    TEXT_CONTENT_TYPE,
};
use extbridge_core::forwarder::{
    DEFAULT_REQUEST_TIMEOUT, ExtensionRestForwarder, ForwardOutcome, SEND_TO_EXTENSION_ACTION,
    TIMEOUT_RESPONSE_BODY,
};
use extbridge_core::identity::{
    DefaultPrincipalResolver, IdentityError, IdentityToken, Principal, TokenIssuer,
};
use extbridge_core::request::RestRequest;
use extbridge_core::route::RestMethod;
use extbridge_core::transport::{
    DiscoveryExtension, ExtensionTransport, REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION, ReplyHandler,
    TransportError,
};
use http::StatusCode;

/// What a stub transport does with each handler.
enum Behavior {
    Reply(ExtensionRestResponse),
    Fail(String),
    ReplyAfter(Duration, ExtensionRestResponse),
    Hold,
    Drop,
    RejectSend,
}

struct StubTransport {
    behavior: Behavior,
    sent: Mutex<Vec<(String, ExtensionRestRequest)>>,
    held: Mutex<Vec<Box<dyn ReplyHandler>>>,
}

impl StubTransport {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    fn last_sent(&self) -> (String, ExtensionRestRequest) {
        self.sent
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .expect("a request was sent")
    }
}

impl ExtensionTransport for StubTransport {
    fn send(
        &self,
        _target: &DiscoveryExtension,
        action: &str,
        request: ExtensionRestRequest,
        handler: Box<dyn ReplyHandler>,
    ) -> Result<(), TransportError> {
        if matches!(self.behavior, Behavior::RejectSend) {
            return Err(TransportError::Disconnected("hello".to_owned()));
        }
        self.sent
            .lock()
            .expect("lock")
            .push((action.to_owned(), request));
        match &self.behavior {
            Behavior::Reply(reply) => handler.on_success(reply.clone()),
            Behavior::Fail(message) => handler.on_failure(TransportError::Remote(message.clone())),
            Behavior::ReplyAfter(delay, reply) => {
                let delay = *delay;
                let reply = reply.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    handler.on_success(reply);
                });
            }
            Behavior::Hold => self.held.lock().expect("lock").push(handler),
            Behavior::Drop => drop(handler),
            Behavior::RejectSend => unreachable!(),
        }
        Ok(())
    }
}

struct FailingIssuer;

impl TokenIssuer for FailingIssuer {
    fn mint(&self, _extension_id: &str, _principal: &Principal) -> Result<IdentityToken, IdentityError> {
        Err(IdentityError::EmptyPrincipal)
    }
}

fn extension() -> DiscoveryExtension {
    DiscoveryExtension::new("hello", "hello-world", "stdio://extbridge-hello")
}

fn forwarder(transport: Arc<StubTransport>) -> ExtensionRestForwarder {
    ExtensionRestForwarder::new(
        "hello",
        ["GET /hello", "POST /echo"],
        extension(),
        transport,
    )
    .expect("registration")
}

fn ok_reply(body: &str) -> ExtensionRestResponse {
    ExtensionRestResponse::new(StatusCode::OK, "application/json", body.as_bytes().to_vec())
}

#[test]
fn forwarder_reports_name_and_routes() {
    let fwd = forwarder(StubTransport::new(Behavior::Hold));
    assert_eq!(fwd.name(), SEND_TO_EXTENSION_ACTION);
    assert_eq!(fwd.routes().len(), 2);
    assert_eq!(fwd.timeout(), DEFAULT_REQUEST_TIMEOUT);
    assert_eq!(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs(5));
}

#[test]
fn outbound_envelope_strips_prefix_and_carries_token() {
    let transport = StubTransport::new(Behavior::Reply(ok_reply("{}")));
    let fwd = forwarder(Arc::clone(&transport));
    let req = RestRequest::new(RestMethod::Post, "/_extensions/_hello/echo")
        .with_param("pretty", "true")
        .with_content(Some("application/json".to_owned()), b"{\"a\":1}".to_vec());

    let _ = fwd.forward(&req);

    let (action, sent) = transport.last_sent();
    assert_eq!(action, REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION);
    assert_eq!(sent.method, RestMethod::Post);
    assert_eq!(sent.path, "/echo");
    assert_eq!(sent.params.get("pretty").map(String::as_str), Some("true"));
    assert_eq!(sent.content_type.as_deref(), Some("application/json"));
    assert_eq!(sent.content, b"{\"a\":1}");
    assert_eq!(sent.issuer_identity.as_str(), "OpenSearchUser:hello");
    assert!(!req.is_content_consumed());
}

#[test]
fn prefix_already_absent_is_tolerated() {
    let transport = StubTransport::new(Behavior::Reply(ok_reply("{}")));
    let fwd = forwarder(Arc::clone(&transport));
    let _ = fwd.forward(&RestRequest::new(RestMethod::Get, "/hello"));
    assert_eq!(transport.last_sent().1.path, "/hello");
}

#[test]
fn doubled_slashes_are_stripped_with_the_prefix() {
    let transport = StubTransport::new(Behavior::Reply(ok_reply("{}")));
    let fwd = forwarder(Arc::clone(&transport));
    let _ = fwd.forward(&RestRequest::new(RestMethod::Get, "//_extensions/_hello//hello/"));
    assert_eq!(transport.last_sent().1.path, "/hello");
}

#[test]
fn plain_reply_passes_through_unchanged() {
    let mut reply = ok_reply("{\"ok\":true}");
    reply.add_header("x-trace", "a");
    reply.add_header("warning", "w1");
    reply.add_header("x-trace", "b");
    let fwd = forwarder(StubTransport::new(Behavior::Reply(reply)));

    let forwarded = fwd.execute(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));

    assert_eq!(forwarded.outcome, ForwardOutcome::Replied);
    let resp = forwarded.response;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.content_type(), "application/json");
    assert_eq!(resp.content(), b"{\"ok\":true}");
    assert_eq!(
        resp.headers(),
        &[
            ("x-trace".to_owned(), "a".to_owned()),
            ("x-trace".to_owned(), "b".to_owned()),
            ("warning".to_owned(), "w1".to_owned()),
        ]
    );
}

#[test]
fn consumed_params_are_marked_and_stripped() {
    let mut reply = ok_reply("{}");
    reply.add_header(CONSUMED_PARAMS_KEY, "a");
    reply.add_header(CONSUMED_PARAMS_KEY, "b");
    reply.add_header("x-kept", "1");
    let fwd = forwarder(StubTransport::new(Behavior::Reply(reply)));
    let req = RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello")
        .with_param("a", "1")
        .with_param("b", "2")
        .with_param("c", "3");

    let resp = fwd.forward(&req);

    assert!(resp.header_values(CONSUMED_PARAMS_KEY).is_empty());
    assert_eq!(resp.header_values("x-kept"), vec!["1"]);
    assert_eq!(req.unconsumed_params(), vec!["c".to_owned()]);
}

#[test]
fn consumed_content_without_consumed_params_is_handled() {
    let mut reply = ok_reply("{}");
    reply.add_header(CONSUMED_CONTENT_KEY, "false");
    reply.add_header(CONSUMED_CONTENT_KEY, "true");
    let fwd = forwarder(StubTransport::new(Behavior::Reply(reply)));
    let req = RestRequest::new(RestMethod::Post, "/_extensions/_hello/echo")
        .with_param("q", "x")
        .with_content(Some("text/plain".to_owned()), b"body".to_vec());

    let resp = fwd.forward(&req);

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(req.is_content_consumed());
    assert_eq!(req.unconsumed_params(), vec!["q".to_owned()]);
    assert!(resp.header_values(CONSUMED_CONTENT_KEY).is_empty());
    assert!(resp.headers().is_empty());
}

#[test]
fn false_content_flags_leave_body_unconsumed() {
    let mut reply = ok_reply("{}");
    reply.add_header(CONSUMED_CONTENT_KEY, "no");
    let fwd = forwarder(StubTransport::new(Behavior::Reply(reply)));
    let req = RestRequest::new(RestMethod::Post, "/_extensions/_hello/echo")
        .with_content(None, b"body".to_vec());
    let _ = fwd.forward(&req);
    assert!(!req.is_content_consumed());
}

#[test]
fn transport_failure_keeps_internal_error_status() {
    let fwd = forwarder(StubTransport::new(Behavior::Fail("boom".to_owned())));
    let forwarded = fwd.execute(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));
    assert_eq!(forwarded.outcome, ForwardOutcome::RemoteFailure);
    assert_eq!(forwarded.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(forwarded.response.content(), b"Request failed: boom");
    assert_eq!(forwarded.response.content_type(), TEXT_CONTENT_TYPE);
}

#[test]
fn silent_extension_times_out_at_default_bound() {
    let transport = StubTransport::new(Behavior::Hold);
    let fwd = forwarder(Arc::clone(&transport));
    let started = Instant::now();

    let forwarded = fwd.execute(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(6_500), "returned late: {elapsed:?}");
    assert_eq!(forwarded.outcome, ForwardOutcome::Timeout);
    assert_eq!(forwarded.response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(forwarded.response.content(), TIMEOUT_RESPONSE_BODY.as_bytes());
    assert!(forwarded.response.headers().is_empty());
}

#[test]
fn late_reply_after_timeout_is_harmless() {
    let mut reply = ok_reply("late");
    reply.add_header(CONSUMED_PARAMS_KEY, "a");
    let transport = StubTransport::new(Behavior::ReplyAfter(Duration::from_millis(200), reply));
    let fwd = forwarder(transport).with_timeout(Duration::from_millis(20));
    let req = RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello").with_param("a", "1");

    let forwarded = fwd.execute(&req);
    assert_eq!(forwarded.outcome, ForwardOutcome::Timeout);
    assert_eq!(forwarded.response.status(), StatusCode::REQUEST_TIMEOUT);

    std::thread::sleep(Duration::from_millis(400));
    // The abandoned callback still reaches the request bookkeeping.
    assert!(req.unconsumed_params().is_empty());
    assert_eq!(forwarded.response.content(), TIMEOUT_RESPONSE_BODY.as_bytes());
}

#[test]
fn reply_within_custom_bound_is_used() {
    let transport = StubTransport::new(Behavior::ReplyAfter(
        Duration::from_millis(20),
        ok_reply("threaded"),
    ));
    let fwd = forwarder(transport).with_timeout(Duration::from_secs(2));
    let resp = fwd.forward(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.content(), b"threaded");
}

#[test]
fn dropped_handler_counts_as_timeout() {
    let fwd = forwarder(StubTransport::new(Behavior::Drop));
    let started = Instant::now();
    let forwarded = fwd.execute(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));
    assert_eq!(forwarded.outcome, ForwardOutcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn send_failure_returns_placeholder() {
    let fwd = forwarder(StubTransport::new(Behavior::RejectSend));
    let forwarded = fwd.execute(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));
    assert_eq!(forwarded.outcome, ForwardOutcome::InternalError);
    assert_eq!(forwarded.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(forwarded.response.content_type(), TEXT_CONTENT_TYPE);
    assert_eq!(
        String::from_utf8_lossy(forwarded.response.content()),
        format!("Forwarding the request GET /hello to {}", extension())
    );
}

#[test]
fn token_failure_returns_placeholder_without_sending() {
    let transport = StubTransport::new(Behavior::Reply(ok_reply("{}")));
    let fwd = forwarder(Arc::clone(&transport)).with_token_issuer(Arc::new(FailingIssuer));
    let forwarded = fwd.execute(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));
    assert_eq!(forwarded.outcome, ForwardOutcome::InternalError);
    assert_eq!(forwarded.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(transport.sent.lock().expect("lock").is_empty());
}

#[test]
fn injected_principal_scopes_token() {
    let transport = StubTransport::new(Behavior::Reply(ok_reply("{}")));
    let fwd = forwarder(Arc::clone(&transport)).with_principal_resolver(Arc::new(
        DefaultPrincipalResolver::with_principal(Principal::new("alice")),
    ));
    let _ = fwd.forward(&RestRequest::new(RestMethod::Get, "/_extensions/_hello/hello"));
    assert_eq!(transport.last_sent().1.issuer_identity.as_str(), "alice:hello");
}
