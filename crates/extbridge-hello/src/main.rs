//! Sample extension worker answering forwarded REST requests over stdio.

use std::io::{BufReader, BufWriter};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use extbridge_core::envelope::{
    CONSUMED_CONTENT_KEY, CONSUMED_PARAMS_KEY, ExtensionRestRequest, ExtensionRestResponse,
};
use extbridge_core::identity::ExtensionTokenProcessor;
use extbridge_core::ipc::{
    DEFAULT_MAX_FRAME_BYTES, ExtensionFrame, IpcError, read_frame, write_frame,
};
use extbridge_core::route::RestMethod;
use extbridge_core::transport::REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION;
use http::StatusCode;
use tracing_subscriber::EnvFilter;

/// Longest delay `/slow` honours.
const MAX_SLOW_MS: u64 = 30_000;

fn main() {
    // stdout carries frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let tokens = ExtensionTokenProcessor::new(resolve_unique_id(std::env::args().skip(1)));
    let writer = Mutex::new(BufWriter::new(std::io::stdout()));
    let mut reader = BufReader::new(std::io::stdin().lock());

    // One thread per request so a slow answer does not hold up the rest.
    // The scope joins outstanding requests after stdin closes.
    std::thread::scope(|scope| {
        loop {
            let frame = match read_frame::<ExtensionFrame>(&mut reader, DEFAULT_MAX_FRAME_BYTES) {
                Ok(frame) => frame,
                Err(err) if err.is_eof() => break,
                Err(err) => {
                    tracing::error!(error = %err, "invalid frame from bridge");
                    break;
                }
            };
            let ExtensionFrame::Request {
                request_id,
                action,
                request,
            } = frame
            else {
                tracing::warn!("ignoring non-request frame");
                continue;
            };

            let (tokens, writer) = (&tokens, &writer);
            scope.spawn(move || {
                let written = reply_frame(tokens, request_id, &action, &request).and_then(|frame| {
                    let mut out = writer.lock().unwrap_or_else(PoisonError::into_inner);
                    write_frame(&mut *out, &frame)
                });
                if let Err(err) = written {
                    tracing::error!(request_id, error = %err, "failed to write reply");
                }
            });
        }
    });
}

fn reply_frame(
    tokens: &ExtensionTokenProcessor,
    request_id: u64,
    action: &str,
    request: &ExtensionRestRequest,
) -> Result<ExtensionFrame, IpcError> {
    if action != REQUEST_REST_EXECUTE_ON_EXTENSION_ACTION {
        return Ok(ExtensionFrame::Error {
            request_id,
            message: format!("unsupported action [{action}]"),
        });
    }
    match handle_request(tokens, request) {
        Ok(response) => ExtensionFrame::response(request_id, &response),
        Err(message) => Ok(ExtensionFrame::Error {
            request_id,
            message,
        }),
    }
}

/// Answers one forwarded request; `Err` becomes an error frame.
fn handle_request(
    tokens: &ExtensionTokenProcessor,
    request: &ExtensionRestRequest,
) -> Result<ExtensionRestResponse, String> {
    let principal = match tokens.extract_principal(&request.issuer_identity) {
        Ok(principal) => principal,
        Err(err) => return Ok(ExtensionRestResponse::text(StatusCode::UNAUTHORIZED, err.to_string())),
    };
    tracing::debug!(%principal, method = %request.method, path = %request.path, "handling request");

    let segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();
    let response = match (request.method, segments.as_slice()) {
        (RestMethod::Get, ["hello"]) => {
            let mut response = match request.params.get("name") {
                Some(name) => ExtensionRestResponse::text(StatusCode::OK, format!("Hello, {name}!")),
                None => ExtensionRestResponse::text(StatusCode::OK, "Hello, World!"),
            };
            if request.params.contains_key("name") {
                response.add_header(CONSUMED_PARAMS_KEY, "name");
            }
            response
        }
        (RestMethod::Get, ["greet", name]) => {
            let mut response =
                ExtensionRestResponse::text(StatusCode::OK, format!("Greetings, {name}!"));
            response.add_header(CONSUMED_PARAMS_KEY, "name");
            response
        }
        (RestMethod::Post, ["echo"]) => {
            let content_type = request
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_owned());
            let mut response =
                ExtensionRestResponse::new(StatusCode::OK, content_type, request.content.clone());
            response.add_header(CONSUMED_CONTENT_KEY, "true");
            response.add_header("x-echo-length", request.content.len().to_string());
            response
        }
        (RestMethod::Get, ["slow"]) => {
            let ms = request
                .params
                .get("ms")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                .min(MAX_SLOW_MS);
            std::thread::sleep(Duration::from_millis(ms));
            let mut response = ExtensionRestResponse::text(StatusCode::OK, format!("slept {ms}ms"));
            response.add_header(CONSUMED_PARAMS_KEY, "ms");
            response
        }
        (RestMethod::Get, ["fail"]) => return Err("hello extension failure".to_owned()),
        (method, _) => ExtensionRestResponse::text(
            StatusCode::NOT_FOUND,
            format!("no route for {method} {}", request.path),
        ),
    };
    Ok(response)
}

fn resolve_unique_id(args: impl Iterator<Item = String>) -> String {
    let mut unique_id: Option<String> = None;
    let mut pending = false;
    for arg in args {
        if pending {
            if !arg.is_empty() {
                unique_id = Some(arg);
            }
            pending = false;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--unique-id=") {
            if !value.is_empty() {
                unique_id = Some(value.to_owned());
            }
            continue;
        }
        if arg == "--unique-id" {
            pending = true;
        }
    }
    unique_id.unwrap_or_else(|| "hello".to_owned())
}
