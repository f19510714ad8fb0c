//! Bridge runtime orchestration.

use std::sync::Arc;

use bytes::Bytes;
use extbridge_core::forwarder::{ExtensionRestForwarder, RestResponse};
use extbridge_core::request::RestRequest;
use extbridge_core::route::{RestMethod, Route, RouteRegistration, RouteSpecError};
use extbridge_core::transport::{DiscoveryExtension, ExtensionTransport};
use http::StatusCode;
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use url::form_urlencoded;

use crate::config::{BridgeConfig, ConfigError, ExtensionConfig};
use crate::controller::RestController;
use crate::worker_transport::{WorkerTransport, WorkerTransportInitError};

/// App startup/runtime errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// Config load or validation failure.
    #[error("{0}")]
    Config(#[from] ConfigError),
    /// Extension declared a malformed REST action.
    #[error("extension `{extension}` registration failed: {source}")]
    Registration {
        /// Extension unique id.
        extension: String,
        /// Offending spec.
        source: RouteSpecError,
    },
    /// Extension worker could not start.
    #[error("extension worker error: {0}")]
    Worker(#[from] WorkerTransportInitError),
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Runtime coordination failure.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Builds the forwarder for one configured extension.
pub fn extension_forwarder(
    ext: &ExtensionConfig,
    transport: Arc<dyn ExtensionTransport>,
    config: &BridgeConfig,
) -> Result<ExtensionRestForwarder, AppError> {
    let target = DiscoveryExtension::new(
        ext.unique_id.clone(),
        ext.display_name(),
        format!("stdio://{}", ext.command),
    );
    let forwarder =
        ExtensionRestForwarder::new(&ext.unique_id, &ext.rest_actions, target, transport)
            .map_err(|source| AppError::Registration {
                extension: ext.unique_id.clone(),
                source,
            })?;
    Ok(forwarder.with_timeout(config.request_timeout()))
}

/// Validates every extension's REST actions without starting workers.
pub fn planned_routes(config: &BridgeConfig) -> Result<Vec<Route>, AppError> {
    let mut routes = Vec::new();
    for ext in &config.extensions {
        let registration = RouteRegistration::build(&ext.unique_id, &ext.rest_actions).map_err(
            |source| AppError::Registration {
                extension: ext.unique_id.clone(),
                source,
            },
        )?;
        routes.extend_from_slice(registration.routes());
    }
    Ok(routes)
}

/// Starts every configured extension and registers its routes.
///
/// Registration is validated for all extensions before any worker starts.
pub fn start_extensions(config: &BridgeConfig) -> Result<RestController, AppError> {
    planned_routes(config)?;
    let mut controller = RestController::new();
    for ext in &config.extensions {
        let transport = Arc::new(WorkerTransport::spawn(ext.unique_id.clone(), &ext.worker())?);
        let forwarder = extension_forwarder(ext, transport, config)?;
        let added = controller.register(Arc::new(forwarder));
        tracing::info!(extension = %ext.unique_id, routes = added, "extension registered");
    }
    Ok(controller)
}

/// Runs the bridge until interrupted.
pub async fn run_bridge(config: BridgeConfig) -> Result<(), AppError> {
    let controller = Arc::new(start_extensions(&config)?);
    let listener = TcpListener::bind(&config.listen.bind).await?;
    tracing::info!(bind = %config.listen.bind, "bridge listening");

    let server = tokio::spawn(serve(listener, controller));
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::Runtime(format!("ctrl-c handler: {e}")))?;
    server.abort();
    Ok(())
}

/// Accepts HTTP connections on `listener` and dispatches to `controller`.
pub async fn serve(listener: TcpListener, controller: Arc<RestController>) -> Result<(), AppError> {
    loop {
        let (stream, _) = listener.accept().await?;
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle_http_request(req, Arc::clone(&controller)));
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %err, "http connection error");
            }
        });
    }
}

async fn handle_http_request(
    req: Request<Incoming>,
    controller: Arc<RestController>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let Ok(method) = RestMethod::try_from(req.method()) else {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("unsupported method [{}]", req.method()),
        ));
    };
    let uri = req.uri().clone();
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!(error = %err, "http body read failed");
            return Ok(text_response(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };

    let mut request = RestRequest::new(method, uri.path()).with_content(content_type, body.to_vec());
    for (name, value) in form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes()) {
        request.insert_param(name, value);
    }

    match tokio::task::spawn_blocking(move || controller.dispatch(request)).await {
        Ok(response) => Ok(to_http_response(response)),
        Err(err) => {
            tracing::warn!(error = %err, "dispatch task failed");
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request dispatch failed",
            ))
        }
    }
}

fn to_http_response(response: RestResponse) -> Response<Full<Bytes>> {
    let (status, content_type, content, headers) = response.into_parts();
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Full::new(Bytes::from(content))).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "extension response carried an invalid header");
        text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "invalid response header from extension",
        )
    })
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static(extbridge_core::envelope::TEXT_CONTENT_TYPE),
    );
    response
}
