//! REST controller: route matching and post-dispatch consumption checks.

use std::sync::Arc;

use extbridge_core::forwarder::{ExtensionRestForwarder, ForwardOutcome, RestResponse};
use extbridge_core::request::RestRequest;
use extbridge_core::route::RestMethod;
use http::StatusCode;

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Route path with optional `{name}` segments.
#[derive(Clone, Debug, Eq, PartialEq)]
struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    fn parse(raw: &str) -> Self {
        let segments = split_path(raw)
            .map(|segment| {
                match segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) if !name.is_empty() => Segment::Param(name.to_owned()),
                    _ => Segment::Literal(segment.to_owned()),
                }
            })
            .collect();
        Self {
            raw: raw.to_owned(),
            segments,
        }
    }

    fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = split_path(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => params.push((name.clone(), part.to_owned())),
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

struct RouteEntry {
    method: RestMethod,
    template: PathTemplate,
    forwarder: Arc<ExtensionRestForwarder>,
}

/// Routes REST requests to extension forwarders.
#[derive(Default)]
pub struct RestController {
    entries: Vec<RouteEntry>,
}

impl RestController {
    /// Creates an empty controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every route of `forwarder`; returns how many were added.
    ///
    /// A `(method, path)` pair already registered keeps its first owner.
    pub fn register(&mut self, forwarder: Arc<ExtensionRestForwarder>) -> usize {
        let mut added = 0;
        for route in forwarder.routes() {
            let template = PathTemplate::parse(&route.path);
            let taken = self
                .entries
                .iter()
                .any(|e| e.method == route.method && e.template.segments == template.segments);
            if taken {
                tracing::warn!(
                    extension = %forwarder.extension().id,
                    route = %route,
                    "route already registered, ignoring"
                );
                continue;
            }
            self.entries.push(RouteEntry {
                method: route.method,
                template,
                forwarder: Arc::clone(&forwarder),
            });
            added += 1;
        }
        added
    }

    /// Registered `(method, path)` pairs in registration order.
    pub fn routes(&self) -> impl Iterator<Item = (RestMethod, &str)> {
        self.entries
            .iter()
            .map(|e| (e.method, e.template.raw.as_str()))
    }

    /// Dispatches `request`, blocking while the extension answers.
    pub fn dispatch(&self, mut request: RestRequest) -> RestResponse {
        let Some((forwarder, path_params)) = self.resolve(request.method(), request.path()) else {
            return RestResponse::text(
                StatusCode::BAD_REQUEST,
                format!(
                    "no handler found for uri [{}] and method [{}]",
                    request.path(),
                    request.method()
                ),
            );
        };
        for (name, value) in path_params {
            request.insert_param(name, value);
        }

        let forwarded = forwarder.execute(&request);
        if forwarded.outcome != ForwardOutcome::Replied {
            return forwarded.response;
        }
        if let Some(err) = unconsumed_error(&request) {
            return RestResponse::text(StatusCode::BAD_REQUEST, err);
        }
        forwarded.response
    }

    fn resolve(
        &self,
        method: RestMethod,
        path: &str,
    ) -> Option<(&ExtensionRestForwarder, Vec<(String, String)>)> {
        self.entries
            .iter()
            .filter(|e| e.method == method)
            .find_map(|e| e.template.matches(path).map(|p| (e.forwarder.as_ref(), p)))
    }
}

fn unconsumed_error(request: &RestRequest) -> Option<String> {
    let unconsumed = request.unconsumed_params();
    if !unconsumed.is_empty() {
        let plural = if unconsumed.len() == 1 { "" } else { "s" };
        let listed = unconsumed
            .iter()
            .map(|p| format!("[{p}]"))
            .collect::<Vec<_>>()
            .join(", ");
        return Some(format!(
            "request [{}] contains unrecognized parameter{plural}: {listed}",
            request.path()
        ));
    }
    if request.has_content() && !request.is_content_consumed() {
        return Some(format!(
            "request [{} {}] does not support having a body",
            request.method(),
            request.path()
        ));
    }
    None
}
