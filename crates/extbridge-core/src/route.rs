//! Route registration for extension REST actions.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root under which every extension route is exposed.
pub const EXTENSIONS_PATH_ROOT: &str = "/_extensions/_";

/// REST method accepted in route specs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RestMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `OPTIONS`
    Options,
    /// `HEAD`
    Head,
    /// `PATCH`
    Patch,
    /// `TRACE`
    Trace,
    /// `CONNECT`
    Connect,
}

impl RestMethod {
    /// All methods, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Options,
        Self::Head,
        Self::Patch,
        Self::Trace,
        Self::Connect,
    ];

    /// Upper-case wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }
}

impl Display for RestMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method name outside the known set.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("unknown REST method `{0}`")]
pub struct UnknownMethod(pub String);

impl FromStr for RestMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_owned()))
    }
}

impl TryFrom<&http::Method> for RestMethod {
    type Error = UnknownMethod;

    fn try_from(method: &http::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

/// One registered route.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Route {
    /// Route method.
    pub method: RestMethod,
    /// Full path, namespace prefix included.
    pub path: String,
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Route spec rejected at registration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RouteSpecError {
    /// Spec is not `<METHOD> <path>` with a known method.
    #[error("{0} does not begin with a valid REST method")]
    InvalidRouteSpec(String),
}

/// Immutable route table for one extension registration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteRegistration {
    path_prefix: String,
    routes: Vec<Route>,
}

impl RouteRegistration {
    /// Parses `specs` under the namespace derived from `unique_id`.
    ///
    /// Registration is all-or-nothing: the first malformed spec fails the
    /// whole call and no routes are produced.
    pub fn build<I, S>(unique_id: &str, specs: I) -> Result<Self, RouteSpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path_prefix = namespace_prefix(unique_id);
        let mut routes = Vec::new();
        for spec in specs {
            let route = parse_route_spec(&path_prefix, spec.as_ref())?;
            tracing::info!(method = %route.method, path = %route.path, "Registering route");
            routes.push(route);
        }
        Ok(Self {
            path_prefix,
            routes,
        })
    }

    /// Namespace prefix shared by every route.
    #[must_use]
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Registered routes, in spec order.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Removes the namespace prefix from `path` when present.
    #[must_use]
    pub fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path)
    }
}

/// Namespace prefix for an extension unique id.
#[must_use]
pub fn namespace_prefix(unique_id: &str) -> String {
    format!("{EXTENSIONS_PATH_ROOT}{unique_id}")
}

/// Collapses empty segments: `//a//b/` becomes `/a/b`, and `""` becomes `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

fn parse_route_spec(path_prefix: &str, spec: &str) -> Result<Route, RouteSpecError> {
    let invalid = || RouteSpecError::InvalidRouteSpec(spec.to_owned());
    let (method, path) = spec.split_once(' ').ok_or_else(invalid)?;
    let method = method.parse::<RestMethod>().map_err(|_| invalid())?;
    Ok(Route {
        method,
        path: format!("{path_prefix}{}", path.trim()),
    })
}
