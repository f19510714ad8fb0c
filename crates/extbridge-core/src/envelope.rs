//! Request and reply envelopes exchanged with extensions.

use http::StatusCode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityToken;
use crate::route::RestMethod;

/// Reply header listing the query parameters the extension read.
pub const CONSUMED_PARAMS_KEY: &str = "extension.consumed.parameters";

/// Reply header flagging whether the extension read the request body.
pub const CONSUMED_CONTENT_KEY: &str = "extension.consumed.content";

/// Content type of bridge-generated plain-text responses.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Reply headers: name to ordered values.
pub type HeaderMap = IndexMap<String, Vec<String>>;

/// REST request forwarded to an extension.
///
/// Inbound HTTP headers are deliberately not carried.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRestRequest {
    /// Request method.
    pub method: RestMethod,
    /// Path with the namespace prefix removed.
    pub path: String,
    /// Query and path parameters, in request order.
    pub params: IndexMap<String, String>,
    /// Declared body content type.
    pub content_type: Option<String>,
    /// Raw body.
    pub content: Vec<u8>,
    /// Identity of the original caller, scoped to the target extension.
    pub issuer_identity: IdentityToken,
}

/// REST reply produced by an extension.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRestResponse {
    /// HTTP status.
    #[serde(with = "status_code")]
    pub status: StatusCode,
    /// Body content type.
    pub content_type: String,
    /// Raw body.
    pub content: Vec<u8>,
    /// Response headers, directive headers included.
    #[serde(default)]
    pub headers: HeaderMap,
}

impl ExtensionRestResponse {
    /// Builds a reply without headers.
    pub fn new(status: StatusCode, content_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            content,
            headers: HeaderMap::new(),
        }
    }

    /// Builds a plain-text reply.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, TEXT_CONTENT_TYPE, body.into().into_bytes())
    }

    /// Appends one header value.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    /// Values of the consumed-parameters directive, if present.
    #[must_use]
    pub fn consumed_params(&self) -> Option<&[String]> {
        self.headers.get(CONSUMED_PARAMS_KEY).map(Vec::as_slice)
    }

    /// Whether any consumed-content directive entry reads as `true`.
    #[must_use]
    pub fn content_consumed(&self) -> bool {
        self.headers
            .get(CONSUMED_CONTENT_KEY)
            .is_some_and(|flags| flags.iter().any(|f| f.eq_ignore_ascii_case("true")))
    }

    /// Headers with both directive keys removed, order preserved.
    #[must_use]
    pub fn forwarded_headers(&self) -> HeaderMap {
        self.headers
            .iter()
            .filter(|(name, _)| !is_directive_header(name))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect()
    }
}

/// True for bridge-internal reply headers.
#[must_use]
pub fn is_directive_header(name: &str) -> bool {
    name == CONSUMED_PARAMS_KEY || name == CONSUMED_CONTENT_KEY
}

mod status_code {
    use http::StatusCode;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(status.as_u16())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusCode, D::Error> {
        let code = u16::deserialize(deserializer)?;
        StatusCode::from_u16(code).map_err(D::Error::custom)
    }
}
