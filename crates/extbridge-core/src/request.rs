//! Inbound REST request and its consumption bookkeeping.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;

use crate::route::{RestMethod, normalize_path};

#[derive(Debug, Default)]
struct Consumption {
    params: HashSet<String>,
    content: bool,
}

/// Shared record of which request parts were read.
///
/// Reply callbacks hold a clone and may update it from the transport
/// thread, including after the waiting caller has given up.
#[derive(Clone, Debug, Default)]
pub struct ConsumptionTracker {
    inner: Arc<Mutex<Consumption>>,
}

impl ConsumptionTracker {
    fn lock(&self) -> MutexGuard<'_, Consumption> {
        // Poisoning only means a panicking reader; the sets stay valid.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Marks one parameter consumed.
    pub fn consume_param(&self, name: &str) {
        self.lock().params.insert(name.to_owned());
    }

    /// Marks the body consumed.
    pub fn consume_content(&self) {
        self.lock().content = true;
    }

    /// Whether `name` was consumed.
    #[must_use]
    pub fn is_param_consumed(&self, name: &str) -> bool {
        self.lock().params.contains(name)
    }

    /// Whether the body was consumed.
    #[must_use]
    pub fn is_content_consumed(&self) -> bool {
        self.lock().content
    }
}

/// REST request as parsed by the HTTP layer.
///
/// Not `Clone`: a copy would share the consumption record with the original.
/// Use [`RestRequest::consumption`] for an explicit shared handle.
///
/// ```compile_fail
/// fn cloneable<T: Clone>() {}
/// cloneable::<extbridge_core::request::RestRequest>();
/// ```
#[derive(Debug)]
pub struct RestRequest {
    method: RestMethod,
    path: String,
    params: IndexMap<String, String>,
    content_type: Option<String>,
    content: Vec<u8>,
    consumption: ConsumptionTracker,
}

impl RestRequest {
    /// Creates a request without parameters or body.
    ///
    /// Empty path segments are collapsed, so `//a/b/` is stored as `/a/b`.
    pub fn new(method: RestMethod, path: impl AsRef<str>) -> Self {
        Self {
            method,
            path: normalize_path(path.as_ref()),
            params: IndexMap::new(),
            content_type: None,
            content: Vec::new(),
            consumption: ConsumptionTracker::default(),
        }
    }

    /// Adds or replaces a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Sets the body and its content type.
    #[must_use]
    pub fn with_content(mut self, content_type: Option<String>, content: Vec<u8>) -> Self {
        self.content_type = content_type;
        self.content = content;
        self
    }

    /// Adds a parameter in place.
    pub fn insert_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> RestMethod {
        self.method
    }

    /// Normalized request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All parameters without marking any consumed.
    #[must_use]
    pub fn params(&self) -> &IndexMap<String, String> {
        &self.params
    }

    /// Reads one parameter and marks it consumed.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.consumption.consume_param(name);
        self.params.get(name).map(String::as_str)
    }

    /// Declared body content type.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Reads the body and marks it consumed.
    pub fn content(&self) -> &[u8] {
        self.consumption.consume_content();
        &self.content
    }

    /// Body bytes without marking them consumed.
    #[must_use]
    pub fn raw_content(&self) -> &[u8] {
        &self.content
    }

    /// Whether a non-empty body was sent.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Whether the body was consumed.
    #[must_use]
    pub fn is_content_consumed(&self) -> bool {
        self.consumption.is_content_consumed()
    }

    /// Parameters nobody read, in request order.
    #[must_use]
    pub fn unconsumed_params(&self) -> Vec<String> {
        self.params
            .keys()
            .filter(|name| !self.consumption.is_param_consumed(name))
            .cloned()
            .collect()
    }

    /// Handle onto this request's bookkeeping.
    #[must_use]
    pub fn consumption(&self) -> ConsumptionTracker {
        self.consumption.clone()
    }
}
