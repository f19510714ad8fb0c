//! Caller identity forwarded to extensions.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Principal used until caller identity is propagated from the HTTP layer.
pub const DEFAULT_PRINCIPAL_NAME: &str = "OpenSearchUser";

/// Authenticated caller.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Principal {
    name: String,
}

impl Principal {
    /// Creates a principal.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Principal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Opaque identity token embedded in forwarded requests.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    /// Wraps a raw token value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw token value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Token issuance or validation failure.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    /// Empty principal names cannot be encoded.
    #[error("principal name is empty")]
    EmptyPrincipal,
    /// Token is not `<principal>:<extension>`.
    #[error("malformed identity token `{0}`")]
    Malformed(String),
    /// Token was minted for another extension.
    #[error("identity token was issued for extension `{actual}`, not `{expected}`")]
    WrongExtension {
        /// This extension.
        expected: String,
        /// Extension named in the token.
        actual: String,
    },
}

/// Resolves the principal on whose behalf a request is forwarded.
pub trait PrincipalResolver: Send + Sync {
    /// Principal for the current request.
    fn resolve(&self) -> Principal;
}

/// Resolver returning the same principal for every request.
#[derive(Clone, Debug)]
pub struct DefaultPrincipalResolver {
    principal: Principal,
}

impl Default for DefaultPrincipalResolver {
    fn default() -> Self {
        Self {
            principal: Principal::new(DEFAULT_PRINCIPAL_NAME),
        }
    }
}

impl DefaultPrincipalResolver {
    /// Resolver pinned to `principal`.
    #[must_use]
    pub fn with_principal(principal: Principal) -> Self {
        Self { principal }
    }
}

impl PrincipalResolver for DefaultPrincipalResolver {
    fn resolve(&self) -> Principal {
        self.principal.clone()
    }
}

/// Mints identity tokens scoped to one extension.
pub trait TokenIssuer: Send + Sync {
    /// Creates a token for `principal` usable only by `extension_id`.
    fn mint(&self, extension_id: &str, principal: &Principal) -> Result<IdentityToken, IdentityError>;
}

/// Token processor bound to one extension id.
///
/// Tokens are `<principal>:<extension id>`; the extension side uses
/// [`ExtensionTokenProcessor::extract_principal`] to recover the caller.
#[derive(Clone, Debug)]
pub struct ExtensionTokenProcessor {
    extension_id: String,
}

impl ExtensionTokenProcessor {
    /// Processor for `extension_id`.
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
        }
    }

    /// Extension this processor belongs to.
    #[must_use]
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Generates a token for `principal`.
    pub fn generate_token(&self, principal: &Principal) -> Result<IdentityToken, IdentityError> {
        if principal.name().is_empty() {
            return Err(IdentityError::EmptyPrincipal);
        }
        Ok(IdentityToken(format!(
            "{}:{}",
            principal.name(),
            self.extension_id
        )))
    }

    /// Validates `token` against this extension and returns its principal.
    pub fn extract_principal(&self, token: &IdentityToken) -> Result<Principal, IdentityError> {
        let (name, extension_id) = token
            .as_str()
            .rsplit_once(':')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| IdentityError::Malformed(token.as_str().to_owned()))?;
        if extension_id != self.extension_id {
            return Err(IdentityError::WrongExtension {
                expected: self.extension_id.clone(),
                actual: extension_id.to_owned(),
            });
        }
        Ok(Principal::new(name))
    }
}

/// Issuer building a fresh [`ExtensionTokenProcessor`] per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtensionTokenIssuer;

impl TokenIssuer for ExtensionTokenIssuer {
    fn mint(&self, extension_id: &str, principal: &Principal) -> Result<IdentityToken, IdentityError> {
        ExtensionTokenProcessor::new(extension_id).generate_token(principal)
    }
}
