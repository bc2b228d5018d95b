use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::config::schema::{str_to_hex_hash, AuthConfig};
use crate::data_types::{ColumnType, Value};
use crate::expr::PrincipalAttr;

pub const ANONYMOUS_ROLE: &str = "anonymous";
pub const ADMIN_ROLE: &str = "admin";

/// Resolved identity of an API caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub id: Option<String>,
    pub role: String,
    pub claims: HashMap<String, JsonValue>,
}

impl Principal {
    pub fn new(id: &str, role: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            role: role.to_string(),
            claims: HashMap::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            id: None,
            role: ANONYMOUS_ROLE.to_string(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, key: &str, value: JsonValue) -> Self {
        self.claims.insert(key.to_string(), value);
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    /// Value of an attribute referenced by a policy, coerced to the type it
    /// is compared as. Anything missing or not coercible becomes NULL, which
    /// no comparison matches.
    pub fn attribute(&self, attr: &PrincipalAttr, value_type: ColumnType) -> Value {
        let value = match attr {
            PrincipalAttr::Id => self
                .id
                .as_deref()
                .and_then(|id| Value::from_path_segment(value_type, id)),
            PrincipalAttr::Role => Value::from_path_segment(value_type, &self.role),
            PrincipalAttr::Claim(key) => self
                .claims
                .get(key)
                .and_then(|claim| Value::from_json(value_type, claim)),
        };
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingToken,

    #[error("Malformed Authorization header (expected \"Bearer <token>\")")]
    MalformedHeader,

    #[error("Invalid or unknown token")]
    InvalidToken,
}

/// Resolves a bearer token into a [`Principal`]. Token issuance and
/// verification live outside the records engine; this is the seam where a
/// deployment plugs in its own identity provider.
#[async_trait]
pub trait Authenticator: Send + Sync + Debug {
    async fn resolve_principal(&self, token: Option<&str>) -> Result<Principal, AuthError>;
}

/// Authenticator backed by a fixed list of SHA-256 hashed tokens from the
/// config file.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
    allow_anonymous: bool,
}

impl StaticTokenAuthenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|token| {
                let principal = Principal {
                    id: Some(token.id.clone()),
                    role: token.role.clone(),
                    claims: token.claims.clone(),
                };
                (token.sha256_hash.to_lowercase(), principal)
            })
            .collect();

        Self {
            tokens,
            allow_anonymous: config.allow_anonymous,
        }
    }

    pub fn anonymous_allowed() -> Self {
        Self {
            tokens: HashMap::new(),
            allow_anonymous: true,
        }
    }

    pub fn with_token(mut self, token: &str, principal: Principal) -> Self {
        self.tokens.insert(str_to_hex_hash(token), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn resolve_principal(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        match token {
            None if self.allow_anonymous => Ok(Principal::anonymous()),
            None => Err(AuthError::MissingToken),
            Some(token) => self
                .tokens
                .get(&str_to_hex_hash(token))
                .cloned()
                .ok_or(AuthError::InvalidToken),
        }
    }
}

/// Extract the bearer token from an `Authorization` header value.
pub fn header_to_token(header: Option<&str>) -> Result<Option<String>, AuthError> {
    match header {
        None => Ok(None),
        Some(header) => match header.split_once(' ') {
            Some((scheme, token))
                if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() =>
            {
                Ok(Some(token.trim().to_string()))
            }
            _ => Err(AuthError::MalformedHeader),
        },
    }
}
