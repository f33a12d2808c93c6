//! Claims providers: resolve the calling principal for a request.

use crate::error::AuthError;
use crate::oidc::OidcValidator;
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::{Map, Value};

/// Resolved identity attributes for one request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Claims {
    pub subject: String,
    pub name: Option<String>,
    pub issuer: Option<String>,
    pub roles: Vec<String>,
    /// Every claim as received, used for `claim_*` policy context attributes.
    pub raw: Map<String, Value>,
}

impl Claims {
    /// Build claims from a decoded token payload.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingSubject`] when neither `sub` nor `oid` is present.
    pub fn from_token(payload: Value, roles_claim: &str) -> Result<Self, AuthError> {
        let Value::Object(raw) = payload else {
            return Err(AuthError::InvalidToken("claims are not an object".to_string()));
        };
        // `oid` covers Entra ID tokens without `sub`.
        let subject = raw
            .get("sub")
            .or_else(|| raw.get("oid"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSubject)?
            .to_string();
        let name = raw
            .get("name")
            .or_else(|| raw.get("preferred_username"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let issuer = raw.get("iss").and_then(Value::as_str).map(str::to_string);
        let roles = match raw.get(roles_claim) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            subject,
            name,
            issuer,
            roles,
            raw,
        })
    }

    fn fixed(subject: &str, name: &str, issuer: &str, roles: Vec<String>) -> Self {
        let mut raw = Map::new();
        raw.insert("sub".to_string(), Value::String(subject.to_string()));
        raw.insert("name".to_string(), Value::String(name.to_string()));
        raw.insert("iss".to_string(), Value::String(issuer.to_string()));
        Self {
            subject: subject.to_string(),
            name: Some(name.to_string()),
            issuer: Some(issuer.to_string()),
            roles,
            raw,
        }
    }
}

#[async_trait]
pub trait ClaimsProvider: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Claims, AuthError>;

    /// Realm advertised in the `WWW-Authenticate` challenge.
    fn realm(&self) -> &str;
}

/// Every caller is the same anonymous principal.
pub struct AnonymousClaims;

#[async_trait]
impl ClaimsProvider for AnonymousClaims {
    async fn resolve(&self, _headers: &HeaderMap) -> Result<Claims, AuthError> {
        Ok(Claims::fixed("anonymous", "Anonymous User", "local", Vec::new()))
    }

    fn realm(&self) -> &str {
        "local"
    }
}

/// Every caller is a fixed local user (local development).
pub struct LocalUserClaims {
    username: String,
    roles: Vec<String>,
}

impl LocalUserClaims {
    #[must_use]
    pub fn new(username: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            username: username.into(),
            roles,
        }
    }
}

#[async_trait]
impl ClaimsProvider for LocalUserClaims {
    async fn resolve(&self, _headers: &HeaderMap) -> Result<Claims, AuthError> {
        Ok(Claims::fixed(
            &self.username,
            &self.username,
            "local",
            self.roles.clone(),
        ))
    }

    fn realm(&self) -> &str {
        "local"
    }
}

/// Bearer JWT validated against an OIDC issuer.
pub struct OidcClaims {
    validator: OidcValidator,
    roles_claim: String,
    realm: String,
}

impl OidcClaims {
    #[must_use]
    pub fn new(validator: OidcValidator, roles_claim: String, realm: Option<String>) -> Self {
        let realm = realm.unwrap_or_else(|| validator.issuer().to_string());
        Self {
            validator,
            roles_claim,
            realm,
        }
    }
}

#[async_trait]
impl ClaimsProvider for OidcClaims {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Claims, AuthError> {
        let jwt = extract_bearer(headers).ok_or(AuthError::MissingToken)?;
        let payload = self.validator.validate(&jwt).await.map_err(|e| {
            tracing::warn!(error = %e, "oidc jwt validation failed");
            AuthError::InvalidToken(e.to_string())
        })?;
        Claims::from_token(payload, &self.roles_claim)
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let authz = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(str::trim)?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}
