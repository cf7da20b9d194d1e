//! Resolution of the caller's identity from request credentials.
//!
//! Each [`PrincipalGetter`] looks at one trust source. A getter returns `Ok(None)` when its
//! credential is not present at all and `Err` when it is present but does not verify.
//! [`MultiAuthPrincipal`] runs them in order and the first answer wins.

use async_trait::async_trait;
use axum::http::{header, request::Parts};
use serde::Serialize;
use std::{fmt, sync::Arc};
use tracing::{debug, instrument, trace};

use crate::{
    auth::{
        claims::{ClaimsConfig, principal_from_claims},
        oidc::IdTokenVerifier,
        session::Session,
        token::TokenSignerVerifier,
    },
    errors::{Error, Result},
};

/// A resolved caller identity.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct UserPrincipal {
    id: String,
    groups: Vec<String>,
    #[serde(skip)]
    token: String,
}

impl UserPrincipal {
    pub fn new(id: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            id: id.into(),
            groups,
            token: String::new(),
        }
    }

    /// Attach the raw bearer credential the principal was resolved from.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// The same identity with the raw credential dropped.
    pub fn without_token(mut self) -> Self {
        self.token.clear();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Raw credential, empty when none is carried.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPrincipal")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id=\"{}\" groups={:?}", self.id, self.groups)
    }
}

/// One source of caller identity.
#[async_trait]
pub trait PrincipalGetter: Send + Sync + 'static {
    /// Short tag used in diagnostics.
    fn name(&self) -> &'static str;

    async fn principal(&self, parts: &Parts) -> Result<Option<UserPrincipal>>;
}

/// Verify a provider-issued id token and project its claims.
pub async fn parse_jwt_token(
    verifier: &dyn IdTokenVerifier,
    claims: Option<&ClaimsConfig>,
    raw_token: &str,
) -> Result<UserPrincipal> {
    debug!(size = raw_token.len(), "verifying id token");
    let token = verifier.verify(raw_token).await?;
    principal_from_claims(claims, &token.claims, raw_token)
}

async fn session_entry(parts: &Parts, key: &str) -> Result<Option<String>> {
    match parts.extensions.get::<Session>() {
        Some(session) => session.get(key).await,
        None => Ok(None),
    }
}

/// Reads a provider id token from a session entry.
pub struct JwtCookiePrincipalGetter {
    verifier: Arc<dyn IdTokenVerifier>,
    claims: Option<ClaimsConfig>,
    cookie_name: String,
}

impl JwtCookiePrincipalGetter {
    pub fn new(verifier: Arc<dyn IdTokenVerifier>, claims: Option<ClaimsConfig>, cookie_name: impl Into<String>) -> Self {
        Self {
            verifier,
            claims,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl PrincipalGetter for JwtCookiePrincipalGetter {
    fn name(&self) -> &'static str {
        "oidc-cookie"
    }

    #[instrument(skip_all, fields(cookie = %self.cookie_name))]
    async fn principal(&self, parts: &Parts) -> Result<Option<UserPrincipal>> {
        let Some(raw) = session_entry(parts, &self.cookie_name).await? else {
            return Ok(None);
        };

        parse_jwt_token(self.verifier.as_ref(), self.claims.as_ref(), &raw).await.map(Some)
    }
}

/// Reads a provider id token from `Authorization: Bearer <token>`.
pub struct JwtAuthorizationHeaderPrincipalGetter {
    verifier: Arc<dyn IdTokenVerifier>,
    claims: Option<ClaimsConfig>,
}

impl JwtAuthorizationHeaderPrincipalGetter {
    pub fn new(verifier: Arc<dyn IdTokenVerifier>, claims: Option<ClaimsConfig>) -> Self {
        Self { verifier, claims }
    }
}

/// The token from an `Authorization` header value.
///
/// The value must be exactly `Bearer <token>`: one single space, case-sensitive scheme.
pub fn extract_token(header_value: &str) -> Option<&str> {
    let parts: Vec<&str> = header_value.split(' ').collect();
    match parts.as_slice() {
        ["Bearer", token] => Some(*token),
        _ => None,
    }
}

#[async_trait]
impl PrincipalGetter for JwtAuthorizationHeaderPrincipalGetter {
    fn name(&self) -> &'static str {
        "oidc-header"
    }

    #[instrument(skip_all)]
    async fn principal(&self, parts: &Parts) -> Result<Option<UserPrincipal>> {
        let Some(token) = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(extract_token)
        else {
            return Ok(None);
        };

        parse_jwt_token(self.verifier.as_ref(), self.claims.as_ref(), token).await.map(Some)
    }
}

/// Reads a locally-signed token from a session entry.
///
/// The entry is shared with provider id tokens, so a token that does not verify locally is
/// reported as absent and left for the OIDC getters to judge.
pub struct JwtAdminCookiePrincipalGetter {
    signer: Arc<dyn TokenSignerVerifier>,
    cookie_name: String,
}

impl JwtAdminCookiePrincipalGetter {
    pub fn new(signer: Arc<dyn TokenSignerVerifier>, cookie_name: impl Into<String>) -> Self {
        Self {
            signer,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl PrincipalGetter for JwtAdminCookiePrincipalGetter {
    fn name(&self) -> &'static str {
        "admin-cookie"
    }

    #[instrument(skip_all, fields(cookie = %self.cookie_name))]
    async fn principal(&self, parts: &Parts) -> Result<Option<UserPrincipal>> {
        let Some(raw) = session_entry(parts, &self.cookie_name).await? else {
            return Ok(None);
        };

        match self.signer.verify(&raw) {
            Ok(claims) => Ok(Some(UserPrincipal::new(claims.sub, Vec::new()))),
            Err(e) => {
                debug!("session token is not a local admin token: {e}");
                Ok(None)
            }
        }
    }
}

/// Ordered chain of getters.
#[derive(Clone, Default)]
pub struct MultiAuthPrincipal {
    getters: Vec<Arc<dyn PrincipalGetter>>,
}

impl MultiAuthPrincipal {
    pub fn new(getters: Vec<Arc<dyn PrincipalGetter>>) -> Self {
        Self { getters }
    }

    pub fn is_empty(&self) -> bool {
        self.getters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.getters.iter().map(|g| g.name()).collect()
    }

    /// First principal found wins; the first error stops the chain.
    pub async fn principal(&self, parts: &Parts) -> Result<UserPrincipal> {
        for getter in &self.getters {
            match getter.principal(parts).await {
                Ok(Some(principal)) => {
                    trace!(getter = getter.name(), %principal, "found principal");
                    return Ok(principal);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(getter = getter.name(), "failed to get principal: {e}");
                    return Err(e);
                }
            }
        }

        Err(Error::NoPrincipal)
    }
}
