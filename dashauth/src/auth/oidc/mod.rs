//! OpenID Connect configuration and provider client.
//!
//! [`OidcConfig`] is read once from a secret at startup; [`provider::OidcProvider`] performs
//! discovery, id-token verification and the OAuth2 token grants against the issuer it names.

pub mod provider;

use std::{fmt, time::Duration};

use tracing::info;

use crate::{
    auth::claims::{CLAIM_GROUPS, CLAIM_USERNAME, ClaimsConfig},
    errors::Result,
    secrets::{Secret, SecretStore},
};

pub use provider::{IdToken, IdTokenVerifier, OidcProvider, TokenResponse};

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_EMAIL: &str = "email";
pub const SCOPE_GROUPS: &str = "groups";

/// Scopes requested when the secret does not name any.
pub const DEFAULT_SCOPES: [&str; 4] = [SCOPE_OPENID, SCOPE_OFFLINE_ACCESS, SCOPE_EMAIL, SCOPE_GROUPS];

/// Lifetime of OIDC and local-token cookies when the secret does not set one.
pub const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(60 * 60);

/// Settings for talking to an OIDC issuer.
#[derive(Clone, PartialEq, Eq)]
pub struct OidcConfig {
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub token_duration: Duration,
    pub scopes: Vec<String>,
    /// `None` when either claim name is configured empty.
    pub claims: Option<ClaimsConfig>,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            token_duration: DEFAULT_TOKEN_DURATION,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            claims: Some(ClaimsConfig::default()),
        }
    }
}

impl fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcConfig")
            .field("issuer_url", &self.issuer_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_url", &self.redirect_url)
            .field("token_duration", &self.token_duration)
            .field("scopes", &self.scopes)
            .field("claims", &self.claims)
            .finish()
    }
}

impl OidcConfig {
    /// Read the OIDC settings from a secret.
    ///
    /// Recognised keys: `issuerURL`, `clientID`, `clientSecret`, `redirectURL`,
    /// `oidcUsernamePrefix`, `oidcGroupsPrefix`, `tokenDuration` (default `1h`),
    /// `claimUsername` (default `email`), `claimGroups` (default `groups`) and `customScopes`
    /// (comma separated, default `openid,offline_access,email,groups`).
    pub fn from_secret(secret: &Secret) -> Self {
        let token_duration = humantime::parse_duration(&secret.get_string("tokenDuration")).unwrap_or(DEFAULT_TOKEN_DURATION);

        let mut scopes = split_and_trim(&secret.get_string("customScopes"));
        if scopes.is_empty() {
            scopes = DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
        }

        Self {
            issuer_url: secret.get_string("issuerURL"),
            client_id: secret.get_string("clientID"),
            client_secret: secret.get_string("clientSecret"),
            redirect_url: secret.get_string("redirectURL"),
            token_duration,
            scopes,
            claims: claims_config_from_secret(secret),
        }
    }

    /// Read the named secret; a missing secret yields an unconfigured (disabled) config.
    pub async fn load(secrets: &dyn SecretStore, secret_name: &str) -> Result<Self> {
        match secrets.get(secret_name).await? {
            Some(secret) => Ok(Self::from_secret(&secret)),
            None => {
                info!(secret = secret_name, "OIDC secret not found, OIDC auth is unavailable");
                Ok(Self::default())
            }
        }
    }

    /// OIDC is only usable with an issuer to talk to.
    pub fn is_configured(&self) -> bool {
        !self.issuer_url.is_empty()
    }
}

fn claims_config_from_secret(secret: &Secret) -> Option<ClaimsConfig> {
    // A key that is present but empty disables claims extraction; an absent key takes the default.
    let username_claim = if secret.contains_key("claimUsername") {
        secret.get_string("claimUsername")
    } else {
        CLAIM_USERNAME.to_string()
    };
    let groups_claim = if secret.contains_key("claimGroups") {
        secret.get_string("claimGroups")
    } else {
        CLAIM_GROUPS.to_string()
    };

    let config = ClaimsConfig {
        username_claim,
        groups_claim,
        username_prefix: secret.get_string("oidcUsernamePrefix"),
        groups_prefix: secret.get_string("oidcGroupsPrefix"),
    };

    config.is_valid().then_some(config)
}

fn split_and_trim(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|v| !v.is_empty()).map(str::to_string).collect()
}

/// Scopes for an authorization request, with `openid` always present.
pub fn request_scopes(scopes: &[String]) -> Vec<String> {
    let mut request = Vec::with_capacity(scopes.len() + 1);
    if !scopes.iter().any(|s| s == SCOPE_OPENID) {
        request.push(SCOPE_OPENID.to_string());
    }
    request.extend(scopes.iter().cloned());
    request
}
