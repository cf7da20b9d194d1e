//! The authentication server: OIDC login flow, local sign-in, user info, refresh and logout.
//!
//! [`AuthServer`] owns the resolved [`EnabledAuthMethods`] and every credential source. The
//! HTTP handlers in [`crate::api::handlers::auth`] are thin wrappers around its operations.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::{
    api::models::auth::{CallbackParams, LoginRequest, UserInfo},
    auth::{
        oidc::{IdTokenVerifier, OidcConfig, OidcProvider},
        password,
        principal::{
            JwtAdminCookiePrincipalGetter, JwtAuthorizationHeaderPrincipalGetter, JwtCookiePrincipalGetter, MultiAuthPrincipal,
            PrincipalGetter, UserPrincipal, parse_jwt_token,
        },
        session::{ACCESS_TOKEN_COOKIE_NAME, ID_TOKEN_COOKIE_NAME, REFRESH_TOKEN_COOKIE_NAME, STATE_COOKIE_NAME, Session},
        token::TokenSignerVerifier,
        utils::generate_random_token,
    },
    errors::{Error, Result},
    secrets::SecretStore,
};

/// Secret holding the local account's `username` and Argon2 `password` hash.
pub const CLUSTER_USER_AUTH_SECRET_NAME: &str = "cluster-user-auth";

/// Secret holding the OIDC settings unless configured otherwise.
pub const DEFAULT_OIDC_AUTH_SECRET_NAME: &str = "oidc-auth";

/// Authentication methods that can be requested in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Oidc,
    UserAccount,
    Anonymous,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::Oidc => "oidc",
            AuthMethod::UserAccount => "user-account",
            AuthMethod::Anonymous => "anonymous",
        })
    }
}

/// Methods actually available, resolved once from configuration and the secrets present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnabledAuthMethods {
    pub oidc: bool,
    pub user_account: bool,
    pub anonymous: bool,
}

impl EnabledAuthMethods {
    pub fn any(&self) -> bool {
        self.oidc || self.user_account || self.anonymous
    }
}

/// The OAuth2 `state` parameter before encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(rename = "n")]
    pub nonce: String,
    pub return_url: String,
}

impl SessionState {
    /// JSON, then standard base64.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Internal {
            operation: format!("marshal state to JSON: {e}"),
        })?;
        Ok(general_purpose::STANDARD.encode(json))
    }

    pub fn decode(value: &str) -> Result<Self> {
        let json = general_purpose::STANDARD.decode(value).map_err(|e| Error::BadRequest {
            message: format!("unable to base64 decode state: {e}"),
        })?;
        let state: Self = serde_json::from_slice(&json).map_err(|e| Error::BadRequest {
            message: format!("failed to unmarshal state to JSON: {e}"),
        })?;
        validate_return_url(&state.return_url)?;
        Ok(state)
    }
}

/// A return URL ends up in a `Location` header, which cannot carry control characters.
fn validate_return_url(return_url: &str) -> Result<()> {
    if return_url.chars().any(char::is_control) {
        return Err(Error::BadRequest {
            message: "return_url contains invalid characters".to_string(),
        });
    }
    Ok(())
}

#[derive(bon::Builder)]
pub struct AuthServerConfig {
    #[builder(default)]
    pub oidc: OidcConfig,
    #[builder(default = vec![AuthMethod::Oidc, AuthMethod::UserAccount])]
    pub methods: Vec<AuthMethod>,
    #[builder(default)]
    pub no_auth_user: String,
    #[builder(default = false)]
    pub oidc_passthrough: bool,
    pub secrets: Arc<dyn SecretStore>,
    pub signer: Arc<dyn TokenSignerVerifier>,
    pub http: reqwest::Client,
}

pub struct AuthServer {
    oidc: OidcConfig,
    provider: Option<Arc<OidcProvider>>,
    enabled: EnabledAuthMethods,
    no_auth_user: Option<String>,
    oidc_passthrough: bool,
    secrets: Arc<dyn SecretStore>,
    signer: Arc<dyn TokenSignerVerifier>,
}

impl AuthServer {
    /// Resolve the enabled methods and discover the OIDC provider if needed.
    ///
    /// Fails with [`Error::Configuration`] when a requested method cannot be provided or when
    /// nothing ends up enabled.
    #[instrument(skip_all)]
    pub async fn new(config: AuthServerConfig) -> Result<Self> {
        let requested = |method| config.methods.contains(&method);
        let mut enabled = EnabledAuthMethods::default();

        if requested(AuthMethod::UserAccount) {
            if config.secrets.get(CLUSTER_USER_AUTH_SECRET_NAME).await?.is_none() {
                return Err(Error::Configuration {
                    message: format!(
                        "{} auth requested but the {CLUSTER_USER_AUTH_SECRET_NAME} secret does not exist",
                        AuthMethod::UserAccount
                    ),
                });
            }
            enabled.user_account = true;
        }

        let provider = if requested(AuthMethod::Oidc) && config.oidc.is_configured() {
            let provider = OidcProvider::discover(&config.oidc, config.http.clone())
                .await
                .map_err(|e| Error::Configuration {
                    message: format!("could not create OIDC provider: {e}"),
                })?;
            enabled.oidc = true;
            Some(Arc::new(provider))
        } else {
            if requested(AuthMethod::Oidc) {
                info!("OIDC auth requested but no issuer is configured, skipping");
            }
            None
        };

        let no_auth_user = if requested(AuthMethod::Anonymous) {
            if config.no_auth_user.is_empty() {
                return Err(Error::Configuration {
                    message: "anonymous auth requested but no_auth_user is empty".to_string(),
                });
            }
            enabled.anonymous = true;
            Some(config.no_auth_user)
        } else {
            if !config.no_auth_user.is_empty() {
                warn!("no_auth_user is set but anonymous auth is not enabled, ignoring");
            }
            None
        };

        if !enabled.any() {
            return Err(Error::Configuration {
                message: "OIDC auth, local auth or anonymous mode must be enabled, can't start".to_string(),
            });
        }

        info!(
            oidc = enabled.oidc,
            user_account = enabled.user_account,
            anonymous = enabled.anonymous,
            "resolved authentication methods"
        );

        Ok(Self {
            oidc: config.oidc,
            provider,
            enabled,
            no_auth_user,
            oidc_passthrough: config.oidc_passthrough,
            secrets: config.secrets,
            signer: config.signer,
        })
    }

    pub fn enabled_methods(&self) -> EnabledAuthMethods {
        self.enabled
    }

    /// Whether resolved principals keep their raw bearer token for downstream use.
    pub fn passthrough_enabled(&self) -> bool {
        self.oidc_passthrough
    }

    pub fn token_duration(&self) -> Duration {
        self.oidc.token_duration
    }

    /// Principal used for requests without credentials in anonymous mode.
    pub fn anonymous_user(&self) -> Option<UserPrincipal> {
        self.no_auth_user.as_ref().map(|id| UserPrincipal::new(id.clone(), Vec::new()))
    }

    /// The getter chain for the enabled methods.
    ///
    /// The admin getter runs first: it treats tokens it cannot verify as absent, whereas the OIDC
    /// cookie getter would reject a local token outright.
    pub fn principal_getters(&self) -> MultiAuthPrincipal {
        let mut getters: Vec<Arc<dyn PrincipalGetter>> = Vec::new();

        if self.enabled.user_account {
            getters.push(Arc::new(JwtAdminCookiePrincipalGetter::new(
                self.signer.clone(),
                ID_TOKEN_COOKIE_NAME,
            )));
        }

        if let Some(provider) = &self.provider {
            let verifier: Arc<dyn IdTokenVerifier> = provider.clone();
            getters.push(Arc::new(JwtCookiePrincipalGetter::new(
                verifier.clone(),
                self.oidc.claims.clone(),
                ID_TOKEN_COOKIE_NAME,
            )));
            getters.push(Arc::new(JwtAuthorizationHeaderPrincipalGetter::new(
                verifier,
                self.oidc.claims.clone(),
            )));
        }

        MultiAuthPrincipal::new(getters)
    }

    fn oidc_provider(&self) -> Result<&OidcProvider> {
        self.provider.as_deref().ok_or_else(|| Error::BadRequest {
            message: "oidc provider not configured".to_string(),
        })
    }

    /// Begin an authorization-code login, returning the provider URL to redirect to.
    #[instrument(skip_all)]
    pub async fn start_auth_flow(&self, session: &Session, return_url: String) -> Result<Url> {
        let provider = self.oidc_provider()?;
        validate_return_url(&return_url)?;

        let state = SessionState {
            nonce: generate_random_token(),
            return_url,
        }
        .encode()?;

        let auth_code_url = provider.auth_code_url(&state, &self.oidc.scopes);
        session.put(STATE_COOKIE_NAME, state).await?;

        Ok(auth_code_url)
    }

    /// Complete a login from the provider's redirect, returning the URL to send the user back to.
    ///
    /// Nothing in the session changes unless every check passes. On success the session moves to
    /// a new id before the tokens are stored.
    #[instrument(skip_all)]
    pub async fn callback(&self, session: &Session, params: &CallbackParams) -> Result<String> {
        let provider = self.oidc_provider()?;

        if let Some(error_code) = params.error.as_deref().filter(|e| !e.is_empty()) {
            let description = params.error_description.as_deref().unwrap_or_default();
            info!(error = error_code, error_description = description, "authz redirect callback failed");
            return Err(Error::BadRequest {
                message: format!("{error_code}: {description}"),
            });
        }

        let code = params.code.as_deref().filter(|c| !c.is_empty()).ok_or_else(|| Error::BadRequest {
            message: "code value was empty".to_string(),
        })?;

        let stored_state = session.get(STATE_COOKIE_NAME).await?.ok_or_else(|| Error::BadRequest {
            message: format!("{STATE_COOKIE_NAME} was not found in the session"),
        })?;

        if params.state.as_deref() != Some(stored_state.as_str()) {
            return Err(Error::BadRequest {
                message: "state value did not match".to_string(),
            });
        }

        let state = SessionState::decode(&stored_state)?;

        let token = provider.exchange(code).await?;

        let raw_id_token = token.id_token.as_deref().filter(|t| !t.is_empty()).ok_or_else(|| Error::Internal {
            operation: "find id_token in token response".to_string(),
        })?;

        provider.verify(raw_id_token).await.map_err(|e| {
            error!("failed to verify ID token: {e}");
            Error::Internal {
                operation: format!("verify ID token: {e}"),
            }
        })?;

        session.cycle_id().await?;
        self.store_tokens(
            session,
            raw_id_token,
            &token.access_token,
            token.refresh_token.as_deref().unwrap_or_default(),
        )
        .await?;
        session.remove(STATE_COOKIE_NAME).await?;

        Ok(state.return_url)
    }

    /// Check local account credentials and store a locally-signed token on success, under a new
    /// session id.
    #[instrument(skip_all, fields(username = %request.username))]
    pub async fn sign_in(&self, session: &Session, request: LoginRequest) -> Result<()> {
        if !self.enabled.user_account {
            return Err(Error::BadRequest {
                message: "local user accounts are not enabled".to_string(),
            });
        }

        let secret = self
            .secrets
            .get(CLUSTER_USER_AUTH_SECRET_NAME)
            .await?
            .ok_or_else(|| Error::BadRequest {
                message: "Failed to query for the secret".to_string(),
            })?;

        let invalid = || Error::Unauthenticated {
            message: Some("invalid username or password".to_string()),
        };

        if request.username != secret.get_string("username") {
            info!("wrong username");
            return Err(invalid());
        }

        let password = request.password;
        let hash = secret.get_string("password");
        let verified = tokio::task::spawn_blocking(move || password::verify_string(&password, &hash))
            .await
            .map_err(|e| Error::Internal {
                operation: format!("spawn password verification task: {e}"),
            })?;

        match verified {
            Ok(true) => {}
            Ok(false) => {
                info!("wrong password");
                return Err(invalid());
            }
            Err(e) => {
                warn!("stored password hash is unusable: {e}");
                return Err(invalid());
            }
        }

        let token = self.signer.sign(&request.username)?;
        session.cycle_id().await?;
        session.put(ID_TOKEN_COOKIE_NAME, token).await
    }

    /// Identity of the session's caller.
    #[instrument(skip_all)]
    pub async fn user_info(&self, session: &Session) -> Result<UserInfo> {
        if let Some(id) = &self.no_auth_user {
            return Ok(UserInfo {
                id: id.clone(),
                ..Default::default()
            });
        }

        let raw_token = session.get(ID_TOKEN_COOKIE_NAME).await?.ok_or_else(|| Error::BadRequest {
            message: "failed to get ID Token from request".to_string(),
        })?;

        if let Ok(claims) = self.signer.verify(&raw_token) {
            return Ok(UserInfo {
                email: claims.sub.clone(),
                id: claims.sub,
                groups: Vec::new(),
            });
        }

        let Some(provider) = &self.provider else {
            return Ok(UserInfo::default());
        };

        let principal = parse_jwt_token(provider.as_ref(), self.oidc.claims.as_ref(), &raw_token)
            .await
            .map_err(|e| {
                warn!("failed to parse user ID token: {e}");
                Error::Unauthenticated {
                    message: Some(format!("failed to parse id token: {e}")),
                }
            })?;

        Ok(UserInfo::from(&principal))
    }

    /// Trade the session's refresh token for new tokens and resolve the principal they carry.
    #[instrument(skip_all)]
    pub async fn refresh(&self, session: &Session) -> Result<UserPrincipal> {
        let provider = self.oidc_provider()?;

        let refresh_token = session.get(REFRESH_TOKEN_COOKIE_NAME).await?.ok_or_else(|| Error::Unauthenticated {
            message: Some("couldn't fetch refresh token from session".to_string()),
        })?;

        let token = provider.refresh(&refresh_token).await?;

        let raw_id_token = token.id_token.as_deref().filter(|t| !t.is_empty()).ok_or_else(|| Error::Upstream {
            operation: "refresh token: no id_token in token response".to_string(),
        })?;

        self.store_tokens(
            session,
            raw_id_token,
            &token.access_token,
            token.refresh_token.as_deref().unwrap_or(&refresh_token),
        )
        .await?;

        parse_jwt_token(provider, self.oidc.claims.as_ref(), raw_id_token).await
    }

    /// Drop every entry of the session.
    #[instrument(skip_all)]
    pub async fn logout(&self, session: &Session) -> Result<()> {
        session.destroy().await.map_err(|e| {
            error!("failed to destroy session: {e}");
            Error::Internal {
                operation: format!("destroy session: {e}"),
            }
        })
    }

    async fn store_tokens(&self, session: &Session, id_token: &str, access_token: &str, refresh_token: &str) -> Result<()> {
        debug!(
            id_token = id_token.len(),
            access_token = access_token.len(),
            refresh_token = refresh_token.len(),
            "storing token sizes"
        );
        session.put(ID_TOKEN_COOKIE_NAME, id_token).await?;
        session.put(ACCESS_TOKEN_COOKIE_NAME, access_token).await?;
        session.put(REFRESH_TOKEN_COOKIE_NAME, refresh_token).await
    }
}
