//! # dashauth: authentication server for the cluster dashboard
//!
//! `dashauth` establishes who is calling the dashboard API. It reconciles three trust sources
//! into one principal-resolution policy:
//!
//! - **OIDC**: an authorization-code login against an external identity provider, with the
//!   resulting id token kept server-side in the session or sent as a bearer token
//! - **Local user account**: a single account whose username and Argon2 password hash live in
//!   the `cluster-user-auth` secret, signed in with a locally-issued token
//! - **Anonymous**: every request acts as a configured user
//!
//! ## Request Flow
//!
//! ```text
//! request -> TraceLayer -> session middleware -> /oauth2/* handlers
//!                                             -> authenticate -> /v1/* handlers
//! ```
//!
//! The session middleware attaches a [`auth::session::Session`] to every request and writes the
//! session cookie on the way out. Protected routes additionally run
//! [`auth::middleware::authenticate`], which resolves a [`auth::principal::UserPrincipal`] from
//! the getter chain built by [`auth::server::AuthServer`].
//!
//! ## Configuration
//!
//! See [`config`]. Secrets are read from a directory laid out the way Kubernetes mounts secrets
//! (see [`secrets::DirectorySecretStore`]).

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod secrets;
pub mod telemetry;

#[cfg(test)]
mod test_utils;

use anyhow::Context as _;
use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, instrument};

use crate::{
    api::handlers::{auth as auth_handlers, whoami},
    auth::{
        middleware::authenticate,
        oidc::OidcConfig,
        principal::MultiAuthPrincipal,
        server::{AuthServer, AuthServerConfig},
        session::{MemorySessionStore, SessionManager, session_middleware},
        token::{JwtTokenSignerVerifier, TokenSignerVerifier},
    },
    secrets::{DirectorySecretStore, SecretStore},
};

/// Application state shared across all request handlers.
///
/// - `config`: configuration the application was started with
/// - `auth`: the authentication server and its resolved methods
/// - `principals`: getter chain for protected routes, built once from `auth`
/// - `sessions`: session loading and cookie handling
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub auth: Arc<AuthServer>,
    #[builder(default)]
    pub principals: MultiAuthPrincipal,
    pub sessions: SessionManager,
}

/// Construct the shared state: OIDC settings, token signer, auth server and session store.
#[instrument(skip_all)]
pub async fn build_app_state(config: &Config, secrets: Arc<dyn SecretStore>) -> anyhow::Result<AppState> {
    let http = reqwest::Client::builder()
        .timeout(config.auth.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let oidc = OidcConfig::load(secrets.as_ref(), &config.auth.oidc_secret_name).await?;
    debug!(?oidc, "loaded OIDC configuration");
    let token_duration = oidc.token_duration;

    let signer: Arc<dyn TokenSignerVerifier> = match &config.auth.signing_key {
        Some(key) => Arc::new(JwtTokenSignerVerifier::hmac(key.as_bytes(), token_duration)),
        None => {
            info!("No signing key configured, generating one; local sign-ins will not survive a restart");
            Arc::new(JwtTokenSignerVerifier::random_hmac(token_duration))
        }
    };

    let auth = AuthServer::new(
        AuthServerConfig::builder()
            .oidc(oidc)
            .methods(config.auth.methods.clone())
            .no_auth_user(config.auth.no_auth_user.clone())
            .oidc_passthrough(config.auth.oidc_passthrough)
            .secrets(secrets)
            .signer(signer)
            .http(http)
            .build(),
    )
    .await
    .context("Failed to initialize authentication")?;

    let sessions = SessionManager::new(
        Arc::new(MemorySessionStore::new(token_duration)),
        config.auth.session.cookie_name.clone(),
        config.auth.session.cookie_secure,
        token_duration,
    );

    Ok(AppState::builder()
        .config(config.clone())
        .principals(auth.principal_getters())
        .auth(Arc::new(auth))
        .sessions(sessions)
        .build())
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let oauth2_routes = Router::new()
        .route("/oauth2/start", get(auth_handlers::start))
        .route("/oauth2/callback", get(auth_handlers::callback))
        .route("/oauth2/sign_in", post(auth_handlers::sign_in))
        .route("/oauth2/userinfo", get(auth_handlers::user_info))
        .route("/oauth2/refresh", post(auth_handlers::refresh))
        .route("/oauth2/logout", post(auth_handlers::logout));

    let protected_routes = Router::new()
        .route("/v1/whoami", get(whoami::whoami))
        .route_layer(from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .merge(oauth2_routes)
        .merge(protected_routes)
        .layer(from_fn_with_state(state.clone(), session_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// A configured, ready-to-serve application.
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
}

impl Application {
    /// Create the application, reading secrets from `config.secrets.dir`.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let secrets = Arc::new(DirectorySecretStore::new(config.secrets.dir.clone()));
        Self::new_with_secrets(config, secrets).await
    }

    /// Create the application with an explicit secret store.
    pub async fn new_with_secrets(config: Config, secrets: Arc<dyn SecretStore>) -> anyhow::Result<Self> {
        debug!(
            bind_address = %config.bind_address(),
            methods = ?config.auth.methods,
            secrets_dir = %config.secrets.dir.display(),
            "Starting dashauth"
        );

        let app_state = build_app_state(&config, secrets).await?;
        let router = build_router(app_state.clone());

        Ok(Self {
            router,
            app_state,
            config,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {bind_addr}"))?;
        info!(
            namespace = %self.config.namespace,
            "dashauth listening on http://{}, methods: {:?}",
            bind_addr,
            self.app_state.auth.enabled_methods()
        );

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        info!("Server stopped");
        Ok(())
    }
}
