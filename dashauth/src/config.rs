//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `DASHAUTH_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `DASHAUTH_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `DASHAUTH_AUTH__NO_AUTH_USER=dev` sets the `auth.no_auth_user` field.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`
//! - **Secrets**: `secrets.dir` - root of the mounted secrets (`<dir>/<secret>/<key>`)
//! - **Authentication**: `auth.methods`, `auth.no_auth_user`, `auth.oidc_secret_name`,
//!   `auth.signing_key`, `auth.http_timeout`, `auth.session.*`
//! - **Telemetry**: `enable_otel_export`
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! DASHAUTH_PORT=9001
//! DASHAUTH_AUTH__METHODS='[oidc, anonymous]'
//! DASHAUTH_AUTH__SESSION__COOKIE_SECURE=true
//! ```
//!
//! Leaving `auth.signing_key` unset generates a key at startup; local sign-ins then do not
//! survive a restart.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

use crate::{
    auth::{
        server::{AuthMethod, DEFAULT_OIDC_AUTH_SECRET_NAME},
        session::DEFAULT_SESSION_COOKIE_NAME,
    },
    errors::Error,
};

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DASHAUTH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Namespace the dashboard runs in; informational
    pub namespace: String,
    pub secrets: SecretsConfig,
    pub auth: AuthConfig,
    /// Export traces over OTLP (configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            namespace: "default".to_string(),
            secrets: SecretsConfig::default(),
            auth: AuthConfig::default(),
            enable_otel_export: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsConfig {
    /// Directory holding one subdirectory per secret
    pub dir: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/dashauth/secrets"),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Methods to enable, subject to their secrets being present
    pub methods: Vec<AuthMethod>,
    /// Identity used for every request in anonymous mode
    pub no_auth_user: String,
    /// Name of the secret holding the OIDC settings
    pub oidc_secret_name: String,
    /// Keep the raw bearer token on resolved principals
    pub oidc_passthrough: bool,
    /// HMAC key for locally-signed tokens
    pub signing_key: Option<String>,
    /// Timeout for requests to the identity provider
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            methods: vec![AuthMethod::Oidc, AuthMethod::UserAccount],
            no_auth_user: String::new(),
            oidc_secret_name: DEFAULT_OIDC_AUTH_SECRET_NAME.to_string(),
            oidc_passthrough: false,
            signing_key: None,
            http_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("methods", &self.methods)
            .field("no_auth_user", &self.no_auth_user)
            .field("oidc_secret_name", &self.oidc_secret_name)
            .field("oidc_passthrough", &self.oidc_passthrough)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .field("http_timeout", &self.http_timeout)
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Add the `Secure` attribute; enable whenever the dashboard is served over HTTPS
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            cookie_secure: false,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        Self::figment(args).extract()
    }

    /// Checks that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), Error> {
        if self.auth.methods.is_empty() {
            return Err(Error::Configuration {
                message: "auth.methods must enable at least one authentication method".to_string(),
            });
        }

        if self.auth.methods.contains(&AuthMethod::Anonymous) && self.auth.no_auth_user.is_empty() {
            return Err(Error::Configuration {
                message: "auth.no_auth_user must be set when anonymous auth is enabled".to_string(),
            });
        }

        if self.auth.session.cookie_name.is_empty()
            || self
                .auth
                .session
                .cookie_name
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, ';' | '=' | ','))
        {
            return Err(Error::Configuration {
                message: format!("invalid session cookie name {:?}", self.auth.session.cookie_name),
            });
        }

        if self.auth.signing_key.as_deref().is_some_and(|k| k.len() < 32) {
            return Err(Error::Configuration {
                message: "auth.signing_key must be at least 32 bytes".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables override specific values
            .merge(Env::prefixed("DASHAUTH_").ignore(&["config"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
