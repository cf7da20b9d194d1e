//! Shared helpers for tests: a fake identity provider, pre-seeded sessions and a test app.

use axum::http::{Request, header, request::Parts};
use axum_test::{TestResponse, TestServer};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use std::{
    sync::{Arc, Once},
    time::Duration,
};
use wiremock::{
    Mock, MockGuard, MockServer, ResponseTemplate,
    matchers::{header_exists, method, path},
};

use crate::{
    AppState, Application, Config,
    auth::{
        oidc::OidcConfig,
        password::hash_string,
        server::{AuthMethod, CLUSTER_USER_AUTH_SECRET_NAME, DEFAULT_OIDC_AUTH_SECRET_NAME},
        session::{MemorySessionStore, Session},
        token::{JwtTokenSignerVerifier, TokenSignerVerifier},
        utils::generate_random_token,
    },
    secrets::{MemorySecretStore, Secret},
};

pub const TEST_RSA_PRIVATE_KEY: &str = include_str!("../tests/fixtures/oidc_signing_key.pem");
pub const TEST_RSA_PUBLIC_KEY: &str = include_str!("../tests/fixtures/oidc_signing_key.pub.pem");

/// Modulus of the fixture key, base64url encoded for the JWKS document.
const TEST_RSA_MODULUS: &str = "1bdxc-XJrf6uyIlOERz8WVSXXw-m5qvSMAIQ0PllXCwwx00Tn31JvP1Hglg6UckR61FzqdnG7i_j05k6Zjhg9sGXUaPzn_0-4GQGsumfMPFbikN8n8BmKwTKxgo09UjDEp8aelZUbLf8xolXse_nQ33ANNuVMbb4Ij9L2ZcRgH1QpRQhQ83XNJGwjNPEWtpDsepKNyfCEyjf5b4p0-Rg8s3HMLdp4nTfksl9oTn8JKJKWlVxWo-HxLurhHHR0MI3FC5F49ri_uv6_P9Uxs7oT-vK4FV66cDeSHoo6Yf_HS1YtF-1kyy1GmqY_wGXMGCwZluKLwAARxeXnzVjyQhKWw";
const TEST_RSA_EXPONENT: &str = "AQAB";
const TEST_KEY_ID: &str = "test-key";

pub const TEST_CLIENT_ID: &str = "dashboard";
pub const TEST_CLIENT_SECRET: &str = "dashboard-client-secret";
pub const TEST_SIGNING_KEY: &str = "test-signing-key-that-is-long-enough";

pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Another test binary path may have installed it already
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

pub fn test_http_client() -> reqwest::Client {
    install_crypto_provider();
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to build test HTTP client")
}

/// `cluster-user-auth` secret with an Argon2 hash of `password`.
pub fn local_user_secret(username: &str, password: &str) -> Secret {
    Secret::from_iter([
        ("username", username.to_string()),
        ("password", hash_string(password).expect("Failed to hash password")),
    ])
}

/// Request parts carrying an existing, empty session.
pub fn parts_with_session() -> (Parts, Session) {
    let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
    let session = Session::new(generate_random_token(), store, false);

    let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
    parts.extensions.insert(session.clone());
    (parts, session)
}

/// `name=value` of the session cookie set by a response, if any.
pub fn session_cookie(response: &TestResponse) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .filter_map(|h| h.split(';').next())
        .find(|pair| !pair.ends_with('='))
        .map(str::to_string)
}

/// An OIDC provider served by wiremock: discovery, JWKS and (on demand) the token endpoint.
pub struct FakeIdentityProvider {
    server: MockServer,
}

impl FakeIdentityProvider {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let issuer = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{issuer}/auth"),
                "token_endpoint": format!("{issuer}/token"),
                "jwks_uri": format!("{issuer}/keys"),
                "userinfo_endpoint": format!("{issuer}/userinfo"),
                "response_types_supported": ["code"],
                "id_token_signing_alg_values_supported": ["RS256"],
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "kid": TEST_KEY_ID,
                    "n": TEST_RSA_MODULUS,
                    "e": TEST_RSA_EXPONENT,
                }]
            })))
            .mount(&server)
            .await;

        Self { server }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    /// The `oidc-auth` secret pointing at this provider.
    pub fn oidc_secret(&self) -> Secret {
        Secret::from_iter([
            ("issuerURL", self.issuer()),
            ("clientID", TEST_CLIENT_ID.to_string()),
            ("clientSecret", TEST_CLIENT_SECRET.to_string()),
            ("redirectURL", "http://localhost:9001/oauth2/callback".to_string()),
        ])
    }

    pub fn oidc_config(&self) -> OidcConfig {
        OidcConfig::from_secret(&self.oidc_secret())
    }

    /// An RS256 id token from this provider. `claims` are merged over valid defaults
    /// (`iss`, `aud`, `sub`, `iat`, `exp` one hour ahead).
    pub fn sign_id_token(&self, claims: Value) -> String {
        let now = Utc::now().timestamp();
        let mut all = json!({
            "iss": self.issuer(),
            "aud": TEST_CLIENT_ID,
            "sub": "user-1",
            "iat": now,
            "exp": now + 3600,
        });
        if let (Some(all), Some(extra)) = (all.as_object_mut(), claims.as_object()) {
            all.extend(extra.clone());
        }

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(TEST_KEY_ID.to_string());
        let key = EncodingKey::from_rsa_pem(TEST_RSA_PRIVATE_KEY.as_bytes()).expect("Invalid test key");
        encode(&header, &all, &key).expect("Failed to sign id token")
    }

    /// Serve successful token responses carrying an id token with `claims`.
    pub async fn mock_token_endpoint(&self, claims: Value, refresh_token: Option<&str>) {
        let mut body = json!({
            "access_token": "access-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "id_token": self.sign_id_token(claims),
        });
        if let Some(refresh_token) = refresh_token {
            body["refresh_token"] = json!(refresh_token);
        }

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Serve token responses that lack an id token.
    pub async fn mock_token_endpoint_without_id_token(&self) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-token",
                "token_type": "Bearer",
                "refresh_token": "refresh-1",
            })))
            .mount(&self.server)
            .await;
    }

    /// Number of key set fetches served so far.
    pub async fn jwks_requests(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/keys")
            .count()
    }

    pub async fn mock_token_endpoint_error(&self) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .mount(&self.server)
            .await;
    }

    /// Fails the test when the token endpoint is called while the guard is alive.
    pub async fn expect_no_token_requests(&self) -> MockGuard {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount_as_scoped(&self.server)
            .await
    }
}

/// A running application behind an in-process test server.
pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
}

#[bon::bon]
impl TestApp {
    /// Defaults: methods `[oidc, user-account]`, a local `admin`/`password` account, and OIDC
    /// only when `idp` is given.
    #[builder]
    pub async fn new(
        idp: Option<&FakeIdentityProvider>,
        methods: Option<Vec<AuthMethod>>,
        #[builder(into, default)] no_auth_user: String,
        #[builder(default = true)] local_user: bool,
        #[builder(default)] oidc_passthrough: bool,
    ) -> Self {
        install_crypto_provider();

        let secrets = Arc::new(MemorySecretStore::new());
        if local_user {
            secrets.insert(CLUSTER_USER_AUTH_SECRET_NAME, local_user_secret("admin", "password"));
        }
        if let Some(idp) = idp {
            secrets.insert(DEFAULT_OIDC_AUTH_SECRET_NAME, idp.oidc_secret());
        }

        let mut config = Config::default();
        if let Some(methods) = methods {
            config.auth.methods = methods;
        }
        config.auth.no_auth_user = no_auth_user;
        config.auth.oidc_passthrough = oidc_passthrough;
        config.auth.signing_key = Some(TEST_SIGNING_KEY.to_string());

        let app = Application::new_with_secrets(config, secrets)
            .await
            .expect("Failed to create test application");
        let state = app.state().clone();

        Self {
            server: app.into_test_server(),
            state,
        }
    }

    pub async fn local_only() -> Self {
        Self::builder().build().await
    }

    /// A token as issued by a successful local sign-in.
    pub fn sign_local_token(&self, subject: &str) -> String {
        JwtTokenSignerVerifier::hmac(TEST_SIGNING_KEY.as_bytes(), self.state.auth.token_duration())
            .sign(subject)
            .expect("Failed to sign local token")
    }

    /// Create a session holding `entries`, returning the `Cookie` header value for it.
    pub async fn seed_session(&self, entries: &[(&str, &str)]) -> String {
        let id = generate_random_token();
        for (key, value) in entries {
            self.state
                .sessions
                .store()
                .put(&id, key, value.to_string())
                .await
                .expect("Failed to seed session");
        }
        format!("{}={id}", self.state.config.auth.session.cookie_name)
    }

    pub async fn session_entry(&self, cookie: &str, key: &str) -> Option<String> {
        let (_, id) = cookie.split_once('=')?;
        self.state
            .sessions
            .store()
            .get(id, key)
            .await
            .expect("Failed to read session")
            .filter(|v| !v.is_empty())
    }
}
