//! OIDC provider client: discovery, JWKS-backed id-token verification and the OAuth2
//! authorization-code and refresh-token grants.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::{Jwk, JwkSet},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    auth::oidc::{OidcConfig, request_scopes},
    errors::{Error, Result},
};

/// Signing algorithms accepted for provider-issued id tokens.
const SUPPORTED_ALGORITHMS: [Algorithm; 8] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// The subset of the discovery document this client needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
}

/// Response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// A verified id token.
#[derive(Debug, Clone)]
pub struct IdToken {
    pub claims: Map<String, Value>,
}

/// Verification of raw id tokens against a provider.
#[async_trait]
pub trait IdTokenVerifier: Send + Sync + 'static {
    async fn verify(&self, raw_id_token: &str) -> Result<IdToken>;
}

/// A discovered OIDC provider.
///
/// Safe to share between requests: the metadata is immutable and the key set is swapped
/// atomically when it has to be re-fetched.
pub struct OidcProvider {
    metadata: ProviderMetadata,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    http: reqwest::Client,
    keys: ArcSwap<JwkSet>,
    key_refresh: Mutex<()>,
}

impl OidcProvider {
    /// Fetch `<issuer>/.well-known/openid-configuration` and build a client for it.
    ///
    /// The issuer in the document must match the configured issuer exactly.
    #[instrument(skip_all, fields(issuer = %config.issuer_url))]
    pub async fn discover(config: &OidcConfig, http: reqwest::Client) -> Result<Self> {
        let well_known = format!("{}/.well-known/openid-configuration", config.issuer_url.trim_end_matches('/'));

        let response = http.get(&well_known).send().await.map_err(|e| Error::Upstream {
            operation: format!("fetch discovery document {well_known}: {e}"),
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                operation: format!("fetch discovery document {well_known}: {status}: {body}"),
            });
        }

        let metadata: ProviderMetadata = response.json().await.map_err(|e| Error::Upstream {
            operation: format!("decode discovery document: {e}"),
        })?;

        if metadata.issuer != config.issuer_url {
            return Err(Error::Upstream {
                operation: format!(
                    "discovery: issuer did not match the issuer returned by provider, expected {:?} got {:?}",
                    config.issuer_url, metadata.issuer
                ),
            });
        }

        debug!(token_endpoint = %metadata.token_endpoint, jwks_uri = %metadata.jwks_uri, "discovered OIDC provider");

        Ok(Self {
            metadata,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_url: config.redirect_url.clone(),
            http,
            keys: ArcSwap::from_pointee(JwkSet { keys: Vec::new() }),
            key_refresh: Mutex::new(()),
        })
    }

    /// URL of the provider's authorization endpoint for a new login attempt.
    pub fn auth_code_url(&self, state: &str, scopes: &[String]) -> Url {
        let mut url = self.metadata.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            if !self.redirect_url.is_empty() {
                query.append_pair("redirect_uri", &self.redirect_url);
            }
            query.append_pair("response_type", "code");
            query.append_pair("scope", &request_scopes(scopes).join(" "));
            query.append_pair("state", state);
        }
        url
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange(&self, code: &str) -> Result<TokenResponse> {
        let mut form = vec![("grant_type", "authorization_code"), ("code", code)];
        if !self.redirect_url.is_empty() {
            form.push(("redirect_uri", self.redirect_url.as_str()));
        }
        self.token_request("exchange authorization code", &form).await
    }

    /// Run the refresh-token grant.
    ///
    /// Providers may omit the refresh token from the response, in which case the one used for the
    /// request stays valid and is returned in its place.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut token = self
            .token_request("refresh token", &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await?;

        if token.refresh_token.as_deref().unwrap_or_default().is_empty() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    async fn token_request(&self, operation: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        // RFC 6749 2.3.1: credentials are form-encoded before going into the basic auth header
        let client_id: String = url::form_urlencoded::byte_serialize(self.client_id.as_bytes()).collect();
        let client_secret: String = url::form_urlencoded::byte_serialize(self.client_secret.as_bytes()).collect();

        let response = self
            .http
            .post(self.metadata.token_endpoint.clone())
            .basic_auth(client_id, Some(client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Upstream {
                operation: format!("{operation}: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                operation: format!("{operation}: token endpoint returned {status}: {body}"),
            });
        }

        response.json::<TokenResponse>().await.map_err(|e| Error::Upstream {
            operation: format!("{operation}: decode token response: {e}"),
        })
    }

    /// Candidate keys after re-fetching the key set, for a token whose key is not cached.
    ///
    /// Misses are serialized: a task that waited on another's fetch uses its result instead of
    /// fetching again.
    async fn refresh_candidates(&self, kid: Option<&str>) -> Result<Vec<Jwk>> {
        let _guard = self.key_refresh.lock().await;

        // Another task may have fetched the keys while this one waited
        let cached = Self::candidates(&self.keys.load_full(), kid);
        if !cached.is_empty() {
            return Ok(cached);
        }

        let keys = self.fetch_keys().await?;
        Ok(Self::candidates(&keys, kid))
    }

    async fn fetch_keys(&self) -> Result<Arc<JwkSet>> {
        let response = self
            .http
            .get(self.metadata.jwks_uri.clone())
            .send()
            .await
            .map_err(|e| Error::Upstream {
                operation: format!("fetch jwks: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(Error::Upstream {
                operation: format!("fetch jwks: {}", response.status()),
            });
        }

        let keys: JwkSet = response.json().await.map_err(|e| Error::Upstream {
            operation: format!("decode jwks: {e}"),
        })?;
        debug!(keys = keys.keys.len(), "fetched provider signing keys");

        let keys = Arc::new(keys);
        self.keys.store(keys.clone());
        Ok(keys)
    }

    /// Candidate keys for a token: the matching `kid`, or every key when the token has none.
    fn candidates(keys: &JwkSet, kid: Option<&str>) -> Vec<Jwk> {
        match kid {
            Some(kid) => keys.find(kid).cloned().into_iter().collect(),
            None => keys.keys.clone(),
        }
    }

    fn decode_with(&self, raw_id_token: &str, algorithm: Algorithm, jwk: &Jwk) -> Result<IdToken> {
        let key = DecodingKey::from_jwk(jwk).map_err(|e| Error::Unauthenticated {
            message: Some(format!("unusable provider key: {e}")),
        })?;

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.metadata.issuer]);
        validation.set_audience(&[&self.client_id]);

        let data = decode::<Map<String, Value>>(raw_id_token, &key, &validation).map_err(|e| Error::Unauthenticated {
            message: Some(format!("failed to verify id token: {e}")),
        })?;

        Ok(IdToken { claims: data.claims })
    }
}

#[async_trait]
impl IdTokenVerifier for OidcProvider {
    async fn verify(&self, raw_id_token: &str) -> Result<IdToken> {
        let header = decode_header(raw_id_token).map_err(|e| Error::Unauthenticated {
            message: Some(format!("malformed id token: {e}")),
        })?;
        if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
            return Err(Error::Unauthenticated {
                message: Some(format!("unsupported id token signing algorithm {:?}", header.alg)),
            });
        }

        let keys = self.keys.load_full();
        let mut candidates = Self::candidates(&keys, header.kid.as_deref());
        if candidates.is_empty() {
            // Unknown key id: the provider may have rotated keys since the last fetch.
            candidates = self.refresh_candidates(header.kid.as_deref()).await?;
        }

        let mut last_error = Error::Unauthenticated {
            message: Some("no provider key matches the id token".to_string()),
        };
        for jwk in &candidates {
            match self.decode_with(raw_id_token, header.alg, jwk) {
                Ok(token) => return Ok(token),
                Err(e) => last_error = e,
            }
        }

        warn!("id token verification failed: {last_error}");
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeIdentityProvider, TEST_CLIENT_ID, test_http_client};
    use serde_json::json;

    #[tokio::test]
    async fn test_discovery_and_verification() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();

        let token = idp.sign_id_token(json!({"email": "a@b.com", "groups": ["devs"]}));
        let verified = provider.verify(&token).await.unwrap();

        assert_eq!(verified.claims["email"], "a@b.com");
        assert_eq!(verified.claims["sub"], "user-1");
    }

    #[tokio::test]
    async fn test_concurrent_key_misses_fetch_once() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();

        let first = idp.sign_id_token(json!({"email": "a@b.com"}));
        let second = idp.sign_id_token(json!({"email": "c@d.com"}));
        let (first, second) = tokio::join!(provider.verify(&first), provider.verify(&second));

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(idp.jwks_requests().await, 1);

        // Cached keys serve later tokens without another fetch
        provider.verify(&idp.sign_id_token(json!({}))).await.unwrap();
        assert_eq!(idp.jwks_requests().await, 1);
    }

    #[tokio::test]
    async fn test_issuer_mismatch_fails_discovery() {
        let idp = FakeIdentityProvider::start().await;
        let mut config = idp.oidc_config();
        config.issuer_url = format!("{}/", idp.issuer());

        let result = OidcProvider::discover(&config, test_http_client()).await;
        assert!(matches!(result, Err(Error::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_rejects_wrong_audience() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();

        let token = idp.sign_id_token(json!({"email": "a@b.com", "aud": "another-client"}));
        assert!(matches!(provider.verify(&token).await, Err(Error::Unauthenticated { .. })));
    }

    #[tokio::test]
    async fn test_rejects_expired_token() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();

        let token = idp.sign_id_token(json!({"email": "a@b.com", "exp": chrono::Utc::now().timestamp() - 3600}));
        assert!(provider.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_hmac_token() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();

        let hmac = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &json!({"email": "a@b.com", "aud": TEST_CLIENT_ID, "iss": idp.issuer(), "exp": 4102444800i64}),
            &jsonwebtoken::EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();

        assert!(matches!(provider.verify(&hmac).await, Err(Error::Unauthenticated { .. })));
    }

    #[tokio::test]
    async fn test_auth_code_url() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();

        let url = provider.auth_code_url("c3RhdGU=", &["email".to_string()]);
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/auth");
        assert_eq!(query["client_id"], TEST_CLIENT_ID);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["scope"], "openid email");
        assert_eq!(query["state"], "c3RhdGU=");
    }

    #[tokio::test]
    async fn test_exchange_and_refresh() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();
        idp.mock_token_endpoint(json!({"email": "a@b.com"}), Some("refresh-2")).await;

        let token = provider.exchange("auth-code").await.unwrap();
        assert_eq!(token.access_token, "access-token");
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-2"));
        assert!(token.id_token.is_some());
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token_when_omitted() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();
        idp.mock_token_endpoint(json!({"email": "a@b.com"}), None).await;

        let token = provider.refresh("refresh-1").await.unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_token_endpoint_error_is_upstream_failure() {
        let idp = FakeIdentityProvider::start().await;
        let provider = OidcProvider::discover(&idp.oidc_config(), test_http_client()).await.unwrap();
        idp.mock_token_endpoint_error().await;

        assert!(matches!(provider.exchange("bad-code").await, Err(Error::Upstream { .. })));
    }
}
