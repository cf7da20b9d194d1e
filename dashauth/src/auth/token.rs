//! Locally-signed admin tokens.
//!
//! Tokens issued after a successful local sign-in carry only a subject and an expiry. They are
//! stored in the `id_token` session entry, the same slot an OIDC id token occupies, which is why
//! verification failures here are routinely expected (see
//! [`JwtAdminCookiePrincipalGetter`](super::principal::JwtAdminCookiePrincipalGetter)).

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{
    auth::utils::generate_random_bytes,
    errors::{Error, Result},
};

/// Claims of a locally-signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String, // Subject (username)
    pub exp: i64,    // Expiration time
    pub iat: i64,    // Issued at
}

/// Issues and verifies locally-signed tokens.
pub trait TokenSignerVerifier: Send + Sync + 'static {
    /// Sign a token for `subject`, valid for the signer's configured lifetime.
    fn sign(&self, subject: &str) -> Result<String>;

    /// Verify a token, failing with [`Error::UnauthorizedToken`] for any invalid, expired or
    /// foreign token.
    fn verify(&self, token: &str) -> Result<AdminClaims>;
}

/// JWT implementation of [`TokenSignerVerifier`], HMAC or RSA keyed.
pub struct JwtTokenSignerVerifier {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry: Duration,
}

impl JwtTokenSignerVerifier {
    /// HS256 signer with a caller-supplied secret.
    pub fn hmac(secret: &[u8], expiry: Duration) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            expiry,
        }
    }

    /// HS256 signer with a key generated for this process; tokens do not survive a restart.
    pub fn random_hmac(expiry: Duration) -> Self {
        Self::hmac(&generate_random_bytes(), expiry)
    }

    /// RS256 signer from PEM encoded keys.
    pub fn rsa_pem(private_pem: &[u8], public_pem: &[u8], expiry: Duration) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem).map_err(|e| Error::Configuration {
            message: format!("invalid RSA private key: {e}"),
        })?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem).map_err(|e| Error::Configuration {
            message: format!("invalid RSA public key: {e}"),
        })?;

        Ok(Self {
            algorithm: Algorithm::RS256,
            encoding_key,
            decoding_key,
            expiry,
        })
    }
}

impl TokenSignerVerifier for JwtTokenSignerVerifier {
    fn sign(&self, subject: &str) -> Result<String> {
        let now = Utc::now();
        let expiry = chrono::Duration::from_std(self.expiry).map_err(|e| Error::Internal {
            operation: format!("convert token expiry: {e}"),
        })?;

        let claims = AdminClaims {
            sub: subject.to_string(),
            exp: (now + expiry).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key).map_err(|e| Error::Internal {
            operation: format!("create JWT: {e}"),
        })
    }

    fn verify(&self, token: &str) -> Result<AdminClaims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        decode::<AdminClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("local token verification failed: {e}");
                Error::UnauthorizedToken
            })
    }
}
