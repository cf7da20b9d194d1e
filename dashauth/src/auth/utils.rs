//! Authentication utility functions.

use base64::{Engine as _, engine::general_purpose};
use rand::prelude::RngExt;
use rand::rng;

/// Generate 32 bytes of cryptographically secure random data, encoded as base64url without
/// padding (43 characters).
///
/// Used for OAuth2 nonces and session identifiers.
pub fn generate_random_token() -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(generate_random_bytes())
}

/// Raw 256-bit random key material, e.g. for an ephemeral HMAC signing key.
pub fn generate_random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rng().fill(&mut bytes);
    bytes
}
