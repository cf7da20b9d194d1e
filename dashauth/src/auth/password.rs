//! Password hashing and verification for the local user account.
//!
//! The `cluster-user-auth` secret stores the password either as a bcrypt hash (`$2a$`, `$2b$`,
//! `$2y$`), the format existing hash tooling writes, or as an Argon2 PHC string
//! (`$argon2id$v=19$...`). Comparison always goes through the matching verifier, never byte
//! equality. New hashes are Argon2.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::errors::Error;

/// Hash a password using Argon2 with default secure parameters.
pub fn hash_string(input: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(input.as_bytes(), &salt)
        .map_err(|e| Error::Internal {
            operation: format!("hash string: {e}"),
        })?;

    Ok(hash.to_string())
}

/// Modular-crypt prefixes of bcrypt hashes.
const BCRYPT_PREFIXES: [&str; 4] = ["$2a$", "$2b$", "$2x$", "$2y$"];

/// Verify a string against a hash.
///
/// Accepts bcrypt hashes as written by existing deployments, and Argon2 PHC strings otherwise.
/// Returns `Ok(false)` on mismatch and an error when the stored hash cannot be parsed.
/// Verification uses the parameters embedded in the hash itself.
pub fn verify_string(input: &str, hash: &str) -> Result<bool, Error> {
    if BCRYPT_PREFIXES.iter().any(|prefix| hash.starts_with(prefix)) {
        return bcrypt::verify(input, hash).map_err(|e| Error::Internal {
            operation: format!("verify bcrypt hash: {e}"),
        });
    }

    let parsed_hash = PasswordHash::new(hash).map_err(|e| Error::Internal {
        operation: format!("parse hash: {e}"),
    })?;

    let argon2 = Argon2::default();
    Ok(argon2.verify_password(input.as_bytes(), &parsed_hash).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hashing() {
        let input = "test_password_123";
        let hash = hash_string(input).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_string(input, &hash).unwrap());
        assert!(!verify_string("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_same_input_different_hashes() {
        let input = "same_password";

        let hash1 = hash_string(input).unwrap();
        let hash2 = hash_string(input).unwrap();

        // Salted
        assert_ne!(hash1, hash2);
        assert!(verify_string(input, &hash1).unwrap());
        assert!(verify_string(input, &hash2).unwrap());
    }

    #[test]
    fn test_bcrypt_hashes_verify() {
        // OpenBSD reference vector
        let hash = "$2a$05$CCCCCCCCCCCCCCCCCCCCC.E5YPO9kmyuRGyh0XouQYb4YMJKvyOeW";
        assert!(verify_string("U*U", hash).unwrap());
        assert!(!verify_string("U*V", hash).unwrap());

        let hash = bcrypt::hash("password", 4).unwrap();
        assert!(hash.starts_with("$2b$"));
        assert!(verify_string("password", &hash).unwrap());
        assert!(!verify_string("wrong", &hash).unwrap());
    }

    #[test]
    fn test_malformed_bcrypt_hash_is_an_error() {
        assert!(matches!(verify_string("password", "$2y$10$short"), Err(Error::Internal { .. })));
    }

    #[test]
    fn test_plaintext_secret_is_not_accepted_as_hash() {
        // A secret holding the raw password must not verify by equality
        let result = verify_string("admin-password", "admin-password");
        assert!(matches!(result, Err(Error::Internal { .. })));
    }
}
