//! Projection of identity-provider claims into a [`UserPrincipal`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    auth::principal::UserPrincipal,
    errors::{Error, Result},
};

/// Default claim holding the username.
pub const CLAIM_USERNAME: &str = "email";

/// Default claim holding the group list.
pub const CLAIM_GROUPS: &str = "groups";

/// Which claims identify a user, and how to namespace them.
///
/// Prefixes keep provider identities from colliding with cluster-local users and groups
/// (e.g. `oidc:` turns `admin` into `oidc:admin`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsConfig {
    pub username_claim: String,
    pub groups_claim: String,
    #[serde(default)]
    pub username_prefix: String,
    #[serde(default)]
    pub groups_prefix: String,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            username_claim: CLAIM_USERNAME.to_string(),
            groups_claim: CLAIM_GROUPS.to_string(),
            username_prefix: String::new(),
            groups_prefix: String::new(),
        }
    }
}

impl ClaimsConfig {
    /// Both claim names must be set; otherwise claims-based extraction is disabled.
    pub fn is_valid(&self) -> bool {
        !self.username_claim.is_empty() && !self.groups_claim.is_empty()
    }

    /// Build a principal from a verified token's claim set.
    ///
    /// `raw_token` is carried on the principal for pass-through to downstream systems.
    pub fn principal_from_claims(&self, claims: &Map<String, Value>, raw_token: &str) -> Result<UserPrincipal> {
        let username = match claims.get(&self.username_claim) {
            Some(Value::String(s)) => s,
            Some(_) => {
                return Err(Error::Claims {
                    message: format!("username claim {:?} in token is not a string", self.username_claim),
                });
            }
            None => {
                return Err(Error::Claims {
                    message: format!("failed to find the username claim {:?} in token", self.username_claim),
                });
            }
        };

        let groups = match claims.get(&self.groups_claim) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(group)) => vec![format!("{}{group}", self.groups_prefix)],
            Some(Value::Array(values)) => values
                .iter()
                .map(|v| match v {
                    Value::String(group) => Ok(format!("{}{group}", self.groups_prefix)),
                    other => Err(Error::Claims {
                        message: format!("groups claim {:?} contains a non-string value: {other}", self.groups_claim),
                    }),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::Claims {
                    message: format!("groups claim {:?} has unexpected type: {other}", self.groups_claim),
                });
            }
        };

        Ok(UserPrincipal::new(format!("{}{username}", self.username_prefix), groups).with_token(raw_token))
    }
}

/// Apply an optional claims policy; a disabled policy is an error rather than an empty principal.
pub fn principal_from_claims(
    config: Option<&ClaimsConfig>,
    claims: &Map<String, Value>,
    raw_token: &str,
) -> Result<UserPrincipal> {
    config
        .ok_or_else(|| Error::Claims {
            message: "claims-based extraction is disabled: username and groups claims must be configured".to_string(),
        })?
        .principal_from_claims(claims, raw_token)
}
