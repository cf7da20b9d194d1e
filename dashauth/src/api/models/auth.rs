use serde::{Deserialize, Serialize};

use crate::auth::principal::UserPrincipal;

/// Local account credentials posted to `/oauth2/sign_in`.
#[derive(Clone, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity reported by `/oauth2/userinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    pub id: String,
    pub groups: Vec<String>,
}

impl From<&UserPrincipal> for UserInfo {
    fn from(principal: &UserPrincipal) -> Self {
        Self {
            email: principal.id().to_string(),
            id: principal.id().to_string(),
            groups: principal.groups().to_vec(),
        }
    }
}

/// Query parameters of `/oauth2/start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartParams {
    pub return_url: Option<String>,
}

/// Query parameters of the provider's redirect back to `/oauth2/callback`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Principal as returned by protected routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalResponse {
    pub id: String,
    pub groups: Vec<String>,
}

impl From<&UserPrincipal> for PrincipalResponse {
    fn from(principal: &UserPrincipal) -> Self {
        Self {
            id: principal.id().to_string(),
            groups: principal.groups().to_vec(),
        }
    }
}
