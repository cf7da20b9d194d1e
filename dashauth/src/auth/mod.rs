//! Authentication for the cluster dashboard.
//!
//! Three trust sources are reconciled into one principal-resolution policy:
//!
//! ## 1. OIDC
//!
//! Browser logins go through the authorization-code flow:
//! - `/oauth2/start` redirects to the provider with a random `state`
//! - `/oauth2/callback` checks that `state`, exchanges the code and stores the tokens
//! - provider id tokens are then accepted from the session or an `Authorization: Bearer` header
//! - `/oauth2/refresh` (and the middleware, transparently) renews expired tokens
//!
//! ## 2. Local user account
//!
//! A single account from the `cluster-user-auth` secret signs in via `/oauth2/sign_in` and gets
//! a locally-signed token stored in the session.
//!
//! ## 3. Anonymous
//!
//! Requests without credentials act as the configured `no_auth_user`.
//!
//! # Modules
//!
//! - [`claims`]: projection of provider claims into a principal
//! - [`current_principal`]: extractor for the resolved principal in handlers
//! - [`middleware`]: route protection middleware
//! - [`oidc`]: OIDC configuration, discovery and token verification
//! - [`password`]: Argon2 password verification
//! - [`principal`]: principal getters and the getter chain
//! - [`server`]: the authentication server and its operations
//! - [`session`]: server-side sessions and the session cookie
//! - [`token`]: locally-signed tokens
//! - [`utils`]: random token generation
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use dashauth::auth::current_principal::CurrentPrincipal;
//!
//! async fn protected_handler(CurrentPrincipal(principal): CurrentPrincipal) -> String {
//!     format!("Hello, {}!", principal.id())
//! }
//! ```

pub mod claims;
pub mod current_principal;
pub mod middleware;
pub mod oidc;
pub mod password;
pub mod principal;
pub mod server;
pub mod session;
pub mod token;
pub mod utils;
