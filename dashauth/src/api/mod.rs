//! HTTP surface of the authentication server.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: request and response bodies
//!
//! The `/oauth2/*` routes manage the credentials stored in the session; `/v1/*` routes sit
//! behind [`crate::auth::middleware::authenticate`] and see the resolved principal.

pub mod handlers;
pub mod models;
