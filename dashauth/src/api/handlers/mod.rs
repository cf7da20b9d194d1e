//! HTTP request handlers.
//!
//! - [`auth`]: the OAuth2 flow, local sign-in, user info, refresh and logout
//! - [`whoami`]: protected routes that report the resolved principal

pub mod auth;
pub mod whoami;
