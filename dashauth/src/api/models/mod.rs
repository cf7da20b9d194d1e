//! API request and response data models.
//!
//! - [`auth`]: login payloads, OAuth2 callback parameters and user info responses

pub mod auth;
