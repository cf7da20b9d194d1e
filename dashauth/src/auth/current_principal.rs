use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    auth::principal::UserPrincipal,
    errors::{Error, Result},
};

/// The principal resolved by [`authenticate`](super::middleware::authenticate).
///
/// Rejects with 401 on routes where the middleware did not run or found nobody.
#[derive(Debug, Clone)]
pub struct CurrentPrincipal(pub UserPrincipal);

impl<S: Send + Sync> FromRequestParts<S> for CurrentPrincipal {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<UserPrincipal>()
            .cloned()
            .map(CurrentPrincipal)
            .ok_or(Error::NoPrincipal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn test_extracts_principal_from_extensions() {
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert!(matches!(
            CurrentPrincipal::from_request_parts(&mut parts, &()).await,
            Err(Error::NoPrincipal)
        ));

        parts.extensions.insert(UserPrincipal::new("admin", Vec::new()));
        let CurrentPrincipal(principal) = CurrentPrincipal::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(principal.id(), "admin");
    }
}
