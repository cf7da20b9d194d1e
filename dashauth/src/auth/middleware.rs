use axum::{
    extract::{Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::{debug, trace};

use crate::{
    AppState,
    auth::{
        principal::UserPrincipal,
        session::{REFRESH_TOKEN_COOKIE_NAME, Session},
    },
    errors::{Error, Result},
};

/// Resolve the caller for a protected request.
///
/// Runs the getter chain. If that fails and the session holds a refresh token, one refresh is
/// attempted so an expired provider token does not force a new login. Requests without any
/// credential fall back to the anonymous user when that mode is enabled.
pub(crate) async fn resolve_principal(state: &AppState, parts: &Parts) -> Result<UserPrincipal> {
    let error = match state.principals.principal(parts).await {
        Ok(principal) => return Ok(principal),
        Err(e) => e,
    };

    let session = parts.extensions.get::<Session>().filter(|_| state.auth.enabled_methods().oidc);
    if let Some(session) = session {
        if session.get(REFRESH_TOKEN_COOKIE_NAME).await?.is_some() {
            match state.auth.refresh(session).await {
                Ok(principal) => {
                    debug!("resolved principal after refreshing the session tokens");
                    return Ok(principal);
                }
                Err(e) => debug!("refreshing session tokens failed: {e}"),
            }
        }
    }

    match error {
        Error::NoPrincipal => state.auth.anonymous_user().ok_or(Error::NoPrincipal),
        other => Err(other),
    }
}

/// Middleware for routes that require a principal.
///
/// The principal is placed in request extensions for the
/// [`CurrentPrincipal`](super::current_principal::CurrentPrincipal) extractor. Its raw token is
/// dropped unless OIDC pass-through is enabled.
pub async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Result<Response> {
    let (mut parts, body) = request.into_parts();

    let principal = resolve_principal(&state, &parts).await.map_err(|e| {
        debug!("request rejected: {e}");
        match e {
            Error::Claims { .. } | Error::Unauthenticated { .. } | Error::UnauthorizedToken | Error::NoPrincipal => e,
            // Whatever went wrong, the caller is not authenticated
            other => Error::Unauthenticated {
                message: Some(other.user_message()),
            },
        }
    })?;

    let principal = if state.auth.passthrough_enabled() {
        principal
    } else {
        principal.without_token()
    };
    trace!(%principal, "authenticated request");

    parts.extensions.insert(principal);
    Ok(next.run(Request::from_parts(parts, body)).await)
}
