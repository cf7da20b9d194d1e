use axum::{
    Json,
    body::Bytes,
    extract::{OriginalUri, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use tracing::warn;

use crate::{
    AppState,
    api::models::auth::{CallbackParams, LoginRequest, StartParams, UserInfo},
    auth::session::Session,
    errors::{Error, json_error},
};

/// Start an OIDC login, redirecting to the identity provider
#[tracing::instrument(skip_all)]
pub async fn start(
    State(state): State<AppState>,
    session: Session,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<StartParams>,
) -> Result<Redirect, Error> {
    let return_url = params.return_url.filter(|u| !u.is_empty()).unwrap_or_else(|| uri.to_string());

    let auth_code_url = state.auth.start_auth_flow(&session, return_url).await?;
    Ok(Redirect::to(auth_code_url.as_str()))
}

/// Redirect target of the identity provider
#[tracing::instrument(skip_all)]
pub async fn callback(
    State(state): State<AppState>,
    session: Session,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, Error> {
    let return_url = state.auth.callback(&session, &params).await?;

    if return_url.is_empty() {
        return Ok(Redirect::to("/"));
    }
    Ok(Redirect::to(&return_url))
}

/// Sign in with the local user account
#[tracing::instrument(skip_all)]
pub async fn sign_in(State(state): State<AppState>, session: Session, body: Bytes) -> Result<StatusCode, Error> {
    let request: LoginRequest = serde_json::from_slice(&body).map_err(|e| Error::BadRequest {
        message: format!("Failed to read request body: {e}"),
    })?;

    state.auth.sign_in(&session, request).await?;
    Ok(StatusCode::OK)
}

/// Identity of the signed-in user
#[tracing::instrument(skip_all)]
pub async fn user_info(State(state): State<AppState>, session: Session) -> Result<Json<UserInfo>, Error> {
    Ok(Json(state.auth.user_info(&session).await?))
}

/// Renew the session's OIDC tokens
#[tracing::instrument(skip_all)]
pub async fn refresh(State(state): State<AppState>, session: Session) -> Response {
    match state.auth.refresh(&session).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!("refreshing token failed: {e}");
            json_error(StatusCode::UNAUTHORIZED, "failed to refresh")
        }
    }
}

/// Sign out, dropping every token held in the session
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, session: Session) -> Result<StatusCode, Error> {
    state.auth.logout(&session).await?;
    Ok(StatusCode::OK)
}
