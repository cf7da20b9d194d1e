use axum::Json;

use crate::{api::models::auth::PrincipalResponse, auth::current_principal::CurrentPrincipal};

/// The principal the request was authenticated as
#[tracing::instrument(skip_all)]
pub async fn whoami(CurrentPrincipal(principal): CurrentPrincipal) -> Json<PrincipalResponse> {
    Json(PrincipalResponse::from(&principal))
}
