//! Context echo endpoint

use crate::{models::*, ApiState};
use axum::{routing::get, Extension, Json, Router};
use guestgate_admission::RequestContext;
use std::sync::Arc;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/me", get(current_context))
}

/// Identity and tenancy the admission pipeline assigned to this request
#[utoipa::path(
    get,
    path = "/api/v1/me",
    responses(
        (status = 200, description = "Caller context", body = ContextResponse),
        (status = 400, description = "Organization not onboarded", body = ErrorEnvelope),
        (status = 401, description = "Missing or invalid token", body = ErrorEnvelope),
        (status = 429, description = "Tenant rate limit exceeded", body = ErrorEnvelope)
    ),
    tag = "context",
    security(("bearer" = []))
)]
pub async fn current_context(
    Extension(context): Extension<RequestContext>,
) -> Json<ApiResponse<ContextResponse>> {
    Json(ApiResponse::success(ContextResponse::from(&context)))
}
