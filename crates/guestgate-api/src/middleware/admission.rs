//! Admission middleware
//!
//! Runs every request through the [`AdmissionPipeline`], attaches the
//! [`RequestContext`](guestgate_admission::RequestContext) as a request
//! extension on success and renders the denial envelope otherwise.

use crate::models::ApiResponse;
use crate::ApiState;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use guestgate_admission::context::resolve_correlation_id;
use guestgate_admission::{
    Admission, AdmissionError, AdmissionRequest, CancellationFlag, RateLimitDecision,
};
use std::sync::Arc;
use tracing::error;

/// Correlation id header, read inbound and echoed on every response
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Cancels the admission task if the client goes away mid-pipeline.
struct CancelOnDrop {
    flag: CancellationFlag,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

/// Admission middleware
pub async fn admit(
    State(state): State<Arc<ApiState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let correlation_id =
        resolve_correlation_id(header_str(request.headers(), CORRELATION_ID_HEADER).as_deref());
    let cancellation = CancellationFlag::new();
    let admission_request = AdmissionRequest {
        method: request.method().as_str().to_string(),
        path: request.uri().path().to_string(),
        query: request.uri().query().map(str::to_string),
        authorization: header_str(request.headers(), AUTHORIZATION.as_str()),
        correlation_id: Some(correlation_id.clone()),
        cancellation: cancellation.clone(),
    };

    let mut guard = CancelOnDrop {
        flag: cancellation,
        armed: true,
    };
    let pipeline = Arc::clone(&state.pipeline);
    let admission = match tokio::spawn(async move { pipeline.admit(admission_request).await }).await
    {
        Ok(admission) => admission,
        Err(e) => {
            error!(%correlation_id, error = %e, "admission task failed");
            return internal_error(&correlation_id);
        }
    };
    guard.armed = false;

    match admission {
        Admission::Exempt { correlation_id } => {
            let mut response = next.run(request).await;
            set_correlation_id(response.headers_mut(), &correlation_id);
            response
        }
        Admission::Admitted { context, rate_limit } => {
            let correlation_id = context.correlation_id.clone();
            request.extensions_mut().insert(context);

            let mut response = next.run(request).await;
            set_rate_limit_headers(response.headers_mut(), &rate_limit);
            set_correlation_id(response.headers_mut(), &correlation_id);
            response
        }
        Admission::Rejected { error, correlation_id } => rejection(&error, &correlation_id),
    }
}

/// Render a rejection as the JSON denial envelope.
pub fn rejection(error: &AdmissionError, correlation_id: &str) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ApiResponse::<()>::error(error.code(), &error.public_message(), correlation_id);

    let mut response = (status, Json(body)).into_response();
    if let AdmissionError::RateLimited(decision) = error {
        set_rate_limit_headers(response.headers_mut(), decision);
    }
    set_correlation_id(response.headers_mut(), correlation_id);
    response
}

fn internal_error(correlation_id: &str) -> Response {
    let body = ApiResponse::<()>::error("INTERNAL_ERROR", "Internal error", correlation_id);
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    set_correlation_id(response.headers_mut(), correlation_id);
    response
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn set_correlation_id(headers: &mut HeaderMap, correlation_id: &str) {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name), HeaderValue::from_str(&value))
        {
            headers.insert(name, value);
        }
    }
}
