//! End-to-end admission over HTTP

use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    routing::post,
    Extension, Json, Router,
};
use axum_test::TestServer;
use guestgate_admission::testing::{TestHarness, TokenBuilder};
use guestgate_admission::{RequestContext, SubscriptionTier};
use guestgate_api::{build_router, build_router_with, ApiResponse, ApiState, ContextResponse};
use serde_json::Value;
use std::sync::Arc;

fn authorization(token: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    )
}

fn correlation(id: &'static str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static("x-correlation-id"), HeaderValue::from_static(id))
}

fn server(harness: &TestHarness) -> TestServer {
    TestServer::new(build_router(ApiState::new(Arc::clone(&harness.pipeline)))).unwrap()
}

async fn invite_external_user(
    Extension(context): Extension<RequestContext>,
) -> Json<ApiResponse<String>> {
    Json(ApiResponse::success(context.tenant_id.to_string()))
}

fn server_with_business_routes(harness: &TestHarness) -> TestServer {
    let routes = Router::new().route("/external-users", post(invite_external_user));
    let state = ApiState::new(Arc::clone(&harness.pipeline));
    TestServer::new(build_router_with(state, routes)).unwrap()
}

#[tokio::test]
async fn test_me_returns_context_and_headers() {
    let harness = TestHarness::new();
    let tenant = harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
    let token = TokenBuilder::new("org-contoso").email("ana@contoso.com").sign();
    let (auth_name, auth_value) = authorization(&token);
    let (corr_name, corr_value) = correlation("corr-me-1");

    let response = server(&harness)
        .get("/api/v1/me")
        .add_header(auth_name, auth_value)
        .add_header(corr_name, corr_value)
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "corr-me-1");
    assert_eq!(response.headers()["x-ratelimit-limit"], "200");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "199");

    let body: ApiResponse<ContextResponse> = response.json();
    let context = body.data.unwrap();
    assert_eq!(context.tenant_id, tenant.tenant_id);
    assert_eq!(context.user_email, "ana@contoso.com");
    assert_eq!(context.subscription_tier, "Pro");
    assert_eq!(context.correlation_id, "corr-me-1");
}

#[tokio::test]
async fn test_missing_token_is_generic_401() {
    let harness = TestHarness::new();

    let response = server(&harness).get("/api/v1/me").await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(body["error"]["message"], "Authentication required");

    let generated = response.headers()["x-correlation-id"].to_str().unwrap().to_string();
    assert_eq!(body["error"]["correlationId"], generated.as_str());
}

#[tokio::test]
async fn test_expired_and_tampered_tokens_look_identical() {
    let harness = TestHarness::new();
    harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
    let server = server(&harness);

    let expired = TokenBuilder::new("org-contoso")
        .expires_in(chrono::Duration::hours(-1))
        .sign();
    let mut tampered = TokenBuilder::new("org-contoso").sign();
    tampered.push('x');

    let mut bodies = Vec::new();
    for token in [expired, tampered] {
        let (name, value) = authorization(&token);
        let response = server.get("/api/v1/me").add_header(name, value).await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        bodies.push((body["error"]["code"].clone(), body["error"]["message"].clone()));
    }
    assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn test_unknown_organization_is_400_with_correlation_id() {
    let harness = TestHarness::new();
    let token = TokenBuilder::new("org-new-customer").sign();
    let (auth_name, auth_value) = authorization(&token);
    let (corr_name, corr_value) = correlation("corr-onboard-42");

    let response = server(&harness)
        .get("/api/v1/me")
        .add_header(auth_name, auth_value)
        .add_header(corr_name, corr_value)
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "TENANT_NOT_ONBOARDED");
    assert_eq!(body["error"]["correlationId"], "corr-onboard-42");

    harness.pipeline.audit().flush().await;
    let records = harness.audit.for_correlation("corr-onboard-42");
    assert!(records.iter().any(|r| r.outcome == "TENANT_NOT_ONBOARDED"));
}

#[tokio::test]
async fn test_pro_quota_over_http() {
    let harness = TestHarness::new();
    let tenant = harness.onboard("org-contoso", "Contoso", SubscriptionTier::Pro);
    harness.directory.set_external_user_count(tenant.tenant_id, 99);
    let server = server_with_business_routes(&harness);
    let token = TokenBuilder::new("org-contoso").sign();

    let (name, value) = authorization(&token);
    let hundredth = server.post("/api/v1/external-users").add_header(name, value).await;
    assert_eq!(hundredth.status_code(), StatusCode::OK);
    harness.directory.add_external_user(tenant.tenant_id);

    let (name, value) = authorization(&token);
    let hundred_first = server.post("/api/v1/external-users").add_header(name, value).await;
    assert_eq!(hundred_first.status_code(), StatusCode::FORBIDDEN);
    let body: Value = hundred_first.json();
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
}

#[tokio::test]
async fn test_rate_limited_response_carries_retry_after() {
    let mut config = TestHarness::config();
    config.tiers.free.requests_per_minute = 1;
    let harness = TestHarness::with_config(config);
    harness.onboard("org-fabrikam", "Fabrikam", SubscriptionTier::Free);
    let server = server(&harness);
    let token = TokenBuilder::new("org-fabrikam").sign();

    let (name, value) = authorization(&token);
    let first = server.get("/api/v1/me").add_header(name, value).await;
    assert_eq!(first.status_code(), StatusCode::OK);

    let (name, value) = authorization(&token);
    let limited = server.get("/api/v1/me").add_header(name, value).await;

    assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let headers = limited.headers();
    assert_eq!(headers["x-ratelimit-limit"], "1");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert!(headers.contains_key("x-ratelimit-reset"));
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn test_health_and_docs_are_exempt() {
    let harness = TestHarness::new();
    let server = server(&harness);

    let health = server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    assert!(health.headers().contains_key("x-correlation-id"));
    assert!(!health.headers().contains_key("x-ratelimit-limit"));

    let openapi = server.get("/api-docs/openapi.json").await;
    assert_eq!(openapi.status_code(), StatusCode::OK);
    let document: Value = openapi.json();
    assert!(document["paths"]["/api/v1/me"].is_object());

    harness.pipeline.audit().flush().await;
    assert!(harness.audit.records().is_empty());
}
