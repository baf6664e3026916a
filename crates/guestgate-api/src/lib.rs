//! GuestGate API
//!
//! HTTP surface for the admission pipeline. Every route except health and
//! documentation sits behind the admission middleware; handlers read the
//! caller's identity only from the `RequestContext` extension.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           GUESTGATE API                                 │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                TraceLayer  |  CORS                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   ADMISSION MIDDLEWARE (token → tenant → license → rate limit)  │   │
//! │  │   X-Correlation-ID | X-RateLimit-* | denial envelope            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────────┐  │
//! │  │   /health    │  │ /docs (exempt)│  │ /api/v1/* (admitted only)   │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod directory;
pub mod middleware;
pub mod models;
pub mod routes;

use axum::{middleware::from_fn_with_state, routing::get, Router};
use guestgate_admission::AdmissionPipeline;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub use models::*;

/// API state
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<AdmissionPipeline>,
    /// API version
    pub version: String,
}

impl ApiState {
    pub fn new(pipeline: Arc<AdmissionPipeline>) -> Self {
        Self {
            pipeline,
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "GuestGate API",
        version = "1.0.0",
        description = "Multi-tenant guest collaboration API - request admission",
        license(name = "Apache-2.0")
    ),
    paths(routes::health::health_check, routes::me::current_context),
    components(schemas(
        ErrorResponse,
        ErrorEnvelope,
        ContextResponse,
        routes::health::HealthResponse
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "context", description = "Caller identity and tenancy")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Build the API router
pub fn build_router(state: ApiState) -> Router {
    build_router_with(state, Router::new())
}

/// Build the API router with extra business routes nested under `/api/v1`.
pub fn build_router_with(state: ApiState, api_routes: Router<Arc<ApiState>>) -> Router {
    let state = Arc::new(state);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health::health_check))
        .nest("/api/v1", routes::me::router().merge(api_routes))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::admission::admit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
