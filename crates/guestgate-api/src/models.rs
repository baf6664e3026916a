//! API Models

use guestgate_admission::RequestContext;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Standard API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: &str, correlation_id: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
                correlation_id: correlation_id.to_string(),
            }),
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. `QUOTA_EXCEEDED`
    pub code: String,
    pub message: String,
    pub correlation_id: String,
}

/// Denial envelope, as documented
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorResponse,
}

/// Identity and tenancy of the caller
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub tenant_id: Uuid,
    pub user_id: String,
    pub user_email: String,
    pub subscription_tier: String,
    pub correlation_id: String,
    pub rate_limit_remaining: u32,
    pub roles: Vec<String>,
}

impl From<&RequestContext> for ContextResponse {
    fn from(context: &RequestContext) -> Self {
        Self {
            tenant_id: context.tenant_id,
            user_id: context.user_id.clone(),
            user_email: context.user_email.clone(),
            subscription_tier: context.subscription_tier.to_string(),
            correlation_id: context.correlation_id.clone(),
            rate_limit_remaining: context.rate_limit_remaining,
            roles: context.roles.clone(),
        }
    }
}
