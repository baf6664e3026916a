//! Bearer Token Verification
//!
//! Verifies identity-provider issued JWTs: algorithm allow-list, signature
//! via the [`KeyResolver`], expiry and not-before with clock skew, issuer and
//! audience. Claims are only trusted after the signature checks out.

use crate::keys::{KeyError, KeyResolver};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Longest clock-skew allowance the verifier will accept
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Token verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("token signature is invalid")]
    SignatureInvalid,

    #[error("token has expired")]
    Expired,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("token audience does not match")]
    AudienceMismatch,

    #[error("token issuer does not match")]
    IssuerMismatch,

    /// Signed with a key id the provider does not publish
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    /// Provider keys could not be fetched; not the caller's fault
    #[error("signing keys unavailable: {0}")]
    KeyUnavailable(String),
}

/// Identity extracted from a verified token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub subject_id: String,
    pub organization_id: String,
    pub email: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub roles: Vec<String>,
}

/// Which claims carry the identity fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimNames {
    /// First present claim wins
    pub subject: Vec<String>,
    pub organization: String,
    /// Email first, then principal-name claims
    pub email: Vec<String>,
    pub roles: String,
}

impl Default for ClaimNames {
    fn default() -> Self {
        Self {
            subject: vec!["oid".into(), "sub".into()],
            organization: "tid".into(),
            email: vec![
                "email".into(),
                "upn".into(),
                "preferred_username".into(),
                "unique_name".into(),
            ],
            roles: "roles".into(),
        }
    }
}

/// Bearer token verifier
pub struct TokenVerifier {
    keys: Arc<KeyResolver>,
    issuer: String,
    claims: ClaimNames,
    leeway_secs: u64,
}

impl TokenVerifier {
    /// `leeway_secs` is capped at [`MAX_CLOCK_SKEW_SECS`].
    pub fn new(keys: Arc<KeyResolver>, issuer: &str, claims: ClaimNames, leeway_secs: u64) -> Self {
        Self {
            keys,
            issuer: issuer.to_string(),
            claims,
            leeway_secs: leeway_secs.min(MAX_CLOCK_SKEW_SECS),
        }
    }

    /// Verify a raw `Authorization` header value.
    pub async fn verify(
        &self,
        authorization: Option<&str>,
        expected_audience: &str,
    ) -> Result<VerifiedIdentity, TokenError> {
        let token = bearer_token(authorization)?;

        let header = decode_header(token).map_err(|e| TokenError::MalformedToken(e.to_string()))?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::MalformedToken(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }
        let key_id = header
            .kid
            .ok_or_else(|| TokenError::MalformedToken("header has no kid".into()))?;

        let key = self.keys.get_signing_key(&key_id).await.map_err(|e| match e {
            KeyError::KeyNotFound(kid) => TokenError::UnknownSigningKey(kid),
            KeyError::KeyFetchFailed(detail) => TokenError::KeyUnavailable(detail),
        })?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_audience(&[expected_audience]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(|e| {
            debug!(key_id = %key_id, error = %e, "token rejected");
            classify(e.kind())
        })?;

        self.identity(&data.claims)
    }

    fn identity(&self, claims: &Map<String, Value>) -> Result<VerifiedIdentity, TokenError> {
        let subject_id = first_string(claims, &self.claims.subject)
            .ok_or_else(|| TokenError::MalformedToken("no subject claim".into()))?;
        let organization_id = string_claim(claims, &self.claims.organization)
            .ok_or_else(|| TokenError::MalformedToken("no organization claim".into()))?;
        let email = first_string(claims, &self.claims.email)
            .ok_or_else(|| TokenError::MalformedToken("no email or principal-name claim".into()))?;

        let expires_at = timestamp_claim(claims, "exp")
            .ok_or_else(|| TokenError::MalformedToken("invalid exp claim".into()))?;
        let issued_at = timestamp_claim(claims, "iat");

        let roles = match claims.get(&self.claims.roles) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(role)) => vec![role.clone()],
            _ => Vec::new(),
        };

        Ok(VerifiedIdentity {
            subject_id,
            organization_id,
            email,
            issued_at,
            expires_at,
            roles,
        })
    }
}

/// Extract the token from `Bearer <token>`; the scheme is case-insensitive.
fn bearer_token(authorization: Option<&str>) -> Result<&str, TokenError> {
    let value = authorization
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(TokenError::MissingToken)?;

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::MalformedToken("authorization scheme is not Bearer".into()));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::MissingToken);
    }
    Ok(token)
}

fn classify(kind: &ErrorKind) -> TokenError {
    match kind {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        ErrorKind::InvalidAudience => TokenError::AudienceMismatch,
        ErrorKind::InvalidIssuer => TokenError::IssuerMismatch,
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidKeyFormat
        | ErrorKind::InvalidRsaKey(_)
        | ErrorKind::InvalidEcdsaKey => TokenError::SignatureInvalid,
        ErrorKind::MissingRequiredClaim(claim) => {
            TokenError::MalformedToken(format!("missing required claim {claim}"))
        }
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => TokenError::MalformedToken("token could not be decoded".into()),
        _ => TokenError::SignatureInvalid,
    }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn first_string(claims: &Map<String, Value>, names: &[String]) -> Option<String> {
    names.iter().find_map(|name| string_claim(claims, name))
}

fn timestamp_claim(claims: &Map<String, Value>, name: &str) -> Option<DateTime<Utc>> {
    let seconds = claims.get(name)?.as_i64()?;
    Utc.timestamp_opt(seconds, 0).single()
}
