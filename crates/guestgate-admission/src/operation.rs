//! Operation routing table
//!
//! Classifies a request (method + path) into the [`OperationClass`] the
//! license gate authorizes.

use crate::license::OperationClass;
use serde::{Deserialize, Serialize};

/// One routing rule. First match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRule {
    /// HTTP method, or any method when absent
    #[serde(default)]
    pub method: Option<String>,
    pub path_prefix: String,
    pub class: OperationClass,
}

impl OperationRule {
    pub fn new(method: Option<&str>, path_prefix: &str, class: OperationClass) -> Self {
        Self {
            method: method.map(str::to_string),
            path_prefix: path_prefix.to_string(),
            class,
        }
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        let method_matches = self
            .method
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(method));
        method_matches && path_has_prefix(path, &self.path_prefix)
    }
}

/// `/api/v1/audit` matches `/api/v1/audit` and `/api/v1/audit/x` but not
/// `/api/v1/auditors`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
        None => false,
    }
}

/// Ordered routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationRules {
    rules: Vec<OperationRule>,
}

impl Default for OperationRules {
    fn default() -> Self {
        Self::new(vec![
            OperationRule::new(
                Some("POST"),
                "/api/v1/external-users",
                OperationClass::CreateExternalUser,
            ),
            OperationRule::new(
                Some("POST"),
                "/api/v1/invitations",
                OperationClass::CreateExternalUser,
            ),
            OperationRule::new(None, "/api/v1/policies", OperationClass::AdvancedFeature),
            OperationRule::new(None, "/api/v1/reports/custom", OperationClass::AdvancedFeature),
            OperationRule::new(Some("GET"), "/api/v1/audit", OperationClass::AuditHistory),
        ])
    }
}

impl OperationRules {
    pub fn new(rules: Vec<OperationRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[OperationRule] {
        &self.rules
    }

    /// Unmatched GET/HEAD requests are reads, everything else a write.
    pub fn classify(&self, method: &str, path: &str) -> OperationClass {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| rule.class)
            .unwrap_or_else(|| {
                if method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD") {
                    OperationClass::Read
                } else {
                    OperationClass::Write
                }
            })
    }
}

/// Value of `name` in a raw query string, if present.
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let rules = OperationRules::default();

        assert_eq!(
            rules.classify("POST", "/api/v1/external-users"),
            OperationClass::CreateExternalUser
        );
        assert_eq!(rules.classify("GET", "/api/v1/external-users"), OperationClass::Read);
        assert_eq!(rules.classify("PUT", "/api/v1/policies/42"), OperationClass::AdvancedFeature);
        assert_eq!(rules.classify("get", "/api/v1/audit"), OperationClass::AuditHistory);
        assert_eq!(rules.classify("DELETE", "/api/v1/folders/7"), OperationClass::Write);
        assert_eq!(rules.classify("HEAD", "/api/v1/folders"), OperationClass::Read);
    }

    #[test]
    fn test_prefix_respects_segments() {
        assert!(path_has_prefix("/api/v1/audit", "/api/v1/audit"));
        assert!(path_has_prefix("/api/v1/audit/events", "/api/v1/audit/"));
        assert!(!path_has_prefix("/api/v1/auditors", "/api/v1/audit"));
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("days=90&page=2"), "days"), Some("90"));
        assert_eq!(query_param(Some("page=2"), "days"), None);
        assert_eq!(query_param(Some("flag"), "flag"), Some(""));
        assert_eq!(query_param(None, "days"), None);
    }
}
