use std::collections::HashMap;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::rules::RuleTemplate;

/// The folded outcome of every rule that matched a request. Later
/// templates in the fold order win on each field they set, so the
/// highest-priority (user-specific) rule has the last word.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideDecision {
    pub block: bool,
    pub status: Option<StatusCode>,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl OverrideDecision {
    pub fn from_templates(templates: &[RuleTemplate<'_>]) -> OverrideDecision {
        let mut decision = OverrideDecision::default();
        for template in templates {
            let output = template.override_values();
            decision.block |= output.block;
            if let Some(status) = output.status {
                match StatusCode::from_u16(status) {
                    Ok(status) => decision.status = Some(status),
                    Err(_) => tracing::warn!(
                        rule_id = %template.rule.id,
                        "governance rule override carries invalid status {}",
                        status
                    ),
                }
            }
            decision.headers.extend(output.headers);
            if !output.body.is_empty() {
                decision.body = Some(output.body);
            }
        }
        decision
    }

    /// Set the accumulated header overrides on a live response. Invalid
    /// names or values are skipped, never fatal.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!("skipping invalid override header name {:?}", name);
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                tracing::warn!("skipping invalid override header value for {}", name);
                continue;
            };
            headers.insert(name, value);
        }
    }

    /// Response served instead of running the handler when a rule blocks.
    /// The body is whatever the fold accumulated, or empty.
    pub fn blocked_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone().unwrap_or_default()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        self.apply_headers(response.headers_mut());
        response
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;
    use serde_json::json;

    use super::OverrideDecision;
    use crate::rules::{GovernanceRule, RuleTemplate};

    fn rule(value: serde_json::Value) -> GovernanceRule {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn later_templates_win_field_by_field() {
        let first = rule(json!({
            "_id": "a",
            "type": "regex",
            "response": {"status": 404},
        }));
        let second = rule(json!({
            "_id": "b",
            "type": "user",
            "block": true,
            "response": {"status": 500},
        }));
        let templates = [
            RuleTemplate { rule: &first, values: None },
            RuleTemplate { rule: &second, values: None },
        ];

        let decision = OverrideDecision::from_templates(&templates);
        assert!(decision.block);
        assert_eq!(decision.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn headers_merge_and_bodies_overwrite() {
        let first = rule(json!({
            "_id": "a",
            "type": "regex",
            "response": {
                "headers": {"X-One": "1", "X-Shared": "first"},
                "body": "first body",
            },
        }));
        let second = rule(json!({
            "_id": "b",
            "type": "user",
            "response": {
                "headers": {"X-Two": "2", "X-Shared": "second"},
                "body": "second body",
            },
        }));
        let templates = [
            RuleTemplate { rule: &first, values: None },
            RuleTemplate { rule: &second, values: None },
        ];

        let decision = OverrideDecision::from_templates(&templates);
        assert!(!decision.block);
        assert_eq!(decision.headers.get("X-One").unwrap(), "1");
        assert_eq!(decision.headers.get("X-Two").unwrap(), "2");
        assert_eq!(decision.headers.get("X-Shared").unwrap(), "second");
        assert_eq!(decision.body, Some(Bytes::from("second body")));
    }

    #[test]
    fn empty_template_body_keeps_earlier_override() {
        let first = rule(json!({
            "_id": "a",
            "type": "regex",
            "response": {"body": "kept"},
        }));
        let second = rule(json!({"_id": "b", "type": "user", "block": true}));
        let templates = [
            RuleTemplate { rule: &first, values: None },
            RuleTemplate { rule: &second, values: None },
        ];

        let decision = OverrideDecision::from_templates(&templates);
        assert!(decision.block);
        assert_eq!(decision.body, Some(Bytes::from("kept")));
    }

    #[test]
    fn blocked_response_carries_status_headers_and_body() {
        let blocking = rule(json!({
            "_id": "a",
            "type": "regex",
            "block": true,
            "response": {
                "status": 403,
                "headers": {"X-Blocked-By": "policy"},
                "body": "blocked",
            },
        }));
        let templates = [RuleTemplate { rule: &blocking, values: None }];
        let decision = OverrideDecision::from_templates(&templates);

        let response = decision.blocked_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get("x-blocked-by").unwrap(), "policy");
    }

    #[test]
    fn no_templates_means_no_overrides() {
        let decision = OverrideDecision::from_templates(&[]);
        assert_eq!(decision, OverrideDecision::default());
    }
}
