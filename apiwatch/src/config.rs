use std::sync::Arc;

use serde_json::Value;

use crate::extract::{RequestInfo, ResponseInfo};

/// Resolves an entity id (user, company) or session token from a
/// captured exchange. Returning `None` or an empty string means
/// "unidentified".
pub type IdentifyCallback =
    Arc<dyn Fn(&RequestInfo, &ResponseInfo) -> Option<String> + Send + Sync>;

pub type SkipCallback = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

pub type MetadataCallback = Arc<dyn Fn(&RequestInfo, &ResponseInfo) -> Value + Send + Sync>;

/// Middleware configuration. Every hook is an explicit optional field;
/// absence means the feature is off, there is no dynamic lookup.
#[derive(Clone)]
pub struct ObserverOptions {
    pub api_version: Option<String>,
    pub identify_user: Option<IdentifyCallback>,
    pub identify_company: Option<IdentifyCallback>,
    pub session_token: Option<IdentifyCallback>,
    /// Exchanges for which nothing is evaluated or reported.
    pub should_skip: Option<SkipCallback>,
    pub metadata: Option<MetadataCallback>,
    pub request_header_masks: Vec<String>,
    pub response_header_masks: Vec<String>,
    pub request_body_masks: Vec<String>,
    pub response_body_masks: Vec<String>,
    /// When off, reported events carry no request or response bodies.
    pub log_body: bool,
    pub disable_transaction_id: bool,
    pub debug: bool,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        ObserverOptions {
            api_version: None,
            identify_user: None,
            identify_company: None,
            session_token: None,
            should_skip: None,
            metadata: None,
            request_header_masks: Vec::new(),
            response_header_masks: Vec::new(),
            request_body_masks: Vec::new(),
            response_body_masks: Vec::new(),
            log_body: true,
            disable_transaction_id: false,
            debug: false,
        }
    }
}
