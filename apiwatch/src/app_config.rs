use std::collections::HashMap;

use serde::Deserialize;

/// Per-entity rule association: a rule id plus the values used to fill
/// that rule's response templates for this user or company.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct EntityRuleValues {
    #[serde(rename = "rules")]
    pub rule_id: String,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

/// Application-level sampling configuration, replaced wholesale on every
/// successful refresh.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub org_id: String,
    pub app_id: String,
    pub sample_rate: i32,
    // entity id to a sample rate in [0, 100]
    pub user_sample_rate: HashMap<String, i32>,
    pub company_sample_rate: HashMap<String, i32>,
    // entity id to its bound rules and template values
    pub user_rules: HashMap<String, Vec<EntityRuleValues>>,
    pub company_rules: HashMap<String, Vec<EntityRuleValues>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            org_id: String::new(),
            app_id: String::new(),
            // absent remote config, every event is reported
            sample_rate: 100,
            user_sample_rate: HashMap::new(),
            company_sample_rate: HashMap::new(),
            user_rules: HashMap::new(),
            company_rules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Resolve the sample rate for an event: per-user rate, then
    /// per-company rate, then the global rate.
    pub fn sampling_percentage(&self, user_id: Option<&str>, company_id: Option<&str>) -> i32 {
        if let Some(rate) = user_id.and_then(|id| self.user_sample_rate.get(id)) {
            return *rate;
        }
        if let Some(rate) = company_id.and_then(|id| self.company_sample_rate.get(id)) {
            return *rate;
        }
        self.sample_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingDecision {
    pub emit: bool,
    /// Approximate inverse of the sampling probability, so downstream
    /// aggregation can extrapolate true counts from sampled events.
    pub weight: i32,
}

/// Decide whether to emit an event given a resolved rate and a uniform
/// draw in `[0, 100)`.
pub fn decide(rate: i32, draw: i32) -> SamplingDecision {
    SamplingDecision {
        emit: rate > draw,
        weight: if rate == 0 { 1 } else { 100 / rate },
    }
}
