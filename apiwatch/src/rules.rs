use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::app_config::EntityRuleValues;
use crate::extract::RequestInfo;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    User,
    Company,
    Regex,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppliedTo {
    #[default]
    Matching,
    NotMatching,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct RegexCondition {
    pub path: String,
    // a regular expression matched against the value at `path`
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RegexConditionGroup {
    pub conditions: Vec<RegexCondition>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ResponseOverrides {
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

/// Server-managed policy record controlling blocking and response
/// rewriting for matching traffic.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GovernanceRule {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub applied_to: AppliedTo,
    #[serde(default)]
    pub applied_to_unidentified: bool,
    // disjunction of conjunctions: the rule matches if any group's
    // conditions all match
    #[serde(default)]
    pub regex_config: Vec<RegexConditionGroup>,
    #[serde(default)]
    pub block: bool,
    #[serde(default)]
    pub response: ResponseOverrides,
}

/// Rule snapshot, rebuilt from scratch on every refresh by partitioning
/// the raw rule list on `type`.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    pub entity_rules: HashMap<String, GovernanceRule>,
    pub user_rules: Vec<GovernanceRule>,
    pub company_rules: Vec<GovernanceRule>,
    pub regex_rules: Vec<GovernanceRule>,
}

impl RuleStore {
    pub fn from_rules(rules: Vec<GovernanceRule>) -> RuleStore {
        let mut store = RuleStore::default();
        for rule in rules {
            match rule.rule_type {
                RuleType::User => {
                    store.entity_rules.insert(rule.id.clone(), rule.clone());
                    store.user_rules.push(rule);
                }
                RuleType::Company => {
                    store.entity_rules.insert(rule.id.clone(), rule.clone());
                    store.company_rules.push(rule);
                }
                RuleType::Regex => store.regex_rules.push(rule),
            }
        }
        store
    }
}

/// A rule paired with one entity's template values (none for global
/// regex rules and cohort-absence matches).
#[derive(Debug, Clone)]
pub struct RuleTemplate<'a> {
    pub rule: &'a GovernanceRule,
    pub values: Option<&'a HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplatedOverride {
    pub block: bool,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([\w.-]+)\s*\}\}").expect("placeholder pattern is valid"));

/// Substitute `{{key}}` placeholders from the values map; unknown keys
/// substitute to empty.
pub fn template(input: &str, values: Option<&HashMap<String, String>>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            values
                .and_then(|map| map.get(&caps[1]))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

impl RuleTemplate<'_> {
    /// Fill the rule's response templates with this entity's values.
    pub fn override_values(&self) -> TemplatedOverride {
        let headers = self
            .rule
            .response
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), template(value, self.values)))
            .collect();
        let body = match &self.rule.response.body {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        TemplatedOverride {
            block: self.rule.block,
            status: self.rule.response.status,
            headers,
            body: Bytes::from(template(&body, self.values)),
        }
    }
}

/// Collect templates for rules this entity is bound to, and the set of
/// rule ids whose cohort contains the entity. Only `matching` rules
/// produce a template here; the cohort set feeds the `not_matching` pass.
pub fn matching_templates<'a>(
    store: &'a RuleStore,
    bindings: &'a [EntityRuleValues],
) -> (HashSet<&'a str>, Vec<RuleTemplate<'a>>) {
    let mut cohorts = HashSet::new();
    let mut templates = Vec::new();
    for binding in bindings {
        cohorts.insert(binding.rule_id.as_str());
        if let Some(rule) = store.entity_rules.get(&binding.rule_id) {
            if rule.applied_to == AppliedTo::Matching {
                templates.push(RuleTemplate {
                    rule,
                    values: Some(&binding.values),
                });
            }
        }
    }
    (cohorts, templates)
}

/// Rules that apply because the entity is *not* in their cohort, or
/// because the entity is unidentified and the rule opts into that.
pub fn not_matching_templates<'a>(
    rules: &'a [GovernanceRule],
    entity_id: Option<&str>,
    cohorts: &HashSet<&str>,
) -> Vec<RuleTemplate<'a>> {
    rules
        .iter()
        .filter(|rule| {
            rule.applied_to == AppliedTo::NotMatching && !cohorts.contains(rule.id.as_str())
                || rule.applied_to_unidentified && entity_id.is_none()
        })
        .map(|rule| RuleTemplate { rule, values: None })
        .collect()
}

/// Assemble every candidate rule for this request and keep those whose
/// regex condition matches. Candidates are ordered lowest priority first
/// (global regex rules, then company-bound, then user-bound), so the
/// left-to-right override fold lets user-specific rules win field by
/// field.
pub fn applicable_templates<'a>(
    store: &'a RuleStore,
    request: &RequestInfo,
    user_bindings: &'a [EntityRuleValues],
    company_bindings: &'a [EntityRuleValues],
    user_id: Option<&str>,
    company_id: Option<&str>,
) -> Vec<RuleTemplate<'a>> {
    let mut candidates: Vec<RuleTemplate<'a>> = store
        .regex_rules
        .iter()
        .map(|rule| RuleTemplate { rule, values: None })
        .collect();

    let (cohorts, matching) = matching_templates(store, company_bindings);
    candidates.extend(not_matching_templates(&store.company_rules, company_id, &cohorts));
    candidates.extend(matching);

    let (cohorts, matching) = matching_templates(store, user_bindings);
    candidates.extend(not_matching_templates(&store.user_rules, user_id, &cohorts));
    candidates.extend(matching);

    candidates.retain(|template| check_regex(template.rule, request));
    candidates
}

/// A rule with no condition groups always matches (cohort membership
/// alone decides). Otherwise at least one group must match, and a group
/// matches only if every condition in it does.
pub fn check_regex(rule: &GovernanceRule, request: &RequestInfo) -> bool {
    if rule.regex_config.is_empty() {
        return true;
    }
    for group in &rule.regex_config {
        let mut all_match = true;
        for condition in &group.conditions {
            let value = request.path_lookup(&condition.path);
            let matched = match Regex::new(&condition.value) {
                Ok(re) => re.is_match(&value),
                Err(err) => {
                    // a broken pattern must never turn into an
                    // accidental block; treat it as a non-match
                    tracing::warn!(
                        rule_id = %rule.id,
                        rule_name = %rule.name,
                        path = %condition.path,
                        pattern = %condition.value,
                        "governance rule regex error: {}",
                        err
                    );
                    false
                }
            };
            all_match = all_match && matched;
        }
        if all_match {
            return true;
        }
    }
    false
}
