//! Rate limit rules and matching.
//!
//! Rules are stored in the relational store and may also be loaded from a
//! YAML file for development. Each rule is attached to one level of the
//! resolution hierarchy through its scope.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use super::counter::TimeWindow;
use crate::error::{LimiterError, Result};
use crate::store::TenantProfile;

/// Level of the hierarchy a rule is attached to.
///
/// Declared from least to most specific, so `Ord` follows resolution
/// precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    Plan,
    Industry,
    Org,
    User,
}

impl RuleScope {
    pub const ALL: [RuleScope; 5] = [
        RuleScope::Global,
        RuleScope::Plan,
        RuleScope::Industry,
        RuleScope::Org,
        RuleScope::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleScope::Global => "global",
            RuleScope::Plan => "plan",
            RuleScope::Industry => "industry",
            RuleScope::Org => "org",
            RuleScope::User => "user",
        }
    }

    pub fn parse(scope: &str) -> Option<Self> {
        match scope.to_ascii_lowercase().as_str() {
            "global" => Some(RuleScope::Global),
            "plan" => Some(RuleScope::Plan),
            "industry" => Some(RuleScope::Industry),
            "org" => Some(RuleScope::Org),
            "user" => Some(RuleScope::User),
            _ => None,
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub scope: RuleScope,
    /// User id, tenant id, SIC code or plan name; unset for global rules
    #[serde(default)]
    pub scope_value: Option<String>,
    /// `*`, a prefix ending in `*`, or an exact path
    #[serde(default = "default_endpoint_pattern")]
    pub endpoint_pattern: String,
    /// HTTP method; unset matches any
    #[serde(default)]
    pub method: Option<String>,
    pub requests_per_period: u64,
    pub period: TimeWindow,
    #[serde(default)]
    pub burst_allowance: Option<u64>,
    /// Higher wins among matches at the same scope
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_endpoint_pattern() -> String {
    "*".to_string()
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// Create an enabled rule covering every endpoint.
    pub fn new(scope: RuleScope, scope_value: Option<&str>, requests: u64, period: TimeWindow) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            scope_value: scope_value.map(str::to_string),
            endpoint_pattern: default_endpoint_pattern(),
            method: None,
            requests_per_period: requests,
            period,
            burst_allowance: None,
            priority: 0,
            enabled: true,
            name: None,
        }
    }

    pub fn with_endpoint(mut self, pattern: &str) -> Self {
        self.endpoint_pattern = pattern.to_string();
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst_allowance = Some(burst);
        self
    }

    /// Requests admitted per window including the burst allowance.
    pub fn effective_limit(&self) -> u64 {
        self.requests_per_period
            .saturating_add(self.burst_allowance.unwrap_or(0))
    }

    /// Whether the rule covers this endpoint and method.
    pub fn matches_endpoint(&self, endpoint: &str, method: &str) -> bool {
        let method_matches = self
            .method
            .as_deref()
            .map_or(true, |m| m == "*" || m.eq_ignore_ascii_case(method));
        if !method_matches {
            return false;
        }

        match self.endpoint_pattern.strip_suffix('*') {
            Some(prefix) => endpoint.starts_with(prefix),
            None => self.endpoint_pattern == endpoint,
        }
    }

    /// Whether the rule is attached to this user, tenant, SIC code or plan.
    ///
    /// Industry rules also match on a SIC prefix, so `"60"` covers every
    /// code in major group 60.
    pub fn applies_to(&self, value: &str) -> bool {
        match (&self.scope_value, self.scope) {
            (Some(v), RuleScope::Industry) => value.starts_with(v.as_str()),
            (Some(v), RuleScope::Plan) => v.eq_ignore_ascii_case(value),
            (Some(v), _) => v == value,
            (None, _) => false,
        }
    }

    /// Length of the literal part of the endpoint pattern.
    pub fn specificity(&self) -> usize {
        self.endpoint_pattern.trim_end_matches('*').len()
    }

    /// Check the rule for values that cannot be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_period == 0 {
            return Err(LimiterError::Validation(
                "requests_per_period must be greater than zero".into(),
            ));
        }
        let has_value = self
            .scope_value
            .as_deref()
            .map_or(false, |v| !v.trim().is_empty());
        match (self.scope, has_value) {
            (RuleScope::Global, true) => {
                return Err(LimiterError::Validation(
                    "global rules must not have a scope_value".into(),
                ))
            }
            (RuleScope::Global, false) | (_, true) => {}
            (scope, false) => {
                return Err(LimiterError::Validation(format!(
                    "{} rules require a scope_value",
                    scope
                )))
            }
        }
        let pattern = self.endpoint_pattern.as_str();
        if pattern.is_empty() || !(pattern.starts_with('/') || pattern == "*") {
            return Err(LimiterError::Validation(format!(
                "endpoint_pattern must be '*' or start with '/': {:?}",
                pattern
            )));
        }
        if pattern.strip_suffix('*').unwrap_or(pattern).contains('*') {
            return Err(LimiterError::Validation(
                "endpoint_pattern may only contain a trailing '*'".into(),
            ));
        }
        Ok(())
    }
}

/// Pick the winner among rules matching at one scope: highest priority,
/// then the most specific endpoint pattern.
pub fn pick_best<'a, I>(candidates: I) -> Option<&'a RateLimitRule>
where
    I: IntoIterator<Item = &'a RateLimitRule>,
{
    candidates
        .into_iter()
        .max_by_key(|rule| (rule.priority, rule.specificity()))
}

/// A set of rules, typically loaded from YAML, together with the plan and
/// SIC code of known tenants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub tenants: Vec<TenantProfile>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string. Every rule and tenant is validated.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        for rule in &set.rules {
            rule.validate()?;
        }
        for tenant in &set.tenants {
            tenant.validate()?;
        }
        Ok(set)
    }
}
