//! Built-in limits used when no rule is configured for a tenant.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::counter::TimeWindow;
use super::rules::{RateLimitRule, RuleScope};

/// Subscription plan of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    #[default]
    Free,
    Basic,
    Professional,
    Enterprise,
}

impl SubscriptionPlan {
    /// Parse a plan name; unknown plans are treated as free.
    pub fn parse(plan: &str) -> Self {
        match plan.to_ascii_lowercase().as_str() {
            "basic" => SubscriptionPlan::Basic,
            "professional" | "pro" => SubscriptionPlan::Professional,
            "enterprise" => SubscriptionPlan::Enterprise,
            _ => SubscriptionPlan::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Free => "free",
            SubscriptionPlan::Basic => "basic",
            SubscriptionPlan::Professional => "professional",
            SubscriptionPlan::Enterprise => "enterprise",
        }
    }

    /// Requests per minute granted by the plan before industry adjustment.
    pub fn base_requests_per_minute(&self) -> u64 {
        match self {
            SubscriptionPlan::Free => 60,
            SubscriptionPlan::Basic => 300,
            SubscriptionPlan::Professional => 1000,
            SubscriptionPlan::Enterprise => 5000,
        }
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multiplier applied to plan limits by SIC major group (first two digits).
pub fn industry_multiplier(sic_code: Option<&str>) -> f64 {
    let major_group = match sic_code
        .and_then(|code| code.get(..2))
        .and_then(|group| group.parse::<u32>().ok())
    {
        Some(group) => group,
        None => return 1.0,
    };

    match major_group {
        // Business services, including software and data processing
        73 => 2.0,
        // Communications
        48 => 1.5,
        // Finance, insurance and real estate
        60..=67 => 1.5,
        // Health services
        80 => 1.25,
        // Public administration
        91..=99 => 0.75,
        _ => 1.0,
    }
}

/// Synthesize the fallback rule for a tenant without explicit rules.
pub fn default_rule(plan: SubscriptionPlan, sic_code: Option<&str>) -> RateLimitRule {
    let requests =
        ((plan.base_requests_per_minute() as f64) * industry_multiplier(sic_code)).floor() as u64;

    let mut rule = RateLimitRule::new(
        RuleScope::Plan,
        Some(plan.as_str()),
        requests.max(1),
        TimeWindow::Minute,
    )
    .with_priority(i32::MIN);
    rule.name = Some(format!("default:{}", plan));
    rule
}
