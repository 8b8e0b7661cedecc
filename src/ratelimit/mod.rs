//! Rate limiting logic and state management.

mod backend;
mod bypass;
mod clock;
mod counter;
mod defaults;
mod key;
mod limiter;
mod memory;
mod metrics;
mod redis_store;
mod resolver;
mod rules;

pub use backend::{WindowOutcome, WindowStore};
pub use bypass::{BypassManager, BypassStatus, MAX_BYPASS_DURATION, MIN_BYPASS_DURATION};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{SlidingWindowCounter, TimeWindow};
pub use defaults::{default_rule, industry_multiplier, SubscriptionPlan};
pub use key::{bypass_key, endpoint_hash, tenant_prefixes, LimitKey};
pub use limiter::{CheckRequest, RateLimitResult, RateLimiterService};
pub use memory::MemoryWindowStore;
pub use metrics::{spawn_flusher, Decision, MetricsRecorder};
pub use redis_store::RedisWindowStore;
pub use resolver::{select_rule, RuleResolver, DEFAULT_CACHE_CAPACITY};
pub use rules::{pick_best, RateLimitRule, RuleScope, RuleSet};

#[cfg(test)]
pub(crate) use backend::testing::{SlowStore, UnavailableStore};
