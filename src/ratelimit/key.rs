//! Counter key generation and tenant namespacing.

use sha2::{Digest, Sha256};
use std::fmt;

use super::rules::RuleScope;

/// Escape a key component so it cannot contain the `:` separator.
fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

/// Short stable hash of the endpoint a rule covers.
pub fn endpoint_hash(method: Option<&str>, endpoint_pattern: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.unwrap_or("*").to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(endpoint_pattern.as_bytes());
    hasher.finalize()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A key that uniquely identifies one sliding-window counter.
///
/// Rendered as `{prefix}:{scope}:{identifier}:{endpoint_hash}` where the
/// identifier is the tenant, or `tenant:user` for user-scoped rules. Every
/// identifier component is escaped, so two different tenants can never
/// produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub prefix: String,
    pub scope: RuleScope,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub endpoint_hash: String,
}

impl LimitKey {
    /// Build the counter key for a rule applied to a caller.
    ///
    /// Only user-scoped rules count per user; every other scope counts per
    /// tenant.
    pub fn new(
        prefix: &str,
        scope: RuleScope,
        tenant_id: &str,
        user_id: Option<&str>,
        endpoint_hash: String,
    ) -> Self {
        let user_id = match scope {
            RuleScope::User => user_id.map(str::to_string),
            _ => None,
        };
        Self {
            prefix: prefix.to_string(),
            scope,
            tenant_id: tenant_id.to_string(),
            user_id,
            endpoint_hash,
        }
    }

    pub fn identifier(&self) -> String {
        match &self.user_id {
            Some(user) => format!(
                "{}:{}",
                escape_component(&self.tenant_id),
                escape_component(user)
            ),
            None => escape_component(&self.tenant_id),
        }
    }

    pub fn to_redis_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.prefix,
            self.scope,
            self.identifier(),
            self.endpoint_hash
        )
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_redis_key())
    }
}

/// Key prefixes covering every counter of a tenant, one per scope.
pub fn tenant_prefixes(prefix: &str, tenant_id: &str) -> Vec<String> {
    let tenant = escape_component(tenant_id);
    RuleScope::ALL
        .iter()
        .map(|scope| format!("{}:{}:{}:", prefix, scope, tenant))
        .collect()
}

/// Key of the emergency bypass flag for a tenant.
pub fn bypass_key(prefix: &str, tenant_id: &str) -> String {
    format!("{}:bypass:{}", prefix, escape_component(tenant_id))
}
