// Tenant Guard
// Copyright (C) 2025 Tenant Guard contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Rate-limit decision stage
//!
//! Maps a request to a counter key, scales the route limit by the
//! principal's role, counts the hit against the tiered store, and turns
//! the result into an allow/deny with standard rate headers.

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::error::GuardError;
use crate::ratelimit::tiered::{FailurePolicy, TieredRateStore};
use crate::rbac::roles::{Principal, Role};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// How a request is mapped to a counter key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// Client IP only: pre-auth routes (login, signup)
    Ip,

    /// Authenticated user id only
    User,

    /// User id when authenticated, client IP otherwise, both qualified
    /// by the route so busy routes do not starve quiet ones
    #[default]
    UserOrIpRoute,
}

/// Per-route limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLimit {
    /// Window length in milliseconds
    pub window_ms: u64,

    /// Hits allowed per window, before the role multiplier
    pub max_hits: u32,

    /// Key strategy for this route
    pub strategy: KeyStrategy,
}

impl RouteLimit {
    /// 100 hits per minute, keyed per user or IP and route
    pub fn per_minute(max_hits: u32) -> Self {
        Self {
            window_ms: 60_000,
            max_hits,
            strategy: KeyStrategy::UserOrIpRoute,
        }
    }

    /// Strict IP-keyed limit for unauthenticated routes
    pub fn pre_auth(max_hits: u32, window_ms: u64) -> Self {
        Self {
            window_ms,
            max_hits,
            strategy: KeyStrategy::Ip,
        }
    }

    /// Override the key strategy
    pub fn with_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl Default for RouteLimit {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

/// Role-based limit scaling. Privileged roles get more headroom on the
/// same route limit.
#[derive(Debug, Clone)]
pub struct RoleMultipliers {
    multipliers: HashMap<Role, u32>,
}

impl RoleMultipliers {
    /// Defaults with per-role overrides applied
    pub fn with_overrides(overrides: &HashMap<Role, u32>) -> Self {
        let mut multipliers = Self::default();
        for (role, value) in overrides {
            multipliers = multipliers.with_multiplier(*role, *value);
        }
        multipliers
    }

    /// Look up the multiplier for a role (1 when unset)
    pub fn for_role(&self, role: Role) -> u32 {
        self.multipliers.get(&role).copied().unwrap_or(1).max(1)
    }

    /// Override the multiplier for one role
    pub fn with_multiplier(mut self, role: Role, multiplier: u32) -> Self {
        self.multipliers.insert(role, multiplier.max(1));
        self
    }

    /// Scale a base limit for an (optionally absent) principal
    pub fn scale(&self, max_hits: u32, principal: Option<&Principal>) -> u32 {
        match principal {
            Some(p) => max_hits.saturating_mul(self.for_role(p.role)),
            None => max_hits,
        }
    }
}

impl Default for RoleMultipliers {
    fn default() -> Self {
        let mut multipliers = HashMap::new();
        multipliers.insert(Role::Guest, 1);
        multipliers.insert(Role::User, 1);
        multipliers.insert(Role::Coordinator, 2);
        multipliers.insert(Role::Manager, 2);
        multipliers.insert(Role::Admin, 5);
        multipliers.insert(Role::SuperAdmin, 10);
        Self { multipliers }
    }
}

/// Rate headers attached to every counted response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Effective limit after the role multiplier
    pub limit: u32,

    /// Hits left in the current window
    pub remaining: u32,

    /// Milliseconds until the window resets
    pub reset_ms: u64,

    /// Tier that served the count
    pub tier: &'static str,
}

impl RateLimitHeaders {
    /// Render as header name/value pairs. `Retry-After` is only present
    /// on denials.
    pub fn to_pairs(&self, denied: bool) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_ms.div_ceil(1_000).to_string()),
            ("X-RateLimit-Tier", self.tier.to_string()),
        ];
        if denied {
            pairs.push(("Retry-After", self.reset_ms.div_ceil(1_000).to_string()));
        }
        pairs
    }
}

/// Outcome of the rate-limit stage
#[derive(Debug, Clone)]
pub struct RateDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// HTTP status equivalent: 200 or 429
    pub status: u16,

    /// Seconds the client should wait before retrying (denials only)
    pub retry_after_secs: Option<u64>,

    /// Rate headers; absent when the stage failed open without counting
    pub headers: Option<RateLimitHeaders>,
}

impl RateDecision {
    fn allow(headers: Option<RateLimitHeaders>) -> Self {
        Self {
            allowed: true,
            status: 200,
            retry_after_secs: None,
            headers,
        }
    }

    fn deny(headers: RateLimitHeaders) -> Self {
        Self {
            allowed: false,
            status: 429,
            retry_after_secs: Some(headers.reset_ms.div_ceil(1_000)),
            headers: Some(headers),
        }
    }
}

/// Redact a client IP for logs and audit details: keep enough to spot a
/// misbehaving network, drop enough to not store the full address.
pub fn redact_ip(ip: &str) -> String {
    if ip.contains(':') {
        // IPv6: keep the first two groups
        let prefix: Vec<&str> = ip.split(':').take(2).collect();
        format!("{}::*", prefix.join(":"))
    } else {
        let octets: Vec<&str> = ip.split('.').collect();
        if octets.len() == 4 {
            format!("{}.{}.*.*", octets[0], octets[1])
        } else {
            "*".to_string()
        }
    }
}

/// Rate-limit stage over the tiered store
pub struct RateLimitDecision {
    store: Arc<TieredRateStore>,
    audit: Arc<dyn AuditSink>,
    multipliers: RoleMultipliers,
    policy: FailurePolicy,
}

impl RateLimitDecision {
    /// Create the stage with default multipliers and fail-open policy
    pub fn new(store: Arc<TieredRateStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            audit,
            multipliers: RoleMultipliers::default(),
            policy: FailurePolicy::FailOpen,
        }
    }

    /// Override the role multipliers
    pub fn with_multipliers(mut self, multipliers: RoleMultipliers) -> Self {
        self.multipliers = multipliers;
        self
    }

    /// Override the store-down policy
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Counter key for a request under the route's strategy. Key parts
    /// use raw values; redaction applies to logs, not to keys.
    pub fn key_for(&self, strategy: KeyStrategy, principal: Option<&Principal>, client_ip: &str, route: &str) -> String {
        match strategy {
            KeyStrategy::Ip => format!("ip:{client_ip}"),
            KeyStrategy::User => match principal {
                Some(p) => format!("user:{}", p.user_id),
                None => format!("ip:{client_ip}"),
            },
            KeyStrategy::UserOrIpRoute => match principal {
                Some(p) => format!("user:{}:{route}", p.user_id),
                None => format!("ip:{client_ip}:{route}"),
            },
        }
    }

    /// Count one hit and decide
    pub async fn evaluate(&self, principal: Option<&Principal>, client_ip: &str, route: &str, limit: &RouteLimit) -> RateDecision {
        let key = self.key_for(limit.strategy, principal, client_ip, route);
        let effective_max = self.multipliers.scale(limit.max_hits, principal);

        match self.store.increment(&key, limit.window_ms, effective_max).await {
            Ok((hit, tier)) => {
                let headers = RateLimitHeaders {
                    limit: effective_max,
                    remaining: hit.remaining_points,
                    reset_ms: hit.ms_before_next,
                    tier,
                };

                if hit.is_allowed(effective_max) {
                    RateDecision::allow(Some(headers))
                } else {
                    self.record_violation(principal, client_ip, route, &headers).await;
                    RateDecision::deny(headers)
                }
            }
            Err(err) => self.on_store_down(principal, client_ip, route, err),
        }
    }

    fn on_store_down(&self, principal: Option<&Principal>, client_ip: &str, route: &str, err: GuardError) -> RateDecision {
        let actor = principal.map(|p| p.user_id.as_str()).unwrap_or("anonymous");
        warn!(
            actor = %actor,
            client_ip = %redact_ip(client_ip),
            route = %route,
            error = %err,
            policy = ?self.policy,
            "rate-limit store unavailable"
        );
        counter!("tenant_guard_rate_store_down_total", 1);

        match self.policy {
            FailurePolicy::FailOpen => RateDecision::allow(None),
            FailurePolicy::FailClosed => RateDecision {
                allowed: false,
                status: 503,
                retry_after_secs: None,
                headers: None,
            },
        }
    }

    async fn record_violation(&self, principal: Option<&Principal>, client_ip: &str, route: &str, headers: &RateLimitHeaders) {
        counter!("tenant_guard_rate_limited_total", 1);

        let actor = principal.map(|p| p.user_id.clone()).unwrap_or_else(|| "anonymous".to_string());
        let event = AuditEvent::new(actor, "rate.deny", "route", AuditOutcome::Denied)
            .with_resource_id(route)
            .with_detail("client_ip", redact_ip(client_ip))
            .with_detail("limit", headers.limit.to_string())
            .with_detail("tier", headers.tier);

        if let Err(err) = self.audit.record(event).await {
            warn!(error = %err, "failed to record rate-limit audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::ratelimit::backend::RateCounterBackend;
    use crate::ratelimit::memory::MemoryCounterBackend;

    fn stage(policy: FailurePolicy) -> (Arc<MemoryAuditSink>, RateLimitDecision) {
        let backend: Arc<dyn RateCounterBackend> = Arc::new(MemoryCounterBackend::new());
        let store = Arc::new(TieredRateStore::new(vec![backend]));
        let audit = Arc::new(MemoryAuditSink::new());
        let decision = RateLimitDecision::new(store, audit.clone()).with_policy(policy);
        (audit, decision)
    }

    fn principal(role: Role) -> Principal {
        Principal::new("user-1", role, "tenant-a")
    }

    #[tokio::test]
    async fn test_allows_within_limit_with_headers() {
        let (_, stage) = stage(FailurePolicy::FailOpen);
        let limit = RouteLimit::per_minute(3);
        let p = principal(Role::User);

        let decision = stage.evaluate(Some(&p), "10.0.0.1", "GET /reports", &limit).await;
        assert!(decision.allowed);
        assert_eq!(decision.status, 200);

        let headers = decision.headers.unwrap();
        assert_eq!(headers.limit, 3);
        assert_eq!(headers.remaining, 2);
        assert_eq!(headers.tier, "memory");

        let pairs = headers.to_pairs(false);
        assert!(pairs.contains(&("X-RateLimit-Tier", "memory".to_string())));
        assert!(!pairs.iter().any(|(name, _)| *name == "Retry-After"));
    }

    #[tokio::test]
    async fn test_denies_over_limit_with_retry_after() {
        let (audit, stage) = stage(FailurePolicy::FailOpen);
        let limit = RouteLimit::per_minute(2);
        let p = principal(Role::User);

        stage.evaluate(Some(&p), "10.0.0.1", "GET /reports", &limit).await;
        stage.evaluate(Some(&p), "10.0.0.1", "GET /reports", &limit).await;
        let decision = stage.evaluate(Some(&p), "10.0.0.1", "GET /reports", &limit).await;

        assert!(!decision.allowed);
        assert_eq!(decision.status, 429);
        assert!(decision.retry_after_secs.is_some());

        let pairs = decision.headers.unwrap().to_pairs(true);
        assert!(pairs.iter().any(|(name, _)| *name == "Retry-After"));
        assert!(pairs.contains(&("X-RateLimit-Tier", "memory".to_string())));

        let denied = audit.events_with_outcome(AuditOutcome::Denied).await;
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].details.get("client_ip"), Some(&"10.0.*.*".to_string()));
    }

    #[tokio::test]
    async fn test_role_multiplier_raises_limit() {
        let (_, stage) = stage(FailurePolicy::FailOpen);
        let limit = RouteLimit::per_minute(2);
        let admin = principal(Role::Admin);

        // Admin multiplier is 5, so 2 becomes 10
        for _ in 0..10 {
            assert!(stage.evaluate(Some(&admin), "10.0.0.1", "GET /reports", &limit).await.allowed);
        }
        assert!(!stage.evaluate(Some(&admin), "10.0.0.1", "GET /reports", &limit).await.allowed);
    }

    #[tokio::test]
    async fn test_keys_are_isolated_per_user_and_route() {
        let (_, stage) = stage(FailurePolicy::FailOpen);
        let limit = RouteLimit::per_minute(1);
        let alice = Principal::new("alice", Role::User, "tenant-a");
        let bob = Principal::new("bob", Role::User, "tenant-a");

        assert!(stage.evaluate(Some(&alice), "10.0.0.1", "GET /reports", &limit).await.allowed);
        assert!(!stage.evaluate(Some(&alice), "10.0.0.1", "GET /reports", &limit).await.allowed);

        // Different user, same IP and route
        assert!(stage.evaluate(Some(&bob), "10.0.0.1", "GET /reports", &limit).await.allowed);
        // Same user, different route
        assert!(stage.evaluate(Some(&alice), "10.0.0.1", "GET /profile", &limit).await.allowed);
    }

    #[tokio::test]
    async fn test_ip_strategy_ignores_principal() {
        let (_, stage) = stage(FailurePolicy::FailOpen);
        let limit = RouteLimit::pre_auth(1, 60_000);
        let p = principal(Role::User);

        assert!(stage.evaluate(Some(&p), "10.0.0.1", "POST /login", &limit).await.allowed);
        // Same IP without a principal shares the counter
        assert!(!stage.evaluate(None, "10.0.0.1", "POST /login", &limit).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_down() {
        let backends: Vec<Arc<dyn RateCounterBackend>> = vec![Arc::new(AlwaysDown)];
        let store = Arc::new(TieredRateStore::new(backends));
        let stage = RateLimitDecision::new(store, Arc::new(MemoryAuditSink::new()));

        let decision = stage.evaluate(None, "10.0.0.1", "GET /reports", &RouteLimit::default()).await;
        assert!(decision.allowed);
        assert!(decision.headers.is_none());
    }

    #[tokio::test]
    async fn test_fail_closed_when_store_down() {
        let backends: Vec<Arc<dyn RateCounterBackend>> = vec![Arc::new(AlwaysDown)];
        let store = Arc::new(TieredRateStore::new(backends));
        let stage = RateLimitDecision::new(store, Arc::new(MemoryAuditSink::new())).with_policy(FailurePolicy::FailClosed);

        let decision = stage.evaluate(None, "10.0.0.1", "GET /reports", &RouteLimit::default()).await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 503);
    }

    #[test]
    fn test_redact_ip() {
        assert_eq!(redact_ip("203.0.113.9"), "203.0.*.*");
        assert_eq!(redact_ip("2001:db8::1"), "2001:db8::*");
        assert_eq!(redact_ip("garbage"), "*");
    }

    struct AlwaysDown;

    #[async_trait::async_trait]
    impl RateCounterBackend for AlwaysDown {
        fn tier(&self) -> &'static str {
            "down"
        }

        async fn increment(&self, _: &str, _: u64, _: u32) -> crate::error::GuardResult<crate::ratelimit::backend::RateHit> {
            Err(GuardError::StoreUnavailable { message: "down".to_string() })
        }

        async fn reset(&self, _: &str) -> crate::error::GuardResult<()> {
            Err(GuardError::StoreUnavailable { message: "down".to_string() })
        }

        async fn cleanup(&self, _: u64) -> crate::error::GuardResult<u64> {
            Err(GuardError::StoreUnavailable { message: "down".to_string() })
        }
    }
}
