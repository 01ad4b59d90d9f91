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

//! Request pipeline combining the rate-limit and access stages
//!
//! Rate limiting runs first by default so that unauthorized floods are
//! absorbed by the cheaper stage before any grant lookups happen. The
//! first stage to deny short-circuits the pipeline.

use crate::ratelimit::decision::{RateLimitDecision, RateLimitHeaders, RouteLimit};
use crate::rbac::decision::{AccessDecision, Decision, Requirement};
use crate::rbac::roles::Principal;
use tracing::debug;

/// Everything the pipeline needs to know about one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Authenticated principal, if any
    pub principal: Option<Principal>,

    /// Client IP as reported by the edge
    pub client_ip: String,

    /// Request method
    pub method: String,

    /// Route template (not the concrete path, so ids do not explode the
    /// key space)
    pub route: String,

    /// Tenant that owns the target resource, when the route is
    /// tenant-scoped
    pub resource_tenant: Option<String>,
}

impl RequestContext {
    /// Build a context for an anonymous request
    pub fn anonymous(client_ip: impl Into<String>, method: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            principal: None,
            client_ip: client_ip.into(),
            method: method.into(),
            route: route.into(),
            resource_tenant: None,
        }
    }

    /// Attach the authenticated principal
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Attach the tenant owning the target resource
    pub fn with_resource_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.resource_tenant = Some(tenant.into());
        self
    }

    /// Route key combining method and template, e.g. `GET /reports`
    pub fn route_key(&self) -> String {
        format!("{} {}", self.method, self.route)
    }
}

/// Which stage runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageOrder {
    /// Rate limit, then access (default)
    #[default]
    RateThenAccess,

    /// Access, then rate limit. Denied requests are then not counted
    /// against the caller's budget.
    AccessThenRate,
}

/// Terminal pipeline outcome, ready to map onto an HTTP response
#[derive(Debug, Clone)]
pub struct PipelineDecision {
    /// Whether the request may proceed to the handler
    pub allowed: bool,

    /// HTTP status equivalent (200, 401, 403, 429, 503)
    pub status: u16,

    /// Message safe to return across the trust boundary
    pub message: &'static str,

    /// Seconds to wait before retrying, on rate denials
    pub retry_after_secs: Option<u64>,

    /// Rate headers when the rate stage counted the hit
    pub headers: Option<RateLimitHeaders>,
}

impl PipelineDecision {
    fn allow(headers: Option<RateLimitHeaders>) -> Self {
        Self {
            allowed: true,
            status: 200,
            message: "ok",
            retry_after_secs: None,
            headers,
        }
    }
}

/// Two-stage request guard
pub struct RequestPipeline {
    rate: RateLimitDecision,
    access: AccessDecision,
    order: StageOrder,
}

impl RequestPipeline {
    /// Create a pipeline with the default stage order
    pub fn new(rate: RateLimitDecision, access: AccessDecision) -> Self {
        Self {
            rate,
            access,
            order: StageOrder::default(),
        }
    }

    /// Override the stage order
    pub fn with_order(mut self, order: StageOrder) -> Self {
        self.order = order;
        self
    }

    /// Run both stages; the first denial wins
    pub async fn evaluate(&self, ctx: &RequestContext, requirement: &Requirement, limit: &RouteLimit) -> PipelineDecision {
        match self.order {
            StageOrder::RateThenAccess => {
                let rate = self.run_rate(ctx, limit).await;
                if !rate.allowed {
                    return rate;
                }
                let mut decision = self.run_access(ctx, requirement).await;
                // Keep the rate headers from the counted hit
                decision.headers = rate.headers;
                decision
            }
            StageOrder::AccessThenRate => {
                let access = self.run_access(ctx, requirement).await;
                if !access.allowed {
                    return access;
                }
                self.run_rate(ctx, limit).await
            }
        }
    }

    async fn run_rate(&self, ctx: &RequestContext, limit: &RouteLimit) -> PipelineDecision {
        let decision = self.rate.evaluate(ctx.principal.as_ref(), &ctx.client_ip, &ctx.route_key(), limit).await;

        if decision.allowed {
            PipelineDecision::allow(decision.headers)
        } else {
            debug!(route = %ctx.route_key(), "pipeline stopped at rate stage");
            PipelineDecision {
                allowed: false,
                status: decision.status,
                message: if decision.status == 429 {
                    "too many requests"
                } else {
                    "service temporarily unavailable"
                },
                retry_after_secs: decision.retry_after_secs,
                headers: decision.headers,
            }
        }
    }

    async fn run_access(&self, ctx: &RequestContext, requirement: &Requirement) -> PipelineDecision {
        let decision = self
            .access
            .evaluate(ctx.principal.as_ref(), requirement, ctx.resource_tenant.as_deref())
            .await;

        match decision {
            Decision::Allow => PipelineDecision::allow(None),
            Decision::Deny(reason) => {
                debug!(route = %ctx.route_key(), reason = %reason.as_str(), "pipeline stopped at access stage");
                PipelineDecision {
                    allowed: false,
                    status: reason.status_code(),
                    message: reason.public_message(),
                    retry_after_secs: None,
                    headers: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::ratelimit::backend::RateCounterBackend;
    use crate::ratelimit::memory::MemoryCounterBackend;
    use crate::ratelimit::tiered::TieredRateStore;
    use crate::rbac::catalog::PermissionCatalog;
    use crate::rbac::grants::MemoryGrantStore;
    use crate::rbac::resolver::PermissionResolver;
    use crate::rbac::roles::Role;
    use std::sync::Arc;

    fn pipeline() -> (RequestPipeline, Arc<PermissionResolver>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let resolver = Arc::new(PermissionResolver::new(
            Arc::new(PermissionCatalog::builtin()),
            Arc::new(MemoryGrantStore::new()),
            sink.clone(),
        ));

        let backend: Arc<dyn RateCounterBackend> = Arc::new(MemoryCounterBackend::new());
        let store = Arc::new(TieredRateStore::new(vec![backend]));

        let rate = RateLimitDecision::new(store, sink.clone());
        let access = AccessDecision::new(resolver.clone(), sink);
        (RequestPipeline::new(rate, access), resolver)
    }

    #[tokio::test]
    async fn test_allows_and_carries_rate_headers() {
        let (pipeline, _) = pipeline();
        let ctx = RequestContext::anonymous("10.0.0.1", "GET", "/reports").with_principal(Principal::new("u1", Role::User, "t1"));

        let decision = pipeline.evaluate(&ctx, &Requirement::authenticated(), &RouteLimit::per_minute(5)).await;
        assert!(decision.allowed);
        assert_eq!(decision.status, 200);
        assert_eq!(decision.headers.unwrap().remaining, 4);
    }

    #[tokio::test]
    async fn test_rate_denial_short_circuits_access() {
        let (pipeline, _) = pipeline();
        let ctx = RequestContext::anonymous("10.0.0.1", "POST", "/login");
        let limit = RouteLimit::pre_auth(1, 60_000);

        // First hit consumes the budget of one
        assert!(pipeline.evaluate(&ctx, &Requirement::authenticated(), &limit).await.status != 429);
        let decision = pipeline.evaluate(&ctx, &Requirement::authenticated(), &limit).await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 429);
        assert_eq!(decision.message, "too many requests");
        assert!(decision.retry_after_secs.is_some());
    }

    #[tokio::test]
    async fn test_access_denial_after_rate_allow() {
        let (pipeline, _) = pipeline();
        let ctx = RequestContext::anonymous("10.0.0.1", "GET", "/users").with_principal(Principal::new("u1", Role::User, "t1"));

        let decision = pipeline
            .evaluate(&ctx, &Requirement::permission("users.write"), &RouteLimit::per_minute(5))
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 403);
        assert_eq!(decision.message, "insufficient permission");
        // The hit was still counted, so the headers survive the denial
        assert!(decision.headers.is_some());
    }

    #[tokio::test]
    async fn test_unauthenticated_gets_401() {
        let (pipeline, _) = pipeline();
        let ctx = RequestContext::anonymous("10.0.0.1", "GET", "/reports");

        let decision = pipeline.evaluate(&ctx, &Requirement::authenticated(), &RouteLimit::per_minute(5)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 401);
        assert_eq!(decision.message, "authentication required");
    }

    #[tokio::test]
    async fn test_access_first_order_skips_counting_on_deny() {
        let (pipeline, _) = pipeline();
        let pipeline = pipeline.with_order(StageOrder::AccessThenRate);
        let ctx = RequestContext::anonymous("10.0.0.1", "GET", "/users").with_principal(Principal::new("u1", Role::User, "t1"));
        let limit = RouteLimit::per_minute(1);

        // Denied by access before the rate stage ever counts
        let denied = pipeline.evaluate(&ctx, &Requirement::permission("users.write"), &limit).await;
        assert_eq!(denied.status, 403);
        assert!(denied.headers.is_none());

        // The budget of 1 is still intact for an authorized requirement
        let allowed = pipeline.evaluate(&ctx, &Requirement::authenticated(), &limit).await;
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn test_tenant_scoped_route() {
        let (pipeline, _) = pipeline();
        let requirement = Requirement::authenticated().tenant_owned();
        let limit = RouteLimit::per_minute(5);

        let ctx = RequestContext::anonymous("10.0.0.1", "GET", "/tenants/reports")
            .with_principal(Principal::new("a1", Role::Admin, "tenant-a"))
            .with_resource_tenant("tenant-b");
        assert_eq!(pipeline.evaluate(&ctx, &requirement, &limit).await.status, 403);

        let ctx = ctx.with_resource_tenant("tenant-a");
        assert!(pipeline.evaluate(&ctx, &requirement, &limit).await.allowed);
    }
}
