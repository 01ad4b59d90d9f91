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

//! Access decision stage
//!
//! Evaluates a requirement expression against a resolved principal and the
//! tenant-ownership rule. Resolver failures deny: access control fails
//! closed, in deliberate contrast to the rate limiter's fail-open default.

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::error::GuardError;
use crate::rbac::resolver::PermissionResolver;
use crate::rbac::roles::{Principal, Role};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Permission expression within a requirement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PermissionExpr {
    /// A single required code
    Code(String),
    /// Every code required
    AllOf(Vec<String>),
    /// At least one code required
    AnyOf(Vec<String>),
}

/// What a route requires of the principal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirement {
    /// Permission expression, if any
    pub permissions: Option<PermissionExpr>,

    /// Minimum role level, if any
    pub min_role: Option<Role>,

    /// Whether the principal's tenant must own the target resource
    pub tenant_owned: bool,
}

impl Requirement {
    /// Requirement with no constraints (authentication only)
    pub fn authenticated() -> Self {
        Self::default()
    }

    /// Require a single permission code
    pub fn permission(code: impl Into<String>) -> Self {
        Self {
            permissions: Some(PermissionExpr::Code(code.into())),
            ..Self::default()
        }
    }

    /// Require every listed code
    pub fn all_of<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: Some(PermissionExpr::AllOf(codes.into_iter().map(Into::into).collect())),
            ..Self::default()
        }
    }

    /// Require at least one listed code
    pub fn any_of<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: Some(PermissionExpr::AnyOf(codes.into_iter().map(Into::into).collect())),
            ..Self::default()
        }
    }

    /// Add a minimum role level
    pub fn min_role(mut self, role: Role) -> Self {
        self.min_role = Some(role);
        self
    }

    /// Require tenant ownership of the target resource
    pub fn tenant_owned(mut self) -> Self {
        self.tenant_owned = true;
        self
    }
}

/// Why a request was denied. Full detail stays internal; the caller-facing
/// message comes from `public_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Unauthenticated,
    TenantMismatch,
    InsufficientRole { required: Role, actual: Role },
    InsufficientPermission,
    StoreUnavailable,
}

impl DenyReason {
    /// Stable identifier for logs and audit details
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::TenantMismatch => "tenant_mismatch",
            DenyReason::InsufficientRole { .. } => "insufficient_role",
            DenyReason::InsufficientPermission => "insufficient_permission",
            DenyReason::StoreUnavailable => "store_unavailable",
        }
    }

    /// HTTP status equivalent
    pub fn status_code(&self) -> u16 {
        match self {
            DenyReason::Unauthenticated => 401,
            DenyReason::StoreUnavailable => 503,
            _ => 403,
        }
    }

    /// Generic message for the trust boundary
    pub fn public_message(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "authentication required",
            DenyReason::StoreUnavailable => "service temporarily unavailable",
            _ => "insufficient permission",
        }
    }
}

/// Terminal result of the access stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Stateless access decision stage
#[derive(Clone)]
pub struct AccessDecision {
    resolver: Arc<PermissionResolver>,
    audit: Arc<dyn AuditSink>,
}

impl AccessDecision {
    /// Create the stage over a resolver and audit sink
    pub fn new(resolver: Arc<PermissionResolver>, audit: Arc<dyn AuditSink>) -> Self {
        Self { resolver, audit }
    }

    /// Evaluate a requirement for a principal against an optionally
    /// tenant-owned resource. Checks run in a fixed order: authentication,
    /// tenant ownership, role level, then the permission expression.
    pub async fn evaluate(&self, principal: Option<&Principal>, requirement: &Requirement, resource_tenant: Option<&str>) -> Decision {
        let Some(principal) = principal else {
            return self.deny(None, requirement, DenyReason::Unauthenticated).await;
        };

        if requirement.tenant_owned && principal.role != Role::SuperAdmin {
            let owned = resource_tenant.map(|tenant| principal.owns_tenant(tenant)).unwrap_or(false);
            if !owned {
                return self.deny(Some(principal), requirement, DenyReason::TenantMismatch).await;
            }
        }

        if let Some(required) = requirement.min_role {
            if !principal.role.satisfies(required) {
                let reason = DenyReason::InsufficientRole {
                    required,
                    actual: principal.role,
                };
                return self.deny(Some(principal), requirement, reason).await;
            }
        }

        if let Some(expr) = &requirement.permissions {
            let held = match expr {
                PermissionExpr::Code(code) => self.resolver.has_permission(principal, code).await,
                PermissionExpr::AllOf(codes) => self.resolver.has_all(principal, codes).await,
                PermissionExpr::AnyOf(codes) => self.resolver.has_any(principal, codes).await,
            };

            match held {
                Ok(true) => {}
                Ok(false) => return self.deny(Some(principal), requirement, DenyReason::InsufficientPermission).await,
                Err(GuardError::StoreUnavailable { message }) => {
                    warn!(user_id = %principal.user_id, error = %message, "grant store unreachable, denying");
                    return self.deny(Some(principal), requirement, DenyReason::StoreUnavailable).await;
                }
                Err(err) => {
                    warn!(user_id = %principal.user_id, error = %err, "permission resolution failed, denying");
                    return self.deny(Some(principal), requirement, DenyReason::StoreUnavailable).await;
                }
            }
        }

        debug!(user_id = %principal.user_id, "access allowed");
        counter!("tenant_guard_access_allowed_total", 1);
        Decision::Allow
    }

    async fn deny(&self, principal: Option<&Principal>, requirement: &Requirement, reason: DenyReason) -> Decision {
        let actor = principal.map(|p| p.user_id.clone()).unwrap_or_else(|| "anonymous".to_string());

        warn!(
            actor = %actor,
            reason = %reason.as_str(),
            requirement = ?requirement,
            "access denied"
        );
        counter!("tenant_guard_access_denied_total", 1);

        let mut event = AuditEvent::new(actor, "access.check", "route", AuditOutcome::Denied).with_detail("reason", reason.as_str());
        if let Some(principal) = principal {
            event = event.with_detail("actual_role", principal.role.as_str());
        }
        if let DenyReason::InsufficientRole { required, .. } = &reason {
            event = event.with_detail("required_role", required.as_str());
        }
        if let Some(expr) = &requirement.permissions {
            event = event.with_detail("required_permissions", format!("{expr:?}"));
        }

        if let Err(err) = self.audit.record(event).await {
            warn!(error = %err, "audit sink rejected deny event");
        }

        Decision::Deny(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::rbac::catalog::PermissionCatalog;
    use crate::rbac::grants::{MemoryGrantStore, UnavailableGrantStore};

    fn stage() -> (AccessDecision, Arc<PermissionResolver>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let resolver = Arc::new(PermissionResolver::new(
            Arc::new(PermissionCatalog::builtin()),
            Arc::new(MemoryGrantStore::new()),
            sink.clone(),
        ));
        (AccessDecision::new(resolver.clone(), sink.clone()), resolver, sink)
    }

    #[tokio::test]
    async fn test_unauthenticated_denied() {
        let (stage, _, _) = stage();

        let decision = stage.evaluate(None, &Requirement::authenticated(), None).await;
        assert_eq!(decision, Decision::Deny(DenyReason::Unauthenticated));
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let (stage, _, _) = stage();
        let requirement = Requirement::authenticated().tenant_owned();

        // Admin of tenant A cannot touch tenant B's resource
        let admin = Principal::new("a1", Role::Admin, "tenant-a");
        let decision = stage.evaluate(Some(&admin), &requirement, Some("tenant-b")).await;
        assert_eq!(decision, Decision::Deny(DenyReason::TenantMismatch));

        // Same tenant is fine
        let decision = stage.evaluate(Some(&admin), &requirement, Some("tenant-a")).await;
        assert_eq!(decision, Decision::Allow);

        // Tenantless super admin bypasses ownership entirely
        let root = Principal::global("root", Role::SuperAdmin);
        let decision = stage.evaluate(Some(&root), &requirement, Some("tenant-b")).await;
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_min_role() {
        let (stage, _, _) = stage();
        let requirement = Requirement::authenticated().min_role(Role::Manager);

        let coordinator = Principal::new("c1", Role::Coordinator, "t1");
        let decision = stage.evaluate(Some(&coordinator), &requirement, None).await;
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::InsufficientRole {
                required: Role::Manager,
                actual: Role::Coordinator,
            })
        );

        let manager = Principal::new("m1", Role::Manager, "t1");
        assert_eq!(stage.evaluate(Some(&manager), &requirement, None).await, Decision::Allow);
    }

    #[tokio::test]
    async fn test_permission_expressions() {
        let (stage, resolver, _) = stage();
        let user = Principal::new("u1", Role::User, "t1");

        let single = Requirement::permission("reports.read");
        assert_eq!(stage.evaluate(Some(&user), &single, None).await, Decision::Deny(DenyReason::InsufficientPermission));

        resolver.grant("u1", "reports.read", "root").await.unwrap();
        assert_eq!(stage.evaluate(Some(&user), &single, None).await, Decision::Allow);

        let all = Requirement::all_of(["reports.read", "reports.write"]);
        assert_eq!(stage.evaluate(Some(&user), &all, None).await, Decision::Deny(DenyReason::InsufficientPermission));

        let any = Requirement::any_of(["reports.read", "reports.write"]);
        assert_eq!(stage.evaluate(Some(&user), &any, None).await, Decision::Allow);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let sink = Arc::new(MemoryAuditSink::new());
        let resolver = Arc::new(PermissionResolver::new(
            Arc::new(PermissionCatalog::builtin()),
            Arc::new(UnavailableGrantStore),
            sink.clone(),
        ));
        let stage = AccessDecision::new(resolver, sink);

        let user = Principal::new("u1", Role::User, "t1");
        let decision = stage.evaluate(Some(&user), &Requirement::permission("reports.read"), None).await;
        assert_eq!(decision, Decision::Deny(DenyReason::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_denies_are_audited_with_reason() {
        let (stage, _, sink) = stage();

        let user = Principal::new("u1", Role::User, "t1");
        stage.evaluate(Some(&user), &Requirement::permission("users.write"), None).await;

        let events = sink.events(None).await;
        let deny = events.iter().find(|e| e.action == "access.check").unwrap();
        assert_eq!(deny.outcome, crate::audit::AuditOutcome::Denied);
        assert_eq!(deny.details.get("reason"), Some(&"insufficient_permission".to_string()));
    }

    #[test]
    fn test_deny_reason_public_messages_are_generic() {
        let reason = DenyReason::InsufficientRole {
            required: Role::Admin,
            actual: Role::User,
        };
        assert_eq!(reason.public_message(), "insufficient permission");
        assert_eq!(DenyReason::TenantMismatch.public_message(), "insufficient permission");
        assert_eq!(DenyReason::Unauthenticated.status_code(), 401);
        assert_eq!(DenyReason::StoreUnavailable.status_code(), 503);
    }
}
