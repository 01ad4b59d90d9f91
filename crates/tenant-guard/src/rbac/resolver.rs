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

//! Effective permission resolution and grant management
//!
//! A principal's effective set is the union of cumulative role defaults and
//! direct grants. Resolution errors mean deny-by-default for callers: access
//! control never fails open.

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::error::{GuardError, GuardResult};
use crate::rbac::catalog::{PermissionCatalog, ScopeLevel, WILDCARD};
use crate::rbac::grants::{Grant, GrantStore};
use crate::rbac::roles::{Principal, Role};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// System-wide capability allowing grant/revoke on any user
pub const MANAGE_PERMISSIONS: &str = "permissions.manage";

/// Capability allowing role changes within a tenant
pub const MANAGE_ROLES: &str = "roles.manage";

/// Computes effective permissions and mutates grants
#[derive(Clone)]
pub struct PermissionResolver {
    catalog: Arc<PermissionCatalog>,
    grants: Arc<dyn GrantStore>,
    audit: Arc<dyn AuditSink>,
}

impl PermissionResolver {
    /// Create a resolver over a catalog, grant store, and audit sink
    pub fn new(catalog: Arc<PermissionCatalog>, grants: Arc<dyn GrantStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { catalog, grants, audit }
    }

    /// The catalog backing this resolver
    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    /// Effective permission set: cumulative role defaults unioned with
    /// direct grants. Fails with `StoreUnavailable` when the grant store
    /// cannot be reached; callers must treat that as deny.
    pub async fn effective_permissions(&self, principal: &Principal) -> GuardResult<HashSet<String>> {
        let mut set = self.catalog.cumulative_defaults(principal.role);

        for grant in self.grants.grants_for(&principal.user_id).await? {
            set.insert(grant.code);
        }

        debug!(
            user_id = %principal.user_id,
            role = %principal.role,
            permission_count = %set.len(),
            "effective permissions resolved"
        );

        Ok(set)
    }

    /// Whether the principal holds a permission code. Super admins hold
    /// everything unconditionally.
    pub async fn has_permission(&self, principal: &Principal, code: &str) -> GuardResult<bool> {
        if principal.role == Role::SuperAdmin {
            return Ok(true);
        }

        let effective = self.effective_permissions(principal).await?;
        Ok(effective.contains(WILDCARD) || effective.contains(code))
    }

    /// Conjunction over `has_permission`
    pub async fn has_all(&self, principal: &Principal, codes: &[String]) -> GuardResult<bool> {
        if principal.role == Role::SuperAdmin {
            return Ok(true);
        }

        let effective = self.effective_permissions(principal).await?;
        if effective.contains(WILDCARD) {
            return Ok(true);
        }
        Ok(codes.iter().all(|code| effective.contains(code)))
    }

    /// Disjunction over `has_permission`
    pub async fn has_any(&self, principal: &Principal, codes: &[String]) -> GuardResult<bool> {
        if principal.role == Role::SuperAdmin {
            return Ok(true);
        }

        let effective = self.effective_permissions(principal).await?;
        if effective.contains(WILDCARD) {
            return Ok(true);
        }
        Ok(codes.iter().any(|code| effective.contains(code)))
    }

    /// Whether the principal can access a scope at the given level.
    /// Levels are independent codes: holding write does not imply read
    /// unless the cumulative subset was materialized by
    /// `set_scope_permissions`.
    pub async fn can_access_scope(&self, principal: &Principal, scope: &str, level: ScopeLevel) -> GuardResult<bool> {
        self.has_permission(principal, &level.code_for(scope)).await
    }

    /// Grant a permission. Idempotent: granting an already-held code is a
    /// no-op success. Unregistered codes are a caller programming error.
    pub async fn grant(&self, user_id: &str, code: &str, granted_by: &str) -> GuardResult<()> {
        if !self.catalog.contains(code) {
            return Err(GuardError::PermissionNotFound { code: code.to_string() });
        }

        let inserted = self.grants.insert(Grant::new(user_id, code, granted_by)).await?;

        if inserted {
            counter!("tenant_guard_grants_total", 1);
            self.emit_audit(
                AuditEvent::new(granted_by, "permission.grant", "permission", AuditOutcome::Success)
                    .with_resource_id(code)
                    .with_detail("target_user", user_id),
            )
            .await;
        } else {
            debug!(user_id = %user_id, code = %code, "grant already held, no-op");
        }

        Ok(())
    }

    /// Revoke a permission. Idempotent: revoking an unheld code is a no-op.
    pub async fn revoke(&self, user_id: &str, code: &str) -> GuardResult<()> {
        let removed = self.grants.remove(user_id, code).await?;

        if removed {
            counter!("tenant_guard_revokes_total", 1);
            self.emit_audit(
                AuditEvent::new(user_id, "permission.revoke", "permission", AuditOutcome::Success)
                    .with_resource_id(code)
                    .with_detail("target_user", user_id),
            )
            .await;
        } else {
            debug!(user_id = %user_id, code = %code, "revoke of unheld grant, no-op");
        }

        Ok(())
    }

    /// Set a user's access level for a scope: revoke all three scope codes,
    /// then grant the cumulative subset for `level` (read ⊆ write ⊆ admin).
    ///
    /// The revoke-then-grant sequence is not atomic; a concurrent check can
    /// observe the user with no scope permissions for the width of a few
    /// awaits. Callers needing stronger guarantees must serialize updates
    /// per user externally.
    pub async fn set_scope_permissions(&self, user_id: &str, scope: &str, level: ScopeLevel, granted_by: &str) -> GuardResult<()> {
        for existing in ScopeLevel::all() {
            self.revoke(user_id, &existing.code_for(scope)).await?;
        }

        for granted in level.cumulative() {
            self.grant(user_id, &granted.code_for(scope), granted_by).await?;
        }

        self.emit_audit(
            AuditEvent::new(granted_by, "permission.set_scope", "scope", AuditOutcome::Success)
                .with_resource_id(scope)
                .with_detail("target_user", user_id)
                .with_detail("level", level.as_str()),
        )
        .await;

        Ok(())
    }

    /// Replace every direct grant a user holds with the given codes.
    /// Used by role-sync flows (revoke-all-then-regrant).
    pub async fn replace_grants(&self, user_id: &str, codes: &[String], granted_by: &str) -> GuardResult<()> {
        for code in codes {
            if !self.catalog.contains(code) {
                return Err(GuardError::PermissionNotFound { code: code.clone() });
            }
        }

        let dropped = self.grants.remove_all(user_id).await?;
        for code in codes {
            self.grants.insert(Grant::new(user_id, code, granted_by)).await?;
        }

        self.emit_audit(
            AuditEvent::new(granted_by, "permission.sync", "permission", AuditOutcome::Success)
                .with_detail("target_user", user_id)
                .with_detail("revoked", dropped.to_string())
                .with_detail("granted", codes.len().to_string()),
        )
        .await;

        Ok(())
    }

    /// Whether `manager` may manage `target`'s grants and roles.
    ///
    /// True when the manager holds the system-wide manage-permissions
    /// capability (super admins always do), or when the manager's role is
    /// exactly admin, both share a tenant, and the manager holds the
    /// manage-roles capability. No other combination qualifies.
    pub async fn can_manage(&self, manager: &Principal, target_user_id: &str, target_tenant: Option<&str>) -> GuardResult<bool> {
        if self.has_permission(manager, MANAGE_PERMISSIONS).await? {
            return Ok(true);
        }

        if manager.role != Role::Admin {
            return Ok(false);
        }

        let same_tenant = match (manager.tenant_id.as_deref(), target_tenant) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !same_tenant {
            debug!(
                manager = %manager.user_id,
                target = %target_user_id,
                "management denied: tenant mismatch"
            );
            return Ok(false);
        }

        self.has_permission(manager, MANAGE_ROLES).await
    }

    async fn emit_audit(&self, event: AuditEvent) {
        // Audit failures are logged, never propagated
        if let Err(err) = self.audit.record(event).await {
            warn!(error = %err, "audit sink rejected event");
        }
    }
}
