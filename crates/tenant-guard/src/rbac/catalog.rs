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

//! Permission catalog: registered codes and per-role default sets
//!
//! The catalog is loaded data, not hard-coded branches: role defaults and
//! scope registrations are assembled at startup through the builder and can
//! be rebuilt without touching decision code.

use crate::rbac::roles::Role;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Capability code held by super admins, matching every permission
pub const WILDCARD: &str = "*";

/// Registered permission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permission {
    /// Unique code, `"{resource}.{action}"`
    pub code: String,

    /// Resource the permission applies to
    pub resource: String,

    /// Action on the resource
    pub action: String,

    /// Human-readable description
    pub description: String,
}

impl Permission {
    /// Create a permission; the code is derived from resource and action
    pub fn new(resource: impl Into<String>, action: impl Into<String>, description: impl Into<String>) -> Self {
        let resource = resource.into();
        let action = action.into();
        Self {
            code: format!("{resource}.{action}"),
            resource,
            action,
            description: description.into(),
        }
    }
}

/// Access level within a scope (secretaria)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Read,
    Write,
    Admin,
}

impl ScopeLevel {
    /// Wire identifier, also the action part of the permission code
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeLevel::Read => "read",
            ScopeLevel::Write => "write",
            ScopeLevel::Admin => "admin",
        }
    }

    /// Permission code for this level of a scope
    pub fn code_for(&self, scope: &str) -> String {
        format!("{scope}.{}", self.as_str())
    }

    /// Levels included when assigning this level (read ⊆ write ⊆ admin).
    /// Holding a higher level does NOT imply the lower codes at check time;
    /// the cumulative subset is materialized as explicit grants instead.
    pub fn cumulative(&self) -> &'static [ScopeLevel] {
        match self {
            ScopeLevel::Read => &[ScopeLevel::Read],
            ScopeLevel::Write => &[ScopeLevel::Read, ScopeLevel::Write],
            ScopeLevel::Admin => &[ScopeLevel::Read, ScopeLevel::Write, ScopeLevel::Admin],
        }
    }

    /// All levels
    pub fn all() -> [ScopeLevel; 3] {
        [ScopeLevel::Read, ScopeLevel::Write, ScopeLevel::Admin]
    }
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry of permission codes and per-role default sets
#[derive(Debug, Clone)]
pub struct PermissionCatalog {
    permissions: HashMap<String, Permission>,
    role_defaults: HashMap<Role, Vec<String>>,
    scopes: Vec<String>,
}

impl PermissionCatalog {
    /// Start building a catalog
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Look up a permission by code
    pub fn get(&self, code: &str) -> Option<&Permission> {
        self.permissions.get(code)
    }

    /// Whether a code is registered. The wildcard is always registered.
    pub fn contains(&self, code: &str) -> bool {
        code == WILDCARD || self.permissions.contains_key(code)
    }

    /// This level's own default codes, not including lower levels
    pub fn defaults_for_level(&self, role: Role) -> &[String] {
        self.role_defaults.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Union of defaults for every role at or below the given one
    pub fn cumulative_defaults(&self, role: Role) -> HashSet<String> {
        let mut set = HashSet::new();
        for lower in role.at_or_below() {
            set.extend(self.defaults_for_level(lower).iter().cloned());
        }
        set
    }

    /// Registered scopes
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// All registered permissions
    pub fn all(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.values()
    }

    /// Standard catalog: platform resources plus cumulative role defaults.
    /// Guest gets nothing; super_admin gets the wildcard.
    pub fn builtin() -> Self {
        Self::builder()
            .permission(Permission::new("profile", "read", "Read own profile"))
            .permission(Permission::new("profile", "write", "Update own profile"))
            .permission(Permission::new("notifications", "read", "Read notifications"))
            .permission(Permission::new("reports", "read", "Read reports"))
            .permission(Permission::new("reports", "write", "Create and edit reports"))
            .permission(Permission::new("users", "read", "List and view users"))
            .permission(Permission::new("users", "write", "Create and edit users"))
            .permission(Permission::new("roles", "manage", "Assign and change user roles"))
            .permission(Permission::new("permissions", "manage", "Grant and revoke direct permissions"))
            .role_defaults(Role::User, ["profile.read", "profile.write", "notifications.read"])
            .role_defaults(Role::Coordinator, ["reports.read"])
            .role_defaults(Role::Manager, ["reports.write", "users.read"])
            .role_defaults(Role::Admin, ["users.write", "roles.manage"])
            .role_defaults(Role::SuperAdmin, [WILDCARD])
            .build()
    }
}

/// Builder assembling a catalog from permissions, scopes, and role defaults
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    permissions: HashMap<String, Permission>,
    role_defaults: HashMap<Role, Vec<String>>,
    scopes: Vec<String>,
}

impl CatalogBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Register a permission
    pub fn permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission.code.clone(), permission);
        self
    }

    /// Register a scope, creating its read/write/admin codes
    pub fn scope(mut self, scope: impl Into<String>, label: impl Into<String>) -> Self {
        let scope = scope.into();
        let label = label.into();

        for level in ScopeLevel::all() {
            let permission = Permission::new(scope.clone(), level.as_str(), format!("{} access to {label}", level.as_str()));
            self.permissions.insert(permission.code.clone(), permission);
        }
        self.scopes.push(scope);
        self
    }

    /// Set a role level's own default codes (not cumulative; lower levels
    /// are unioned in at query time)
    pub fn role_defaults<I, S>(mut self, role: Role, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_defaults.entry(role).or_default().extend(codes.into_iter().map(Into::into));
        self
    }

    /// Finish building
    pub fn build(self) -> PermissionCatalog {
        PermissionCatalog {
            permissions: self.permissions,
            role_defaults: self.role_defaults,
            scopes: self.scopes,
        }
    }
}
