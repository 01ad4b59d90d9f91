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

//! Role hierarchy and request principals
//!
//! The hierarchy is a fixed total order: higher roles are cumulative and
//! inherit every lower role's default permissions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered role enumeration, level 0 through 5
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    User,
    Coordinator,
    Manager,
    Admin,
    SuperAdmin,
}

impl Role {
    /// Numeric level used for hierarchy comparisons
    pub fn level(&self) -> u8 {
        match self {
            Role::Guest => 0,
            Role::User => 1,
            Role::Coordinator => 2,
            Role::Manager => 3,
            Role::Admin => 4,
            Role::SuperAdmin => 5,
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Role::Guest => "Guest",
            Role::User => "User",
            Role::Coordinator => "Coordinator",
            Role::Manager => "Manager",
            Role::Admin => "Administrator",
            Role::SuperAdmin => "Super Administrator",
        }
    }

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::User => "user",
            Role::Coordinator => "coordinator",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// All roles in ascending level order
    pub fn all() -> [Role; 6] {
        [Role::Guest, Role::User, Role::Coordinator, Role::Manager, Role::Admin, Role::SuperAdmin]
    }

    /// Roles at or below this one, ascending. Role defaults are cumulative,
    /// so a principal's effective set unions the defaults of each of these.
    pub fn at_or_below(&self) -> Vec<Role> {
        Role::all().into_iter().filter(|r| r.level() <= self.level()).collect()
    }

    /// Whether this role satisfies a minimum-role requirement
    pub fn satisfies(&self, required: Role) -> bool {
        self.level() >= required.level()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Role::Guest),
            "user" => Ok(Role::User),
            "coordinator" => Ok(Role::Coordinator),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            "super_admin" => Ok(Role::SuperAdmin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Transient per-request identity supplied by the authentication layer.
/// Never persisted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    /// User ID
    pub user_id: String,

    /// Resolved role
    pub role: Role,

    /// Tenant the principal belongs to. Super admins may be tenantless.
    pub tenant_id: Option<String>,
}

impl Principal {
    /// Create a principal bound to a tenant
    pub fn new(user_id: impl Into<String>, role: Role, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            tenant_id: Some(tenant_id.into()),
        }
    }

    /// Create a tenantless principal (platform operators)
    pub fn global(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            tenant_id: None,
        }
    }

    /// Whether this principal belongs to the given tenant
    pub fn owns_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_id.as_deref() == Some(tenant_id)
    }
}
