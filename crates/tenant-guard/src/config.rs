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

//! Configuration, defaults overridable from the environment

use crate::ratelimit::decision::RoleMultipliers;
use crate::ratelimit::tiered::FailurePolicy;
use crate::rbac::roles::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use tracing::warn;

/// Guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Shared cache URL (e.g. `redis://127.0.0.1:6379`); unset disables
    /// the shared tier
    pub shared_cache_url: Option<String>,

    /// Durable store URL (e.g. `sqlite:tenant_guard.db`); unset disables
    /// the durable tier
    pub durable_db_url: Option<String>,

    /// Per-backend call budget in milliseconds
    pub backend_timeout_ms: u64,

    /// Seconds between recovery probes at a more-preferred tier
    pub probe_interval_secs: u64,

    /// Seconds between retention sweeps
    pub cleanup_interval_secs: u64,

    /// Grace period before an expired window is swept, in milliseconds
    pub retention_grace_ms: u64,

    /// What rate checks do when every tier is down
    pub rate_failure_policy: FailurePolicy,

    /// Default route window in milliseconds
    pub default_window_ms: u64,

    /// Default hits per window, before role multipliers
    pub default_max_hits: u32,

    /// Per-role multiplier overrides; roles not listed keep the builtin
    /// multipliers
    pub role_multipliers: HashMap<Role, u32>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            shared_cache_url: None,
            durable_db_url: None,
            backend_timeout_ms: 500,
            probe_interval_secs: 30,
            cleanup_interval_secs: 300,
            retention_grace_ms: 24 * 60 * 60 * 1000,
            rate_failure_policy: FailurePolicy::FailOpen,
            default_window_ms: 60_000,
            default_max_hits: 100,
            role_multipliers: HashMap::new(),
        }
    }
}

impl GuardConfig {
    /// Load configuration from `TENANT_GUARD_*` environment variables,
    /// falling back to defaults. Malformed values are logged and the
    /// default kept; a missing store URL simply disables that tier.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.shared_cache_url = env::var("TENANT_GUARD_SHARED_CACHE_URL").ok().filter(|v| !v.is_empty());
        config.durable_db_url = env::var("TENANT_GUARD_DURABLE_DB_URL").ok().filter(|v| !v.is_empty());

        if let Some(value) = parse_env("TENANT_GUARD_BACKEND_TIMEOUT_MS") {
            config.backend_timeout_ms = value;
        }
        if let Some(value) = parse_env("TENANT_GUARD_PROBE_INTERVAL_SECS") {
            config.probe_interval_secs = value;
        }
        if let Some(value) = parse_env("TENANT_GUARD_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = value;
        }
        if let Some(value) = parse_env("TENANT_GUARD_RETENTION_GRACE_MS") {
            config.retention_grace_ms = value;
        }
        if let Some(value) = parse_env::<u32>("TENANT_GUARD_DEFAULT_MAX_HITS") {
            config.default_max_hits = value;
        }
        if let Some(value) = parse_env("TENANT_GUARD_DEFAULT_WINDOW_MS") {
            config.default_window_ms = value;
        }

        if let Ok(policy) = env::var("TENANT_GUARD_RATE_FAILURE_POLICY") {
            match policy.as_str() {
                "fail_open" => config.rate_failure_policy = FailurePolicy::FailOpen,
                "fail_closed" => config.rate_failure_policy = FailurePolicy::FailClosed,
                other => warn!(value = %other, "unknown rate failure policy, keeping default"),
            }
        }

        if let Ok(raw) = env::var("TENANT_GUARD_ROLE_MULTIPLIERS") {
            config.role_multipliers = parse_multipliers(&raw);
        }

        config
    }

    /// Build the effective multipliers: builtins plus configured overrides
    pub fn multipliers(&self) -> RoleMultipliers {
        RoleMultipliers::with_overrides(&self.role_multipliers)
    }
}

/// Parse `role=multiplier` pairs, e.g. `admin=8,manager=3`. Malformed
/// pairs are logged and skipped.
fn parse_multipliers(raw: &str) -> HashMap<Role, u32> {
    let mut overrides = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = pair
            .split_once('=')
            .and_then(|(role, value)| Some((role.trim().parse::<Role>().ok()?, value.trim().parse::<u32>().ok()?)));
        match parsed {
            Some((role, value)) => {
                overrides.insert(role, value);
            }
            None => warn!(pair = %pair, "malformed role multiplier, skipping"),
        }
    }
    overrides
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = %name, value = %raw, "malformed numeric value, keeping default");
            None
        }
    }
}
