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

//! Tiered persistent rate limiting
//!
//! - Fixed-window counters behind one backend contract
//! - Three tiers: shared cache, durable store, in-process map
//! - Automatic failover with periodic recovery probes
//! - Decision stage with key strategies and role multipliers

pub mod backend;
pub mod decision;
pub mod durable;
pub mod memory;
pub mod shared;
pub mod tiered;

pub use backend::{RateCounterBackend, RateHit, WindowState};
pub use decision::{KeyStrategy, RateDecision, RateLimitDecision, RateLimitHeaders, RoleMultipliers, RouteLimit, redact_ip};
pub use durable::DurableCounterBackend;
pub use memory::MemoryCounterBackend;
pub use shared::SharedCounterBackend;
pub use tiered::{FailurePolicy, TieredRateStore, start_cleanup_task};
