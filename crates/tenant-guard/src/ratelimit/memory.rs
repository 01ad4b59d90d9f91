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

//! In-process rate-counter backend
//!
//! Last-resort tier: counters live in this process only, so limits apply
//! per worker rather than fleet-wide while this tier is active.

use crate::error::GuardResult;
use crate::ratelimit::backend::{RateCounterBackend, RateHit, WindowState, now_ms};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// DashMap-backed counter. The entry API holds the shard lock across the
/// read-modify-write, which is the per-key atomicity the contract needs.
#[derive(Debug, Default)]
pub struct MemoryCounterBackend {
    windows: DashMap<String, WindowState>,
}

impl MemoryCounterBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live windows (tests and stats)
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no windows are held
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateCounterBackend for MemoryCounterBackend {
    fn tier(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<RateHit> {
        let now = now_ms();

        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| WindowState {
            window_start_ms: now,
            window_ms,
            hits: 0,
        });

        let is_first = if entry.hits == 0 {
            entry.hits = 1;
            true
        } else {
            entry.advance(now, window_ms)
        };

        let hit = RateHit::from_window(entry.hits, max_hits, entry.ms_before_next(now), is_first);
        Ok(hit)
    }

    async fn reset(&self, key: &str) -> GuardResult<()> {
        self.windows.remove(key);
        Ok(())
    }

    async fn cleanup(&self, retention_ms: u64) -> GuardResult<u64> {
        let now = now_ms();
        // Count inside the closure: differencing map sizes miscounts when
        // increments insert fresh keys while the sweep runs.
        let removed = AtomicU64::new(0);
        self.windows.retain(|_, window| {
            let stale = window.is_stale(now, retention_ms);
            if stale {
                removed.fetch_add(1, Ordering::Relaxed);
            }
            !stale
        });
        Ok(removed.into_inner())
    }
}
