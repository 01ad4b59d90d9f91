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

//! Rate-counter backend contract and fixed-window math
//!
//! Fixed window, not sliding: once a window elapses the counter resets
//! wholesale, so a burst straddling a boundary can see up to 2×max_hits.
//! Accepted trade-off; stronger smoothing would need a sliding log or
//! token bucket.

use crate::error::GuardResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Result of one counted hit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateHit {
    /// Hits recorded in the current window, including this one
    pub total_hits: u32,

    /// Hits left before the limit (0 when at or over)
    pub remaining_points: u32,

    /// Milliseconds until the window resets
    pub ms_before_next: u64,

    /// Whether this hit opened the window
    pub is_first_in_window: bool,
}

impl RateHit {
    /// Build a hit result from window counters
    pub fn from_window(hits: u32, max_hits: u32, ms_before_next: u64, is_first_in_window: bool) -> Self {
        Self {
            total_hits: hits,
            remaining_points: max_hits.saturating_sub(hits),
            ms_before_next,
            is_first_in_window,
        }
    }

    /// Whether the hit stayed within the limit
    pub fn is_allowed(&self, max_hits: u32) -> bool {
        self.total_hits <= max_hits
    }
}

/// Persisted window row: one per key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowState {
    /// When the window opened, epoch ms
    pub window_start_ms: u64,

    /// Window length
    pub window_ms: u64,

    /// Hits recorded so far; never decreases within a window
    pub hits: u32,
}

impl WindowState {
    /// Open a fresh window with one hit
    pub fn open(now: u64, window_ms: u64) -> Self {
        Self {
            window_start_ms: now,
            window_ms,
            hits: 1,
        }
    }

    /// Record a hit: reset the window when it has elapsed, otherwise
    /// increment. Returns whether this hit opened a (new) window. Callers
    /// must hold exclusive access to the row for the duration.
    pub fn advance(&mut self, now: u64, window_ms: u64) -> bool {
        if now >= self.window_start_ms + self.window_ms {
            *self = Self::open(now, window_ms);
            true
        } else {
            self.hits += 1;
            // window_ms changes (route reconfiguration) apply from the
            // next window onward
            false
        }
    }

    /// Milliseconds until this window resets
    pub fn ms_before_next(&self, now: u64) -> u64 {
        (self.window_start_ms + self.window_ms).saturating_sub(now)
    }

    /// Whether the retention grace period has elapsed
    pub fn is_stale(&self, now: u64, retention_ms: u64) -> bool {
        now >= self.window_start_ms + self.window_ms + retention_ms
    }
}

/// Per-key hit counter with a time window.
///
/// `increment` must be one atomic read-modify-write per key; a naive
/// read-then-write undercounts under concurrency.
#[async_trait]
pub trait RateCounterBackend: Send + Sync {
    /// Tier name for headers and logs
    fn tier(&self) -> &'static str;

    /// Count one hit against the key's window
    async fn increment(&self, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<RateHit>;

    /// Drop the key's window
    async fn reset(&self, key: &str) -> GuardResult<()>;

    /// Remove windows whose retention grace period has elapsed, returning
    /// the number removed
    async fn cleanup(&self, retention_ms: u64) -> GuardResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_advance() {
        let mut window = WindowState::open(1_000, 60_000);
        assert_eq!(window.hits, 1);

        assert!(!window.advance(2_000, 60_000));
        assert_eq!(window.hits, 2);
        assert_eq!(window.ms_before_next(2_000), 59_000);

        // Window elapsed: wholesale reset, not proportional decay
        assert!(window.advance(61_000, 60_000));
        assert_eq!(window.hits, 1);
        assert_eq!(window.window_start_ms, 61_000);
    }

    #[test]
    fn test_rate_hit_accounting() {
        let hit = RateHit::from_window(3, 3, 10_000, false);
        assert_eq!(hit.remaining_points, 0);
        assert!(hit.is_allowed(3));

        let over = RateHit::from_window(4, 3, 10_000, false);
        assert_eq!(over.remaining_points, 0);
        assert!(!over.is_allowed(3));
    }

    #[test]
    fn test_staleness() {
        let window = WindowState::open(0, 60_000);
        assert!(!window.is_stale(60_000, 1_000));
        assert!(window.is_stale(61_000, 1_000));
    }
}
