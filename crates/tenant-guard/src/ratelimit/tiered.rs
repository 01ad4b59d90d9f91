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

//! Tiered counter store with automatic failover
//!
//! Backends are ordered preferred-first (shared, durable, in-process).
//! A hit goes to the active tier; on error or timeout the store demotes
//! to the next tier and retries there. A periodic probe promotes back to
//! the most-preferred tier once it answers again.
//!
//! Counters are NOT migrated between tiers. After a failover the new
//! tier starts from empty windows, so a client can briefly see more
//! headroom than the fleet-wide limit. Accepted: availability over
//! exactness.

use crate::error::{GuardError, GuardResult};
use crate::ratelimit::backend::{RateCounterBackend, RateHit};
use metrics::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a rate-limit check does when every tier is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through uncounted. Default: losing rate limiting
    /// briefly is better than refusing all traffic.
    #[default]
    FailOpen,

    /// Refuse the request
    FailClosed,
}

/// Ordered set of counter backends with an active-tier cursor
pub struct TieredRateStore {
    /// Preferred-first
    backends: Vec<Arc<dyn RateCounterBackend>>,

    /// Index into `backends` of the tier currently serving hits
    active: AtomicUsize,

    /// Per-call budget before a backend is treated as down
    call_timeout: Duration,

    /// Epoch ms of the last probe attempt at a more-preferred tier
    last_probe_ms: AtomicU64,

    /// Minimum gap between probes
    probe_interval: Duration,
}

impl TieredRateStore {
    /// Build a store over the given backends, preferred-first. The
    /// in-process tier is the usual anchor.
    ///
    /// # Panics
    ///
    /// Panics when `backends` is empty.
    pub fn new(backends: Vec<Arc<dyn RateCounterBackend>>) -> Self {
        assert!(!backends.is_empty(), "TieredRateStore requires at least one backend");
        Self {
            backends,
            active: AtomicUsize::new(0),
            call_timeout: Duration::from_millis(500),
            last_probe_ms: AtomicU64::new(crate::ratelimit::backend::now_ms()),
            probe_interval: Duration::from_secs(30),
        }
    }

    /// Override the per-backend call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override how often a demoted store retries a better tier
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Tier name currently serving hits
    pub fn active_tier(&self) -> &'static str {
        let idx = self.active.load(Ordering::Relaxed).min(self.backends.len() - 1);
        self.backends[idx].tier()
    }

    /// Whether enough time has passed to try a better tier again. Uses a
    /// compare-exchange so concurrent hits elect a single prober.
    fn should_probe(&self) -> bool {
        let now = crate::ratelimit::backend::now_ms();
        let last = self.last_probe_ms.load(Ordering::Relaxed);
        now.saturating_sub(last) >= self.probe_interval.as_millis() as u64
            && self.last_probe_ms.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }

    async fn call_backend(&self, idx: usize, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<RateHit> {
        let backend = &self.backends[idx];
        match tokio::time::timeout(self.call_timeout, backend.increment(key, window_ms, max_hits)).await {
            Ok(result) => result,
            Err(_) => Err(GuardError::StoreUnavailable {
                message: format!("{} tier timed out after {:?}", backend.tier(), self.call_timeout),
            }),
        }
    }

    /// Count one hit, failing over through the tiers as needed. Returns
    /// the hit plus the tier that served it; errs only when every tier
    /// is down.
    pub async fn increment(&self, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<(RateHit, &'static str)> {
        let mut start = self.active.load(Ordering::Relaxed).min(self.backends.len() - 1);

        // Demoted store: periodically retry from the top
        if start > 0 && self.should_probe() {
            debug!(tier = self.backends[0].tier(), "probing preferred rate-limit tier");
            start = 0;
        }

        let mut last_err = None;
        for idx in start..self.backends.len() {
            match self.call_backend(idx, key, window_ms, max_hits).await {
                Ok(hit) => {
                    let previous = self.active.swap(idx, Ordering::Relaxed);
                    if previous != idx {
                        if idx < previous {
                            info!(tier = self.backends[idx].tier(), "rate-limit tier recovered");
                        } else {
                            warn!(
                                from = self.backends[previous].tier(),
                                to = self.backends[idx].tier(),
                                "rate-limit tier failover"
                            );
                            counter!("tenant_guard_rate_tier_failovers_total", 1);
                        }
                    }
                    return Ok((hit, self.backends[idx].tier()));
                }
                Err(err) => {
                    warn!(tier = self.backends[idx].tier(), error = %err, "rate-limit tier unavailable");
                    counter!("tenant_guard_rate_tier_errors_total", 1);
                    last_err = Some(err);
                }
            }
        }

        self.active.store(self.backends.len() - 1, Ordering::Relaxed);
        Err(last_err.unwrap_or(GuardError::StoreUnavailable {
            message: "no rate-limit backends configured".to_string(),
        }))
    }

    /// Drop the key's window on every tier that will take the call.
    /// Best-effort: a tier that is down is skipped, not an error.
    pub async fn reset(&self, key: &str) {
        for backend in &self.backends {
            if let Ok(Err(err)) = tokio::time::timeout(self.call_timeout, backend.reset(key)).await {
                debug!(tier = backend.tier(), error = %err, "reset skipped unavailable tier");
            }
        }
    }

    /// Sweep expired windows on every tier, returning the total removed
    pub async fn cleanup(&self, retention_ms: u64) -> u64 {
        let mut removed = 0;
        for backend in &self.backends {
            match tokio::time::timeout(self.call_timeout, backend.cleanup(retention_ms)).await {
                Ok(Ok(count)) => removed += count,
                Ok(Err(err)) => warn!(tier = backend.tier(), error = %err, "rate-limit sweep failed"),
                Err(_) => warn!(tier = backend.tier(), "rate-limit sweep timed out"),
            }
        }
        removed
    }
}

/// Spawn the periodic retention sweep for a store
pub fn start_cleanup_task(store: Arc<TieredRateStore>, interval: Duration, retention_ms: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = store.cleanup(retention_ms).await;
            if removed > 0 {
                debug!(removed, "swept expired rate-limit windows");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::memory::MemoryCounterBackend;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Backend that can be flipped between healthy and failing; counts
    /// via an inner in-process backend when healthy.
    struct FlakyBackend {
        tier: &'static str,
        down: AtomicBool,
        inner: MemoryCounterBackend,
    }

    impl FlakyBackend {
        fn new(tier: &'static str, down: bool) -> Self {
            Self {
                tier,
                down: AtomicBool::new(down),
                inner: MemoryCounterBackend::new(),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::Relaxed);
        }

        fn err(&self) -> GuardError {
            GuardError::StoreUnavailable {
                message: format!("{} is down", self.tier),
            }
        }
    }

    #[async_trait]
    impl RateCounterBackend for FlakyBackend {
        fn tier(&self) -> &'static str {
            self.tier
        }

        async fn increment(&self, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<RateHit> {
            if self.down.load(Ordering::Relaxed) {
                return Err(self.err());
            }
            self.inner.increment(key, window_ms, max_hits).await
        }

        async fn reset(&self, key: &str) -> GuardResult<()> {
            if self.down.load(Ordering::Relaxed) {
                return Err(self.err());
            }
            self.inner.reset(key).await
        }

        async fn cleanup(&self, retention_ms: u64) -> GuardResult<u64> {
            if self.down.load(Ordering::Relaxed) {
                return Err(self.err());
            }
            self.inner.cleanup(retention_ms).await
        }
    }

    fn store(shared_down: bool, durable_down: bool) -> (Arc<FlakyBackend>, Arc<FlakyBackend>, TieredRateStore) {
        let shared = Arc::new(FlakyBackend::new("shared", shared_down));
        let durable = Arc::new(FlakyBackend::new("durable", durable_down));
        let memory: Arc<dyn RateCounterBackend> = Arc::new(MemoryCounterBackend::new());
        let tiers: Vec<Arc<dyn RateCounterBackend>> = vec![shared.clone(), durable.clone(), memory];
        (shared, durable, TieredRateStore::new(tiers))
    }

    #[test]
    #[should_panic(expected = "at least one backend")]
    fn test_rejects_empty_backend_list() {
        TieredRateStore::new(Vec::new());
    }

    #[tokio::test]
    async fn test_serves_from_preferred_tier() {
        let (_, _, store) = store(false, false);

        let (hit, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "shared");
        assert_eq!(hit.total_hits, 1);
        assert_eq!(store.active_tier(), "shared");
    }

    #[tokio::test]
    async fn test_fails_over_in_order() {
        let (_, _, store) = store(true, false);

        let (_, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "durable");
        assert_eq!(store.active_tier(), "durable");
    }

    #[tokio::test]
    async fn test_falls_through_to_memory() {
        let (_, _, store) = store(true, true);

        let (hit, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "memory");
        assert!(hit.is_first_in_window);
    }

    #[tokio::test]
    async fn test_all_tiers_down_is_store_unavailable() {
        let shared = Arc::new(FlakyBackend::new("shared", true));
        let tiers: Vec<Arc<dyn RateCounterBackend>> = vec![shared];
        let store = TieredRateStore::new(tiers);

        let err = store.increment("k", 60_000, 3).await.unwrap_err();
        assert!(matches!(err, GuardError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_failover_does_not_carry_counts() {
        let (shared, _, store) = store(false, false);

        store.increment("k", 60_000, 3).await.unwrap();
        store.increment("k", 60_000, 3).await.unwrap();

        shared.set_down(true);

        // Fallback tier opens a fresh window for the same key
        let (hit, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "durable");
        assert_eq!(hit.total_hits, 1);
    }

    #[tokio::test]
    async fn test_recovery_probe_promotes_back() {
        let (shared, _, store) = store(true, false);
        let store = store.with_probe_interval(Duration::from_millis(20));

        let (_, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "durable");

        shared.set_down(false);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (_, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "shared");
        assert_eq!(store.active_tier(), "shared");
    }

    #[tokio::test]
    async fn test_probe_respects_interval() {
        let (shared, _, store) = store(true, false);
        let store = store.with_probe_interval(Duration::from_secs(3600));

        store.increment("k", 60_000, 3).await.unwrap();
        shared.set_down(false);

        // Interval has not elapsed, so the store stays demoted
        let (_, tier) = store.increment("k", 60_000, 3).await.unwrap();
        assert_eq!(tier, "durable");
    }

    #[tokio::test]
    async fn test_reset_skips_down_tiers() {
        let (_, durable, store) = store(true, false);

        store.increment("k", 60_000, 3).await.unwrap();
        store.increment("k", 60_000, 3).await.unwrap();
        store.reset("k").await;

        // Down shared tier was skipped without erroring; durable was reset
        let fresh = durable.inner.increment("k", 60_000, 3).await.unwrap();
        assert!(fresh.is_first_in_window);
    }

    #[tokio::test]
    async fn test_cleanup_sums_across_tiers() {
        let (shared, durable, store) = store(false, false);

        shared.inner.increment("a", 10, 3).await.unwrap();
        durable.inner.increment("b", 10, 3).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.cleanup(0).await, 2);
    }
}
