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

//! Durable-fallback rate-counter backend (SQL)
//!
//! One row per key. The increment is a single upsert statement, so the
//! read-modify-write happens inside the engine under its row lock and
//! concurrent hits cannot undercount. Counters survive restarts, at the
//! price of slower hits than the shared tier.

use crate::error::GuardResult;
use crate::ratelimit::backend::{RateCounterBackend, RateHit, now_ms};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

/// SQLite-backed counter
#[derive(Debug, Clone)]
pub struct DurableCounterBackend {
    pool: SqlitePool,
}

impl DurableCounterBackend {
    /// Connect and run migrations. `url` is e.g. `sqlite:ratelimit.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> GuardResult<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    /// Wrap an existing pool (migrations still required)
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the window table with the indexes the sweep needs
    pub async fn migrate(&self) -> GuardResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_windows (
                key             TEXT PRIMARY KEY,
                window_start_ms INTEGER NOT NULL,
                window_ms       INTEGER NOT NULL,
                hits            INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rate_windows_start ON rate_windows (window_start_ms)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl RateCounterBackend for DurableCounterBackend {
    fn tier(&self) -> &'static str {
        "durable"
    }

    async fn increment(&self, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<RateHit> {
        let now = now_ms() as i64;

        // Open, reset, or bump the window in one atomic statement
        let (hits, window_start_ms, row_window_ms): (i64, i64, i64) = sqlx::query_as(
            "INSERT INTO rate_windows (key, window_start_ms, window_ms, hits)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (key) DO UPDATE SET
                 hits = CASE
                     WHEN ?2 - rate_windows.window_start_ms >= rate_windows.window_ms THEN 1
                     ELSE rate_windows.hits + 1
                 END,
                 window_start_ms = CASE
                     WHEN ?2 - rate_windows.window_start_ms >= rate_windows.window_ms THEN ?2
                     ELSE rate_windows.window_start_ms
                 END,
                 window_ms = CASE
                     WHEN ?2 - rate_windows.window_start_ms >= rate_windows.window_ms THEN ?3
                     ELSE rate_windows.window_ms
                 END
             RETURNING hits, window_start_ms, window_ms",
        )
        .bind(key)
        .bind(now)
        .bind(window_ms as i64)
        .fetch_one(&self.pool)
        .await?;

        let is_first = hits == 1 && window_start_ms == now;
        let ms_before_next = ((window_start_ms + row_window_ms) - now).max(0) as u64;

        Ok(RateHit::from_window(hits.clamp(0, u32::MAX as i64) as u32, max_hits, ms_before_next, is_first))
    }

    async fn reset(&self, key: &str) -> GuardResult<()> {
        sqlx::query("DELETE FROM rate_windows WHERE key = ?1").bind(key).execute(&self.pool).await?;
        Ok(())
    }

    async fn cleanup(&self, retention_ms: u64) -> GuardResult<u64> {
        let now = now_ms() as i64;

        let result = sqlx::query("DELETE FROM rate_windows WHERE window_start_ms + window_ms + ?1 <= ?2")
            .bind(retention_ms as i64)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
