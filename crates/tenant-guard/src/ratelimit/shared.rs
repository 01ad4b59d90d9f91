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

//! Fast-shared rate-counter backend (Redis)
//!
//! Preferred tier: counters are shared across every worker. The whole
//! increment runs as one server-side script, so concurrent hits on the
//! same key can never undercount. Window expiry rides on key TTL; there
//! is nothing for the retention sweep to do.

use crate::error::GuardResult;
use crate::ratelimit::backend::{RateCounterBackend, RateHit};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

/// INCR + PEXPIRE + PTTL in one atomic round trip. The first hit opens
/// the window by arming the TTL.
const INCREMENT_SCRIPT: &str = r#"
local hits = redis.call('INCR', KEYS[1])
if hits == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {hits, ttl}
"#;

/// Redis-backed counter, one key per rate key
pub struct SharedCounterBackend {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl SharedCounterBackend {
    /// Connect to the shared cache, e.g. `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> GuardResult<Self> {
        let client = Client::open(url).map_err(crate::error::GuardError::from)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
            key_prefix: "rl:".to_string(),
        })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

#[async_trait]
impl RateCounterBackend for SharedCounterBackend {
    fn tier(&self) -> &'static str {
        "shared"
    }

    async fn increment(&self, key: &str, window_ms: u64, max_hits: u32) -> GuardResult<RateHit> {
        let mut conn = self.conn.clone();

        let (hits, pttl): (u64, i64) = self.script.key(self.storage_key(key)).arg(window_ms).invoke_async(&mut conn).await?;

        // PTTL is negative when the key has no expiry (e.g. armed this
        // call); treat it as a full window remaining.
        let ms_before_next = if pttl >= 0 { pttl as u64 } else { window_ms };

        Ok(RateHit::from_window(hits.min(u32::MAX as u64) as u32, max_hits, ms_before_next, hits == 1))
    }

    async fn reset(&self, key: &str) -> GuardResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(self.storage_key(key)).query_async(&mut conn).await?;
        Ok(())
    }

    async fn cleanup(&self, _retention_ms: u64) -> GuardResult<u64> {
        // Key TTL already bounds retention
        Ok(0)
    }
}
