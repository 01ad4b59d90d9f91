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

//! Grant storage: direct (user, permission) assignments
//!
//! Grants are unique on (user_id, code); concurrent grant/revoke for the
//! same pair is serialized by the store's unique constraint and upsert
//! semantics, no application-level lock needed.

use crate::error::{GuardError, GuardResult};
use crate::rbac::catalog::PermissionCatalog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;

/// Direct permission assignment with audit metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    /// User holding the grant
    pub user_id: String,

    /// Permission code
    pub code: String,

    /// Who granted it
    pub granted_by: String,

    /// When it was granted
    pub created_at: DateTime<Utc>,
}

impl Grant {
    /// Create a grant stamped with the current time
    pub fn new(user_id: impl Into<String>, code: impl Into<String>, granted_by: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            code: code.into(),
            granted_by: granted_by.into(),
            created_at: Utc::now(),
        }
    }
}

/// Persistent mapping of (user, permission) grants
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// All grants held by a user
    async fn grants_for(&self, user_id: &str) -> GuardResult<Vec<Grant>>;

    /// Upsert a grant. Returns false when the pair was already present
    /// (idempotent success, not an error).
    async fn insert(&self, grant: Grant) -> GuardResult<bool>;

    /// Remove a grant. Returns false when the pair was not held.
    async fn remove(&self, user_id: &str, code: &str) -> GuardResult<bool>;

    /// Remove every grant held by a user, returning how many were dropped
    async fn remove_all(&self, user_id: &str) -> GuardResult<usize>;
}

/// In-memory grant store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    grants: DashMap<String, HashMap<String, Grant>>,
}

impl MemoryGrantStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn grants_for(&self, user_id: &str) -> GuardResult<Vec<Grant>> {
        Ok(self.grants.get(user_id).map(|held| held.values().cloned().collect()).unwrap_or_default())
    }

    async fn insert(&self, grant: Grant) -> GuardResult<bool> {
        let mut held = self.grants.entry(grant.user_id.clone()).or_default();
        if held.contains_key(&grant.code) {
            return Ok(false);
        }
        held.insert(grant.code.clone(), grant);
        Ok(true)
    }

    async fn remove(&self, user_id: &str, code: &str) -> GuardResult<bool> {
        match self.grants.get_mut(user_id) {
            Some(mut held) => Ok(held.remove(code).is_some()),
            None => Ok(false),
        }
    }

    async fn remove_all(&self, user_id: &str) -> GuardResult<usize> {
        Ok(self.grants.remove(user_id).map(|(_, held)| held.len()).unwrap_or(0))
    }
}

/// SQLite-backed grant store.
///
/// The UNIQUE(user_id, code) constraint plus `ON CONFLICT DO NOTHING`
/// serializes concurrent writers per pair inside the engine.
#[derive(Debug, Clone)]
pub struct SqliteGrantStore {
    pool: SqlitePool,
}

impl SqliteGrantStore {
    /// Connect and run migrations. `url` is e.g. `sqlite:grants.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> GuardResult<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool (migrations still required)
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the permissions and grants tables
    pub async fn migrate(&self) -> GuardResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS permissions (
                code        TEXT PRIMARY KEY,
                resource    TEXT NOT NULL,
                action      TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS grants (
                user_id    TEXT NOT NULL,
                code       TEXT NOT NULL,
                granted_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, code)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_grants_user ON grants (user_id)").execute(&self.pool).await?;

        Ok(())
    }

    /// Sync the permission catalog into the permissions table. Run at
    /// startup so no grant can reference an unregistered code.
    pub async fn sync_catalog(&self, catalog: &PermissionCatalog) -> GuardResult<()> {
        for permission in catalog.all() {
            sqlx::query(
                "INSERT INTO permissions (code, resource, action, description)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (code) DO UPDATE SET
                     resource = excluded.resource,
                     action = excluded.action,
                     description = excluded.description",
            )
            .bind(&permission.code)
            .bind(&permission.resource)
            .bind(&permission.action)
            .bind(&permission.description)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GrantStore for SqliteGrantStore {
    async fn grants_for(&self, user_id: &str) -> GuardResult<Vec<Grant>> {
        let rows: Vec<(String, String, String, DateTime<Utc>)> = sqlx::query_as("SELECT user_id, code, granted_by, created_at FROM grants WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, code, granted_by, created_at)| Grant {
                user_id,
                code,
                granted_by,
                created_at,
            })
            .collect())
    }

    async fn insert(&self, grant: Grant) -> GuardResult<bool> {
        let result = sqlx::query(
            "INSERT INTO grants (user_id, code, granted_by, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, code) DO NOTHING",
        )
        .bind(&grant.user_id)
        .bind(&grant.code)
        .bind(&grant.granted_by)
        .bind(grant.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, user_id: &str, code: &str) -> GuardResult<bool> {
        let result = sqlx::query("DELETE FROM grants WHERE user_id = ?1 AND code = ?2").bind(user_id).bind(code).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_all(&self, user_id: &str) -> GuardResult<usize> {
        let result = sqlx::query("DELETE FROM grants WHERE user_id = ?1").bind(user_id).execute(&self.pool).await?;

        Ok(result.rows_affected() as usize)
    }
}

/// Store that always fails, for exercising fail-closed paths in tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct UnavailableGrantStore;

#[cfg(test)]
#[async_trait]
impl GrantStore for UnavailableGrantStore {
    async fn grants_for(&self, _user_id: &str) -> GuardResult<Vec<Grant>> {
        Err(GuardError::StoreUnavailable {
            message: "grant store offline".to_string(),
        })
    }

    async fn insert(&self, _grant: Grant) -> GuardResult<bool> {
        Err(GuardError::StoreUnavailable {
            message: "grant store offline".to_string(),
        })
    }

    async fn remove(&self, _user_id: &str, _code: &str) -> GuardResult<bool> {
        Err(GuardError::StoreUnavailable {
            message: "grant store offline".to_string(),
        })
    }

    async fn remove_all(&self, _user_id: &str) -> GuardResult<usize> {
        Err(GuardError::StoreUnavailable {
            message: "grant store offline".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_upsert() {
        let store = MemoryGrantStore::new();

        assert!(store.insert(Grant::new("u1", "saude.read", "admin")).await.unwrap());
        // Second insert of the same pair is a no-op success
        assert!(!store.insert(Grant::new("u1", "saude.read", "admin")).await.unwrap());

        let grants = store.grants_for("u1").await.unwrap();
        assert_eq!(grants.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_remove() {
        let store = MemoryGrantStore::new();

        store.insert(Grant::new("u1", "saude.read", "admin")).await.unwrap();
        assert!(store.remove("u1", "saude.read").await.unwrap());
        assert!(!store.remove("u1", "saude.read").await.unwrap());
        assert!(!store.remove("unknown", "saude.read").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_remove_all() {
        let store = MemoryGrantStore::new();

        store.insert(Grant::new("u1", "saude.read", "admin")).await.unwrap();
        store.insert(Grant::new("u1", "saude.write", "admin")).await.unwrap();

        assert_eq!(store.remove_all("u1").await.unwrap(), 2);
        assert!(store.grants_for("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trip() {
        let store = SqliteGrantStore::connect("sqlite::memory:").await.unwrap();
        store.sync_catalog(&PermissionCatalog::builtin()).await.unwrap();

        assert!(store.insert(Grant::new("u1", "reports.read", "admin")).await.unwrap());
        assert!(!store.insert(Grant::new("u1", "reports.read", "admin")).await.unwrap());

        let grants = store.grants_for("u1").await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].code, "reports.read");
        assert_eq!(grants[0].granted_by, "admin");

        assert!(store.remove("u1", "reports.read").await.unwrap());
        assert!(!store.remove("u1", "reports.read").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_store_remove_all() {
        let store = SqliteGrantStore::connect("sqlite::memory:").await.unwrap();

        store.insert(Grant::new("u1", "a.read", "admin")).await.unwrap();
        store.insert(Grant::new("u1", "b.read", "admin")).await.unwrap();
        store.insert(Grant::new("u2", "a.read", "admin")).await.unwrap();

        assert_eq!(store.remove_all("u1").await.unwrap(), 2);
        assert_eq!(store.grants_for("u2").await.unwrap().len(), 1);
    }
}
