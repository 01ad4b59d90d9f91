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

//! Audit events for access decisions and grant mutations
//!
//! Sink failures must never block the primary operation: callers log the
//! failure and move on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Outcome recorded with every audit event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditOutcome {
    /// Operation succeeded
    Success,
    /// Operation failed (store error, timeout)
    Failure,
    /// Operation was denied by policy
    Denied,
}

/// Structured audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: String,

    /// Principal (or system actor) that performed the action
    pub actor: String,

    /// Action being performed (e.g. "grant", "access.check", "rate.deny")
    pub action: String,

    /// Resource the action targets
    pub resource: String,

    /// Specific resource instance, if any
    pub resource_id: Option<String>,

    /// Additional details; values must already be redacted by the caller
    pub details: HashMap<String, String>,

    /// Event outcome
    pub outcome: AuditOutcome,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(actor: impl Into<String>, action: impl Into<String>, resource: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            details: HashMap::new(),
            outcome,
            timestamp: Utc::now(),
        }
    }

    /// Set the resource instance id
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Add a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Receiver for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an event. Errors are reported to the caller so it can log
    /// them, but callers never propagate them further.
    async fn record(&self, event: AuditEvent) -> Result<(), String>;
}

/// Sink that forwards events to the tracing subscriber
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), String> {
        match event.outcome {
            AuditOutcome::Success => {
                info!(
                    actor = %event.actor,
                    action = %event.action,
                    resource = %event.resource,
                    resource_id = ?event.resource_id,
                    details = ?event.details,
                    "audit event"
                );
            }
            AuditOutcome::Failure | AuditOutcome::Denied => {
                warn!(
                    actor = %event.actor,
                    action = %event.action,
                    resource = %event.resource,
                    resource_id = ?event.resource_id,
                    outcome = ?event.outcome,
                    details = ?event.details,
                    "audit event"
                );
            }
        }
        Ok(())
    }
}

/// In-memory sink keeping the most recent events, for tests and admin views
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Create a sink keeping up to 10k events
    pub fn new() -> Self {
        Self::with_max_events(10_000)
    }

    /// Create a sink with a custom retention cap
    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }

    /// Most recent events first
    pub async fn events(&self, limit: Option<usize>) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        match limit {
            Some(limit) => events.iter().rev().take(limit).cloned().collect(),
            None => events.iter().rev().cloned().collect(),
        }
    }

    /// Events involving a specific actor
    pub async fn events_for_actor(&self, actor: &str) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events.iter().filter(|e| e.actor == actor).rev().cloned().collect()
    }

    /// Events with a specific outcome
    pub async fn events_with_outcome(&self, outcome: AuditOutcome) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events.iter().filter(|e| e.outcome == outcome).rev().cloned().collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), String> {
        let mut events = self.events.write().await;
        events.push(event);

        if events.len() > self.max_events {
            let excess = events.len() - self.max_events;
            events.drain(0..excess);
        }

        Ok(())
    }
}
