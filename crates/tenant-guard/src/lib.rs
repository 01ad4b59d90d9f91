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

//! Tenant Guard: hierarchical RBAC and tiered rate limiting for
//! multi-tenant services.
//!
//! Two decision stages share one vocabulary of principals, audit events,
//! and errors:
//!
//! - [`rbac`]: ordered role hierarchy with cumulative defaults, a
//!   permission catalog with per-secretaria scopes, direct grants, and a
//!   fail-closed [`rbac::decision::AccessDecision`] stage.
//! - [`ratelimit`]: fixed-window counters over three failover tiers
//!   (shared cache, durable store, in-process) and a fail-open
//!   [`ratelimit::decision::RateLimitDecision`] stage.
//!
//! [`pipeline::RequestPipeline`] chains the two, rate limiting first by
//! default. This crate makes decisions only; extracting the principal
//! from credentials and mapping decisions onto responses belong to the
//! embedding service.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_guard::audit::TracingAuditSink;
//! use tenant_guard::pipeline::{RequestContext, RequestPipeline};
//! use tenant_guard::ratelimit::{MemoryCounterBackend, RateCounterBackend, RateLimitDecision, RouteLimit, TieredRateStore};
//! use tenant_guard::rbac::decision::{AccessDecision, Requirement};
//! use tenant_guard::rbac::catalog::PermissionCatalog;
//! use tenant_guard::rbac::grants::MemoryGrantStore;
//! use tenant_guard::rbac::resolver::PermissionResolver;
//! use tenant_guard::rbac::roles::{Principal, Role};
//!
//! # async fn demo() {
//! let audit = Arc::new(TracingAuditSink);
//! let resolver = Arc::new(PermissionResolver::new(
//!     Arc::new(PermissionCatalog::builtin()),
//!     Arc::new(MemoryGrantStore::new()),
//!     audit.clone(),
//! ));
//!
//! let backends: Vec<Arc<dyn RateCounterBackend>> = vec![Arc::new(MemoryCounterBackend::new())];
//! let store = Arc::new(TieredRateStore::new(backends));
//!
//! let pipeline = RequestPipeline::new(
//!     RateLimitDecision::new(store, audit.clone()),
//!     AccessDecision::new(resolver, audit),
//! );
//!
//! let ctx = RequestContext::anonymous("203.0.113.9", "GET", "/reports")
//!     .with_principal(Principal::new("u1", Role::Manager, "saude"));
//! let decision = pipeline
//!     .evaluate(&ctx, &Requirement::permission("reports.read"), &RouteLimit::per_minute(100))
//!     .await;
//! assert!(decision.allowed);
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod rbac;

pub use config::GuardConfig;
pub use error::{GuardError, GuardResult};
