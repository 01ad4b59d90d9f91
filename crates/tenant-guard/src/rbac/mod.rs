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

//! Hierarchical Role-Based Access Control
//!
//! - Ordered role hierarchy with cumulative defaults
//! - Permission catalog loaded as data, scoped per secretaria
//! - Direct grants with upsert semantics and audit metadata
//! - Fail-closed access decision stage

pub mod catalog;
pub mod decision;
pub mod grants;
pub mod resolver;
pub mod roles;

pub use catalog::*;
pub use decision::*;
pub use grants::{Grant, GrantStore, MemoryGrantStore, SqliteGrantStore};
pub use resolver::*;
pub use roles::*;
