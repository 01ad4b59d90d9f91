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

//! Error taxonomy for access and rate-limit decisions

use crate::rbac::roles::Role;
use thiserror::Error;

/// Errors produced by the decision core
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("no authenticated principal on the request")]
    Unauthenticated,

    #[error("role {actual} is below the required role {required}")]
    InsufficientRole { required: Role, actual: Role },

    #[error("missing required permission: {code}")]
    InsufficientPermission { code: String },

    #[error("principal tenant does not own the target resource")]
    TenantMismatch,

    #[error("permission code is not registered in the catalog: {code}")]
    PermissionNotFound { code: String },

    #[error("backing store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },
}

impl GuardError {
    /// Get the HTTP status code equivalent for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::Unauthenticated => 401,
            GuardError::InsufficientRole { .. } => 403,
            GuardError::InsufficientPermission { .. } => 403,
            GuardError::TenantMismatch => 403,
            GuardError::PermissionNotFound { .. } => 404,
            GuardError::StoreUnavailable { .. } => 503,
            GuardError::RateLimitExceeded { .. } => 429,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            GuardError::Unauthenticated => "unauthenticated",
            GuardError::InsufficientRole { .. } => "insufficient_role",
            GuardError::InsufficientPermission { .. } => "insufficient_permission",
            GuardError::TenantMismatch => "tenant_mismatch",
            GuardError::PermissionNotFound { .. } => "permission_not_found",
            GuardError::StoreUnavailable { .. } => "store_unavailable",
            GuardError::RateLimitExceeded { .. } => "rate_limit_exceeded",
        }
    }

    /// Message safe to return across the trust boundary.
    ///
    /// Denial details (which permission, which role, which tenant) stay in
    /// the internal logs and audit trail; end users get a generic message.
    pub fn public_message(&self) -> &'static str {
        match self {
            GuardError::Unauthenticated => "authentication required",
            GuardError::RateLimitExceeded { .. } => "too many requests",
            GuardError::StoreUnavailable { .. } => "service temporarily unavailable",
            _ => "insufficient permission",
        }
    }
}

impl From<sqlx::Error> for GuardError {
    fn from(err: sqlx::Error) -> Self {
        GuardError::StoreUnavailable { message: err.to_string() }
    }
}

impl From<redis::RedisError> for GuardError {
    fn from(err: redis::RedisError) -> Self {
        GuardError::StoreUnavailable { message: err.to_string() }
    }
}

/// Result type for decision-core operations
pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GuardError::Unauthenticated.status_code(), 401);
        assert_eq!(GuardError::TenantMismatch.status_code(), 403);
        assert_eq!(GuardError::RateLimitExceeded { retry_after_ms: 1000 }.status_code(), 429);
        assert_eq!(GuardError::StoreUnavailable { message: "down".to_string() }.status_code(), 503);
    }

    #[test]
    fn test_public_message_is_generic() {
        let err = GuardError::InsufficientPermission { code: "saude.admin".to_string() };
        assert_eq!(err.public_message(), "insufficient permission");
        assert!(!err.public_message().contains("saude"));

        let err = GuardError::InsufficientRole {
            required: Role::Admin,
            actual: Role::User,
        };
        assert_eq!(err.public_message(), "insufficient permission");
    }
}
