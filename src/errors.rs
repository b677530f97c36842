//! Error handling for the PLC Logger Agent
//!
//! Central error type covering catalog validation, lookups, lifecycle
//! conflicts, connectivity to devices and SQL targets, mapping problems,
//! recoverable runtime faults inside job workers, and control-surface auth.
//! Every variant carries a stable machine-readable code used by the command
//! surface and the per-job error counters.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type
pub type AppResult<T> = Result<T, AppError>;

/// Main application error enum covering all error categories
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    // Validation Errors
    #[error("Validation failed: {field} - {message}")]
    Validation {
        field: String,
        message: String,
        code: String,
    },

    #[error("Required field missing: {field}")]
    RequiredField { field: String, code: String },

    #[error("Invalid port list: {message}")]
    InvalidPorts { message: String },

    // Not found
    #[error("Record not found: {entity} with id {id}")]
    NotFound {
        entity: String,
        id: String,
        code: String,
    },

    // Conflict / lifecycle
    #[error("Target is the default target: {id}")]
    TargetIsDefault { id: String },

    #[error("Target in use by {count} table(s): {id}")]
    TargetInUse { id: String, count: i64 },

    #[error("Gateway in use by a saved device: {id}")]
    GatewayInUse { id: String },

    #[error("Rate limited: {resource} (retry after {retry_after_ms}ms)")]
    RateLimited {
        resource: String,
        retry_after_ms: u64,
    },

    // Dependency / connectivity
    #[error("Connectivity test failed: {message}")]
    TestFailed { message: String },

    #[error("Database target unreachable: {message}")]
    DbTargetUnreachable { message: String },

    #[error("TCP connect failed: {host}:{port}")]
    TcpConnectFailed { host: String, port: u16 },

    #[error("Protocol driver missing: {protocol}")]
    ProtocolDriverMissing { protocol: String },

    // Mapping
    #[error("Mapping problem: {code} on {field}")]
    Mapping { field: String, code: String },

    // Runtime (recoverable inside workers)
    #[error("Read error: {message}")]
    ReadError { message: String },

    #[error("Write error: {message}")]
    WriteError { message: String },

    #[error("Connect failed: {message}")]
    ConnectFailed { message: String },

    // Auth
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    // Infrastructure
    #[error("Database operation failed: {message}")]
    Database { message: String },

    #[error("Secret box operation failed: {message}")]
    SecretBox { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a validation error with an explicit code
    pub fn validation(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a required-field error (code like NAME_REQUIRED)
    pub fn required(field: impl Into<String>, code: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
            code: code.into(),
        }
    }

    /// Create a not-found error with an explicit code (TABLE_NOT_FOUND, ...)
    pub fn not_found(
        entity: impl Into<String>,
        id: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
            code: code.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a permission-denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for the command surface and error counters
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code,
            Self::RequiredField { code, .. } => code,
            Self::InvalidPorts { .. } => "INVALID_PORTS",
            Self::NotFound { code, .. } => code,
            Self::TargetIsDefault { .. } => "TARGET_IS_DEFAULT",
            Self::TargetInUse { .. } => "TARGET_IN_USE",
            Self::GatewayInUse { .. } => "GATEWAY_IN_USE",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::TestFailed { .. } => "TEST_FAILED",
            Self::DbTargetUnreachable { .. } => "DB_TARGET_UNREACHABLE",
            Self::TcpConnectFailed { .. } => "TCP_CONNECT_FAILED",
            Self::ProtocolDriverMissing { .. } => "PROTOCOL_DRIVER_MISSING",
            Self::Mapping { code, .. } => code,
            Self::ReadError { .. } => "READ_ERROR",
            Self::WriteError { .. } => "WRITE_ERROR",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::SecretBox { .. } => "SECRET_BOX_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::RequiredField { .. } | Self::InvalidPorts { .. } => {
                "validation"
            }

            Self::NotFound { .. } => "not_found",

            Self::TargetIsDefault { .. }
            | Self::TargetInUse { .. }
            | Self::GatewayInUse { .. }
            | Self::RateLimited { .. } => "conflict",

            Self::TestFailed { .. }
            | Self::DbTargetUnreachable { .. }
            | Self::TcpConnectFailed { .. }
            | Self::ProtocolDriverMissing { .. } => "connectivity",

            Self::Mapping { .. } => "mapping",

            Self::ReadError { .. } | Self::WriteError { .. } | Self::ConnectFailed { .. } => {
                "runtime"
            }

            Self::PermissionDenied { .. } => "auth",

            Self::Database { .. } | Self::SecretBox { .. } | Self::Internal { .. } => "system",
        }
    }

    /// Whether a job worker should record this and keep going
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReadError { .. }
                | Self::WriteError { .. }
                | Self::ConnectFailed { .. }
                | Self::TcpConnectFailed { .. }
                | Self::DbTargetUnreachable { .. }
        )
    }

    /// Get the HTTP status code the (out-of-scope) transport should map this to
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,

            Self::Validation { .. }
            | Self::RequiredField { .. }
            | Self::InvalidPorts { .. }
            | Self::TargetIsDefault { .. }
            | Self::TargetInUse { .. }
            | Self::GatewayInUse { .. }
            | Self::TestFailed { .. }
            | Self::Mapping { .. } => 400,

            Self::PermissionDenied { .. } => 401,

            Self::RateLimited { .. } => 429,

            Self::DbTargetUnreachable { .. }
            | Self::TcpConnectFailed { .. }
            | Self::ProtocolDriverMissing { .. }
            | Self::ConnectFailed { .. } => 503,

            _ => 500,
        }
    }
}

// Implement conversions from common error types
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, Some(msg)) => {
                if code.code == rusqlite::ErrorCode::ConstraintViolation {
                    Self::Database {
                        message: format!("constraint violation: {}", msg),
                    }
                } else {
                    Self::Database {
                        message: format!("SQLite error: {}", msg),
                    }
                }
            }
            _ => Self::Database {
                message: err.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<AppError> for String {
    fn from(err: AppError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            AppError::required("name", "NAME_REQUIRED").category(),
            "validation"
        );
        assert_eq!(
            AppError::not_found("job", "job_1", "JOB_NOT_FOUND").category(),
            "not_found"
        );
        assert_eq!(
            AppError::permission_denied("missing token").category(),
            "auth"
        );
        assert_eq!(
            AppError::ReadError {
                message: "timeout".into()
            }
            .category(),
            "runtime"
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            AppError::required("name", "NAME_REQUIRED").code(),
            "NAME_REQUIRED"
        );
        assert_eq!(
            AppError::InvalidPorts { message: "0".into() }.code(),
            "INVALID_PORTS"
        );
        assert_eq!(
            AppError::RateLimited {
                resource: "gateway".into(),
                retry_after_ms: 3000
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(
            AppError::Mapping {
                field: "voltage".into(),
                code: "TAG_UNREADABLE".into()
            }
            .code(),
            "TAG_UNREADABLE"
        );
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(AppError::permission_denied("x").http_status(), 401);
        assert_eq!(
            AppError::not_found("table", "t", "TABLE_NOT_FOUND").http_status(),
            404
        );
        assert_eq!(
            AppError::RateLimited {
                resource: "gateway".into(),
                retry_after_ms: 3000
            }
            .http_status(),
            429
        );
        assert_eq!(AppError::internal("boom").http_status(), 500);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(AppError::WriteError {
            message: "target down".into()
        }
        .is_recoverable());
        assert!(!AppError::required("name", "NAME_REQUIRED").is_recoverable());
    }
}
