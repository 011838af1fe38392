//! Error handling for Stratum Core.
//!
//! Every fallible operation in the crate returns [`StratumError`], a single
//! struct carrying:
//! - a stable, machine-readable [`ErrorCode`] (with numeric code, category,
//!   HTTP status and severity)
//! - a message that is safe to show to API clients
//! - an optional internal message that only reaches the logs
//! - structured [`ErrorDetails`] and the chained source error
//!
//! Constructing an error increments the `stratum_errors_total` counter.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_core::error::{ErrorContext, Result, StratumError};
//!
//! fn load(tenant: &str) -> Result<()> {
//!     read_schema(tenant).context("Failed to read tenant schema")?;
//!     Ok(())
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Tenancy Errors (1000-1099)
    SchemaMissing,
    ProvisionFailure,

    // Access Control Errors (1100-1199)
    NotFound,
    AlreadyGranted,
    Conflict,
    ProtectedResource,

    // Token Errors (1200-1299)
    TokenExpired,
    TokenNotYetValid,
    BadSignature,
    WrongIssuer,
    MalformedToken,
    InvalidRefresh,
    SigningFailure,

    // Database Errors (2000-2099)
    ConnectionFailure,
    DatabaseError,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Authentication/Authorization (4000-4099)
    Unauthorized,
    Forbidden,

    // Validation Errors (4100-4199)
    InvalidArgument,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::SchemaMissing => 1000,
            Self::ProvisionFailure => 1001,

            Self::NotFound => 1100,
            Self::AlreadyGranted => 1101,
            Self::Conflict => 1102,
            Self::ProtectedResource => 1103,

            Self::TokenExpired => 1200,
            Self::TokenNotYetValid => 1201,
            Self::BadSignature => 1202,
            Self::WrongIssuer => 1203,
            Self::MalformedToken => 1204,
            Self::InvalidRefresh => 1205,
            Self::SigningFailure => 1206,

            Self::ConnectionFailure => 2000,
            Self::DatabaseError => 2001,

            Self::SerializationError => 2200,

            Self::Unauthorized => 4000,
            Self::Forbidden => 4001,

            Self::InvalidArgument => 4100,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound | Self::SchemaMissing => StatusCode::NOT_FOUND,
            Self::AlreadyGranted | Self::Conflict => StatusCode::CONFLICT,
            Self::ProtectedResource | Self::Forbidden => StatusCode::FORBIDDEN,

            Self::TokenExpired
            | Self::TokenNotYetValid
            | Self::BadSignature
            | Self::WrongIssuer
            | Self::MalformedToken
            | Self::InvalidRefresh
            | Self::Unauthorized => StatusCode::UNAUTHORIZED,

            Self::InvalidArgument | Self::SerializationError => StatusCode::BAD_REQUEST,

            Self::ConnectionFailure => StatusCode::SERVICE_UNAVAILABLE,

            Self::ProvisionFailure
            | Self::SigningFailure
            | Self::DatabaseError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailure | Self::ProvisionFailure)
    }

    /// Get the error category.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "tenancy",
            1100..=1199 => "access_control",
            1200..=1299 => "token",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            4000..=4099 => "auth",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, missing rows, rejected tokens)
    Low,
    /// Operational issues (connection loss, provisioning retries exhausted)
    Medium,
    /// System errors (database failures, signing failures)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::NotFound
            | ErrorCode::AlreadyGranted
            | ErrorCode::Conflict
            | ErrorCode::ProtectedResource
            | ErrorCode::SchemaMissing
            | ErrorCode::TokenExpired
            | ErrorCode::TokenNotYetValid
            | ErrorCode::BadSignature
            | ErrorCode::WrongIssuer
            | ErrorCode::MalformedToken
            | ErrorCode::InvalidRefresh
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden
            | ErrorCode::InvalidArgument
            | ErrorCode::SerializationError => Self::Low,

            ErrorCode::ConnectionFailure | ErrorCode::ProvisionFailure => Self::Medium,

            ErrorCode::DatabaseError | ErrorCode::SigningFailure => Self::High,

            ErrorCode::ConfigurationError | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (group, permission, tenant...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.entity_type.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Stratum Core.
#[derive(Error, Debug)]
pub struct StratumError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for StratumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl StratumError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl fmt::Display) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.to_string();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// The permission is already attached to the group.
    pub fn already_granted(group_id: i32, permission_id: i32) -> Self {
        Self::new(
            ErrorCode::AlreadyGranted,
            "Permission is already granted to this group",
        )
        .with_context("group_id", group_id)
        .with_context("permission_id", permission_id)
    }

    /// A unique name collided with an existing row.
    pub fn conflict(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let name = name.into();
        Self::new(
            ErrorCode::Conflict,
            format!("{} already exists: {}", entity_type, name),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &name))
    }

    /// The operation would violate a system-permission or protected-group rule.
    pub fn protected(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ProtectedResource, message)
    }

    /// The tenant's schema has not been provisioned.
    pub fn schema_missing(tenant: impl Into<String>) -> Self {
        let tenant = tenant.into();
        Self::new(
            ErrorCode::SchemaMissing,
            format!("Tenant schema does not exist: {}", tenant),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("tenant", &tenant)
                .with_suggestion("Run tenant setup before using this tenant"),
        )
    }

    /// Schema provisioning failed.
    pub fn provision_failed(tenant: impl Into<String>, reason: impl Into<String>) -> Self {
        let tenant = tenant.into();
        Self::with_internal(
            ErrorCode::ProvisionFailure,
            format!("Failed to provision tenant schema: {}", tenant),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("tenant", tenant))
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// A refresh token that failed validation or belongs to another session.
    pub fn invalid_refresh(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidRefresh, message)
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Invalid configuration",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Downcast the chained source error, if it is an `E`.
    pub fn source_as<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.source.as_deref()?.downcast_ref::<E>()
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "stratum_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&StratumError> for ErrorResponse {
    fn from(error: &StratumError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for StratumError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with the given message.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| StratumError::internal(message.into()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| StratumError::new(ErrorCode::NotFound, message.into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLSTATE for unique_violation.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for foreign_key_violation.
pub(crate) const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Whether `error` is a unique-constraint violation.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

impl From<sqlx::Error> for StratumError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::NotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(UNIQUE_VIOLATION) => (
                    ErrorCode::Conflict,
                    "A record with this name already exists",
                ),
                Some(FOREIGN_KEY_VIOLATION) => (
                    ErrorCode::NotFound,
                    "A referenced record does not exist",
                ),
                _ => (ErrorCode::DatabaseError, "A database error occurred"),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => (
                ErrorCode::ConnectionFailure,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON payload",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for StratumError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for StratumError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", error))
    }
}
