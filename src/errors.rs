use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// External capabilities the pipeline depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Web research providers.
    Research,
    /// The structured-generation service behind the tag extractor.
    Extraction,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Research => write!(f, "research"),
            Capability::Extraction => write!(f, "extraction"),
        }
    }
}

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Unauthorized access error.
    Unauthorized(String),
    /// Retryable failure of an external capability (network, timeout, 429, 5xx).
    Transient {
        capability: Capability,
        message: String,
    },
    /// Capability-wide rejection (bad credentials, quota exhausted). Never retried.
    Permanent {
        capability: Capability,
        message: String,
    },
    /// Non-retryable rejection of one specific request.
    ExternalApiError {
        capability: Capability,
        message: String,
    },
    /// Generated output did not conform to the attribute schema.
    SchemaViolation(String),
    /// The run's cost budget would be exceeded by the next call.
    BudgetExceeded(String),
    /// The run was cancelled before the operation could complete.
    Cancelled,
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Maps a non-success HTTP status from an external capability onto the error taxonomy.
    pub fn from_status(capability: Capability, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{} returned {}: {}", capability, status, truncate(body, 300));
        match status.as_u16() {
            408 | 429 => AppError::Transient {
                capability,
                message,
            },
            401 | 402 | 403 => AppError::Permanent {
                capability,
                message,
            },
            s if s >= 500 => AppError::Transient {
                capability,
                message,
            },
            _ => AppError::ExternalApiError {
                capability,
                message,
            },
        }
    }

    /// Maps a transport-level `reqwest` failure. Decoding errors are request-specific,
    /// everything else (connect, timeout, reset) is treated as transient.
    pub fn from_reqwest(capability: Capability, err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AppError::ExternalApiError {
                capability,
                message: format!("failed to decode {} response: {}", capability, err),
            };
        }
        if let Some(status) = err.status() {
            return AppError::from_status(capability, status, &err.to_string());
        }
        AppError::Transient {
            capability,
            message: format!("{} request failed: {}", capability, err),
        }
    }

    /// The innermost error, with context layers stripped.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), AppError::Transient { .. })
    }

    /// Whether the error rejects a capability for every contact, not just this one.
    pub fn is_capability_wide(&self) -> bool {
        matches!(self.root(), AppError::Permanent { .. })
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Transient { capability, message } => {
                write!(f, "Transient {} failure: {}", capability, message)
            }
            AppError::Permanent { capability, message } => {
                write!(f, "Permanent {} failure: {}", capability, message)
            }
            AppError::ExternalApiError { capability, message } => {
                write!(f, "External {} error: {}", capability, message)
            }
            AppError::SchemaViolation(msg) => write!(f, "Schema violation: {}", msg),
            AppError::BudgetExceeded(msg) => write!(f, "Budget exceeded: {}", msg),
            AppError::Cancelled => write!(f, "Cancelled"),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    /// Logs errors appropriately based on their severity.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            AppError::Transient { .. }
            | AppError::Permanent { .. }
            | AppError::ExternalApiError { .. } => {
                tracing::error!("External service error: {}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::SchemaViolation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::BudgetExceeded(msg) => (StatusCode::PAYMENT_REQUIRED, msg.clone()),
            AppError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Operation cancelled".to_string(),
            ),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

// Make AppError cloneable for WithContext variant
impl Clone for AppError {
    /// Clones the error.
    ///
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` is flattened into
    /// `InternalError` carrying the original message.
    fn clone(&self) -> Self {
        match self {
            AppError::DatabaseError(e) => AppError::InternalError(format!("database: {}", e)),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::BadRequest(msg) => AppError::BadRequest(msg.clone()),
            AppError::Unauthorized(msg) => AppError::Unauthorized(msg.clone()),
            AppError::Transient { capability, message } => AppError::Transient {
                capability: *capability,
                message: message.clone(),
            },
            AppError::Permanent { capability, message } => AppError::Permanent {
                capability: *capability,
                message: message.clone(),
            },
            AppError::ExternalApiError { capability, message } => AppError::ExternalApiError {
                capability: *capability,
                message: message.clone(),
            },
            AppError::SchemaViolation(msg) => AppError::SchemaViolation(msg.clone()),
            AppError::BudgetExceeded(msg) => AppError::BudgetExceeded(msg.clone()),
            AppError::Cancelled => AppError::Cancelled,
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Converts a `sqlx::Error` into an `AppError`.
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(format!("JSON serialization failed: {}", err))
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let cap = Capability::Research;
        assert!(AppError::from_status(cap, reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(AppError::from_status(cap, reqwest::StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(AppError::from_status(cap, reqwest::StatusCode::UNAUTHORIZED, "").is_capability_wide());
        assert!(AppError::from_status(cap, reqwest::StatusCode::PAYMENT_REQUIRED, "").is_capability_wide());

        let rejected = AppError::from_status(cap, reqwest::StatusCode::UNPROCESSABLE_ENTITY, "bad");
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_capability_wide());
    }

    #[test]
    fn test_context_keeps_classification() {
        let err: Result<(), AppError> = Err(AppError::Transient {
            capability: Capability::Extraction,
            message: "timeout".to_string(),
        });
        let wrapped = err.context("generating tags").unwrap_err();
        assert!(wrapped.is_retryable());
        assert!(wrapped.to_string().starts_with("generating tags: "));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("ação", 2), "aç");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
