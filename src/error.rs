//! Centralized error handling for better Sentry reporting and debugging.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::blob_store::BlobError;
use crate::documents::StoreError;

/// Device ids and names never go to Sentry in the clear.
pub fn hash_pii(data: &str) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Error category determines whether an error should be reported to Sentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Actual bugs that need investigation - ALWAYS report to Sentry
    Bug,
    /// Expected failures (auth, validation, not found) - never report to Sentry
    Expected,
    /// Operational issues (storage outages, timeouts) - report as warnings
    Operational,
}

/// A structured application error with full context for debugging.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// User-facing error message (sanitized)
    pub message: String,
    /// Internal error details for logging (not exposed to users)
    pub internal_message: Option<String>,
    pub operation: &'static str,
    pub category: ErrorCategory,
    pub context: Vec<(&'static str, String)>,
}

impl AppError {
    pub fn bug(operation: &'static str, internal_msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error. Please try again.".to_string(),
            internal_message: Some(internal_msg.into()),
            operation,
            category: ErrorCategory::Bug,
            context: Vec::new(),
        }
    }

    pub fn expected(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: user_msg.into(),
            internal_message: None,
            operation,
            category: ErrorCategory::Expected,
            context: Vec::new(),
        }
    }

    pub fn operational(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
        internal_msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: user_msg.into(),
            internal_message: Some(internal_msg.into()),
            operation,
            category: ErrorCategory::Operational,
            context: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn report_to_sentry(&self) {
        match self.category {
            ErrorCategory::Bug => self.capture_sentry_error(),
            ErrorCategory::Operational => self.capture_sentry_warning(),
            ErrorCategory::Expected => self.add_sentry_breadcrumb(),
        }
    }

    fn capture_sentry_error(&self) {
        tracing::error!(
            operation = self.operation,
            status = %self.status,
            error = self.internal_message.as_deref().unwrap_or(&self.message),
            "Request failed"
        );
        sentry::with_scope(
            |scope| {
                // Set fingerprint for grouping similar errors
                scope.set_fingerprint(Some(&[self.operation, self.status.as_str()]));

                for (key, value) in &self.context {
                    scope.set_extra(*key, value.clone().into());
                }

                scope.set_tag("operation", self.operation);
                scope.set_tag("status_code", self.status.as_str());
                scope.set_tag("error_category", "bug");
            },
            || {
                let msg = format!(
                    "[{}] {} - {}",
                    self.operation,
                    self.status,
                    self.internal_message.as_deref().unwrap_or(&self.message)
                );
                sentry::capture_message(&msg, sentry::Level::Error);
            },
        );
    }

    fn capture_sentry_warning(&self) {
        tracing::warn!(
            operation = self.operation,
            status = %self.status,
            error = self.internal_message.as_deref().unwrap_or(&self.message),
            "Operational failure"
        );
        sentry::with_scope(
            |scope| {
                scope.set_fingerprint(Some(&[self.operation, "operational"]));

                for (key, value) in &self.context {
                    scope.set_extra(*key, value.clone().into());
                }

                scope.set_tag("operation", self.operation);
                scope.set_tag("error_category", "operational");
            },
            || {
                let msg = format!(
                    "[{}] Operational issue: {}",
                    self.operation,
                    self.internal_message.as_deref().unwrap_or(&self.message)
                );
                sentry::capture_message(&msg, sentry::Level::Warning);
            },
        );
    }

    fn add_sentry_breadcrumb(&self) {
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("expected_error".into()),
            message: Some(format!(
                "[{}] {} - {}",
                self.operation, self.status, self.message
            )),
            level: sentry::Level::Info,
            data: self
                .context
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone().into()))
                .collect(),
            ..Default::default()
        });
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.operation, self.status, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.report_to_sentry();

        let body = Json(ErrorResponse {
            error: self.message.clone(),
            code: Some(self.operation.to_string()),
        });

        (self.status, body).into_response()
    }
}

// Convenience constructors for common error types
impl AppError {
    pub fn bad_request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::BAD_REQUEST, operation, message)
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::NOT_FOUND, operation, message)
    }

    pub fn unauthorized(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::UNAUTHORIZED, operation, message)
    }

    pub fn forbidden(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::FORBIDDEN, operation, message)
    }

    /// Request body is missing required fields. All of them are named.
    pub fn validation(operation: &'static str, missing: &[&str]) -> Self {
        Self::bad_request(
            operation,
            format!("Missing required fields: {}", missing.join(", ")),
        )
    }

    pub fn db_query(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::bug(operation, format!("Document store query failed: {err}"))
    }

    pub fn storage(
        operation: &'static str,
        err: impl fmt::Display,
        user_message: impl Into<String>,
    ) -> Self {
        Self::operational(
            StatusCode::SERVICE_UNAVAILABLE,
            operation,
            user_message,
            format!("Storage error: {err}"),
        )
    }

    pub fn internal(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::bug(operation, format!("Internal error: {err}"))
    }
}

/// Failures of the ingestion pipeline and its stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// No verified attestation or no resolved identity.
    AuthRequired,
    /// Attestation token present but not acceptable.
    Forbidden,
    /// Wire names of the missing required fields.
    Validation(Vec<&'static str>),
    NotFound,
    Transfer(String),
    Store(String),
    Cancelled,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::AuthRequired => write!(f, "attestation required"),
            PipelineError::Forbidden => write!(f, "attestation rejected"),
            PipelineError::Validation(missing) => {
                write!(f, "Missing required fields: {}", missing.join(", "))
            }
            PipelineError::NotFound => write!(f, "not found"),
            PipelineError::Transfer(msg) => write!(f, "transfer failed: {msg}"),
            PipelineError::Store(msg) => write!(f, "store failed: {msg}"),
            PipelineError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<BlobError> for PipelineError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound => PipelineError::NotFound,
            BlobError::Cancelled => PipelineError::Cancelled,
            BlobError::Transfer(msg) => PipelineError::Transfer(msg),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => PipelineError::NotFound,
            other => PipelineError::Store(other.to_string()),
        }
    }
}

impl PipelineError {
    #[must_use]
    pub fn into_app_error(self, operation: &'static str) -> AppError {
        match self {
            PipelineError::AuthRequired => {
                AppError::unauthorized(operation, "Attestation token required")
            }
            PipelineError::Forbidden => AppError::forbidden(operation, "Attestation token rejected"),
            PipelineError::Validation(missing) => AppError::validation(operation, &missing),
            PipelineError::NotFound => AppError::not_found(operation, "Not found"),
            PipelineError::Transfer(msg) => {
                AppError::storage(operation, msg, "Storage temporarily unavailable. Please retry.")
            }
            PipelineError::Cancelled => AppError::operational(
                StatusCode::SERVICE_UNAVAILABLE,
                operation,
                "Upload cancelled",
                "pipeline cancelled",
            ),
            PipelineError::Store(msg) => AppError::db_query(operation, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bug_error_has_correct_status() {
        let err = AppError::bug("test_op", "something broke");
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.category, ErrorCategory::Bug);
    }

    #[test]
    fn test_expected_error_has_correct_category() {
        let err = AppError::bad_request("test_op", "invalid input");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.category, ErrorCategory::Expected);
    }

    #[test]
    fn test_context_chaining() {
        let err = AppError::bug("test_op", "error")
            .with_context("batch_id", "abc")
            .with_context("filename", "cake.jpg");
        assert_eq!(err.context.len(), 2);
    }

    #[test]
    fn validation_lists_every_missing_field() {
        let err = AppError::validation("upload_media", &["size", "preview"]);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Missing required fields: size, preview");
    }

    #[test]
    fn pipeline_errors_map_to_http_statuses() {
        let cases = [
            (PipelineError::AuthRequired, StatusCode::UNAUTHORIZED),
            (PipelineError::Forbidden, StatusCode::FORBIDDEN),
            (PipelineError::Validation(vec!["size"]), StatusCode::BAD_REQUEST),
            (PipelineError::NotFound, StatusCode::NOT_FOUND),
            (PipelineError::Transfer("503".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::Store("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_app_error("op").status, status);
        }
    }

    #[test]
    fn blob_errors_convert_by_kind() {
        assert_eq!(PipelineError::from(BlobError::Cancelled), PipelineError::Cancelled);
        assert_eq!(PipelineError::from(BlobError::NotFound), PipelineError::NotFound);
        assert!(matches!(
            PipelineError::from(StoreError::Backend("x".into())),
            PipelineError::Store(_)
        ));
    }
}
