use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::{DbErr, SqlErr};
use serde::{Deserialize, Serialize};

/// Error body returned to the request layer
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Stable machine-readable reason (e.g., "insufficient_quantity")
    pub reason: String,
    /// Human-readable error description
    pub message: String,
    /// Whether the caller may resubmit the same request
    pub retryable: bool,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Insufficient quantity: {0}")]
    InsufficientQuantity(String),

    #[error("Missing bifurcation target: {0}")]
    MissingBifurcationTarget(String),

    #[error("Duplicate invoice number: {0}")]
    DuplicateInvoiceNumber(String),

    #[error("Invoice data required: {0}")]
    InvoiceDataRequired(String),

    #[error("Inactive manufacturer: {0}")]
    InactiveManufacturer(i32),

    #[error("Order or line item not found: {0}")]
    OrderOrLineItemNotFound(String),

    #[error("Incomplete delivery: {0}")]
    IncompleteDelivery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

/// Driver messages that mean "another transaction got there first".
const CONFLICT_MARKERS: [&str; 5] = [
    "could not serialize access",
    "deadlock detected",
    "lock timeout",
    "database is locked",
    "canceling statement due to statement timeout",
];

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    ///
    /// Unique-constraint violations and serialization failures are mapped to
    /// [`ServiceError::Conflict`] so callers can tell them apart from hard failures.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        let error = error.into_db_err();
        if let Some(SqlErr::UniqueConstraintViolation(detail)) = error.sql_err() {
            return ServiceError::Conflict(detail);
        }
        let text = error.to_string().to_ascii_lowercase();
        if CONFLICT_MARKERS.iter().any(|marker| text.contains(marker)) {
            return ServiceError::Conflict(error.to_string());
        }
        ServiceError::DatabaseError(error)
    }

    /// Stable reason string for every failure, independent of the message text.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::InsufficientQuantity(_) => "insufficient_quantity",
            Self::MissingBifurcationTarget(_) => "missing_bifurcation_target",
            Self::DuplicateInvoiceNumber(_) => "duplicate_invoice_number",
            Self::InvoiceDataRequired(_) => "invoice_data_required",
            Self::InactiveManufacturer(_) => "inactive_manufacturer",
            Self::OrderOrLineItemNotFound(_) => "order_or_line_item_not_found",
            Self::IncompleteDelivery(_) => "incomplete_delivery",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Conflict(_) => "conflict",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::InternalError(_) => "internal_error",
            Self::SerializationError(_) => "serialization_error",
            Self::CacheError(_) => "cache_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// True when resubmitting the same request may succeed.
    ///
    /// The engine never retries on its own; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::DatabaseError(err) => matches!(
                err,
                DbErr::ConnectionAcquire(_) | DbErr::Conn(_)
            ),
            _ => false,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) if self.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_)
            | Self::InternalError(_)
            | Self::SerializationError(_)
            | Self::CacheError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) | Self::OrderOrLineItemNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InvalidTransition(_)
            | Self::MissingBifurcationTarget(_)
            | Self::InvoiceDataRequired(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientQuantity(_)
            | Self::InactiveManufacturer(_)
            | Self::IncompleteDelivery(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) | Self::DuplicateInvoiceNumber(_) => StatusCode::CONFLICT,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::CacheError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            reason: self.reason_code().to_string(),
            message: self.response_message(),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

pub type AppError = ServiceError;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_response_carries_reason_and_retryable_flag() {
        let response =
            ServiceError::InsufficientQuantity("line item 4 has 2".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.reason, "insufficient_quantity");
        assert!(!payload.retryable);
        assert!(payload.message.contains("line item 4"));
    }

    #[test]
    fn domain_errors_map_to_status_codes() {
        assert_eq!(
            ServiceError::InvalidTransition("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::DuplicateInvoiceNumber("F-1".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::OrderOrLineItemNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::IncompleteDelivery("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::InactiveManufacturer(7).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn serialization_failures_become_retryable_conflicts() {
        let err = ServiceError::db_error(
            "error returned from database: could not serialize access due to concurrent update",
        );
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert!(err.is_retryable());

        let err = ServiceError::db_error("syntax error at or near SELECT");
        assert!(matches!(err, ServiceError::DatabaseError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_details_are_hidden() {
        assert_eq!(
            ServiceError::db_error("relation allocations does not exist").response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::MissingBifurcationTarget("line item 3".into()).response_message(),
            "Missing bifurcation target: line item 3"
        );
    }
}
