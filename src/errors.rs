use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Machine-readable rejection codes for order submission.
///
/// These are the codes a client is expected to branch on; everything else
/// in an error response is presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    EmptyCart,
    TotalMismatch,
    IncompleteAddress,
    InvalidPaymentMethod,
    MissingMobileMoneyPhone,
    UnknownProduct,
    SubmissionInFlight,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyCart => "EMPTY_CART",
            Self::TotalMismatch => "TOTAL_MISMATCH",
            Self::IncompleteAddress => "INCOMPLETE_ADDRESS",
            Self::InvalidPaymentMethod => "INVALID_PAYMENT_METHOD",
            Self::MissingMobileMoneyPhone => "MISSING_MOBILE_MONEY_PHONE",
            Self::UnknownProduct => "UNKNOWN_PRODUCT",
            Self::SubmissionInFlight => "SUBMISSION_IN_FLIGHT",
        }
    }
}

/// Standard error payload for HTTP responses.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "code": "TOTAL_MISMATCH",
    "message": "Declared total 1999 does not match computed total 2000",
    "request_id": "req-abc123",
    "timestamp": "2026-08-29T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category
    pub error: String,
    /// Machine-readable rejection code, when one applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable description
    pub message: String,
    /// Field names that failed validation, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A typed order-submission rejection; `fields` names the offending
    /// inputs when the rejection is about specific fields.
    #[error("{message}")]
    OrderRejected {
        code: RejectionCode,
        message: String,
        fields: Vec<String>,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    /// The push-payment gateway declined to start the payment; carries the
    /// gateway's own description.
    #[error("Payment could not be started: {0}")]
    GatewayDeclined(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal server error")]
    InternalServerError,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

impl ServiceError {
    pub fn rejected(code: RejectionCode, message: impl Into<String>) -> Self {
        ServiceError::OrderRejected {
            code,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn rejected_fields(
        code: RejectionCode,
        message: impl Into<String>,
        fields: Vec<String>,
    ) -> Self {
        ServiceError::OrderRejected {
            code,
            message: message.into(),
            fields,
        }
    }

    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalServerError
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::OrderRejected { .. }
            | Self::InvalidOperation(_)
            | Self::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayDeclined(_) | Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message suitable for HTTP responses. Internal errors respond
    /// generically so implementation details stay out of the wire.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::Other(_) | Self::InternalServerError => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    fn rejection_code(&self) -> Option<String> {
        match self {
            Self::OrderRejected { code, .. } => Some(code.as_str().to_string()),
            _ => None,
        }
    }

    fn rejection_fields(&self) -> Option<Vec<String>> {
        match self {
            Self::OrderRejected { fields, .. } if !fields.is_empty() => Some(fields.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.rejection_code(),
            message: self.response_message(),
            fields: self.rejection_fields(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
