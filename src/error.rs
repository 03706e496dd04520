use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::services::discounts::DiscountError;
use crate::services::payments::PaymentError;

/// Error taxonomy shared by services and handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Too many attempts, try again in a few minutes")]
    RateLimited,
    #[error(transparent)]
    Discount(#[from] DiscountError),
    #[error("Payment failed: {0}")]
    PaymentFailed(#[from] PaymentError),
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden() -> Self {
        Self::Forbidden("Access denied".into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Discount(DiscountError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Discount(DiscountError::Expired) => StatusCode::BAD_REQUEST,
            AppError::Discount(DiscountError::ExhaustedUses) => StatusCode::CONFLICT,
            AppError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            AppError::PaymentFailed(PaymentError::InvalidSignature(_)) => StatusCode::BAD_REQUEST,
            AppError::PaymentFailed(_)
            | AppError::TransactionAborted(_)
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Discount(e) => json!({ "error": e.to_string(), "code": e.code() }),
            AppError::Database(sqlx::Error::RowNotFound) => json!({ "error": "Not found" }),
            // Internals stay in the logs; clients get a generic message.
            AppError::PaymentFailed(e @ PaymentError::InvalidSignature(_)) => {
                tracing::warn!("{e}");
                json!({ "error": "Invalid signature" })
            }
            AppError::PaymentFailed(e) => {
                tracing::error!("payment failure: {e}");
                json!({ "error": "Payment could not be processed", "retryable": e.is_retryable() })
            }
            AppError::TransactionAborted(detail) => {
                tracing::error!("transaction aborted: {detail}");
                json!({ "error": "The operation could not be completed" })
            }
            AppError::Database(e) => {
                tracing::error!("database error: {e}");
                json!({ "error": "Internal server error" })
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                json!({ "error": "Internal server error" })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
