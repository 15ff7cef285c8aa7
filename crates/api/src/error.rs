//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use reelhub_billing::BillingError;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Malformed request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(e) => billing_status(e),
            ApiError::Auth(e) => e.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Billing(e) => e.kind(),
            ApiError::Auth(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

/// Gateways redeliver on 5xx, which retries a pending reconciliation
fn billing_status(error: &BillingError) -> StatusCode {
    match error {
        BillingError::InvalidInput(_) | BillingError::InvalidSize(_) => StatusCode::BAD_REQUEST,
        BillingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
        BillingError::InsufficientBlocks { .. } => StatusCode::CONFLICT,
        BillingError::InvalidTransition(_) => StatusCode::CONFLICT,
        BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::PaymentGateway(_) => StatusCode::BAD_GATEWAY,
        BillingError::ReconciliationRequired { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        BillingError::Database(_) | BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Auth(err) = self {
            return err.into_response();
        }

        let status = self.status();
        let message = match &self {
            ApiError::Billing(BillingError::Database(detail))
            | ApiError::Billing(BillingError::Config(detail)) => {
                tracing::error!(kind = self.kind(), error = %detail, "Internal billing failure");
                "Internal server error".to_string()
            }
            ApiError::Billing(BillingError::ReconciliationRequired { purchase_id, reason }) => {
                tracing::error!(
                    purchase_id = %purchase_id,
                    reason = %reason,
                    "Purchase needs operator reconciliation"
                );
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}
