//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid video size: {0} GB")]
    InvalidSize(f64),

    #[error("Insufficient blocks: requested {requested}, available {available}")]
    InsufficientBlocks { requested: i64, available: i64 },

    #[error("Payment gateway error: {0}")]
    PaymentGateway(String),

    #[error("Purchase {purchase_id} requires reconciliation: {reason}")]
    ReconciliationRequired { purchase_id: Uuid, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Stable machine-readable error kind for API responses
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::InvalidSize(_) => "invalid_size",
            BillingError::InsufficientBlocks { .. } => "insufficient_blocks",
            BillingError::PaymentGateway(_) => "payment_gateway_error",
            BillingError::ReconciliationRequired { .. } => "reconciliation_required",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidTransition(_) => "invalid_transition",
            BillingError::WebhookSignatureInvalid => "webhook_signature_invalid",
            BillingError::Database(_) => "database_error",
            BillingError::Config(_) => "config_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::PaymentGateway(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::PaymentGateway(e.to_string())
    }
}
