//! Payment gateway abstraction
//!
//! The purchase flow only needs two things from a provider: a hosted
//! checkout page for a one-time payment, and a way to turn the provider's
//! webhook into a [`CheckoutEvent`].

pub mod mercadopago;
pub mod stripe_gateway;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub use self::mercadopago::{MercadoPagoConfig, MercadoPagoGateway};
pub use self::stripe_gateway::{signature_header, StripeGateway, StripeGatewayConfig};

/// Metadata key carrying the purchase id through the provider
pub const PURCHASE_ID_METADATA_KEY: &str = "purchase_id";

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub purchase_id: Uuid,
    pub creator_id: Uuid,
    pub blocks: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    /// Provider-side id used as the purchase's `transaction_id`
    pub session_id: String,
    pub url: String,
}

/// Normalised outcome of a provider webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutEvent {
    Completed {
        event_id: String,
        transaction_id: Option<String>,
        purchase_id: Option<Uuid>,
        amount_cents: Option<i64>,
    },
    Failed {
        event_id: String,
        transaction_id: Option<String>,
        purchase_id: Option<Uuid>,
        reason: String,
    },
    Ignored {
        event_id: String,
        event_type: String,
    },
}

impl CheckoutEvent {
    pub fn event_id(&self) -> &str {
        match self {
            CheckoutEvent::Completed { event_id, .. }
            | CheckoutEvent::Failed { event_id, .. }
            | CheckoutEvent::Ignored { event_id, .. } => event_id,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSession>;

    /// Authenticate and decode a webhook delivery
    async fn parse_webhook(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> BillingResult<CheckoutEvent>;
}

/// Which gateway handles checkouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentProvider {
    Stripe,
    MercadoPago,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::MercadoPago => "mercadopago",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(PaymentProvider::Stripe),
            "mercadopago" | "mercado_pago" => Ok(PaymentProvider::MercadoPago),
            other => Err(BillingError::Config(format!(
                "unknown payment provider: {}",
                other
            ))),
        }
    }
}

/// Build the configured gateway from its environment variables
pub fn gateway_from_env(provider: PaymentProvider) -> BillingResult<Arc<dyn PaymentGateway>> {
    let gateway: Arc<dyn PaymentGateway> = match provider {
        PaymentProvider::Stripe => Arc::new(StripeGateway::from_env()?),
        PaymentProvider::MercadoPago => Arc::new(MercadoPagoGateway::from_env()?),
    };
    tracing::info!(provider = %provider, "Payment gateway configured");
    Ok(gateway)
}

pub(crate) fn parse_purchase_id(raw: Option<&str>) -> Option<Uuid> {
    raw.and_then(|value| Uuid::parse_str(value.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_str() {
        assert_eq!("stripe".parse::<PaymentProvider>().unwrap(), PaymentProvider::Stripe);
        assert_eq!(
            " MercadoPago ".parse::<PaymentProvider>().unwrap(),
            PaymentProvider::MercadoPago
        );
        assert!("paypal".parse::<PaymentProvider>().is_err());
    }

    #[test]
    fn test_parse_purchase_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_purchase_id(Some(&id.to_string())), Some(id));
        assert_eq!(parse_purchase_id(Some("not-a-uuid")), None);
        assert_eq!(parse_purchase_id(None), None);
    }
}
