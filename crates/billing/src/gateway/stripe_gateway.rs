//! Stripe Checkout gateway
//!
//! Block purchases are one-time Checkout Sessions in `payment` mode. The
//! purchase id travels in both `client_reference_id` and metadata so the
//! webhook can be matched even if the session id was never attached.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, Currency,
};
use time::OffsetDateTime;

use super::{
    parse_purchase_id, CheckoutEvent, CheckoutRequest, CheckoutSession, PaymentGateway,
    PURCHASE_ID_METADATA_KEY,
};
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct StripeGatewayConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeGatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;
        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

pub struct StripeGateway {
    client: Client,
    config: StripeGatewayConfig,
}

impl StripeGateway {
    pub fn new(config: StripeGatewayConfig) -> Self {
        Self {
            client: Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeGatewayConfig::from_env()?))
    }
}

fn currency_from_code(code: &str) -> BillingResult<Currency> {
    match code.to_ascii_lowercase().as_str() {
        "brl" => Ok(Currency::BRL),
        "usd" => Ok(Currency::USD),
        "eur" => Ok(Currency::EUR),
        "gbp" => Ok(Currency::GBP),
        "mxn" => Ok(Currency::MXN),
        "ars" => Ok(Currency::ARS),
        other => Err(BillingError::Config(format!(
            "unsupported Stripe currency: {}",
            other
        ))),
    }
}

/// Build a `Stripe-Signature` header value for `payload`
pub fn signature_header(secret: &str, payload: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".into()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a `t=...,v1=...` signature header against `payload`.
///
/// Any of the `v1` entries may match (Stripe sends several while a secret is
/// being rolled). Comparison is constant-time.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::warn!("Webhook signature mismatch");
    Err(BillingError::WebhookSignatureInvalid)
}

#[derive(Debug, Deserialize)]
struct StripeEventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutObject {
    id: String,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    payment_status: Option<String>,
}

impl StripeCheckoutObject {
    fn purchase_id(&self) -> Option<uuid::Uuid> {
        parse_purchase_id(
            self.metadata
                .get(PURCHASE_ID_METADATA_KEY)
                .map(String::as_str)
                .or(self.client_reference_id.as_deref()),
        )
    }
}

/// Map a verified Stripe event payload to a [`CheckoutEvent`]
pub fn parse_event(payload: &str) -> BillingResult<CheckoutEvent> {
    let envelope: StripeEventEnvelope = serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse Stripe webhook JSON");
        BillingError::InvalidInput(format!("malformed webhook payload: {}", e))
    })?;

    let ignored = |envelope: &StripeEventEnvelope| CheckoutEvent::Ignored {
        event_id: envelope.id.clone(),
        event_type: envelope.event_type.clone(),
    };

    let checkout = match envelope.event_type.as_str() {
        "checkout.session.completed"
        | "checkout.session.async_payment_succeeded"
        | "checkout.session.expired"
        | "checkout.session.async_payment_failed" => {
            serde_json::from_value::<StripeCheckoutObject>(envelope.data.object.clone()).map_err(
                |e| BillingError::InvalidInput(format!("malformed checkout session: {}", e)),
            )?
        }
        _ => return Ok(ignored(&envelope)),
    };

    let event = match envelope.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            match checkout.payment_status.as_deref() {
                Some("paid") | Some("no_payment_required") | None => CheckoutEvent::Completed {
                    event_id: envelope.id.clone(),
                    purchase_id: checkout.purchase_id(),
                    amount_cents: checkout.amount_total,
                    transaction_id: Some(checkout.id),
                },
                // Delayed payment methods finish with async_payment_succeeded
                Some(_) => ignored(&envelope),
            }
        }
        "checkout.session.expired" => CheckoutEvent::Failed {
            event_id: envelope.id.clone(),
            purchase_id: checkout.purchase_id(),
            transaction_id: Some(checkout.id),
            reason: "checkout_expired".into(),
        },
        _ => CheckoutEvent::Failed {
            event_id: envelope.id.clone(),
            purchase_id: checkout.purchase_id(),
            transaction_id: Some(checkout.id),
            reason: "async_payment_failed".into(),
        },
    };
    Ok(event)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSession> {
        let currency = currency_from_code(&request.currency)?;
        let purchase_id = request.purchase_id.to_string();

        let mut metadata = HashMap::new();
        metadata.insert(PURCHASE_ID_METADATA_KEY.to_string(), purchase_id.clone());
        metadata.insert("creator_id".to_string(), request.creator_id.to_string());
        metadata.insert("blocks".to_string(), request.blocks.to_string());
        metadata.insert("checkout_type".to_string(), "storage_blocks".to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(request.amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: format!("{} storage block(s)", request.blocks),
                    description: Some(request.description.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }];

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Payment),
            line_items: Some(line_items),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            client_reference_id: Some(&purchase_id),
            metadata: Some(metadata),
            ..Default::default()
        };

        tracing::info!(
            purchase_id = %request.purchase_id,
            creator_id = %request.creator_id,
            amount_cents = request.amount_cents,
            "Creating Stripe Checkout Session for block purchase"
        );

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| {
                tracing::error!(
                    purchase_id = %request.purchase_id,
                    error = %e,
                    "Stripe Checkout Session creation failed"
                );
                BillingError::from(e)
            })?;

        let url = session.url.ok_or_else(|| {
            BillingError::PaymentGateway("Stripe returned a session without a URL".into())
        })?;

        Ok(CheckoutSession {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn parse_webhook(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> BillingResult<CheckoutEvent> {
        let signature = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
        verify_signature(
            payload,
            signature,
            &self.config.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;
        parse_event(payload)
    }
}
