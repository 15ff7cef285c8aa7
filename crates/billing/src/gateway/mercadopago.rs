//! Mercado Pago Checkout Pro gateway
//!
//! Checkout is a payment preference whose `external_reference` is the
//! purchase id. Notifications only carry the payment id, so the payment is
//! fetched back from the API with our access token before anything is
//! trusted.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{parse_purchase_id, CheckoutEvent, CheckoutRequest, CheckoutSession, PaymentGateway};
use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.mercadopago.com";

#[derive(Debug, Clone)]
pub struct MercadoPagoConfig {
    pub access_token: String,
    pub api_base: String,
    /// Where Mercado Pago should deliver payment notifications
    pub notification_url: Option<String>,
}

impl MercadoPagoConfig {
    pub fn from_env() -> BillingResult<Self> {
        let access_token = std::env::var("MERCADOPAGO_ACCESS_TOKEN")
            .map_err(|_| BillingError::Config("MERCADOPAGO_ACCESS_TOKEN not set".into()))?;
        Ok(Self {
            access_token,
            api_base: std::env::var("MERCADOPAGO_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            notification_url: std::env::var("MERCADOPAGO_NOTIFICATION_URL").ok(),
        })
    }
}

pub struct MercadoPagoGateway {
    http: Client,
    config: MercadoPagoConfig,
}

#[derive(Debug, Serialize)]
struct PreferenceItem<'a> {
    title: String,
    description: &'a str,
    quantity: u32,
    unit_price: f64,
    currency_id: String,
}

#[derive(Debug, Serialize)]
struct BackUrls<'a> {
    success: &'a str,
    failure: &'a str,
    pending: &'a str,
}

#[derive(Debug, Serialize)]
struct PreferenceRequest<'a> {
    items: Vec<PreferenceItem<'a>>,
    external_reference: String,
    back_urls: BackUrls<'a>,
    auto_return: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: String,
}

#[derive(Debug, Deserialize)]
struct NotificationData {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    data: Option<NotificationData>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: i64,
    status: String,
    #[serde(default)]
    status_detail: Option<String>,
    #[serde(default)]
    external_reference: Option<String>,
    #[serde(default)]
    transaction_amount: Option<f64>,
}

impl MercadoPagoGateway {
    pub fn new(config: MercadoPagoConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(MercadoPagoConfig::from_env()?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn fetch_payment(&self, payment_id: &str) -> BillingResult<PaymentResponse> {
        let response = self
            .http
            .get(self.url(&format!("/v1/payments/{}", payment_id)))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BillingError::PaymentGateway(format!(
                "Mercado Pago payment lookup failed with {}",
                status
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    fn provider(&self) -> &'static str {
        "mercadopago"
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSession> {
        let body = PreferenceRequest {
            items: vec![PreferenceItem {
                title: format!("{} storage block(s)", request.blocks),
                description: &request.description,
                quantity: 1,
                unit_price: request.amount_cents as f64 / 100.0,
                currency_id: request.currency.to_uppercase(),
            }],
            external_reference: request.purchase_id.to_string(),
            back_urls: BackUrls {
                success: &request.success_url,
                failure: &request.cancel_url,
                pending: &request.success_url,
            },
            auto_return: "approved",
            notification_url: self.config.notification_url.as_deref(),
            metadata: serde_json::json!({
                "purchase_id": request.purchase_id,
                "creator_id": request.creator_id,
                "blocks": request.blocks,
            }),
        };

        tracing::info!(
            purchase_id = %request.purchase_id,
            creator_id = %request.creator_id,
            amount_cents = request.amount_cents,
            "Creating Mercado Pago preference for block purchase"
        );

        let response = self
            .http
            .post(self.url("/checkout/preferences"))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    purchase_id = %request.purchase_id,
                    error = %e,
                    "Mercado Pago preference request failed"
                );
                BillingError::from(e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                purchase_id = %request.purchase_id,
                status = %status,
                body = %text,
                "Mercado Pago rejected preference"
            );
            return Err(BillingError::PaymentGateway(format!(
                "Mercado Pago returned {}",
                status
            )));
        }

        let preference: PreferenceResponse = response.json().await?;
        Ok(CheckoutSession {
            session_id: preference.id,
            url: preference.init_point,
        })
    }

    async fn parse_webhook(
        &self,
        payload: &str,
        _signature: Option<&str>,
    ) -> BillingResult<CheckoutEvent> {
        let notification: Notification = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("malformed notification: {}", e)))?;

        let kind = notification
            .kind
            .or(notification.topic)
            .unwrap_or_default();
        let payment_id = notification.data.map(|d| match d.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });

        let payment_id = match payment_id {
            Some(id) if kind == "payment" => id,
            id => {
                return Ok(CheckoutEvent::Ignored {
                    event_id: format!("mp-{}-{}", kind, id.unwrap_or_default()),
                    event_type: kind,
                })
            }
        };

        // The id comes from an unauthenticated body and ends up in a path
        // requested with our access token
        if payment_id.is_empty() || !payment_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BillingError::InvalidInput(format!(
                "malformed payment id in notification: {:?}",
                payment_id
            )));
        }

        let payment = self.fetch_payment(&payment_id).await?;
        let event_id = format!("mp-payment-{}-{}", payment.id, payment.status);
        let purchase_id = parse_purchase_id(payment.external_reference.as_deref());

        let event = match payment.status.as_str() {
            "approved" => CheckoutEvent::Completed {
                event_id,
                transaction_id: None,
                purchase_id,
                amount_cents: payment
                    .transaction_amount
                    .map(|amount| (amount * 100.0).round() as i64),
            },
            "rejected" | "cancelled" => CheckoutEvent::Failed {
                event_id,
                transaction_id: None,
                purchase_id,
                reason: payment
                    .status_detail
                    .unwrap_or_else(|| format!("payment_{}", payment.status)),
            },
            other => CheckoutEvent::Ignored {
                event_id,
                event_type: format!("payment.{}", other),
            },
        };
        Ok(event)
    }
}
