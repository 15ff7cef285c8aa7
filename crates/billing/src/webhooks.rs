//! Payment webhook handling
//!
//! Deliveries are authenticated by the gateway, then claimed in the
//! webhook ledger so concurrent or repeated deliveries of the same event
//! are processed by one caller only. A delivery that failed is released
//! as `error` and may be claimed again by the gateway's redelivery.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutEvent, PaymentGateway};
use crate::purchase::{ConfirmOutcome, PurchaseService};
use crate::store::{BillingStore, WebhookResult};

/// Claims older than this are considered abandoned and may be re-claimed
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// What a delivery did
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Blocks were credited by this delivery
    Credited { event_id: String },
    /// Checkout expired or failed; purchase closed as rejected
    Cancelled { event_id: String },
    /// Already handled, by an earlier delivery or a concurrent one
    Duplicate { event_id: String },
    /// Event type we do not act on, or a payment an operator already
    /// dismissed
    Ignored { event_id: String },
}

pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    purchases: PurchaseService,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        purchases: PurchaseService,
    ) -> Self {
        Self {
            store,
            gateway,
            purchases,
        }
    }

    /// Authenticate, decode and process one delivery
    pub async fn handle(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        let event = self.gateway.parse_webhook(payload, signature).await?;
        self.handle_event(event).await
    }

    pub async fn handle_event(&self, event: CheckoutEvent) -> BillingResult<WebhookOutcome> {
        let event_id = event.event_id().to_string();
        let event_type = match &event {
            CheckoutEvent::Completed { .. } => "checkout.completed",
            CheckoutEvent::Failed { .. } => "checkout.failed",
            CheckoutEvent::Ignored { event_type, .. } => event_type.as_str(),
        };

        if let CheckoutEvent::Ignored { .. } = event {
            tracing::debug!(
                event_id = %event_id,
                event_type = %event_type,
                provider = self.gateway.provider(),
                "Ignoring webhook event"
            );
            return Ok(WebhookOutcome::Ignored { event_id });
        }

        let stale_before = OffsetDateTime::now_utc() - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);
        let claimed = self
            .store
            .claim_webhook_event(&event_id, self.gateway.provider(), event_type, stale_before)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                e
            })?;

        if !claimed {
            let reason = match self.store.webhook_event_result(&event_id).await {
                Ok(Some(WebhookResult::Success)) => "already processed successfully",
                Ok(Some(WebhookResult::Processing)) => "currently being processed",
                Ok(_) => "unknown",
                Err(_) => "ledger lookup failed",
            };
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                reason = reason,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate { event_id });
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            provider = self.gateway.provider(),
            "Processing payment webhook event"
        );

        let result = self.process(&event_id, &event).await;

        let (ledger_result, error_message) = match &result {
            Ok(_) => (WebhookResult::Success, None),
            Err(e) => (WebhookResult::Error, Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .finish_webhook_event(&event_id, ledger_result, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event_id,
                result = ledger_result.as_str(),
                error = %e,
                "CRITICAL: Failed to record webhook result. \
                 Event may appear stuck in 'processing' until the claim times out."
            );
        }

        result
    }

    async fn process(&self, event_id: &str, event: &CheckoutEvent) -> BillingResult<WebhookOutcome> {
        let event_id = event_id.to_string();
        match event {
            CheckoutEvent::Completed { .. } => match self.purchases.confirm_checkout(event).await? {
                ConfirmOutcome::Confirmed { .. } => Ok(WebhookOutcome::Credited { event_id }),
                ConfirmOutcome::AlreadyConfirmed { .. } => {
                    Ok(WebhookOutcome::Duplicate { event_id })
                }
                ConfirmOutcome::Dismissed { .. } => Ok(WebhookOutcome::Ignored { event_id }),
            },
            CheckoutEvent::Failed { .. } => {
                self.purchases.cancel_checkout(event).await?;
                Ok(WebhookOutcome::Cancelled { event_id })
            }
            CheckoutEvent::Ignored { .. } => Err(BillingError::InvalidInput(
                "ignored events are not processed".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockService;
    use crate::config::BillingConfig;
    use crate::gateway::{signature_header, CheckoutRequest, CheckoutSession, StripeGateway, StripeGatewayConfig};
    use crate::purchase::PurchaseStatus;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    const SECRET: &str = "whsec_test_secret";

    /// Stripe parsing with a canned checkout session id
    struct StubStripe {
        inner: StripeGateway,
    }

    #[async_trait]
    impl PaymentGateway for StubStripe {
        fn provider(&self) -> &'static str {
            "stripe"
        }

        async fn create_checkout_session(
            &self,
            request: &CheckoutRequest,
        ) -> BillingResult<CheckoutSession> {
            Ok(CheckoutSession {
                session_id: "cs_test_1".into(),
                url: format!("https://checkout.stripe.test/{}", request.purchase_id),
            })
        }

        async fn parse_webhook(
            &self,
            payload: &str,
            signature: Option<&str>,
        ) -> BillingResult<CheckoutEvent> {
            self.inner.parse_webhook(payload, signature).await
        }
    }

    async fn setup() -> (Arc<InMemoryStore>, WebhookHandler, PurchaseService, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let creator_id = Uuid::new_v4();
        BlockService::new(store.clone())
            .open_account(creator_id, 0, 0)
            .await
            .unwrap();

        let gateway: Arc<dyn PaymentGateway> = Arc::new(StubStripe {
            inner: StripeGateway::new(StripeGatewayConfig {
                secret_key: "sk_test_unused".into(),
                webhook_secret: SECRET.into(),
            }),
        });
        let purchases = PurchaseService::new(
            store.clone(),
            gateway.clone(),
            Arc::new(BillingConfig::default()),
        );
        let handler = WebhookHandler::new(store.clone(), gateway, purchases.clone());
        (store, handler, purchases, creator_id)
    }

    fn completed_payload(event_id: &str, purchase_id: Uuid, amount: i64) -> String {
        serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_test_1",
                "payment_status": "paid",
                "amount_total": amount,
                "metadata": {"purchase_id": purchase_id.to_string()}
            }}
        })
        .to_string()
    }

    fn sign(payload: &str) -> String {
        signature_header(SECRET, payload, OffsetDateTime::now_utc().unix_timestamp()).unwrap()
    }

    #[tokio::test]
    async fn test_completed_webhook_credits_once() {
        let (store, handler, purchases, creator_id) = setup().await;
        let checkout = purchases.initiate_purchase(creator_id, 2).await.unwrap();
        let payload = completed_payload("evt_1", checkout.purchase_id, 200_000);

        let first = handler.handle(&payload, Some(&sign(&payload))).await.unwrap();
        assert_eq!(first, WebhookOutcome::Credited { event_id: "evt_1".into() });

        let replay = handler.handle(&payload, Some(&sign(&payload))).await.unwrap();
        assert_eq!(replay, WebhookOutcome::Duplicate { event_id: "evt_1".into() });

        // A different event for the same session is absorbed by the purchase guard
        let other = completed_payload("evt_2", checkout.purchase_id, 200_000);
        let second = handler.handle(&other, Some(&sign(&other))).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate { event_id: "evt_2".into() });

        let blocks = store.get_creator_blocks(creator_id).await.unwrap().unwrap();
        assert_eq!(blocks.purchased_blocks, 2);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let (store, handler, purchases, creator_id) = setup().await;
        let checkout = purchases.initiate_purchase(creator_id, 1).await.unwrap();
        let payload = completed_payload("evt_bad", checkout.purchase_id, 100_000);

        let err = handler
            .handle(&payload, Some("t=1,v1=deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(handler.handle(&payload, None).await.is_err());

        let purchase = store.get_purchase(checkout.purchase_id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_expired_session_cancels_purchase() {
        let (store, handler, purchases, creator_id) = setup().await;
        let checkout = purchases.initiate_purchase(creator_id, 1).await.unwrap();
        let payload = serde_json::json!({
            "id": "evt_exp",
            "type": "checkout.session.expired",
            "data": {"object": {
                "id": "cs_test_1",
                "metadata": {"purchase_id": checkout.purchase_id.to_string()}
            }}
        })
        .to_string();

        let outcome = handler.handle(&payload, Some(&sign(&payload))).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Cancelled { event_id: "evt_exp".into() });
        let purchase = store.get_purchase(checkout.purchase_id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Rejected);
    }

    #[tokio::test]
    async fn test_failed_processing_can_be_redelivered() {
        let (store, handler, _, _) = setup().await;
        let event = CheckoutEvent::Completed {
            event_id: "evt_orphan".into(),
            transaction_id: Some("cs_unknown".into()),
            purchase_id: None,
            amount_cents: None,
        };

        let err = handler.handle_event(event.clone()).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert_eq!(
            store.webhook_event_result("evt_orphan").await.unwrap(),
            Some(WebhookResult::Error)
        );

        // Redelivery is claimed again rather than treated as a duplicate
        let err = handler.handle_event(event).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unhandled_event_is_ignored() {
        let (_, handler, _, _) = setup().await;
        let payload = r#"{"id":"evt_c","type":"customer.created","data":{"object":{}}}"#;
        let outcome = handler.handle(payload, Some(&sign(payload))).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored { event_id: "evt_c".into() });
    }
}
