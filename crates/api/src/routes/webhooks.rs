//! Payment gateway webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use reelhub_billing::WebhookOutcome;
use serde_json::{json, Value};

use crate::{error::ApiResult, state::AppState};

/// Stripe signs deliveries in this header; Mercado Pago deliveries are
/// verified by fetching the payment back instead.
const SIGNATURE_HEADERS: [&str; 2] = ["stripe-signature", "x-signature"];

fn signature(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}

/// POST /api/webhooks/payments
///
/// Any non-2xx response makes the gateway redeliver, which is how a
/// flagged credit gets retried.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature(&headers))
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, kind = e.kind(), "Payment webhook rejected");
            e
        })?;

    let (result, event_id) = match outcome {
        WebhookOutcome::Credited { event_id } => ("credited", event_id),
        WebhookOutcome::Cancelled { event_id } => ("cancelled", event_id),
        WebhookOutcome::Duplicate { event_id } => ("duplicate", event_id),
        WebhookOutcome::Ignored { event_id } => ("ignored", event_id),
    };

    Ok(Json(json!({
        "received": true,
        "result": result,
        "event_id": event_id,
    })))
}
