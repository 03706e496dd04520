use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::enrollment::Enrollment,
    services::payments::{stripe, PaymentError},
    AppState,
};

/// Query string PayPal sends the payer back with. PayPal appends `token`
/// (the order id) or `subscription_id` for subscription approvals.
#[derive(Debug, Deserialize)]
pub struct PaypalReturnQuery {
    pub enrollment_id: Uuid,
    pub token: Option<String>,
    pub subscription_id: Option<String>,
}

impl PaypalReturnQuery {
    fn reference(&self) -> Option<&str> {
        self.subscription_id
            .as_deref()
            .or(self.token.as_deref())
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// GET /payments/paypal/success: the payer approved; settle the pending payment.
pub async fn paypal_success(
    State(state): State<AppState>,
    Query(query): Query<PaypalReturnQuery>,
) -> AppResult<Json<Enrollment>> {
    let enrollment = state
        .enrollments
        .confirm_external_payment(query.enrollment_id, Utc::now())
        .await?;
    Ok(Json(enrollment))
}

/// GET /payments/paypal/cancel: the payer backed out; drop the pending payment.
pub async fn paypal_cancel(
    State(state): State<AppState>,
    Query(query): Query<PaypalReturnQuery>,
) -> AppResult<Json<Enrollment>> {
    let reference = query
        .reference()
        .ok_or_else(|| AppError::validation("Missing PayPal token"))?;
    let enrollment = state
        .enrollments
        .cancel_external_payment(query.enrollment_id, reference, Utc::now())
        .await?;
    Ok(Json(enrollment))
}

/// POST /payments/stripe/webhook: invoices Stripe billed on a subscription.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or_else(|| AppError::not_found("Stripe webhooks are not configured"))?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| PaymentError::InvalidSignature("missing Stripe-Signature header".into()))?;
    stripe::verify_webhook(&body, signature, secret, Utc::now().timestamp())?;

    if let Some(invoice) = stripe::invoice_event(&body)? {
        state
            .enrollments
            .record_subscription_invoice(&invoice, Utc::now())
            .await?;
    }
    Ok(Json(json!({ "received": true })))
}
