use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;

use super::{
    from_minor_units, to_minor_units, ChargeRequest, ExternalStatus, GatewayOutcome, PaymentError,
    PaymentGateway, ProductRef, ProductSpec, SubscriptionInvoice, SubscriptionRequest,
};
use crate::config::Config;
use crate::models::enrollment::PaymentProcessor;

/// Stripe REST API over form-encoded requests.
pub struct StripeGateway {
    http: Client,
    secret_key: String,
    api_base: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    customer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WithStatus {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceList {
    data: Vec<WithStatus>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    id: String,
    subscription: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    billing_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

type Form = Vec<(String, String)>;

fn field(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

impl StripeGateway {
    pub fn from_config(config: &Config, http: Client) -> Option<Self> {
        Some(Self {
            http,
            secret_key: config.stripe_secret_key.clone()?,
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, form: &Form) -> Result<T, PaymentError> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await?;
        parse(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PaymentError> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        parse(resp).await
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, PaymentError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let body: Option<ErrorBody> = resp.json().await.ok();
    Err(classify_error(status.as_u16(), body.map(|b| b.error)))
}

fn classify_error(status: u16, error: Option<StripeError>) -> PaymentError {
    let (kind, code, message) = match error {
        Some(e) => (e.kind, e.code, e.message),
        None => (None, None, None),
    };
    let message = message.unwrap_or_else(|| format!("HTTP {status}"));
    if status == 402 || kind.as_deref() == Some("card_error") {
        let reason = code.map_or(message.clone(), |c| format!("{c}: {message}"));
        return PaymentError::Declined(reason);
    }
    PaymentError::Gateway { status, message }
}

fn intent_status(status: &str) -> ExternalStatus {
    match status {
        "succeeded" => ExternalStatus::Completed,
        "processing" | "requires_action" | "requires_confirmation" | "requires_capture" => {
            ExternalStatus::Pending
        }
        "canceled" => ExternalStatus::Cancelled,
        _ => ExternalStatus::Failed,
    }
}

fn subscription_status(status: &str) -> ExternalStatus {
    match status {
        "active" | "trialing" => ExternalStatus::Completed,
        "incomplete" => ExternalStatus::Pending,
        "canceled" => ExternalStatus::Cancelled,
        _ => ExternalStatus::Failed,
    }
}

fn invoice_status(status: &str) -> ExternalStatus {
    match status {
        "paid" => ExternalStatus::Completed,
        "draft" | "open" => ExternalStatus::Pending,
        "void" => ExternalStatus::Cancelled,
        _ => ExternalStatus::Failed,
    }
}

/// Signatures older than this are refused.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>`) against the raw request body.
pub fn verify_webhook(payload: &[u8], header: &str, secret: &str, now: i64) -> Result<(), PaymentError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp =
        timestamp.ok_or_else(|| PaymentError::InvalidSignature("no timestamp".into()))?;
    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(PaymentError::InvalidSignature("timestamp outside tolerance".into()));
    }
    let signed = signatures.iter().any(|signature| {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });
    if !signed {
        return Err(PaymentError::InvalidSignature("no matching v1 signature".into()));
    }
    Ok(())
}

/// Subscription invoice carried by an `invoice.paid` or `invoice.payment_failed`
/// event. Other events, and invoices outside a subscription, yield `None`.
pub fn invoice_event(payload: &[u8]) -> Result<Option<SubscriptionInvoice>, PaymentError> {
    let event: WebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::InvalidResponse(format!("webhook event: {e}")))?;
    let paid = match event.kind.as_str() {
        "invoice.paid" => true,
        "invoice.payment_failed" => false,
        _ => return Ok(None),
    };
    let invoice: StripeInvoice = serde_json::from_value(event.data.object)
        .map_err(|e| PaymentError::InvalidResponse(format!("webhook invoice: {e}")))?;
    let Some(subscription_id) = invoice.subscription else {
        return Ok(None);
    };
    Ok(Some(SubscriptionInvoice {
        amount: from_minor_units(if paid { invoice.amount_paid } else { invoice.amount_due }),
        invoice_id: invoice.id,
        subscription_id,
        paid,
        renewal: invoice.billing_reason.as_deref() == Some("subscription_cycle"),
    }))
}

fn charge_form(req: &ChargeRequest, currency: &str) -> Result<Form, PaymentError> {
    Ok(vec![
        field("amount", to_minor_units(req.amount)?),
        field("currency", currency),
        field("customer", &req.customer_id),
        field("payment_method", &req.payment_method_id),
        field("confirm", "true"),
        field("off_session", "true"),
        field("description", &req.description),
        field("metadata[enrollment_id]", req.reference),
        field("metadata[product_id]", &req.product.product_id),
    ])
}

fn subscription_form(req: &SubscriptionRequest, currency: &str) -> Result<Form, PaymentError> {
    let mut form = vec![
        field("customer", &req.customer_id),
        field("default_payment_method", &req.payment_method_id),
        field("items[0][price_data][currency]", currency),
        field("items[0][price_data][product]", &req.product.product_id),
        field("items[0][price_data][unit_amount]", to_minor_units(req.monthly_amount)?),
        field("items[0][price_data][recurring][interval]", "month"),
        field("payment_behavior", "error_if_incomplete"),
        field("metadata[enrollment_id]", req.reference),
    ];
    if let Some(trial_end) = req.trial_end {
        form.push(field("trial_end", trial_end));
    }
    // Charged with the subscription's first invoice, even during the trial.
    if let Some(fee) = req.setup_fee.filter(|f| !f.is_zero()) {
        form.push(field("add_invoice_items[0][price_data][currency]", currency));
        form.push(field("add_invoice_items[0][price_data][product]", &req.product.product_id));
        form.push(field("add_invoice_items[0][price_data][unit_amount]", to_minor_units(fee)?));
    }
    Ok(form)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn processor(&self) -> PaymentProcessor {
        PaymentProcessor::Stripe
    }

    async fn create_customer(&self, email: &str, name: &str) -> Result<String, PaymentError> {
        let form = vec![field("email", email), field("name", name)];
        let customer: IdOnly = self.post("customers", &form).await?;
        Ok(customer.id)
    }

    async fn is_already_attached(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PaymentError> {
        let pm: StripePaymentMethod = self
            .get(&format!("payment_methods/{payment_method_id}"))
            .await?;
        Ok(pm.customer.as_deref() == Some(customer_id))
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PaymentError> {
        let _: IdOnly = self
            .post(
                &format!("payment_methods/{payment_method_id}/attach"),
                &vec![field("customer", customer_id)],
            )
            .await?;
        let _: IdOnly = self
            .post(
                &format!("customers/{customer_id}"),
                &vec![field("invoice_settings[default_payment_method]", payment_method_id)],
            )
            .await?;
        Ok(())
    }

    async fn ensure_product(&self, spec: &ProductSpec) -> Result<ProductRef, PaymentError> {
        if let Some(existing) = spec.existing.as_ref().filter(|p| !p.product_id.is_empty()) {
            return Ok(existing.clone());
        }
        let form = vec![
            field("name", &spec.name),
            field("metadata[program_id]", spec.program_id),
        ];
        let product: IdOnly = self.post("products", &form).await?;
        tracing::info!(program_id = %spec.program_id, product_id = %product.id, "created Stripe product");
        Ok(ProductRef {
            product_id: product.id,
            plan_id: None,
        })
    }

    async fn charge_once(&self, req: &ChargeRequest) -> Result<GatewayOutcome, PaymentError> {
        let intent: WithStatus = self
            .post("payment_intents", &charge_form(req, &self.currency)?)
            .await?;
        let status = intent_status(&intent.status);
        if status == ExternalStatus::Failed {
            return Err(PaymentError::Declined(format!(
                "payment intent {} ended in {}",
                intent.id, intent.status
            )));
        }
        Ok(GatewayOutcome {
            id: intent.id,
            status,
            approval_url: None,
        })
    }

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> Result<GatewayOutcome, PaymentError> {
        let sub: WithStatus = self
            .post("subscriptions", &subscription_form(req, &self.currency)?)
            .await?;
        Ok(GatewayOutcome {
            status: subscription_status(&sub.status),
            id: sub.id,
            approval_url: None,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), PaymentError> {
        let resp = self
            .http
            .delete(self.url(&format!("subscriptions/{subscription_id}")))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        let _: WithStatus = parse(resp).await?;
        Ok(())
    }

    /// Pays the subscription's open invoice with its default payment method.
    async fn collect_subscription_balance(
        &self,
        subscription_id: &str,
    ) -> Result<Option<GatewayOutcome>, PaymentError> {
        let open: InvoiceList = self
            .get(&format!("invoices?subscription={subscription_id}&status=open&limit=1"))
            .await?;
        let Some(invoice) = open.data.into_iter().next() else {
            return Ok(None);
        };
        let paid: WithStatus = self
            .post(&format!("invoices/{}/pay", invoice.id), &Vec::new())
            .await?;
        Ok(Some(GatewayOutcome {
            status: invoice_status(&paid.status),
            id: paid.id,
            approval_url: None,
        }))
    }

    /// Accepts payment intent ids as well as invoice ids (`in_...`).
    async fn fetch_charge_status(&self, transaction_id: &str) -> Result<ExternalStatus, PaymentError> {
        if transaction_id.starts_with("in_") {
            let invoice: WithStatus = self.get(&format!("invoices/{transaction_id}")).await?;
            return Ok(invoice_status(&invoice.status));
        }
        let intent: WithStatus = self.get(&format!("payment_intents/{transaction_id}")).await?;
        Ok(intent_status(&intent.status))
    }

    async fn fetch_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<ExternalStatus, PaymentError> {
        let sub: WithStatus = self.get(&format!("subscriptions/{subscription_id}")).await?;
        Ok(subscription_status(&sub.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn lookup<'a>(form: &'a Form, key: &str) -> Option<&'a str> {
        form.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn subscription_form_carries_price_and_trial() {
        let req = SubscriptionRequest {
            customer_id: "cus_1".into(),
            payment_method_id: "pm_1".into(),
            product: ProductRef { product_id: "prod_1".into(), plan_id: None },
            monthly_amount: Decimal::new(11235, 2),
            setup_fee: Some(Decimal::new(5618, 2)),
            trial_end: Some(1_700_000_000),
            reference: Uuid::nil(),
        };
        let form = subscription_form(&req, "usd").unwrap();
        assert_eq!(lookup(&form, "items[0][price_data][unit_amount]"), Some("11235"));
        assert_eq!(lookup(&form, "items[0][price_data][recurring][interval]"), Some("month"));
        assert_eq!(lookup(&form, "trial_end"), Some("1700000000"));
        assert_eq!(lookup(&form, "default_payment_method"), Some("pm_1"));
        assert_eq!(lookup(&form, "add_invoice_items[0][price_data][unit_amount]"), Some("5618"));
    }

    #[test]
    fn card_errors_are_declines() {
        let err = classify_error(
            402,
            Some(StripeError {
                kind: Some("card_error".into()),
                code: Some("card_declined".into()),
                message: Some("Your card was declined.".into()),
            }),
        );
        assert!(matches!(err, PaymentError::Declined(ref m) if m.starts_with("card_declined")));
        assert!(!err.is_retryable());

        let err = classify_error(500, None);
        assert!(err.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(intent_status("succeeded"), ExternalStatus::Completed);
        assert_eq!(intent_status("requires_action"), ExternalStatus::Pending);
        assert_eq!(intent_status("requires_payment_method"), ExternalStatus::Failed);
        assert_eq!(subscription_status("trialing"), ExternalStatus::Completed);
        assert_eq!(subscription_status("canceled"), ExternalStatus::Cancelled);
        assert_eq!(invoice_status("paid"), ExternalStatus::Completed);
        assert_eq!(invoice_status("uncollectible"), ExternalStatus::Failed);
    }

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn webhook_signature_is_checked() {
        let body = br#"{"type":"invoice.paid"}"#;
        let header = sign(body, "whsec_test", 1_700_000_000);

        assert!(verify_webhook(body, &header, "whsec_test", 1_700_000_060).is_ok());
        assert!(matches!(
            verify_webhook(body, &header, "whsec_other", 1_700_000_060),
            Err(PaymentError::InvalidSignature(_))
        ));
        assert!(verify_webhook(br#"{"type":"invoice.voided"}"#, &header, "whsec_test", 1_700_000_060).is_err());
        // Replayed an hour later.
        assert!(verify_webhook(body, &header, "whsec_test", 1_700_003_600).is_err());
        assert!(verify_webhook(body, "v1=abcd", "whsec_test", 1_700_000_000).is_err());
    }

    #[test]
    fn renewal_invoice_event_is_parsed() {
        let body = serde_json::json!({
            "type": "invoice.paid",
            "data": { "object": {
                "id": "in_1",
                "subscription": "sub_1",
                "amount_paid": 11235,
                "amount_due": 11235,
                "billing_reason": "subscription_cycle"
            }}
        })
        .to_string();
        let invoice = invoice_event(body.as_bytes()).unwrap().unwrap();
        assert_eq!(invoice.invoice_id, "in_1");
        assert_eq!(invoice.subscription_id, "sub_1");
        assert_eq!(invoice.amount, Decimal::new(11235, 2));
        assert!(invoice.paid);
        assert!(invoice.renewal);
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let body = br#"{"type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;
        assert_eq!(invoice_event(body).unwrap(), None);

        let one_off = serde_json::json!({
            "type": "invoice.payment_failed",
            "data": { "object": { "id": "in_2", "subscription": null, "amount_due": 500 } }
        })
        .to_string();
        assert_eq!(invoice_event(one_off.as_bytes()).unwrap(), None);
    }
}
