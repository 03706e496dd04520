use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    to_decimal_string, ChargeRequest, ExternalStatus, GatewayOutcome, PaymentError,
    PaymentGateway, ProductRef, ProductSpec, SubscriptionRequest,
};
use crate::config::Config;
use crate::models::enrollment::PaymentProcessor;
use crate::models::program::OfferingType;

/// PayPal REST API. Orders and subscriptions need buyer approval, so both
/// come back `Pending` with an approval link; the return URL settles them.
pub struct PaypalGateway {
    http: Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    return_base: String,
    currency: String,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
}

impl Resource {
    fn approval_url(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Money {
    value: String,
}

#[derive(Debug, Deserialize)]
struct BillingInfo {
    outstanding_balance: Option<Money>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetail {
    billing_info: Option<BillingInfo>,
}

impl SubscriptionDetail {
    fn outstanding(&self) -> Result<Decimal, PaymentError> {
        match self.billing_info.as_ref().and_then(|b| b.outstanding_balance.as_ref()) {
            Some(money) => money
                .value
                .parse()
                .map_err(|_| PaymentError::InvalidResponse(format!("balance {:?}", money.value))),
            None => Ok(Decimal::ZERO),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    issue: Option<String>,
}

impl PaypalGateway {
    pub fn from_config(config: &Config, http: Client) -> Option<Self> {
        Some(Self {
            http,
            client_id: config.paypal_client_id.clone()?,
            client_secret: config.paypal_client_secret.clone()?,
            api_base: config.paypal_api_base.trim_end_matches('/').to_string(),
            return_base: config.app_base_url.trim_end_matches('/').to_string(),
            currency: config.currency.to_uppercase(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    fn return_urls(&self, reference: Uuid) -> (String, String) {
        (
            format!("{}/payments/paypal/success?enrollment_id={reference}", self.return_base),
            format!("{}/payments/paypal/cancel?enrollment_id={reference}", self.return_base),
        )
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }
        let resp = self
            .http
            .post(self.url("v1/oauth2/token"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let fresh: TokenResponse = parse(resp).await?;
        // Refresh a minute early so a token never expires mid-request.
        let ttl = Duration::from_secs(fresh.expires_in.saturating_sub(60));
        *slot = Some(CachedToken {
            value: fresh.access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(fresh.access_token)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, PaymentError> {
        let token = self.access_token().await?;
        let resp = req.bearer_auth(token).send().await?;
        parse(resp).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, PaymentError> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PaymentError> {
        self.send(self.http.get(self.url(path))).await
    }

    async fn create_plan(&self, product_id: &str, spec: &ProductSpec) -> Result<String, PaymentError> {
        let body = json!({
            "product_id": product_id,
            "name": format!("{} monthly", spec.name),
            "billing_cycles": [{
                "frequency": { "interval_unit": "MONTH", "interval_count": 1 },
                "tenure_type": "REGULAR",
                "sequence": 1,
                "total_cycles": 0,
                "pricing_scheme": {
                    "fixed_price": {
                        "value": to_decimal_string(spec.monthly_amount),
                        "currency_code": self.currency,
                    }
                }
            }],
            "payment_preferences": {
                "auto_bill_outstanding": true,
                "payment_failure_threshold": 3
            }
        });
        let plan: IdOnly = self.post_json("v1/billing/plans", &body).await?;
        tracing::info!(program_id = %spec.program_id, plan_id = %plan.id, "created PayPal billing plan");
        Ok(plan.id)
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, PaymentError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let body: Option<ErrorBody> = resp.json().await.ok();
    Err(classify_error(status.as_u16(), body))
}

/// `204 No Content` responses carry no body to deserialize.
async fn expect_empty(resp: Response) -> Result<(), PaymentError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body: Option<ErrorBody> = resp.json().await.ok();
    Err(classify_error(status.as_u16(), body))
}

fn classify_error(status: u16, body: Option<ErrorBody>) -> PaymentError {
    let (name, message, issue) = match body {
        Some(b) => (
            b.name,
            b.message,
            b.details.into_iter().find_map(|d| d.issue),
        ),
        None => (None, None, None),
    };
    let message = message.unwrap_or_else(|| format!("HTTP {status}"));
    let declined = issue
        .as_deref()
        .is_some_and(|i| i.contains("DECLINED") || i == "PAYER_CANNOT_PAY");
    if status == 422 || declined {
        let reason = issue.or(name).unwrap_or_default();
        return PaymentError::Declined(format!("{reason}: {message}"));
    }
    PaymentError::Gateway { status, message }
}

fn order_status(status: &str) -> ExternalStatus {
    match status {
        "COMPLETED" => ExternalStatus::Completed,
        "VOIDED" => ExternalStatus::Cancelled,
        "CREATED" | "SAVED" | "APPROVED" | "PAYER_ACTION_REQUIRED" => ExternalStatus::Pending,
        _ => ExternalStatus::Failed,
    }
}

fn capture_status(status: &str) -> ExternalStatus {
    match status {
        "COMPLETED" => ExternalStatus::Completed,
        "PENDING" => ExternalStatus::Pending,
        _ => ExternalStatus::Failed,
    }
}

fn subscription_status(status: &str) -> ExternalStatus {
    match status {
        "ACTIVE" => ExternalStatus::Completed,
        "APPROVAL_PENDING" | "APPROVED" => ExternalStatus::Pending,
        "CANCELLED" | "EXPIRED" => ExternalStatus::Cancelled,
        _ => ExternalStatus::Failed,
    }
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn processor(&self) -> PaymentProcessor {
        PaymentProcessor::Paypal
    }

    /// PayPal has no stored customer here; the payer email identifies them.
    async fn create_customer(&self, email: &str, _name: &str) -> Result<String, PaymentError> {
        Ok(email.to_string())
    }

    async fn is_already_attached(&self, _customer_id: &str, _pm: &str) -> Result<bool, PaymentError> {
        Ok(true)
    }

    async fn attach_payment_method(&self, _customer_id: &str, _pm: &str) -> Result<(), PaymentError> {
        Ok(())
    }

    async fn ensure_product(&self, spec: &ProductSpec) -> Result<ProductRef, PaymentError> {
        let existing = spec.existing.clone().unwrap_or_default();
        let product_id = if existing.product_id.is_empty() {
            let body = json!({
                "name": spec.name,
                "type": "SERVICE",
                "category": "EDUCATIONAL_AND_TEXTBOOKS",
            });
            let product: IdOnly = self.post_json("v1/catalogs/products", &body).await?;
            tracing::info!(program_id = %spec.program_id, product_id = %product.id, "created PayPal product");
            product.id
        } else {
            existing.product_id
        };

        let plan_id = match (spec.offering_type, existing.plan_id) {
            (OfferingType::Marathon, Some(plan)) => Some(plan),
            (OfferingType::Marathon, None) => Some(self.create_plan(&product_id, spec).await?),
            (OfferingType::Sprint, _) => None,
        };
        Ok(ProductRef { product_id, plan_id })
    }

    async fn charge_once(&self, req: &ChargeRequest) -> Result<GatewayOutcome, PaymentError> {
        let (return_url, cancel_url) = self.return_urls(req.reference);
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": req.reference.to_string(),
                "description": req.description,
                "amount": {
                    "currency_code": self.currency,
                    "value": to_decimal_string(req.amount),
                }
            }],
            "payment_source": {
                "paypal": {
                    "email_address": req.customer_id,
                    "experience_context": {
                        "return_url": return_url,
                        "cancel_url": cancel_url,
                        "user_action": "PAY_NOW"
                    }
                }
            }
        });
        let order: Resource = self.post_json("v2/checkout/orders", &body).await?;
        Ok(GatewayOutcome {
            status: order_status(&order.status),
            approval_url: order.approval_url(),
            id: order.id,
        })
    }

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> Result<GatewayOutcome, PaymentError> {
        let plan_id = req
            .product
            .plan_id
            .as_deref()
            .ok_or_else(|| PaymentError::InvalidResponse("program has no PayPal plan".into()))?;
        let (return_url, cancel_url) = self.return_urls(req.reference);
        let mut body = json!({
            "plan_id": plan_id,
            "custom_id": req.reference.to_string(),
            "subscriber": { "email_address": req.customer_id },
            "plan": {
                "billing_cycles": [{
                    "sequence": 1,
                    "pricing_scheme": {
                        "fixed_price": {
                            "value": to_decimal_string(req.monthly_amount),
                            "currency_code": self.currency,
                        }
                    }
                }]
            },
            "application_context": {
                "return_url": return_url,
                "cancel_url": cancel_url,
                "user_action": "SUBSCRIBE_NOW"
            }
        });
        if let Some(start) = req.trial_end.and_then(|ts| Utc.timestamp_opt(ts, 0).single()) {
            body["start_time"] = json!(start.to_rfc3339());
        }
        if let Some(fee) = req.setup_fee.filter(|f| !f.is_zero()) {
            body["plan"]["payment_preferences"] = json!({
                "setup_fee": {
                    "value": to_decimal_string(fee),
                    "currency_code": self.currency,
                },
                "setup_fee_failure_action": "CANCEL"
            });
        }
        let sub: Resource = self.post_json("v1/billing/subscriptions", &body).await?;
        Ok(GatewayOutcome {
            status: subscription_status(&sub.status),
            approval_url: sub.approval_url(),
            id: sub.id,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), PaymentError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(self.url(&format!("v1/billing/subscriptions/{subscription_id}/cancel")))
            .bearer_auth(token)
            .json(&json!({ "reason": "Enrollment cancelled" }))
            .send()
            .await?;
        expect_empty(resp).await
    }

    /// Captures the subscription's outstanding balance against the approved agreement.
    async fn collect_subscription_balance(
        &self,
        subscription_id: &str,
    ) -> Result<Option<GatewayOutcome>, PaymentError> {
        let sub: SubscriptionDetail = self
            .get_json(&format!("v1/billing/subscriptions/{subscription_id}"))
            .await?;
        let balance = sub.outstanding()?;
        if balance <= Decimal::ZERO {
            return Ok(None);
        }
        let body = json!({
            "note": "Outstanding enrollment balance",
            "capture_type": "OUTSTANDING_BALANCE",
            "amount": {
                "currency_code": self.currency,
                "value": to_decimal_string(balance),
            }
        });
        let capture: Resource = self
            .post_json(&format!("v1/billing/subscriptions/{subscription_id}/capture"), &body)
            .await?;
        Ok(Some(GatewayOutcome {
            status: capture_status(&capture.status),
            approval_url: None,
            id: capture.id,
        }))
    }

    /// Captures an approved order, so a successful return settles the payment.
    /// Ids that are not orders are looked up as captures.
    async fn fetch_charge_status(&self, transaction_id: &str) -> Result<ExternalStatus, PaymentError> {
        let order: Resource = match self
            .get_json(&format!("v2/checkout/orders/{transaction_id}"))
            .await
        {
            Ok(order) => order,
            Err(PaymentError::Gateway { status: 404, .. }) => {
                let capture: Resource = self
                    .get_json(&format!("v2/payments/captures/{transaction_id}"))
                    .await?;
                return Ok(capture_status(&capture.status));
            }
            Err(e) => return Err(e),
        };
        if order.status != "APPROVED" {
            return Ok(order_status(&order.status));
        }
        let captured: Resource = self
            .post_json(
                &format!("v2/checkout/orders/{transaction_id}/capture"),
                &json!({}),
            )
            .await?;
        Ok(order_status(&captured.status))
    }

    async fn fetch_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<ExternalStatus, PaymentError> {
        let sub: Resource = self
            .get_json(&format!("v1/billing/subscriptions/{subscription_id}"))
            .await?;
        Ok(subscription_status(&sub.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_link_is_found() {
        let res: Resource = serde_json::from_value(json!({
            "id": "I-123",
            "status": "APPROVAL_PENDING",
            "links": [
                { "href": "https://api/self", "rel": "self" },
                { "href": "https://paypal/approve", "rel": "approve" }
            ]
        }))
        .unwrap();
        assert_eq!(res.approval_url().as_deref(), Some("https://paypal/approve"));
        assert_eq!(subscription_status(&res.status), ExternalStatus::Pending);
    }

    #[test]
    fn instrument_declined_is_a_decline() {
        let body: ErrorBody = serde_json::from_value(json!({
            "name": "UNPROCESSABLE_ENTITY",
            "message": "The requested action could not be performed",
            "details": [{ "issue": "INSTRUMENT_DECLINED" }]
        }))
        .unwrap();
        let err = classify_error(422, Some(body));
        assert!(matches!(err, PaymentError::Declined(ref m) if m.starts_with("INSTRUMENT_DECLINED")));
        assert!(classify_error(503, None).is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(order_status("COMPLETED"), ExternalStatus::Completed);
        assert_eq!(order_status("APPROVED"), ExternalStatus::Pending);
        assert_eq!(subscription_status("ACTIVE"), ExternalStatus::Completed);
        assert_eq!(subscription_status("SUSPENDED"), ExternalStatus::Failed);
        assert_eq!(capture_status("PENDING"), ExternalStatus::Pending);
        assert_eq!(capture_status("DECLINED"), ExternalStatus::Failed);
    }

    #[test]
    fn outstanding_balance_is_read() {
        let sub: SubscriptionDetail = serde_json::from_value(json!({
            "id": "I-123",
            "status": "ACTIVE",
            "billing_info": {
                "outstanding_balance": { "currency_code": "USD", "value": "112.35" }
            }
        }))
        .unwrap();
        assert_eq!(sub.outstanding().unwrap(), Decimal::new(11235, 2));

        let settled: SubscriptionDetail =
            serde_json::from_value(json!({ "id": "I-124", "status": "ACTIVE" })).unwrap();
        assert_eq!(settled.outstanding().unwrap(), Decimal::ZERO);
    }
}
