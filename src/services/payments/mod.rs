//! Payment gateway contract plus the Stripe and PayPal adapters.

pub mod paypal;
pub mod stripe;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::Config;
use crate::models::enrollment::PaymentProcessor;
use crate::models::program::OfferingType;
use crate::services::fees::round2;
use crate::services::metrics::PAYMENT_CALLS_COUNTER;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("gateway returned {status}: {message}")]
    Gateway { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("gateway call `{0}` timed out")]
    Timeout(&'static str),
    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
    #[error("webhook signature rejected: {0}")]
    InvalidSignature(String),
}

impl PaymentError {
    /// Whether the same call may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Timeout(_) | PaymentError::Network(_) => true,
            PaymentError::Gateway { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PaymentError::Timeout("http")
        } else if e.is_decode() {
            PaymentError::InvalidResponse(e.to_string())
        } else {
            PaymentError::Network(e.to_string())
        }
    }
}

/// State of a charge or subscription as reported by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    Completed,
    /// Waiting on the payer (PayPal approval) or the processor.
    Pending,
    Failed,
    Cancelled,
}

/// Processor-side identifiers of a program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductRef {
    pub product_id: String,
    /// Monthly billing plan, only used by processors that need one.
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProductSpec {
    pub program_id: Uuid,
    pub name: String,
    pub offering_type: OfferingType,
    pub monthly_amount: Decimal,
    /// Identifiers cached from an earlier provisioning, if any.
    pub existing: Option<ProductRef>,
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub product: ProductRef,
    pub amount: Decimal,
    pub description: String,
    /// Enrollment the charge belongs to, echoed back on return URLs.
    pub reference: Uuid,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub product: ProductRef,
    pub monthly_amount: Decimal,
    /// One-off amount collected when the subscription starts (pro-rated first month).
    pub setup_fee: Option<Decimal>,
    /// Unix seconds; monthly billing starts at this instant.
    pub trial_end: Option<i64>,
    pub reference: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOutcome {
    /// Transaction id for charges, subscription id for subscriptions.
    pub id: String,
    pub status: ExternalStatus,
    /// Where the payer must go to approve, for redirect-based processors.
    pub approval_url: Option<String>,
}

/// An invoice the processor raised on a subscription by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInvoice {
    pub invoice_id: String,
    pub subscription_id: String,
    pub amount: Decimal,
    pub paid: bool,
    /// A monthly renewal, as opposed to the invoice opened with the subscription.
    pub renewal: bool,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn processor(&self) -> PaymentProcessor;

    async fn create_customer(&self, email: &str, name: &str) -> Result<String, PaymentError>;

    async fn is_already_attached(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PaymentError>;

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PaymentError>;

    /// Returns the product (and plan) for a program, creating what is missing.
    async fn ensure_product(&self, spec: &ProductSpec) -> Result<ProductRef, PaymentError>;

    async fn charge_once(&self, req: &ChargeRequest) -> Result<GatewayOutcome, PaymentError>;

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> Result<GatewayOutcome, PaymentError>;

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), PaymentError>;

    /// Collects what a subscription currently owes. `None` when nothing is outstanding.
    async fn collect_subscription_balance(
        &self,
        subscription_id: &str,
    ) -> Result<Option<GatewayOutcome>, PaymentError>;

    async fn fetch_charge_status(&self, transaction_id: &str) -> Result<ExternalStatus, PaymentError>;

    async fn fetch_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<ExternalStatus, PaymentError>;
}

/// Amount in cents, as Stripe expects it.
pub fn to_minor_units(amount: Decimal) -> Result<i64, PaymentError> {
    (round2(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| PaymentError::InvalidResponse(format!("amount out of range: {amount}")))
}

pub fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Amount as a two-decimal string, as PayPal expects it.
pub fn to_decimal_string(amount: Decimal) -> String {
    let mut rounded = round2(amount);
    rounded.rescale(2);
    rounded.to_string()
}

/// Bounds every call of the wrapped gateway by `timeout` and records call metrics.
pub struct TimedGateway {
    inner: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl TimedGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, PaymentError>> + Send,
    ) -> Result<T, PaymentError> {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Timeout(op)),
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(PaymentError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        PAYMENT_CALLS_COUNTER
            .with_label_values(&[self.inner.processor().as_str(), op, outcome])
            .inc();
        if let Err(e) = &result {
            tracing::warn!(processor = self.inner.processor().as_str(), op, "gateway call failed: {e}");
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for TimedGateway {
    fn processor(&self) -> PaymentProcessor {
        self.inner.processor()
    }

    async fn create_customer(&self, email: &str, name: &str) -> Result<String, PaymentError> {
        self.timed("create_customer", self.inner.create_customer(email, name))
            .await
    }

    async fn is_already_attached(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PaymentError> {
        self.timed(
            "is_already_attached",
            self.inner.is_already_attached(customer_id, payment_method_id),
        )
        .await
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PaymentError> {
        self.timed(
            "attach_payment_method",
            self.inner.attach_payment_method(customer_id, payment_method_id),
        )
        .await
    }

    async fn ensure_product(&self, spec: &ProductSpec) -> Result<ProductRef, PaymentError> {
        self.timed("ensure_product", self.inner.ensure_product(spec)).await
    }

    async fn charge_once(&self, req: &ChargeRequest) -> Result<GatewayOutcome, PaymentError> {
        self.timed("charge_once", self.inner.charge_once(req)).await
    }

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> Result<GatewayOutcome, PaymentError> {
        self.timed("create_subscription", self.inner.create_subscription(req))
            .await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), PaymentError> {
        self.timed(
            "cancel_subscription",
            self.inner.cancel_subscription(subscription_id),
        )
        .await
    }

    async fn collect_subscription_balance(
        &self,
        subscription_id: &str,
    ) -> Result<Option<GatewayOutcome>, PaymentError> {
        self.timed(
            "collect_subscription_balance",
            self.inner.collect_subscription_balance(subscription_id),
        )
        .await
    }

    async fn fetch_charge_status(&self, transaction_id: &str) -> Result<ExternalStatus, PaymentError> {
        self.timed(
            "fetch_charge_status",
            self.inner.fetch_charge_status(transaction_id),
        )
        .await
    }

    async fn fetch_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<ExternalStatus, PaymentError> {
        self.timed(
            "fetch_subscription_status",
            self.inner.fetch_subscription_status(subscription_id),
        )
        .await
    }
}

/// The configured gateways, each behind a [`TimedGateway`].
#[derive(Clone, Default)]
pub struct Gateways {
    by_processor: HashMap<PaymentProcessor, Arc<dyn PaymentGateway>>,
}

impl Gateways {
    pub fn from_config(config: &Config) -> Self {
        let http = reqwest::Client::new();
        let timeout = Duration::from_secs(config.payment_timeout_secs);
        let mut gateways = Self::default();

        match stripe::StripeGateway::from_config(config, http.clone()) {
            Some(gw) => gateways.register(Arc::new(gw), timeout),
            None => tracing::warn!("Stripe not configured (STRIPE_SECRET_KEY missing)"),
        }
        match paypal::PaypalGateway::from_config(config, http) {
            Some(gw) => gateways.register(Arc::new(gw), timeout),
            None => tracing::warn!("PayPal not configured (PAYPAL_CLIENT_ID/SECRET missing)"),
        }
        gateways
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>, timeout: Duration) {
        let processor = gateway.processor();
        self.by_processor
            .insert(processor, Arc::new(TimedGateway::new(gateway, timeout)));
    }

    pub fn get(&self, processor: PaymentProcessor) -> Result<Arc<dyn PaymentGateway>, PaymentError> {
        self.by_processor
            .get(&processor)
            .cloned()
            .ok_or(PaymentError::NotConfigured(processor.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl PaymentGateway for Stalled {
        fn processor(&self) -> PaymentProcessor {
            PaymentProcessor::Stripe
        }

        async fn create_customer(&self, _: &str, _: &str) -> Result<String, PaymentError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("cus_late".into())
        }

        async fn is_already_attached(&self, _: &str, _: &str) -> Result<bool, PaymentError> {
            Ok(true)
        }

        async fn attach_payment_method(&self, _: &str, _: &str) -> Result<(), PaymentError> {
            Ok(())
        }

        async fn ensure_product(&self, _: &ProductSpec) -> Result<ProductRef, PaymentError> {
            Ok(ProductRef::default())
        }

        async fn charge_once(&self, _: &ChargeRequest) -> Result<GatewayOutcome, PaymentError> {
            Err(PaymentError::Declined("card_declined".into()))
        }

        async fn create_subscription(
            &self,
            _: &SubscriptionRequest,
        ) -> Result<GatewayOutcome, PaymentError> {
            Err(PaymentError::Gateway { status: 503, message: "unavailable".into() })
        }

        async fn cancel_subscription(&self, _: &str) -> Result<(), PaymentError> {
            Ok(())
        }

        async fn collect_subscription_balance(
            &self,
            _: &str,
        ) -> Result<Option<GatewayOutcome>, PaymentError> {
            Ok(None)
        }

        async fn fetch_charge_status(&self, _: &str) -> Result<ExternalStatus, PaymentError> {
            Ok(ExternalStatus::Completed)
        }

        async fn fetch_subscription_status(&self, _: &str) -> Result<ExternalStatus, PaymentError> {
            Ok(ExternalStatus::Completed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_becomes_retryable_timeout() {
        let gw = TimedGateway::new(Arc::new(Stalled), Duration::from_secs(20));
        let err = gw.create_customer("a@b.c", "A B").await.unwrap_err();
        assert!(matches!(err, PaymentError::Timeout("create_customer")));
        assert!(err.is_retryable());
    }

    #[test]
    fn retry_classification() {
        assert!(!PaymentError::Declined("x".into()).is_retryable());
        assert!(PaymentError::Gateway { status: 502, message: String::new() }.is_retryable());
        assert!(!PaymentError::Gateway { status: 402, message: String::new() }.is_retryable());
        assert!(!PaymentError::NotConfigured("paypal").is_retryable());
    }

    #[test]
    fn unknown_processor_is_not_configured() {
        let gateways = Gateways::default();
        assert!(matches!(
            gateways.get(PaymentProcessor::Paypal),
            Err(PaymentError::NotConfigured("paypal"))
        ));
    }

    #[test]
    fn amount_formats() {
        assert_eq!(to_minor_units(Decimal::new(11235, 2)).unwrap(), 11235);
        assert_eq!(to_minor_units(Decimal::new(1, 3)).unwrap(), 0);
        assert_eq!(to_decimal_string(Decimal::new(100, 0)), "100.00");
        assert_eq!(to_decimal_string(Decimal::new(7355, 3)), "7.36");
        assert_eq!(from_minor_units(11235), Decimal::new(11235, 2));
    }
}
