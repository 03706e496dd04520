use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::program::OfferingType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Active,
    Completed,
    Suspended,
    Cancelled,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Cancelled)
    }

    /// Whether an enrollment of `offering` may move from `self` to `next`.
    pub fn can_transition(&self, next: PaymentStatus, offering: OfferingType) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (Pending, Active | Completed) => true,
            (Pending, Cancelled) => true,
            (Active | Pending, Suspended) => offering.is_recurring(),
            (Active, Completed) => true,
            (Active | Suspended, Cancelled) => offering.is_recurring(),
            (Suspended, Active) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Active => "active",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Suspended => "suspended",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_processor", rename_all = "snake_case")]
pub enum PaymentProcessor {
    Stripe,
    Paypal,
}

impl PaymentProcessor {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProcessor::Stripe => "stripe",
            PaymentProcessor::Paypal => "paypal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub program_id: Uuid,
    pub location_id: Uuid,
    pub offering_type: OfferingType,
    pub class_session_ids: Vec<Uuid>,
    pub base_amount: Decimal,
    pub discount_code: Option<String>,
    pub discount_amount: Decimal,
    pub admin_fee: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub first_payment_amount: Option<Decimal>,
    pub payment_processor: PaymentProcessor,
    pub payment_status: PaymentStatus,
    pub customer_id: String,
    pub payment_method_id: String,
    pub subscription_id: Option<String>,
    pub monthly_amount: Option<Decimal>,
    pub next_payment_due: Option<DateTime<Utc>>,
    pub monthly_payment_received: bool,
    pub payment_date: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub pending_transaction_id: Option<String>,
    pub enrollment_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only payment history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct PaymentRecord {
    pub amount: Decimal,
    pub paid_at: DateTime<Utc>,
    pub status: TransactionStatus,
    pub processor: PaymentProcessor,
    pub transaction_id: Option<String>,
}

/// Everything the orchestrator has computed for an enrollment before it is persisted.
#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub id: Uuid,
    pub student_id: Option<Uuid>,
    pub program_id: Uuid,
    pub location_id: Uuid,
    pub offering_type: OfferingType,
    pub class_session_ids: Vec<Uuid>,
    pub base_amount: Decimal,
    pub discount_code: Option<String>,
    pub discount_amount: Decimal,
    pub admin_fee: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub first_payment_amount: Option<Decimal>,
    pub payment_processor: PaymentProcessor,
    pub payment_status: PaymentStatus,
    pub customer_id: String,
    pub payment_method_id: String,
    pub subscription_id: Option<String>,
    pub monthly_amount: Option<Decimal>,
    pub next_payment_due: Option<DateTime<Utc>>,
    pub payment_date: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub enrollment_date: NaiveDate,
    pub initial_payment: Option<PaymentRecord>,
}

/// What an update does to the enrollment's in-flight manual charge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PendingCharge {
    #[default]
    Keep,
    Set(String),
    Clear,
}

/// A status change plus an optional history row, applied in one transaction.
///
/// A record whose `transaction_id` matches a `pending` history row settles
/// that row instead of adding a new one.
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub record: Option<PaymentRecord>,
    pub monthly_payment_received: Option<bool>,
    pub next_payment_due: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub pending: PendingCharge,
}

impl PaymentUpdate {
    pub fn status_only(status: PaymentStatus) -> Self {
        Self {
            status,
            record: None,
            monthly_payment_received: None,
            next_payment_due: None,
            transaction_id: None,
            payment_date: None,
            pending: PendingCharge::Keep,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEnrollmentRequest {
    pub student_id: Uuid,
    pub program_id: Uuid,
    pub location_id: Uuid,
    pub class_session_ids: Vec<Uuid>,
    pub payment_processor: PaymentProcessor,
    pub payment_method_id: String,
    pub discount_code: Option<String>,
    pub enrollment_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEnrollmentRequest {
    pub next_payment_due: Option<DateTime<Utc>>,
    pub monthly_payment_received: Option<bool>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollmentListQuery {
    pub location_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
}
