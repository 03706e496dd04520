use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::enrollment::PaymentProcessor;
use super::program::OfferingType;

/// Incomplete registrations are purged this long after creation.
pub const REGISTRATION_TTL_DAYS: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Registration {
    pub id: Uuid,
    pub location_id: Uuid,
    pub program_id: Uuid,
    pub parent_first_name: String,
    pub parent_last_name: String,
    pub parent_email: String,
    pub parent_phone: Option<String>,
    pub student_first_name: String,
    pub student_last_name: String,
    pub student_birth_date: Option<NaiveDate>,
    pub class_session_ids: Vec<Uuid>,
    pub offering_type: OfferingType,
    pub base_amount: Decimal,
    pub discount_code: Option<String>,
    pub discount_percent: Option<Decimal>,
    pub admin_fee_percent: Decimal,
    pub tax_percent: Decimal,
    pub first_payment_amount: Decimal,
    pub total_amount_due: Decimal,
    pub payment_processor: Option<PaymentProcessor>,
    pub customer_id: Option<String>,
    pub enrollment_id: Option<Uuid>,
    pub is_registration_complete: bool,
    pub is_reg_linked_with_enrollment: bool,
    pub is_user_setup: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Registration {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_registration_complete && self.expires_at <= now
    }

    pub fn parent_name(&self) -> String {
        format!("{} {}", self.parent_first_name, self.parent_last_name)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRegistrationRequest {
    pub location_id: Uuid,
    pub program_id: Uuid,
    pub parent_first_name: String,
    pub parent_last_name: String,
    pub parent_email: String,
    pub parent_phone: Option<String>,
    pub student_first_name: String,
    pub student_last_name: String,
    pub student_birth_date: Option<NaiveDate>,
    pub class_session_ids: Vec<Uuid>,
    pub discount_code: Option<String>,
    pub start_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRegistrationRequest {
    pub payment_processor: PaymentProcessor,
    pub payment_method_id: String,
    pub enrollment_date: Option<NaiveDate>,
}
