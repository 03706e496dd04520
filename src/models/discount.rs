use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "discount_usage", rename_all = "snake_case")]
pub enum DiscountUsage {
    Single,
    Multiple,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DiscountCode {
    pub id: Uuid,
    pub code: String,
    pub description: Option<String>,
    pub percent: Decimal,
    pub usage_type: DiscountUsage,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    pub expire_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub location_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscountCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_date.is_some_and(|exp| exp <= now)
    }

    /// Uses left before the code is exhausted; `None` means unlimited.
    pub fn has_uses_remaining(&self) -> bool {
        match self.usage_type {
            DiscountUsage::Single => self.current_uses == 0,
            DiscountUsage::Multiple => self.max_uses.map_or(true, |max| self.current_uses < max),
        }
    }

    pub fn remaining_uses(&self) -> Option<i32> {
        match self.usage_type {
            DiscountUsage::Single => Some(if self.current_uses == 0 { 1 } else { 0 }),
            DiscountUsage::Multiple => self.max_uses.map(|max| (max - self.current_uses).max(0)),
        }
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now) && self.has_uses_remaining()
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Debug, Deserialize)]
pub struct CreateDiscountCodeRequest {
    /// Generated when absent.
    pub code: Option<String>,
    pub description: Option<String>,
    pub percent: Decimal,
    pub usage_type: DiscountUsage,
    pub max_uses: Option<i32>,
    pub expire_date: Option<DateTime<Utc>>,
    pub location_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDiscountCodeRequest {
    pub description: Option<String>,
    pub max_uses: Option<i32>,
    pub expire_date: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DiscountCheckRequest {
    pub code: String,
    pub location_id: Uuid,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiscountValidation {
    pub valid: bool,
    pub percent: Decimal,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiscountRedemption {
    pub id: Uuid,
    pub percent: Decimal,
    pub remaining_uses: Option<i32>,
}
