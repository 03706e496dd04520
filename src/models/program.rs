use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::location::LocationOffering;

/// Marathon programs bill monthly, Sprint programs are paid once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "offering_type", rename_all = "snake_case")]
pub enum OfferingType {
    Marathon,
    Sprint,
}

impl OfferingType {
    pub fn is_recurring(&self) -> bool {
        matches!(self, OfferingType::Marathon)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferingType::Marathon => "marathon",
            OfferingType::Sprint => "sprint",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Program {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub offering_type: OfferingType,
    /// Full price for Sprint, monthly price for Marathon.
    pub price: Decimal,
    pub admin_fee_percent: Decimal,
    pub tax_percent: Decimal,
    pub sessions_per_week: i32,
    pub duration_weeks: Option<i32>,
    pub stripe_product_id: Option<String>,
    pub paypal_product_id: Option<String>,
    pub paypal_plan_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Price terms of a program at one location, after overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPricing {
    pub base_price: Decimal,
    pub admin_fee_percent: Decimal,
    pub tax_percent: Decimal,
}

impl Program {
    pub fn pricing_at(&self, offering: &LocationOffering) -> ResolvedPricing {
        ResolvedPricing {
            base_price: offering.price_override.unwrap_or(self.price),
            admin_fee_percent: offering
                .admin_fee_percent
                .unwrap_or(self.admin_fee_percent),
            tax_percent: offering.tax_percent.unwrap_or(self.tax_percent),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProgramModule {
    pub id: Uuid,
    pub program_id: Uuid,
    pub title: String,
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub location_id: Uuid,
    pub name: String,
    pub monthly_price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProgramRequest {
    pub name: String,
    pub description: Option<String>,
    pub offering_type: OfferingType,
    pub price: Decimal,
    pub admin_fee_percent: Option<Decimal>,
    pub tax_percent: Option<Decimal>,
    pub sessions_per_week: Option<i32>,
    pub duration_weeks: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProgramRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub admin_fee_percent: Option<Decimal>,
    pub tax_percent: Option<Decimal>,
    pub sessions_per_week: Option<i32>,
    pub duration_weeks: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateModuleRequest {
    pub title: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        Program {
            id: Uuid::new_v4(),
            name: "Robotics".into(),
            description: None,
            offering_type: OfferingType::Marathon,
            price: Decimal::new(12000, 2),
            admin_fee_percent: Decimal::new(5, 0),
            tax_percent: Decimal::new(7, 0),
            sessions_per_week: 1,
            duration_weeks: None,
            stripe_product_id: None,
            paypal_product_id: None,
            paypal_plan_id: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn location_overrides_replace_program_defaults() {
        let p = program();
        let offering = LocationOffering {
            location_id: Uuid::new_v4(),
            program_id: p.id,
            price_override: Some(Decimal::new(9900, 2)),
            admin_fee_percent: None,
            tax_percent: Some(Decimal::new(13, 0)),
            is_active: true,
        };
        let pricing = p.pricing_at(&offering);
        assert_eq!(pricing.base_price, Decimal::new(9900, 2));
        assert_eq!(pricing.admin_fee_percent, Decimal::new(5, 0));
        assert_eq!(pricing.tax_percent, Decimal::new(13, 0));
    }
}
