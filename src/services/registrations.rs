use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::discount::normalize_code;
use crate::models::program::{OfferingType, Program, ResolvedPricing};
use crate::models::registration::{CreateRegistrationRequest, Registration, REGISTRATION_TTL_DAYS};
use crate::services::capacity::{ensure_distinct_weekdays, CapacityStore};
use crate::services::catalog::CatalogCache;
use crate::services::discounts::DiscountEvaluator;
use crate::services::enrollment::check_selection;
use crate::services::fees::{compute_first_payment_amount, compute_totals, FeeQuote};

/// Price shown at checkout: the fee breakdown plus what is charged up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutQuote {
    pub fees: FeeQuote,
    pub first_payment_amount: Decimal,
}

/// Marathon charges the pro-rated month up front, Sprint the whole total.
pub fn quote_checkout(
    pricing: ResolvedPricing,
    offering: OfferingType,
    discount_percent: Option<Decimal>,
    start_date: NaiveDate,
) -> AppResult<CheckoutQuote> {
    let fees = compute_totals(
        pricing.base_price,
        pricing.admin_fee_percent,
        pricing.tax_percent,
        discount_percent,
    )?;
    let first_payment_amount = match offering {
        OfferingType::Marathon => compute_first_payment_amount(start_date, fees.total_amount)?,
        OfferingType::Sprint => fees.total_amount,
    };
    Ok(CheckoutQuote {
        fees,
        first_payment_amount,
    })
}

fn validate_request(req: &CreateRegistrationRequest) -> AppResult<()> {
    let required = [
        ("parent_first_name", &req.parent_first_name),
        ("parent_last_name", &req.parent_last_name),
        ("student_first_name", &req.student_first_name),
        ("student_last_name", &req.student_last_name),
    ];
    if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(AppError::validation(format!("{field} is required")));
    }
    let email = req.parent_email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::validation("A valid parent_email is required"));
    }
    Ok(())
}

/// A checked registration request with its price, ready to be stored.
#[derive(Debug, Clone)]
pub struct PricedRegistration {
    pub program: Program,
    pub pricing: ResolvedPricing,
    pub discount_code: Option<String>,
    pub discount_percent: Option<Decimal>,
    pub quote: CheckoutQuote,
}

pub struct RegistrationService;

impl RegistrationService {
    /// Records a family's intent to enroll together with the quoted price.
    /// A discount code is only checked here; it is redeemed at finalization.
    pub async fn create(
        pool: &PgPool,
        catalog: &CatalogCache,
        capacity: &dyn CapacityStore,
        discounts: &DiscountEvaluator,
        req: &CreateRegistrationRequest,
        now: DateTime<Utc>,
    ) -> AppResult<Registration> {
        let PricedRegistration {
            program,
            pricing,
            discount_code,
            discount_percent,
            quote,
        } = Self::price(catalog, capacity, discounts, req, now).await?;

        let registration = sqlx::query_as::<_, Registration>(
            "INSERT INTO registrations (
                location_id, program_id, parent_first_name, parent_last_name, parent_email,
                parent_phone, student_first_name, student_last_name, student_birth_date,
                class_session_ids, offering_type, base_amount, discount_code, discount_percent,
                admin_fee_percent, tax_percent, first_payment_amount, total_amount_due,
                created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20)
             RETURNING *",
        )
        .bind(req.location_id)
        .bind(req.program_id)
        .bind(req.parent_first_name.trim())
        .bind(req.parent_last_name.trim())
        .bind(req.parent_email.trim().to_lowercase())
        .bind(&req.parent_phone)
        .bind(req.student_first_name.trim())
        .bind(req.student_last_name.trim())
        .bind(req.student_birth_date)
        .bind(&req.class_session_ids)
        .bind(program.offering_type)
        .bind(quote.fees.base_amount)
        .bind(&discount_code)
        .bind(discount_percent)
        .bind(pricing.admin_fee_percent)
        .bind(pricing.tax_percent)
        .bind(quote.first_payment_amount)
        .bind(quote.fees.total_amount)
        .bind(now)
        .bind(now + Duration::days(REGISTRATION_TTL_DAYS))
        .fetch_one(pool)
        .await?;

        tracing::info!(
            registration_id = %registration.id,
            program = %program.name,
            total = %registration.total_amount_due,
            "registration created"
        );
        Ok(registration)
    }

    /// Checks the request against the program and its sessions and prices it.
    pub async fn price(
        catalog: &CatalogCache,
        capacity: &dyn CapacityStore,
        discounts: &DiscountEvaluator,
        req: &CreateRegistrationRequest,
        now: DateTime<Utc>,
    ) -> AppResult<PricedRegistration> {
        validate_request(req)?;
        let (program, pricing) = catalog.resolve(req.location_id, req.program_id).await?;
        check_selection(&program, &req.class_session_ids)?;

        let sessions = capacity.load_sessions(&req.class_session_ids).await?;
        if sessions.len() != req.class_session_ids.len()
            || sessions.iter().any(|s| s.location_id != req.location_id)
        {
            return Err(AppError::not_found("Class session not found at this location"));
        }
        ensure_distinct_weekdays(&sessions)?;

        let discount_code = req
            .discount_code
            .as_deref()
            .map(normalize_code)
            .filter(|c| !c.is_empty());
        let discount_percent = match &discount_code {
            Some(code) => Some(discounts.validate(code, req.location_id, now).await?.percent),
            None => None,
        };

        let start_date = req.start_date.unwrap_or_else(|| now.date_naive());
        let quote = quote_checkout(pricing, program.offering_type, discount_percent, start_date)?;
        Ok(PricedRegistration {
            program,
            pricing,
            discount_code,
            discount_percent,
            quote,
        })
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> AppResult<Registration> {
        sqlx::query_as::<_, Registration>("SELECT * FROM registrations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Registration not found"))
    }

    /// Deletes incomplete registrations whose hold has lapsed. Returns how many went.
    pub async fn purge_expired(pool: &PgPool, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let purged = sqlx::query(
            "DELETE FROM registrations
             WHERE is_registration_complete = FALSE AND expires_at <= $1",
        )
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();

        if purged > 0 {
            tracing::info!("Purged {purged} expired registrations");
        }
        Ok(purged)
    }
}
