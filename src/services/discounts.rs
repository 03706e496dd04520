use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::discount::{
    normalize_code, CreateDiscountCodeRequest, DiscountCode, DiscountRedemption, DiscountUsage,
    DiscountValidation, UpdateDiscountCodeRequest,
};
use crate::services::metrics::DISCOUNT_REDEMPTIONS_COUNTER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DiscountError {
    #[error("Discount code not found")]
    NotFound,
    #[error("Discount code has expired")]
    Expired,
    #[error("Discount code has no uses left")]
    ExhaustedUses,
}

impl DiscountError {
    pub fn code(&self) -> &'static str {
        match self {
            DiscountError::NotFound => "not_found",
            DiscountError::Expired => "expired",
            DiscountError::ExhaustedUses => "exhausted_uses",
        }
    }
}

/// Why `code` cannot be used at `now`, if anything.
pub fn check_usable(code: &DiscountCode, now: DateTime<Utc>) -> Result<(), DiscountError> {
    if !code.is_active {
        return Err(DiscountError::NotFound);
    }
    if code.is_expired(now) {
        return Err(DiscountError::Expired);
    }
    if !code.has_uses_remaining() {
        return Err(DiscountError::ExhaustedUses);
    }
    Ok(())
}

#[async_trait]
pub trait DiscountLedger: Send + Sync {
    async fn find(&self, code: &str, location_id: Uuid) -> anyhow::Result<Option<DiscountCode>>;

    /// Increments `current_uses` only if the code is still usable at `now`.
    /// `None` means another checkout got there first.
    async fn redeem(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<Option<DiscountCode>>;

    /// Gives back one use after an aborted checkout.
    async fn restore(&self, id: Uuid) -> anyhow::Result<()>;
}

pub struct DiscountEvaluator {
    ledger: Arc<dyn DiscountLedger>,
}

impl DiscountEvaluator {
    pub fn new(ledger: Arc<dyn DiscountLedger>) -> Self {
        Self { ledger }
    }

    async fn lookup(&self, code: &str, location_id: Uuid) -> AppResult<DiscountCode> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(DiscountError::NotFound.into());
        }
        self.ledger
            .find(&code, location_id)
            .await?
            .ok_or(AppError::Discount(DiscountError::NotFound))
    }

    pub async fn validate(
        &self,
        code: &str,
        location_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<DiscountValidation> {
        let found = self.lookup(code, location_id).await?;
        check_usable(&found, now)?;
        Ok(DiscountValidation {
            valid: true,
            percent: found.percent,
            description: found.description,
        })
    }

    pub async fn apply(
        &self,
        code: &str,
        location_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<DiscountRedemption> {
        let found = self.lookup(code, location_id).await?;
        if let Err(e) = check_usable(&found, now) {
            DISCOUNT_REDEMPTIONS_COUNTER.with_label_values(&[e.code()]).inc();
            return Err(e.into());
        }

        let Some(redeemed) = self.ledger.redeem(found.id, now).await? else {
            DISCOUNT_REDEMPTIONS_COUNTER.with_label_values(&["lost_race"]).inc();
            return Err(DiscountError::ExhaustedUses.into());
        };
        DISCOUNT_REDEMPTIONS_COUNTER.with_label_values(&["ok"]).inc();
        tracing::info!(code = %redeemed.code, uses = redeemed.current_uses, "discount code redeemed");

        Ok(DiscountRedemption {
            id: redeemed.id,
            percent: redeemed.percent,
            remaining_uses: redeemed.remaining_uses(),
        })
    }

    pub async fn restore(&self, id: Uuid) {
        if let Err(e) = self.ledger.restore(id).await {
            tracing::error!(discount_id = %id, "failed to restore discount use: {e}");
        }
    }

    /// Gives back a use of the code an enrollment stored by name.
    pub async fn restore_code(&self, code: &str, location_id: Uuid) {
        match self.ledger.find(&normalize_code(code), location_id).await {
            Ok(Some(found)) => self.restore(found.id).await,
            Ok(None) => tracing::warn!(code, "discount code vanished before it could be restored"),
            Err(e) => tracing::error!(code, "failed to look up discount code for restore: {e}"),
        }
    }
}

pub struct PgDiscountLedger {
    pool: PgPool,
}

impl PgDiscountLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscountLedger for PgDiscountLedger {
    async fn find(&self, code: &str, location_id: Uuid) -> anyhow::Result<Option<DiscountCode>> {
        let found = sqlx::query_as::<_, DiscountCode>(
            "SELECT * FROM discount_codes WHERE code = $1 AND location_id = $2",
        )
        .bind(code)
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found)
    }

    async fn redeem(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<Option<DiscountCode>> {
        let redeemed = sqlx::query_as::<_, DiscountCode>(
            "UPDATE discount_codes
             SET current_uses = current_uses + 1, updated_at = NOW()
             WHERE id = $1
               AND is_active = TRUE
               AND (expire_date IS NULL OR expire_date > $2)
               AND ((usage_type = 'single' AND current_uses = 0)
                    OR (usage_type = 'multiple' AND (max_uses IS NULL OR current_uses < max_uses)))
             RETURNING *",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(redeemed)
    }

    async fn restore(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE discount_codes
             SET current_uses = GREATEST(current_uses - 1, 0), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn generate_code() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

fn map_unique(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::conflict("Discount code already exists")
        }
        _ => AppError::Database(e),
    }
}

pub struct DiscountCodeService;

impl DiscountCodeService {
    pub async fn list(pool: &PgPool, location_id: Option<Uuid>) -> AppResult<Vec<DiscountCode>> {
        let codes = sqlx::query_as::<_, DiscountCode>(
            "SELECT * FROM discount_codes
             WHERE ($1::UUID IS NULL OR location_id = $1)
             ORDER BY created_at DESC",
        )
        .bind(location_id)
        .fetch_all(pool)
        .await?;
        Ok(codes)
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> AppResult<DiscountCode> {
        sqlx::query_as::<_, DiscountCode>("SELECT * FROM discount_codes WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Discount code not found"))
    }

    pub async fn create(
        pool: &PgPool,
        location_id: Uuid,
        req: &CreateDiscountCodeRequest,
    ) -> AppResult<DiscountCode> {
        if req.percent <= Decimal::ZERO || req.percent > Decimal::ONE_HUNDRED {
            return Err(AppError::validation("percent must be greater than 0 and at most 100"));
        }
        let max_uses = match req.usage_type {
            DiscountUsage::Single => None,
            DiscountUsage::Multiple => {
                if req.max_uses.is_some_and(|m| m <= 0) {
                    return Err(AppError::validation("max_uses must be positive"));
                }
                req.max_uses
            }
        };
        let code = match req.code.as_deref().map(normalize_code) {
            Some(c) if c.is_empty() || c.len() > 32 => {
                return Err(AppError::validation("code must be 1 to 32 characters"))
            }
            Some(c) => c,
            None => generate_code(),
        };

        sqlx::query_as::<_, DiscountCode>(
            "INSERT INTO discount_codes
                (code, description, percent, usage_type, max_uses, expire_date, location_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(&code)
        .bind(&req.description)
        .bind(req.percent)
        .bind(req.usage_type)
        .bind(max_uses)
        .bind(req.expire_date)
        .bind(location_id)
        .fetch_one(pool)
        .await
        .map_err(map_unique)
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        req: &UpdateDiscountCodeRequest,
    ) -> AppResult<DiscountCode> {
        let current = Self::get(pool, id).await?;
        if let Some(max) = req.max_uses {
            if current.usage_type == DiscountUsage::Single {
                return Err(AppError::validation("Single-use codes have no max_uses"));
            }
            if max < current.current_uses.max(1) {
                return Err(AppError::validation("max_uses cannot drop below current uses"));
            }
        }

        let updated = sqlx::query_as::<_, DiscountCode>(
            "UPDATE discount_codes
             SET description = COALESCE($1, description),
                 max_uses    = COALESCE($2, max_uses),
                 expire_date = COALESCE($3, expire_date),
                 is_active   = COALESCE($4, is_active),
                 updated_at  = NOW()
             WHERE id = $5
             RETURNING *",
        )
        .bind(&req.description)
        .bind(req.max_uses)
        .bind(req.expire_date)
        .bind(req.is_active)
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(updated)
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM discount_codes WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Discount code not found"));
        }
        Ok(())
    }
}
