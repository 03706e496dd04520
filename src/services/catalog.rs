//! Programs, locations and their offerings, with a read-through cache for the
//! checkout path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::enrollment::PaymentProcessor;
use crate::models::location::{
    CreateLocationRequest, Location, LocationOffering, UpdateLocationRequest, UpsertOfferingRequest,
};
use crate::models::program::{
    CreateModuleRequest, CreateProgramRequest, Program, ProgramModule, ResolvedPricing,
    UpdateProgramRequest,
};
use crate::services::payments::ProductRef;

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn program(&self, id: Uuid) -> anyhow::Result<Option<Program>>;
    async fn offering(
        &self,
        location_id: Uuid,
        program_id: Uuid,
    ) -> anyhow::Result<Option<LocationOffering>>;
    async fn modules(&self, program_id: Uuid) -> anyhow::Result<Vec<ProgramModule>>;
    async fn save_product_ref(
        &self,
        program_id: Uuid,
        processor: PaymentProcessor,
        product: &ProductRef,
    ) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Cached<T> {
    value: T,
    loaded_at: Instant,
}

/// Read-through cache over a [`CatalogSource`]. Catalog writes call the
/// matching `invalidate_*`; entries older than `max_age` are reloaded anyway.
pub struct CatalogCache {
    source: Arc<dyn CatalogSource>,
    programs: DashMap<Uuid, Cached<Program>>,
    offerings: DashMap<(Uuid, Uuid), Cached<LocationOffering>>,
    modules: DashMap<Uuid, Cached<Vec<ProgramModule>>>,
    max_age: Duration,
}

impl CatalogCache {
    pub fn new(source: Arc<dyn CatalogSource>, max_age: Duration) -> Self {
        Self {
            source,
            programs: DashMap::new(),
            offerings: DashMap::new(),
            modules: DashMap::new(),
            max_age,
        }
    }

    fn fresh<T: Clone>(&self, entry: &Cached<T>) -> Option<T> {
        (entry.loaded_at.elapsed() < self.max_age).then(|| entry.value.clone())
    }

    pub async fn program(&self, id: Uuid) -> AppResult<Program> {
        if let Some(hit) = self.programs.get(&id).and_then(|e| self.fresh(&e)) {
            return Ok(hit);
        }
        let program = self
            .source
            .program(id)
            .await?
            .ok_or_else(|| AppError::not_found("Program not found"))?;
        self.programs.insert(
            id,
            Cached {
                value: program.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(program)
    }

    pub async fn offering(&self, location_id: Uuid, program_id: Uuid) -> AppResult<LocationOffering> {
        let key = (location_id, program_id);
        if let Some(hit) = self.offerings.get(&key).and_then(|e| self.fresh(&e)) {
            return Ok(hit);
        }
        let offering = self
            .source
            .offering(location_id, program_id)
            .await?
            .ok_or_else(|| AppError::not_found("Program is not offered at this location"))?;
        self.offerings.insert(
            key,
            Cached {
                value: offering.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(offering)
    }

    pub async fn modules(&self, program_id: Uuid) -> AppResult<Vec<ProgramModule>> {
        if let Some(hit) = self.modules.get(&program_id).and_then(|e| self.fresh(&e)) {
            return Ok(hit);
        }
        let modules = self.source.modules(program_id).await?;
        self.modules.insert(
            program_id,
            Cached {
                value: modules.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(modules)
    }

    /// Active program plus the prices that apply at `location_id`.
    pub async fn resolve(&self, location_id: Uuid, program_id: Uuid) -> AppResult<(Program, ResolvedPricing)> {
        let program = self.program(program_id).await?;
        if !program.is_active {
            return Err(AppError::validation("Program is not active"));
        }
        let offering = self.offering(location_id, program_id).await?;
        if !offering.is_active {
            return Err(AppError::validation("Program is not offered at this location"));
        }
        let pricing = program.pricing_at(&offering);
        Ok((program, pricing))
    }

    pub async fn record_product_ref(
        &self,
        program_id: Uuid,
        processor: PaymentProcessor,
        product: &ProductRef,
    ) -> AppResult<()> {
        self.source
            .save_product_ref(program_id, processor, product)
            .await?;
        self.invalidate_program(program_id);
        Ok(())
    }

    pub fn invalidate_program(&self, program_id: Uuid) {
        self.programs.remove(&program_id);
        self.modules.remove(&program_id);
        self.offerings.retain(|(_, program), _| *program != program_id);
    }

    pub fn invalidate_offering(&self, location_id: Uuid, program_id: Uuid) {
        self.offerings.remove(&(location_id, program_id));
    }

    pub fn invalidate_location(&self, location_id: Uuid) {
        self.offerings.retain(|(location, _), _| *location != location_id);
    }
}

/// Product identifiers already provisioned for `program` at `processor`.
pub fn existing_product_ref(program: &Program, processor: PaymentProcessor) -> Option<ProductRef> {
    match processor {
        PaymentProcessor::Stripe => program.stripe_product_id.clone().map(|product_id| ProductRef {
            product_id,
            plan_id: None,
        }),
        PaymentProcessor::Paypal => program.paypal_product_id.clone().map(|product_id| ProductRef {
            product_id,
            plan_id: program.paypal_plan_id.clone(),
        }),
    }
}

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    async fn program(&self, id: Uuid) -> anyhow::Result<Option<Program>> {
        let program = sqlx::query_as::<_, Program>("SELECT * FROM programs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(program)
    }

    async fn offering(
        &self,
        location_id: Uuid,
        program_id: Uuid,
    ) -> anyhow::Result<Option<LocationOffering>> {
        let offering = sqlx::query_as::<_, LocationOffering>(
            "SELECT * FROM location_offerings WHERE location_id = $1 AND program_id = $2",
        )
        .bind(location_id)
        .bind(program_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(offering)
    }

    async fn modules(&self, program_id: Uuid) -> anyhow::Result<Vec<ProgramModule>> {
        let modules = sqlx::query_as::<_, ProgramModule>(
            "SELECT * FROM program_modules WHERE program_id = $1 ORDER BY position",
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(modules)
    }

    async fn save_product_ref(
        &self,
        program_id: Uuid,
        processor: PaymentProcessor,
        product: &ProductRef,
    ) -> anyhow::Result<()> {
        match processor {
            PaymentProcessor::Stripe => {
                sqlx::query(
                    "UPDATE programs SET stripe_product_id = $1, updated_at = NOW() WHERE id = $2",
                )
                .bind(&product.product_id)
                .bind(program_id)
                .execute(&self.pool)
                .await?;
            }
            PaymentProcessor::Paypal => {
                sqlx::query(
                    "UPDATE programs
                     SET paypal_product_id = $1, paypal_plan_id = $2, updated_at = NOW()
                     WHERE id = $3",
                )
                .bind(&product.product_id)
                .bind(&product.plan_id)
                .bind(program_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

fn check_percent(value: Option<rust_decimal::Decimal>) -> AppResult<()> {
    use rust_decimal::Decimal;
    if value.is_some_and(|v| v < Decimal::ZERO || v > Decimal::ONE_HUNDRED) {
        return Err(AppError::validation("Percentages must be between 0 and 100"));
    }
    Ok(())
}

fn map_unique(e: sqlx::Error, what: &str) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::conflict(format!("{what} already exists"))
        }
        _ => AppError::Database(e),
    }
}

pub struct ProgramService;

impl ProgramService {
    pub async fn list(pool: &PgPool) -> AppResult<Vec<Program>> {
        let programs = sqlx::query_as::<_, Program>("SELECT * FROM programs ORDER BY name")
            .fetch_all(pool)
            .await?;
        Ok(programs)
    }

    pub async fn create(pool: &PgPool, req: &CreateProgramRequest) -> AppResult<Program> {
        if req.name.trim().is_empty() {
            return Err(AppError::validation("name is required"));
        }
        if req.price < rust_decimal::Decimal::ZERO {
            return Err(AppError::validation("price cannot be negative"));
        }
        check_percent(req.admin_fee_percent)?;
        check_percent(req.tax_percent)?;
        if req.sessions_per_week.is_some_and(|n| !(1..=7).contains(&n)) {
            return Err(AppError::validation("sessions_per_week must be between 1 and 7"));
        }

        sqlx::query_as::<_, Program>(
            "INSERT INTO programs
                (name, description, offering_type, price, admin_fee_percent, tax_percent,
                 sessions_per_week, duration_weeks)
             VALUES ($1, $2, $3, $4, COALESCE($5, 0), COALESCE($6, 0), COALESCE($7, 1), $8)
             RETURNING *",
        )
        .bind(req.name.trim())
        .bind(&req.description)
        .bind(req.offering_type)
        .bind(req.price)
        .bind(req.admin_fee_percent)
        .bind(req.tax_percent)
        .bind(req.sessions_per_week)
        .bind(req.duration_weeks)
        .fetch_one(pool)
        .await
        .map_err(|e| map_unique(e, "Program"))
    }

    pub async fn update(pool: &PgPool, id: Uuid, req: &UpdateProgramRequest) -> AppResult<Program> {
        check_percent(req.admin_fee_percent)?;
        check_percent(req.tax_percent)?;
        if req.price.is_some_and(|p| p < rust_decimal::Decimal::ZERO) {
            return Err(AppError::validation("price cannot be negative"));
        }
        if req.sessions_per_week.is_some_and(|n| !(1..=7).contains(&n)) {
            return Err(AppError::validation("sessions_per_week must be between 1 and 7"));
        }

        sqlx::query_as::<_, Program>(
            "UPDATE programs
             SET name              = COALESCE($1, name),
                 description       = COALESCE($2, description),
                 price             = COALESCE($3, price),
                 admin_fee_percent = COALESCE($4, admin_fee_percent),
                 tax_percent       = COALESCE($5, tax_percent),
                 sessions_per_week = COALESCE($6, sessions_per_week),
                 duration_weeks    = COALESCE($7, duration_weeks),
                 is_active         = COALESCE($8, is_active),
                 updated_at        = NOW()
             WHERE id = $9
             RETURNING *",
        )
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.price)
        .bind(req.admin_fee_percent)
        .bind(req.tax_percent)
        .bind(req.sessions_per_week)
        .bind(req.duration_weeks)
        .bind(req.is_active)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| map_unique(e, "Program"))?
        .ok_or_else(|| AppError::not_found("Program not found"))
    }

    /// Adds a module with its topics at the end of the program.
    pub async fn add_module(
        pool: &PgPool,
        program_id: Uuid,
        req: &CreateModuleRequest,
    ) -> AppResult<ProgramModule> {
        if req.title.trim().is_empty() {
            return Err(AppError::validation("title is required"));
        }
        let mut tx = pool.begin().await?;
        let module = sqlx::query_as::<_, ProgramModule>(
            "INSERT INTO program_modules (program_id, title, position)
             SELECT $1, $2, COALESCE(MAX(position) + 1, 0) FROM program_modules WHERE program_id = $1
             RETURNING *",
        )
        .bind(program_id)
        .bind(req.title.trim())
        .fetch_one(&mut *tx)
        .await?;

        for (position, title) in req.topics.iter().enumerate() {
            sqlx::query("INSERT INTO module_topics (module_id, title, position) VALUES ($1, $2, $3)")
                .bind(module.id)
                .bind(title)
                .bind(position as i32)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(module)
    }
}

pub struct LocationService;

impl LocationService {
    pub async fn list(pool: &PgPool) -> AppResult<Vec<Location>> {
        let locations = sqlx::query_as::<_, Location>("SELECT * FROM locations ORDER BY name")
            .fetch_all(pool)
            .await?;
        Ok(locations)
    }

    pub async fn create(pool: &PgPool, req: &CreateLocationRequest) -> AppResult<Location> {
        if req.name.trim().is_empty() {
            return Err(AppError::validation("name is required"));
        }
        let location = sqlx::query_as::<_, Location>(
            "INSERT INTO locations (name, address, phone, email)
             VALUES ($1, COALESCE($2, ''), $3, $4)
             RETURNING *",
        )
        .bind(req.name.trim())
        .bind(&req.address)
        .bind(&req.phone)
        .bind(&req.email)
        .fetch_one(pool)
        .await?;
        Ok(location)
    }

    pub async fn update(pool: &PgPool, id: Uuid, req: &UpdateLocationRequest) -> AppResult<Location> {
        sqlx::query_as::<_, Location>(
            "UPDATE locations
             SET name       = COALESCE($1, name),
                 address    = COALESCE($2, address),
                 phone      = COALESCE($3, phone),
                 email      = COALESCE($4, email),
                 is_active  = COALESCE($5, is_active),
                 updated_at = NOW()
             WHERE id = $6
             RETURNING *",
        )
        .bind(&req.name)
        .bind(&req.address)
        .bind(&req.phone)
        .bind(&req.email)
        .bind(req.is_active)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("Location not found"))
    }

    pub async fn offerings(pool: &PgPool, location_id: Uuid) -> AppResult<Vec<LocationOffering>> {
        let offerings = sqlx::query_as::<_, LocationOffering>(
            "SELECT * FROM location_offerings WHERE location_id = $1",
        )
        .bind(location_id)
        .fetch_all(pool)
        .await?;
        Ok(offerings)
    }

    pub async fn upsert_offering(
        pool: &PgPool,
        location_id: Uuid,
        req: &UpsertOfferingRequest,
    ) -> AppResult<LocationOffering> {
        check_percent(req.admin_fee_percent)?;
        check_percent(req.tax_percent)?;
        if req.price_override.is_some_and(|p| p < rust_decimal::Decimal::ZERO) {
            return Err(AppError::validation("price_override cannot be negative"));
        }
        let offering = sqlx::query_as::<_, LocationOffering>(
            "INSERT INTO location_offerings
                (location_id, program_id, price_override, admin_fee_percent, tax_percent, is_active)
             VALUES ($1, $2, $3, $4, $5, COALESCE($6, TRUE))
             ON CONFLICT (location_id, program_id) DO UPDATE
             SET price_override    = EXCLUDED.price_override,
                 admin_fee_percent = EXCLUDED.admin_fee_percent,
                 tax_percent       = EXCLUDED.tax_percent,
                 is_active         = EXCLUDED.is_active
             RETURNING *",
        )
        .bind(location_id)
        .bind(req.program_id)
        .bind(req.price_override)
        .bind(req.admin_fee_percent)
        .bind(req.tax_percent)
        .bind(req.is_active)
        .fetch_one(pool)
        .await?;
        Ok(offering)
    }
}
