// Library exports for the API binary, the dunning tool and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod policy;
pub mod routes;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use redis::Client as RedisClient;
use sqlx::PgPool;
use tracing::info;

use config::Config;
use services::capacity::{CapacityStore, PgCapacityStore};
use services::catalog::{CatalogCache, PgCatalog};
use services::discounts::{DiscountEvaluator, PgDiscountLedger};
use services::dunning::{DunningRunner, PgDunningStore, RedisJobLock};
use services::email::{EmailService, LogNotifier, Notifier};
use services::enrollment::{EnrollmentOrchestrator, PgEnrollmentStore};
use services::payments::Gateways;

/// Catalog entries are reloaded at least this often even without a write.
const CATALOG_MAX_AGE: Duration = Duration::from_secs(300);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: redis::aio::MultiplexedConnection,
    pub config: Arc<Config>,
    pub catalog: Arc<CatalogCache>,
    pub capacity: Arc<dyn CapacityStore>,
    pub discounts: Arc<DiscountEvaluator>,
    pub enrollments: Arc<EnrollmentOrchestrator>,
    pub dunning: Arc<DunningRunner>,
}

/// SMTP when configured, otherwise messages only go to the log.
pub fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    match EmailService::new(config) {
        Some(email) => {
            info!("SMTP email service configured");
            Arc::new(email)
        }
        None => {
            info!("SMTP not configured, notifications are logged only");
            Arc::new(LogNotifier)
        }
    }
}

pub fn build_dunning_runner(
    pool: &PgPool,
    redis_client: RedisClient,
    notifier: Arc<dyn Notifier>,
) -> Arc<DunningRunner> {
    Arc::new(DunningRunner::new(
        Arc::new(PgDunningStore::new(pool.clone())),
        notifier,
        Arc::new(RedisJobLock::new(redis_client)),
    ))
}

impl AppState {
    /// Wires the Postgres-backed stores, gateways and notifier together.
    pub fn new(
        config: Arc<Config>,
        db: PgPool,
        redis: redis::aio::MultiplexedConnection,
        redis_client: RedisClient,
    ) -> Self {
        let notifier = build_notifier(&config);
        let catalog = Arc::new(CatalogCache::new(
            Arc::new(PgCatalog::new(db.clone())),
            CATALOG_MAX_AGE,
        ));
        let capacity: Arc<dyn CapacityStore> = Arc::new(PgCapacityStore::new(db.clone()));
        let discounts = Arc::new(DiscountEvaluator::new(Arc::new(PgDiscountLedger::new(
            db.clone(),
        ))));
        let enrollments = Arc::new(EnrollmentOrchestrator::new(
            Arc::new(PgEnrollmentStore::new(db.clone())),
            capacity.clone(),
            catalog.clone(),
            discounts.clone(),
            Gateways::from_config(&config),
            notifier.clone(),
        ));
        let dunning = build_dunning_runner(&db, redis_client, notifier);

        Self {
            db,
            redis,
            config,
            catalog,
            capacity,
            discounts,
            enrollments,
            dunning,
        }
    }
}
