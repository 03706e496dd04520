use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use redis::Client as RedisClient;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use academy_api::{
    config::Config,
    db,
    middleware::auth::JwtSecret,
    routes,
    services::{metrics, scheduler},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let config = Arc::new(config);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = RedisClient::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    let state = AppState::new(config.clone(), pool.clone(), redis_conn, redis_client);

    metrics::start(pool);
    scheduler::start(state.dunning.clone(), &config.cron);

    // In development (localhost), all origins are allowed.
    let base_url = config.app_base_url.clone();
    let cors_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(o) = origin.to_str() else {
            return false;
        };
        o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") || o == base_url
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ]))
        .allow_origin(cors_origin);

    let jwt_secret = JwtSecret(config.jwt_secret.clone());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        // Catalog
        .route("/locations", get(routes::catalog::list_locations).post(routes::catalog::create_location))
        .route("/locations/{id}", put(routes::catalog::update_location))
        .route("/locations/{id}/offerings", get(routes::catalog::list_offerings).put(routes::catalog::upsert_offering))
        .route("/programs", get(routes::catalog::list_programs).post(routes::catalog::create_program))
        .route("/programs/{id}", put(routes::catalog::update_program))
        .route("/programs/{id}/modules", get(routes::catalog::list_modules).post(routes::catalog::create_module))
        // Capacity
        .route("/class-sessions", get(routes::class_sessions::list_sessions).post(routes::class_sessions::create_session))
        .route("/class-sessions/{id}", put(routes::class_sessions::update_session).delete(routes::class_sessions::delete_session))
        .route("/class-sessions/{id}/book", post(routes::class_sessions::book_session))
        .route("/class-sessions/{id}/release", post(routes::class_sessions::release_session))
        .route("/schedules", get(routes::class_sessions::list_schedules).post(routes::class_sessions::create_schedule))
        .route("/schedules/{id}", put(routes::class_sessions::update_schedule).delete(routes::class_sessions::delete_schedule))
        .route("/schedules/{id}/book", post(routes::class_sessions::book_schedule))
        .route("/schedules/{id}/release", post(routes::class_sessions::release_schedule))
        // Discount codes
        .route("/discount-codes/validate", post(routes::discounts::validate_code))
        .route("/discount-codes/apply", post(routes::discounts::apply_code))
        .route("/discount-codes", get(routes::discounts::list_codes).post(routes::discounts::create_code))
        .route("/discount-codes/{id}", put(routes::discounts::update_code).delete(routes::discounts::delete_code))
        // Public checkout
        .route("/registrations", post(routes::registrations::create_registration))
        .route("/registrations/{id}", get(routes::registrations::get_registration))
        .route("/registrations/{id}/finalize", post(routes::registrations::finalize_registration))
        // Enrollments
        .route("/enrollments", get(routes::enrollments::list_enrollments).post(routes::enrollments::create_enrollment))
        .route(
            "/enrollments/{id}",
            get(routes::enrollments::get_enrollment)
                .put(routes::enrollments::update_enrollment)
                .delete(routes::enrollments::delete_enrollment),
        )
        .route("/enrollments/{id}/cancel-subscription", post(routes::enrollments::cancel_subscription))
        .route("/enrollments/{id}/process-payment", post(routes::enrollments::process_payment))
        .route("/payments/paypal/success", get(routes::payments::paypal_success))
        .route("/payments/paypal/cancel", get(routes::payments::paypal_cancel))
        .route("/payments/stripe/webhook", post(routes::payments::stripe_webhook))
        // Progress
        .route("/progress/topics/{id}/complete", post(routes::progress::complete_topic))
        .route("/progress/students/{id}", get(routes::progress::student_progress))
        // Cron control
        .route("/cron/schedules", get(routes::cron::list_schedules))
        .route("/cron/validate", post(routes::cron::validate_expression))
        .route("/cron/run/{job}", post(routes::cron::run_job))
        .layer(axum::Extension(jwt_secret))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Gateway calls carry their own shorter timeout.
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("academy API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
