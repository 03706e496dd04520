use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};
use sqlx::PgPool;
use tracing::{info, warn};

lazy_static! {
    // ── Event counters ──────────────────────────────────────────────────────
    pub static ref ENROLLMENTS_COUNTER: CounterVec = register_counter_vec!(
        "api_enrollments_total",
        "Enrollment attempts by offering type and outcome",
        &["offering", "outcome"]
    ).unwrap();

    pub static ref SEAT_OPERATIONS_COUNTER: CounterVec = register_counter_vec!(
        "api_seat_operations_total",
        "Seat reservations and releases by pool and result",
        &["op", "pool", "result"]
    ).unwrap();

    pub static ref DISCOUNT_REDEMPTIONS_COUNTER: CounterVec = register_counter_vec!(
        "api_discount_redemptions_total",
        "Discount code redemptions by result",
        &["result"]
    ).unwrap();

    pub static ref PAYMENT_CALLS_COUNTER: CounterVec = register_counter_vec!(
        "api_payment_calls_total",
        "Payment gateway calls by processor, operation and outcome",
        &["processor", "operation", "outcome"]
    ).unwrap();

    pub static ref PAYMENTS_ORPHANED_COUNTER: CounterVec = register_counter_vec!(
        "payments_orphaned_total",
        "Completed charges whose enrollment could not be persisted",
        &["processor"]
    ).unwrap();

    pub static ref DUNNING_EMAILS_COUNTER: CounterVec = register_counter_vec!(
        "api_dunning_emails_total",
        "Dunning emails by job and delivery status",
        &["job", "status"]
    ).unwrap();

    pub static ref DUNNING_RUNS_COUNTER: CounterVec = register_counter_vec!(
        "api_dunning_runs_total",
        "Dunning job runs by job and outcome",
        &["job", "outcome"]
    ).unwrap();

    // ── Business metrics ────────────────────────────────────────────────────
    pub static ref ENROLLMENTS_GAUGE: GaugeVec = register_gauge_vec!(
        "academy_enrollments",
        "Enrollments by offering type and payment status",
        &["offering", "status"]
    ).unwrap();

    pub static ref SEATS_AVAILABLE_GAUGE: GaugeVec = register_gauge_vec!(
        "academy_seats_available",
        "Available class-session seats per location and pool",
        &["location", "pool"]
    ).unwrap();

    pub static ref OVERDUE_GAUGE: Gauge = register_gauge!(
        "academy_enrollments_overdue",
        "Marathon enrollments past their due date without payment"
    ).unwrap();

    pub static ref PENDING_REGISTRATIONS_GAUGE: Gauge = register_gauge!(
        "academy_registrations_pending",
        "Incomplete registrations not yet expired"
    ).unwrap();
}

/// Spawn the background metrics collector (refreshes every 5 minutes).
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        if let Err(e) = collect(&pool).await {
            warn!("Metrics: initial collection failed: {}", e);
        }
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            if let Err(e) = collect(&pool).await {
                warn!("Metrics: collection failed: {}", e);
            }
        }
    });
}

async fn collect(pool: &PgPool) -> anyhow::Result<()> {
    let enrollments: Vec<(String, String, i64)> = sqlx::query_as(
        "SELECT offering_type::TEXT, payment_status::TEXT, COUNT(*)::BIGINT
         FROM enrollments GROUP BY offering_type, payment_status",
    )
    .fetch_all(pool)
    .await?;
    for (offering, status, count) in enrollments {
        ENROLLMENTS_GAUGE
            .with_label_values(&[&offering, &status])
            .set(count as f64);
    }

    let seats: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT l.name, COALESCE(SUM(s.available_seats), 0)::BIGINT,
                COALESCE(SUM(s.demo_available_seats), 0)::BIGINT
         FROM locations l LEFT JOIN class_sessions s ON s.location_id = l.id
         WHERE l.is_active = TRUE
         GROUP BY l.name",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    for (location, regular, demo) in &seats {
        SEATS_AVAILABLE_GAUGE
            .with_label_values(&[location, "regular"])
            .set(*regular as f64);
        SEATS_AVAILABLE_GAUGE
            .with_label_values(&[location, "demo"])
            .set(*demo as f64);
    }

    let overdue: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM enrollments
         WHERE offering_type = 'marathon'
           AND payment_status IN ('active', 'pending')
           AND monthly_payment_received = FALSE
           AND next_payment_due <= NOW()",
    )
    .fetch_one(pool)
    .await
    .unwrap_or(0);
    OVERDUE_GAUGE.set(overdue as f64);

    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM registrations
         WHERE is_registration_complete = FALSE AND expires_at > NOW()",
    )
    .fetch_one(pool)
    .await
    .unwrap_or(0);
    PENDING_REGISTRATIONS_GAUGE.set(pending as f64);

    info!("Metrics: collected for {} location(s)", seats.len());
    Ok(())
}
