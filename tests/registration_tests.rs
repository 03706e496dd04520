mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use academy_api::error::AppError;
use academy_api::models::program::OfferingType;
use academy_api::models::registration::CreateRegistrationRequest;
use academy_api::services::catalog::CatalogCache;
use academy_api::services::discounts::DiscountEvaluator;
use academy_api::services::registrations::RegistrationService;

use common::{at, cents, program, MemCapacity, MemCatalog, MemDiscounts};

struct Checkout {
    location_id: Uuid,
    program_id: Uuid,
    capacity: MemCapacity,
    catalog: CatalogCache,
    discounts: DiscountEvaluator,
}

fn checkout(sessions_per_week: i32) -> Checkout {
    let location_id = Uuid::new_v4();
    let sprint = program(OfferingType::Sprint, Decimal::from(100), sessions_per_week);
    let program_id = sprint.id;
    let source = Arc::new(MemCatalog::default());
    source.offer(location_id, sprint);
    Checkout {
        location_id,
        program_id,
        capacity: MemCapacity::default(),
        catalog: CatalogCache::new(source, Duration::from_secs(300)),
        discounts: DiscountEvaluator::new(Arc::new(MemDiscounts::default())),
    }
}

fn request(c: &Checkout, class_session_ids: Vec<Uuid>) -> CreateRegistrationRequest {
    CreateRegistrationRequest {
        location_id: c.location_id,
        program_id: c.program_id,
        parent_first_name: "Grace".into(),
        parent_last_name: "Hopper".into(),
        parent_email: "grace@example.com".into(),
        parent_phone: None,
        student_first_name: "Walter".into(),
        student_last_name: "Hopper".into(),
        student_birth_date: None,
        class_session_ids,
        discount_code: None,
        start_date: None,
    }
}

async fn price(c: &Checkout, ids: Vec<Uuid>) -> Result<Decimal, AppError> {
    let priced = RegistrationService::price(
        &c.catalog,
        &c.capacity,
        &c.discounts,
        &request(c, ids),
        at(2024, 7, 1),
    )
    .await?;
    Ok(priced.quote.fees.total_amount)
}

#[tokio::test]
async fn weekly_session_count_is_enforced() {
    let c = checkout(2);
    let monday = c.capacity.add(c.location_id, 0, 4);
    let wednesday = c.capacity.add(c.location_id, 2, 4);

    let err = price(&c, vec![monday]).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(ref m) if m.contains("2 session")));

    let err = price(&c, vec![monday, wednesday, c.capacity.add(c.location_id, 4, 4)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    assert_eq!(price(&c, vec![monday, wednesday]).await.unwrap(), cents(11235));
}

#[tokio::test]
async fn repeated_or_missing_sessions_are_refused() {
    let c = checkout(2);
    let monday = c.capacity.add(c.location_id, 0, 4);

    let err = price(&c, vec![monday, monday]).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = price(&c, vec![]).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn sessions_must_be_on_different_days() {
    let c = checkout(2);
    let early = c.capacity.add(c.location_id, 1, 4);
    let late = c.capacity.add(c.location_id, 1, 4);

    let err = price(&c, vec![early, late]).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}
