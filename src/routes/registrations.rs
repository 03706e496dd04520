use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::AppResult,
    middleware::rate_limit::{check_rate_limit, client_ip},
    models::registration::{CreateRegistrationRequest, FinalizeRegistrationRequest, Registration},
    services::{enrollment::EnrollmentReceipt, registrations::RegistrationService},
    AppState,
};

/// Public checkout, step one: hold the family's choices and the quoted price.
pub async fn create_registration(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRegistrationRequest>,
) -> AppResult<(StatusCode, Json<Registration>)> {
    // 10 registrations per hour per client IP
    let rate_key = format!("rate:registration:{}", client_ip(&headers));
    let mut redis = state.redis.clone();
    check_rate_limit(&mut redis, &rate_key, 10, 3600).await?;

    let registration = RegistrationService::create(
        &state.db,
        &state.catalog,
        state.capacity.as_ref(),
        &state.discounts,
        &body,
        Utc::now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

pub async fn get_registration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Registration>> {
    Ok(Json(RegistrationService::get(&state.db, id).await?))
}

/// Public checkout, step two: pay and turn the registration into an enrollment.
pub async fn finalize_registration(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<FinalizeRegistrationRequest>,
) -> AppResult<(StatusCode, Json<EnrollmentReceipt>)> {
    let rate_key = format!("rate:finalize:{}", client_ip(&headers));
    let mut redis = state.redis.clone();
    check_rate_limit(&mut redis, &rate_key, 10, 3600).await?;

    let receipt = state
        .enrollments
        .finalize_registration(id, body, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
