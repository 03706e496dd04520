use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::AppResult,
    middleware::rate_limit::{check_rate_limit, client_ip},
    models::{
        auth::AuthenticatedUser,
        discount::{
            CreateDiscountCodeRequest, DiscountCheckRequest, DiscountCode, DiscountRedemption,
            DiscountValidation, UpdateDiscountCodeRequest,
        },
        user::UserRole,
    },
    policy::{authorize, target_location, Action, Resource},
    services::{
        audit::{self, AuditEntry},
        discounts::DiscountCodeService,
    },
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct DiscountListQuery {
    pub location_id: Option<Uuid>,
}

// 20 lookups per 15 min per client IP
async fn limit_lookups(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let rate_key = format!("rate:discount:{}", client_ip(headers));
    let mut redis = state.redis.clone();
    check_rate_limit(&mut redis, &rate_key, 20, 900).await
}

/// Public checkout: checks a code without using it.
pub async fn validate_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DiscountCheckRequest>,
) -> AppResult<Json<DiscountValidation>> {
    limit_lookups(&state, &headers).await?;
    let validation = state
        .discounts
        .validate(&body.code, body.location_id, Utc::now())
        .await?;
    Ok(Json(validation))
}

/// Consumes one use of a code.
pub async fn apply_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DiscountCheckRequest>,
) -> AppResult<Json<DiscountRedemption>> {
    limit_lookups(&state, &headers).await?;
    let redemption = state
        .discounts
        .apply(&body.code, body.location_id, Utc::now())
        .await?;
    Ok(Json(redemption))
}

pub async fn list_codes(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<DiscountListQuery>,
) -> AppResult<Json<Vec<DiscountCode>>> {
    let location = if user.role == UserRole::Owner {
        query.location_id
    } else {
        Some(target_location(&user, query.location_id)?)
    };
    if let Some(location_id) = location {
        authorize(&user, Action::Read, Resource::DiscountCode { location_id })?;
    }
    Ok(Json(DiscountCodeService::list(&state.db, location).await?))
}

pub async fn create_code(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateDiscountCodeRequest>,
) -> AppResult<(StatusCode, Json<DiscountCode>)> {
    let location_id = target_location(&user, body.location_id)?;
    authorize(&user, Action::Create, Resource::DiscountCode { location_id })?;
    let code = DiscountCodeService::create(&state.db, location_id, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "discount_code.create", "discount_code", code.id)
            .with_detail(code.code.clone()),
    );
    Ok((StatusCode::CREATED, Json(code)))
}

pub async fn update_code(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDiscountCodeRequest>,
) -> AppResult<Json<DiscountCode>> {
    let current = DiscountCodeService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Update,
        Resource::DiscountCode { location_id: current.location_id },
    )?;
    let code = DiscountCodeService::update(&state.db, id, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "discount_code.update", "discount_code", id),
    );
    Ok(Json(code))
}

pub async fn delete_code(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let current = DiscountCodeService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Delete,
        Resource::DiscountCode { location_id: current.location_id },
    )?;
    DiscountCodeService::delete(&state.db, id).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "discount_code.delete", "discount_code", id),
    );
    Ok(StatusCode::NO_CONTENT)
}
