use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        auth::AuthenticatedUser,
        class_session::{
            BookingRequest, ClassSession, CreateClassSessionRequest, CreateScheduleRequest,
            Schedule, SeatPool, SlotRef, UpdateClassSessionRequest, UpdateScheduleRequest,
        },
        user::UserRole,
    },
    policy::{authorize, target_location, Action, Resource},
    services::{
        audit::{self, AuditEntry},
        capacity::{reserve_all, ClassSessionService, ScheduleService},
        metrics::SEAT_OPERATIONS_COUNTER,
    },
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub location_id: Option<Uuid>,
    /// Schedules only: hide dates before this one.
    pub from: Option<NaiveDate>,
}

/// Owners may list any location (or all); everyone else sees their own.
fn visible_location(user: &AuthenticatedUser, requested: Option<Uuid>) -> AppResult<Option<Uuid>> {
    if user.role == UserRole::Owner {
        return Ok(requested);
    }
    let own = user.location_id.ok_or_else(AppError::forbidden)?;
    if requested.is_some_and(|loc| loc != own) {
        return Err(AppError::forbidden());
    }
    Ok(Some(own))
}

async fn book_slot(state: &AppState, slot: SlotRef, pool: SeatPool) -> AppResult<()> {
    reserve_all(state.capacity.as_ref(), &[slot], pool).await?;
    Ok(())
}

async fn release_slot(state: &AppState, slot: SlotRef, pool: SeatPool) -> AppResult<()> {
    if state.capacity.release(slot, pool).await? {
        SEAT_OPERATIONS_COUNTER
            .with_label_values(&["release", pool.label(), "ok"])
            .inc();
        Ok(())
    } else {
        Err(AppError::conflict(format!("No booked {} slots to release", pool.label())))
    }
}

// ── Class sessions ──────────────────────────────────────────────────────────

pub async fn list_sessions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<SessionQuery>,
) -> AppResult<Json<Vec<ClassSession>>> {
    let location = visible_location(&user, query.location_id)?;
    if let Some(location_id) = location {
        authorize(&user, Action::Read, Resource::ClassSession { location_id })?;
    }
    Ok(Json(ClassSessionService::list(&state.db, location).await?))
}

pub async fn create_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateClassSessionRequest>,
) -> AppResult<(StatusCode, Json<ClassSession>)> {
    let location_id = target_location(&user, body.location_id)?;
    authorize(&user, Action::Create, Resource::ClassSession { location_id })?;
    let session = ClassSessionService::create(&state.db, location_id, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "class_session.create", "class_session", session.id),
    );
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn update_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateClassSessionRequest>,
) -> AppResult<Json<ClassSession>> {
    let current = ClassSessionService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Update,
        Resource::ClassSession { location_id: current.location_id },
    )?;
    let session = ClassSessionService::update(&state.db, id, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "class_session.update", "class_session", id),
    );
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let current = ClassSessionService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Delete,
        Resource::ClassSession { location_id: current.location_id },
    )?;
    ClassSessionService::delete(&state.db, id).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "class_session.delete", "class_session", id),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn book_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<BookingRequest>,
) -> AppResult<Json<ClassSession>> {
    let current = ClassSessionService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Book,
        Resource::ClassSession { location_id: current.location_id },
    )?;
    book_slot(&state, SlotRef::Session(id), body.pool).await?;
    Ok(Json(ClassSessionService::get(&state.db, id).await?))
}

pub async fn release_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<BookingRequest>,
) -> AppResult<Json<ClassSession>> {
    let current = ClassSessionService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Book,
        Resource::ClassSession { location_id: current.location_id },
    )?;
    release_slot(&state, SlotRef::Session(id), body.pool).await?;
    Ok(Json(ClassSessionService::get(&state.db, id).await?))
}

// ── Dated schedules ─────────────────────────────────────────────────────────

pub async fn list_schedules(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<SessionQuery>,
) -> AppResult<Json<Vec<Schedule>>> {
    let location = visible_location(&user, query.location_id)?;
    if let Some(location_id) = location {
        authorize(&user, Action::Read, Resource::Schedule { location_id })?;
    }
    Ok(Json(ScheduleService::list(&state.db, location, query.from).await?))
}

pub async fn create_schedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateScheduleRequest>,
) -> AppResult<(StatusCode, Json<Schedule>)> {
    let location_id = target_location(&user, body.location_id)?;
    authorize(&user, Action::Create, Resource::Schedule { location_id })?;
    let session = ClassSessionService::get(&state.db, body.session_id).await?;
    if session.location_id != location_id {
        return Err(AppError::validation("Class session belongs to another location"));
    }
    let schedule = ScheduleService::create(&state.db, location_id, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "schedule.create", "schedule", schedule.id),
    );
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateScheduleRequest>,
) -> AppResult<Json<Schedule>> {
    let current = ScheduleService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Update,
        Resource::Schedule { location_id: current.location_id },
    )?;
    let schedule = ScheduleService::update(&state.db, id, &body).await?;
    audit::log(state.db.clone(), AuditEntry::by(&user, "schedule.update", "schedule", id));
    Ok(Json(schedule))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let current = ScheduleService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Delete,
        Resource::Schedule { location_id: current.location_id },
    )?;
    ScheduleService::delete(&state.db, id).await?;
    audit::log(state.db.clone(), AuditEntry::by(&user, "schedule.delete", "schedule", id));
    Ok(StatusCode::NO_CONTENT)
}

pub async fn book_schedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<BookingRequest>,
) -> AppResult<Json<Schedule>> {
    let current = ScheduleService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Book,
        Resource::Schedule { location_id: current.location_id },
    )?;
    book_slot(&state, SlotRef::Schedule(id), body.pool).await?;
    Ok(Json(ScheduleService::get(&state.db, id).await?))
}

pub async fn release_schedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<BookingRequest>,
) -> AppResult<Json<Schedule>> {
    let current = ScheduleService::get(&state.db, id).await?;
    authorize(
        &user,
        Action::Book,
        Resource::Schedule { location_id: current.location_id },
    )?;
    release_slot(&state, SlotRef::Schedule(id), body.pool).await?;
    Ok(Json(ScheduleService::get(&state.db, id).await?))
}
