use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        auth::AuthenticatedUser,
        location::{
            CreateLocationRequest, Location, LocationOffering, UpdateLocationRequest,
            UpsertOfferingRequest,
        },
        program::{CreateModuleRequest, CreateProgramRequest, Program, ProgramModule, UpdateProgramRequest},
    },
    policy::{authorize, Action, Resource},
    services::{
        audit::{self, AuditEntry},
        catalog::{LocationService, ProgramService},
    },
    AppState,
};

// ── Locations ───────────────────────────────────────────────────────────────

pub async fn list_locations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Location>>> {
    authorize(&user, Action::Read, Resource::Catalog)?;
    Ok(Json(LocationService::list(&state.db).await?))
}

pub async fn create_location(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateLocationRequest>,
) -> AppResult<(StatusCode, Json<Location>)> {
    authorize(&user, Action::Create, Resource::Catalog)?;
    let location = LocationService::create(&state.db, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "location.create", "location", location.id),
    );
    Ok((StatusCode::CREATED, Json(location)))
}

pub async fn update_location(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateLocationRequest>,
) -> AppResult<Json<Location>> {
    authorize(&user, Action::Update, Resource::Location(id))?;
    let location = LocationService::update(&state.db, id, &body).await?;
    state.catalog.invalidate_location(id);
    audit::log(state.db.clone(), AuditEntry::by(&user, "location.update", "location", id));
    Ok(Json(location))
}

pub async fn list_offerings(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<LocationOffering>>> {
    authorize(&user, Action::Read, Resource::Location(id))?;
    Ok(Json(LocationService::offerings(&state.db, id).await?))
}

/// Sets the price, fees and availability of one program at a location.
pub async fn upsert_offering(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpsertOfferingRequest>,
) -> AppResult<Json<LocationOffering>> {
    authorize(&user, Action::Create, Resource::Catalog)?;
    let offering = LocationService::upsert_offering(&state.db, id, &body).await?;
    state.catalog.invalidate_offering(id, body.program_id);
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "offering.upsert", "location", id)
            .with_detail(format!("program {}", body.program_id)),
    );
    Ok(Json(offering))
}

// ── Programs ────────────────────────────────────────────────────────────────

pub async fn list_programs(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Program>>> {
    authorize(&user, Action::Read, Resource::Catalog)?;
    Ok(Json(ProgramService::list(&state.db).await?))
}

pub async fn create_program(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateProgramRequest>,
) -> AppResult<(StatusCode, Json<Program>)> {
    authorize(&user, Action::Create, Resource::Catalog)?;
    let program = ProgramService::create(&state.db, &body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "program.create", "program", program.id),
    );
    Ok((StatusCode::CREATED, Json(program)))
}

pub async fn update_program(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProgramRequest>,
) -> AppResult<Json<Program>> {
    authorize(&user, Action::Update, Resource::Catalog)?;
    let program = ProgramService::update(&state.db, id, &body).await?;
    state.catalog.invalidate_program(id);
    audit::log(state.db.clone(), AuditEntry::by(&user, "program.update", "program", id));
    Ok(Json(program))
}

pub async fn list_modules(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<ProgramModule>>> {
    authorize(&user, Action::Read, Resource::Catalog)?;
    Ok(Json(state.catalog.modules(id).await?))
}

pub async fn create_module(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateModuleRequest>,
) -> AppResult<(StatusCode, Json<ProgramModule>)> {
    authorize(&user, Action::Create, Resource::Catalog)?;
    // 404 before inserting into a program that does not exist.
    state.catalog.program(id).await?;
    let module = ProgramService::add_module(&state.db, id, &body).await?;
    state.catalog.invalidate_program(id);
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "program.add_module", "program", id)
            .with_detail(format!("{} topics", body.topics.len())),
    );
    Ok((StatusCode::CREATED, Json(module)))
}
