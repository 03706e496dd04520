use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        auth::AuthenticatedUser,
        enrollment::{
            CreateEnrollmentRequest, Enrollment, EnrollmentListQuery, PaymentRecord,
            UpdateEnrollmentRequest,
        },
        user::UserRole,
    },
    policy::{authorize, Action, Resource},
    services::{
        audit::{self, AuditEntry},
        enrollment::{EnrollmentFilter, EnrollmentInput, EnrollmentReceipt, PaymentResult},
    },
    AppState,
};

#[derive(Debug, Serialize)]
pub struct EnrollmentDetail {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub payments: Vec<PaymentRecord>,
}

/// Loads an enrollment and checks `action` against its location and paying parent.
async fn load_authorized(
    state: &AppState,
    user: &AuthenticatedUser,
    id: Uuid,
    action: Action,
) -> AppResult<Enrollment> {
    let enrollment = state.enrollments.get(id).await?;
    let payer = state.enrollments.payer_of(&enrollment).await?;
    authorize(
        user,
        action,
        Resource::Enrollment {
            location_id: enrollment.location_id,
            parent_id: payer.parent_id,
        },
    )?;
    Ok(enrollment)
}

/// Narrows a list query to what the caller may see.
fn scoped_filter(user: &AuthenticatedUser, query: EnrollmentListQuery) -> AppResult<EnrollmentFilter> {
    let mut filter = EnrollmentFilter {
        location_id: query.location_id,
        student_id: query.student_id,
        parent_id: None,
        status: query.status,
    };
    match user.role {
        UserRole::Owner => {}
        UserRole::Parent => filter.parent_id = Some(user.user_id),
        _ => {
            let own = user.location_id.ok_or_else(AppError::forbidden)?;
            if query.location_id.is_some_and(|loc| loc != own) {
                return Err(AppError::forbidden());
            }
            // Nobody's child: only a location-wide read right passes.
            authorize(
                user,
                Action::Read,
                Resource::Enrollment { location_id: own, parent_id: Uuid::nil() },
            )?;
            filter.location_id = Some(own);
        }
    }
    Ok(filter)
}

pub async fn list_enrollments(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<EnrollmentListQuery>,
) -> AppResult<Json<Vec<Enrollment>>> {
    let filter = scoped_filter(&user, query)?;
    Ok(Json(state.enrollments.list(&filter).await?))
}

pub async fn create_enrollment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateEnrollmentRequest>,
) -> AppResult<(StatusCode, Json<EnrollmentReceipt>)> {
    let student = state.enrollments.student(body.student_id).await?;
    authorize(
        &user,
        Action::Create,
        Resource::Enrollment {
            location_id: body.location_id,
            parent_id: student.parent_id,
        },
    )?;

    let now = Utc::now();
    let receipt = state
        .enrollments
        .enroll(EnrollmentInput::from_request(body, now.date_naive()), now)
        .await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "enrollment.create", "enrollment", receipt.enrollment.id)
            .with_detail(receipt.enrollment.payment_status.as_str()),
    );
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn get_enrollment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<EnrollmentDetail>> {
    let enrollment = load_authorized(&state, &user, id, Action::Read).await?;
    let payments = state.enrollments.payments(id).await?;
    Ok(Json(EnrollmentDetail {
        enrollment,
        payments,
    }))
}

pub async fn update_enrollment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateEnrollmentRequest>,
) -> AppResult<Json<Enrollment>> {
    load_authorized(&state, &user, id, Action::Update).await?;
    let enrollment = state.enrollments.update(id, &body).await?;
    audit::log(state.db.clone(), AuditEntry::by(&user, "enrollment.update", "enrollment", id));
    Ok(Json(enrollment))
}

pub async fn delete_enrollment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    load_authorized(&state, &user, id, Action::Delete).await?;
    state.enrollments.delete_enrollment(id).await?;
    audit::log(state.db.clone(), AuditEntry::by(&user, "enrollment.delete", "enrollment", id));
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Enrollment>> {
    load_authorized(&state, &user, id, Action::CancelSubscription).await?;
    let enrollment = state.enrollments.cancel_subscription(id).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "enrollment.cancel_subscription", "enrollment", id),
    );
    Ok(Json(enrollment))
}

pub async fn process_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PaymentResult>> {
    load_authorized(&state, &user, id, Action::ProcessPayment).await?;
    let result = state.enrollments.process_payment(id, Utc::now()).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "enrollment.process_payment", "enrollment", id)
            .with_detail(result.enrollment.payment_status.as_str()),
    );
    Ok(Json(result))
}
