use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        auth::AuthenticatedUser,
        progress::{CompleteTopicRequest, StudentProgress},
    },
    policy::{authorize, Action, Resource},
    services::progress::ProgressService,
    AppState,
};

/// Staff of the student's location mark topics done.
pub async fn complete_topic(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(topic_id): Path<Uuid>,
    Json(body): Json<CompleteTopicRequest>,
) -> AppResult<Json<StudentProgress>> {
    let student = state.enrollments.student(body.student_id).await?;
    authorize(
        &user,
        Action::Update,
        Resource::Progress {
            location_id: student.location_id,
            parent_id: student.parent_id,
        },
    )?;
    let progress = ProgressService::complete_topic(&state.db, topic_id, body.student_id).await?;
    Ok(Json(progress))
}

pub async fn student_progress(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(student_id): Path<Uuid>,
) -> AppResult<Json<Vec<StudentProgress>>> {
    let student = state.enrollments.student(student_id).await?;
    authorize(
        &user,
        Action::Read,
        Resource::Progress {
            location_id: student.location_id,
            parent_id: student.parent_id,
        },
    )?;
    Ok(Json(ProgressService::for_student(&state.db, student_id).await?))
}
