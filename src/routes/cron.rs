use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    models::auth::AuthenticatedUser,
    policy::{authorize, Action, Resource},
    services::{
        audit::{self, AuditEntry},
        dunning::{CronJob, JobReport},
        scheduler::{self, CronSchedule, ScheduleInfo},
    },
    AppState,
};

const PREVIEW_RUNS: usize = 5;

#[derive(Debug, Deserialize)]
pub struct ValidateCronRequest {
    pub expression: String,
}

#[derive(Debug, Serialize)]
pub struct CronValidation {
    pub valid: bool,
    pub next_runs: Vec<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Next `count` firing times of `expression` after `from`.
pub fn preview(expression: &str, from: DateTime<Utc>, count: usize) -> CronValidation {
    match expression.parse::<CronSchedule>() {
        Ok(schedule) => {
            let next_runs = std::iter::successors(schedule.next_after(from), |t| schedule.next_after(*t))
                .take(count)
                .collect();
            CronValidation {
                valid: true,
                next_runs,
                error: None,
            }
        }
        Err(e) => CronValidation {
            valid: false,
            next_runs: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

pub async fn list_schedules(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<ScheduleInfo>>> {
    authorize(&user, Action::Read, Resource::CronControl)?;
    Ok(Json(scheduler::describe(&state.config.cron, Utc::now())))
}

pub async fn validate_expression(
    user: AuthenticatedUser,
    Json(body): Json<ValidateCronRequest>,
) -> AppResult<Json<CronValidation>> {
    authorize(&user, Action::Read, Resource::CronControl)?;
    Ok(Json(preview(&body.expression, Utc::now(), PREVIEW_RUNS)))
}

/// Runs a job immediately, under the same lock as the scheduled run.
pub async fn run_job(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(job): Path<String>,
) -> AppResult<Json<JobReport>> {
    authorize(&user, Action::Update, Resource::CronControl)?;
    let job: CronJob = job
        .parse()
        .map_err(|e: anyhow::Error| AppError::not_found(e.to_string()))?;
    audit::log(
        state.db.clone(),
        AuditEntry::by(&user, "cron.run", "cron_job", uuid::Uuid::nil()).with_detail(job.as_str()),
    );
    let report = state.dunning.run(job, Utc::now()).await?;
    Ok(Json(report))
}
