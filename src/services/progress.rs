use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::progress::{ModuleProgress, ProgramProgress, StudentProgress};
use crate::services::fees::round2;

/// Share of `completed` in `total` as a 0..=100 percentage with two decimals.
pub fn completion_percent(completed: i32, total: i32) -> Decimal {
    if total <= 0 {
        return Decimal::ZERO;
    }
    let completed = completed.clamp(0, total);
    round2(Decimal::from(completed) * Decimal::ONE_HUNDRED / Decimal::from(total))
}

/// Program completion weighted by topic count, so a long module counts for more.
pub fn program_percent(modules: &[(i32, i32)]) -> Decimal {
    let (completed, total) = modules.iter().fold((0, 0), |(c, t), &(mc, mt)| {
        let mt = mt.max(0);
        (c + mc.clamp(0, mt), t + mt)
    });
    completion_percent(completed, total)
}

pub struct ProgressService;

impl ProgressService {
    /// Marks a topic done for a student and rolls the counts up to module and
    /// program level. Completing a topic twice changes nothing.
    pub async fn complete_topic(
        pool: &PgPool,
        topic_id: Uuid,
        student_id: Uuid,
    ) -> AppResult<StudentProgress> {
        let mut tx = pool.begin().await?;

        let module_id: Uuid = sqlx::query_scalar("SELECT module_id FROM module_topics WHERE id = $1")
            .bind(topic_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("Topic not found"))?;

        let module = sqlx::query_as::<_, ModuleProgress>(
            "SELECT * FROM module_progress
             WHERE student_id = $1 AND module_id = $2
             ORDER BY updated_at DESC LIMIT 1
             FOR UPDATE",
        )
        .bind(student_id)
        .bind(module_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::validation("Student is not enrolled in this topic's program"))?;

        let inserted = sqlx::query(
            "INSERT INTO completed_topics (student_id, topic_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(student_id)
        .bind(topic_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            let completed: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM completed_topics ct
                 JOIN module_topics t ON t.id = ct.topic_id
                 WHERE ct.student_id = $1 AND t.module_id = $2",
            )
            .bind(student_id)
            .bind(module_id)
            .fetch_one(&mut *tx)
            .await?;
            let completed = i32::try_from(completed).unwrap_or(i32::MAX);

            sqlx::query(
                "UPDATE module_progress
                 SET completed_topics = $2, completion_percent = $3, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(module.id)
            .bind(completed.min(module.total_topics))
            .bind(completion_percent(completed, module.total_topics))
            .execute(&mut *tx)
            .await?;

            let counts: Vec<(i32, i32)> = sqlx::query_as(
                "SELECT completed_topics, total_topics FROM module_progress
                 WHERE program_progress_id = $1",
            )
            .bind(module.program_progress_id)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE program_progress SET completion_percent = $2, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(module.program_progress_id)
            .bind(program_percent(&counts))
            .execute(&mut *tx)
            .await?;

            tracing::debug!(%student_id, %topic_id, completed, "topic completed");
        }

        tx.commit().await?;
        Self::for_program_progress(pool, module.program_progress_id).await
    }

    async fn for_program_progress(pool: &PgPool, id: Uuid) -> AppResult<StudentProgress> {
        let program = sqlx::query_as::<_, ProgramProgress>("SELECT * FROM program_progress WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?;
        let modules = sqlx::query_as::<_, ModuleProgress>(
            "SELECT mp.* FROM module_progress mp
             JOIN program_modules m ON m.id = mp.module_id
             WHERE mp.program_progress_id = $1
             ORDER BY m.position",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;
        Ok(StudentProgress { program, modules })
    }

    /// Progress across every enrollment of a student, newest first.
    pub async fn for_student(pool: &PgPool, student_id: Uuid) -> AppResult<Vec<StudentProgress>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM program_progress WHERE student_id = $1 ORDER BY updated_at DESC",
        )
        .bind(student_id)
        .fetch_all(pool)
        .await?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(Self::for_program_progress(pool, id).await?);
        }
        Ok(out)
    }
}
