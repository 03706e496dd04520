use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProgramProgress {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub student_id: Uuid,
    pub program_id: Uuid,
    pub completion_percent: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModuleProgress {
    pub id: Uuid,
    pub program_progress_id: Uuid,
    pub module_id: Uuid,
    pub student_id: Uuid,
    pub completed_topics: i32,
    pub total_topics: i32,
    pub completion_percent: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentProgress {
    pub program: ProgramProgress,
    pub modules: Vec<ModuleProgress>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteTopicRequest {
    pub student_id: Uuid,
}
