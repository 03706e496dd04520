use sqlx::PgPool;
use uuid::Uuid;

use crate::models::auth::AuthenticatedUser;

/// An audit log entry to record.
pub struct AuditEntry {
    pub user_id:       Option<Uuid>,
    pub location_id:   Option<Uuid>,
    pub action:        String,
    pub resource_type: Option<String>,
    pub resource_id:   Option<String>,
    pub detail:        Option<String>,
}

impl AuditEntry {
    pub fn by(user: &AuthenticatedUser, action: &str, resource_type: &str, resource_id: Uuid) -> Self {
        Self {
            user_id: Some(user.user_id),
            location_id: user.location_id,
            action: action.to_string(),
            resource_type: Some(resource_type.to_string()),
            resource_id: Some(resource_id.to_string()),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fire-and-forget audit log entry.
/// Spawns a background task, never blocks the request handler and
/// never propagates errors (logs a warning on failure).
pub fn log(pool: PgPool, entry: AuditEntry) {
    tokio::spawn(async move {
        let res = sqlx::query(
            "INSERT INTO audit_log
                (user_id, location_id, action, resource_type, resource_id, detail)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.user_id)
        .bind(entry.location_id)
        .bind(&entry.action)
        .bind(entry.resource_type)
        .bind(entry.resource_id)
        .bind(entry.detail)
        .execute(&pool)
        .await;

        if let Err(e) = res {
            tracing::warn!("audit log insert failed for action {}: {e}", entry.action);
        }
    });
}
