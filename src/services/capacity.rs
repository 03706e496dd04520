//! Seat bookkeeping for class sessions and dated schedules.
//!
//! Every counter change is a single conditional UPDATE, so concurrent requests
//! can never drive a pool below zero or above its total.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::class_session::{
    ClassSession, CreateClassSessionRequest, CreateScheduleRequest, Schedule, SeatPool, Seats,
    SessionType, SlotRef, UpdateClassSessionRequest, UpdateScheduleRequest,
};
use crate::services::metrics::SEAT_OPERATIONS_COUNTER;

#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// Loads the given sessions; missing ids are simply absent from the result.
    async fn load_sessions(&self, ids: &[Uuid]) -> anyhow::Result<Vec<ClassSession>>;

    /// Takes one seat from `pool`. `false` means the pool is empty (or the slot is gone).
    async fn reserve(&self, slot: SlotRef, pool: SeatPool) -> anyhow::Result<bool>;

    /// Gives one seat back. `false` means the pool was already full.
    async fn release(&self, slot: SlotRef, pool: SeatPool) -> anyhow::Result<bool>;
}

/// Rejects a selection that puts two sessions on the same weekday.
pub fn ensure_distinct_weekdays(sessions: &[ClassSession]) -> AppResult<()> {
    let mut seen = HashSet::new();
    for session in sessions {
        if !seen.insert(session.weekday) {
            return Err(AppError::conflict(
                "cannot select multiple sessions on the same day",
            ));
        }
    }
    Ok(())
}

/// Reserves one seat in every slot, or none: a failure releases what was already taken.
pub async fn reserve_all(
    store: &dyn CapacityStore,
    slots: &[SlotRef],
    pool: SeatPool,
) -> AppResult<Vec<SlotRef>> {
    let mut reserved = Vec::with_capacity(slots.len());
    for slot in slots {
        match store.reserve(*slot, pool).await {
            Ok(true) => {
                SEAT_OPERATIONS_COUNTER
                    .with_label_values(&["reserve", pool.label(), "ok"])
                    .inc();
                reserved.push(*slot);
            }
            Ok(false) => {
                SEAT_OPERATIONS_COUNTER
                    .with_label_values(&["reserve", pool.label(), "exhausted"])
                    .inc();
                release_all(store, &reserved, pool).await;
                return Err(AppError::conflict(format!(
                    "No available {} slots",
                    pool.label()
                )));
            }
            Err(e) => {
                release_all(store, &reserved, pool).await;
                return Err(AppError::Internal(e));
            }
        }
    }
    Ok(reserved)
}

/// Best-effort release used by compensation paths; problems are logged, not returned.
pub async fn release_all(store: &dyn CapacityStore, slots: &[SlotRef], pool: SeatPool) {
    for slot in slots {
        match store.release(*slot, pool).await {
            Ok(true) => {
                SEAT_OPERATIONS_COUNTER
                    .with_label_values(&["release", pool.label(), "ok"])
                    .inc();
            }
            Ok(false) => {
                SEAT_OPERATIONS_COUNTER
                    .with_label_values(&["release", pool.label(), "full"])
                    .inc();
                tracing::warn!(?slot, pool = pool.label(), "release on a full pool, counters out of sync");
            }
            Err(e) => {
                tracing::error!(?slot, pool = pool.label(), "seat release failed: {e}");
            }
        }
    }
}

fn seat_columns(pool: SeatPool) -> (&'static str, &'static str) {
    match pool {
        SeatPool::Regular => ("available_seats", "total_seats"),
        SeatPool::Demo => ("demo_available_seats", "demo_total_seats"),
    }
}

fn slot_table(slot: SlotRef) -> (&'static str, Uuid) {
    match slot {
        SlotRef::Session(id) => ("class_sessions", id),
        SlotRef::Schedule(id) => ("schedules", id),
    }
}

pub struct PgCapacityStore {
    pool: PgPool,
}

impl PgCapacityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CapacityStore for PgCapacityStore {
    async fn load_sessions(&self, ids: &[Uuid]) -> anyhow::Result<Vec<ClassSession>> {
        let sessions = sqlx::query_as::<_, ClassSession>(
            "SELECT * FROM class_sessions WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn reserve(&self, slot: SlotRef, pool: SeatPool) -> anyhow::Result<bool> {
        let (table, id) = slot_table(slot);
        let (available, _) = seat_columns(pool);
        let result = sqlx::query(&format!(
            "UPDATE {table}
             SET {available} = {available} - 1, updated_at = NOW()
             WHERE id = $1 AND {available} > 0"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, slot: SlotRef, pool: SeatPool) -> anyhow::Result<bool> {
        let (table, id) = slot_table(slot);
        let (available, total) = seat_columns(pool);
        let result = sqlx::query(&format!(
            "UPDATE {table}
             SET {available} = {available} + 1, updated_at = NOW()
             WHERE id = $1 AND {available} < {total}"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn resized(current: Seats, new_total: Option<i32>) -> AppResult<Seats> {
    let mut seats = current;
    if let Some(total) = new_total {
        seats.resize(total).map_err(AppError::Validation)?;
    }
    Ok(seats)
}

fn check_capacity(total: i32, demo_total: i32) -> AppResult<()> {
    if total < 0 || demo_total < 0 {
        return Err(AppError::validation("Capacity cannot be negative"));
    }
    Ok(())
}

pub struct ClassSessionService;

impl ClassSessionService {
    pub async fn list(pool: &PgPool, location_id: Option<Uuid>) -> AppResult<Vec<ClassSession>> {
        let sessions = sqlx::query_as::<_, ClassSession>(
            "SELECT * FROM class_sessions
             WHERE ($1::UUID IS NULL OR location_id = $1)
             ORDER BY weekday, start_time",
        )
        .bind(location_id)
        .fetch_all(pool)
        .await?;
        Ok(sessions)
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> AppResult<ClassSession> {
        sqlx::query_as::<_, ClassSession>("SELECT * FROM class_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Class session not found"))
    }

    pub async fn create(
        pool: &PgPool,
        location_id: Uuid,
        req: &CreateClassSessionRequest,
    ) -> AppResult<ClassSession> {
        if !(0..=6).contains(&req.weekday) {
            return Err(AppError::validation("weekday must be between 0 (Monday) and 6 (Sunday)"));
        }
        if req.end_time <= req.start_time {
            return Err(AppError::validation("end_time must be after start_time"));
        }
        let demo_total = req.demo_total_seats.unwrap_or(0);
        check_capacity(req.total_seats, demo_total)?;
        let session_type = req.session_type.unwrap_or(if req.weekday >= 5 {
            SessionType::Weekend
        } else {
            SessionType::Weekday
        });

        let session = sqlx::query_as::<_, ClassSession>(
            "INSERT INTO class_sessions
                (location_id, weekday, start_time, end_time, session_type,
                 total_seats, available_seats, demo_total_seats, demo_available_seats)
             VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $7)
             RETURNING *",
        )
        .bind(location_id)
        .bind(req.weekday)
        .bind(req.start_time)
        .bind(req.end_time)
        .bind(session_type)
        .bind(req.total_seats)
        .bind(demo_total)
        .fetch_one(pool)
        .await?;
        Ok(session)
    }

    /// Applies time and capacity edits under a row lock so concurrent bookings
    /// cannot interleave with the resize.
    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        req: &UpdateClassSessionRequest,
    ) -> AppResult<ClassSession> {
        let mut tx = pool.begin().await?;
        let mut session = sqlx::query_as::<_, ClassSession>(
            "SELECT * FROM class_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("Class session not found"))?;

        let start = req.start_time.unwrap_or(session.start_time);
        let end = req.end_time.unwrap_or(session.end_time);
        if end <= start {
            return Err(AppError::validation("end_time must be after start_time"));
        }
        let regular = resized(session.seats(SeatPool::Regular), req.total_seats)?;
        let demo = resized(session.seats(SeatPool::Demo), req.demo_total_seats)?;
        session.set_seats(SeatPool::Regular, regular);
        session.set_seats(SeatPool::Demo, demo);

        let updated = sqlx::query_as::<_, ClassSession>(
            "UPDATE class_sessions
             SET start_time = $1, end_time = $2,
                 total_seats = $3, available_seats = $4,
                 demo_total_seats = $5, demo_available_seats = $6,
                 updated_at = NOW()
             WHERE id = $7
             RETURNING *",
        )
        .bind(start)
        .bind(end)
        .bind(session.total_seats)
        .bind(session.available_seats)
        .bind(session.demo_total_seats)
        .bind(session.demo_available_seats)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Refuses to delete a session that still has seats taken or dated schedules.
    pub async fn delete(pool: &PgPool, id: Uuid) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        let session = sqlx::query_as::<_, ClassSession>(
            "SELECT * FROM class_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("Class session not found"))?;

        if session.seats(SeatPool::Regular).taken() > 0 || session.seats(SeatPool::Demo).taken() > 0 {
            return Err(AppError::conflict("Class session still has bookings"));
        }
        let schedules: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::BIGINT FROM schedules WHERE session_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if schedules > 0 {
            return Err(AppError::conflict("Class session is used by schedules"));
        }

        sqlx::query("DELETE FROM class_sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub struct ScheduleService;

impl ScheduleService {
    pub async fn list(
        pool: &PgPool,
        location_id: Option<Uuid>,
        from: Option<chrono::NaiveDate>,
    ) -> AppResult<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules
             WHERE ($1::UUID IS NULL OR location_id = $1)
               AND ($2::DATE IS NULL OR date >= $2)
             ORDER BY date",
        )
        .bind(location_id)
        .bind(from)
        .fetch_all(pool)
        .await?;
        Ok(schedules)
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> AppResult<Schedule> {
        sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Schedule not found"))
    }

    pub async fn create(
        pool: &PgPool,
        location_id: Uuid,
        req: &CreateScheduleRequest,
    ) -> AppResult<Schedule> {
        let demo_total = req.demo_total_seats.unwrap_or(0);
        check_capacity(req.total_seats, demo_total)?;

        let session = ClassSessionService::get(pool, req.session_id).await?;
        if session.location_id != location_id {
            return Err(AppError::validation("Session belongs to another location"));
        }

        let schedule = sqlx::query_as::<_, Schedule>(
            "INSERT INTO schedules
                (location_id, session_id, date, program_id, plan_id,
                 total_seats, available_seats, demo_total_seats, demo_available_seats)
             VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $7)
             RETURNING *",
        )
        .bind(location_id)
        .bind(req.session_id)
        .bind(req.date)
        .bind(req.target.program_id())
        .bind(req.target.plan_id())
        .bind(req.total_seats)
        .bind(demo_total)
        .fetch_one(pool)
        .await?;
        Ok(schedule)
    }

    pub async fn update(pool: &PgPool, id: Uuid, req: &UpdateScheduleRequest) -> AppResult<Schedule> {
        let mut tx = pool.begin().await?;
        let mut schedule =
            sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::not_found("Schedule not found"))?;

        let regular = resized(schedule.seats(SeatPool::Regular), req.total_seats)?;
        let demo = resized(schedule.seats(SeatPool::Demo), req.demo_total_seats)?;
        schedule.set_seats(SeatPool::Regular, regular);
        schedule.set_seats(SeatPool::Demo, demo);

        let updated = sqlx::query_as::<_, Schedule>(
            "UPDATE schedules
             SET total_seats = $1, available_seats = $2,
                 demo_total_seats = $3, demo_available_seats = $4,
                 updated_at = NOW()
             WHERE id = $5
             RETURNING *",
        )
        .bind(schedule.total_seats)
        .bind(schedule.available_seats)
        .bind(schedule.demo_total_seats)
        .bind(schedule.demo_available_seats)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        let schedule =
            sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::not_found("Schedule not found"))?;
        if schedule.has_bookings() {
            return Err(AppError::conflict("Schedule still has bookings"));
        }
        sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn session(weekday: i16) -> ClassSession {
        ClassSession {
            id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            weekday,
            start_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            session_type: SessionType::Weekday,
            total_seats: 1,
            available_seats: 1,
            demo_total_seats: 0,
            demo_available_seats: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct Counters(Mutex<HashMap<SlotRef, Seats>>);

    #[async_trait]
    impl CapacityStore for Counters {
        async fn load_sessions(&self, _ids: &[Uuid]) -> anyhow::Result<Vec<ClassSession>> {
            Ok(vec![])
        }

        async fn reserve(&self, slot: SlotRef, _pool: SeatPool) -> anyhow::Result<bool> {
            Ok(self.0.lock().unwrap().get_mut(&slot).is_some_and(|s| s.reserve()))
        }

        async fn release(&self, slot: SlotRef, _pool: SeatPool) -> anyhow::Result<bool> {
            Ok(self.0.lock().unwrap().get_mut(&slot).is_some_and(|s| s.release()))
        }
    }

    #[test]
    fn same_weekday_is_rejected() {
        let err = ensure_distinct_weekdays(&[session(0), session(0)]).unwrap_err();
        assert!(matches!(err, AppError::Conflict(msg) if msg.contains("same day")));
        assert!(ensure_distinct_weekdays(&[session(0), session(3)]).is_ok());
    }

    #[tokio::test]
    async fn partial_reservation_is_rolled_back() {
        let open = SlotRef::Session(Uuid::new_v4());
        let full = SlotRef::Session(Uuid::new_v4());
        let store = Counters::default();
        store.0.lock().unwrap().insert(open, Seats::new(2));
        store.0.lock().unwrap().insert(full, Seats { total: 2, available: 0 });

        let err = reserve_all(&store, &[open, full], SeatPool::Regular)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(msg) if msg == "No available regular slots"));
        assert_eq!(store.0.lock().unwrap()[&open], Seats::new(2));
    }

    #[tokio::test]
    async fn reserve_all_takes_one_seat_each() {
        let a = SlotRef::Session(Uuid::new_v4());
        let b = SlotRef::Schedule(Uuid::new_v4());
        let store = Counters::default();
        store.0.lock().unwrap().insert(a, Seats::new(3));
        store.0.lock().unwrap().insert(b, Seats::new(1));

        let reserved = reserve_all(&store, &[a, b], SeatPool::Demo).await.unwrap();
        assert_eq!(reserved, vec![a, b]);
        let seats = store.0.lock().unwrap();
        assert_eq!(seats[&a].available, 2);
        assert_eq!(seats[&b].available, 0);
    }
}
