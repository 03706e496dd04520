use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "session_type", rename_all = "snake_case")]
pub enum SessionType {
    Weekday,
    Weekend,
}

/// Capacity pools tracked per slot. Demo seats are held for trial attendees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeatPool {
    #[default]
    Regular,
    Demo,
}

impl SeatPool {
    pub fn label(&self) -> &'static str {
        match self {
            SeatPool::Regular => "regular",
            SeatPool::Demo => "demo",
        }
    }
}

/// A (total, available) seat counter with `0 <= available <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Seats {
    pub total: i32,
    pub available: i32,
}

impl Seats {
    pub fn new(total: i32) -> Self {
        Self { total, available: total }
    }

    pub fn taken(&self) -> i32 {
        self.total - self.available
    }

    /// Takes one seat. Returns false, leaving the counter untouched, when none is left.
    pub fn reserve(&mut self) -> bool {
        if self.available <= 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Gives one seat back. Returns false when the counter is already full.
    pub fn release(&mut self) -> bool {
        if self.available >= self.total {
            return false;
        }
        self.available += 1;
        true
    }

    /// Moves `available` by the same delta as `total`, clamped to `[0, new_total]`.
    pub fn resize(&mut self, new_total: i32) -> Result<(), String> {
        if new_total < 0 {
            return Err("Capacity cannot be negative".into());
        }
        let delta = new_total - self.total;
        self.available = (self.available + delta).clamp(0, new_total);
        self.total = new_total;
        Ok(())
    }
}

/// Identifies a capacity-bearing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRef {
    Session(Uuid),
    Schedule(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClassSession {
    pub id: Uuid,
    pub location_id: Uuid,
    /// 0 = Monday … 6 = Sunday
    pub weekday: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub session_type: SessionType,
    pub total_seats: i32,
    pub available_seats: i32,
    pub demo_total_seats: i32,
    pub demo_available_seats: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClassSession {
    pub fn weekday(&self) -> Option<Weekday> {
        weekday_from_index(self.weekday)
    }

    pub fn seats(&self, pool: SeatPool) -> Seats {
        match pool {
            SeatPool::Regular => Seats {
                total: self.total_seats,
                available: self.available_seats,
            },
            SeatPool::Demo => Seats {
                total: self.demo_total_seats,
                available: self.demo_available_seats,
            },
        }
    }

    pub fn set_seats(&mut self, pool: SeatPool, seats: Seats) {
        match pool {
            SeatPool::Regular => {
                self.total_seats = seats.total;
                self.available_seats = seats.available;
            }
            SeatPool::Demo => {
                self.demo_total_seats = seats.total;
                self.demo_available_seats = seats.available;
            }
        }
    }
}

pub fn weekday_from_index(index: i16) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

/// What a schedule slot sells: exactly one of a program or a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ScheduleTarget {
    Program(Uuid),
    Plan(Uuid),
}

impl ScheduleTarget {
    pub fn from_columns(program_id: Option<Uuid>, plan_id: Option<Uuid>) -> Option<Self> {
        match (program_id, plan_id) {
            (Some(p), None) => Some(ScheduleTarget::Program(p)),
            (None, Some(p)) => Some(ScheduleTarget::Plan(p)),
            _ => None,
        }
    }

    pub fn program_id(&self) -> Option<Uuid> {
        match self {
            ScheduleTarget::Program(id) => Some(*id),
            ScheduleTarget::Plan(_) => None,
        }
    }

    pub fn plan_id(&self) -> Option<Uuid> {
        match self {
            ScheduleTarget::Plan(id) => Some(*id),
            ScheduleTarget::Program(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub location_id: Uuid,
    pub session_id: Uuid,
    pub date: NaiveDate,
    pub program_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub total_seats: i32,
    pub available_seats: i32,
    pub demo_total_seats: i32,
    pub demo_available_seats: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn target(&self) -> Option<ScheduleTarget> {
        ScheduleTarget::from_columns(self.program_id, self.plan_id)
    }

    pub fn seats(&self, pool: SeatPool) -> Seats {
        match pool {
            SeatPool::Regular => Seats {
                total: self.total_seats,
                available: self.available_seats,
            },
            SeatPool::Demo => Seats {
                total: self.demo_total_seats,
                available: self.demo_available_seats,
            },
        }
    }

    pub fn set_seats(&mut self, pool: SeatPool, seats: Seats) {
        match pool {
            SeatPool::Regular => {
                self.total_seats = seats.total;
                self.available_seats = seats.available;
            }
            SeatPool::Demo => {
                self.demo_total_seats = seats.total;
                self.demo_available_seats = seats.available;
            }
        }
    }

    pub fn has_bookings(&self) -> bool {
        self.seats(SeatPool::Regular).taken() > 0 || self.seats(SeatPool::Demo).taken() > 0
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateClassSessionRequest {
    pub location_id: Option<Uuid>,
    pub weekday: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub session_type: Option<SessionType>,
    pub total_seats: i32,
    pub demo_total_seats: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateClassSessionRequest {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub total_seats: Option<i32>,
    pub demo_total_seats: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub location_id: Option<Uuid>,
    pub session_id: Uuid,
    pub date: NaiveDate,
    pub target: ScheduleTarget,
    pub total_seats: i32,
    pub demo_total_seats: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub total_seats: Option<i32>,
    pub demo_total_seats: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct BookingRequest {
    #[serde(default)]
    pub pool: SeatPool,
}
