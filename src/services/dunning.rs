//! Monthly dunning: overdue notices, suspension, payment reminders, plus the
//! daily purge of abandoned registrations.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::config::CronConfig;
use crate::models::enrollment::PaymentStatus;
use crate::services::email::{DunningNotice, Notifier, Recipient, Severity};
use crate::services::fees::{first_of_month, first_of_next_month};
use crate::services::metrics::{DUNNING_EMAILS_COUNTER, DUNNING_RUNS_COUNTER};
use crate::services::registrations::RegistrationService;

/// Lock keys expire on their own if a run dies halfway.
pub const RUN_LOCK_TTL_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronJob {
    OverdueFirstNotice,
    OverdueFinalNotice,
    PaymentReminder,
    PaymentReminderSecond,
    RegistrationPurge,
}

impl CronJob {
    pub const ALL: [CronJob; 5] = [
        CronJob::OverdueFirstNotice,
        CronJob::OverdueFinalNotice,
        CronJob::PaymentReminder,
        CronJob::PaymentReminderSecond,
        CronJob::RegistrationPurge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CronJob::OverdueFirstNotice => "overdue_first_notice",
            CronJob::OverdueFinalNotice => "overdue_final_notice",
            CronJob::PaymentReminder => "payment_reminder",
            CronJob::PaymentReminderSecond => "payment_reminder_second",
            CronJob::RegistrationPurge => "registration_purge",
        }
    }

    /// Configured cron expression for this job.
    pub fn expression<'a>(&self, config: &'a CronConfig) -> &'a str {
        match self {
            CronJob::OverdueFirstNotice => &config.overdue_first_notice,
            CronJob::OverdueFinalNotice => &config.overdue_final_notice,
            CronJob::PaymentReminder => &config.payment_reminder,
            CronJob::PaymentReminderSecond => &config.payment_reminder_second,
            CronJob::RegistrationPurge => &config.registration_purge,
        }
    }

    fn lock_key(&self) -> String {
        format!("dunning:lock:{}", self.as_str())
    }
}

impl fmt::Display for CronJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CronJob {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronJob::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown job: {s}"))
    }
}

/// A Marathon enrollment with everything needed to write to its payer.
#[derive(Debug, Clone, FromRow)]
pub struct DunningCandidate {
    pub enrollment_id: Uuid,
    pub location_id: Uuid,
    pub payment_status: PaymentStatus,
    pub next_payment_due: Option<DateTime<Utc>>,
    pub monthly_payment_received: bool,
    pub monthly_amount: Option<Decimal>,
    pub total_amount: Decimal,
    pub subscription_id: Option<String>,
    pub student_name: String,
    pub program_name: String,
    pub parent_email: String,
    pub parent_name: String,
    /// Completed payments since the start of the current month.
    pub recent_payments: Vec<DateTime<Utc>>,
}

impl DunningCandidate {
    pub fn notice(&self) -> DunningNotice {
        DunningNotice {
            enrollment_id: self.enrollment_id,
            to: Recipient {
                email: self.parent_email.clone(),
                name: self.parent_name.clone(),
            },
            student_name: self.student_name.clone(),
            program_name: self.program_name.clone(),
            amount: self.monthly_amount.unwrap_or(self.total_amount),
            due: self.next_payment_due,
            auto_pay: self.subscription_id.is_some(),
        }
    }
}

pub fn is_overdue(c: &DunningCandidate, now: DateTime<Utc>) -> bool {
    matches!(c.payment_status, PaymentStatus::Active | PaymentStatus::Pending)
        && !c.monthly_payment_received
        && c.next_payment_due.is_some_and(|due| due <= now)
}

/// `[first of next month, first of the month after)` relative to `now`, in UTC.
pub fn next_month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = first_of_next_month(now.date_naive());
    let end = first_of_next_month(start);
    (
        start.and_time(NaiveTime::MIN).and_utc(),
        end.and_time(NaiveTime::MIN).and_utc(),
    )
}

/// Active enrollments with no completed payment dated in the coming month,
/// unless they are already paid past it.
pub fn needs_reminder(c: &DunningCandidate, now: DateTime<Utc>) -> bool {
    let (start, end) = next_month_window(now);
    c.payment_status == PaymentStatus::Active
        && !c.recent_payments.iter().any(|paid| *paid >= start && *paid < end)
        && c.next_payment_due.map_or(true, |due| due < end)
}

#[async_trait]
pub trait DunningStore: Send + Sync {
    /// Active or pending Marathon enrollments, with completed payments since `since`.
    async fn marathon_candidates(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<DunningCandidate>>;

    /// Suspends the given enrollments that are still active or pending. Returns how many changed.
    async fn suspend(&self, ids: &[Uuid]) -> anyhow::Result<u64>;

    async fn owners(&self) -> anyhow::Result<Vec<Recipient>>;

    async fn purge_registrations(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Keeps two runs of the same job from overlapping.
#[async_trait]
pub trait JobLock: Send + Sync {
    async fn acquire(&self, job: CronJob) -> anyhow::Result<bool>;
    async fn release(&self, job: CronJob);
}

pub struct RedisJobLock {
    client: redis::Client,
}

impl RedisJobLock {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobLock for RedisJobLock {
    async fn acquire(&self, job: CronJob) -> anyhow::Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // SET NX EX: "OK" when newly set, nil when another run holds it.
        let newly_set: Option<String> = redis::cmd("SET")
            .arg(job.lock_key())
            .arg(Utc::now().to_rfc3339())
            .arg("NX")
            .arg("EX")
            .arg(RUN_LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(newly_set.is_some())
    }

    async fn release(&self, job: CronJob) {
        let result = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: i64 = redis::cmd("DEL")
                .arg(job.lock_key())
                .query_async(&mut conn)
                .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(job = job.as_str(), "failed to release run lock: {e}");
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobReport {
    pub job: CronJob,
    pub matched: u64,
    pub emails_sent: u64,
    pub suspended: u64,
    pub failures: u64,
    /// Another run held the lock, nothing was done.
    pub skipped: bool,
}

impl JobReport {
    fn new(job: CronJob) -> Self {
        Self {
            job,
            matched: 0,
            emails_sent: 0,
            suspended: 0,
            failures: 0,
            skipped: false,
        }
    }

    fn email(&mut self, result: anyhow::Result<()>, to: &str) {
        match result {
            Ok(()) => {
                self.emails_sent += 1;
                DUNNING_EMAILS_COUNTER
                    .with_label_values(&[self.job.as_str(), "sent"])
                    .inc();
            }
            Err(e) => {
                self.failures += 1;
                DUNNING_EMAILS_COUNTER
                    .with_label_values(&[self.job.as_str(), "failed"])
                    .inc();
                tracing::warn!(job = self.job.as_str(), to, "dunning email failed: {e:#}");
            }
        }
    }
}

pub struct DunningRunner {
    store: Arc<dyn DunningStore>,
    notifier: Arc<dyn Notifier>,
    lock: Arc<dyn JobLock>,
}

impl DunningRunner {
    pub fn new(store: Arc<dyn DunningStore>, notifier: Arc<dyn Notifier>, lock: Arc<dyn JobLock>) -> Self {
        Self {
            store,
            notifier,
            lock,
        }
    }

    /// Runs `job` once under its run lock.
    pub async fn run(&self, job: CronJob, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
        if !self.lock.acquire(job).await? {
            tracing::info!(job = job.as_str(), "another run holds the lock, skipping");
            DUNNING_RUNS_COUNTER
                .with_label_values(&[job.as_str(), "skipped"])
                .inc();
            let mut report = JobReport::new(job);
            report.skipped = true;
            return Ok(report);
        }

        let result = match job {
            CronJob::OverdueFirstNotice => self.overdue(job, Severity::First, now).await,
            CronJob::OverdueFinalNotice => self.overdue(job, Severity::Final, now).await,
            CronJob::PaymentReminder => self.reminders(job, Severity::First, now).await,
            CronJob::PaymentReminderSecond => self.reminders(job, Severity::Final, now).await,
            CronJob::RegistrationPurge => self.purge(now).await,
        };
        self.lock.release(job).await;

        match &result {
            Ok(report) => {
                DUNNING_RUNS_COUNTER.with_label_values(&[job.as_str(), "ok"]).inc();
                tracing::info!(
                    job = job.as_str(),
                    matched = report.matched,
                    emails_sent = report.emails_sent,
                    suspended = report.suspended,
                    failures = report.failures,
                    "job finished"
                );
            }
            Err(e) => {
                DUNNING_RUNS_COUNTER.with_label_values(&[job.as_str(), "failed"]).inc();
                tracing::error!(job = job.as_str(), "job failed: {e:#}");
            }
        }
        result
    }

    async fn candidates(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<DunningCandidate>> {
        let since = first_of_month(now.date_naive()).and_time(NaiveTime::MIN).and_utc();
        self.store.marathon_candidates(since).await
    }

    async fn overdue(&self, job: CronJob, severity: Severity, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
        let mut report = JobReport::new(job);
        let overdue: Vec<DunningCandidate> = self
            .candidates(now)
            .await?
            .into_iter()
            .filter(|c| is_overdue(c, now))
            .collect();
        report.matched = overdue.len() as u64;

        let notices: Vec<DunningNotice> = overdue.iter().map(DunningCandidate::notice).collect();
        for notice in &notices {
            let sent = self.notifier.overdue_notice(notice, severity).await;
            report.email(sent, &notice.to.email);
        }

        if severity == Severity::Final && !notices.is_empty() {
            let ids: Vec<Uuid> = overdue.iter().map(|c| c.enrollment_id).collect();
            report.suspended = self.store.suspend(&ids).await?;
            tracing::warn!(job = job.as_str(), count = report.suspended, "suspended overdue enrollments");

            for owner in self.store.owners().await? {
                let sent = self.notifier.suspension_summary(&owner, &notices).await;
                report.email(sent, &owner.email);
            }
        }
        Ok(report)
    }

    async fn reminders(&self, job: CronJob, severity: Severity, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
        let mut report = JobReport::new(job);
        let due: Vec<DunningCandidate> = self
            .candidates(now)
            .await?
            .into_iter()
            .filter(|c| needs_reminder(c, now))
            .collect();
        report.matched = due.len() as u64;

        for candidate in &due {
            let notice = candidate.notice();
            let sent = self.notifier.payment_reminder(&notice, severity).await;
            report.email(sent, &notice.to.email);
        }
        Ok(report)
    }

    async fn purge(&self, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
        let mut report = JobReport::new(CronJob::RegistrationPurge);
        report.matched = self.store.purge_registrations(now).await?;
        Ok(report)
    }
}

pub struct PgDunningStore {
    pool: PgPool,
}

impl PgDunningStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DunningStore for PgDunningStore {
    async fn marathon_candidates(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<DunningCandidate>> {
        Ok(sqlx::query_as::<_, DunningCandidate>(
            "SELECT e.id AS enrollment_id, e.location_id, e.payment_status, e.next_payment_due,
                    e.monthly_payment_received, e.monthly_amount, e.total_amount, e.subscription_id,
                    s.first_name || ' ' || s.last_name AS student_name,
                    p.name AS program_name,
                    u.email AS parent_email,
                    u.first_name || ' ' || u.last_name AS parent_name,
                    ARRAY(SELECT ep.paid_at FROM enrollment_payments ep
                          WHERE ep.enrollment_id = e.id AND ep.status = 'completed'
                            AND ep.paid_at >= $1) AS recent_payments
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             JOIN users u ON u.id = s.parent_id
             JOIN programs p ON p.id = e.program_id
             WHERE e.offering_type = 'marathon'
               AND e.payment_status IN ('active', 'pending')
             ORDER BY e.next_payment_due",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn suspend(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE enrollments SET payment_status = 'suspended', updated_at = NOW()
             WHERE id = ANY($1)
               AND offering_type = 'marathon'
               AND payment_status IN ('active', 'pending')",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn owners(&self) -> anyhow::Result<Vec<Recipient>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT email, first_name || ' ' || last_name FROM users
             WHERE role = 'owner' AND is_active = TRUE
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(email, name)| Recipient { email, name })
            .collect())
    }

    async fn purge_registrations(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        RegistrationService::purge_expired(&self.pool, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn candidate(status: PaymentStatus, due: DateTime<Utc>, received: bool) -> DunningCandidate {
        DunningCandidate {
            enrollment_id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            payment_status: status,
            next_payment_due: Some(due),
            monthly_payment_received: received,
            monthly_amount: Some(Decimal::new(11235, 2)),
            total_amount: Decimal::new(11235, 2),
            subscription_id: Some("sub_1".into()),
            student_name: "Tom Lovelace".into(),
            program_name: "Robotics".into(),
            parent_email: "ada@example.com".into(),
            parent_name: "Ada Lovelace".into(),
            recent_payments: Vec::new(),
        }
    }

    #[test]
    fn overdue_needs_a_past_due_date_and_no_payment() {
        let now = at(2024, 3, 2);
        assert!(is_overdue(&candidate(PaymentStatus::Active, at(2024, 3, 1), false), now));
        assert!(is_overdue(&candidate(PaymentStatus::Pending, at(2024, 3, 1), false), now));
        assert!(!is_overdue(&candidate(PaymentStatus::Active, at(2024, 3, 1), true), now));
        assert!(!is_overdue(&candidate(PaymentStatus::Active, at(2024, 4, 1), false), now));
        assert!(!is_overdue(&candidate(PaymentStatus::Suspended, at(2024, 3, 1), false), now));
    }

    #[test]
    fn next_month_window_crosses_year_end() {
        let (start, end) = next_month_window(at(2024, 12, 25));
        assert_eq!(start.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2025-02-01T00:00:00+00:00");
    }

    #[test]
    fn reminder_skips_paid_and_inactive_enrollments() {
        let now = at(2024, 3, 25);
        let due = at(2024, 4, 1);
        assert!(needs_reminder(&candidate(PaymentStatus::Active, due, false), now));
        assert!(!needs_reminder(&candidate(PaymentStatus::Pending, due, false), now));

        let mut paid = candidate(PaymentStatus::Active, due, false);
        paid.recent_payments.push(at(2024, 4, 1));
        assert!(!needs_reminder(&paid, now));

        let ahead = candidate(PaymentStatus::Active, at(2024, 5, 1), false);
        assert!(!needs_reminder(&ahead, now));
    }

    #[test]
    fn notice_reports_auto_pay() {
        let mut c = candidate(PaymentStatus::Active, at(2024, 4, 1), false);
        assert!(c.notice().auto_pay);
        c.subscription_id = None;
        assert!(!c.notice().auto_pay);
    }

    #[test]
    fn job_names_parse_back() {
        for job in CronJob::ALL {
            assert_eq!(job.as_str().parse::<CronJob>().unwrap(), job);
        }
        assert!("weekly_digest".parse::<CronJob>().is_err());
    }
}
