//! Enrollment saga: reserve seats, price, charge, persist, notify.
//!
//! Seats, discount uses and processor calls live outside the database
//! transaction that writes the enrollment, so each attempt remembers what it
//! has done and undoes it when a later step fails.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Months, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::class_session::{ClassSession, SeatPool, SlotRef};
use crate::models::discount::normalize_code;
use crate::models::enrollment::{
    CreateEnrollmentRequest, Enrollment, NewEnrollment, PaymentProcessor, PaymentRecord,
    PaymentStatus, PaymentUpdate, PendingCharge, TransactionStatus, UpdateEnrollmentRequest,
};
use crate::models::program::{OfferingType, Program, ProgramModule, ResolvedPricing};
use crate::models::registration::{FinalizeRegistrationRequest, Registration};
use crate::services::capacity::{ensure_distinct_weekdays, release_all, reserve_all, CapacityStore};
use crate::services::catalog::{existing_product_ref, CatalogCache};
use crate::services::discounts::DiscountEvaluator;
use crate::services::email::{EnrollmentConfirmation, Notifier, Recipient};
use crate::services::fees::{
    compute_first_payment_amount, compute_totals, first_of_month, first_of_next_month,
};
use crate::services::metrics::{ENROLLMENTS_COUNTER, PAYMENTS_ORPHANED_COUNTER};
use crate::services::payments::{
    ChargeRequest, ExternalStatus, Gateways, PaymentError, PaymentGateway, ProductRef,
    ProductSpec, SubscriptionInvoice, SubscriptionRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStage {
    Draft,
    CapacityReserved,
    FeesComputed,
    PaymentInitiated,
    PaymentConfirmed,
    Persisted,
    NotificationSent,
    Aborted,
}

impl EnrollmentStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, EnrollmentStage::NotificationSent | EnrollmentStage::Aborted)
    }

    pub fn can_advance_to(self, next: EnrollmentStage) -> bool {
        use EnrollmentStage::*;
        match (self, next) {
            (Draft, CapacityReserved)
            | (CapacityReserved, FeesComputed)
            | (FeesComputed, PaymentInitiated)
            | (PaymentInitiated, PaymentConfirmed)
            | (PaymentConfirmed, Persisted)
            | (Persisted, NotificationSent) => true,
            // Redirect processors: persisted as pending until the payer approves.
            (PaymentInitiated, Persisted) => true,
            (Draft | CapacityReserved | FeesComputed | PaymentInitiated | PaymentConfirmed, Aborted) => {
                true
            }
            _ => false,
        }
    }
}

/// Who is being enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentSource {
    Existing(Uuid),
    /// A checkout registration whose family accounts are created with the enrollment.
    Registration(Uuid),
}

#[derive(Debug, Clone)]
pub struct EnrollmentInput {
    pub student: StudentSource,
    pub program_id: Uuid,
    pub location_id: Uuid,
    pub class_session_ids: Vec<Uuid>,
    pub processor: PaymentProcessor,
    pub payment_method_id: String,
    pub discount_code: Option<String>,
    pub enrollment_date: NaiveDate,
}

impl EnrollmentInput {
    pub fn from_request(req: CreateEnrollmentRequest, today: NaiveDate) -> Self {
        Self {
            student: StudentSource::Existing(req.student_id),
            program_id: req.program_id,
            location_id: req.location_id,
            class_session_ids: req.class_session_ids,
            processor: req.payment_processor,
            payment_method_id: req.payment_method_id,
            discount_code: req.discount_code,
            enrollment_date: req.enrollment_date.unwrap_or(today),
        }
    }
}

/// A student together with the parent who pays for them.
#[derive(Debug, Clone)]
pub struct StudentContact {
    pub student_id: Uuid,
    pub location_id: Uuid,
    pub parent_id: Uuid,
    pub student_name: String,
    pub parent: Recipient,
}

/// Parent and student accounts created when a registration is finalized.
#[derive(Debug, Clone)]
pub struct NewFamily {
    pub location_id: Uuid,
    pub parent_first_name: String,
    pub parent_last_name: String,
    pub parent_email: String,
    pub parent_phone: Option<String>,
    pub student_first_name: String,
    pub student_last_name: String,
    pub student_birth_date: Option<NaiveDate>,
}

impl NewFamily {
    pub fn from_registration(reg: &Registration) -> Self {
        Self {
            location_id: reg.location_id,
            parent_first_name: reg.parent_first_name.clone(),
            parent_last_name: reg.parent_last_name.clone(),
            parent_email: reg.parent_email.trim().to_lowercase(),
            parent_phone: reg.parent_phone.clone(),
            student_first_name: reg.student_first_name.clone(),
            student_last_name: reg.student_last_name.clone(),
            student_birth_date: reg.student_birth_date,
        }
    }
}

/// Rows written next to the enrollment, in the same transaction.
#[derive(Debug, Clone, Default)]
pub struct PersistPlan {
    pub family: Option<NewFamily>,
    pub registration_id: Option<Uuid>,
    pub module_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct EnrollmentFilter {
    pub location_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn student(&self, id: Uuid) -> anyhow::Result<Option<StudentContact>>;

    async fn registration(&self, id: Uuid) -> anyhow::Result<Option<Registration>>;

    /// Processor customer created for this payer by an earlier enrollment.
    async fn known_customer(
        &self,
        parent_email: &str,
        processor: PaymentProcessor,
    ) -> anyhow::Result<Option<String>>;

    /// Writes the enrollment, its first history row, program and module
    /// progress, plus whatever `plan` adds, all or nothing.
    async fn persist(&self, new: &NewEnrollment, plan: &PersistPlan) -> anyhow::Result<Enrollment>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Enrollment>>;

    async fn find_by_subscription(&self, subscription_id: &str) -> anyhow::Result<Option<Enrollment>>;

    async fn list(&self, filter: &EnrollmentFilter) -> anyhow::Result<Vec<Enrollment>>;

    async fn payments(&self, id: Uuid) -> anyhow::Result<Vec<PaymentRecord>>;

    /// Applies `update` only while the status is still `expected`.
    async fn apply_update(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        update: &PaymentUpdate,
    ) -> anyhow::Result<Option<Enrollment>>;

    async fn append_payment(&self, id: Uuid, record: &PaymentRecord) -> anyhow::Result<()>;

    async fn update_fields(
        &self,
        id: Uuid,
        req: &UpdateEnrollmentRequest,
    ) -> anyhow::Result<Option<Enrollment>>;

    /// Removes the enrollment with its progress and payment history.
    async fn delete_cascade(&self, id: Uuid) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentReceipt {
    pub enrollment: Enrollment,
    /// Present while the payer still has to approve at the processor.
    pub approval_url: Option<String>,
    pub stage: EnrollmentStage,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResult {
    pub enrollment: Enrollment,
    pub approval_url: Option<String>,
}

/// Side effects of one attempt that must be undone if it aborts.
struct Attempt {
    id: Uuid,
    stage: EnrollmentStage,
    reserved: Vec<SlotRef>,
    discount_id: Option<Uuid>,
    subscription: Option<(Arc<dyn PaymentGateway>, String)>,
    completed_charge: Option<(PaymentProcessor, String)>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: EnrollmentStage::Draft,
            reserved: Vec::new(),
            discount_id: None,
            subscription: None,
            completed_charge: None,
        }
    }

    fn advance(&mut self, next: EnrollmentStage) -> AppResult<()> {
        if !self.stage.can_advance_to(next) {
            return Err(AppError::Internal(anyhow::anyhow!(
                "illegal enrollment stage change {:?} -> {:?}",
                self.stage,
                next
            )));
        }
        tracing::debug!(attempt = %self.id, from = ?self.stage, to = ?next, "enrollment stage");
        self.stage = next;
        Ok(())
    }
}

struct Payer {
    student_id: Option<Uuid>,
    student_name: String,
    recipient: Recipient,
    family: Option<NewFamily>,
    registration_id: Option<Uuid>,
}

pub fn session_slots(ids: &[Uuid]) -> Vec<SlotRef> {
    ids.iter().map(|id| SlotRef::Session(*id)).collect()
}

/// Midnight UTC at the start of the month after `date`.
pub fn next_billing_start(date: NaiveDate) -> DateTime<Utc> {
    first_of_next_month(date).and_time(NaiveTime::MIN).and_utc()
}

/// Session picks must be non-empty, distinct and match the program's weekly count.
pub fn check_selection(program: &Program, ids: &[Uuid]) -> AppResult<()> {
    if ids.is_empty() {
        return Err(AppError::validation("Select at least one class session"));
    }
    let unique: HashSet<&Uuid> = ids.iter().collect();
    if unique.len() != ids.len() {
        return Err(AppError::validation("A class session was selected twice"));
    }
    if ids.len() != program.sessions_per_week as usize {
        return Err(AppError::validation(format!(
            "{} requires {} session(s) per week",
            program.name, program.sessions_per_week
        )));
    }
    Ok(())
}

pub fn check_finalizable(reg: &Registration, now: DateTime<Utc>) -> AppResult<()> {
    if reg.is_registration_complete {
        return Err(AppError::conflict("Registration has already been finalized"));
    }
    if reg.is_expired(now) {
        return Err(AppError::validation("Registration has expired"));
    }
    Ok(())
}

fn check_enrollment_date(date: NaiveDate, now: DateTime<Utc>) -> AppResult<()> {
    if date < first_of_month(now.date_naive()) {
        return Err(AppError::validation("Enrollment date cannot be in a past month"));
    }
    Ok(())
}

fn one_month_after(due: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    due.checked_add_months(Months::new(1))
        .ok_or_else(|| AppError::validation("Next payment date is out of range"))
}

/// What a manual payment collects now: the monthly amount for Marathon, the total for a pending Sprint.
fn amount_due(enrollment: &Enrollment) -> AppResult<Decimal> {
    let status = enrollment.payment_status;
    let collectable = match enrollment.offering_type {
        OfferingType::Marathon => matches!(status, PaymentStatus::Active | PaymentStatus::Suspended),
        OfferingType::Sprint => status == PaymentStatus::Pending,
    };
    if !collectable {
        return Err(AppError::conflict(format!(
            "Cannot collect a payment for a {} enrollment",
            status.as_str()
        )));
    }
    Ok(match enrollment.offering_type {
        OfferingType::Marathon => enrollment.monthly_amount.unwrap_or(enrollment.total_amount),
        OfferingType::Sprint => enrollment.total_amount,
    })
}

/// Books a completed payment. Marathon moves on to the next billing cycle.
fn settled_update(
    enrollment: &Enrollment,
    amount: Decimal,
    transaction_id: String,
    now: DateTime<Utc>,
) -> AppResult<PaymentUpdate> {
    let pending = if enrollment.pending_transaction_id.as_deref() == Some(transaction_id.as_str()) {
        PendingCharge::Clear
    } else {
        PendingCharge::Keep
    };
    let record = PaymentRecord {
        amount,
        paid_at: now,
        status: TransactionStatus::Completed,
        processor: enrollment.payment_processor,
        transaction_id: Some(transaction_id.clone()),
    };
    if enrollment.offering_type.is_recurring() {
        let paid_due = enrollment.next_payment_due.unwrap_or(now);
        Ok(PaymentUpdate {
            status: PaymentStatus::Active,
            record: Some(record),
            // The flag tracks the cycle at the new due date.
            monthly_payment_received: Some(false),
            next_payment_due: Some(one_month_after(paid_due)?),
            transaction_id: Some(transaction_id),
            payment_date: Some(now),
            pending,
        })
    } else {
        Ok(PaymentUpdate {
            status: PaymentStatus::Completed,
            record: Some(record),
            monthly_payment_received: None,
            next_payment_due: None,
            transaction_id: Some(transaction_id),
            payment_date: Some(now),
            pending,
        })
    }
}

pub struct EnrollmentOrchestrator {
    store: Arc<dyn EnrollmentStore>,
    capacity: Arc<dyn CapacityStore>,
    catalog: Arc<CatalogCache>,
    discounts: Arc<DiscountEvaluator>,
    gateways: Gateways,
    notifier: Arc<dyn Notifier>,
}

impl EnrollmentOrchestrator {
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        capacity: Arc<dyn CapacityStore>,
        catalog: Arc<CatalogCache>,
        discounts: Arc<DiscountEvaluator>,
        gateways: Gateways,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            capacity,
            catalog,
            discounts,
            gateways,
            notifier,
        }
    }

    pub async fn enroll(&self, input: EnrollmentInput, now: DateTime<Utc>) -> AppResult<EnrollmentReceipt> {
        let (program, pricing) = self.catalog.resolve(input.location_id, input.program_id).await?;
        let payer = self.resolve_payer(&input, now).await?;
        check_enrollment_date(input.enrollment_date, now)?;
        self.load_sessions(&program, input.location_id, &input.class_session_ids)
            .await?;
        let modules = self.catalog.modules(program.id).await?;

        let mut attempt = Attempt::new();
        let offering = program.offering_type.as_str();
        attempt.reserved = match reserve_all(
            self.capacity.as_ref(),
            &session_slots(&input.class_session_ids),
            SeatPool::Regular,
        )
        .await
        {
            Ok(reserved) => reserved,
            Err(e) => {
                ENROLLMENTS_COUNTER.with_label_values(&[offering, "aborted"]).inc();
                return Err(e);
            }
        };
        attempt.advance(EnrollmentStage::CapacityReserved)?;

        match self
            .complete(&mut attempt, &input, &program, pricing, &payer, &modules, now)
            .await
        {
            Ok(receipt) => {
                ENROLLMENTS_COUNTER.with_label_values(&[offering, "persisted"]).inc();
                tracing::info!(
                    enrollment_id = %receipt.enrollment.id,
                    program = %program.name,
                    status = receipt.enrollment.payment_status.as_str(),
                    "enrollment created"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(attempt = %attempt.id, stage = ?attempt.stage, "enrollment aborted: {e}");
                self.compensate(&mut attempt).await;
                ENROLLMENTS_COUNTER.with_label_values(&[offering, "aborted"]).inc();
                Err(e)
            }
        }
    }

    pub async fn finalize_registration(
        &self,
        registration_id: Uuid,
        req: FinalizeRegistrationRequest,
        now: DateTime<Utc>,
    ) -> AppResult<EnrollmentReceipt> {
        let reg = self.registration(registration_id).await?;
        check_finalizable(&reg, now)?;
        let input = EnrollmentInput {
            student: StudentSource::Registration(reg.id),
            program_id: reg.program_id,
            location_id: reg.location_id,
            class_session_ids: reg.class_session_ids.clone(),
            processor: req.payment_processor,
            payment_method_id: req.payment_method_id,
            discount_code: reg.discount_code.clone(),
            enrollment_date: req.enrollment_date.unwrap_or_else(|| now.date_naive()),
        };
        self.enroll(input, now).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        attempt: &mut Attempt,
        input: &EnrollmentInput,
        program: &Program,
        pricing: ResolvedPricing,
        payer: &Payer,
        modules: &[ProgramModule],
        now: DateTime<Utc>,
    ) -> AppResult<EnrollmentReceipt> {
        let discount_code = input
            .discount_code
            .as_deref()
            .map(normalize_code)
            .filter(|c| !c.is_empty());
        let discount_percent = match &discount_code {
            Some(code) => {
                let redemption = self.discounts.apply(code, input.location_id, now).await?;
                attempt.discount_id = Some(redemption.id);
                Some(redemption.percent)
            }
            None => None,
        };
        let quote = compute_totals(
            pricing.base_price,
            pricing.admin_fee_percent,
            pricing.tax_percent,
            discount_percent,
        )?;
        let recurring = program.offering_type.is_recurring();
        let first_payment = if recurring {
            Some(compute_first_payment_amount(input.enrollment_date, quote.total_amount)?)
        } else {
            None
        };
        attempt.advance(EnrollmentStage::FeesComputed)?;

        let gateway = self.gateways.get(input.processor)?;
        attempt.advance(EnrollmentStage::PaymentInitiated)?;
        let customer_id = self.customer_for(gateway.as_ref(), &payer.recipient).await?;
        if !gateway
            .is_already_attached(&customer_id, &input.payment_method_id)
            .await?
        {
            gateway
                .attach_payment_method(&customer_id, &input.payment_method_id)
                .await?;
        }
        let product = self
            .product_for(gateway.as_ref(), program, quote.total_amount)
            .await?;

        let billing_start = next_billing_start(input.enrollment_date);
        let outcome = if recurring {
            let outcome = gateway
                .create_subscription(&SubscriptionRequest {
                    customer_id: customer_id.clone(),
                    payment_method_id: input.payment_method_id.clone(),
                    product,
                    monthly_amount: quote.total_amount,
                    setup_fee: first_payment.filter(|a| !a.is_zero()),
                    trial_end: Some(billing_start.timestamp()),
                    reference: attempt.id,
                })
                .await?;
            attempt.subscription = Some((gateway.clone(), outcome.id.clone()));
            outcome
        } else {
            let outcome = gateway
                .charge_once(&ChargeRequest {
                    customer_id: customer_id.clone(),
                    payment_method_id: input.payment_method_id.clone(),
                    product,
                    amount: quote.total_amount,
                    description: format!("{} enrollment", program.name),
                    reference: attempt.id,
                })
                .await?;
            if outcome.status == ExternalStatus::Completed {
                attempt.completed_charge = Some((input.processor, outcome.id.clone()));
            }
            outcome
        };

        let confirmed = match outcome.status {
            ExternalStatus::Completed => {
                attempt.advance(EnrollmentStage::PaymentConfirmed)?;
                true
            }
            ExternalStatus::Pending => false,
            ExternalStatus::Failed | ExternalStatus::Cancelled => {
                return Err(PaymentError::Declined(format!(
                    "{} ended as {:?}",
                    outcome.id, outcome.status
                ))
                .into());
            }
        };

        let payment_status = match (confirmed, recurring) {
            (false, _) => PaymentStatus::Pending,
            (true, true) => PaymentStatus::Active,
            (true, false) => PaymentStatus::Completed,
        };
        let initial_amount = if recurring {
            first_payment.filter(|a| !a.is_zero())
        } else {
            Some(quote.total_amount)
        };
        let initial_payment = initial_amount.map(|amount| PaymentRecord {
            amount,
            paid_at: now,
            status: if confirmed {
                TransactionStatus::Completed
            } else {
                TransactionStatus::Pending
            },
            processor: input.processor,
            transaction_id: Some(outcome.id.clone()),
        });
        let new = NewEnrollment {
            id: attempt.id,
            student_id: payer.student_id,
            program_id: program.id,
            location_id: input.location_id,
            offering_type: program.offering_type,
            class_session_ids: input.class_session_ids.clone(),
            base_amount: quote.base_amount,
            discount_code,
            discount_amount: quote.discount_amount,
            admin_fee: quote.admin_fee,
            tax_amount: quote.tax_amount,
            total_amount: quote.total_amount,
            first_payment_amount: first_payment,
            payment_processor: input.processor,
            payment_status,
            customer_id,
            payment_method_id: input.payment_method_id.clone(),
            subscription_id: recurring.then(|| outcome.id.clone()),
            monthly_amount: recurring.then_some(quote.total_amount),
            next_payment_due: recurring.then_some(billing_start),
            payment_date: (confirmed && initial_amount.is_some()).then_some(now),
            transaction_id: (!recurring).then(|| outcome.id.clone()),
            enrollment_date: input.enrollment_date,
            initial_payment,
        };
        let plan = PersistPlan {
            family: payer.family.clone(),
            registration_id: payer.registration_id,
            module_ids: modules.iter().map(|m| m.id).collect(),
        };

        let enrollment = self
            .store
            .persist(&new, &plan)
            .await
            .map_err(|e| AppError::TransactionAborted(format!("{e:#}")))?;
        attempt.advance(EnrollmentStage::Persisted)?;

        let confirmation = EnrollmentConfirmation {
            to: payer.recipient.clone(),
            student_name: payer.student_name.clone(),
            program_name: program.name.clone(),
            offering_type: program.offering_type,
            total_amount: enrollment.total_amount,
            first_payment_amount: enrollment.first_payment_amount,
            next_payment_due: enrollment.next_payment_due,
            approval_url: outcome.approval_url.clone(),
        };
        match self.notifier.enrollment_confirmation(&confirmation).await {
            Ok(()) => attempt.advance(EnrollmentStage::NotificationSent)?,
            Err(e) => {
                tracing::warn!(enrollment_id = %enrollment.id, "confirmation email failed: {e:#}")
            }
        }

        Ok(EnrollmentReceipt {
            enrollment,
            approval_url: outcome.approval_url,
            stage: attempt.stage,
        })
    }

    async fn compensate(&self, attempt: &mut Attempt) {
        if let Some((gateway, subscription_id)) = attempt.subscription.take() {
            match gateway.cancel_subscription(&subscription_id).await {
                Ok(()) => tracing::info!(%subscription_id, "cancelled subscription of aborted enrollment"),
                Err(e) => tracing::error!(
                    %subscription_id,
                    "subscription of aborted enrollment is still live: {e}"
                ),
            }
        }
        if let Some((processor, transaction_id)) = attempt.completed_charge.take() {
            PAYMENTS_ORPHANED_COUNTER
                .with_label_values(&[processor.as_str()])
                .inc();
            tracing::error!(
                attempt = %attempt.id,
                processor = processor.as_str(),
                %transaction_id,
                "charge captured for an aborted enrollment, refund required"
            );
        }
        if let Some(discount_id) = attempt.discount_id.take() {
            self.discounts.restore(discount_id).await;
        }
        release_all(self.capacity.as_ref(), &attempt.reserved, SeatPool::Regular).await;
        attempt.reserved.clear();
        if let Err(e) = attempt.advance(EnrollmentStage::Aborted) {
            tracing::error!("{e}");
        }
    }

    async fn resolve_payer(&self, input: &EnrollmentInput, now: DateTime<Utc>) -> AppResult<Payer> {
        match input.student {
            StudentSource::Existing(student_id) => {
                let contact = self.student(student_id).await?;
                if contact.location_id != input.location_id {
                    return Err(AppError::validation("Student belongs to another location"));
                }
                Ok(Payer {
                    student_id: Some(contact.student_id),
                    student_name: contact.student_name,
                    recipient: contact.parent,
                    family: None,
                    registration_id: None,
                })
            }
            StudentSource::Registration(id) => {
                let reg = self.registration(id).await?;
                check_finalizable(&reg, now)?;
                Ok(Payer {
                    student_id: None,
                    student_name: format!("{} {}", reg.student_first_name, reg.student_last_name),
                    recipient: Recipient {
                        email: reg.parent_email.clone(),
                        name: reg.parent_name(),
                    },
                    family: Some(NewFamily::from_registration(&reg)),
                    registration_id: Some(reg.id),
                })
            }
        }
    }

    async fn load_sessions(
        &self,
        program: &Program,
        location_id: Uuid,
        ids: &[Uuid],
    ) -> AppResult<Vec<ClassSession>> {
        check_selection(program, ids)?;
        let sessions = self.capacity.load_sessions(ids).await?;
        if sessions.len() != ids.len() {
            return Err(AppError::not_found("Class session not found"));
        }
        if sessions.iter().any(|s| s.location_id != location_id) {
            return Err(AppError::validation("Class session belongs to another location"));
        }
        ensure_distinct_weekdays(&sessions)?;
        Ok(sessions)
    }

    /// Reuses the payer's customer from an earlier enrollment, so a saved card
    /// already attached to it is found by the attach check.
    async fn customer_for(&self, gateway: &dyn PaymentGateway, payer: &Recipient) -> AppResult<String> {
        if let Some(customer_id) = self
            .store
            .known_customer(&payer.email, gateway.processor())
            .await?
        {
            return Ok(customer_id);
        }
        Ok(gateway.create_customer(&payer.email, &payer.name).await?)
    }

    async fn product_for(
        &self,
        gateway: &dyn PaymentGateway,
        program: &Program,
        monthly_amount: Decimal,
    ) -> AppResult<ProductRef> {
        let existing = existing_product_ref(program, gateway.processor());
        let product = gateway
            .ensure_product(&ProductSpec {
                program_id: program.id,
                name: program.name.clone(),
                offering_type: program.offering_type,
                monthly_amount,
                existing: existing.clone(),
            })
            .await?;
        if existing.as_ref() != Some(&product) {
            self.catalog
                .record_product_ref(program.id, gateway.processor(), &product)
                .await?;
        }
        Ok(product)
    }

    /// Status change guarded by the transition table and by the stored status.
    async fn transition(&self, current: &Enrollment, update: PaymentUpdate) -> AppResult<Enrollment> {
        let from = current.payment_status;
        if from != update.status && !from.can_transition(update.status, current.offering_type) {
            return Err(AppError::conflict(format!(
                "Enrollment cannot move from {} to {}",
                from.as_str(),
                update.status.as_str()
            )));
        }
        self.store
            .apply_update(current.id, from, &update)
            .await?
            .ok_or_else(|| AppError::conflict("Enrollment was changed by another request"))
    }

    pub async fn student(&self, id: Uuid) -> AppResult<StudentContact> {
        self.store
            .student(id)
            .await?
            .ok_or_else(|| AppError::not_found("Student not found"))
    }

    async fn registration(&self, id: Uuid) -> AppResult<Registration> {
        self.store
            .registration(id)
            .await?
            .ok_or_else(|| AppError::not_found("Registration not found"))
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Enrollment> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("Enrollment not found"))
    }

    pub async fn list(&self, filter: &EnrollmentFilter) -> AppResult<Vec<Enrollment>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn payments(&self, id: Uuid) -> AppResult<Vec<PaymentRecord>> {
        Ok(self.store.payments(id).await?)
    }

    /// Parent who pays for the enrollment's student.
    pub async fn payer_of(&self, enrollment: &Enrollment) -> AppResult<StudentContact> {
        self.student(enrollment.student_id).await
    }

    pub async fn update(&self, id: Uuid, req: &UpdateEnrollmentRequest) -> AppResult<Enrollment> {
        if req
            .payment_method_id
            .as_deref()
            .is_some_and(|pm| pm.trim().is_empty())
        {
            return Err(AppError::validation("payment_method_id cannot be empty"));
        }
        self.store
            .update_fields(id, req)
            .await?
            .ok_or_else(|| AppError::not_found("Enrollment not found"))
    }

    pub async fn delete_enrollment(&self, id: Uuid) -> AppResult<()> {
        let enrollment = self.get(id).await?;
        if enrollment.offering_type.is_recurring() && !enrollment.payment_status.is_terminal() {
            if let Some(subscription_id) = enrollment.subscription_id.as_deref() {
                let gateway = self.gateways.get(enrollment.payment_processor)?;
                gateway.cancel_subscription(subscription_id).await?;
            }
        }
        let deleted = self
            .store
            .delete_cascade(id)
            .await
            .map_err(|e| AppError::TransactionAborted(format!("{e:#}")))?;
        if !deleted {
            return Err(AppError::not_found("Enrollment not found"));
        }
        if enrollment.payment_status != PaymentStatus::Cancelled {
            release_all(
                self.capacity.as_ref(),
                &session_slots(&enrollment.class_session_ids),
                SeatPool::Regular,
            )
            .await;
        }
        tracing::info!(enrollment_id = %id, "enrollment deleted");
        Ok(())
    }

    /// Stops billing at the processor first, then marks the enrollment cancelled.
    pub async fn cancel_subscription(&self, id: Uuid) -> AppResult<Enrollment> {
        let enrollment = self.get(id).await?;
        if !enrollment.offering_type.is_recurring() {
            return Err(AppError::validation("Only Marathon enrollments have a subscription"));
        }
        if !enrollment
            .payment_status
            .can_transition(PaymentStatus::Cancelled, enrollment.offering_type)
        {
            return Err(AppError::conflict(format!(
                "Enrollment is already {}",
                enrollment.payment_status.as_str()
            )));
        }
        let subscription_id = enrollment
            .subscription_id
            .as_deref()
            .ok_or_else(|| AppError::conflict("Enrollment has no subscription"))?;
        let gateway = self.gateways.get(enrollment.payment_processor)?;
        gateway.cancel_subscription(subscription_id).await?;

        let updated = self
            .transition(&enrollment, PaymentUpdate::status_only(PaymentStatus::Cancelled))
            .await?;
        release_all(
            self.capacity.as_ref(),
            &session_slots(&enrollment.class_session_ids),
            SeatPool::Regular,
        )
        .await;
        tracing::info!(enrollment_id = %id, %subscription_id, "subscription cancelled");
        Ok(updated)
    }

    /// Collects what is owed now. A subscription is asked to settle its open
    /// invoice; only enrollments without one are charged directly.
    pub async fn process_payment(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<PaymentResult> {
        let enrollment = self.get(id).await?;
        let amount = amount_due(&enrollment)?;
        if enrollment.pending_transaction_id.is_some() {
            return Err(AppError::conflict("A payment is already awaiting approval"));
        }

        let gateway = self.gateways.get(enrollment.payment_processor)?;
        let subscription_id = enrollment
            .subscription_id
            .as_deref()
            .filter(|_| enrollment.offering_type.is_recurring());
        let result = match subscription_id {
            Some(subscription_id) => match gateway.collect_subscription_balance(subscription_id).await {
                Ok(Some(outcome)) => Ok(outcome),
                Ok(None) => {
                    return Err(AppError::conflict(
                        "Nothing is outstanding on this subscription",
                    ))
                }
                Err(e) => Err(e),
            },
            None => {
                let program = self.catalog.program(enrollment.program_id).await?;
                let product = self.product_for(gateway.as_ref(), &program, amount).await?;
                gateway
                    .charge_once(&ChargeRequest {
                        customer_id: enrollment.customer_id.clone(),
                        payment_method_id: enrollment.payment_method_id.clone(),
                        product,
                        amount,
                        description: format!("{} payment", program.name),
                        reference: enrollment.id,
                    })
                    .await
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_payment(&enrollment, amount, TransactionStatus::Failed, None, now)
                    .await;
                return Err(e.into());
            }
        };

        match outcome.status {
            ExternalStatus::Completed => {
                let update = settled_update(&enrollment, amount, outcome.id, now)?;
                let updated = self.transition(&enrollment, update).await?;
                tracing::info!(enrollment_id = %id, %amount, "payment collected");
                Ok(PaymentResult {
                    enrollment: updated,
                    approval_url: None,
                })
            }
            ExternalStatus::Pending => {
                let update = PaymentUpdate {
                    record: Some(PaymentRecord {
                        amount,
                        paid_at: now,
                        status: TransactionStatus::Pending,
                        processor: enrollment.payment_processor,
                        transaction_id: Some(outcome.id.clone()),
                    }),
                    pending: PendingCharge::Set(outcome.id.clone()),
                    ..PaymentUpdate::status_only(enrollment.payment_status)
                };
                let updated = self.transition(&enrollment, update).await?;
                tracing::info!(enrollment_id = %id, transaction_id = %outcome.id, "payment awaiting approval");
                Ok(PaymentResult {
                    enrollment: updated,
                    approval_url: outcome.approval_url,
                })
            }
            ExternalStatus::Failed | ExternalStatus::Cancelled => {
                self.record_payment(
                    &enrollment,
                    amount,
                    TransactionStatus::Failed,
                    Some(outcome.id.clone()),
                    now,
                )
                .await;
                Err(PaymentError::Declined(format!("{} ended as {:?}", outcome.id, outcome.status)).into())
            }
        }
    }

    /// Books an invoice the processor billed on a subscription by itself.
    /// Redelivered invoices are recognised by id and change nothing.
    pub async fn record_subscription_invoice(
        &self,
        invoice: &SubscriptionInvoice,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Enrollment>> {
        let Some(enrollment) = self
            .store
            .find_by_subscription(&invoice.subscription_id)
            .await?
        else {
            tracing::debug!(subscription_id = %invoice.subscription_id, "invoice for an unknown subscription");
            return Ok(None);
        };
        let history = self.store.payments(enrollment.id).await?;
        let already_booked = history.iter().any(|p| {
            p.status == TransactionStatus::Completed
                && p.transaction_id.as_deref() == Some(invoice.invoice_id.as_str())
        });
        if already_booked {
            return Ok(Some(enrollment));
        }

        if !invoice.paid {
            self.record_payment(
                &enrollment,
                invoice.amount,
                TransactionStatus::Failed,
                Some(invoice.invoice_id.clone()),
                now,
            )
            .await;
            tracing::warn!(
                enrollment_id = %enrollment.id,
                invoice_id = %invoice.invoice_id,
                "subscription invoice payment failed"
            );
            return Ok(Some(enrollment));
        }
        // The opening invoice carries the first payment, booked at enrollment.
        if !invoice.renewal {
            return Ok(Some(enrollment));
        }
        if !matches!(
            enrollment.payment_status,
            PaymentStatus::Active | PaymentStatus::Suspended
        ) {
            tracing::warn!(
                enrollment_id = %enrollment.id,
                invoice_id = %invoice.invoice_id,
                status = enrollment.payment_status.as_str(),
                "paid invoice for an enrollment that is not billing"
            );
            return Ok(Some(enrollment));
        }

        let update = settled_update(&enrollment, invoice.amount, invoice.invoice_id.clone(), now)?;
        let updated = self.transition(&enrollment, update).await?;
        tracing::info!(
            enrollment_id = %enrollment.id,
            invoice_id = %invoice.invoice_id,
            amount = %invoice.amount,
            "subscription invoice paid"
        );
        Ok(Some(updated))
    }

    async fn record_payment(
        &self,
        enrollment: &Enrollment,
        amount: Decimal,
        status: TransactionStatus,
        transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        let record = PaymentRecord {
            amount,
            paid_at: now,
            status,
            processor: enrollment.payment_processor,
            transaction_id,
        };
        if let Err(e) = self.store.append_payment(enrollment.id, &record).await {
            tracing::error!(enrollment_id = %enrollment.id, "failed to record payment attempt: {e:#}");
        }
    }

    /// Settles what the payer approved at the processor: a manual payment
    /// still in flight, or else the enrollment's own pending first payment.
    pub async fn confirm_external_payment(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Enrollment> {
        let enrollment = self.get(id).await?;
        if let Some(transaction_id) = enrollment.pending_transaction_id.clone() {
            return self.settle_pending_charge(&enrollment, transaction_id, now).await;
        }
        if enrollment.payment_status != PaymentStatus::Pending {
            return Ok(enrollment);
        }
        let gateway = self.gateways.get(enrollment.payment_processor)?;
        let recurring = enrollment.offering_type.is_recurring();
        let pending_id = if recurring {
            enrollment.subscription_id.clone()
        } else {
            enrollment.transaction_id.clone()
        };
        let external_id =
            pending_id.ok_or_else(|| AppError::conflict("Enrollment has no pending payment"))?;
        let status = if recurring {
            gateway.fetch_subscription_status(&external_id).await?
        } else {
            gateway.fetch_charge_status(&external_id).await?
        };

        match status {
            ExternalStatus::Completed => {
                let amount = if recurring {
                    enrollment.first_payment_amount.filter(|a| !a.is_zero())
                } else {
                    Some(enrollment.total_amount)
                };
                let update = PaymentUpdate {
                    status: if recurring {
                        PaymentStatus::Active
                    } else {
                        PaymentStatus::Completed
                    },
                    record: amount.map(|amount| PaymentRecord {
                        amount,
                        paid_at: now,
                        status: TransactionStatus::Completed,
                        processor: enrollment.payment_processor,
                        transaction_id: Some(external_id.clone()),
                    }),
                    monthly_payment_received: None,
                    next_payment_due: None,
                    transaction_id: None,
                    payment_date: Some(now),
                    pending: PendingCharge::Keep,
                };
                let updated = self.transition(&enrollment, update).await?;
                tracing::info!(enrollment_id = %id, "external payment confirmed");
                Ok(updated)
            }
            ExternalStatus::Pending => Err(AppError::conflict("Payment has not been approved yet")),
            ExternalStatus::Failed | ExternalStatus::Cancelled => {
                self.cancel_pending(&enrollment).await?;
                Err(PaymentError::Declined("payment was not approved".into()).into())
            }
        }
    }

    async fn settle_pending_charge(
        &self,
        enrollment: &Enrollment,
        transaction_id: String,
        now: DateTime<Utc>,
    ) -> AppResult<Enrollment> {
        let amount = amount_due(enrollment)?;
        let gateway = self.gateways.get(enrollment.payment_processor)?;
        match gateway.fetch_charge_status(&transaction_id).await? {
            ExternalStatus::Completed => {
                let update = settled_update(enrollment, amount, transaction_id.clone(), now)?;
                let updated = self.transition(enrollment, update).await?;
                tracing::info!(enrollment_id = %enrollment.id, %transaction_id, "approved payment settled");
                Ok(updated)
            }
            ExternalStatus::Pending => Err(AppError::conflict("Payment has not been approved yet")),
            ExternalStatus::Failed | ExternalStatus::Cancelled => {
                self.abandon_pending_charge(enrollment, transaction_id, amount, now)
                    .await?;
                Err(PaymentError::Declined("payment was not approved".into()).into())
            }
        }
    }

    /// Marks an in-flight manual charge failed. The enrollment keeps its status.
    async fn abandon_pending_charge(
        &self,
        enrollment: &Enrollment,
        transaction_id: String,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> AppResult<Enrollment> {
        let update = PaymentUpdate {
            record: Some(PaymentRecord {
                amount,
                paid_at: now,
                status: TransactionStatus::Failed,
                processor: enrollment.payment_processor,
                transaction_id: Some(transaction_id),
            }),
            pending: PendingCharge::Clear,
            ..PaymentUpdate::status_only(enrollment.payment_status)
        };
        self.transition(enrollment, update).await
    }

    /// The payer backed out at the processor. `reference` is the order or
    /// subscription id the processor hands back, and must be one this
    /// enrollment is waiting on.
    pub async fn cancel_external_payment(
        &self,
        id: Uuid,
        reference: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Enrollment> {
        let enrollment = self.get(id).await?;
        if enrollment.pending_transaction_id.as_deref() == Some(reference) {
            let amount = amount_due(&enrollment)?;
            return self
                .abandon_pending_charge(&enrollment, reference.to_string(), amount, now)
                .await;
        }
        let awaited = [
            enrollment.transaction_id.as_deref(),
            enrollment.subscription_id.as_deref(),
        ];
        if !awaited.contains(&Some(reference)) {
            return Err(AppError::not_found("No pending payment matches this reference"));
        }
        if enrollment.payment_status != PaymentStatus::Pending {
            return Err(AppError::conflict(format!(
                "Enrollment is {}, not awaiting payment",
                enrollment.payment_status.as_str()
            )));
        }
        self.cancel_pending(&enrollment).await
    }

    async fn cancel_pending(&self, enrollment: &Enrollment) -> AppResult<Enrollment> {
        if let Some(subscription_id) = enrollment.subscription_id.as_deref() {
            let gateway = self.gateways.get(enrollment.payment_processor)?;
            if let Err(e) = gateway.cancel_subscription(subscription_id).await {
                tracing::warn!(%subscription_id, "could not cancel unapproved subscription: {e}");
            }
        }
        let updated = self
            .transition(enrollment, PaymentUpdate::status_only(PaymentStatus::Cancelled))
            .await?;
        release_all(
            self.capacity.as_ref(),
            &session_slots(&enrollment.class_session_ids),
            SeatPool::Regular,
        )
        .await;
        if let Some(code) = enrollment.discount_code.as_deref() {
            self.discounts.restore_code(code, enrollment.location_id).await;
        }
        tracing::info!(enrollment_id = %enrollment.id, "pending enrollment cancelled");
        Ok(updated)
    }
}

// --- Postgres store ---

pub struct PgEnrollmentStore {
    pool: PgPool,
}

impl PgEnrollmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type ContactRow = (Uuid, Uuid, Uuid, String, String, String);

async fn insert_payment(
    conn: &mut sqlx::PgConnection,
    enrollment_id: Uuid,
    record: &PaymentRecord,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO enrollment_payments (enrollment_id, amount, paid_at, status, processor, transaction_id)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(enrollment_id)
    .bind(record.amount)
    .bind(record.paid_at)
    .bind(record.status)
    .bind(record.processor)
    .bind(&record.transaction_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Settles the `pending` history row of the same transaction, or appends a new row.
async fn record_outcome(
    conn: &mut sqlx::PgConnection,
    enrollment_id: Uuid,
    record: &PaymentRecord,
) -> sqlx::Result<()> {
    if record.status != TransactionStatus::Pending {
        if let Some(transaction_id) = &record.transaction_id {
            let settled = sqlx::query(
                "UPDATE enrollment_payments SET status = $3, paid_at = $4, amount = $5
                 WHERE enrollment_id = $1 AND transaction_id = $2 AND status = 'pending'",
            )
            .bind(enrollment_id)
            .bind(transaction_id)
            .bind(record.status)
            .bind(record.paid_at)
            .bind(record.amount)
            .execute(&mut *conn)
            .await?;
            if settled.rows_affected() > 0 {
                return Ok(());
            }
        }
    }
    insert_payment(conn, enrollment_id, record).await
}

#[async_trait]
impl EnrollmentStore for PgEnrollmentStore {
    async fn student(&self, id: Uuid) -> anyhow::Result<Option<StudentContact>> {
        let row = sqlx::query_as::<_, ContactRow>(
            "SELECT s.id, s.location_id, s.parent_id,
                    s.first_name || ' ' || s.last_name,
                    u.email, u.first_name || ' ' || u.last_name
             FROM students s JOIN users u ON u.id = s.parent_id
             WHERE s.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(student_id, location_id, parent_id, student_name, email, name)| StudentContact {
                student_id,
                location_id,
                parent_id,
                student_name,
                parent: Recipient { email, name },
            },
        ))
    }

    async fn known_customer(
        &self,
        parent_email: &str,
        processor: PaymentProcessor,
    ) -> anyhow::Result<Option<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT e.customer_id FROM enrollments e
             JOIN students s ON s.id = e.student_id
             JOIN users u ON u.id = s.parent_id
             WHERE lower(u.email) = lower($1) AND e.payment_processor = $2
             ORDER BY e.created_at DESC
             LIMIT 1",
        )
        .bind(parent_email)
        .bind(processor)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn registration(&self, id: Uuid) -> anyhow::Result<Option<Registration>> {
        Ok(
            sqlx::query_as::<_, Registration>("SELECT * FROM registrations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn persist(&self, new: &NewEnrollment, plan: &PersistPlan) -> anyhow::Result<Enrollment> {
        let mut tx = self.pool.begin().await?;

        let student_id = match (new.student_id, &plan.family) {
            (Some(id), _) => id,
            (None, Some(family)) => {
                let parent_id: Uuid = sqlx::query_scalar(
                    "INSERT INTO users (email, first_name, last_name, phone, role, location_id)
                     VALUES ($1, $2, $3, $4, 'parent', $5)
                     ON CONFLICT (email) DO UPDATE SET updated_at = NOW()
                     RETURNING id",
                )
                .bind(&family.parent_email)
                .bind(&family.parent_first_name)
                .bind(&family.parent_last_name)
                .bind(&family.parent_phone)
                .bind(family.location_id)
                .fetch_one(&mut *tx)
                .await?;
                sqlx::query_scalar(
                    "INSERT INTO students (parent_id, location_id, first_name, last_name, birth_date)
                     VALUES ($1, $2, $3, $4, $5)
                     RETURNING id",
                )
                .bind(parent_id)
                .bind(family.location_id)
                .bind(&family.student_first_name)
                .bind(&family.student_last_name)
                .bind(family.student_birth_date)
                .fetch_one(&mut *tx)
                .await?
            }
            (None, None) => anyhow::bail!("enrollment {} has no student", new.id),
        };

        let enrollment = sqlx::query_as::<_, Enrollment>(
            "INSERT INTO enrollments (
                id, student_id, program_id, location_id, offering_type, class_session_ids,
                base_amount, discount_code, discount_amount, admin_fee, tax_amount, total_amount,
                first_payment_amount, payment_processor, payment_status, customer_id,
                payment_method_id, subscription_id, monthly_amount, next_payment_due,
                payment_date, transaction_id, enrollment_date)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22, $23)
             RETURNING *",
        )
        .bind(new.id)
        .bind(student_id)
        .bind(new.program_id)
        .bind(new.location_id)
        .bind(new.offering_type)
        .bind(&new.class_session_ids)
        .bind(new.base_amount)
        .bind(&new.discount_code)
        .bind(new.discount_amount)
        .bind(new.admin_fee)
        .bind(new.tax_amount)
        .bind(new.total_amount)
        .bind(new.first_payment_amount)
        .bind(new.payment_processor)
        .bind(new.payment_status)
        .bind(&new.customer_id)
        .bind(&new.payment_method_id)
        .bind(&new.subscription_id)
        .bind(new.monthly_amount)
        .bind(new.next_payment_due)
        .bind(new.payment_date)
        .bind(&new.transaction_id)
        .bind(new.enrollment_date)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(record) = &new.initial_payment {
            insert_payment(&mut tx, enrollment.id, record).await?;
        }

        let progress_id: Uuid = sqlx::query_scalar(
            "INSERT INTO program_progress (enrollment_id, student_id, program_id)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(enrollment.id)
        .bind(student_id)
        .bind(new.program_id)
        .fetch_one(&mut *tx)
        .await?;

        for module_id in &plan.module_ids {
            sqlx::query(
                "INSERT INTO module_progress (program_progress_id, module_id, student_id, total_topics)
                 SELECT $1, $2, $3, COUNT(*)::INT FROM module_topics WHERE module_id = $2",
            )
            .bind(progress_id)
            .bind(module_id)
            .bind(student_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(registration_id) = plan.registration_id {
            let linked = sqlx::query(
                "UPDATE registrations
                 SET is_registration_complete = TRUE, is_reg_linked_with_enrollment = TRUE,
                     is_user_setup = TRUE, enrollment_id = $2, payment_processor = $3,
                     customer_id = $4
                 WHERE id = $1 AND is_registration_complete = FALSE",
            )
            .bind(registration_id)
            .bind(enrollment.id)
            .bind(new.payment_processor)
            .bind(&new.customer_id)
            .execute(&mut *tx)
            .await?;
            if linked.rows_affected() == 0 {
                anyhow::bail!("registration {registration_id} was finalized concurrently");
            }
        }

        tx.commit().await?;
        Ok(enrollment)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Enrollment>> {
        Ok(
            sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> anyhow::Result<Option<Enrollment>> {
        Ok(sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE subscription_id = $1
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list(&self, filter: &EnrollmentFilter) -> anyhow::Result<Vec<Enrollment>> {
        Ok(sqlx::query_as::<_, Enrollment>(
            "SELECT e.* FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE ($1::UUID IS NULL OR e.location_id = $1)
               AND ($2::UUID IS NULL OR e.student_id = $2)
               AND ($3::UUID IS NULL OR s.parent_id = $3)
               AND ($4::payment_status IS NULL OR e.payment_status = $4)
             ORDER BY e.created_at DESC",
        )
        .bind(filter.location_id)
        .bind(filter.student_id)
        .bind(filter.parent_id)
        .bind(filter.status)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn payments(&self, id: Uuid) -> anyhow::Result<Vec<PaymentRecord>> {
        Ok(sqlx::query_as::<_, PaymentRecord>(
            "SELECT amount, paid_at, status, processor, transaction_id
             FROM enrollment_payments WHERE enrollment_id = $1
             ORDER BY paid_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn apply_update(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        update: &PaymentUpdate,
    ) -> anyhow::Result<Option<Enrollment>> {
        let (touch_pending, pending_id) = match &update.pending {
            PendingCharge::Keep => (false, None),
            PendingCharge::Set(id) => (true, Some(id.as_str())),
            PendingCharge::Clear => (true, None),
        };
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_as::<_, Enrollment>(
            "UPDATE enrollments SET
                payment_status = $3,
                monthly_payment_received = COALESCE($4, monthly_payment_received),
                next_payment_due = COALESCE($5, next_payment_due),
                transaction_id = COALESCE($6, transaction_id),
                payment_date = COALESCE($7, payment_date),
                pending_transaction_id = CASE WHEN $8 THEN $9 ELSE pending_transaction_id END,
                updated_at = NOW()
             WHERE id = $1 AND payment_status = $2
             RETURNING *",
        )
        .bind(id)
        .bind(expected)
        .bind(update.status)
        .bind(update.monthly_payment_received)
        .bind(update.next_payment_due)
        .bind(&update.transaction_id)
        .bind(update.payment_date)
        .bind(touch_pending)
        .bind(pending_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(updated) = updated else {
            return Ok(None);
        };
        if let Some(record) = &update.record {
            record_outcome(&mut tx, id, record).await?;
        }
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn append_payment(&self, id: Uuid, record: &PaymentRecord) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_payment(&mut conn, id, record).await?;
        Ok(())
    }

    async fn update_fields(
        &self,
        id: Uuid,
        req: &UpdateEnrollmentRequest,
    ) -> anyhow::Result<Option<Enrollment>> {
        Ok(sqlx::query_as::<_, Enrollment>(
            "UPDATE enrollments SET
                next_payment_due = COALESCE($2, next_payment_due),
                monthly_payment_received = COALESCE($3, monthly_payment_received),
                payment_method_id = COALESCE($4, payment_method_id),
                updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.next_payment_due)
        .bind(req.monthly_payment_received)
        .bind(req.payment_method_id.as_deref().map(str::trim))
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn delete_cascade(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM module_progress WHERE program_progress_id IN
                (SELECT id FROM program_progress WHERE enrollment_id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM program_progress WHERE enrollment_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM enrollment_payments WHERE enrollment_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM enrollments WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::EnrollmentStage::*;
    use super::*;

    #[test]
    fn happy_path_is_a_legal_sequence() {
        let path = [
            Draft,
            CapacityReserved,
            FeesComputed,
            PaymentInitiated,
            PaymentConfirmed,
            Persisted,
            NotificationSent,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn abort_is_only_possible_before_persisting() {
        for stage in [Draft, CapacityReserved, FeesComputed, PaymentInitiated, PaymentConfirmed] {
            assert!(stage.can_advance_to(Aborted));
        }
        assert!(!Persisted.can_advance_to(Aborted));
        assert!(!NotificationSent.can_advance_to(Aborted));
        assert!(!Aborted.can_advance_to(Draft));
    }

    #[test]
    fn stages_cannot_be_skipped() {
        assert!(!Draft.can_advance_to(FeesComputed));
        assert!(!CapacityReserved.can_advance_to(PaymentInitiated));
        assert!(!FeesComputed.can_advance_to(Persisted));
        assert!(PaymentInitiated.can_advance_to(Persisted));
    }

    #[test]
    fn attempt_rejects_illegal_moves() {
        let mut attempt = Attempt::new();
        assert!(attempt.advance(PaymentConfirmed).is_err());
        assert_eq!(attempt.stage, Draft);
        attempt.advance(CapacityReserved).unwrap();
        attempt.advance(Aborted).unwrap();
        assert!(attempt.stage.is_terminal());
    }

    #[test]
    fn billing_starts_on_the_first_of_next_month() {
        let start = next_billing_start(NaiveDate::from_ymd_opt(2024, 12, 17).unwrap());
        assert_eq!(start.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn due_dates_advance_by_calendar_month() {
        let due = next_billing_start(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let next = one_month_after(due).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-01T00:00:00+00:00");
    }
}
