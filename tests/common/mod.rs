//! In-memory stand-ins for the Postgres stores, the processors and SMTP.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use academy_api::models::class_session::{ClassSession, SeatPool, SessionType, SlotRef};
use academy_api::models::discount::{DiscountCode, DiscountUsage};
use academy_api::models::enrollment::{
    Enrollment, NewEnrollment, PaymentProcessor, PaymentRecord, PaymentStatus, PaymentUpdate,
    PendingCharge, TransactionStatus, UpdateEnrollmentRequest,
};
use academy_api::models::location::LocationOffering;
use academy_api::models::program::{OfferingType, Program, ProgramModule};
use academy_api::models::registration::REGISTRATION_TTL_DAYS;
use academy_api::models::registration::Registration;
use academy_api::services::capacity::CapacityStore;
use academy_api::services::catalog::{CatalogCache, CatalogSource};
use academy_api::services::discounts::{DiscountEvaluator, DiscountLedger};
use academy_api::services::dunning::{CronJob, DunningCandidate, DunningStore, JobLock};
use academy_api::services::email::{
    DunningNotice, EnrollmentConfirmation, Notifier, Recipient, Severity,
};
use academy_api::services::enrollment::{
    EnrollmentFilter, EnrollmentInput, EnrollmentOrchestrator, EnrollmentStore, NewFamily,
    PersistPlan, StudentContact, StudentSource,
};
use academy_api::services::payments::{
    ChargeRequest, ExternalStatus, GatewayOutcome, Gateways, PaymentError, PaymentGateway,
    ProductRef, ProductSpec, SubscriptionRequest,
};

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

// --- capacity ---

#[derive(Default)]
pub struct MemCapacity {
    pub sessions: Mutex<HashMap<Uuid, ClassSession>>,
    pub reserve_calls: AtomicUsize,
}

impl MemCapacity {
    pub fn add(&self, location_id: Uuid, weekday: i16, seats: i32) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.sessions.lock().unwrap().insert(
            id,
            ClassSession {
                id,
                location_id,
                weekday,
                start_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(17, 30, 0).unwrap(),
                session_type: SessionType::Weekday,
                total_seats: seats,
                available_seats: seats,
                demo_total_seats: 2,
                demo_available_seats: 2,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn available(&self, id: Uuid) -> i32 {
        self.sessions.lock().unwrap()[&id].available_seats
    }

    pub fn set_available(&self, id: Uuid, available: i32) {
        if let Some(s) = self.sessions.lock().unwrap().get_mut(&id) {
            s.available_seats = available;
        }
    }
}

#[async_trait]
impl CapacityStore for MemCapacity {
    async fn load_sessions(&self, ids: &[Uuid]) -> anyhow::Result<Vec<ClassSession>> {
        let sessions = self.sessions.lock().unwrap();
        Ok(ids.iter().filter_map(|id| sessions.get(id).cloned()).collect())
    }

    async fn reserve(&self, slot: SlotRef, pool: SeatPool) -> anyhow::Result<bool> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        let SlotRef::Session(id) = slot else {
            return Ok(false);
        };
        let mut sessions = self.sessions.lock().unwrap();
        let Some(s) = sessions.get_mut(&id) else {
            return Ok(false);
        };
        let available = match pool {
            SeatPool::Regular => &mut s.available_seats,
            SeatPool::Demo => &mut s.demo_available_seats,
        };
        if *available <= 0 {
            return Ok(false);
        }
        *available -= 1;
        Ok(true)
    }

    async fn release(&self, slot: SlotRef, pool: SeatPool) -> anyhow::Result<bool> {
        let SlotRef::Session(id) = slot else {
            return Ok(false);
        };
        let mut sessions = self.sessions.lock().unwrap();
        let Some(s) = sessions.get_mut(&id) else {
            return Ok(false);
        };
        let (available, total) = match pool {
            SeatPool::Regular => (&mut s.available_seats, s.total_seats),
            SeatPool::Demo => (&mut s.demo_available_seats, s.demo_total_seats),
        };
        if *available >= total {
            return Ok(false);
        }
        *available += 1;
        Ok(true)
    }
}

// --- catalog ---

#[derive(Default)]
pub struct MemCatalog {
    pub programs: Mutex<HashMap<Uuid, Program>>,
    pub offerings: Mutex<HashMap<(Uuid, Uuid), LocationOffering>>,
    pub modules: Mutex<HashMap<Uuid, Vec<ProgramModule>>>,
}

pub fn program(offering_type: OfferingType, price: Decimal, sessions_per_week: i32) -> Program {
    let now = Utc::now();
    Program {
        id: Uuid::new_v4(),
        name: match offering_type {
            OfferingType::Marathon => "Robotics Marathon".to_string(),
            OfferingType::Sprint => "Coding Sprint".to_string(),
        },
        description: None,
        offering_type,
        price,
        admin_fee_percent: Decimal::from(5),
        tax_percent: Decimal::from(7),
        sessions_per_week,
        duration_weeks: None,
        stripe_product_id: None,
        paypal_product_id: None,
        paypal_plan_id: None,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

impl MemCatalog {
    pub fn offer(&self, location_id: Uuid, program: Program) {
        let program_id = program.id;
        self.modules.lock().unwrap().insert(
            program_id,
            vec![ProgramModule {
                id: Uuid::new_v4(),
                program_id,
                title: "Getting started".to_string(),
                position: 1,
            }],
        );
        self.programs.lock().unwrap().insert(program_id, program);
        self.offerings.lock().unwrap().insert(
            (location_id, program_id),
            LocationOffering {
                location_id,
                program_id,
                price_override: None,
                admin_fee_percent: None,
                tax_percent: None,
                is_active: true,
            },
        );
    }
}

#[async_trait]
impl CatalogSource for MemCatalog {
    async fn program(&self, id: Uuid) -> anyhow::Result<Option<Program>> {
        Ok(self.programs.lock().unwrap().get(&id).cloned())
    }

    async fn offering(
        &self,
        location_id: Uuid,
        program_id: Uuid,
    ) -> anyhow::Result<Option<LocationOffering>> {
        Ok(self
            .offerings
            .lock()
            .unwrap()
            .get(&(location_id, program_id))
            .cloned())
    }

    async fn modules(&self, program_id: Uuid) -> anyhow::Result<Vec<ProgramModule>> {
        Ok(self
            .modules
            .lock()
            .unwrap()
            .get(&program_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_product_ref(
        &self,
        program_id: Uuid,
        processor: PaymentProcessor,
        product: &ProductRef,
    ) -> anyhow::Result<()> {
        if let Some(p) = self.programs.lock().unwrap().get_mut(&program_id) {
            match processor {
                PaymentProcessor::Stripe => p.stripe_product_id = Some(product.product_id.clone()),
                PaymentProcessor::Paypal => {
                    p.paypal_product_id = Some(product.product_id.clone());
                    p.paypal_plan_id = product.plan_id.clone();
                }
            }
        }
        Ok(())
    }
}

// --- discount codes ---

#[derive(Default)]
pub struct MemDiscounts {
    pub codes: Mutex<HashMap<Uuid, DiscountCode>>,
}

impl MemDiscounts {
    pub fn add(
        &self,
        location_id: Uuid,
        code: &str,
        percent: i64,
        usage_type: DiscountUsage,
        max_uses: Option<i32>,
        expire_date: Option<DateTime<Utc>>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.codes.lock().unwrap().insert(
            id,
            DiscountCode {
                id,
                code: code.to_string(),
                description: Some(format!("{percent}% off")),
                percent: Decimal::from(percent),
                usage_type,
                max_uses,
                current_uses: 0,
                expire_date,
                is_active: true,
                location_id,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn uses(&self, id: Uuid) -> i32 {
        self.codes.lock().unwrap()[&id].current_uses
    }
}

#[async_trait]
impl DiscountLedger for MemDiscounts {
    async fn find(&self, code: &str, location_id: Uuid) -> anyhow::Result<Option<DiscountCode>> {
        Ok(self
            .codes
            .lock()
            .unwrap()
            .values()
            .find(|c| c.code == code && c.location_id == location_id)
            .cloned())
    }

    async fn redeem(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<Option<DiscountCode>> {
        let mut codes = self.codes.lock().unwrap();
        let Some(code) = codes.get_mut(&id) else {
            return Ok(None);
        };
        if !code.is_usable(now) {
            return Ok(None);
        }
        code.current_uses += 1;
        Ok(Some(code.clone()))
    }

    async fn restore(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(code) = self.codes.lock().unwrap().get_mut(&id) {
            code.current_uses = (code.current_uses - 1).max(0);
        }
        Ok(())
    }
}

// --- processor ---

pub struct FakeGateway {
    pub processor: PaymentProcessor,
    pub status: Mutex<ExternalStatus>,
    /// Name of the call that should fail, e.g. "charge_once".
    pub fail_at: Mutex<Option<&'static str>>,
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub subscriptions: Mutex<Vec<SubscriptionRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    /// Emails a processor customer was created for.
    pub customers: Mutex<Vec<String>>,
    pub attached: Mutex<HashSet<(String, String)>>,
    pub attach_calls: AtomicUsize,
    /// Subscriptions asked to settle their open invoice.
    pub collected: Mutex<Vec<String>>,
    pub open_balance: AtomicBool,
    /// Charge ids whose status was looked up.
    pub fetched: Mutex<Vec<String>>,
    seq: AtomicUsize,
}

impl FakeGateway {
    pub fn new(processor: PaymentProcessor) -> Self {
        Self {
            processor,
            status: Mutex::new(ExternalStatus::Completed),
            fail_at: Mutex::new(None),
            charges: Mutex::default(),
            subscriptions: Mutex::default(),
            cancelled: Mutex::default(),
            customers: Mutex::default(),
            attached: Mutex::default(),
            attach_calls: AtomicUsize::new(0),
            collected: Mutex::default(),
            open_balance: AtomicBool::new(true),
            fetched: Mutex::default(),
            seq: AtomicUsize::new(1),
        }
    }

    pub fn respond_with(&self, status: ExternalStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn fail_at(&self, call: &'static str) {
        *self.fail_at.lock().unwrap() = Some(call);
    }

    fn check(&self, call: &'static str) -> Result<(), PaymentError> {
        if *self.fail_at.lock().unwrap() == Some(call) {
            return Err(PaymentError::Gateway {
                status: 402,
                message: format!("{call} rejected"),
            });
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.seq.fetch_add(1, Ordering::SeqCst))
    }

    fn outcome(&self, id: String) -> GatewayOutcome {
        let status = *self.status.lock().unwrap();
        GatewayOutcome {
            approval_url: (status == ExternalStatus::Pending)
                .then(|| format!("https://processor.test/approve/{id}")),
            id,
            status,
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn processor(&self) -> PaymentProcessor {
        self.processor
    }

    async fn create_customer(&self, email: &str, _name: &str) -> Result<String, PaymentError> {
        self.check("create_customer")?;
        self.customers.lock().unwrap().push(email.to_string());
        Ok(self.next_id("cus"))
    }

    async fn is_already_attached(&self, customer_id: &str, pm: &str) -> Result<bool, PaymentError> {
        Ok(self
            .attached
            .lock()
            .unwrap()
            .contains(&(customer_id.to_string(), pm.to_string())))
    }

    async fn attach_payment_method(&self, customer_id: &str, pm: &str) -> Result<(), PaymentError> {
        self.check("attach_payment_method")?;
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        // A card can only belong to one customer.
        let mut attached = self.attached.lock().unwrap();
        if attached.iter().any(|(c, p)| p == pm && c != customer_id) {
            return Err(PaymentError::Gateway {
                status: 400,
                message: format!("{pm} is attached to another customer"),
            });
        }
        attached.insert((customer_id.to_string(), pm.to_string()));
        Ok(())
    }

    async fn ensure_product(&self, spec: &ProductSpec) -> Result<ProductRef, PaymentError> {
        self.check("ensure_product")?;
        Ok(spec.existing.clone().unwrap_or_else(|| ProductRef {
            product_id: self.next_id("prod"),
            plan_id: None,
        }))
    }

    async fn charge_once(&self, req: &ChargeRequest) -> Result<GatewayOutcome, PaymentError> {
        self.check("charge_once")?;
        self.charges.lock().unwrap().push(req.clone());
        Ok(self.outcome(self.next_id("ch")))
    }

    async fn create_subscription(
        &self,
        req: &SubscriptionRequest,
    ) -> Result<GatewayOutcome, PaymentError> {
        self.check("create_subscription")?;
        self.subscriptions.lock().unwrap().push(req.clone());
        Ok(self.outcome(self.next_id("sub")))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), PaymentError> {
        self.check("cancel_subscription")?;
        self.cancelled.lock().unwrap().push(subscription_id.to_string());
        Ok(())
    }

    async fn collect_subscription_balance(
        &self,
        subscription_id: &str,
    ) -> Result<Option<GatewayOutcome>, PaymentError> {
        self.check("collect_subscription_balance")?;
        if !self.open_balance.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.collected.lock().unwrap().push(subscription_id.to_string());
        Ok(Some(self.outcome(self.next_id("in"))))
    }

    async fn fetch_charge_status(&self, transaction_id: &str) -> Result<ExternalStatus, PaymentError> {
        self.fetched.lock().unwrap().push(transaction_id.to_string());
        Ok(*self.status.lock().unwrap())
    }

    async fn fetch_subscription_status(
        &self,
        _subscription_id: &str,
    ) -> Result<ExternalStatus, PaymentError> {
        Ok(*self.status.lock().unwrap())
    }
}

// --- notifications ---

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, line: String) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("smtp unavailable"));
        }
        self.sent.lock().unwrap().push(line);
        Ok(())
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::First => "first",
        Severity::Final => "final",
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn enrollment_confirmation(&self, msg: &EnrollmentConfirmation) -> anyhow::Result<()> {
        self.record(format!("confirmation:{}", msg.to.email))
    }

    async fn overdue_notice(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()> {
        self.record(format!("overdue:{}:{}", severity_label(severity), notice.to.email))
    }

    async fn payment_reminder(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()> {
        self.record(format!("reminder:{}:{}", severity_label(severity), notice.to.email))
    }

    async fn suspension_summary(&self, owner: &Recipient, suspended: &[DunningNotice]) -> anyhow::Result<()> {
        self.record(format!("summary:{}:{}", owner.email, suspended.len()))
    }
}

// --- enrollments ---

#[derive(Default)]
pub struct MemEnrollments {
    pub students: Mutex<HashMap<Uuid, StudentContact>>,
    pub registrations: Mutex<HashMap<Uuid, Registration>>,
    pub enrollments: Mutex<HashMap<Uuid, Enrollment>>,
    pub payments: Mutex<HashMap<Uuid, Vec<PaymentRecord>>>,
    pub families: Mutex<Vec<NewFamily>>,
    /// Module ids with a progress row, per enrollment.
    pub progress: Mutex<HashMap<Uuid, Vec<Uuid>>>,
    pub fail_persist: AtomicBool,
}

impl MemEnrollments {
    pub fn add_student(&self, location_id: Uuid) -> StudentContact {
        let contact = StudentContact {
            student_id: Uuid::new_v4(),
            location_id,
            parent_id: Uuid::new_v4(),
            student_name: "Ada Lovelace".to_string(),
            parent: Recipient {
                email: "parent@example.com".to_string(),
                name: "Anne Lovelace".to_string(),
            },
        };
        self.students
            .lock()
            .unwrap()
            .insert(contact.student_id, contact.clone());
        contact
    }

    pub fn count(&self) -> usize {
        self.enrollments.lock().unwrap().len()
    }

    pub fn add_registration(&self, reg: Registration) {
        self.registrations.lock().unwrap().insert(reg.id, reg);
    }
}

/// An unfinished checkout for one program, created at `created_at`.
pub fn registration(
    location_id: Uuid,
    program: &Program,
    class_session_ids: Vec<Uuid>,
    created_at: DateTime<Utc>,
) -> Registration {
    Registration {
        id: Uuid::new_v4(),
        location_id,
        program_id: program.id,
        parent_first_name: "Grace".to_string(),
        parent_last_name: "Hopper".to_string(),
        parent_email: "grace@example.com".to_string(),
        parent_phone: None,
        student_first_name: "Walter".to_string(),
        student_last_name: "Hopper".to_string(),
        student_birth_date: Some(date(2014, 3, 9)),
        class_session_ids,
        offering_type: program.offering_type,
        base_amount: program.price,
        discount_code: None,
        discount_percent: None,
        admin_fee_percent: program.admin_fee_percent,
        tax_percent: program.tax_percent,
        first_payment_amount: cents(11235),
        total_amount_due: cents(11235),
        payment_processor: None,
        customer_id: None,
        enrollment_id: None,
        is_registration_complete: false,
        is_reg_linked_with_enrollment: false,
        is_user_setup: false,
        created_at,
        expires_at: created_at + chrono::Duration::days(REGISTRATION_TTL_DAYS),
    }
}

#[async_trait]
impl EnrollmentStore for MemEnrollments {
    async fn student(&self, id: Uuid) -> anyhow::Result<Option<StudentContact>> {
        Ok(self.students.lock().unwrap().get(&id).cloned())
    }

    async fn registration(&self, id: Uuid) -> anyhow::Result<Option<Registration>> {
        Ok(self.registrations.lock().unwrap().get(&id).cloned())
    }

    async fn known_customer(
        &self,
        parent_email: &str,
        processor: PaymentProcessor,
    ) -> anyhow::Result<Option<String>> {
        let students = self.students.lock().unwrap();
        Ok(self
            .enrollments
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.payment_processor == processor)
            .filter(|e| {
                students
                    .get(&e.student_id)
                    .is_some_and(|s| s.parent.email.eq_ignore_ascii_case(parent_email))
            })
            .max_by_key(|e| e.created_at)
            .map(|e| e.customer_id.clone()))
    }

    async fn persist(&self, new: &NewEnrollment, plan: &PersistPlan) -> anyhow::Result<Enrollment> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(anyhow!("insert into enrollments failed"));
        }
        let now = Utc::now();
        if let Some(registration_id) = plan.registration_id {
            let mut registrations = self.registrations.lock().unwrap();
            let reg = registrations
                .get_mut(&registration_id)
                .ok_or_else(|| anyhow!("registration {registration_id} not found"))?;
            if reg.is_registration_complete {
                return Err(anyhow!("registration {registration_id} already finalized"));
            }
            reg.is_registration_complete = true;
            reg.is_reg_linked_with_enrollment = true;
            reg.is_user_setup = plan.family.is_some();
            reg.enrollment_id = Some(new.id);
            reg.payment_processor = Some(new.payment_processor);
            reg.customer_id = Some(new.customer_id.clone());
        }
        let student_id = match (&plan.family, new.student_id) {
            (_, Some(id)) => id,
            (Some(family), None) => {
                let contact = StudentContact {
                    student_id: Uuid::new_v4(),
                    location_id: family.location_id,
                    parent_id: Uuid::new_v4(),
                    student_name: format!("{} {}", family.student_first_name, family.student_last_name),
                    parent: Recipient {
                        email: family.parent_email.clone(),
                        name: format!("{} {}", family.parent_first_name, family.parent_last_name),
                    },
                };
                self.families.lock().unwrap().push(family.clone());
                self.students
                    .lock()
                    .unwrap()
                    .insert(contact.student_id, contact.clone());
                contact.student_id
            }
            (None, None) => return Err(anyhow!("enrollment has no student")),
        };
        self.progress
            .lock()
            .unwrap()
            .insert(new.id, plan.module_ids.clone());
        let enrollment = Enrollment {
            id: new.id,
            student_id,
            program_id: new.program_id,
            location_id: new.location_id,
            offering_type: new.offering_type,
            class_session_ids: new.class_session_ids.clone(),
            base_amount: new.base_amount,
            discount_code: new.discount_code.clone(),
            discount_amount: new.discount_amount,
            admin_fee: new.admin_fee,
            tax_amount: new.tax_amount,
            total_amount: new.total_amount,
            first_payment_amount: new.first_payment_amount,
            payment_processor: new.payment_processor,
            payment_status: new.payment_status,
            customer_id: new.customer_id.clone(),
            payment_method_id: new.payment_method_id.clone(),
            subscription_id: new.subscription_id.clone(),
            monthly_amount: new.monthly_amount,
            next_payment_due: new.next_payment_due,
            monthly_payment_received: false,
            payment_date: new.payment_date,
            transaction_id: new.transaction_id.clone(),
            pending_transaction_id: None,
            enrollment_date: new.enrollment_date,
            created_at: now,
            updated_at: now,
        };
        self.enrollments
            .lock()
            .unwrap()
            .insert(enrollment.id, enrollment.clone());
        self.payments
            .lock()
            .unwrap()
            .insert(enrollment.id, new.initial_payment.clone().into_iter().collect());
        Ok(enrollment)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Enrollment>> {
        Ok(self.enrollments.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> anyhow::Result<Option<Enrollment>> {
        Ok(self
            .enrollments
            .lock()
            .unwrap()
            .values()
            .find(|e| e.subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn list(&self, filter: &EnrollmentFilter) -> anyhow::Result<Vec<Enrollment>> {
        let students = self.students.lock().unwrap();
        Ok(self
            .enrollments
            .lock()
            .unwrap()
            .values()
            .filter(|e| filter.location_id.map_or(true, |l| e.location_id == l))
            .filter(|e| filter.student_id.map_or(true, |s| e.student_id == s))
            .filter(|e| filter.status.map_or(true, |s| e.payment_status == s))
            .filter(|e| {
                filter.parent_id.map_or(true, |p| {
                    students.get(&e.student_id).is_some_and(|s| s.parent_id == p)
                })
            })
            .cloned()
            .collect())
    }

    async fn payments(&self, id: Uuid) -> anyhow::Result<Vec<PaymentRecord>> {
        Ok(self
            .payments
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_update(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        update: &PaymentUpdate,
    ) -> anyhow::Result<Option<Enrollment>> {
        let mut enrollments = self.enrollments.lock().unwrap();
        let Some(e) = enrollments.get_mut(&id) else {
            return Ok(None);
        };
        if e.payment_status != expected {
            return Ok(None);
        }
        e.payment_status = update.status;
        if let Some(received) = update.monthly_payment_received {
            e.monthly_payment_received = received;
        }
        if let Some(due) = update.next_payment_due {
            e.next_payment_due = Some(due);
        }
        if let Some(tx) = &update.transaction_id {
            e.transaction_id = Some(tx.clone());
        }
        if let Some(paid) = update.payment_date {
            e.payment_date = Some(paid);
        }
        match &update.pending {
            PendingCharge::Keep => {}
            PendingCharge::Set(tx) => e.pending_transaction_id = Some(tx.clone()),
            PendingCharge::Clear => e.pending_transaction_id = None,
        }
        e.updated_at = Utc::now();
        if let Some(record) = &update.record {
            let mut payments = self.payments.lock().unwrap();
            let history = payments.entry(id).or_default();
            let pending_row = history.iter_mut().find(|p| {
                record.status != TransactionStatus::Pending
                    && record.transaction_id.is_some()
                    && p.status == TransactionStatus::Pending
                    && p.transaction_id == record.transaction_id
            });
            match pending_row {
                Some(row) => *row = record.clone(),
                None => history.push(record.clone()),
            }
        }
        Ok(Some(e.clone()))
    }

    async fn append_payment(&self, id: Uuid, record: &PaymentRecord) -> anyhow::Result<()> {
        self.payments
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn update_fields(
        &self,
        id: Uuid,
        req: &UpdateEnrollmentRequest,
    ) -> anyhow::Result<Option<Enrollment>> {
        let mut enrollments = self.enrollments.lock().unwrap();
        let Some(e) = enrollments.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(due) = req.next_payment_due {
            e.next_payment_due = Some(due);
        }
        if let Some(received) = req.monthly_payment_received {
            e.monthly_payment_received = received;
        }
        if let Some(pm) = &req.payment_method_id {
            e.payment_method_id = pm.clone();
        }
        Ok(Some(e.clone()))
    }

    async fn delete_cascade(&self, id: Uuid) -> anyhow::Result<bool> {
        self.progress.lock().unwrap().remove(&id);
        self.payments.lock().unwrap().remove(&id);
        Ok(self.enrollments.lock().unwrap().remove(&id).is_some())
    }
}

// --- dunning ---

#[derive(Default)]
pub struct MemDunning {
    pub candidates: Mutex<Vec<DunningCandidate>>,
    pub suspended: Mutex<Vec<Uuid>>,
    pub owners: Vec<Recipient>,
    pub purged: u64,
}

#[async_trait]
impl DunningStore for MemDunning {
    async fn marathon_candidates(&self, _since: DateTime<Utc>) -> anyhow::Result<Vec<DunningCandidate>> {
        Ok(self.candidates.lock().unwrap().clone())
    }

    async fn suspend(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        let mut candidates = self.candidates.lock().unwrap();
        let mut changed = 0;
        for c in candidates.iter_mut().filter(|c| ids.contains(&c.enrollment_id)) {
            if matches!(c.payment_status, PaymentStatus::Active | PaymentStatus::Pending) {
                c.payment_status = PaymentStatus::Suspended;
                self.suspended.lock().unwrap().push(c.enrollment_id);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn owners(&self) -> anyhow::Result<Vec<Recipient>> {
        Ok(self.owners.clone())
    }

    async fn purge_registrations(&self, _now: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self.purged)
    }
}

#[derive(Default)]
pub struct MemLock {
    pub held: Mutex<HashSet<CronJob>>,
}

#[async_trait]
impl JobLock for MemLock {
    async fn acquire(&self, job: CronJob) -> anyhow::Result<bool> {
        Ok(self.held.lock().unwrap().insert(job))
    }

    async fn release(&self, job: CronJob) {
        self.held.lock().unwrap().remove(&job);
    }
}

// --- enrollment harness ---

pub struct Harness {
    pub location_id: Uuid,
    pub program: Program,
    pub student: StudentContact,
    pub capacity: Arc<MemCapacity>,
    pub catalog: Arc<MemCatalog>,
    pub discounts: Arc<MemDiscounts>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<MemEnrollments>,
    pub orchestrator: EnrollmentOrchestrator,
}

impl Harness {
    /// A location selling one program priced at 100 with 5% admin fee and 7% tax.
    pub fn new(offering_type: OfferingType, sessions_per_week: i32) -> Self {
        let location_id = Uuid::new_v4();
        let program = program(offering_type, Decimal::from(100), sessions_per_week);

        let capacity = Arc::new(MemCapacity::default());
        let catalog = Arc::new(MemCatalog::default());
        catalog.offer(location_id, program.clone());
        let discounts = Arc::new(MemDiscounts::default());
        let gateway = Arc::new(FakeGateway::new(PaymentProcessor::Stripe));
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemEnrollments::default());
        let student = store.add_student(location_id);

        let mut gateways = Gateways::default();
        gateways.register(gateway.clone(), Duration::from_secs(5));
        let orchestrator = EnrollmentOrchestrator::new(
            store.clone(),
            capacity.clone(),
            Arc::new(CatalogCache::new(catalog.clone(), Duration::from_secs(300))),
            Arc::new(DiscountEvaluator::new(discounts.clone())),
            gateways,
            notifier.clone(),
        );

        Self {
            location_id,
            program,
            student,
            capacity,
            catalog,
            discounts,
            gateway,
            notifier,
            store,
            orchestrator,
        }
    }

    pub fn sessions(&self, weekdays: &[i16], seats: i32) -> Vec<Uuid> {
        weekdays
            .iter()
            .map(|day| self.capacity.add(self.location_id, *day, seats))
            .collect()
    }

    pub fn input(&self, class_session_ids: Vec<Uuid>, discount_code: Option<&str>) -> EnrollmentInput {
        EnrollmentInput {
            student: StudentSource::Existing(self.student.student_id),
            program_id: self.program.id,
            location_id: self.location_id,
            class_session_ids,
            processor: PaymentProcessor::Stripe,
            payment_method_id: "pm_card_visa".to_string(),
            discount_code: discount_code.map(str::to_string),
            enrollment_date: date(2024, 7, 1),
        }
    }
}
