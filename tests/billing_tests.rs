mod common;

use chrono::{Duration, Months};

use academy_api::error::AppError;
use academy_api::models::enrollment::{Enrollment, PaymentStatus, TransactionStatus};
use academy_api::models::program::OfferingType;
use academy_api::services::dunning::{is_overdue, DunningCandidate};
use academy_api::services::payments::{ExternalStatus, PaymentError, SubscriptionInvoice};

use common::{at, cents, Harness};

async fn active_marathon(h: &Harness) -> Enrollment {
    let sessions = h.sessions(&[0], 4);
    h.orchestrator
        .enroll(h.input(sessions, None), at(2024, 7, 1))
        .await
        .unwrap()
        .enrollment
}

fn renewal(e: &Enrollment, invoice_id: &str) -> SubscriptionInvoice {
    SubscriptionInvoice {
        invoice_id: invoice_id.to_string(),
        subscription_id: e.subscription_id.clone().unwrap(),
        amount: cents(11235),
        paid: true,
        renewal: true,
    }
}

fn as_candidate(e: &Enrollment) -> DunningCandidate {
    DunningCandidate {
        enrollment_id: e.id,
        location_id: e.location_id,
        payment_status: e.payment_status,
        next_payment_due: e.next_payment_due,
        monthly_payment_received: e.monthly_payment_received,
        monthly_amount: e.monthly_amount,
        total_amount: e.total_amount,
        subscription_id: e.subscription_id.clone(),
        student_name: "Ada Lovelace".to_string(),
        program_name: "Robotics Marathon".to_string(),
        parent_email: "parent@example.com".to_string(),
        parent_name: "Anne Lovelace".to_string(),
        recent_payments: vec![],
    }
}

#[tokio::test]
async fn approved_monthly_payment_is_settled_on_return() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;
    let due = e.next_payment_due.unwrap();
    h.gateway.respond_with(ExternalStatus::Pending);

    let result = h.orchestrator.process_payment(e.id, at(2024, 8, 1)).await.unwrap();
    assert!(result.approval_url.is_some());
    let waiting = result.enrollment;
    assert_eq!(waiting.payment_status, PaymentStatus::Active);
    assert_eq!(waiting.next_payment_due, Some(due));
    let charge_id = waiting.pending_transaction_id.clone().unwrap();

    let again = h.orchestrator.process_payment(e.id, at(2024, 8, 1)).await;
    assert!(matches!(again, Err(AppError::Conflict(_))));

    h.gateway.respond_with(ExternalStatus::Completed);
    let settled = h
        .orchestrator
        .confirm_external_payment(e.id, at(2024, 8, 2))
        .await
        .unwrap();
    assert_eq!(settled.payment_status, PaymentStatus::Active);
    assert_eq!(settled.next_payment_due, due.checked_add_months(Months::new(1)));
    assert!(settled.pending_transaction_id.is_none());
    assert_eq!(*h.gateway.fetched.lock().unwrap(), vec![charge_id.clone()]);

    let payments = h.orchestrator.payments(e.id).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[1].status, TransactionStatus::Completed);
    assert_eq!(payments[1].transaction_id.as_deref(), Some(charge_id.as_str()));
}

#[tokio::test]
async fn approved_sprint_retry_confirms_the_new_charge() {
    let h = Harness::new(OfferingType::Sprint, 1);
    let sessions = h.sessions(&[0], 2);
    h.gateway.respond_with(ExternalStatus::Pending);
    let receipt = h
        .orchestrator
        .enroll(h.input(sessions, None), at(2024, 7, 1))
        .await
        .unwrap();

    let retry = h
        .orchestrator
        .process_payment(receipt.enrollment.id, at(2024, 7, 2))
        .await
        .unwrap();
    let retry_id = retry.enrollment.pending_transaction_id.clone().unwrap();
    assert_ne!(Some(retry_id.clone()), receipt.enrollment.transaction_id);

    h.gateway.respond_with(ExternalStatus::Completed);
    let settled = h
        .orchestrator
        .confirm_external_payment(receipt.enrollment.id, at(2024, 7, 2))
        .await
        .unwrap();
    assert_eq!(settled.payment_status, PaymentStatus::Completed);
    assert_eq!(settled.transaction_id.as_deref(), Some(retry_id.as_str()));
    assert_eq!(*h.gateway.fetched.lock().unwrap(), vec![retry_id]);
}

#[tokio::test]
async fn declined_approval_keeps_the_enrollment_billing() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;
    h.gateway.respond_with(ExternalStatus::Pending);
    h.orchestrator.process_payment(e.id, at(2024, 8, 1)).await.unwrap();

    h.gateway.respond_with(ExternalStatus::Failed);
    let err = h
        .orchestrator
        .confirm_external_payment(e.id, at(2024, 8, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentFailed(PaymentError::Declined(_))));

    let after = h.orchestrator.get(e.id).await.unwrap();
    assert_eq!(after.payment_status, PaymentStatus::Active);
    assert_eq!(after.next_payment_due, e.next_payment_due);
    assert!(after.pending_transaction_id.is_none());
    let payments = h.orchestrator.payments(e.id).await.unwrap();
    assert_eq!(payments.last().unwrap().status, TransactionStatus::Failed);
}

#[tokio::test]
async fn backing_out_of_a_monthly_payment_keeps_the_seat() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let sessions = h.sessions(&[0], 4);
    let e = h
        .orchestrator
        .enroll(h.input(sessions.clone(), None), at(2024, 7, 1))
        .await
        .unwrap()
        .enrollment;
    h.gateway.respond_with(ExternalStatus::Pending);
    let charge_id = h
        .orchestrator
        .process_payment(e.id, at(2024, 8, 1))
        .await
        .unwrap()
        .enrollment
        .pending_transaction_id
        .unwrap();

    let after = h
        .orchestrator
        .cancel_external_payment(e.id, &charge_id, at(2024, 8, 1))
        .await
        .unwrap();
    assert_eq!(after.payment_status, PaymentStatus::Active);
    assert!(after.pending_transaction_id.is_none());
    assert_eq!(h.capacity.available(sessions[0]), 3);
    assert!(h.gateway.cancelled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn paid_renewal_invoice_clears_the_overdue_check() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;
    let due = e.next_payment_due.unwrap();
    let day_after = due + Duration::days(1);
    assert!(is_overdue(&as_candidate(&e), day_after));

    let paid = h
        .orchestrator
        .record_subscription_invoice(&renewal(&e, "in_aug"), day_after)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(paid.next_payment_due, due.checked_add_months(Months::new(1)));
    assert!(!is_overdue(&as_candidate(&paid), day_after));
    assert!(h.gateway.charges.lock().unwrap().is_empty());
    let payments = h.orchestrator.payments(e.id).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[1].transaction_id.as_deref(), Some("in_aug"));
}

#[tokio::test]
async fn redelivered_invoice_is_booked_once() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;
    let invoice = renewal(&e, "in_aug");

    let first = h
        .orchestrator
        .record_subscription_invoice(&invoice, at(2024, 8, 1))
        .await
        .unwrap()
        .unwrap();
    let second = h
        .orchestrator
        .record_subscription_invoice(&invoice, at(2024, 8, 1))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.next_payment_due, second.next_payment_due);
    assert_eq!(h.orchestrator.payments(e.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn paid_invoice_reactivates_a_suspended_enrollment() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;
    h.store
        .enrollments
        .lock()
        .unwrap()
        .get_mut(&e.id)
        .unwrap()
        .payment_status = PaymentStatus::Suspended;

    let paid = h
        .orchestrator
        .record_subscription_invoice(&renewal(&e, "in_aug"), at(2024, 8, 12))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Active);
}

#[tokio::test]
async fn failed_invoice_is_recorded_without_moving_the_due_date() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;
    let mut invoice = renewal(&e, "in_aug");
    invoice.paid = false;

    let after = h
        .orchestrator
        .record_subscription_invoice(&invoice, at(2024, 8, 1))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(after.next_payment_due, e.next_payment_due);
    let payments = h.orchestrator.payments(e.id).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[1].status, TransactionStatus::Failed);
}

#[tokio::test]
async fn opening_and_unknown_invoices_change_nothing() {
    let h = Harness::new(OfferingType::Marathon, 1);
    let e = active_marathon(&h).await;

    let mut opening = renewal(&e, "in_jul");
    opening.renewal = false;
    let same = h
        .orchestrator
        .record_subscription_invoice(&opening, at(2024, 7, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(same.next_payment_due, e.next_payment_due);
    assert_eq!(h.orchestrator.payments(e.id).await.unwrap().len(), 1);

    let mut stranger = renewal(&e, "in_other");
    stranger.subscription_id = "sub_unknown".to_string();
    let none = h
        .orchestrator
        .record_subscription_invoice(&stranger, at(2024, 8, 1))
        .await
        .unwrap();
    assert!(none.is_none());
}
