//! Fee arithmetic shared by registrations, direct enrollments and recurring charges.
//!
//! Every call site applies the same order: base → discount → + admin fee → + tax,
//! with tax charged on the discounted base plus the admin fee.

use chrono::{Datelike, Months, NaiveDate, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub base_amount: Decimal,
    pub discount_amount: Decimal,
    pub admin_fee: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn check_percent(name: &str, value: Decimal) -> Result<(), AppError> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(AppError::validation(format!("{name} must be between 0 and 100")));
    }
    Ok(())
}

pub fn compute_totals(
    base: Decimal,
    admin_fee_percent: Decimal,
    tax_percent: Decimal,
    discount_percent: Option<Decimal>,
) -> Result<FeeQuote, AppError> {
    if base < Decimal::ZERO {
        return Err(AppError::validation("Base amount cannot be negative"));
    }
    check_percent("admin_fee_percent", admin_fee_percent)?;
    check_percent("tax_percent", tax_percent)?;
    let discount_percent = discount_percent.unwrap_or(Decimal::ZERO);
    check_percent("discount_percent", discount_percent)?;

    let discount_amount = round2(base * discount_percent / Decimal::ONE_HUNDRED);
    let discounted = base - discount_amount;
    let admin_fee = round2(discounted * admin_fee_percent / Decimal::ONE_HUNDRED);
    let tax_amount = round2((discounted + admin_fee) * tax_percent / Decimal::ONE_HUNDRED);

    Ok(FeeQuote {
        base_amount: base,
        discount_amount,
        admin_fee,
        tax_amount,
        total_amount: discounted + admin_fee + tax_amount,
    })
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let first = first_of_month(date);
    first.checked_add_months(Months::new(1)).unwrap_or(first)
}

fn days_in_month(date: NaiveDate) -> u32 {
    (first_of_next_month(date) - first_of_month(date)).num_days() as u32
}

/// Number of Monday–Sunday weeks that intersect the month of `date`.
pub fn weeks_in_month(date: NaiveDate) -> u32 {
    let offset = first_of_month(date).weekday().num_days_from_monday();
    (days_in_month(date) - 1 + offset) / 7 + 1
}

/// Chargeable weeks left in the month, counting the week that contains `date`.
/// A weekend start forfeits its own week.
pub fn weeks_remaining(date: NaiveDate) -> u32 {
    let offset = first_of_month(date).weekday().num_days_from_monday();
    let week_index = (date.day() - 1 + offset) / 7;
    let mut remaining = weeks_in_month(date).saturating_sub(week_index);
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        remaining = remaining.saturating_sub(1);
    }
    remaining
}

/// Pro-rated first invoice of a monthly program started on `enrollment_date`.
pub fn compute_first_payment_amount(
    enrollment_date: NaiveDate,
    monthly_price: Decimal,
) -> Result<Decimal, AppError> {
    if monthly_price < Decimal::ZERO {
        return Err(AppError::validation("Monthly price cannot be negative"));
    }
    let total = Decimal::from(weeks_in_month(enrollment_date));
    let remaining = Decimal::from(weeks_remaining(enrollment_date));
    Ok(round2(monthly_price / total * remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn sprint_scenario_totals() {
        let quote = compute_totals(dec("100"), dec("5"), dec("7"), None).unwrap();
        assert_eq!(quote.admin_fee, dec("5.00"));
        assert_eq!(quote.tax_amount, dec("7.35"));
        assert_eq!(quote.total_amount, dec("112.35"));
        assert_eq!(quote.discount_amount, Decimal::ZERO);
    }

    #[test]
    fn discount_comes_off_before_admin_and_tax() {
        let quote = compute_totals(dec("100"), dec("5"), dec("7"), Some(dec("10"))).unwrap();
        assert_eq!(quote.discount_amount, dec("10.00"));
        assert_eq!(quote.admin_fee, dec("4.50"));
        // (90 + 4.50) * 7% = 6.615
        assert_eq!(quote.tax_amount, dec("6.62"));
        assert_eq!(quote.total_amount, dec("101.12"));
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        assert!(compute_totals(dec("-1"), dec("5"), dec("7"), None).is_err());
        assert!(compute_totals(dec("10"), dec("101"), dec("7"), None).is_err());
        assert!(compute_totals(dec("10"), dec("5"), dec("-7"), None).is_err());
        assert!(compute_first_payment_amount(date(2024, 1, 3), dec("-5")).is_err());
    }

    #[test]
    fn week_counting() {
        // June 2024 starts on a Saturday and ends on a Sunday.
        assert_eq!(weeks_in_month(date(2024, 6, 10)), 5);
        assert_eq!(weeks_remaining(date(2024, 6, 1)), 4);
        // February 2021 starts on a Monday and has exactly 4 weeks.
        assert_eq!(weeks_in_month(date(2021, 2, 1)), 4);
        assert_eq!(weeks_remaining(date(2021, 2, 1)), 4);
        assert_eq!(weeks_remaining(date(2021, 2, 10)), 3);
    }

    #[test]
    fn full_month_from_the_first_monday() {
        assert_eq!(
            compute_first_payment_amount(date(2021, 2, 1), dec("200")).unwrap(),
            dec("200.00")
        );
    }

    #[test]
    fn weekend_start_skips_its_week() {
        // Wed 2021-02-10 → 3 weeks, Sat 2021-02-13 → 2 weeks.
        assert_eq!(
            compute_first_payment_amount(date(2021, 2, 10), dec("200")).unwrap(),
            dec("150.00")
        );
        assert_eq!(
            compute_first_payment_amount(date(2021, 2, 13), dec("200")).unwrap(),
            dec("100.00")
        );
    }

    #[test]
    fn zero_on_the_last_weekend() {
        assert_eq!(
            compute_first_payment_amount(date(2021, 2, 27), dec("200")).unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            compute_first_payment_amount(date(2021, 2, 28), dec("200")).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn never_increases_as_the_month_advances() {
        let price = dec("137.99");
        for (year, month) in [(2024, 1), (2024, 2), (2024, 6), (2024, 9), (2025, 3), (2026, 11)] {
            let mut previous = None;
            let mut day = date(year, month, 1);
            while day.month() == month {
                let amount = compute_first_payment_amount(day, price).unwrap();
                assert!(amount >= Decimal::ZERO);
                assert!(amount <= price);
                if let Some(prev) = previous {
                    assert!(amount <= prev, "{day}: {amount} > {prev}");
                }
                previous = Some(amount);
                day = day.succ_opt().unwrap();
            }
        }
    }

    #[test]
    fn next_month_boundaries() {
        assert_eq!(first_of_next_month(date(2024, 1, 31)), date(2024, 2, 1));
        assert_eq!(first_of_next_month(date(2024, 12, 15)), date(2025, 1, 1));
    }
}
