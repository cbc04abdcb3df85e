// src/services/subscription/plan.rs

use chrono::{Datelike, Duration, Months, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::{
    errors::{AppError, AppResult},
    models::subscription::{PeriodUnit, Plan},
};

fn out_of_range(date: NaiveDate) -> AppError {
    AppError::Validation(format!("billing period overflows the calendar from {}", date))
}

impl Plan {
    /// `date` moved by `times` billing periods (negative goes back).
    /// Month arithmetic clamps to the end of shorter months.
    pub fn shift(&self, date: NaiveDate, times: i32) -> AppResult<NaiveDate> {
        let steps = self.billing_period_value * times;
        let shifted = match self.billing_period_unit {
            PeriodUnit::Day => date.checked_add_signed(Duration::days(steps as i64)),
            PeriodUnit::Week => date.checked_add_signed(Duration::weeks(steps as i64)),
            PeriodUnit::Month => shift_months(date, steps),
            PeriodUnit::Year => shift_months(date, steps * 12),
        };
        shifted.ok_or_else(|| out_of_range(date))
    }

    /// Multiplier turning one period's amount into a monthly one, before
    /// division by the period value.
    pub fn interval_factor(&self) -> Decimal {
        match self.billing_period_unit {
            PeriodUnit::Day => dec!(30.437),
            PeriodUnit::Week => dec!(30.437) / dec!(7),
            PeriodUnit::Month => Decimal::ONE,
            PeriodUnit::Year => Decimal::ONE / dec!(12),
        }
    }

    pub fn aligns_on_first_day(&self) -> bool {
        self.billing_first_day
            && matches!(self.billing_period_unit, PeriodUnit::Month | PeriodUnit::Year)
    }

    /// First day of the month (or year for yearly plans) containing `date`.
    pub fn aligned_boundary(&self, date: NaiveDate) -> NaiveDate {
        let aligned = match self.billing_period_unit {
            PeriodUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
            _ => date.with_day(1),
        };
        aligned.unwrap_or(date)
    }

    /// Next invoice date once the period starting at `current` is billed.
    pub fn next_invoice_date(&self, current: NaiveDate) -> AppResult<NaiveDate> {
        let next = self.shift(current, 1)?;
        if self.aligns_on_first_day() {
            let aligned = self.aligned_boundary(next);
            if aligned > current {
                return Ok(aligned);
            }
        }
        Ok(next)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.billing_period_value < 1 {
            return Err(AppError::Validation(format!(
                "plan '{}' needs a positive billing period",
                self.name
            )));
        }
        Ok(())
    }
}

fn shift_months(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    }
}
