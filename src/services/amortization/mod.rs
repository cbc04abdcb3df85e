//! Loan amortization: day-count fractions and payment schedules.
//!
//! Everything in here is pure computation over the input structs, so a
//! [`Loan`] can be shared across tasks and rebuilt at will.

mod day_count;
mod schedule;

pub use day_count::{day_count_factor, is_month_end, last_day_of_month};
pub use schedule::Loan;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoanError {
    #[error("{0}")]
    Validation(String),

    #[error("end date {end} is before start date {start}")]
    DateOrder { start: NaiveDate, end: NaiveDate },
}
