// src/services/amortization/day_count.rs

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use super::LoanError;
use crate::models::loan::CompoundingMethod;

pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

pub fn is_month_end(date: NaiveDate) -> bool {
    date.day() == last_day_of_month(date.year(), date.month())
}

fn is_last_of_february(date: NaiveDate) -> bool {
    date.month() == 2 && is_month_end(date)
}

fn is_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn year_days(year: i32) -> i64 {
    if is_leap(year) { 366 } else { 365 }
}

fn new_year(year: i32) -> Result<NaiveDate, LoanError> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| LoanError::Validation(format!("year {} is out of range", year)))
}

/// Year fraction between `d1` and `d2` under `method`.
///
/// `eom` only matters for 30U/360, where it enables the end-of-February
/// adjustments.
pub fn day_count_factor(
    d1: NaiveDate,
    d2: NaiveDate,
    method: CompoundingMethod,
    eom: bool,
) -> Result<Decimal, LoanError> {
    if method.is_actual() && d2 < d1 {
        return Err(LoanError::DateOrder { start: d1, end: d2 });
    }

    let factor = match method {
        CompoundingMethod::Thirty360A
        | CompoundingMethod::Thirty360Us
        | CompoundingMethod::Thirty360E
        | CompoundingMethod::Thirty360EIsda => {
            let days = thirty_360_days(d1, d2, method, eom);
            Decimal::from(days) / Decimal::from(360)
        }
        CompoundingMethod::Actual360 => {
            Decimal::from((d2 - d1).num_days()) / Decimal::from(360)
        }
        CompoundingMethod::Actual365Fixed => {
            Decimal::from((d2 - d1).num_days()) / Decimal::from(365)
        }
        CompoundingMethod::ActualActualIsda => actual_actual(d1, d2, |year, _| year_days(year))?,
        CompoundingMethod::ActualActualAfb => actual_actual(d1, d2, |year, span| {
            // 366 only when Feb 29 of that year falls inside the partition
            let contains_feb_29 = match span {
                Partition::Whole => d1.month() < 3 && d2.month() >= 3,
                Partition::Head => d1.month() < 3,
                Partition::Tail => d2.month() >= 3,
            };
            if is_leap(year) && contains_feb_29 { 366 } else { 365 }
        })?,
    };

    Ok(factor)
}

fn thirty_360_days(d1: NaiveDate, d2: NaiveDate, method: CompoundingMethod, eom: bool) -> i64 {
    let (y1, m1) = (d1.year() as i64, d1.month() as i64);
    let (y2, m2) = (d2.year() as i64, d2.month() as i64);
    let mut day1 = d1.day() as i64;
    let mut day2 = d2.day() as i64;

    match method {
        CompoundingMethod::Thirty360A => {
            day1 = day1.min(30);
            if day1 == 30 {
                day2 = day2.min(30);
            }
        }
        CompoundingMethod::Thirty360Us => {
            if eom && is_last_of_february(d1) && is_last_of_february(d2) {
                day2 = 30;
            }
            if eom && is_last_of_february(d1) {
                day1 = 30;
            }
            if day2 == 31 && day1 >= 30 {
                day2 = 30;
            }
            if day1 == 31 {
                day1 = 30;
            }
        }
        CompoundingMethod::Thirty360E => {
            day1 = day1.min(30);
            day2 = day2.min(30);
        }
        CompoundingMethod::Thirty360EIsda => {
            if is_month_end(d1) {
                day1 = 30;
            }
            if is_month_end(d2) && m2 != 2 {
                day2 = 30;
            }
        }
        _ => {}
    }

    360 * (y2 - y1) + 30 * (m2 - m1) + (day2 - day1)
}

#[derive(Clone, Copy)]
enum Partition {
    Whole,
    Head,
    Tail,
}

fn actual_actual(
    d1: NaiveDate,
    d2: NaiveDate,
    denominator: impl Fn(i32, Partition) -> i64,
) -> Result<Decimal, LoanError> {
    let (y1, y2) = (d1.year(), d2.year());

    if y1 == y2 {
        let days = (d2 - d1).num_days();
        return Ok(Decimal::from(days) / Decimal::from(denominator(y1, Partition::Whole)));
    }

    let head_days = (new_year(y1 + 1)? - d1).num_days();
    let tail_days = (d2 - new_year(y2)?).num_days();
    let full_years = Decimal::from(y2 - y1 - 1);

    Ok(Decimal::from(head_days) / Decimal::from(denominator(y1, Partition::Head))
        + full_years
        + Decimal::from(tail_days) / Decimal::from(denominator(y2, Partition::Tail)))
}
