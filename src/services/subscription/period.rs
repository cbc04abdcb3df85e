// src/services/subscription/period.rs

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;

use crate::{
    errors::{AppError, AppResult},
    models::subscription::{InvoicePeriod, InvoicePolicy, Order, OrderLine, Plan, SubscriptionState},
};

/// Service period the next invoice of `line` covers.
///
/// `parent_next_invoice` is the parent's next invoice date and is only read
/// for upsell orders, which bill up to it.
pub fn next_period(
    order: &Order,
    line: &OrderLine,
    plan: &Plan,
    parent_next_invoice: Option<NaiveDate>,
    today: NaiveDate,
) -> AppResult<InvoicePeriod> {
    let contract_start = contract_start(order)?;

    if order.subscription_state == SubscriptionState::Upsell {
        let stop = parent_next_invoice.ok_or_else(|| {
            AppError::Validation(format!("upsell {} has no parent invoice date", order.name))
        })?;
        let start = order.start_date.unwrap_or(contract_start).max(contract_start);
        return Ok(InvoicePeriod {
            start,
            end: stop - Duration::days(1),
            ratio: Decimal::ONE,
            days: (stop - start).num_days(),
        });
    }

    if line.invoice_policy == InvoicePolicy::Postpaid {
        let start = match line.last_invoiced_date {
            Some(last) => last + Duration::days(1),
            None => order.last_invoice_date.unwrap_or(contract_start),
        };
        let period_end = plan.shift(start, 1)? - Duration::days(1);
        let mut stop = today.min(period_end);
        if let Some(end_date) = order.end_date {
            stop = stop.min(end_date);
        }
        return Ok(InvoicePeriod {
            start,
            end: stop,
            ratio: Decimal::ONE,
            days: (stop - start).num_days() + 1,
        });
    }

    let start = order.next_invoice_date.unwrap_or(contract_start);
    let stop = plan.shift(start, 1)?;
    let full_days = (stop - start).num_days();

    if plan.aligns_on_first_day() {
        let aligned = plan.aligned_boundary(stop);
        if aligned > start && aligned < stop {
            let days = (aligned - start).num_days();
            return Ok(InvoicePeriod {
                start,
                end: aligned - Duration::days(1),
                ratio: Decimal::from(days) / Decimal::from(full_days),
                days,
            });
        }
    }

    Ok(InvoicePeriod {
        start,
        end: stop - Duration::days(1),
        ratio: Decimal::ONE,
        days: full_days,
    })
}

/// The later of start date and first contract date.
fn contract_start(order: &Order) -> AppResult<NaiveDate> {
    match (order.start_date, order.first_contract_date) {
        (Some(start), Some(first)) => Ok(start.max(first)),
        (Some(date), None) | (None, Some(date)) => Ok(date),
        (None, None) => Err(AppError::Validation(format!(
            "subscription {} has no start date",
            order.name
        ))),
    }
}
