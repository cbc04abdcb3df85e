// src/services/subscription/pricing.rs
//
// Order-line quantities, prices and amounts. Everything here is a pure
// recompute step; callers decide when to run it (order write, invoice post,
// token assignment).

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::{
    errors::AppResult,
    models::subscription::{
        Currency, Invoice, InvoiceState, Order, OrderAmounts, OrderLine, OrderStatus, Plan,
        Product, SubscriptionPricing, SubscriptionState,
    },
};

const HUNDRED: Decimal = dec!(100);

pub const PRORATA_NOTE_PREFIX: &str = "(*) prorated from";

pub fn line_subtotal(line: &OrderLine, currency: &Currency) -> Decimal {
    if line.is_note {
        return Decimal::ZERO;
    }
    currency.round(line.qty * line.price_unit * (Decimal::ONE - line.discount / HUNDRED))
}

fn amount_for_qty(line: &OrderLine, qty: Decimal, currency: &Currency) -> Decimal {
    currency.round(qty * line.price_unit * (Decimal::ONE - line.discount / HUNDRED))
}

pub fn recurring_monthly(line: &OrderLine, plan: &Plan, currency: &Currency) -> Decimal {
    if !line.is_recurring || line.is_note {
        return Decimal::ZERO;
    }
    let subtotal = line_subtotal(line, currency);
    currency.round(subtotal * plan.interval_factor() / Decimal::from(plan.billing_period_value))
}

/// The single line of `parent` sharing product, unit and rounded price with
/// `line`, if any. Orders with a different currency or plan never match.
pub fn find_parent_line(
    line: &OrderLine,
    child: &Order,
    parent: &Order,
    currency: &Currency,
) -> Option<Uuid> {
    if line.is_note || parent.currency != child.currency || parent.plan_id != child.plan_id {
        return None;
    }
    let price = currency.round(line.price_unit);
    let mut candidates = parent.lines.iter().filter(|p| {
        !p.is_note
            && p.product_id == line.product_id
            && p.uom == line.uom
            && currency.round(p.price_unit) == price
    });
    match (candidates.next(), candidates.next()) {
        (Some(found), None) => Some(found.id),
        _ => None,
    }
}

/// Share of a billing period left between an upsell and the parent's next
/// invoice date. Whole periods in between count as 1 each; never negative.
pub fn upsell_ratio(
    today: NaiveDate,
    first_contract_date: Option<NaiveDate>,
    parent_next_invoice: NaiveDate,
    plan: &Plan,
) -> AppResult<Decimal> {
    let start = first_contract_date.map_or(today, |d| d.max(today));
    let mut end = parent_next_invoice;
    if start >= end {
        return Ok(Decimal::ZERO);
    }

    let mut complete_periods = 0i64;
    loop {
        let previous = plan.shift(end, -1)?;
        if previous < start {
            break;
        }
        end = previous;
        complete_periods += 1;
    }

    let remaining = (end - start).num_days();
    let full = (plan.shift(start, 1)? - start).num_days();
    if full <= 0 {
        return Ok(Decimal::ZERO);
    }
    Ok(Decimal::from(remaining) / Decimal::from(full) + Decimal::from(complete_periods))
}

/// Discount percentage charging only `ratio` of the price, stacked on the
/// parent line's own discount.
pub fn prorated_discount(ratio: Decimal, parent_discount: Option<Decimal>) -> Decimal {
    let discount = match parent_discount {
        Some(d) if !d.is_zero() => (Decimal::ONE - ratio * (Decimal::ONE - d / HUNDRED)) * HUNDRED,
        _ => (Decimal::ONE - ratio) * HUNDRED,
    };
    discount.round_dp(2)
}

pub fn prorata_note(start: NaiveDate, parent_next_invoice: NaiveDate) -> String {
    let last_day = parent_next_invoice - Duration::days(1);
    format!("{} {} to {}", PRORATA_NOTE_PREFIX, start, last_day)
}

/// Subscription pricing for the order's pricelist, then the default pricing,
/// then the product's list price.
pub fn resolve_price(
    product: &Product,
    pricings: &[SubscriptionPricing],
    pricelist_id: Option<Uuid>,
) -> Decimal {
    let for_pricelist = pricelist_id
        .and_then(|id| pricings.iter().find(|p| p.pricelist_id == Some(id)));
    let default = || pricings.iter().find(|p| p.pricelist_id.is_none());
    for_pricelist
        .or_else(default)
        .map(|p| p.price)
        .unwrap_or(product.list_price)
}

// ─── Recompute phases ─────────────────────────────────────────────────────────

/// Derives `qty_invoiced` and `last_invoiced_date` from the non-cancelled
/// invoices of the order. Recurring lines only count their latest period.
pub fn refresh_invoiced(order: &mut Order, invoices: &[Invoice]) {
    for line in order.lines.iter_mut().filter(|l| !l.is_note) {
        let billed: Vec<_> = invoices
            .iter()
            .filter(|i| i.state != InvoiceState::Cancel)
            .flat_map(|i| i.lines.iter())
            .filter(|il| il.sale_line_id == Some(line.id))
            .collect();

        line.last_invoiced_date = billed.iter().filter_map(|il| il.deferred_end_date).max();
        line.qty_invoiced = if line.is_recurring && line.last_invoiced_date.is_some() {
            billed
                .iter()
                .filter(|il| il.deferred_end_date == line.last_invoiced_date)
                .map(|il| il.quantity)
                .sum()
        } else {
            billed.iter().map(|il| il.quantity).sum()
        };
    }
}

/// Refreshes `qty_to_invoice` on every line and the order amounts.
///
/// Recurring lines are due once per period: until an invoice covers a date on
/// or after `next_invoice_date`. Upsell lines are billed once.
pub fn refresh_amounts(order: &mut Order, plan: Option<&Plan>, currency: &Currency) {
    let billable = order.state == OrderStatus::Confirmed
        && !order.subscription_state.is_ended()
        && order.subscription_state != SubscriptionState::Paused;
    let per_period = order.subscription_state != SubscriptionState::Upsell;
    let next_invoice = order.next_invoice_date;

    for line in order.lines.iter_mut() {
        line.qty_to_invoice = if line.is_note || !billable {
            Decimal::ZERO
        } else if line.is_recurring && per_period {
            let due = match next_invoice {
                Some(next) => line.last_invoiced_date.is_none_or(|d| d < next),
                None => true,
            };
            if due { line.qty } else { Decimal::ZERO }
        } else {
            (line.qty - line.qty_invoiced).max(Decimal::ZERO)
        };
    }

    let mut amounts = OrderAmounts::default();
    for line in order.lines.iter().filter(|l| !l.is_note) {
        let subtotal = line_subtotal(line, currency);
        let to_invoice = amount_for_qty(line, line.qty_to_invoice, currency);
        amounts.amount_total += subtotal;
        amounts.amount_to_invoice += to_invoice;
        if line.is_recurring {
            amounts.recurring_total += subtotal;
            amounts.recurring_to_invoice += to_invoice;
            if let Some(plan) = plan {
                amounts.recurring_monthly += recurring_monthly(line, plan, currency);
            }
        }
    }
    order.amounts = amounts;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::subscription::{InvoiceLine, InvoicePaymentState, InvoicePolicy, PeriodUnit};
    use crate::services::subscription::plan::tests::plan;
    use chrono::Utc;

    pub(crate) fn usd() -> Currency {
        Currency {
            code: "USD".to_string(),
            decimal_places: 2,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn recurring_line(product_id: Uuid, qty: Decimal, price: Decimal) -> OrderLine {
        OrderLine {
            id: Uuid::new_v4(),
            product_id: Some(product_id),
            name: "Hosting".to_string(),
            qty,
            uom: "Units".to_string(),
            price_unit: price,
            discount: Decimal::ZERO,
            is_recurring: true,
            invoice_policy: InvoicePolicy::Prepaid,
            parent_line_id: None,
            last_invoiced_date: None,
            qty_invoiced: Decimal::ZERO,
            qty_to_invoice: Decimal::ZERO,
            is_note: false,
        }
    }

    pub(crate) fn order(lines: Vec<OrderLine>, plan_id: Uuid) -> Order {
        Order {
            id: Uuid::new_v4(),
            name: "SUB-TEST".to_string(),
            partner_id: Uuid::new_v4(),
            partner_email: None,
            currency: "USD".to_string(),
            plan_id: Some(plan_id),
            pricelist_id: None,
            state: OrderStatus::Confirmed,
            subscription_state: SubscriptionState::InProgress,
            is_subscription: true,
            start_date: Some(date(2024, 1, 1)),
            first_contract_date: Some(date(2024, 1, 1)),
            next_invoice_date: Some(date(2024, 1, 1)),
            last_invoice_date: None,
            end_date: None,
            payment_token_id: None,
            pending_transaction: false,
            parent_subscription_id: None,
            close_reason: None,
            close_note: None,
            access_token: "token".to_string(),
            lines,
            amounts: OrderAmounts::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsell_ratio_prorates_the_remaining_days() {
        let monthly = plan(1, PeriodUnit::Month);
        let ratio =
            upsell_ratio(date(2024, 1, 22), Some(date(2023, 6, 1)), date(2024, 2, 1), &monthly)
                .unwrap();
        assert_eq!(ratio, Decimal::from(10) / Decimal::from(31));
        assert_eq!(prorated_discount(ratio, None), dec!(67.74));
    }

    #[test]
    fn upsell_ratio_counts_whole_periods_and_never_goes_negative() {
        let monthly = plan(1, PeriodUnit::Month);
        let ratio =
            upsell_ratio(date(2024, 1, 22), None, date(2024, 3, 1), &monthly).unwrap();
        // one full month (Feb) plus 10 of 31 days
        assert_eq!(ratio, Decimal::from(10) / Decimal::from(31) + Decimal::ONE);

        let late = upsell_ratio(date(2024, 2, 5), None, date(2024, 2, 1), &monthly).unwrap();
        assert_eq!(late, Decimal::ZERO);
        assert_eq!(prorated_discount(late, None), dec!(100));
    }

    #[test]
    fn prorated_discount_stacks_on_parent_discount() {
        let half = dec!(0.5);
        assert_eq!(prorated_discount(half, Some(dec!(20))), dec!(60));
        assert_eq!(prorated_discount(half, Some(Decimal::ZERO)), dec!(50));
    }

    #[test]
    fn parent_line_requires_a_unique_match_on_rounded_price() {
        let monthly = plan(1, PeriodUnit::Month);
        let product = Uuid::new_v4();
        let parent = order(vec![recurring_line(product, dec!(1), dec!(10.00))], monthly.id);
        let child_line = recurring_line(product, dec!(2), dec!(10.001));
        let child = order(vec![child_line.clone()], monthly.id);

        assert_eq!(
            find_parent_line(&child_line, &child, &parent, &usd()),
            Some(parent.lines[0].id)
        );

        let ambiguous = order(
            vec![
                recurring_line(product, dec!(1), dec!(10)),
                recurring_line(product, dec!(3), dec!(10)),
            ],
            monthly.id,
        );
        assert_eq!(find_parent_line(&child_line, &child, &ambiguous, &usd()), None);
    }

    #[test]
    fn resolve_price_prefers_pricelist_then_default_then_list_price() {
        let product = Product {
            id: Uuid::new_v4(),
            name: "Seat".to_string(),
            list_price: dec!(12),
            uom: "Units".to_string(),
            recurring: true,
            invoice_policy: InvoicePolicy::Prepaid,
        };
        let plan_id = Uuid::new_v4();
        let pricelist = Uuid::new_v4();
        let pricing = |pricelist_id, price| SubscriptionPricing {
            id: Uuid::new_v4(),
            product_id: product.id,
            plan_id,
            pricelist_id,
            price,
        };
        let pricings = vec![pricing(None, dec!(10)), pricing(Some(pricelist), dec!(8))];

        assert_eq!(resolve_price(&product, &pricings, Some(pricelist)), dec!(8));
        assert_eq!(resolve_price(&product, &pricings, Some(Uuid::new_v4())), dec!(10));
        assert_eq!(resolve_price(&product, &[], None), dec!(12));
    }

    #[test]
    fn amounts_follow_period_and_invoicing_state() {
        let yearly = plan(1, PeriodUnit::Year);
        let mut line = recurring_line(Uuid::new_v4(), dec!(2), dec!(600));
        line.discount = dec!(10);
        let mut sub = order(vec![line], yearly.id);

        refresh_amounts(&mut sub, Some(&yearly), &usd());
        assert_eq!(sub.amounts.amount_total, dec!(1080.00));
        assert_eq!(sub.amounts.recurring_monthly, dec!(90.00));
        assert_eq!(sub.amounts.amount_to_invoice, dec!(1080.00));

        let line_id = sub.lines[0].id;
        let invoice = Invoice {
            id: Uuid::new_v4(),
            name: "INV-1".to_string(),
            subscription_id: sub.id,
            partner_id: sub.partner_id,
            currency: "USD".to_string(),
            state: InvoiceState::Draft,
            payment_state: InvoicePaymentState::NotPaid,
            invoice_date: None,
            lines: vec![InvoiceLine {
                id: Uuid::new_v4(),
                sale_line_id: Some(line_id),
                product_id: None,
                name: "Hosting".to_string(),
                quantity: dec!(2),
                price_unit: dec!(600),
                discount: dec!(10),
                subtotal: dec!(1080),
                deferred_start_date: Some(date(2024, 1, 1)),
                deferred_end_date: Some(date(2024, 12, 31)),
                subscription_id: Some(sub.id),
            }],
            amount_total: dec!(1080),
            created_at: Utc::now(),
        };
        refresh_invoiced(&mut sub, std::slice::from_ref(&invoice));
        refresh_amounts(&mut sub, Some(&yearly), &usd());
        assert_eq!(sub.lines[0].qty_invoiced, dec!(2));
        assert_eq!(sub.amounts.amount_to_invoice, Decimal::ZERO);

        // once the next period opens the line is due again
        sub.next_invoice_date = Some(date(2025, 1, 1));
        refresh_amounts(&mut sub, Some(&yearly), &usd());
        assert_eq!(sub.amounts.recurring_to_invoice, dec!(1080.00));
    }
}
