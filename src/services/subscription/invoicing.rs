// src/services/subscription/invoicing.rs

use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{SubscriptionService, period::next_period, short_id};
use crate::{
    errors::{AppError, AppResult},
    models::subscription::{
        BillingRunReport, Invoice, InvoiceLine, InvoicePaymentState, InvoicePolicy, InvoiceState,
        Order, OrderStatus, Plan, SubscriptionState,
    },
    services::email::{invoice_mail, send_quietly},
};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// What a billing run did with one due subscription.
#[derive(Debug, PartialEq)]
pub(super) enum BillingOutcome {
    Skipped,
    Churned,
    Invoiced,
    Charged,
    ChargeFailed,
}

impl SubscriptionService {
    pub async fn order_invoices(&self, order_id: Uuid) -> AppResult<Vec<Invoice>> {
        self.store.order_invoices(order_id).await
    }

    /// Draft invoice for every line with something left to invoice.
    pub async fn create_invoice(&self, order_id: Uuid, today: NaiveDate) -> AppResult<Invoice> {
        let _guard = self.locks.acquire(&order_id).await;
        self.create_invoice_locked(order_id, today).await
    }

    pub(super) async fn create_invoice_locked(
        &self,
        order_id: Uuid,
        today: NaiveDate,
    ) -> AppResult<Invoice> {
        let mut order = self.get_order(order_id).await?;
        if order.state != OrderStatus::Confirmed || order.subscription_state.is_ended() {
            return Err(AppError::Validation(format!(
                "subscription {} cannot be invoiced",
                order.name
            )));
        }
        self.refresh(&mut order).await?;

        let plan = self.plan_of(&order).await?;
        let currency = self.currency(&order.currency).await?;
        let parent_next = if order.subscription_state == SubscriptionState::Upsell {
            self.parent_of(&order).await?.next_invoice_date
        } else {
            None
        };

        let mut lines = Vec::new();
        for line in order.lines.iter().filter(|l| !l.is_note && l.qty_to_invoice > Decimal::ZERO) {
            let (name, price_unit, start, end) = match (line.is_recurring, plan.as_ref()) {
                (true, Some(plan)) => {
                    let period = next_period(&order, line, plan, parent_next, today)?;
                    (
                        format!("{} ({} to {})", line.name, period.start, period.end),
                        currency.round(line.price_unit * period.ratio),
                        Some(period.start),
                        Some(period.end),
                    )
                }
                (true, None) => {
                    return Err(AppError::Validation(format!(
                        "subscription {} has no plan",
                        order.name
                    )));
                }
                (false, _) => (line.name.clone(), line.price_unit, None, None),
            };

            let subtotal = currency.round(
                line.qty_to_invoice * price_unit * (Decimal::ONE - line.discount / HUNDRED),
            );
            lines.push(InvoiceLine {
                id: Uuid::new_v4(),
                sale_line_id: Some(line.id),
                product_id: line.product_id,
                name,
                quantity: line.qty_to_invoice,
                price_unit,
                discount: line.discount,
                subtotal,
                deferred_start_date: start,
                deferred_end_date: end,
                subscription_id: Some(order.id),
            });
        }

        if lines.is_empty() {
            return Err(AppError::Validation(format!(
                "nothing to invoice on {}",
                order.name
            )));
        }

        let invoice = Invoice {
            id: Uuid::new_v4(),
            name: format!("INV/{}/{}", today.year(), short_id()),
            subscription_id: order.id,
            partner_id: order.partner_id,
            currency: order.currency.clone(),
            state: InvoiceState::Draft,
            payment_state: InvoicePaymentState::NotPaid,
            invoice_date: None,
            amount_total: lines.iter().map(|l| l.subtotal).sum(),
            lines,
            created_at: Utc::now(),
        };
        self.store.insert_invoice(&invoice).await?;
        self.save(None, &mut order).await?;

        info!(
            "Draft invoice {} created for {} ({} lines, total {})",
            invoice.name,
            order.name,
            invoice.lines.len(),
            invoice.amount_total
        );
        Ok(invoice)
    }

    /// Cancels every draft invoice of the order, returning how many there were.
    pub(super) async fn cancel_draft_invoices_locked(&self, order_id: Uuid) -> AppResult<usize> {
        let drafts: Vec<Invoice> = self
            .store
            .order_invoices(order_id)
            .await?
            .into_iter()
            .filter(|i| i.state == InvoiceState::Draft)
            .collect();
        for mut invoice in drafts.iter().cloned() {
            invoice.state = InvoiceState::Cancel;
            self.store.update_invoice(&invoice).await?;
            info!("Draft invoice {} cancelled", invoice.name);
        }
        Ok(drafts.len())
    }

    /// Posts a draft invoice and moves the subscription to its next period.
    pub async fn post_invoice(&self, invoice_id: Uuid, today: NaiveDate) -> AppResult<Invoice> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Invoice {} not found", invoice_id)))?;
        let _guard = self.locks.acquire(&invoice.subscription_id).await;
        self.post_invoice_locked(invoice_id, today).await
    }

    pub(super) async fn post_invoice_locked(
        &self,
        invoice_id: Uuid,
        today: NaiveDate,
    ) -> AppResult<Invoice> {
        let mut invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Invoice {} not found", invoice_id)))?;
        match invoice.state {
            InvoiceState::Posted => return Ok(invoice),
            InvoiceState::Cancel => {
                return Err(AppError::Validation(format!(
                    "invoice {} is cancelled",
                    invoice.name
                )));
            }
            InvoiceState::Draft => {}
        }

        let order = self.get_order(invoice.subscription_id).await?;

        // the invoice stays a draft unless the period moves
        let bills_period = invoice.lines.iter().any(|l| l.deferred_start_date.is_some());
        if bills_period && order.subscription_state != SubscriptionState::Upsell {
            let plan = self.require_plan(&order).await?;
            self.advance_next_invoice_date(&order, &plan, &invoice, today).await?;
        }

        invoice.state = InvoiceState::Posted;
        invoice.invoice_date = Some(today);
        self.store.update_invoice(&invoice).await?;

        let mut order = self.get_order(order.id).await?;
        self.save(None, &mut order).await?;

        info!("Invoice {} posted for {}", invoice.name, order.name);
        Ok(invoice)
    }

    /// Moves `next_invoice_date` one period ahead with a compare-and-swap,
    /// retrying once on a concurrent change.
    async fn advance_next_invoice_date(
        &self,
        order: &Order,
        plan: &Plan,
        invoice: &Invoice,
        today: NaiveDate,
    ) -> AppResult<NaiveDate> {
        // start of the prepaid period this invoice pays for
        let prepaid_start = invoice
            .lines
            .iter()
            .filter(|l| {
                l.sale_line_id
                    .and_then(|id| order.line(id))
                    .is_some_and(|ol| ol.invoice_policy == InvoicePolicy::Prepaid)
            })
            .filter_map(|l| l.deferred_start_date)
            .min();

        let mut expected = order.next_invoice_date;
        for attempt in 0..2 {
            if let (Some(current), Some(start)) = (expected, prepaid_start) {
                if current > start {
                    return Err(AppError::Conflict(format!(
                        "{} is already invoiced up to {}",
                        order.name, current
                    )));
                }
            }

            let base = expected.or(prepaid_start).unwrap_or(today);
            let next = plan.next_invoice_date(base)?;
            if self
                .store
                .advance_next_invoice_date(order.id, expected, next, today)
                .await?
            {
                info!(
                    "Next invoice date of {} advanced from {} to {}",
                    order.name, base, next
                );
                return Ok(next);
            }

            warn!(
                "Next invoice date of {} changed concurrently (attempt {})",
                order.name,
                attempt + 1
            );
            expected = self.get_order(order.id).await?.next_invoice_date;
        }

        Err(AppError::Conflict(format!(
            "concurrent invoicing detected on {}",
            order.name
        )))
    }

    pub(super) async fn mark_invoice_paid(&self, invoice_id: Uuid) -> AppResult<()> {
        if let Some(mut invoice) = self.store.get_invoice(invoice_id).await? {
            if invoice.payment_state != InvoicePaymentState::Paid {
                invoice.payment_state = InvoicePaymentState::Paid;
                self.store.update_invoice(&invoice).await?;
                info!("Invoice {} reconciled", invoice.name);
            }
        }
        Ok(())
    }

    // ─── Recurring billing ────────────────────────────────────────────────────

    /// Bills every subscription due on `today`. Failures are logged per
    /// subscription and never stop the run.
    pub async fn run_recurring_billing(&self, today: NaiveDate) -> AppResult<BillingRunReport> {
        let due = self.store.due_orders(today).await?;
        info!("Recurring billing for {}: {} subscriptions due", today, due.len());

        let mut report = BillingRunReport::default();
        for order in due {
            match self.bill_order(order.id, today).await {
                Ok(BillingOutcome::Skipped) => {}
                Ok(BillingOutcome::Churned) => report.churned += 1,
                Ok(BillingOutcome::Invoiced) => report.invoiced += 1,
                Ok(BillingOutcome::Charged) => {
                    report.invoiced += 1;
                    report.charged += 1;
                }
                Ok(BillingOutcome::ChargeFailed) => {
                    report.invoiced += 1;
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Billing {} failed: {}", order.name, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Recurring billing for {} done: {} invoiced, {} charged, {} failed, {} churned",
            today, report.invoiced, report.charged, report.failed, report.churned
        );
        Ok(report)
    }

    pub(super) async fn bill_order(
        &self,
        order_id: Uuid,
        today: NaiveDate,
    ) -> AppResult<BillingOutcome> {
        let (invoice, token_id) = {
            let _guard = self.locks.acquire(&order_id).await;
            let mut order = self.get_order(order_id).await?;
            let due = order.next_invoice_date.is_some_and(|d| d <= today);
            if order.subscription_state != SubscriptionState::InProgress
                || !due
                || order.pending_transaction
            {
                return Ok(BillingOutcome::Skipped);
            }

            if let (Some(end), Some(next)) = (order.end_date, order.next_invoice_date) {
                if next > end {
                    let before = order.clone();
                    order.subscription_state = SubscriptionState::Churned;
                    order.close_reason = Some("Subscription end date reached".to_string());
                    self.save(Some(&before), &mut order).await?;
                    info!("Subscription {} ended on {}", order.name, end);
                    return Ok(BillingOutcome::Churned);
                }
            }

            // reuse a draft left over from a failed charge
            let draft = self
                .store
                .order_invoices(order_id)
                .await?
                .into_iter()
                .find(|i| i.state == InvoiceState::Draft);
            let invoice = match draft {
                Some(invoice) => invoice,
                None => self.create_invoice_locked(order_id, today).await?,
            };

            match order.payment_token_id {
                Some(token_id) => (invoice, token_id),
                None => {
                    let invoice = self.post_invoice_locked(invoice.id, today).await?;
                    send_quietly(self.mailer.as_ref(), invoice_mail(&order, &invoice)).await;
                    return Ok(BillingOutcome::Invoiced);
                }
            }
        };

        let tx = self.charge_invoice(order_id, &invoice, token_id, today).await?;
        Ok(match tx.state {
            crate::models::subscription::TransactionState::Done => BillingOutcome::Charged,
            crate::models::subscription::TransactionState::Error => BillingOutcome::ChargeFailed,
            _ => BillingOutcome::Invoiced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, order_request};
    use super::*;
    use crate::models::subscription::PaymentToken;
    use crate::services::payment_provider::GatewayError;
    use crate::store::SubscriptionStore;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn posting_advances_next_invoice_date_by_one_period() {
        let fx = fixture().await;
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(2), date(2024, 1, 31)))
            .await
            .unwrap();
        let order = fx.service.confirm_order(quotation.id, date(2024, 1, 31)).await.unwrap();

        let invoice = fx.service.create_invoice(order.id, date(2024, 1, 31)).await.unwrap();
        assert_eq!(invoice.amount_total, dec!(100.00));
        assert_eq!(invoice.lines[0].deferred_start_date, Some(date(2024, 1, 31)));
        assert_eq!(invoice.lines[0].deferred_end_date, Some(date(2024, 2, 28)));

        // drafted lines are no longer due
        let nothing = fx.service.create_invoice(order.id, date(2024, 1, 31)).await;
        assert!(matches!(nothing, Err(AppError::Validation(_))));

        fx.service.post_invoice(invoice.id, date(2024, 1, 31)).await.unwrap();
        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.next_invoice_date, Some(date(2024, 2, 29)));
        assert_eq!(order.last_invoice_date, Some(date(2024, 1, 31)));

        // posting twice does not advance again
        fx.service.post_invoice(invoice.id, date(2024, 1, 31)).await.unwrap();
        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.next_invoice_date, Some(date(2024, 2, 29)));
    }

    #[tokio::test]
    async fn stale_invoice_for_a_billed_period_conflicts() {
        let fx = fixture().await;
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2024, 1, 1)))
            .await
            .unwrap();
        let order = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap();
        let invoice = fx.service.create_invoice(order.id, date(2024, 1, 1)).await.unwrap();

        // another worker billed January in the meantime
        fx.store
            .advance_next_invoice_date(order.id, Some(date(2024, 1, 1)), date(2024, 2, 1), date(2024, 1, 1))
            .await
            .unwrap();

        let result = fx.service.post_invoice(invoice.id, date(2024, 1, 1)).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));

        // nothing was posted, and a retry keeps refusing instead of passing silently
        let stored = fx.store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InvoiceState::Draft);
        assert_eq!(stored.invoice_date, None);
        let retry = fx.service.post_invoice(invoice.id, date(2024, 1, 1)).await;
        assert!(matches!(retry, Err(AppError::Conflict(_))));
        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.next_invoice_date, Some(date(2024, 2, 1)));
    }

    #[tokio::test]
    async fn billing_run_posts_mails_and_charges_tokens() {
        let fx = fixture().await;
        let mailed = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2024, 1, 1)))
            .await
            .unwrap();
        let mailed = fx.service.confirm_order(mailed.id, date(2024, 1, 1)).await.unwrap();

        let charged = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2024, 1, 1)))
            .await
            .unwrap();
        let mut charged = fx.service.confirm_order(charged.id, date(2024, 1, 1)).await.unwrap();
        let token = PaymentToken {
            id: Uuid::new_v4(),
            provider_id: fx.provider.id,
            partner_id: charged.partner_id,
            provider_ref: "tok_visa".to_string(),
            display_name: "•••• 4242".to_string(),
            active: true,
        };
        fx.store.insert_token(&token).await.unwrap();
        charged.payment_token_id = Some(token.id);
        fx.store.update_order(&charged).await.unwrap();

        let report = fx.service.run_recurring_billing(date(2024, 1, 1)).await.unwrap();
        assert_eq!((report.invoiced, report.charged, report.failed), (2, 1, 0));

        for id in [mailed.id, charged.id] {
            let order = fx.service.get_order(id).await.unwrap();
            assert_eq!(order.next_invoice_date, Some(date(2024, 2, 1)));
        }
        let invoices = fx.service.order_invoices(charged.id).await.unwrap();
        assert_eq!(invoices[0].payment_state, InvoicePaymentState::Paid);
        assert!(!fx.mailer.sent.lock().await.is_empty());

        // nothing is due any more
        let report = fx.service.run_recurring_billing(date(2024, 1, 1)).await.unwrap();
        assert_eq!(report.invoiced, 0);
    }

    #[tokio::test]
    async fn refused_charge_keeps_the_period_open() {
        let fx = fixture().await;
        *fx.gateway.charge.lock().await = Err(GatewayError::Rejected("card declined".to_string()));
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2024, 1, 1)))
            .await
            .unwrap();
        let mut order = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap();
        let token = PaymentToken {
            id: Uuid::new_v4(),
            provider_id: fx.provider.id,
            partner_id: order.partner_id,
            provider_ref: "tok_declined".to_string(),
            display_name: "•••• 0002".to_string(),
            active: true,
        };
        fx.store.insert_token(&token).await.unwrap();
        order.payment_token_id = Some(token.id);
        fx.store.update_order(&order).await.unwrap();

        let report = fx.service.run_recurring_billing(date(2024, 1, 1)).await.unwrap();
        assert_eq!(report.failed, 1);

        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.next_invoice_date, Some(date(2024, 1, 1)));
        assert!(!order.pending_transaction);
    }

    #[tokio::test]
    async fn subscriptions_past_their_end_date_churn() {
        let fx = fixture().await;
        let mut request = order_request(&fx, dec!(1), date(2024, 1, 1));
        request.end_date = Some(date(2024, 1, 31));
        let quotation = fx.service.create_order(request).await.unwrap();
        let order = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap();
        fx.store
            .advance_next_invoice_date(order.id, order.next_invoice_date, date(2024, 2, 1), date(2024, 1, 1))
            .await
            .unwrap();

        let report = fx.service.run_recurring_billing(date(2024, 2, 1)).await.unwrap();
        assert_eq!(report.churned, 1);
        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.subscription_state, SubscriptionState::Churned);
    }
}
