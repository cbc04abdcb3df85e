// src/services/subscription/lifecycle.rs

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use super::{SubscriptionService, pricing, short_id};
use crate::{
    errors::{AppError, AppResult},
    models::subscription::{
        CreateOrderRequest, NewOrderLine, Order, OrderAmounts, OrderLine, OrderStatus, Plan,
        SubscriptionState,
    },
};

impl SubscriptionService {
    /// Builds order lines priced for `plan` and `pricelist_id`.
    async fn build_lines(
        &self,
        requested: &[NewOrderLine],
        plan: Option<&Plan>,
        pricelist_id: Option<Uuid>,
    ) -> AppResult<Vec<OrderLine>> {
        let mut lines = Vec::with_capacity(requested.len());
        for new_line in requested {
            let product = self
                .store
                .get_product(new_line.product_id)
                .await?
                .ok_or_else(|| {
                    AppError::Validation(format!("unknown product {}", new_line.product_id))
                })?;
            if new_line.qty < Decimal::ZERO {
                return Err(AppError::Validation(format!(
                    "quantity of {} cannot be negative",
                    product.name
                )));
            }
            let discount = new_line.discount.unwrap_or(Decimal::ZERO);
            if discount < Decimal::ZERO || discount > Decimal::ONE_HUNDRED {
                return Err(AppError::Validation(format!(
                    "discount of {} must be between 0 and 100",
                    product.name
                )));
            }

            let price_unit = match (new_line.price_unit, plan) {
                (Some(price), _) => price,
                (None, Some(plan)) if product.recurring => {
                    let pricings = self.store.pricings_for(product.id, plan.id).await?;
                    pricing::resolve_price(&product, &pricings, pricelist_id)
                }
                (None, _) => product.list_price,
            };
            if product.recurring && plan.is_none() {
                return Err(AppError::Validation(format!(
                    "recurring product {} needs a plan",
                    product.name
                )));
            }

            lines.push(OrderLine {
                id: Uuid::new_v4(),
                product_id: Some(product.id),
                name: product.name.clone(),
                qty: new_line.qty,
                uom: product.uom.clone(),
                price_unit,
                discount,
                is_recurring: product.recurring,
                invoice_policy: product.invoice_policy,
                parent_line_id: None,
                last_invoiced_date: None,
                qty_invoiced: Decimal::ZERO,
                qty_to_invoice: Decimal::ZERO,
                is_note: false,
            });
        }
        Ok(lines)
    }

    /// Creates a draft quotation with priced lines.
    pub async fn create_order(&self, req: CreateOrderRequest) -> AppResult<Order> {
        if req.currency.trim().is_empty() {
            return Err(AppError::Validation("currency is required".to_string()));
        }
        if req.lines.is_empty() {
            return Err(AppError::Validation("an order needs at least one line".to_string()));
        }
        let plan = match req.plan_id {
            Some(plan_id) => {
                let plan = self
                    .store
                    .get_plan(plan_id)
                    .await?
                    .ok_or_else(|| AppError::Validation(format!("invalid plan {}", plan_id)))?;
                plan.validate()?;
                Some(plan)
            }
            None => None,
        };

        let lines = self.build_lines(&req.lines, plan.as_ref(), req.pricelist_id).await?;
        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4(),
            name: format!("SUB-{}", short_id()),
            partner_id: req.partner_id,
            partner_email: req.partner_email,
            currency: req.currency,
            plan_id: plan.as_ref().map(|p| p.id),
            pricelist_id: req.pricelist_id,
            state: OrderStatus::Quotation,
            subscription_state: SubscriptionState::Draft,
            is_subscription: lines.iter().any(|l| l.is_recurring),
            start_date: req.start_date,
            first_contract_date: None,
            next_invoice_date: None,
            last_invoice_date: None,
            end_date: req.end_date,
            payment_token_id: None,
            pending_transaction: false,
            parent_subscription_id: None,
            close_reason: None,
            close_note: None,
            access_token: Uuid::new_v4().simple().to_string(),
            lines,
            amounts: OrderAmounts::default(),
            created_at: now,
            updated_at: now,
        };

        let currency = self.currency(&order.currency).await?;
        pricing::refresh_amounts(&mut order, plan.as_ref(), &currency);
        self.store.insert_order(&order).await?;

        info!(
            "Quotation {} created for partner {} (total {})",
            order.name, order.partner_id, order.amounts.amount_total
        );
        Ok(order)
    }

    pub async fn confirm_order(&self, order_id: Uuid, today: NaiveDate) -> AppResult<Order> {
        let _guard = self.locks.acquire(&order_id).await;
        self.confirm_locked(order_id, today).await
    }

    pub(super) async fn confirm_locked(&self, order_id: Uuid, today: NaiveDate) -> AppResult<Order> {
        let mut order = self.get_order(order_id).await?;
        if order.state != OrderStatus::Quotation {
            return Err(AppError::Validation(format!(
                "only quotations can be confirmed, {} is {:?}",
                order.name, order.state
            )));
        }
        let before = order.clone();

        match order.subscription_state {
            SubscriptionState::Renewal => self.close_renewed_parent(&mut order, today).await?,
            SubscriptionState::Upsell => self.merge_upsell_into_parent(&order).await?,
            _ => {}
        }

        order.state = OrderStatus::Confirmed;
        if order.is_subscription && order.subscription_state != SubscriptionState::Upsell {
            let start = order.start_date.unwrap_or(today);
            order.start_date = Some(start);
            order.first_contract_date.get_or_insert(start);
            order.next_invoice_date = Some(start);
            order.subscription_state = SubscriptionState::InProgress;
        }

        self.save(Some(&before), &mut order).await?;
        info!(
            "Order {} confirmed ({}), next invoice {:?}",
            order.name,
            order.subscription_state.as_str(),
            order.next_invoice_date
        );
        Ok(order)
    }

    pub(super) async fn parent_of(&self, order: &Order) -> AppResult<Order> {
        let parent_id = order.parent_subscription_id.ok_or_else(|| {
            AppError::Validation(format!("{} has no parent subscription", order.name))
        })?;
        self.get_order(parent_id).await
    }

    /// The renewal takes over from its parent's next invoice date.
    async fn close_renewed_parent(&self, renewal: &mut Order, today: NaiveDate) -> AppResult<()> {
        let parent_id = renewal.parent_subscription_id.unwrap_or_default();
        let _guard = self.locks.acquire(&parent_id).await;
        let mut parent = self.parent_of(renewal).await?;
        let before = parent.clone();

        let start = renewal
            .start_date
            .or(parent.next_invoice_date)
            .unwrap_or(today);
        renewal.start_date = Some(start);
        renewal.first_contract_date = parent.first_contract_date.or(Some(start));

        parent.subscription_state = SubscriptionState::Closed;
        parent.end_date = Some(parent.end_date.unwrap_or(start - Duration::days(1)));
        parent.pending_transaction = false;
        self.save(Some(&before), &mut parent).await?;

        info!("Subscription {} closed, renewed by {}", parent.name, renewal.name);
        Ok(())
    }

    /// Adds upsold quantities to the parent's lines, appending lines the
    /// parent does not have yet.
    async fn merge_upsell_into_parent(&self, upsell: &Order) -> AppResult<()> {
        let parent_id = upsell.parent_subscription_id.unwrap_or_default();
        let _guard = self.locks.acquire(&parent_id).await;
        let mut parent = self.parent_of(upsell).await?;
        if !matches!(
            parent.subscription_state,
            SubscriptionState::InProgress | SubscriptionState::Paused
        ) {
            return Err(AppError::Validation(format!(
                "cannot upsell {} subscription {}",
                parent.subscription_state.as_str(),
                parent.name
            )));
        }
        let before = parent.clone();

        for line in upsell.lines.iter().filter(|l| l.is_recurring && !l.is_note) {
            match line
                .parent_line_id
                .and_then(|id| parent.lines.iter_mut().find(|p| p.id == id))
            {
                Some(parent_line) => parent_line.qty += line.qty,
                None if !line.qty.is_zero() => parent.lines.push(OrderLine {
                    id: Uuid::new_v4(),
                    discount: Decimal::ZERO,
                    parent_line_id: None,
                    last_invoiced_date: None,
                    qty_invoiced: Decimal::ZERO,
                    qty_to_invoice: Decimal::ZERO,
                    ..line.clone()
                }),
                None => {}
            }
        }

        self.save(Some(&before), &mut parent).await?;
        info!("Upsell {} merged into {}", upsell.name, parent.name);
        Ok(())
    }

    async fn transition(
        &self,
        order_id: Uuid,
        allowed: &[SubscriptionState],
        apply: impl FnOnce(&mut Order),
    ) -> AppResult<Order> {
        let _guard = self.locks.acquire(&order_id).await;
        let mut order = self.get_order(order_id).await?;
        if order.state != OrderStatus::Confirmed || !allowed.contains(&order.subscription_state) {
            return Err(AppError::Validation(format!(
                "subscription {} is {}",
                order.name,
                order.subscription_state.as_str()
            )));
        }
        let before = order.clone();
        apply(&mut order);
        self.save(Some(&before), &mut order).await?;
        Ok(order)
    }

    pub async fn pause(&self, order_id: Uuid) -> AppResult<Order> {
        let order = self
            .transition(order_id, &[SubscriptionState::InProgress], |o| {
                o.subscription_state = SubscriptionState::Paused
            })
            .await?;
        info!("Subscription {} paused", order.name);
        Ok(order)
    }

    pub async fn resume(&self, order_id: Uuid) -> AppResult<Order> {
        let order = self
            .transition(order_id, &[SubscriptionState::Paused], |o| {
                o.subscription_state = SubscriptionState::InProgress
            })
            .await?;
        info!("Subscription {} resumed", order.name);
        Ok(order)
    }

    /// Churns the subscription as of `today`.
    pub async fn close(
        &self,
        order_id: Uuid,
        reason: &str,
        note: Option<String>,
        today: NaiveDate,
    ) -> AppResult<Order> {
        if reason.trim().is_empty() {
            return Err(AppError::Validation("a close reason is required".to_string()));
        }
        let reason = reason.trim().to_string();
        let order = self
            .transition(
                order_id,
                &[SubscriptionState::InProgress, SubscriptionState::Paused],
                |o| {
                    o.subscription_state = SubscriptionState::Churned;
                    o.end_date = Some(today);
                    o.close_reason = Some(reason);
                    o.close_note = note;
                    o.pending_transaction = false;
                },
            )
            .await?;
        info!("Subscription {} closed: {:?}", order.name, order.close_reason);
        Ok(order)
    }

    /// Closing from the portal also requires a user-closable plan.
    pub async fn close_from_portal(
        &self,
        order: &Order,
        reason: &str,
        note: Option<String>,
        today: NaiveDate,
    ) -> AppResult<Order> {
        let plan = self.require_plan(order).await?;
        if !plan.user_closable {
            return Err(AppError::Forbidden(format!(
                "plan {} cannot be closed by the customer",
                plan.name
            )));
        }
        self.close(order.id, reason, note, today).await
    }

    /// Cancels a quotation or a confirmed order; running subscriptions end today.
    pub async fn cancel_order(&self, order_id: Uuid, today: NaiveDate) -> AppResult<Order> {
        let _guard = self.locks.acquire(&order_id).await;
        let mut order = self.get_order(order_id).await?;
        if order.state == OrderStatus::Cancelled {
            return Ok(order);
        }
        let before = order.clone();
        order.state = OrderStatus::Cancelled;
        order.pending_transaction = false;
        if matches!(
            order.subscription_state,
            SubscriptionState::InProgress | SubscriptionState::Paused
        ) {
            order.subscription_state = SubscriptionState::Churned;
            order.end_date = Some(today);
        }
        self.cancel_draft_invoices_locked(order_id).await?;
        self.save(Some(&before), &mut order).await?;
        info!("Order {} cancelled", order.name);
        Ok(order)
    }

    /// Reopens a churned subscription.
    pub async fn reopen(&self, order_id: Uuid) -> AppResult<Order> {
        let order = self
            .transition(order_id, &[SubscriptionState::Churned], |o| {
                o.subscription_state = SubscriptionState::InProgress;
                o.end_date = None;
                o.close_reason = None;
                o.close_note = None;
            })
            .await?;
        info!("Subscription {} reopened", order.name);
        Ok(order)
    }

    fn child_of(parent: &Order, state: SubscriptionState, lines: Vec<OrderLine>) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            name: format!("{}-{}", parent.name, short_id()),
            partner_id: parent.partner_id,
            partner_email: parent.partner_email.clone(),
            currency: parent.currency.clone(),
            plan_id: parent.plan_id,
            pricelist_id: parent.pricelist_id,
            state: OrderStatus::Quotation,
            subscription_state: state,
            is_subscription: true,
            start_date: None,
            first_contract_date: parent.first_contract_date,
            next_invoice_date: None,
            last_invoice_date: None,
            end_date: None,
            payment_token_id: parent.payment_token_id,
            pending_transaction: false,
            parent_subscription_id: Some(parent.id),
            close_reason: None,
            close_note: None,
            access_token: Uuid::new_v4().simple().to_string(),
            lines,
            amounts: OrderAmounts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn carried_line(parent_line: &OrderLine, qty: Decimal) -> OrderLine {
        OrderLine {
            id: Uuid::new_v4(),
            qty,
            parent_line_id: Some(parent_line.id),
            last_invoiced_date: None,
            qty_invoiced: Decimal::ZERO,
            qty_to_invoice: Decimal::ZERO,
            ..parent_line.clone()
        }
    }

    fn ensure_extendable(parent: &Order) -> AppResult<()> {
        if parent.state != OrderStatus::Confirmed
            || !matches!(
                parent.subscription_state,
                SubscriptionState::InProgress | SubscriptionState::Paused
            )
        {
            return Err(AppError::Validation(format!(
                "subscription {} is {} and cannot be extended",
                parent.name,
                parent.subscription_state.as_str()
            )));
        }
        Ok(())
    }

    /// Quotation continuing `order_id` from its next invoice date with the same
    /// recurring lines and prices.
    pub async fn prepare_renewal(&self, order_id: Uuid, today: NaiveDate) -> AppResult<Order> {
        let _guard = self.locks.acquire(&order_id).await;
        let parent = self.get_order(order_id).await?;
        Self::ensure_extendable(&parent)?;

        let lines = parent
            .lines
            .iter()
            .filter(|l| l.is_recurring && !l.is_note)
            .map(|l| Self::carried_line(l, l.qty))
            .collect();
        let mut renewal = Self::child_of(&parent, SubscriptionState::Renewal, lines);
        renewal.start_date = Some(
            parent
                .next_invoice_date
                .or(parent.end_date.map(|d| d + Duration::days(1)))
                .unwrap_or(today),
        );

        let plan = self.plan_of(&renewal).await?;
        let currency = self.currency(&renewal.currency).await?;
        pricing::refresh_amounts(&mut renewal, plan.as_ref(), &currency);
        self.store.insert_order(&renewal).await?;

        info!("Renewal {} prepared for {}", renewal.name, parent.name);
        Ok(renewal)
    }

    /// Quotation adding lines to `order_id` until its next invoice date, with
    /// recurring prices prorated through the line discount.
    pub async fn prepare_upsell(
        &self,
        order_id: Uuid,
        requested: &[NewOrderLine],
        today: NaiveDate,
    ) -> AppResult<Order> {
        let _guard = self.locks.acquire(&order_id).await;
        let parent = self.get_order(order_id).await?;
        Self::ensure_extendable(&parent)?;
        let plan = self.require_plan(&parent).await?;
        let parent_next = parent.next_invoice_date.ok_or_else(|| {
            AppError::Validation(format!("{} has no next invoice date", parent.name))
        })?;
        let currency = self.currency(&parent.currency).await?;

        let lines = if requested.is_empty() {
            parent
                .lines
                .iter()
                .filter(|l| l.is_recurring && !l.is_note)
                .map(|l| Self::carried_line(l, Decimal::ZERO))
                .collect()
        } else {
            self.build_lines(requested, Some(&plan), parent.pricelist_id).await?
        };

        let mut upsell = Self::child_of(&parent, SubscriptionState::Upsell, lines);
        upsell.start_date = Some(today);

        let ratio = pricing::upsell_ratio(today, parent.first_contract_date, parent_next, &plan)?;
        let mut prorated = false;
        for i in 0..upsell.lines.len() {
            if upsell.lines[i].parent_line_id.is_none() {
                let matched =
                    pricing::find_parent_line(&upsell.lines[i], &upsell, &parent, &currency);
                upsell.lines[i].parent_line_id = matched;
            }
            let line = &mut upsell.lines[i];
            let parent_line = line.parent_line_id.and_then(|id| parent.line(id));
            if let Some(parent_line) = parent_line {
                line.price_unit = parent_line.price_unit;
            }
            if line.is_recurring {
                line.discount =
                    pricing::prorated_discount(ratio, parent_line.map(|p| p.discount));
                prorated |= ratio != Decimal::ONE;
            }
        }
        let has_note = upsell
            .lines
            .iter()
            .any(|l| l.is_note && l.name.starts_with(pricing::PRORATA_NOTE_PREFIX));
        if prorated && !has_note {
            let start = parent.first_contract_date.map_or(today, |d| d.max(today));
            upsell
                .lines
                .push(OrderLine::note(pricing::prorata_note(start, parent_next)));
        }

        pricing::refresh_amounts(&mut upsell, Some(&plan), &currency);
        self.store.insert_order(&upsell).await?;

        info!(
            "Upsell {} prepared for {} (prorata {})",
            upsell.name, parent.name, ratio
        );
        Ok(upsell)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, order_request};
    use super::*;
    use crate::models::subscription::SubscriptionState;
    use crate::store::SubscriptionStore;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn confirming_a_quotation_starts_the_subscription() {
        let fx = fixture().await;
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(2), date(2024, 1, 1)))
            .await
            .unwrap();
        assert_eq!(quotation.amounts.amount_total, dec!(100.00));
        assert_eq!(quotation.amounts.amount_to_invoice, Decimal::ZERO);

        let order = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap();
        assert_eq!(order.subscription_state, SubscriptionState::InProgress);
        assert_eq!(order.next_invoice_date, Some(date(2024, 1, 1)));
        assert_eq!(order.first_contract_date, Some(date(2024, 1, 1)));
        assert_eq!(order.amounts.recurring_monthly, dec!(100.00));

        let again = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await;
        assert!(matches!(again, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn upsell_is_prorated_and_merged_into_the_parent() {
        let fx = fixture().await;
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2023, 6, 1)))
            .await
            .unwrap();
        let parent = fx.service.confirm_order(quotation.id, date(2023, 6, 1)).await.unwrap();
        // pretend the parent is billed up to the end of January
        fx.store
            .advance_next_invoice_date(parent.id, parent.next_invoice_date, date(2024, 2, 1), date(2024, 1, 1))
            .await
            .unwrap();

        let request = [NewOrderLine {
            product_id: fx.product.id,
            qty: dec!(3),
            discount: None,
            price_unit: None,
        }];
        let upsell = fx
            .service
            .prepare_upsell(parent.id, &request, date(2024, 1, 22))
            .await
            .unwrap();

        let line = &upsell.lines[0];
        assert_eq!(line.parent_line_id, Some(parent.lines[0].id));
        assert_eq!(line.discount, dec!(67.74));
        assert!(upsell.lines.iter().any(|l| l.is_note
            && l.name == "(*) prorated from 2024-01-22 to 2024-01-31"));

        fx.service.confirm_order(upsell.id, date(2024, 1, 22)).await.unwrap();
        let parent = fx.service.get_order(parent.id).await.unwrap();
        assert_eq!(parent.lines.len(), 1);
        assert_eq!(parent.lines[0].qty, dec!(4));
    }

    #[tokio::test]
    async fn renewal_closes_the_parent_and_starts_at_its_next_invoice_date() {
        let fx = fixture().await;
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2024, 1, 1)))
            .await
            .unwrap();
        let parent = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap();

        let renewal = fx.service.prepare_renewal(parent.id, date(2024, 1, 10)).await.unwrap();
        assert_eq!(renewal.lines[0].parent_line_id, Some(parent.lines[0].id));
        assert_eq!(renewal.lines[0].price_unit, parent.lines[0].price_unit);

        let renewal = fx.service.confirm_order(renewal.id, date(2024, 1, 10)).await.unwrap();
        assert_eq!(renewal.start_date, Some(date(2024, 1, 1)));
        assert_eq!(renewal.subscription_state, SubscriptionState::InProgress);
        let parent = fx.service.get_order(parent.id).await.unwrap();
        assert_eq!(parent.subscription_state, SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn close_requires_reason_and_user_closable_plan_on_portal() {
        let fx = fixture().await;
        let quotation = fx
            .service
            .create_order(order_request(&fx, dec!(1), date(2024, 1, 1)))
            .await
            .unwrap();
        let order = fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap();

        assert!(fx.service.close(order.id, " ", None, date(2024, 1, 5)).await.is_err());
        let closed = fx
            .service
            .close_from_portal(&order, "Too expensive", Some("bye".to_string()), date(2024, 1, 5))
            .await
            .unwrap();
        assert_eq!(closed.subscription_state, SubscriptionState::Churned);
        assert_eq!(closed.end_date, Some(date(2024, 1, 5)));

        let reopened = fx.service.reopen(order.id).await.unwrap();
        assert_eq!(reopened.subscription_state, SubscriptionState::InProgress);
        assert_eq!(reopened.end_date, None);
    }
}
