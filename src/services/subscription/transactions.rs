// src/services/subscription/transactions.rs

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use super::SubscriptionService;
use crate::{
    errors::{AppError, AppResult},
    models::subscription::{
        CreateTransactionRequest, Invoice, InvoiceState, NotificationStatus, Order, OrderStatus,
        PaymentProvider, PaymentToken, ProviderNotification, SubscriptionAction, Transaction,
        TransactionOperation, TransactionResponse, TransactionState,
    },
    services::{
        email::{invoice_mail, payment_confirmation_mail, send_quietly},
        payment_provider::{ChargeStatus, GatewayError},
    },
};

impl SubscriptionService {
    async fn get_provider(&self, id: Uuid) -> AppResult<PaymentProvider> {
        self.store
            .get_provider(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment provider {} not found", id)))
    }

    async fn get_token(&self, id: Uuid) -> AppResult<PaymentToken> {
        self.store
            .get_token(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment token {} not found", id)))
    }

    pub async fn get_transaction(&self, id: Uuid) -> AppResult<Transaction> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", id)))
    }

    /// Opens a portal payment for a subscription owned by `partner_id`.
    pub async fn create_transaction(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
        req: CreateTransactionRequest,
        today: NaiveDate,
    ) -> AppResult<TransactionResponse> {
        let provider = self.get_provider(req.provider_id).await?;

        let tx = {
            let _guard = self.locks.acquire(&order_id).await;
            let order = self.get_order(order_id).await?;
            if order.partner_id != partner_id
                || order.subscription_state.is_ended()
                || order.state == OrderStatus::Cancelled
            {
                return Err(AppError::NotFound(format!("Subscription {} not found", order_id)));
            }
            let order = self.with_amounts(order).await?;

            let tx = match req.operation {
                TransactionOperation::Validation => self.validation_transaction(&order, &provider)?,
                operation => {
                    let token_id = match operation {
                        TransactionOperation::OnlineToken => {
                            let token_id = req.token_id.ok_or_else(|| {
                                AppError::Validation("token_id is required".to_string())
                            })?;
                            let token = self.get_token(token_id).await?;
                            if !token.active
                                || token.partner_id != partner_id
                                || token.provider_id != provider.id
                            {
                                return Err(AppError::Validation(
                                    "payment token cannot be used here".to_string(),
                                ));
                            }
                            Some(token.id)
                        }
                        _ => None,
                    };
                    self.payment_transaction(&order, &provider, operation, token_id, &req, today)
                        .await?
                }
            };

            self.store.insert_transaction(&tx).await?;
            if tx.operation != TransactionOperation::Validation {
                self.set_pending(order_id, true).await?;
            }
            info!(
                "Transaction {} created for {} ({} {})",
                tx.reference, order.name, tx.amount, tx.currency
            );
            tx
        };

        self.dispatch(tx, &provider, today).await
    }

    fn validation_transaction(
        &self,
        order: &Order,
        provider: &PaymentProvider,
    ) -> AppResult<Transaction> {
        if !provider.supports_tokenization {
            return Err(AppError::Validation(format!(
                "provider {} cannot save payment methods",
                provider.name
            )));
        }
        let mut tx = new_transaction(order, provider, TransactionOperation::Validation);
        tx.amount = provider.validation_amount;
        tx.currency = provider.validation_currency.clone();
        tx.tokenize = true;
        tx.subscription_action = Some(SubscriptionAction::AssignToken);
        Ok(tx)
    }

    async fn payment_transaction(
        &self,
        order: &Order,
        provider: &PaymentProvider,
        operation: TransactionOperation,
        token_id: Option<Uuid>,
        req: &CreateTransactionRequest,
        today: NaiveDate,
    ) -> AppResult<Transaction> {
        let mut tx = new_transaction(order, provider, operation);
        tx.token_id = token_id;
        tx.subscription_action = Some(SubscriptionAction::ManualSendMail);

        if let Some(invoice_id) = req.invoice_id {
            let invoice = self
                .store
                .get_invoice(invoice_id)
                .await?
                .filter(|i| i.subscription_id == order.id && i.state != InvoiceState::Cancel)
                .ok_or_else(|| AppError::NotFound(format!("Invoice {} not found", invoice_id)))?;
            tx.amount = invoice.amount_total;
            tx.invoice_id = Some(invoice.id);
            tx.tokenize = req.tokenize.unwrap_or(false);
            return Ok(tx);
        }

        let amount = req.amount.unwrap_or(match order.state {
            OrderStatus::Confirmed => order.amounts.amount_to_invoice,
            _ => order.amounts.amount_total,
        });
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(format!(
                "nothing to pay on {}",
                order.name
            )));
        }

        let recurring_due = order.amounts.recurring_to_invoice;
        if order.state == OrderStatus::Confirmed
            && recurring_due > Decimal::ZERO
            && amount >= recurring_due
        {
            // the payment settles the current period: bill it now
            self.cancel_draft_invoices_locked(order.id).await?;
            let invoice = self.create_invoice_locked(order.id, today).await?;
            tx.invoice_id = Some(invoice.id);
        }

        let period_total = order.amounts.recurring_total;
        tx.amount = amount;
        tx.tokenize = req
            .tokenize
            .unwrap_or(period_total > Decimal::ZERO && amount >= period_total);
        Ok(tx)
    }

    async fn set_pending(&self, order_id: Uuid, pending: bool) -> AppResult<()> {
        let mut order = self.get_order(order_id).await?;
        if order.pending_transaction != pending {
            order.pending_transaction = pending;
            self.save(None, &mut order).await?;
        }
        Ok(())
    }

    /// Off-session charge of a billed invoice with the subscription's token.
    pub(super) async fn charge_invoice(
        &self,
        order_id: Uuid,
        invoice: &Invoice,
        token_id: Uuid,
        today: NaiveDate,
    ) -> AppResult<Transaction> {
        let token = self.get_token(token_id).await?;
        let provider = self.get_provider(token.provider_id).await?;

        let tx = {
            let _guard = self.locks.acquire(&order_id).await;
            let order = self.get_order(order_id).await?;
            let mut tx = new_transaction(&order, &provider, TransactionOperation::OnlineToken);
            tx.amount = invoice.amount_total;
            tx.currency = invoice.currency.clone();
            tx.token_id = Some(token.id);
            tx.invoice_id = Some(invoice.id);
            tx.subscription_action = Some(SubscriptionAction::AutomaticSendMail);
            self.store.insert_transaction(&tx).await?;
            self.set_pending(order_id, true).await?;
            tx
        };

        Ok(self.dispatch(tx, &provider, today).await?.transaction)
    }

    /// Hands the transaction to the provider.
    async fn dispatch(
        &self,
        tx: Transaction,
        provider: &PaymentProvider,
        today: NaiveDate,
    ) -> AppResult<TransactionResponse> {
        let outcome = match (tx.operation, tx.token_id) {
            (TransactionOperation::OnlineToken, Some(token_id)) => {
                let token = self.get_token(token_id).await?;
                self.gateway
                    .charge_token(provider, &token, &tx)
                    .await
                    .map(|status| (status, None))
            }
            _ => {
                let return_url = match tx.order_id {
                    Some(order_id) => format!(
                        "{}{}",
                        self.settings.public_base_url,
                        self.get_order(order_id).await?.portal_url()
                    ),
                    None => self.settings.public_base_url.clone(),
                };
                self.gateway
                    .create_checkout(provider, &tx, &return_url)
                    .await
                    .map(|c| (ChargeStatus::Pending, Some(c.checkout_url)))
            }
        };

        match outcome {
            Ok((ChargeStatus::Done, _)) => {
                let tx = self.move_transaction(tx, TransactionState::Done, None, today).await?;
                Ok(TransactionResponse {
                    transaction: tx,
                    checkout_url: None,
                })
            }
            Ok((ChargeStatus::Pending, checkout_url)) => {
                let tx = self.move_transaction(tx, TransactionState::Pending, None, today).await?;
                Ok(TransactionResponse {
                    transaction: tx,
                    checkout_url,
                })
            }
            Err(GatewayError::Transient(msg)) => {
                warn!("Provider unavailable for transaction {}: {}", tx.reference, msg);
                if let Some(order_id) = tx.order_id {
                    let _guard = self.locks.acquire(&order_id).await;
                    self.set_pending(order_id, false).await?;
                }
                Err(AppError::ProviderTransient(msg))
            }
            Err(GatewayError::Rejected(msg)) => {
                warn!("Provider refused transaction {}: {}", tx.reference, msg);
                let tx = self
                    .move_transaction(tx, TransactionState::Error, Some(msg), today)
                    .await?;
                Ok(TransactionResponse {
                    transaction: tx,
                    checkout_url: None,
                })
            }
        }
    }

    /// Moves a transaction to `state`. Repeated or late updates of a
    /// finished transaction are ignored.
    async fn move_transaction(
        &self,
        mut tx: Transaction,
        state: TransactionState,
        message: Option<String>,
        today: NaiveDate,
    ) -> AppResult<Transaction> {
        if tx.state == state || tx.state.is_terminal() {
            info!(
                "Transaction {} already {:?}, ignoring {:?}",
                tx.reference, tx.state, state
            );
            return Ok(tx);
        }

        tx.state = state;
        tx.state_message = message;
        tx.updated_at = Utc::now();
        self.store.update_transaction(&tx).await?;
        info!("Transaction {} is now {:?}", tx.reference, state);

        match state {
            TransactionState::Done => self.post_process(tx.id, today).await,
            TransactionState::Cancel | TransactionState::Error => {
                if let Some(order_id) = tx.order_id {
                    let _guard = self.locks.acquire(&order_id).await;
                    self.set_pending(order_id, false).await?;
                }
                Ok(tx)
            }
            _ => Ok(tx),
        }
    }

    /// Applies a provider callback. Callbacks for unknown references are
    /// NotFound; duplicates are no-ops.
    pub async fn handle_notification(
        &self,
        notification: ProviderNotification,
        today: NaiveDate,
    ) -> AppResult<Transaction> {
        let mut tx = self
            .store
            .transaction_by_reference(&notification.reference)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Transaction {} not found", notification.reference))
            })?;

        let state = match notification.status {
            NotificationStatus::Pending => TransactionState::Pending,
            NotificationStatus::Authorized => TransactionState::Authorized,
            NotificationStatus::Done => TransactionState::Done,
            NotificationStatus::Cancel => TransactionState::Cancel,
            NotificationStatus::Error => TransactionState::Error,
        };

        if state == TransactionState::Done && tx.tokenize && tx.token_id.is_none() {
            if let Some(token_ref) = notification.token_ref {
                let token = PaymentToken {
                    id: Uuid::new_v4(),
                    provider_id: tx.provider_id,
                    partner_id: tx.partner_id,
                    display_name: mask(&token_ref),
                    provider_ref: token_ref,
                    active: true,
                };
                self.store.insert_token(&token).await?;
                tx.token_id = Some(token.id);
                self.store.update_transaction(&tx).await?;
                info!("Payment token saved from transaction {}", tx.reference);
            }
        }

        self.move_transaction(tx, state, notification.message, today).await
    }

    /// Applies the side effects of a successful payment exactly once.
    pub async fn post_process(&self, tx_id: Uuid, today: NaiveDate) -> AppResult<Transaction> {
        let tx = self.get_transaction(tx_id).await?;
        if tx.is_post_processed || tx.state != TransactionState::Done {
            return Ok(tx);
        }
        let Some(order_id) = tx.order_id else {
            return self.mark_post_processed(tx).await;
        };

        let _guard = self.locks.acquire(&order_id).await;
        // a concurrent callback may have finished while we waited
        let tx = self.get_transaction(tx_id).await?;
        if tx.is_post_processed {
            return Ok(tx);
        }

        if tx.subscription_action == Some(SubscriptionAction::AssignToken) {
            if let Some(token_id) = tx.token_id {
                if let Err(e) = self.assign_token_locked(order_id, tx.partner_id, token_id).await {
                    warn!("Token from {} not assigned: {}", tx.reference, e);
                }
            }
        } else {
            let mut order = self.get_order(order_id).await?;
            let mut invoice_id = tx.invoice_id;

            if order.state == OrderStatus::Quotation {
                order = self.confirm_locked(order_id, today).await?;
                match self.create_invoice_locked(order_id, today).await {
                    Ok(invoice) => invoice_id = Some(invoice.id),
                    Err(AppError::Validation(msg)) => {
                        warn!("No invoice for paid quotation {}: {}", order.name, msg)
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(invoice_id) = invoice_id {
                let invoice = self.post_invoice_locked(invoice_id, today).await?;
                self.mark_invoice_paid(invoice.id).await?;
                order = self.get_order(order_id).await?;
                send_quietly(self.mailer.as_ref(), invoice_mail(&order, &invoice)).await;
            }

            if tx.tokenize {
                if let Some(token_id) = tx.token_id {
                    if let Err(e) = self.assign_token_locked(order_id, tx.partner_id, token_id).await {
                        warn!("Token from {} not assigned: {}", tx.reference, e);
                    }
                }
            }
            send_quietly(self.mailer.as_ref(), payment_confirmation_mail(&order, &tx)).await;
        }

        self.set_pending(order_id, false).await?;
        self.mark_post_processed(tx).await
    }

    async fn mark_post_processed(&self, mut tx: Transaction) -> AppResult<Transaction> {
        tx.is_post_processed = true;
        tx.updated_at = Utc::now();
        self.store.update_transaction(&tx).await?;
        info!("Transaction {} post-processed", tx.reference);
        Ok(tx)
    }

    /// Makes `token_id` the payment method of the subscription.
    pub async fn assign_token(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
        token_id: Uuid,
    ) -> AppResult<Order> {
        let _guard = self.locks.acquire(&order_id).await;
        self.assign_token_locked(order_id, partner_id, token_id).await
    }

    async fn assign_token_locked(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
        token_id: Uuid,
    ) -> AppResult<Order> {
        let mut order = self.get_order(order_id).await?;
        if order.partner_id != partner_id {
            return Err(AppError::NotFound(format!("Subscription {} not found", order_id)));
        }
        let token = self.get_token(token_id).await?;
        if !token.active {
            return Err(AppError::Validation("payment token is archived".to_string()));
        }
        if token.partner_id != order.partner_id {
            return Err(AppError::Validation(
                "payment token belongs to another customer".to_string(),
            ));
        }

        let provider = self.get_provider(token.provider_id).await?;
        self.refresh(&mut order).await?;
        if provider.max_amount > Decimal::ZERO && order.amounts.amount_total > provider.max_amount {
            return Err(AppError::Validation(format!(
                "{} only accepts payments up to {} {}",
                provider.name, provider.max_amount, order.currency
            )));
        }

        order.payment_token_id = Some(token.id);
        self.save(None, &mut order).await?;
        info!("Payment token {} assigned to {}", token.display_name, order.name);
        Ok(order)
    }
}

fn new_transaction(
    order: &Order,
    provider: &PaymentProvider,
    operation: TransactionOperation,
) -> Transaction {
    let now = Utc::now();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    Transaction {
        id: Uuid::new_v4(),
        reference: format!("{}-{}", order.name, suffix),
        provider_id: provider.id,
        partner_id: order.partner_id,
        amount: Decimal::ZERO,
        currency: order.currency.clone(),
        operation,
        state: TransactionState::Draft,
        state_message: None,
        token_id: None,
        order_id: Some(order.id),
        invoice_id: None,
        subscription_action: None,
        tokenize: false,
        is_post_processed: false,
        created_at: now,
        updated_at: now,
    }
}

fn mask(token_ref: &str) -> String {
    let tail: String = token_ref
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("•••• {}", tail)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, order_request, Fixture};
    use super::*;
    use crate::models::subscription::InvoicePaymentState;
    use crate::store::SubscriptionStore;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn running(fx: &Fixture, qty: Decimal) -> Order {
        let quotation = fx
            .service
            .create_order(order_request(fx, qty, date(2024, 1, 1)))
            .await
            .unwrap();
        fx.service.confirm_order(quotation.id, date(2024, 1, 1)).await.unwrap()
    }

    async fn token_for(fx: &Fixture, order: &Order, provider_id: Uuid) -> PaymentToken {
        let token = PaymentToken {
            id: Uuid::new_v4(),
            provider_id,
            partner_id: order.partner_id,
            provider_ref: "tok_4242".to_string(),
            display_name: "•••• 4242".to_string(),
            active: true,
        };
        fx.store.insert_token(&token).await.unwrap();
        token
    }

    fn redirect(fx: &Fixture) -> CreateTransactionRequest {
        CreateTransactionRequest {
            provider_id: fx.provider.id,
            operation: TransactionOperation::OnlineRedirect,
            token_id: None,
            amount: None,
            invoice_id: None,
            tokenize: None,
        }
    }

    #[tokio::test]
    async fn token_above_provider_max_amount_is_rejected() {
        let fx = fixture().await;
        let order = running(&fx, dec!(3)).await;
        assert_eq!(order.amounts.amount_total, dec!(150.00));

        let capped = PaymentProvider {
            id: Uuid::new_v4(),
            name: "Capped".to_string(),
            code: "capped".to_string(),
            max_amount: dec!(100),
            ..fx.provider.clone()
        };
        fx.store.insert_provider(&capped).await.unwrap();
        let token = token_for(&fx, &order, capped.id).await;

        let result = fx.service.assign_token(order.id, order.partner_id, token.id).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.payment_token_id, None);

        // within the default provider's limits
        let token = token_for(&fx, &order, fx.provider.id).await;
        let order = fx.service.assign_token(order.id, order.partner_id, token.id).await.unwrap();
        assert_eq!(order.payment_token_id, Some(token.id));
    }

    #[tokio::test]
    async fn redirect_payment_bills_the_period_and_duplicate_callbacks_are_ignored() {
        let fx = fixture().await;
        let order = running(&fx, dec!(2)).await;

        let created = fx
            .service
            .create_transaction(order.id, order.partner_id, redirect(&fx), date(2024, 1, 1))
            .await
            .unwrap();
        assert_eq!(created.transaction.state, TransactionState::Pending);
        assert_eq!(created.transaction.amount, dec!(100.00));
        assert!(created.transaction.tokenize);
        assert!(created.checkout_url.is_some());
        assert!(fx.service.get_order(order.id).await.unwrap().pending_transaction);

        let done = ProviderNotification {
            reference: created.transaction.reference.clone(),
            status: NotificationStatus::Done,
            message: None,
            token_ref: Some("tok_card_0005".to_string()),
        };
        let tx = fx.service.handle_notification(done.clone(), date(2024, 1, 1)).await.unwrap();
        assert!(tx.is_post_processed);

        let order = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(order.next_invoice_date, Some(date(2024, 2, 1)));
        assert!(!order.pending_transaction);
        assert_eq!(order.payment_token_id, tx.token_id);

        let invoices = fx.service.order_invoices(order.id).await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].payment_state, InvoicePaymentState::Paid);

        // the provider retries its callback
        fx.service.handle_notification(done, date(2024, 1, 1)).await.unwrap();
        let again = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(again.next_invoice_date, Some(date(2024, 2, 1)));
        assert_eq!(fx.service.order_invoices(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provider_rejection_marks_error_and_clears_pending() {
        let fx = fixture().await;
        *fx.gateway.checkout.lock().await = Err(GatewayError::Rejected("risk check".to_string()));
        let order = running(&fx, dec!(1)).await;

        let response = fx
            .service
            .create_transaction(order.id, order.partner_id, redirect(&fx), date(2024, 1, 1))
            .await
            .unwrap();
        assert_eq!(response.transaction.state, TransactionState::Error);
        assert_eq!(response.transaction.state_message.as_deref(), Some("risk check"));
        assert!(!fx.service.get_order(order.id).await.unwrap().pending_transaction);
    }

    #[tokio::test]
    async fn transient_provider_failure_leaves_transaction_untouched() {
        let fx = fixture().await;
        *fx.gateway.checkout.lock().await = Err(GatewayError::Transient("timeout".to_string()));
        let order = running(&fx, dec!(1)).await;

        let result = fx
            .service
            .create_transaction(order.id, order.partner_id, redirect(&fx), date(2024, 1, 1))
            .await;
        assert!(matches!(result, Err(AppError::ProviderTransient(_))));
        let order = fx.service.get_order(order.id).await.unwrap();
        assert!(!order.pending_transaction);
        assert_eq!(order.next_invoice_date, Some(date(2024, 1, 1)));
    }

    #[tokio::test]
    async fn validation_transaction_saves_and_assigns_the_token() {
        let fx = fixture().await;
        let order = running(&fx, dec!(1)).await;

        let mut req = redirect(&fx);
        req.operation = TransactionOperation::Validation;
        let created = fx
            .service
            .create_transaction(order.id, order.partner_id, req, date(2024, 1, 1))
            .await
            .unwrap();
        assert_eq!(created.transaction.amount, dec!(1));
        assert_eq!(
            created.transaction.subscription_action,
            Some(SubscriptionAction::AssignToken)
        );

        let tx = fx
            .service
            .handle_notification(
                ProviderNotification {
                    reference: created.transaction.reference,
                    status: NotificationStatus::Done,
                    message: None,
                    token_ref: Some("tok_visa_1881".to_string()),
                },
                date(2024, 1, 1),
            )
            .await
            .unwrap();

        let order = fx.service.get_order(order.id).await.unwrap();
        assert!(order.payment_token_id.is_some());
        assert_eq!(order.payment_token_id, tx.token_id);
        // validation payments do not bill anything
        assert_eq!(order.next_invoice_date, Some(date(2024, 1, 1)));
        assert!(fx.service.order_invoices(order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_partners_cannot_pay_a_subscription() {
        let fx = fixture().await;
        let order = running(&fx, dec!(1)).await;
        let result = fx
            .service
            .create_transaction(order.id, Uuid::new_v4(), redirect(&fx), date(2024, 1, 1))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
