// src/store/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, types::Json};
use uuid::Uuid;

use super::{ApprovalStore, SubscriptionStore};
use crate::{
    errors::{AppError, AppResult},
    models::{
        approval::{
            ApprovalActivity, ApprovalEntry, ApprovalRequest, ApprovalRule, InvalidationTrigger,
        },
        subscription::{
            Currency, Invoice, InvoiceLine, InvoicePaymentState, InvoiceState, Order,
            OrderAmounts, OrderLine, OrderStatus, PaymentProvider, PaymentToken, Plan, Product,
            SubscriptionPricing, SubscriptionState, Transaction,
        },
    },
};

/// Unique violations become conflicts, everything else stays a database error.
fn map_write_err(e: sqlx::Error, what: &str) -> AppError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(format!("{} already exists", what))
        }
        _ => AppError::Database(e),
    }
}

fn expect_row(rows_affected: u64, what: &str, id: Uuid) -> AppResult<()> {
    if rows_affected == 0 {
        return Err(AppError::NotFound(format!("{} {} not found", what, id)));
    }
    Ok(())
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

const ORDER_COLUMNS: &str = "id, name, partner_id, partner_email, currency, plan_id, pricelist_id, \
     state, subscription_state, is_subscription, start_date, first_contract_date, \
     next_invoice_date, last_invoice_date, end_date, payment_token_id, pending_transaction, \
     parent_subscription_id, close_reason, close_note, access_token, lines, amounts, \
     created_at, updated_at";

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    name: String,
    partner_id: Uuid,
    partner_email: Option<String>,
    currency: String,
    plan_id: Option<Uuid>,
    pricelist_id: Option<Uuid>,
    state: OrderStatus,
    subscription_state: SubscriptionState,
    is_subscription: bool,
    start_date: Option<NaiveDate>,
    first_contract_date: Option<NaiveDate>,
    next_invoice_date: Option<NaiveDate>,
    last_invoice_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    payment_token_id: Option<Uuid>,
    pending_transaction: bool,
    parent_subscription_id: Option<Uuid>,
    close_reason: Option<String>,
    close_note: Option<String>,
    access_token: String,
    lines: Json<Vec<OrderLine>>,
    amounts: Json<OrderAmounts>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            id: row.id,
            name: row.name,
            partner_id: row.partner_id,
            partner_email: row.partner_email,
            currency: row.currency,
            plan_id: row.plan_id,
            pricelist_id: row.pricelist_id,
            state: row.state,
            subscription_state: row.subscription_state,
            is_subscription: row.is_subscription,
            start_date: row.start_date,
            first_contract_date: row.first_contract_date,
            next_invoice_date: row.next_invoice_date,
            last_invoice_date: row.last_invoice_date,
            end_date: row.end_date,
            payment_token_id: row.payment_token_id,
            pending_transaction: row.pending_transaction,
            parent_subscription_id: row.parent_subscription_id,
            close_reason: row.close_reason,
            close_note: row.close_note,
            access_token: row.access_token,
            lines: row.lines.0,
            amounts: row.amounts.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const INVOICE_COLUMNS: &str = "id, name, subscription_id, partner_id, currency, state, \
     payment_state, invoice_date, lines, amount_total, created_at";

#[derive(FromRow)]
struct InvoiceRow {
    id: Uuid,
    name: String,
    subscription_id: Uuid,
    partner_id: Uuid,
    currency: String,
    state: InvoiceState,
    payment_state: InvoicePaymentState,
    invoice_date: Option<NaiveDate>,
    lines: Json<Vec<InvoiceLine>>,
    amount_total: Decimal,
    created_at: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            name: row.name,
            subscription_id: row.subscription_id,
            partner_id: row.partner_id,
            currency: row.currency,
            state: row.state,
            payment_state: row.payment_state,
            invoice_date: row.invoice_date,
            lines: row.lines.0,
            amount_total: row.amount_total,
            created_at: row.created_at,
        }
    }
}

const TRANSACTION_COLUMNS: &str = "id, reference, provider_id, partner_id, amount, currency, \
     operation, state, state_message, token_id, order_id, invoice_id, subscription_action, \
     tokenize, is_post_processed, created_at, updated_at";

// ─── Subscriptions ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn upsert_currency(&self, currency: &Currency) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO currencies (code, decimal_places) VALUES ($1, $2)
               ON CONFLICT (code) DO UPDATE SET decimal_places = EXCLUDED.decimal_places"#,
        )
        .bind(&currency.code)
        .bind(currency.decimal_places)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_currency(&self, code: &str) -> AppResult<Option<Currency>> {
        let currency = sqlx::query_as::<_, Currency>(
            "SELECT code, decimal_places FROM currencies WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(currency)
    }

    async fn insert_plan(&self, plan: &Plan) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO plans (id, name, billing_period_value, billing_period_unit,
                   billing_first_day, user_closable, auto_close_limit_days)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(plan.billing_period_value)
        .bind(plan.billing_period_unit)
        .bind(plan.billing_first_day)
        .bind(plan.user_closable)
        .bind(plan.auto_close_limit_days)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, "plan"))?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> AppResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"SELECT id, name, billing_period_value, billing_period_unit, billing_first_day,
                      user_closable, auto_close_limit_days
               FROM plans WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn insert_product(&self, product: &Product) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO products (id, name, list_price, uom, recurring, invoice_policy)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(product.list_price)
        .bind(&product.uom)
        .bind(product.recurring)
        .bind(product.invoice_policy)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, "product"))?;
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            "SELECT id, name, list_price, uom, recurring, invoice_policy FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    async fn insert_pricing(&self, pricing: &SubscriptionPricing) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO subscription_pricings (id, product_id, plan_id, pricelist_id, price)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(pricing.id)
        .bind(pricing.product_id)
        .bind(pricing.plan_id)
        .bind(pricing.pricelist_id)
        .bind(pricing.price)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, "pricing"))?;
        Ok(())
    }

    async fn pricings_for(
        &self,
        product_id: Uuid,
        plan_id: Uuid,
    ) -> AppResult<Vec<SubscriptionPricing>> {
        let pricings = sqlx::query_as::<_, SubscriptionPricing>(
            r#"SELECT id, product_id, plan_id, pricelist_id, price
               FROM subscription_pricings
               WHERE product_id = $1 AND plan_id = $2"#,
        )
        .bind(product_id)
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(pricings)
    }

    async fn insert_order(&self, order: &Order) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO subscription_orders ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
              $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)",
            ORDER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(order.id)
            .bind(&order.name)
            .bind(order.partner_id)
            .bind(&order.partner_email)
            .bind(&order.currency)
            .bind(order.plan_id)
            .bind(order.pricelist_id)
            .bind(order.state)
            .bind(order.subscription_state)
            .bind(order.is_subscription)
            .bind(order.start_date)
            .bind(order.first_contract_date)
            .bind(order.next_invoice_date)
            .bind(order.last_invoice_date)
            .bind(order.end_date)
            .bind(order.payment_token_id)
            .bind(order.pending_transaction)
            .bind(order.parent_subscription_id)
            .bind(&order.close_reason)
            .bind(&order.close_note)
            .bind(&order.access_token)
            .bind(Json(&order.lines))
            .bind(Json(&order.amounts))
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_err(e, "order"))?;
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> AppResult<()> {
        let result = sqlx::query(
            r#"UPDATE subscription_orders SET
                   name = $2, partner_email = $3, plan_id = $4, pricelist_id = $5, state = $6,
                   subscription_state = $7, is_subscription = $8, start_date = $9,
                   first_contract_date = $10, next_invoice_date = $11, last_invoice_date = $12,
                   end_date = $13, payment_token_id = $14, pending_transaction = $15,
                   parent_subscription_id = $16, close_reason = $17, close_note = $18,
                   lines = $19, amounts = $20, updated_at = $21
               WHERE id = $1"#,
        )
        .bind(order.id)
        .bind(&order.name)
        .bind(&order.partner_email)
        .bind(order.plan_id)
        .bind(order.pricelist_id)
        .bind(order.state)
        .bind(order.subscription_state)
        .bind(order.is_subscription)
        .bind(order.start_date)
        .bind(order.first_contract_date)
        .bind(order.next_invoice_date)
        .bind(order.last_invoice_date)
        .bind(order.end_date)
        .bind(order.payment_token_id)
        .bind(order.pending_transaction)
        .bind(order.parent_subscription_id)
        .bind(&order.close_reason)
        .bind(&order.close_note)
        .bind(Json(&order.lines))
        .bind(Json(&order.amounts))
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "order", order.id)
    }

    async fn get_order(&self, id: Uuid) -> AppResult<Option<Order>> {
        let sql = format!("SELECT {} FROM subscription_orders WHERE id = $1", ORDER_COLUMNS);
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Order::from))
    }

    async fn list_partner_orders(
        &self,
        partner_id: Uuid,
        state: Option<SubscriptionState>,
        offset: i64,
        limit: i64,
    ) -> AppResult<(Vec<Order>, i64)> {
        let total: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM subscription_orders
               WHERE partner_id = $1 AND is_subscription
                 AND ($2::subscription_state IS NULL OR subscription_state = $2)"#,
        )
        .bind(partner_id)
        .bind(state)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM subscription_orders \
             WHERE partner_id = $1 AND is_subscription \
               AND ($2::subscription_state IS NULL OR subscription_state = $2) \
             ORDER BY created_at DESC, id \
             OFFSET $3 LIMIT $4",
            ORDER_COLUMNS
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(partner_id)
            .bind(state)
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok((rows.into_iter().map(Order::from).collect(), total))
    }

    async fn due_orders(&self, today: NaiveDate) -> AppResult<Vec<Order>> {
        let sql = format!(
            "SELECT {} FROM subscription_orders \
             WHERE subscription_state = 'in_progress' AND next_invoice_date <= $1 \
             ORDER BY next_invoice_date, id",
            ORDER_COLUMNS
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(today)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Order::from).collect())
    }

    async fn advance_next_invoice_date(
        &self,
        order_id: Uuid,
        expected: Option<NaiveDate>,
        next: NaiveDate,
        invoiced_on: NaiveDate,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"UPDATE subscription_orders
               SET next_invoice_date = $3, last_invoice_date = $4, updated_at = NOW()
               WHERE id = $1 AND next_invoice_date IS NOT DISTINCT FROM $2"#,
        )
        .bind(order_id)
        .bind(expected)
        .bind(next)
        .bind(invoiced_on)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO invoices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            INVOICE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(invoice.id)
            .bind(&invoice.name)
            .bind(invoice.subscription_id)
            .bind(invoice.partner_id)
            .bind(&invoice.currency)
            .bind(invoice.state)
            .bind(invoice.payment_state)
            .bind(invoice.invoice_date)
            .bind(Json(&invoice.lines))
            .bind(invoice.amount_total)
            .bind(invoice.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_err(e, "invoice"))?;
        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice) -> AppResult<()> {
        let result = sqlx::query(
            r#"UPDATE invoices SET state = $2, payment_state = $3, invoice_date = $4,
                   lines = $5, amount_total = $6
               WHERE id = $1"#,
        )
        .bind(invoice.id)
        .bind(invoice.state)
        .bind(invoice.payment_state)
        .bind(invoice.invoice_date)
        .bind(Json(&invoice.lines))
        .bind(invoice.amount_total)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "invoice", invoice.id)
    }

    async fn get_invoice(&self, id: Uuid) -> AppResult<Option<Invoice>> {
        let sql = format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS);
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Invoice::from))
    }

    async fn order_invoices(&self, order_id: Uuid) -> AppResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE subscription_id = $1 ORDER BY created_at, id",
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    async fn insert_provider(&self, provider: &PaymentProvider) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO payment_providers (id, name, code, max_amount, validation_amount,
                   validation_currency, supports_tokenization)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(provider.id)
        .bind(&provider.name)
        .bind(&provider.code)
        .bind(provider.max_amount)
        .bind(provider.validation_amount)
        .bind(&provider.validation_currency)
        .bind(provider.supports_tokenization)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, "payment provider"))?;
        Ok(())
    }

    async fn get_provider(&self, id: Uuid) -> AppResult<Option<PaymentProvider>> {
        let provider = sqlx::query_as::<_, PaymentProvider>(
            r#"SELECT id, name, code, max_amount, validation_amount, validation_currency,
                      supports_tokenization
               FROM payment_providers WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(provider)
    }

    async fn insert_token(&self, token: &PaymentToken) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO payment_tokens (id, provider_id, partner_id, provider_ref,
                   display_name, active)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(token.id)
        .bind(token.provider_id)
        .bind(token.partner_id)
        .bind(&token.provider_ref)
        .bind(&token.display_name)
        .bind(token.active)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err(e, "payment token"))?;
        Ok(())
    }

    async fn get_token(&self, id: Uuid) -> AppResult<Option<PaymentToken>> {
        let token = sqlx::query_as::<_, PaymentToken>(
            r#"SELECT id, provider_id, partner_id, provider_ref, display_name, active
               FROM payment_tokens WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO payment_transactions ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            TRANSACTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(tx.id)
            .bind(&tx.reference)
            .bind(tx.provider_id)
            .bind(tx.partner_id)
            .bind(tx.amount)
            .bind(&tx.currency)
            .bind(tx.operation)
            .bind(tx.state)
            .bind(&tx.state_message)
            .bind(tx.token_id)
            .bind(tx.order_id)
            .bind(tx.invoice_id)
            .bind(tx.subscription_action)
            .bind(tx.tokenize)
            .bind(tx.is_post_processed)
            .bind(tx.created_at)
            .bind(tx.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_err(e, "transaction reference"))?;
        Ok(())
    }

    async fn update_transaction(&self, tx: &Transaction) -> AppResult<()> {
        let result = sqlx::query(
            r#"UPDATE payment_transactions SET
                   state = $2, state_message = $3, token_id = $4, invoice_id = $5,
                   tokenize = $6, is_post_processed = $7, updated_at = $8
               WHERE id = $1"#,
        )
        .bind(tx.id)
        .bind(tx.state)
        .bind(&tx.state_message)
        .bind(tx.token_id)
        .bind(tx.invoice_id)
        .bind(tx.tokenize)
        .bind(tx.is_post_processed)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "transaction", tx.id)
    }

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM payment_transactions WHERE id = $1", TRANSACTION_COLUMNS);
        let tx = sqlx::query_as::<_, Transaction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tx)
    }

    async fn transaction_by_reference(&self, reference: &str) -> AppResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE reference = $1",
            TRANSACTION_COLUMNS
        );
        let tx = sqlx::query_as::<_, Transaction>(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tx)
    }
}

// ─── Approvals ────────────────────────────────────────────────────────────────

const RULE_COLUMNS: &str = "id, name, model, method, action_id, domain, approval_group, \
     approver_ids, notifier_ids, notification_order, exclusive_user, \
     can_validate_without_approver, active, created_at";

const ENTRY_COLUMNS: &str = "id, rule_id, model, res_id, user_id, user_name, approved, created_at";

const ACTIVITY_COLUMNS: &str = "id, model, res_id, method, rule_id, notification_order, user_id, \
     summary, deadline, created_at";

const TRIGGER_COLUMNS: &str = "id, model, method, watched_field, pre_domain, post_domain";

#[derive(Clone)]
pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn insert_rule(&self, rule: &ApprovalRule) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO approval_rules ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            RULE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(rule.id)
            .bind(&rule.name)
            .bind(&rule.model)
            .bind(&rule.method)
            .bind(&rule.action_id)
            .bind(&rule.domain)
            .bind(&rule.approval_group)
            .bind(&rule.approver_ids)
            .bind(&rule.notifier_ids)
            .bind(rule.notification_order)
            .bind(rule.exclusive_user)
            .bind(rule.can_validate_without_approver)
            .bind(rule.active)
            .bind(rule.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_err(e, "approval rule"))?;
        Ok(())
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> AppResult<bool> {
        let result = sqlx::query("UPDATE approval_rules SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_rule(&self, id: Uuid) -> AppResult<Option<ApprovalRule>> {
        let sql = format!("SELECT {} FROM approval_rules WHERE id = $1", RULE_COLUMNS);
        let rule = sqlx::query_as::<_, ApprovalRule>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }

    async fn list_rules(&self, model: Option<&str>) -> AppResult<Vec<ApprovalRule>> {
        let sql = format!(
            "SELECT {} FROM approval_rules \
             WHERE ($1::TEXT IS NULL OR model = $1) \
             ORDER BY model, method, notification_order, created_at",
            RULE_COLUMNS
        );
        let rules = sqlx::query_as::<_, ApprovalRule>(&sql)
            .bind(model)
            .fetch_all(&self.pool)
            .await?;
        Ok(rules)
    }

    async fn active_rules(&self, model: &str, method: &str) -> AppResult<Vec<ApprovalRule>> {
        let sql = format!(
            "SELECT {} FROM approval_rules \
             WHERE active AND model = $1 AND method = $2 \
             ORDER BY notification_order, created_at, id",
            RULE_COLUMNS
        );
        let rules = sqlx::query_as::<_, ApprovalRule>(&sql)
            .bind(model)
            .bind(method)
            .fetch_all(&self.pool)
            .await?;
        Ok(rules)
    }

    async fn upsert_entry(&self, entry: &ApprovalEntry) -> AppResult<ApprovalEntry> {
        let sql = format!(
            "INSERT INTO approval_entries ({cols}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (rule_id, res_id, user_id) \
             DO UPDATE SET approved = EXCLUDED.approved, user_name = EXCLUDED.user_name \
             RETURNING {cols}",
            cols = ENTRY_COLUMNS
        );
        let stored = sqlx::query_as::<_, ApprovalEntry>(&sql)
            .bind(entry.id)
            .bind(entry.rule_id)
            .bind(&entry.model)
            .bind(entry.res_id)
            .bind(entry.user_id)
            .bind(&entry.user_name)
            .bind(entry.approved)
            .bind(entry.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    async fn get_entry(
        &self,
        rule_id: Uuid,
        res_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<ApprovalEntry>> {
        let sql = format!(
            "SELECT {} FROM approval_entries WHERE rule_id = $1 AND res_id = $2 AND user_id = $3",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, ApprovalEntry>(&sql)
            .bind(rule_id)
            .bind(res_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn entries_for(&self, rule_ids: &[Uuid], res_id: Uuid) -> AppResult<Vec<ApprovalEntry>> {
        let sql = format!(
            "SELECT {} FROM approval_entries WHERE rule_id = ANY($1) AND res_id = $2 \
             ORDER BY created_at, id",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, ApprovalEntry>(&sql)
            .bind(rule_ids)
            .bind(res_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn delete_entry(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM approval_entries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_entries(&self, rule_ids: &[Uuid], res_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM approval_entries WHERE rule_id = ANY($1) AND res_id = $2")
            .bind(rule_ids)
            .bind(res_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_activity(
        &self,
        activity: &ApprovalActivity,
        request: &ApprovalRequest,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO approval_activities ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            ACTIVITY_COLUMNS
        );
        sqlx::query(&sql)
            .bind(activity.id)
            .bind(&activity.model)
            .bind(activity.res_id)
            .bind(&activity.method)
            .bind(activity.rule_id)
            .bind(activity.notification_order)
            .bind(activity.user_id)
            .bind(&activity.summary)
            .bind(activity.deadline)
            .bind(activity.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO approval_requests (id, rule_id, res_id, activity_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(request.id)
        .bind(request.rule_id)
        .bind(request.res_id)
        .bind(request.activity_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_activities(
        &self,
        model: &str,
        res_id: Uuid,
    ) -> AppResult<Vec<ApprovalActivity>> {
        let sql = format!(
            "SELECT {} FROM approval_activities WHERE model = $1 AND res_id = $2 \
             ORDER BY notification_order, created_at, id",
            ACTIVITY_COLUMNS
        );
        let activities = sqlx::query_as::<_, ApprovalActivity>(&sql)
            .bind(model)
            .bind(res_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(activities)
    }

    async fn close_activities(&self, ids: &[Uuid]) -> AppResult<()> {
        // approval_requests cascade
        sqlx::query("DELETE FROM approval_activities WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn user_activities(&self, user_id: Uuid) -> AppResult<Vec<ApprovalActivity>> {
        let sql = format!(
            "SELECT {} FROM approval_activities WHERE user_id = $1 \
             ORDER BY deadline, created_at, id",
            ACTIVITY_COLUMNS
        );
        let activities = sqlx::query_as::<_, ApprovalActivity>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(activities)
    }

    async fn insert_trigger(&self, trigger: &InvalidationTrigger) -> AppResult<InvalidationTrigger> {
        sqlx::query(
            r#"INSERT INTO approval_invalidation_triggers
                   (id, model, method, watched_field, pre_domain, post_domain)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (model, method) DO NOTHING"#,
        )
        .bind(trigger.id)
        .bind(&trigger.model)
        .bind(&trigger.method)
        .bind(&trigger.watched_field)
        .bind(&trigger.pre_domain)
        .bind(&trigger.post_domain)
        .execute(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM approval_invalidation_triggers WHERE model = $1 AND method = $2",
            TRIGGER_COLUMNS
        );
        let stored = sqlx::query_as::<_, InvalidationTrigger>(&sql)
            .bind(&trigger.model)
            .bind(&trigger.method)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    async fn model_triggers(&self, model: &str) -> AppResult<Vec<InvalidationTrigger>> {
        let sql = format!(
            "SELECT {} FROM approval_invalidation_triggers WHERE model = $1 ORDER BY method",
            TRIGGER_COLUMNS
        );
        let triggers = sqlx::query_as::<_, InvalidationTrigger>(&sql)
            .bind(model)
            .fetch_all(&self.pool)
            .await?;
        Ok(triggers)
    }
}
