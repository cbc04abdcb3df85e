// src/store/mod.rs
//
// Persistence ports. Services only see these traits; `memory` backs tests and
// database-less deployments, `postgres` backs production.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::{
    errors::AppResult,
    models::{
        approval::{
            ApprovalActivity, ApprovalEntry, ApprovalRequest, ApprovalRule, InvalidationTrigger,
        },
        subscription::{
            Currency, Invoice, Order, PaymentProvider, PaymentToken, Plan, Product,
            SubscriptionPricing, SubscriptionState, Transaction,
        },
    },
};

pub use memory::{InMemoryApprovalStore, InMemorySubscriptionStore};
pub use postgres::{PgApprovalStore, PgSubscriptionStore};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // ─── Catalogue ────────────────────────────────────────
    async fn upsert_currency(&self, currency: &Currency) -> AppResult<()>;
    async fn get_currency(&self, code: &str) -> AppResult<Option<Currency>>;
    async fn insert_plan(&self, plan: &Plan) -> AppResult<()>;
    async fn get_plan(&self, id: Uuid) -> AppResult<Option<Plan>>;
    async fn insert_product(&self, product: &Product) -> AppResult<()>;
    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>>;
    async fn insert_pricing(&self, pricing: &SubscriptionPricing) -> AppResult<()>;
    /// All pricings of `product_id` for `plan_id`, whatever their pricelist.
    async fn pricings_for(&self, product_id: Uuid, plan_id: Uuid)
    -> AppResult<Vec<SubscriptionPricing>>;

    // ─── Orders ───────────────────────────────────────────
    async fn insert_order(&self, order: &Order) -> AppResult<()>;
    async fn update_order(&self, order: &Order) -> AppResult<()>;
    async fn get_order(&self, id: Uuid) -> AppResult<Option<Order>>;
    /// One page of a partner's subscriptions plus the unpaged total.
    async fn list_partner_orders(
        &self,
        partner_id: Uuid,
        state: Option<SubscriptionState>,
        offset: i64,
        limit: i64,
    ) -> AppResult<(Vec<Order>, i64)>;
    /// In-progress subscriptions whose next invoice date is on or before `today`.
    async fn due_orders(&self, today: NaiveDate) -> AppResult<Vec<Order>>;
    /// Compare-and-swap of `next_invoice_date`. Returns false when the stored
    /// value no longer equals `expected`.
    async fn advance_next_invoice_date(
        &self,
        order_id: Uuid,
        expected: Option<NaiveDate>,
        next: NaiveDate,
        invoiced_on: NaiveDate,
    ) -> AppResult<bool>;

    // ─── Invoices ─────────────────────────────────────────
    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<()>;
    async fn update_invoice(&self, invoice: &Invoice) -> AppResult<()>;
    async fn get_invoice(&self, id: Uuid) -> AppResult<Option<Invoice>>;
    async fn order_invoices(&self, order_id: Uuid) -> AppResult<Vec<Invoice>>;

    // ─── Payments ─────────────────────────────────────────
    async fn insert_provider(&self, provider: &PaymentProvider) -> AppResult<()>;
    async fn get_provider(&self, id: Uuid) -> AppResult<Option<PaymentProvider>>;
    async fn insert_token(&self, token: &PaymentToken) -> AppResult<()>;
    async fn get_token(&self, id: Uuid) -> AppResult<Option<PaymentToken>>;
    async fn insert_transaction(&self, tx: &Transaction) -> AppResult<()>;
    async fn update_transaction(&self, tx: &Transaction) -> AppResult<()>;
    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>>;
    async fn transaction_by_reference(&self, reference: &str) -> AppResult<Option<Transaction>>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    // ─── Rules ────────────────────────────────────────────
    async fn insert_rule(&self, rule: &ApprovalRule) -> AppResult<()>;
    async fn set_rule_active(&self, id: Uuid, active: bool) -> AppResult<bool>;
    async fn get_rule(&self, id: Uuid) -> AppResult<Option<ApprovalRule>>;
    async fn list_rules(&self, model: Option<&str>) -> AppResult<Vec<ApprovalRule>>;
    /// Active rules for a (model, method) pair, any action.
    async fn active_rules(&self, model: &str, method: &str) -> AppResult<Vec<ApprovalRule>>;

    // ─── Entries ──────────────────────────────────────────
    /// Inserts or updates on (rule_id, res_id, user_id); returns the stored row.
    async fn upsert_entry(&self, entry: &ApprovalEntry) -> AppResult<ApprovalEntry>;
    async fn get_entry(
        &self,
        rule_id: Uuid,
        res_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<ApprovalEntry>>;
    /// Entries of the given rules on one record, oldest first.
    async fn entries_for(&self, rule_ids: &[Uuid], res_id: Uuid) -> AppResult<Vec<ApprovalEntry>>;
    async fn delete_entry(&self, id: Uuid) -> AppResult<()>;
    async fn delete_entries(&self, rule_ids: &[Uuid], res_id: Uuid) -> AppResult<u64>;

    // ─── Activities ───────────────────────────────────────
    async fn insert_activity(
        &self,
        activity: &ApprovalActivity,
        request: &ApprovalRequest,
    ) -> AppResult<()>;
    async fn record_activities(&self, model: &str, res_id: Uuid)
    -> AppResult<Vec<ApprovalActivity>>;
    /// Removes the activities and their approval requests.
    async fn close_activities(&self, ids: &[Uuid]) -> AppResult<()>;
    async fn user_activities(&self, user_id: Uuid) -> AppResult<Vec<ApprovalActivity>>;

    // ─── Invalidation triggers ────────────────────────────
    /// Inserts unless a trigger already exists for (model, method); returns the stored one.
    async fn insert_trigger(&self, trigger: &InvalidationTrigger) -> AppResult<InvalidationTrigger>;
    async fn model_triggers(&self, model: &str) -> AppResult<Vec<InvalidationTrigger>>;
}
