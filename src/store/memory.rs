// src/store/memory.rs

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ApprovalStore, SubscriptionStore};
use crate::{
    errors::{AppError, AppResult},
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

// ─── Subscriptions ────────────────────────────────────────────────────────────

#[derive(Default)]
struct SubscriptionTables {
    currencies: HashMap<String, Currency>,
    plans: HashMap<Uuid, Plan>,
    products: HashMap<Uuid, Product>,
    pricings: HashMap<Uuid, SubscriptionPricing>,
    orders: HashMap<Uuid, Order>,
    invoices: HashMap<Uuid, Invoice>,
    providers: HashMap<Uuid, PaymentProvider>,
    tokens: HashMap<Uuid, PaymentToken>,
    transactions: HashMap<Uuid, Transaction>,
}

/// Thread-safe in-memory subscription store, used when no database is configured
/// and in tests.
#[derive(Default, Clone)]
pub struct InMemorySubscriptionStore {
    tables: Arc<RwLock<SubscriptionTables>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(what: &str, id: Uuid) -> AppError {
    AppError::NotFound(format!("{} {} not found", what, id))
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn upsert_currency(&self, currency: &Currency) -> AppResult<()> {
        self.tables.write().await.currencies.insert(currency.code.clone(), currency.clone());
        Ok(())
    }

    async fn get_currency(&self, code: &str) -> AppResult<Option<Currency>> {
        Ok(self.tables.read().await.currencies.get(code).cloned())
    }

    async fn insert_plan(&self, plan: &Plan) -> AppResult<()> {
        self.tables.write().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> AppResult<Option<Plan>> {
        Ok(self.tables.read().await.plans.get(&id).cloned())
    }

    async fn insert_product(&self, product: &Product) -> AppResult<()> {
        self.tables.write().await.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn insert_pricing(&self, pricing: &SubscriptionPricing) -> AppResult<()> {
        self.tables.write().await.pricings.insert(pricing.id, pricing.clone());
        Ok(())
    }

    async fn pricings_for(
        &self,
        product_id: Uuid,
        plan_id: Uuid,
    ) -> AppResult<Vec<SubscriptionPricing>> {
        let tables = self.tables.read().await;
        Ok(tables
            .pricings
            .values()
            .filter(|p| p.product_id == product_id && p.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn insert_order(&self, order: &Order) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.id) {
            return Err(AppError::Conflict(format!("order {} already exists", order.id)));
        }
        tables.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables.orders.get_mut(&order.id).ok_or_else(|| missing("order", order.id))?;
        *slot = order.clone();
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> AppResult<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn list_partner_orders(
        &self,
        partner_id: Uuid,
        state: Option<SubscriptionState>,
        offset: i64,
        limit: i64,
    ) -> AppResult<(Vec<Order>, i64)> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.partner_id == partner_id && o.is_subscription)
            .filter(|o| state.is_none_or(|s| o.subscription_state == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = orders.len() as i64;
        let page = orders
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn due_orders(&self, today: NaiveDate) -> AppResult<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut due: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.subscription_state == SubscriptionState::InProgress)
            .filter(|o| o.next_invoice_date.is_some_and(|d| d <= today))
            .cloned()
            .collect();
        due.sort_by_key(|o| (o.next_invoice_date, o.id));
        Ok(due)
    }

    async fn advance_next_invoice_date(
        &self,
        order_id: Uuid,
        expected: Option<NaiveDate>,
        next: NaiveDate,
        invoiced_on: NaiveDate,
    ) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let order = tables.orders.get_mut(&order_id).ok_or_else(|| missing("order", order_id))?;
        if order.next_invoice_date != expected {
            return Ok(false);
        }
        order.next_invoice_date = Some(next);
        order.last_invoice_date = Some(invoiced_on);
        Ok(true)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<()> {
        self.tables.write().await.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .invoices
            .get_mut(&invoice.id)
            .ok_or_else(|| missing("invoice", invoice.id))?;
        *slot = invoice.clone();
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> AppResult<Option<Invoice>> {
        Ok(self.tables.read().await.invoices.get(&id).cloned())
    }

    async fn order_invoices(&self, order_id: Uuid) -> AppResult<Vec<Invoice>> {
        let tables = self.tables.read().await;
        let mut invoices: Vec<Invoice> = tables
            .invoices
            .values()
            .filter(|i| i.subscription_id == order_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.created_at, i.id));
        Ok(invoices)
    }

    async fn insert_provider(&self, provider: &PaymentProvider) -> AppResult<()> {
        self.tables.write().await.providers.insert(provider.id, provider.clone());
        Ok(())
    }

    async fn get_provider(&self, id: Uuid) -> AppResult<Option<PaymentProvider>> {
        Ok(self.tables.read().await.providers.get(&id).cloned())
    }

    async fn insert_token(&self, token: &PaymentToken) -> AppResult<()> {
        self.tables.write().await.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_token(&self, id: Uuid) -> AppResult<Option<PaymentToken>> {
        Ok(self.tables.read().await.tokens.get(&id).cloned())
    }

    async fn insert_transaction(&self, tx: &Transaction) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if tables.transactions.values().any(|t| t.reference == tx.reference) {
            return Err(AppError::Conflict(format!(
                "transaction reference {} already used",
                tx.reference
            )));
        }
        tables.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_transaction(&self, tx: &Transaction) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .transactions
            .get_mut(&tx.id)
            .ok_or_else(|| missing("transaction", tx.id))?;
        *slot = tx.clone();
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>> {
        Ok(self.tables.read().await.transactions.get(&id).cloned())
    }

    async fn transaction_by_reference(&self, reference: &str) -> AppResult<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.values().find(|t| t.reference == reference).cloned())
    }
}

// ─── Approvals ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ApprovalTables {
    rules: HashMap<Uuid, ApprovalRule>,
    entries: HashMap<(Uuid, Uuid, Uuid), ApprovalEntry>,
    activities: HashMap<Uuid, ApprovalActivity>,
    requests: HashMap<Uuid, ApprovalRequest>,
    triggers: HashMap<(String, String), InvalidationTrigger>,
}

#[derive(Default, Clone)]
pub struct InMemoryApprovalStore {
    tables: Arc<RwLock<ApprovalTables>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn insert_rule(&self, rule: &ApprovalRule) -> AppResult<()> {
        self.tables.write().await.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(match tables.rules.get_mut(&id) {
            Some(rule) => {
                rule.active = active;
                true
            }
            None => false,
        })
    }

    async fn get_rule(&self, id: Uuid) -> AppResult<Option<ApprovalRule>> {
        Ok(self.tables.read().await.rules.get(&id).cloned())
    }

    async fn list_rules(&self, model: Option<&str>) -> AppResult<Vec<ApprovalRule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<ApprovalRule> = tables
            .rules
            .values()
            .filter(|r| model.is_none_or(|m| r.model == m))
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            (a.model.as_str(), a.method.as_str(), a.notification_order, a.created_at)
                .cmp(&(b.model.as_str(), b.method.as_str(), b.notification_order, b.created_at))
        });
        Ok(rules)
    }

    async fn active_rules(&self, model: &str, method: &str) -> AppResult<Vec<ApprovalRule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<ApprovalRule> = tables
            .rules
            .values()
            .filter(|r| r.active && r.model == model && r.method == method)
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.notification_order, r.created_at, r.id));
        Ok(rules)
    }

    async fn upsert_entry(&self, entry: &ApprovalEntry) -> AppResult<ApprovalEntry> {
        let mut tables = self.tables.write().await;
        let key = (entry.rule_id, entry.res_id, entry.user_id);
        let stored = tables
            .entries
            .entry(key)
            .and_modify(|existing| {
                existing.approved = entry.approved;
                existing.user_name = entry.user_name.clone();
            })
            .or_insert_with(|| entry.clone());
        Ok(stored.clone())
    }

    async fn get_entry(
        &self,
        rule_id: Uuid,
        res_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<ApprovalEntry>> {
        let tables = self.tables.read().await;
        Ok(tables.entries.get(&(rule_id, res_id, user_id)).cloned())
    }

    async fn entries_for(&self, rule_ids: &[Uuid], res_id: Uuid) -> AppResult<Vec<ApprovalEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<ApprovalEntry> = tables
            .entries
            .values()
            .filter(|e| e.res_id == res_id && rule_ids.contains(&e.rule_id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }

    async fn delete_entry(&self, id: Uuid) -> AppResult<()> {
        self.tables.write().await.entries.retain(|_, e| e.id != id);
        Ok(())
    }

    async fn delete_entries(&self, rule_ids: &[Uuid], res_id: Uuid) -> AppResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.entries.len();
        tables
            .entries
            .retain(|_, e| !(e.res_id == res_id && rule_ids.contains(&e.rule_id)));
        Ok((before - tables.entries.len()) as u64)
    }

    async fn insert_activity(
        &self,
        activity: &ApprovalActivity,
        request: &ApprovalRequest,
    ) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        tables.activities.insert(activity.id, activity.clone());
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn record_activities(
        &self,
        model: &str,
        res_id: Uuid,
    ) -> AppResult<Vec<ApprovalActivity>> {
        let tables = self.tables.read().await;
        let mut activities: Vec<ApprovalActivity> = tables
            .activities
            .values()
            .filter(|a| a.model == model && a.res_id == res_id)
            .cloned()
            .collect();
        activities.sort_by_key(|a| (a.notification_order, a.created_at, a.id));
        Ok(activities)
    }

    async fn close_activities(&self, ids: &[Uuid]) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        tables.activities.retain(|id, _| !ids.contains(id));
        tables.requests.retain(|_, r| !ids.contains(&r.activity_id));
        Ok(())
    }

    async fn user_activities(&self, user_id: Uuid) -> AppResult<Vec<ApprovalActivity>> {
        let tables = self.tables.read().await;
        let mut activities: Vec<ApprovalActivity> = tables
            .activities
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        activities.sort_by_key(|a| (a.deadline, a.created_at, a.id));
        Ok(activities)
    }

    async fn insert_trigger(&self, trigger: &InvalidationTrigger) -> AppResult<InvalidationTrigger> {
        let mut tables = self.tables.write().await;
        let key = (trigger.model.clone(), trigger.method.clone());
        Ok(tables.triggers.entry(key).or_insert_with(|| trigger.clone()).clone())
    }

    async fn model_triggers(&self, model: &str) -> AppResult<Vec<InvalidationTrigger>> {
        let tables = self.tables.read().await;
        Ok(tables.triggers.values().filter(|t| t.model == model).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(rule_id: Uuid, res_id: Uuid, user_id: Uuid, approved: bool) -> ApprovalEntry {
        ApprovalEntry {
            id: Uuid::new_v4(),
            rule_id,
            model: "subscription.order".to_string(),
            res_id,
            user_id,
            user_name: "Admin".to_string(),
            approved,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_collapses_entries_by_rule_record_and_user() {
        let store = InMemoryApprovalStore::new();
        let (rule, res, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = store.upsert_entry(&entry(rule, res, user, true)).await.unwrap();
        let second = store.upsert_entry(&entry(rule, res, user, false)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.approved);
        assert_eq!(store.entries_for(&[rule], res).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trigger_insert_is_idempotent_per_model_and_method() {
        let store = InMemoryApprovalStore::new();
        let trigger = |field: &str| InvalidationTrigger {
            id: Uuid::new_v4(),
            model: "subscription.order".to_string(),
            method: "action_confirm".to_string(),
            watched_field: field.to_string(),
            pre_domain: serde_json::json!([]),
            post_domain: serde_json::json!([]),
        };

        let first = store.insert_trigger(&trigger("state")).await.unwrap();
        let again = store.insert_trigger(&trigger("other")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.watched_field, "state");
    }
}
