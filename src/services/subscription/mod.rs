//! Subscription billing: plans, order lines, invoice periods, portal payments.
//!
//! [`SubscriptionService`] owns every write to subscription orders. Writes to
//! one order serialize on a per-order lock; derived amounts are recomputed
//! explicitly before each save.

mod catalogue;
pub mod gated;
mod invoicing;
mod lifecycle;
pub mod period;
pub mod plan;
mod portal;
pub mod pricing;
mod transactions;

pub use portal::PortalAccess;

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::BillingSettings,
    errors::{AppError, AppResult},
    locks::LockRegistry,
    models::subscription::{Currency, Order, Plan},
    services::{email::Mailer, hooks::RecordWriteHook, payment_provider::PaymentGateway},
    store::SubscriptionStore,
};

/// Model name subscription orders are known by to approvals.
pub const ORDER_MODEL: &str = "subscription.order";

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    mailer: Arc<dyn Mailer>,
    hook: Arc<dyn RecordWriteHook>,
    locks: LockRegistry<Uuid>,
    settings: BillingSettings,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
        hook: Arc<dyn RecordWriteHook>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            mailer,
            hook,
            locks: LockRegistry::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub async fn get_order(&self, id: Uuid) -> AppResult<Order> {
        self.store
            .get_order(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Subscription {} not found", id)))
    }

    async fn plan_of(&self, order: &Order) -> AppResult<Option<Plan>> {
        match order.plan_id {
            Some(plan_id) => self
                .store
                .get_plan(plan_id)
                .await?
                .map(Some)
                .ok_or_else(|| AppError::Validation(format!("invalid plan {}", plan_id))),
            None => Ok(None),
        }
    }

    async fn require_plan(&self, order: &Order) -> AppResult<Plan> {
        self.plan_of(order).await?.ok_or_else(|| {
            AppError::Validation(format!("subscription {} has no plan", order.name))
        })
    }

    /// Currency by code; unknown codes round to the configured default.
    async fn currency(&self, code: &str) -> AppResult<Currency> {
        Ok(self.store.get_currency(code).await?.unwrap_or_else(|| Currency {
            code: code.to_string(),
            decimal_places: self.settings.default_currency_decimals as i32,
        }))
    }

    /// Recompute phase: invoiced quantities, then amounts.
    async fn refresh(&self, order: &mut Order) -> AppResult<()> {
        let invoices = self.store.order_invoices(order.id).await?;
        let plan = self.plan_of(order).await?;
        let currency = self.currency(&order.currency).await?;
        pricing::refresh_invoiced(order, &invoices);
        pricing::refresh_amounts(order, plan.as_ref(), &currency);
        Ok(())
    }

    /// Recomputes, persists and reports the write when a `before` snapshot is given.
    async fn save(&self, before: Option<&Order>, order: &mut Order) -> AppResult<()> {
        self.refresh(order).await?;
        order.updated_at = Utc::now();
        self.store.update_order(order).await?;

        if let Some(before) = before {
            let before = snapshot(before)?;
            let after = snapshot(order)?;
            self.hook.record_written(ORDER_MODEL, order.id, &before, &after).await;
        }
        debug!("Subscription {} saved ({})", order.name, order.subscription_state.as_str());
        Ok(())
    }

    /// Current amounts of an order without persisting them.
    pub async fn with_amounts(&self, mut order: Order) -> AppResult<Order> {
        self.refresh(&mut order).await?;
        Ok(order)
    }
}

/// JSON view of an order as seen by rule domains.
pub fn snapshot(order: &Order) -> AppResult<serde_json::Value> {
    serde_json::to_value(order).map_err(|e| AppError::Internal(e.to_string()))
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::subscription::{
        CreateOrderRequest, InvoicePolicy, NewOrderLine, PaymentProvider, PaymentToken,
        PeriodUnit, Product, Transaction,
    };
    use crate::services::email::{Mailer, OutgoingMail};
    use crate::services::hooks::NoopHook;
    use crate::services::payment_provider::{ChargeStatus, Checkout, GatewayError};
    use crate::store::InMemorySubscriptionStore;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    /// Gateway answering every call with the scripted result.
    pub(crate) struct ScriptedGateway {
        pub charge: Mutex<Result<ChargeStatus, GatewayError>>,
        pub checkout: Mutex<Result<Checkout, GatewayError>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl Default for ScriptedGateway {
        fn default() -> Self {
            Self {
                charge: Mutex::new(Ok(ChargeStatus::Done)),
                checkout: Mutex::new(Ok(Checkout {
                    checkout_url: "https://pay.example/checkout/1".to_string(),
                })),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn create_checkout(
            &self,
            _provider: &PaymentProvider,
            tx: &Transaction,
            _return_url: &str,
        ) -> Result<Checkout, GatewayError> {
            self.calls.lock().await.push(format!("checkout:{}", tx.reference));
            self.checkout.lock().await.clone()
        }

        async fn charge_token(
            &self,
            _provider: &PaymentProvider,
            _token: &PaymentToken,
            tx: &Transaction,
        ) -> Result<ChargeStatus, GatewayError> {
            self.calls.lock().await.push(format!("charge:{}", tx.reference));
            self.charge.lock().await.clone()
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Mutex<Vec<OutgoingMail>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, mail: OutgoingMail) -> AppResult<()> {
            self.sent.lock().await.push(mail);
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub service: SubscriptionService,
        pub store: Arc<InMemorySubscriptionStore>,
        pub gateway: Arc<ScriptedGateway>,
        pub mailer: Arc<RecordingMailer>,
        pub plan: Plan,
        pub product: Product,
        pub provider: PaymentProvider,
    }

    pub(crate) fn order_request(
        fx: &Fixture,
        qty: Decimal,
        start: chrono::NaiveDate,
    ) -> CreateOrderRequest {
        CreateOrderRequest {
            partner_id: Uuid::new_v4(),
            partner_email: Some("customer@example.com".to_string()),
            currency: "USD".to_string(),
            plan_id: Some(fx.plan.id),
            pricelist_id: None,
            start_date: Some(start),
            end_date: None,
            lines: vec![NewOrderLine {
                product_id: fx.product.id,
                qty,
                discount: None,
                price_unit: None,
            }],
        }
    }

    pub(crate) async fn fixture() -> Fixture {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let mailer = Arc::new(RecordingMailer::default());

        store
            .upsert_currency(&Currency {
                code: "USD".to_string(),
                decimal_places: 2,
            })
            .await
            .unwrap();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Monthly".to_string(),
            billing_period_value: 1,
            billing_period_unit: PeriodUnit::Month,
            billing_first_day: false,
            user_closable: true,
            auto_close_limit_days: 15,
        };
        store.insert_plan(&plan).await.unwrap();
        let product = Product {
            id: Uuid::new_v4(),
            name: "Hosting".to_string(),
            list_price: dec!(50),
            uom: "Units".to_string(),
            recurring: true,
            invoice_policy: InvoicePolicy::Prepaid,
        };
        store.insert_product(&product).await.unwrap();
        let provider = PaymentProvider {
            id: Uuid::new_v4(),
            name: "Demo".to_string(),
            code: "demo".to_string(),
            max_amount: Decimal::ZERO,
            validation_amount: dec!(1),
            validation_currency: "USD".to_string(),
            supports_tokenization: true,
        };
        store.insert_provider(&provider).await.unwrap();

        let service = SubscriptionService::new(
            store.clone(),
            gateway.clone(),
            mailer.clone(),
            Arc::new(NoopHook),
            BillingSettings::default(),
        );

        Fixture {
            service,
            store,
            gateway,
            mailer,
            plan,
            product,
            provider,
        }
    }
}
