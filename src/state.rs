// src/state.rs

use crate::{
    config::Config,
    errors::AppResult,
    services::{
        approval::ApprovalService,
        email::{Mailer, mailer_from_config},
        payment_provider::{HttpPaymentGateway, PaymentGateway},
        subscription::{SubscriptionService, gated::register_order_gates},
    },
    store::{
        ApprovalStore, InMemoryApprovalStore, InMemorySubscriptionStore, PgApprovalStore,
        PgSubscriptionStore, SubscriptionStore,
    },
};
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Absent when running on in-memory stores
    pub db: Option<PgPool>,
    pub config: Arc<Config>,
    pub subscriptions: Arc<SubscriptionService>,
    pub approvals: Arc<ApprovalService>,
}

impl AppState {
    /// Production wiring: Postgres stores when a pool is given, the HTTP
    /// payment gateway and the configured mailer.
    pub async fn new(db: Option<PgPool>, config: Config) -> AppResult<Self> {
        let (subscription_store, approval_store): (
            Arc<dyn SubscriptionStore>,
            Arc<dyn ApprovalStore>,
        ) = match &db {
            Some(pool) => (
                Arc::new(PgSubscriptionStore::new(pool.clone())),
                Arc::new(PgApprovalStore::new(pool.clone())),
            ),
            None => (
                Arc::new(InMemorySubscriptionStore::new()),
                Arc::new(InMemoryApprovalStore::new()),
            ),
        };
        let gateway = Arc::new(HttpPaymentGateway::new(&config)?);
        let mailer = mailer_from_config(&config);

        let mut state =
            Self::assemble(config, subscription_store, approval_store, gateway, mailer).await?;
        state.db = db;
        Ok(state)
    }

    /// Wires the services over the given adapters and registers the gated
    /// order methods.
    pub async fn assemble(
        config: Config,
        subscription_store: Arc<dyn SubscriptionStore>,
        approval_store: Arc<dyn ApprovalStore>,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
    ) -> AppResult<Self> {
        let approvals = Arc::new(ApprovalService::new(
            approval_store,
            config.approval_settings(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            subscription_store,
            gateway,
            mailer,
            approvals.clone(),
            config.billing_settings(),
        ));
        register_order_gates(&approvals, &subscriptions).await?;

        Ok(Self {
            db: None,
            config: Arc::new(config),
            subscriptions,
            approvals,
        })
    }

    /// Local date for an optional IANA timezone, defaulting to the configured one.
    pub fn today(&self, tz: Option<&str>) -> AppResult<chrono::NaiveDate> {
        let tz = crate::clock::resolve_tz(tz, self.config.default_timezone)?;
        Ok(crate::clock::today(tz))
    }
}
