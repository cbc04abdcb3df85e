// src/services/subscription/gated.rs

//! Subscription order methods exposed to the approval gate.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::{ORDER_MODEL, SubscriptionService, snapshot};
use crate::{
    errors::{AppError, AppResult},
    models::approval::EnsureTriggerRequest,
    services::approval::{ApprovalService, ExecutionContext, MethodHandler, RecordSource},
};

pub const CONFIRM_METHOD: &str = "action_confirm";
pub const CLOSE_METHOD: &str = "action_close";

// weak: the subscription service already holds the approval service as its hook
fn upgrade(service: &Weak<SubscriptionService>) -> AppResult<Arc<SubscriptionService>> {
    service
        .upgrade()
        .ok_or_else(|| AppError::Internal("subscription service stopped".to_string()))
}

struct OrderRecords(Weak<SubscriptionService>);

#[async_trait]
impl RecordSource for OrderRecords {
    async fn fetch(&self, res_id: Uuid) -> AppResult<Option<Value>> {
        let service = upgrade(&self.0)?;
        match service.store().get_order(res_id).await? {
            Some(order) => Ok(Some(snapshot(&service.with_amounts(order).await?)?)),
            None => Ok(None),
        }
    }
}

struct ConfirmOrder(Weak<SubscriptionService>);

#[async_trait]
impl MethodHandler for ConfirmOrder {
    async fn call(&self, res_id: Uuid, ctx: ExecutionContext) -> AppResult<Value> {
        let order = upgrade(&self.0)?.confirm_order(res_id, ctx.today).await?;
        serde_json::to_value(order).map_err(|e| AppError::Internal(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct CloseArgs {
    close_reason: String,
    #[serde(default)]
    note: Option<String>,
}

struct CloseOrder(Weak<SubscriptionService>);

#[async_trait]
impl MethodHandler for CloseOrder {
    async fn call(&self, res_id: Uuid, ctx: ExecutionContext) -> AppResult<Value> {
        let args: CloseArgs = serde_json::from_value(ctx.args)
            .map_err(|e| AppError::Validation(format!("invalid close arguments: {}", e)))?;
        let order = upgrade(&self.0)?
            .close(res_id, &args.close_reason, args.note, ctx.today)
            .await?;
        serde_json::to_value(order).map_err(|e| AppError::Internal(e.to_string()))
    }
}

/// Puts order confirmation and closing behind the approval gate.
pub async fn register_order_gates(
    approvals: &ApprovalService,
    subscriptions: &Arc<SubscriptionService>,
) -> AppResult<()> {
    let weak = Arc::downgrade(subscriptions);
    approvals
        .records()
        .register(ORDER_MODEL, Arc::new(OrderRecords(weak.clone())))
        .await;
    approvals
        .registry()
        .register(ORDER_MODEL, CONFIRM_METHOD, Arc::new(ConfirmOrder(weak.clone())))
        .await;
    approvals
        .registry()
        .register(ORDER_MODEL, CLOSE_METHOD, Arc::new(CloseOrder(weak)))
        .await;

    approvals
        .ensure_invalidation_trigger(EnsureTriggerRequest {
            model: ORDER_MODEL.to_string(),
            method: CONFIRM_METHOD.to_string(),
            watched_field: "state".to_string(),
            pre_domain: json!([["state", "=", "confirmed"]]),
            post_domain: json!([["state", "!=", "confirmed"]]),
        })
        .await?;
    approvals
        .ensure_invalidation_trigger(EnsureTriggerRequest {
            model: ORDER_MODEL.to_string(),
            method: CLOSE_METHOD.to_string(),
            watched_field: "subscription_state".to_string(),
            pre_domain: json!([["subscription_state", "=", "churned"]]),
            post_domain: json!([["subscription_state", "=", "in_progress"]]),
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApprovalSettings, BillingSettings};
    use crate::models::approval::{
        Approver, CreateRuleRequest, ExecuteRequest, SetApprovalRequest, SpecQuery,
    };
    use crate::models::subscription::{
        CreateOrderRequest, InvoicePolicy, NewOrderLine, OrderStatus, PaymentProvider,
        PaymentToken, PeriodUnit, Plan, Product, SubscriptionState, Transaction,
    };
    use crate::services::email::LogMailer;
    use crate::services::payment_provider::{ChargeStatus, Checkout, GatewayError, PaymentGateway};
    use crate::store::{InMemoryApprovalStore, InMemorySubscriptionStore, SubscriptionStore};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    struct NoGateway;

    #[async_trait]
    impl PaymentGateway for NoGateway {
        async fn create_checkout(
            &self,
            _provider: &PaymentProvider,
            _tx: &Transaction,
            _return_url: &str,
        ) -> Result<Checkout, GatewayError> {
            Err(GatewayError::Rejected("offline".to_string()))
        }

        async fn charge_token(
            &self,
            _provider: &PaymentProvider,
            _token: &PaymentToken,
            _tx: &Transaction,
        ) -> Result<ChargeStatus, GatewayError> {
            Err(GatewayError::Rejected("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn confirmation_waits_for_approval_and_cancelling_voids_it() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let approvals = Arc::new(ApprovalService::new(
            Arc::new(InMemoryApprovalStore::new()),
            ApprovalSettings::default(),
        ));
        let store = Arc::new(InMemorySubscriptionStore::new());
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            Arc::new(NoGateway),
            Arc::new(LogMailer),
            approvals.clone(),
            BillingSettings::default(),
        ));
        register_order_gates(&approvals, &subscriptions).await.unwrap();

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
            name: "Support".to_string(),
            list_price: dec!(2000),
            uom: "Units".to_string(),
            recurring: true,
            invoice_policy: InvoicePolicy::Prepaid,
        };
        store.insert_product(&product).await.unwrap();

        let manager = Approver {
            user_id: Uuid::new_v4(),
            name: "manager".to_string(),
            groups: Vec::new(),
        };
        let rule = approvals
            .create_rule(CreateRuleRequest {
                name: "Large subscriptions".to_string(),
                model: ORDER_MODEL.to_string(),
                method: CONFIRM_METHOD.to_string(),
                action_id: None,
                domain: Some(json!([["amounts.amount_total", ">=", 1000]])),
                approval_group: None,
                approver_ids: vec![manager.user_id],
                notifier_ids: Vec::new(),
                notification_order: 1,
                exclusive_user: false,
                can_validate_without_approver: false,
            })
            .await
            .unwrap();

        let order = subscriptions
            .create_order(CreateOrderRequest {
                partner_id: Uuid::new_v4(),
                partner_email: None,
                currency: "USD".to_string(),
                plan_id: Some(plan.id),
                pricelist_id: None,
                start_date: Some(today),
                end_date: None,
                lines: vec![NewOrderLine {
                    product_id: product.id,
                    qty: dec!(1),
                    discount: None,
                    price_unit: None,
                }],
            })
            .await
            .unwrap();

        let confirm = || ExecuteRequest {
            model: ORDER_MODEL.to_string(),
            method: CONFIRM_METHOD.to_string(),
            action_id: None,
            res_id: order.id,
            args: Value::Null,
        };
        let blocked = approvals.try_execute(&manager, confirm(), today).await;
        assert!(matches!(blocked, Err(AppError::ApprovalRequired(_))));

        approvals
            .set_approval(
                &manager,
                SetApprovalRequest {
                    rule_id: rule.id,
                    res_id: order.id,
                    approved: true,
                },
                today,
            )
            .await
            .unwrap();
        let done = approvals.try_execute(&manager, confirm(), today).await.unwrap();
        assert_eq!(done.result["subscription_state"], "in_progress");

        // cancelling reverts the confirmation, so the approval goes away
        let cancelled = subscriptions.cancel_order(order.id, today).await.unwrap();
        assert_eq!(cancelled.state, OrderStatus::Cancelled);
        assert_eq!(cancelled.subscription_state, SubscriptionState::Churned);
        let query = SpecQuery {
            model: ORDER_MODEL.to_string(),
            method: CONFIRM_METHOD.to_string(),
            action_id: None,
            res_id: order.id,
        };
        let spec = approvals.get_spec(&manager, &[query]).await.unwrap();
        assert!(spec[0].rules[0].entries.is_empty());
        assert!(!spec[0].approved);
    }
}
