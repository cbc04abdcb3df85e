// src/services/subscription/catalogue.rs

use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use super::SubscriptionService;
use crate::{
    errors::{AppError, AppResult},
    models::subscription::{
        CreatePlanRequest, CreatePricingRequest, CreateProductRequest, CreateProviderRequest,
        Currency, PaymentProvider, Plan, Product, SubscriptionPricing,
    },
};

fn required(value: &str, field: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

impl SubscriptionService {
    pub async fn set_currency(&self, currency: Currency) -> AppResult<Currency> {
        if !(0..=6).contains(&currency.decimal_places) {
            return Err(AppError::Validation(
                "decimal_places must be between 0 and 6".to_string(),
            ));
        }
        let currency = Currency {
            code: required(&currency.code, "code")?.to_uppercase(),
            decimal_places: currency.decimal_places,
        };
        self.store.upsert_currency(&currency).await?;
        Ok(currency)
    }

    pub async fn create_plan(&self, req: CreatePlanRequest) -> AppResult<Plan> {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: required(&req.name, "name")?,
            billing_period_value: req.billing_period_value,
            billing_period_unit: req.billing_period_unit,
            billing_first_day: req.billing_first_day,
            user_closable: req.user_closable,
            auto_close_limit_days: req.auto_close_limit_days.max(0),
        };
        plan.validate()?;
        self.store.insert_plan(&plan).await?;
        info!("Plan '{}' created", plan.name);
        Ok(plan)
    }

    pub async fn create_product(&self, req: CreateProductRequest) -> AppResult<Product> {
        if req.list_price.is_sign_negative() {
            return Err(AppError::Validation("list_price must not be negative".to_string()));
        }
        let product = Product {
            id: Uuid::new_v4(),
            name: required(&req.name, "name")?,
            list_price: req.list_price,
            uom: required(&req.uom, "uom")?,
            recurring: req.recurring,
            invoice_policy: req.invoice_policy,
        };
        self.store.insert_product(&product).await?;
        info!("Product '{}' created", product.name);
        Ok(product)
    }

    pub async fn create_pricing(&self, req: CreatePricingRequest) -> AppResult<SubscriptionPricing> {
        if req.price.is_sign_negative() {
            return Err(AppError::Validation("price must not be negative".to_string()));
        }
        let product = self.store.get_product(req.product_id).await?.ok_or_else(|| {
            AppError::Validation(format!("unknown product {}", req.product_id))
        })?;
        if !product.recurring {
            return Err(AppError::Validation(format!(
                "product '{}' is not recurring",
                product.name
            )));
        }
        self.store
            .get_plan(req.plan_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("invalid plan {}", req.plan_id)))?;

        let pricing = SubscriptionPricing {
            id: Uuid::new_v4(),
            product_id: req.product_id,
            plan_id: req.plan_id,
            pricelist_id: req.pricelist_id,
            price: req.price,
        };
        self.store.insert_pricing(&pricing).await?;
        Ok(pricing)
    }

    pub async fn create_provider(&self, req: CreateProviderRequest) -> AppResult<PaymentProvider> {
        if req.max_amount < Decimal::ZERO || req.validation_amount < Decimal::ZERO {
            return Err(AppError::Validation("amounts must not be negative".to_string()));
        }
        let provider = PaymentProvider {
            id: Uuid::new_v4(),
            name: required(&req.name, "name")?,
            code: required(&req.code, "code")?,
            max_amount: req.max_amount,
            validation_amount: req.validation_amount,
            validation_currency: required(&req.validation_currency, "validation_currency")?,
            supports_tokenization: req.supports_tokenization,
        };
        self.store.insert_provider(&provider).await?;
        info!("Payment provider '{}' registered", provider.code);
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use crate::models::subscription::PeriodUnit;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn pricings_require_a_recurring_product() {
        let fx = fixture().await;
        let subscriptions = &fx.service;
        let plan = subscriptions
            .create_plan(CreatePlanRequest {
                name: "Yearly".to_string(),
                billing_period_value: 1,
                billing_period_unit: PeriodUnit::Year,
                billing_first_day: false,
                user_closable: true,
                auto_close_limit_days: 15,
            })
            .await
            .unwrap();
        let one_off = subscriptions
            .create_product(CreateProductRequest {
                name: "Setup".to_string(),
                list_price: dec!(50),
                uom: "Units".to_string(),
                recurring: false,
                invoice_policy: Default::default(),
            })
            .await
            .unwrap();

        let refused = subscriptions
            .create_pricing(CreatePricingRequest {
                product_id: one_off.id,
                plan_id: plan.id,
                pricelist_id: None,
                price: dec!(40),
            })
            .await;
        assert!(matches!(refused, Err(AppError::Validation(_))));

        let bad_plan = subscriptions
            .create_plan(CreatePlanRequest {
                name: "Never".to_string(),
                billing_period_value: 0,
                billing_period_unit: PeriodUnit::Month,
                billing_first_day: false,
                user_closable: true,
                auto_close_limit_days: 15,
            })
            .await;
        assert!(matches!(bad_plan, Err(AppError::Validation(_))));
    }
}
