// src/openapi.rs

use crate::models::{
    approval::{
        ApprovalActivity, ApprovalEntry, ApprovalRule, Approver, CreateRuleRequest,
        DeleteApprovalRequest, EnsureTriggerRequest, ExecuteRequest, ExecuteResponse,
        GetSpecRequest, InvalidationTrigger, RecordEvent, RecordEventOutcome, RecordSpec,
        RuleSpec, SetApprovalRequest, SpecQuery,
    },
    loan::{
        CompoundingMethod, LoanParams, LoanScheduleRequest, LoanScheduleResponse, LoanSummary,
        LoanType, Payment, SpecialPayment,
    },
    subscription::{
        AssignTokenRequest, BillingRunReport, CloseSubscriptionRequest, CreateOrderRequest,
        CreatePlanRequest, CreatePricingRequest, CreateProductRequest, CreateProviderRequest,
        CreateTransactionRequest, Currency, Invoice, InvoiceLine, InvoicePaymentState,
        InvoicePolicy, InvoiceState, NewOrderLine, NotificationStatus, Order, OrderAmounts,
        OrderLine, OrderStatus, PaymentProvider, PaymentToken, PeriodUnit, Plan, Product,
        ProviderNotification, SubscriptionAction, SubscriptionPage, SubscriptionPricing,
        SubscriptionState, Transaction, TransactionOperation, TransactionResponse,
        TransactionState, UpsellRequest,
    },
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            )
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Back Office API",
        version = "0.1.0",
        description = "Loan amortization schedules, recurring subscription billing with a \
            customer portal and payment provider integration, and multi-level approval \
            rules gating business methods.",
        license(name = "MIT")
    ),
    paths(
        // Loans
        crate::handlers::loans::loan_schedule,
        // Catalogue
        crate::handlers::subscriptions::set_currency,
        crate::handlers::subscriptions::create_plan,
        crate::handlers::subscriptions::create_product,
        crate::handlers::subscriptions::create_pricing,
        crate::handlers::subscriptions::create_provider,
        // Subscriptions
        crate::handlers::subscriptions::create_order,
        crate::handlers::subscriptions::get_order,
        crate::handlers::subscriptions::confirm_order,
        crate::handlers::subscriptions::close_order,
        crate::handlers::subscriptions::cancel_order,
        crate::handlers::subscriptions::pause_order,
        crate::handlers::subscriptions::resume_order,
        crate::handlers::subscriptions::reopen_order,
        // Invoices
        crate::handlers::subscriptions::create_invoice,
        crate::handlers::subscriptions::list_invoices,
        crate::handlers::subscriptions::post_invoice,
        crate::handlers::subscriptions::run_billing,
        // Portal
        crate::handlers::portal::list_subscriptions,
        crate::handlers::portal::view_subscription,
        crate::handlers::portal::close_subscription,
        crate::handlers::portal::renew_subscription,
        crate::handlers::portal::upsell_subscription,
        crate::handlers::portal::create_transaction,
        crate::handlers::portal::assign_token,
        // Payments
        crate::handlers::payments::payment_webhook,
        // Approvals
        crate::handlers::approvals::get_spec,
        crate::handlers::approvals::set_approval,
        crate::handlers::approvals::delete_approval,
        crate::handlers::approvals::execute,
        crate::handlers::approvals::list_activities,
        crate::handlers::approvals::record_event,
        // Approval rules
        crate::handlers::approvals::create_rule,
        crate::handlers::approvals::list_rules,
        crate::handlers::approvals::archive_rule,
        crate::handlers::approvals::ensure_trigger,
    ),
    components(
        schemas(
            LoanParams, SpecialPayment, LoanScheduleRequest, LoanScheduleResponse,
            Payment, LoanSummary, CompoundingMethod, LoanType,
            Currency, Plan, PeriodUnit, Product, InvoicePolicy, SubscriptionPricing,
            CreatePlanRequest, CreateProductRequest, CreatePricingRequest, CreateProviderRequest,
            Order, OrderLine, OrderAmounts, OrderStatus, SubscriptionState,
            CreateOrderRequest, NewOrderLine, CloseSubscriptionRequest, UpsellRequest,
            SubscriptionPage, BillingRunReport,
            Invoice, InvoiceLine, InvoiceState, InvoicePaymentState,
            PaymentProvider, PaymentToken, Transaction, TransactionOperation, TransactionState,
            SubscriptionAction, CreateTransactionRequest, TransactionResponse,
            AssignTokenRequest, ProviderNotification, NotificationStatus,
            ApprovalRule, ApprovalEntry, ApprovalActivity, InvalidationTrigger, Approver,
            SpecQuery, GetSpecRequest, RecordSpec, RuleSpec,
            SetApprovalRequest, DeleteApprovalRequest, ExecuteRequest, ExecuteResponse,
            CreateRuleRequest, EnsureTriggerRequest, RecordEvent, RecordEventOutcome,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Loans", description = "Amortization schedules"),
        (name = "Catalogue", description = "Currencies, plans, products, pricings and payment providers"),
        (name = "Subscriptions", description = "Quotations and subscription lifecycle"),
        (name = "Invoices", description = "Invoicing and recurring billing"),
        (name = "Portal", description = "Customer self-service pages"),
        (name = "Payments", description = "Payment provider callbacks"),
        (name = "Approvals", description = "Decisions and gated execution"),
        (name = "Approval Rules", description = "Rule and trigger administration"),
    )
)]
pub struct ApiDoc;
