// src/models/subscription.rs

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

// ─── Catalogue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq, Hash)]
#[sqlx(type_name = "period_unit", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq, Default)]
#[sqlx(type_name = "invoice_policy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoicePolicy {
    #[default]
    Prepaid,
    Postpaid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Currency {
    pub code: String,
    pub decimal_places: i32,
}

impl Currency {
    pub fn round(&self, amount: Decimal) -> Decimal {
        amount.round_dp(self.decimal_places.max(0) as u32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub billing_period_value: i32,
    pub billing_period_unit: PeriodUnit,
    /// Align invoices on the first day of the month (or year)
    pub billing_first_day: bool,
    pub user_closable: bool,
    pub auto_close_limit_days: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub list_price: Decimal,
    pub uom: String,
    pub recurring: bool,
    pub invoice_policy: InvoicePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SubscriptionPricing {
    pub id: Uuid,
    pub product_id: Uuid,
    pub plan_id: Uuid,
    pub pricelist_id: Option<Uuid>,
    pub price: Decimal,
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq, Hash)]
#[sqlx(type_name = "subscription_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Draft,
    InProgress,
    Paused,
    Churned,
    Renewal,
    Upsell,
    Closed,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Draft => "draft",
            SubscriptionState::InProgress => "in_progress",
            SubscriptionState::Paused => "paused",
            SubscriptionState::Churned => "churned",
            SubscriptionState::Renewal => "renewal",
            SubscriptionState::Upsell => "upsell",
            SubscriptionState::Closed => "closed",
        }
    }

    /// Subscriptions that no longer accept payments or changes.
    pub fn is_ended(&self) -> bool {
        matches!(self, SubscriptionState::Churned | SubscriptionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Quotation,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderLine {
    pub id: Uuid,
    pub product_id: Option<Uuid>,
    pub name: String,
    pub qty: Decimal,
    pub uom: String,
    pub price_unit: Decimal,
    /// Percentage, e.g. 10 means 10% off
    pub discount: Decimal,
    pub is_recurring: bool,
    pub invoice_policy: InvoicePolicy,
    pub parent_line_id: Option<Uuid>,
    pub last_invoiced_date: Option<NaiveDate>,
    pub qty_invoiced: Decimal,
    pub qty_to_invoice: Decimal,
    /// Free-text line carrying no amount
    pub is_note: bool,
}

impl OrderLine {
    pub fn note(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: None,
            name: text.into(),
            qty: Decimal::ZERO,
            uom: String::new(),
            price_unit: Decimal::ZERO,
            discount: Decimal::ZERO,
            is_recurring: false,
            invoice_policy: InvoicePolicy::Prepaid,
            parent_line_id: None,
            last_invoiced_date: None,
            qty_invoiced: Decimal::ZERO,
            qty_to_invoice: Decimal::ZERO,
            is_note: true,
        }
    }
}

/// Amounts refreshed by the explicit recompute phase of the billing service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderAmounts {
    pub amount_total: Decimal,
    pub recurring_total: Decimal,
    pub recurring_monthly: Decimal,
    pub amount_to_invoice: Decimal,
    /// Recurring part of `amount_to_invoice`
    pub recurring_to_invoice: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub name: String,
    pub partner_id: Uuid,
    pub partner_email: Option<String>,
    pub currency: String,
    pub plan_id: Option<Uuid>,
    pub pricelist_id: Option<Uuid>,
    pub state: OrderStatus,
    pub subscription_state: SubscriptionState,
    pub is_subscription: bool,
    pub start_date: Option<NaiveDate>,
    pub first_contract_date: Option<NaiveDate>,
    pub next_invoice_date: Option<NaiveDate>,
    pub last_invoice_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub payment_token_id: Option<Uuid>,
    pub pending_transaction: bool,
    pub parent_subscription_id: Option<Uuid>,
    pub close_reason: Option<String>,
    pub close_note: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub lines: Vec<OrderLine>,
    pub amounts: OrderAmounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn line(&self, line_id: Uuid) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    pub fn portal_url(&self) -> String {
        format!("/my/subscriptions/{}?access_token={}", self.id, self.access_token)
    }
}

// ─── Invoices ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "invoice_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Draft,
    Posted,
    Cancel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "invoice_payment_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoicePaymentState {
    NotPaid,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InvoiceLine {
    pub id: Uuid,
    pub sale_line_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub name: String,
    pub quantity: Decimal,
    pub price_unit: Decimal,
    pub discount: Decimal,
    pub subtotal: Decimal,
    pub deferred_start_date: Option<NaiveDate>,
    pub deferred_end_date: Option<NaiveDate>,
    pub subscription_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Invoice {
    pub id: Uuid,
    pub name: String,
    pub subscription_id: Uuid,
    pub partner_id: Uuid,
    pub currency: String,
    pub state: InvoiceState,
    pub payment_state: InvoicePaymentState,
    pub invoice_date: Option<NaiveDate>,
    pub lines: Vec<InvoiceLine>,
    pub amount_total: Decimal,
    pub created_at: DateTime<Utc>,
}

// ─── Payments ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct PaymentProvider {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    /// Zero means unlimited
    pub max_amount: Decimal,
    pub validation_amount: Decimal,
    pub validation_currency: String,
    pub supports_tokenization: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct PaymentToken {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub partner_id: Uuid,
    #[serde(skip_serializing)]
    pub provider_ref: String,
    pub display_name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "transaction_operation", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionOperation {
    OnlineRedirect,
    OnlineToken,
    Validation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "transaction_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Draft,
    Pending,
    Authorized,
    Done,
    Cancel,
    Error,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Done | TransactionState::Cancel | TransactionState::Error
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "subscription_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    AssignToken,
    AutomaticSendMail,
    ManualSendMail,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Transaction {
    pub id: Uuid,
    pub reference: String,
    pub provider_id: Uuid,
    pub partner_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub operation: TransactionOperation,
    pub state: TransactionState,
    pub state_message: Option<String>,
    pub token_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub subscription_action: Option<SubscriptionAction>,
    pub tokenize: bool,
    pub is_post_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Period bounds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct InvoicePeriod {
    pub start: NaiveDate,
    /// Inclusive
    pub end: NaiveDate,
    pub ratio: Decimal,
    pub days: i64,
}

// ─── Requests / responses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewOrderLine {
    pub product_id: Uuid,
    pub qty: Decimal,
    #[serde(default)]
    pub discount: Option<Decimal>,
    #[serde(default)]
    pub price_unit: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub partner_id: Uuid,
    #[serde(default)]
    pub partner_email: Option<String>,
    pub currency: String,
    pub plan_id: Option<Uuid>,
    #[serde(default)]
    pub pricelist_id: Option<Uuid>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePlanRequest {
    pub name: String,
    pub billing_period_value: i32,
    pub billing_period_unit: PeriodUnit,
    #[serde(default)]
    pub billing_first_day: bool,
    #[serde(default = "default_true")]
    pub user_closable: bool,
    #[serde(default = "default_auto_close_days")]
    pub auto_close_limit_days: i32,
}

fn default_true() -> bool {
    true
}

fn default_auto_close_days() -> i32 {
    15
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProductRequest {
    pub name: String,
    pub list_price: Decimal,
    pub uom: String,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub invoice_policy: InvoicePolicy,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePricingRequest {
    pub product_id: Uuid,
    pub plan_id: Uuid,
    #[serde(default)]
    pub pricelist_id: Option<Uuid>,
    pub price: Decimal,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProviderRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub max_amount: Decimal,
    #[serde(default)]
    pub validation_amount: Decimal,
    pub validation_currency: String,
    #[serde(default)]
    pub supports_tokenization: bool,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListSubscriptionsQuery {
    pub page: Option<u32>,
    pub state: Option<SubscriptionState>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionPage {
    pub items: Vec<Order>,
    pub page: u32,
    pub page_count: u32,
    pub total: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PortalAccessQuery {
    pub access_token: Option<String>,
    /// IANA timezone used to resolve "today"
    pub tz: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CloseSubscriptionRequest {
    pub close_reason: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpsellRequest {
    #[serde(default)]
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTransactionRequest {
    pub provider_id: Uuid,
    pub operation: TransactionOperation,
    #[serde(default)]
    pub token_id: Option<Uuid>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub invoice_id: Option<Uuid>,
    #[serde(default)]
    pub tokenize: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionResponse {
    pub transaction: Transaction,
    pub checkout_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignTokenRequest {
    pub token_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Authorized,
    Done,
    Cancel,
    Error,
}

/// Asynchronous status update pushed by the payment provider.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ProviderNotification {
    pub reference: String,
    pub status: NotificationStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub token_ref: Option<String>,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct BillingRunReport {
    pub invoiced: u32,
    pub charged: u32,
    pub failed: u32,
    pub churned: u32,
}
