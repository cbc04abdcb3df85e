// src/handlers/subscriptions.rs

use crate::{
    auth::AuthUser,
    errors::AppResult,
    models::{
        approval::{ExecuteRequest, ExecuteResponse},
        subscription::{
            BillingRunReport, CloseSubscriptionRequest, CreateOrderRequest, CreatePlanRequest,
            CreatePricingRequest, CreateProductRequest, CreateProviderRequest, Currency, Invoice,
            Order, PaymentProvider, Plan, PortalAccessQuery, Product, SubscriptionPricing,
        },
    },
    services::subscription::{
        ORDER_MODEL,
        gated::{CLOSE_METHOD, CONFIRM_METHOD},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

// ─── Catalogue ────────────────────────────────────────────────────────────────

/// Create or update a currency and its rounding
#[utoipa::path(
    put,
    path = "/api/v1/catalogue/currencies",
    request_body = Currency,
    responses(
        (status = 200, description = "Currency stored", body = Currency),
        (status = 400, description = "Invalid currency"),
    ),
    security(("bearer_auth" = [])),
    tag = "Catalogue"
)]
pub async fn set_currency(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<Currency>,
) -> AppResult<Json<Currency>> {
    Ok(Json(state.subscriptions.set_currency(body).await?))
}

/// Create a billing plan
#[utoipa::path(
    post,
    path = "/api/v1/catalogue/plans",
    request_body = CreatePlanRequest,
    responses(
        (status = 201, description = "Plan created", body = Plan),
        (status = 400, description = "Invalid plan"),
    ),
    security(("bearer_auth" = [])),
    tag = "Catalogue"
)]
pub async fn create_plan(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreatePlanRequest>,
) -> AppResult<(StatusCode, Json<Plan>)> {
    let plan = state.subscriptions.create_plan(body).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// Create a product
#[utoipa::path(
    post,
    path = "/api/v1/catalogue/products",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = Product),
        (status = 400, description = "Invalid product"),
    ),
    security(("bearer_auth" = [])),
    tag = "Catalogue"
)]
pub async fn create_product(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateProductRequest>,
) -> AppResult<(StatusCode, Json<Product>)> {
    let product = state.subscriptions.create_product(body).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// Price a recurring product for a plan
#[utoipa::path(
    post,
    path = "/api/v1/catalogue/pricings",
    request_body = CreatePricingRequest,
    responses(
        (status = 201, description = "Pricing created", body = SubscriptionPricing),
        (status = 400, description = "Unknown product or plan"),
    ),
    security(("bearer_auth" = [])),
    tag = "Catalogue"
)]
pub async fn create_pricing(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreatePricingRequest>,
) -> AppResult<(StatusCode, Json<SubscriptionPricing>)> {
    let pricing = state.subscriptions.create_pricing(body).await?;
    Ok((StatusCode::CREATED, Json(pricing)))
}

/// Register a payment provider
#[utoipa::path(
    post,
    path = "/api/v1/catalogue/providers",
    request_body = CreateProviderRequest,
    responses(
        (status = 201, description = "Provider registered", body = PaymentProvider),
        (status = 409, description = "Provider code already used"),
    ),
    security(("bearer_auth" = [])),
    tag = "Catalogue"
)]
pub async fn create_provider(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateProviderRequest>,
) -> AppResult<(StatusCode, Json<PaymentProvider>)> {
    let provider = state.subscriptions.create_provider(body).await?;
    Ok((StatusCode::CREATED, Json(provider)))
}

// ─── Orders ───────────────────────────────────────────────────────────────────

/// Create a subscription quotation
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Quotation created", body = Order),
        (status = 400, description = "Invalid order"),
    ),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn create_order(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<Order>)> {
    let order = state.subscriptions.create_order(body).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Get a subscription with its current amounts
#[utoipa::path(
    get,
    path = "/api/v1/subscriptions/{order_id}",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses(
        (status = 200, description = "Subscription detail", body = Order),
        (status = 404, description = "Subscription not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn get_order(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    let order = state.subscriptions.get_order(order_id).await?;
    Ok(Json(state.subscriptions.with_amounts(order).await?))
}

fn gated(method: &str, res_id: Uuid, args: Value) -> ExecuteRequest {
    ExecuteRequest {
        model: ORDER_MODEL.to_string(),
        method: method.to_string(),
        action_id: None,
        res_id,
        args,
    }
}

/// Confirm a quotation, once its approval rules are satisfied
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/confirm",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    responses(
        (status = 200, description = "Subscription confirmed", body = ExecuteResponse),
        (status = 422, description = "Approval required"),
    ),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn confirm_order(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
) -> AppResult<Json<ExecuteResponse>> {
    let today = state.today(query.tz.as_deref())?;
    let result = state
        .approvals
        .try_execute(&auth.user, gated(CONFIRM_METHOD, order_id, Value::Null), today)
        .await?;
    Ok(Json(result))
}

/// Close a running subscription, once its approval rules are satisfied
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/close",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    request_body = CloseSubscriptionRequest,
    responses(
        (status = 200, description = "Subscription closed", body = ExecuteResponse),
        (status = 422, description = "Approval required"),
    ),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn close_order(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(body): Json<CloseSubscriptionRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let today = state.today(None)?;
    let args = json!({ "close_reason": body.close_reason, "note": body.note });
    let result = state
        .approvals
        .try_execute(&auth.user, gated(CLOSE_METHOD, order_id, args), today)
        .await?;
    Ok(Json(result))
}

/// Cancel a quotation or end a running subscription today
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/cancel",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses((status = 200, description = "Subscription cancelled", body = Order)),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn cancel_order(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    let today = state.today(None)?;
    Ok(Json(state.subscriptions.cancel_order(order_id, today).await?))
}

/// Pause a running subscription
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/pause",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses((status = 200, description = "Subscription paused", body = Order)),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn pause_order(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    Ok(Json(state.subscriptions.pause(order_id).await?))
}

/// Resume a paused subscription
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/resume",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses((status = 200, description = "Subscription resumed", body = Order)),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn resume_order(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    Ok(Json(state.subscriptions.resume(order_id).await?))
}

/// Reopen a churned subscription
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/reopen",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses((status = 200, description = "Subscription reopened", body = Order)),
    security(("bearer_auth" = [])),
    tag = "Subscriptions"
)]
pub async fn reopen_order(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    Ok(Json(state.subscriptions.reopen(order_id).await?))
}

// ─── Invoices ─────────────────────────────────────────────────────────────────

/// Invoice what is due on a subscription
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/{order_id}/invoices",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses(
        (status = 201, description = "Draft invoice created", body = Invoice),
        (status = 400, description = "Nothing to invoice"),
    ),
    security(("bearer_auth" = [])),
    tag = "Invoices"
)]
pub async fn create_invoice(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<Invoice>)> {
    let today = state.today(None)?;
    let invoice = state.subscriptions.create_invoice(order_id, today).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

/// List the invoices of a subscription
#[utoipa::path(
    get,
    path = "/api/v1/subscriptions/{order_id}/invoices",
    params(("order_id" = Uuid, Path, description = "Subscription ID")),
    responses((status = 200, description = "Invoices, oldest first", body = Vec<Invoice>)),
    security(("bearer_auth" = [])),
    tag = "Invoices"
)]
pub async fn list_invoices(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Vec<Invoice>>> {
    Ok(Json(state.subscriptions.order_invoices(order_id).await?))
}

/// Post a draft invoice and advance the next invoice date
#[utoipa::path(
    post,
    path = "/api/v1/invoices/{invoice_id}/post",
    params(("invoice_id" = Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Invoice posted", body = Invoice),
        (status = 409, description = "Period already invoiced"),
    ),
    security(("bearer_auth" = [])),
    tag = "Invoices"
)]
pub async fn post_invoice(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> AppResult<Json<Invoice>> {
    let today = state.today(None)?;
    Ok(Json(state.subscriptions.post_invoice(invoice_id, today).await?))
}

/// Run recurring billing for every due subscription
#[utoipa::path(
    post,
    path = "/api/v1/subscriptions/billing/run",
    responses((status = 200, description = "Billing run report", body = BillingRunReport)),
    security(("bearer_auth" = [])),
    tag = "Invoices"
)]
pub async fn run_billing(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<BillingRunReport>> {
    let today = state.today(None)?;
    info!("Billing run for {} requested by {}", today, auth.user.name);
    Ok(Json(state.subscriptions.run_recurring_billing(today).await?))
}
