// src/handlers/portal.rs
//
// Customer portal. Pages accept either the owner's session token or the
// order's `access_token` query parameter.

use crate::{
    auth::AuthUser,
    errors::{AppError, AppResult},
    models::subscription::{
        AssignTokenRequest, CloseSubscriptionRequest, CreateTransactionRequest,
        ListSubscriptionsQuery, Order, PortalAccessQuery, SubscriptionPage, TransactionResponse,
        UpsellRequest,
    },
    services::subscription::PortalAccess,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
};
use uuid::Uuid;

async fn open(
    state: &AppState,
    order_id: Uuid,
    auth: Option<&AuthUser>,
    query: &PortalAccessQuery,
) -> AppResult<PortalAccess> {
    state
        .subscriptions
        .resolve_access(
            order_id,
            auth.map(|a| a.partner_id),
            query.access_token.as_deref(),
        )
        .await
}

/// Like `open`, for actions: anonymous callers are refused instead of redirected.
async fn open_for_action(
    state: &AppState,
    order_id: Uuid,
    auth: Option<&AuthUser>,
    query: &PortalAccessQuery,
) -> AppResult<Order> {
    match open(state, order_id, auth, query).await? {
        PortalAccess::Granted(order) => Ok(order),
        PortalAccess::Redirect(_) => Err(AppError::Unauthorized("Login required".to_string())),
    }
}

/// List the caller's subscriptions
#[utoipa::path(
    get,
    path = "/my/subscriptions",
    params(ListSubscriptionsQuery),
    responses(
        (status = 200, description = "One page of subscriptions", body = SubscriptionPage),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "Portal"
)]
pub async fn list_subscriptions(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<ListSubscriptionsQuery>,
) -> AppResult<Json<SubscriptionPage>> {
    let page = state
        .subscriptions
        .list_subscriptions(auth.partner_id, &query)
        .await?;
    Ok(Json(page))
}

/// View one subscription
#[utoipa::path(
    get,
    path = "/my/subscriptions/{order_id}",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    responses(
        (status = 200, description = "Subscription detail", body = Order),
        (status = 303, description = "Login required"),
        (status = 404, description = "Unknown subscription or wrong access token"),
    ),
    tag = "Portal"
)]
pub async fn view_subscription(
    auth: Option<AuthUser>,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
) -> AppResult<Response> {
    match open(&state, order_id, auth.as_ref(), &query).await? {
        PortalAccess::Granted(order) => Ok(Json(order).into_response()),
        PortalAccess::Redirect(to) => Ok(Redirect::to(&to).into_response()),
    }
}

/// Close a subscription from the portal
#[utoipa::path(
    post,
    path = "/my/subscriptions/{order_id}/close",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    request_body = CloseSubscriptionRequest,
    responses(
        (status = 200, description = "Subscription closed", body = Order),
        (status = 403, description = "Plan is not closable by customers"),
        (status = 404, description = "Unknown subscription or wrong access token"),
    ),
    tag = "Portal"
)]
pub async fn close_subscription(
    auth: Option<AuthUser>,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
    Json(body): Json<CloseSubscriptionRequest>,
) -> AppResult<Json<Order>> {
    let order = open_for_action(&state, order_id, auth.as_ref(), &query).await?;
    let today = state.today(query.tz.as_deref())?;
    let closed = state
        .subscriptions
        .close_from_portal(&order, &body.close_reason, body.note, today)
        .await?;
    Ok(Json(closed))
}

/// Request a renewal; redirects to the renewal quotation
#[utoipa::path(
    post,
    path = "/my/subscriptions/{order_id}/renew",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    responses(
        (status = 303, description = "Redirect to the renewal quotation"),
        (status = 404, description = "Unknown subscription or wrong access token"),
    ),
    tag = "Portal"
)]
pub async fn renew_subscription(
    auth: Option<AuthUser>,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
) -> AppResult<Redirect> {
    let order = open_for_action(&state, order_id, auth.as_ref(), &query).await?;
    let today = state.today(query.tz.as_deref())?;
    let renewal = state.subscriptions.prepare_renewal(order.id, today).await?;
    Ok(Redirect::to(&renewal.portal_url()))
}

/// Request an upsell; redirects to the upsell quotation
#[utoipa::path(
    post,
    path = "/my/subscriptions/{order_id}/upsell",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    request_body = UpsellRequest,
    responses(
        (status = 303, description = "Redirect to the upsell quotation"),
        (status = 404, description = "Unknown subscription or wrong access token"),
    ),
    tag = "Portal"
)]
pub async fn upsell_subscription(
    auth: Option<AuthUser>,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
    Json(body): Json<UpsellRequest>,
) -> AppResult<Redirect> {
    let order = open_for_action(&state, order_id, auth.as_ref(), &query).await?;
    let today = state.today(query.tz.as_deref())?;
    let upsell = state
        .subscriptions
        .prepare_upsell(order.id, &body.lines, today)
        .await?;
    Ok(Redirect::to(&upsell.portal_url()))
}

/// Pay a subscription or save a payment method
#[utoipa::path(
    post,
    path = "/my/subscriptions/{order_id}/transactions",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    request_body = CreateTransactionRequest,
    responses(
        (status = 200, description = "Transaction created", body = TransactionResponse),
        (status = 404, description = "Unknown or cancelled subscription"),
        (status = 503, description = "Payment provider unavailable"),
    ),
    tag = "Portal"
)]
pub async fn create_transaction(
    auth: Option<AuthUser>,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
    Json(body): Json<CreateTransactionRequest>,
) -> AppResult<Json<TransactionResponse>> {
    let order = open_for_action(&state, order_id, auth.as_ref(), &query).await?;
    let today = state.today(query.tz.as_deref())?;
    let response = state
        .subscriptions
        .create_transaction(order.id, order.partner_id, body, today)
        .await?;
    Ok(Json(response))
}

/// Use a saved payment method for future renewals
#[utoipa::path(
    post,
    path = "/my/subscriptions/{order_id}/payment-token",
    params(
        ("order_id" = Uuid, Path, description = "Subscription ID"),
        PortalAccessQuery,
    ),
    request_body = AssignTokenRequest,
    responses(
        (status = 200, description = "Token assigned", body = Order),
        (status = 400, description = "Token unusable for this subscription"),
    ),
    tag = "Portal"
)]
pub async fn assign_token(
    auth: Option<AuthUser>,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<PortalAccessQuery>,
    Json(body): Json<AssignTokenRequest>,
) -> AppResult<Json<Order>> {
    let order = open_for_action(&state, order_id, auth.as_ref(), &query).await?;
    let updated = state
        .subscriptions
        .assign_token(order.id, order.partner_id, body.token_id)
        .await?;
    Ok(Json(updated))
}
