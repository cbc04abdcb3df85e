// src/handlers/payments.rs

use crate::{
    errors::AppResult,
    models::subscription::{ProviderNotification, Transaction},
    state::AppState,
};
use axum::{Json, extract::State};
use tracing::info;

/// Payment provider status notification
#[utoipa::path(
    post,
    path = "/payment/webhook",
    request_body = ProviderNotification,
    responses(
        (status = 200, description = "Notification applied", body = Transaction),
        (status = 404, description = "Unknown transaction reference"),
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(body): Json<ProviderNotification>,
) -> AppResult<Json<Transaction>> {
    info!("Provider notification for {}: {:?}", body.reference, body.status);
    let today = state.today(None)?;
    let tx = state.subscriptions.handle_notification(body, today).await?;
    Ok(Json(tx))
}
