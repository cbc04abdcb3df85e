// src/handlers/general.rs

use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
};
use serde_json::json;

/// Root handler — returns an HTML landing page with project info and links
pub async fn root_handler() -> impl IntoResponse {
    Html(r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0"/>
  <title>Back Office API</title>
  <style>
    * { box-sizing: border-box; margin: 0; padding: 0; }
    body { font-family: 'Segoe UI', system-ui, sans-serif; background: #0f172a; color: #e2e8f0; min-height: 100vh; padding: 40px 20px; }
    .container { max-width: 860px; margin: 0 auto; }
    header { text-align: center; margin-bottom: 48px; }
    header h1 { font-size: 2.6rem; font-weight: 800; color: #60a5fa; margin-bottom: 8px; }
    header p { color: #94a3b8; font-size: 1.1rem; }
    .routes { background: #1e293b; border: 1px solid #334155; border-radius: 12px; padding: 24px; }
    .route-group { margin-bottom: 20px; }
    .route-group h4 { font-size: 0.8rem; font-weight: 600; text-transform: uppercase; letter-spacing: 0.1em; color: #64748b; margin-bottom: 8px; }
    .route-item { display: flex; gap: 12px; padding: 6px 0; border-bottom: 1px solid #0f172a; }
    .method { font-size: 0.7rem; font-weight: 700; padding: 2px 8px; border-radius: 4px; min-width: 52px; text-align: center; font-family: monospace; }
    .get { background: #064e3b; color: #34d399; }
    .post { background: #1e3a5f; color: #60a5fa; }
    .route-path { font-family: monospace; font-size: 0.85rem; flex: 1; }
    .route-desc { font-size: 0.8rem; color: #64748b; }
    a { color: #38bdf8; }
  </style>
</head>
<body>
<div class="container">
  <header>
    <h1>Back Office API</h1>
    <p>Loan schedules, subscription billing and approval workflows · <a href="/docs">Swagger UI</a> · <a href="/health">Health</a></p>
  </header>

  <div class="routes">
    <div class="route-group">
      <h4>Loans</h4>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/api/v1/loans/schedule</span><span class="route-desc">Amortization schedule and summary</span></div>
    </div>
    <div class="route-group">
      <h4>Customer portal</h4>
      <div class="route-item"><span class="method get">GET</span><span class="route-path">/my/subscriptions</span><span class="route-desc">Your subscriptions</span></div>
      <div class="route-item"><span class="method get">GET</span><span class="route-path">/my/subscriptions/:id</span><span class="route-desc">One subscription (session or access token)</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/my/subscriptions/:id/close</span><span class="route-desc">Close a subscription</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/my/subscriptions/:id/renew</span><span class="route-desc">Request a renewal</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/my/subscriptions/:id/upsell</span><span class="route-desc">Request an upsell</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/my/subscriptions/:id/transactions</span><span class="route-desc">Pay or save a card</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/my/subscriptions/:id/payment-token</span><span class="route-desc">Use a saved card</span></div>
    </div>
    <div class="route-group">
      <h4>Subscriptions</h4>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/api/v1/subscriptions</span><span class="route-desc">Create a quotation</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/api/v1/subscriptions/billing/run</span><span class="route-desc">Run recurring billing now</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/payment/webhook</span><span class="route-desc">Payment provider notifications</span></div>
    </div>
    <div class="route-group">
      <h4>Approvals</h4>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/api/v1/approvals/spec</span><span class="route-desc">Rules and decisions per record</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/api/v1/approvals/set</span><span class="route-desc">Approve or reject</span></div>
      <div class="route-item"><span class="method post">POST</span><span class="route-path">/api/v1/approvals/execute</span><span class="route-desc">Run a gated method</span></div>
    </div>
  </div>
</div>
</body>
</html>"#)
}

/// Health check endpoint
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(db) = &state.db else {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "in-memory",
                "service": "back-office",
                "version": env!("CARGO_PKG_VERSION")
            })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(db).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected",
                "service": "back-office",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}
