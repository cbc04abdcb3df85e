// src/routes/mod.rs

use crate::{
    handlers::{
        approvals::{
            archive_rule, create_rule, delete_approval, ensure_trigger, execute, get_spec,
            list_activities, list_rules, record_event, set_approval,
        },
        general::{health_handler, root_handler},
        loans::loan_schedule,
        payments::payment_webhook,
        portal::{
            assign_token, close_subscription, create_transaction, list_subscriptions,
            renew_subscription, upsell_subscription, view_subscription,
        },
        subscriptions::{
            cancel_order, close_order, confirm_order, create_invoice, create_order,
            create_plan, create_pricing, create_product, create_provider, get_order,
            list_invoices, pause_order, post_invoice, reopen_order, resume_order, run_billing,
            set_currency,
        },
    },
    openapi::ApiDoc,
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // ─── Loans ────────────────────────────────────────────
        .route("/loans/schedule", post(loan_schedule))
        // ─── Catalogue ────────────────────────────────────────
        .route("/catalogue/currencies", put(set_currency))
        .route("/catalogue/plans", post(create_plan))
        .route("/catalogue/products", post(create_product))
        .route("/catalogue/pricings", post(create_pricing))
        .route("/catalogue/providers", post(create_provider))
        // ─── Subscriptions ────────────────────────────────────
        .route("/subscriptions", post(create_order))
        .route("/subscriptions/billing/run", post(run_billing))
        .route("/subscriptions/{order_id}", get(get_order))
        .route("/subscriptions/{order_id}/confirm", post(confirm_order))
        .route("/subscriptions/{order_id}/close", post(close_order))
        .route("/subscriptions/{order_id}/cancel", post(cancel_order))
        .route("/subscriptions/{order_id}/pause", post(pause_order))
        .route("/subscriptions/{order_id}/resume", post(resume_order))
        .route("/subscriptions/{order_id}/reopen", post(reopen_order))
        // ─── Invoices ─────────────────────────────────────────
        .route(
            "/subscriptions/{order_id}/invoices",
            post(create_invoice).get(list_invoices),
        )
        .route("/invoices/{invoice_id}/post", post(post_invoice))
        // ─── Approvals ────────────────────────────────────────
        .route("/approvals/spec", post(get_spec))
        .route("/approvals/set", post(set_approval))
        .route("/approvals/delete", post(delete_approval))
        .route("/approvals/execute", post(execute))
        .route("/approvals/rules", post(create_rule).get(list_rules))
        .route("/approvals/rules/{rule_id}/archive", post(archive_rule))
        .route("/approvals/activities", get(list_activities))
        .route("/approvals/triggers", post(ensure_trigger))
        .route("/approvals/record-events", post(record_event))
}

pub fn portal_routes() -> Router<AppState> {
    Router::new()
        .route("/my/subscriptions", get(list_subscriptions))
        .route("/my/subscriptions/{order_id}", get(view_subscription))
        .route("/my/subscriptions/{order_id}/close", post(close_subscription))
        .route("/my/subscriptions/{order_id}/renew", post(renew_subscription))
        .route("/my/subscriptions/{order_id}/upsell", post(upsell_subscription))
        .route(
            "/my/subscriptions/{order_id}/transactions",
            post(create_transaction),
        )
        .route("/my/subscriptions/{order_id}/payment-token", post(assign_token))
        .route("/payment/webhook", post(payment_webhook))
}

/// The whole HTTP surface, ready to serve.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", api_routes())
        .merge(portal_routes())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
