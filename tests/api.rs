use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use back_office::{
    auth::generate_token,
    config::Config,
    models::{
        approval::Approver,
        subscription::{PaymentProvider, PaymentToken, Transaction},
    },
    routes::app,
    services::{
        email::LogMailer,
        payment_provider::{ChargeStatus, Checkout, GatewayError, PaymentGateway},
    },
    state::AppState,
    store::{InMemoryApprovalStore, InMemorySubscriptionStore},
};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::{str::FromStr, sync::Arc};
use tower::ServiceExt;
use uuid::Uuid;

struct HostedCheckout;

#[async_trait]
impl PaymentGateway for HostedCheckout {
    async fn create_checkout(
        &self,
        _provider: &PaymentProvider,
        tx: &Transaction,
        _return_url: &str,
    ) -> Result<Checkout, GatewayError> {
        Ok(Checkout {
            checkout_url: format!("https://pay.example/{}", tx.reference),
        })
    }

    async fn charge_token(
        &self,
        _provider: &PaymentProvider,
        _token: &PaymentToken,
        _tx: &Transaction,
    ) -> Result<ChargeStatus, GatewayError> {
        Ok(ChargeStatus::Done)
    }
}

struct TestApp {
    router: Router,
    config: Config,
}

impl TestApp {
    async fn new() -> Self {
        let config = Config::for_tests();
        let state = AppState::assemble(
            config.clone(),
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryApprovalStore::new()),
            Arc::new(HostedCheckout),
            Arc::new(LogMailer),
        )
        .await
        .unwrap();
        Self {
            router: app(state),
            config,
        }
    }

    fn token_for(&self, user: &Approver, partner_id: Uuid) -> String {
        generate_token(user, partner_id, &self.config.jwt_secret, 1).unwrap()
    }

    async fn send(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value, Option<String>) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json, location)
    }
}

fn user(name: &str) -> Approver {
    Approver {
        user_id: Uuid::new_v4(),
        name: name.to_string(),
        groups: Vec::new(),
    }
}

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().unwrap()).unwrap()
}

/// Creates a monthly plan, a recurring product and a quotation for `partner`.
async fn quotation(app: &TestApp, token: &str, partner: Uuid) -> Value {
    let (status, plan, _) = app
        .send(
            "POST",
            "/api/v1/catalogue/plans",
            Some(token),
            Some(json!({"name": "Monthly", "billing_period_value": 1, "billing_period_unit": "month"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, product, _) = app
        .send(
            "POST",
            "/api/v1/catalogue/products",
            Some(token),
            Some(json!({"name": "Hosting", "list_price": "30", "uom": "Units", "recurring": true})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, order, _) = app
        .send(
            "POST",
            "/api/v1/subscriptions",
            Some(token),
            Some(json!({
                "partner_id": partner,
                "currency": "USD",
                "plan_id": plan["id"],
                "lines": [{"product_id": product["id"], "qty": "2"}],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    order
}

#[tokio::test]
async fn loan_schedule_route_returns_rows_and_summary() {
    let app = TestApp::new().await;
    let (status, body, _) = app
        .send(
            "POST",
            "/api/v1/loans/schedule",
            None,
            Some(json!({
                "principal": "100000",
                "annual_rate": "5",
                "term_years": 10,
                "start_date": "2020-01-31",
                "compounding_method": "30E/360",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let schedule = body["schedule"].as_array().unwrap();
    assert_eq!(schedule.len(), 121);
    assert_eq!(schedule[1]["date"], "2020-02-29");
    assert_eq!(decimal(&schedule[120]["balance_end_of_period"]), Decimal::ZERO);
    assert_eq!(decimal(&body["summary"]["loan_amount"]), Decimal::from(100000));

    let (status, body, _) = app
        .send(
            "POST",
            "/api/v1/loans/schedule",
            None,
            Some(json!({"principal": "-1", "annual_rate": "5", "term_years": 1, "start_date": "2020-01-31"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
}

#[tokio::test]
async fn portal_pages_need_the_owner_or_the_access_token() {
    let app = TestApp::new().await;
    let clerk = user("clerk");
    let owner = Uuid::new_v4();
    let clerk_token = app.token_for(&clerk, Uuid::new_v4());
    let order = quotation(&app, &clerk_token, owner).await;
    let id = order["id"].as_str().unwrap();
    assert!(order.get("access_token").is_none());

    let (status, _, location) = app.send("GET", &format!("/my/subscriptions/{}", id), None, None).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        location.as_deref(),
        Some(format!("/web/login?redirect=/my/subscriptions/{}", id).as_str())
    );

    let (status, _, _) = app
        .send("GET", &format!("/my/subscriptions/{}?access_token=nope", id), None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // the stranger's session is not the owner's
    let (status, _, _) = app
        .send("GET", &format!("/my/subscriptions/{}", id), Some(&clerk_token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let owner_token = app.token_for(&user("customer"), owner);
    let (status, body, _) = app
        .send("GET", &format!("/my/subscriptions/{}", id), Some(&owner_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal(&body["amounts"]["amount_total"]), Decimal::from(60));

    let (status, page, _) = app.send("GET", "/my/subscriptions", Some(&owner_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["page_count"], 1);

    let (status, page, _) = app
        .send("GET", "/my/subscriptions?page=4294967295", Some(&owner_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(page["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn confirmation_is_gated_until_the_manager_approves() {
    let app = TestApp::new().await;
    let manager = user("manager");
    let token = app.token_for(&manager, Uuid::new_v4());
    let order = quotation(&app, &token, Uuid::new_v4()).await;

    let (status, rule, _) = app
        .send(
            "POST",
            "/api/v1/approvals/rules",
            Some(&token),
            Some(json!({
                "name": "Sales manager",
                "model": "subscription.order",
                "method": "action_confirm",
                "approver_ids": [manager.user_id],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let confirm = format!("/api/v1/subscriptions/{}/confirm", order["id"].as_str().unwrap());
    let (status, body, _) = app.send("POST", &confirm, Some(&token), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]["message"].as_str().unwrap().contains("Sales manager"));

    let (status, todo, _) = app.send("GET", "/api/v1/approvals/activities", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(todo.as_array().unwrap().len(), 1);

    let (status, _, _) = app
        .send(
            "POST",
            "/api/v1/approvals/set",
            Some(&token),
            Some(json!({"rule_id": rule["id"], "res_id": order["id"], "approved": true})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = app.send("POST", &confirm, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["subscription_state"], "in_progress");

    let (status, todo, _) = app.send("GET", "/api/v1/approvals/activities", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(todo.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unauthenticated_and_unknown_requests_are_refused() {
    let app = TestApp::new().await;

    let (status, _, _) = app.send("GET", "/api/v1/approvals/activities", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = app
        .send("GET", "/api/v1/approvals/activities", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = app
        .send(
            "POST",
            "/payment/webhook",
            None,
            Some(json!({"reference": "SUB-NOPE-1", "status": "done"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body, _) = app.send("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "in-memory");
}
