// src/handlers/approvals.rs

use crate::{
    auth::AuthUser,
    errors::AppResult,
    models::approval::{
        ApprovalActivity, ApprovalEntry, ApprovalRule, CreateRuleRequest, DeleteApprovalRequest,
        EnsureTriggerRequest, ExecuteRequest, ExecuteResponse, GetSpecRequest,
        InvalidationTrigger, RecordEvent, RecordEventOutcome, RecordSpec, SetApprovalRequest,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

/// Rules, decisions and progress of each record
#[utoipa::path(
    post,
    path = "/api/v1/approvals/spec",
    request_body = GetSpecRequest,
    responses(
        (status = 200, description = "One spec per requested record", body = Vec<RecordSpec>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn get_spec(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<GetSpecRequest>,
) -> AppResult<Json<Vec<RecordSpec>>> {
    let specs = state.approvals.get_spec(&auth.user, &body.records).await?;
    Ok(Json(specs))
}

/// Approve or reject a rule on a record
#[utoipa::path(
    post,
    path = "/api/v1/approvals/set",
    request_body = SetApprovalRequest,
    responses(
        (status = 200, description = "Decision stored", body = ApprovalEntry),
        (status = 400, description = "Rule does not apply or previous level pending"),
        (status = 403, description = "Caller may not approve this rule"),
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn set_approval(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<SetApprovalRequest>,
) -> AppResult<Json<ApprovalEntry>> {
    let today = state.today(None)?;
    let entry = state.approvals.set_approval(&auth.user, body, today).await?;
    Ok(Json(entry))
}

/// Withdraw a decision
#[utoipa::path(
    post,
    path = "/api/v1/approvals/delete",
    request_body = DeleteApprovalRequest,
    responses(
        (status = 204, description = "Decision withdrawn"),
        (status = 403, description = "A later level already relies on it"),
        (status = 404, description = "No such decision"),
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn delete_approval(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<DeleteApprovalRequest>,
) -> AppResult<StatusCode> {
    let today = state.today(None)?;
    state.approvals.delete_approval(&auth.user, body, today).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a gated method once every matching rule is approved
#[utoipa::path(
    post,
    path = "/api/v1/approvals/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Method executed", body = ExecuteResponse),
        (status = 404, description = "No method registered"),
        (status = 422, description = "Approval required"),
    ),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn execute(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let today = state.today(None)?;
    Ok(Json(state.approvals.try_execute(&auth.user, body, today).await?))
}

// ─── Rules ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, IntoParams)]
pub struct RulesQuery {
    pub model: Option<String>,
}

/// Create an approval rule
#[utoipa::path(
    post,
    path = "/api/v1/approvals/rules",
    request_body = CreateRuleRequest,
    responses(
        (status = 201, description = "Rule created", body = ApprovalRule),
        (status = 400, description = "Invalid rule or domain"),
    ),
    security(("bearer_auth" = [])),
    tag = "Approval Rules"
)]
pub async fn create_rule(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> AppResult<(StatusCode, Json<ApprovalRule>)> {
    let rule = state.approvals.create_rule(body).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// List approval rules
#[utoipa::path(
    get,
    path = "/api/v1/approvals/rules",
    params(RulesQuery),
    responses((status = 200, description = "Rules by model, method and level", body = Vec<ApprovalRule>)),
    security(("bearer_auth" = [])),
    tag = "Approval Rules"
)]
pub async fn list_rules(
    _auth: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<RulesQuery>,
) -> AppResult<Json<Vec<ApprovalRule>>> {
    Ok(Json(state.approvals.list_rules(query.model.as_deref()).await?))
}

/// Archive an approval rule
#[utoipa::path(
    post,
    path = "/api/v1/approvals/rules/{rule_id}/archive",
    params(("rule_id" = Uuid, Path, description = "Rule ID")),
    responses(
        (status = 204, description = "Rule archived"),
        (status = 404, description = "Rule not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Approval Rules"
)]
pub async fn archive_rule(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.approvals.archive_rule(rule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The caller's open approval to-dos
#[utoipa::path(
    get,
    path = "/api/v1/approvals/activities",
    responses((status = 200, description = "Open activities, soonest deadline first", body = Vec<ApprovalActivity>)),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn list_activities(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<Vec<ApprovalActivity>>> {
    Ok(Json(state.approvals.list_activities(auth.user.user_id).await?))
}

// ─── Invalidation ─────────────────────────────────────────────────────────────

/// Register the state reversion that voids approvals of a method
#[utoipa::path(
    post,
    path = "/api/v1/approvals/triggers",
    request_body = EnsureTriggerRequest,
    responses((status = 200, description = "Trigger in place", body = InvalidationTrigger)),
    security(("bearer_auth" = [])),
    tag = "Approval Rules"
)]
pub async fn ensure_trigger(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<EnsureTriggerRequest>,
) -> AppResult<Json<InvalidationTrigger>> {
    Ok(Json(state.approvals.ensure_invalidation_trigger(body).await?))
}

/// Report a write made by the system owning a record
#[utoipa::path(
    post,
    path = "/api/v1/approvals/record-events",
    request_body = RecordEvent,
    responses((status = 200, description = "Approvals voided by the write", body = RecordEventOutcome)),
    security(("bearer_auth" = [])),
    tag = "Approvals"
)]
pub async fn record_event(
    _auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<RecordEvent>,
) -> AppResult<Json<RecordEventOutcome>> {
    Ok(Json(state.approvals.record_event(body).await?))
}
