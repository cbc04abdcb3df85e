// src/models/approval.rs

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

// ─── Rules ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ApprovalRule {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub method: String,
    pub action_id: Option<String>,
    /// Prefix-notation domain, `None` or `[]` matches every record
    #[schema(value_type = Option<Object>)]
    pub domain: Option<Value>,
    pub approval_group: Option<String>,
    pub approver_ids: Vec<Uuid>,
    pub notifier_ids: Vec<Uuid>,
    pub notification_order: i32,
    pub exclusive_user: bool,
    pub can_validate_without_approver: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRule {
    /// A rule nobody can ever approve counts as approved.
    pub fn is_degenerate(&self) -> bool {
        self.approver_ids.is_empty() && !self.can_validate_without_approver
    }

    pub fn targets(&self, model: &str, method: &str, action_id: Option<&str>) -> bool {
        self.model == model && self.method == method && self.action_id.as_deref() == action_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ApprovalEntry {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub model: String,
    pub res_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ApprovalActivity {
    pub id: Uuid,
    pub model: String,
    pub res_id: Uuid,
    pub method: String,
    pub rule_id: Uuid,
    pub notification_order: i32,
    pub user_id: Uuid,
    pub summary: String,
    pub deadline: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Links a rule outcome to the activity it opened.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub res_id: Uuid,
    pub activity_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct InvalidationTrigger {
    pub id: Uuid,
    pub model: String,
    pub method: String,
    pub watched_field: String,
    #[schema(value_type = Object)]
    pub pre_domain: Value,
    #[schema(value_type = Object)]
    pub post_domain: Value,
}

/// Authenticated user deciding on approvals.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Approver {
    pub user_id: Uuid,
    pub name: String,
    pub groups: Vec<String>,
}

// ─── Spec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SpecQuery {
    pub model: String,
    pub method: String,
    #[serde(default)]
    pub action_id: Option<String>,
    pub res_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GetSpecRequest {
    pub records: Vec<SpecQuery>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RuleSpec {
    pub rule: ApprovalRule,
    pub entries: Vec<ApprovalEntry>,
    pub satisfied: bool,
    /// Whether the requesting user may set an entry on this rule
    pub can_approve: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecordSpec {
    pub model: String,
    pub method: String,
    pub action_id: Option<String>,
    pub res_id: Uuid,
    pub current_level: Option<i32>,
    pub approved: bool,
    pub rules: Vec<RuleSpec>,
}

// ─── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetApprovalRequest {
    pub rule_id: Uuid,
    pub res_id: Uuid,
    pub approved: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteApprovalRequest {
    pub rule_id: Uuid,
    pub res_id: Uuid,
    /// Owner of the entry, defaults to the caller
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    pub model: String,
    pub method: String,
    #[serde(default)]
    pub action_id: Option<String>,
    pub res_id: Uuid,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub args: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExecuteResponse {
    pub res_id: Uuid,
    #[schema(value_type = Object)]
    pub result: Value,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateRuleRequest {
    pub name: String,
    pub model: String,
    pub method: String,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub domain: Option<Value>,
    #[serde(default)]
    pub approval_group: Option<String>,
    #[serde(default)]
    pub approver_ids: Vec<Uuid>,
    #[serde(default)]
    pub notifier_ids: Vec<Uuid>,
    #[serde(default = "default_order")]
    pub notification_order: i32,
    #[serde(default)]
    pub exclusive_user: bool,
    #[serde(default)]
    pub can_validate_without_approver: bool,
}

fn default_order() -> i32 {
    1
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EnsureTriggerRequest {
    pub model: String,
    pub method: String,
    pub watched_field: String,
    #[schema(value_type = Object)]
    pub pre_domain: Value,
    #[schema(value_type = Object)]
    pub post_domain: Value,
}

/// Write notification from a system owning the record.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordEvent {
    pub model: String,
    pub res_id: Uuid,
    #[schema(value_type = Object)]
    pub before: Value,
    #[schema(value_type = Object)]
    pub after: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecordEventOutcome {
    pub entries_removed: u64,
}
