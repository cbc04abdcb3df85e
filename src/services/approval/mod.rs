//! Approval gate: ordered, domain-filtered rules in front of business methods.
//!
//! A record may run a gated method once every matching rule carries an
//! approved entry from an eligible user. Rules are grouped into escalation
//! levels by `notification_order`; only the lowest unsatisfied level asks
//! for decisions.

mod activities;
pub mod domain;
mod engine;
mod invalidation;
pub mod records;
pub mod registry;

pub use records::{RecordSource, RecordSources};
pub use registry::{ExecutionContext, MethodHandler, MethodRegistry};

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::ApprovalSettings,
    errors::{AppError, AppResult},
    locks::LockRegistry,
    models::approval::{ApprovalActivity, ApprovalRule, CreateRuleRequest},
    store::ApprovalStore,
};
use domain::Domain;

pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    records: RecordSources,
    registry: MethodRegistry,
    locks: LockRegistry<(String, Uuid)>,
    settings: ApprovalSettings,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn ApprovalStore>, settings: ApprovalSettings) -> Self {
        Self {
            store,
            records: RecordSources::new(),
            registry: MethodRegistry::new(),
            locks: LockRegistry::new(),
            settings,
        }
    }

    pub fn records(&self) -> &RecordSources {
        &self.records
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    // ─── Rules admin ──────────────────────────────────────────────────────────

    pub async fn create_rule(&self, req: CreateRuleRequest) -> AppResult<ApprovalRule> {
        if req.name.trim().is_empty() || req.model.is_empty() || req.method.is_empty() {
            return Err(AppError::Validation(
                "name, model and method are required".to_string(),
            ));
        }
        if req.notification_order < 1 {
            return Err(AppError::Validation(
                "notification_order starts at 1".to_string(),
            ));
        }
        Domain::parse(req.domain.as_ref())?;

        let rule = ApprovalRule {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            model: req.model,
            method: req.method,
            action_id: req.action_id,
            domain: req.domain,
            approval_group: req.approval_group,
            approver_ids: dedup(req.approver_ids),
            notifier_ids: dedup(req.notifier_ids),
            notification_order: req.notification_order,
            exclusive_user: req.exclusive_user,
            can_validate_without_approver: req.can_validate_without_approver,
            active: true,
            created_at: Utc::now(),
        };
        self.store.insert_rule(&rule).await?;
        info!(
            "Approval rule '{}' created on {}.{} (level {})",
            rule.name, rule.model, rule.method, rule.notification_order
        );
        Ok(rule)
    }

    pub async fn archive_rule(&self, rule_id: Uuid) -> AppResult<()> {
        if !self.store.set_rule_active(rule_id, false).await? {
            return Err(AppError::NotFound(format!("Approval rule {} not found", rule_id)));
        }
        info!("Approval rule {} archived", rule_id);
        Ok(())
    }

    pub async fn list_rules(&self, model: Option<&str>) -> AppResult<Vec<ApprovalRule>> {
        self.store.list_rules(model).await
    }

    /// Open approval to-dos assigned to `user_id`.
    pub async fn list_activities(&self, user_id: Uuid) -> AppResult<Vec<ApprovalActivity>> {
        self.store.user_activities(user_id).await
    }

    async fn get_rule(&self, rule_id: Uuid) -> AppResult<ApprovalRule> {
        self.store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Approval rule {} not found", rule_id)))
    }
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::approval::Approver;
    use crate::store::InMemoryApprovalStore;

    pub(crate) const MODEL: &str = "purchase.order";
    pub(crate) const METHOD: &str = "button_confirm";

    pub(crate) fn service() -> ApprovalService {
        ApprovalService::new(Arc::new(InMemoryApprovalStore::new()), ApprovalSettings::default())
    }

    pub(crate) fn user(name: &str) -> Approver {
        Approver {
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            groups: Vec::new(),
        }
    }

    pub(crate) fn rule_request(name: &str, order: i32, approvers: &[&Approver]) -> CreateRuleRequest {
        CreateRuleRequest {
            name: name.to_string(),
            model: MODEL.to_string(),
            method: METHOD.to_string(),
            action_id: None,
            domain: None,
            approval_group: None,
            approver_ids: approvers.iter().map(|a| a.user_id).collect(),
            notifier_ids: Vec::new(),
            notification_order: order,
            exclusive_user: false,
            can_validate_without_approver: false,
        }
    }
}
