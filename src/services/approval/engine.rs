// src/services/approval/engine.rs

use chrono::{NaiveDate, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApprovalService, ExecutionContext, domain::Domain};
use crate::{
    errors::{AppError, AppResult},
    models::approval::{
        ApprovalEntry, ApprovalRule, Approver, DeleteApprovalRequest, ExecuteRequest,
        ExecuteResponse, RecordSpec, RuleSpec, SetApprovalRequest, SpecQuery,
    },
};

/// One rule with the decisions recorded on a record.
#[derive(Debug, Clone)]
pub(super) struct RuleState {
    pub rule: ApprovalRule,
    pub entries: Vec<ApprovalEntry>,
    pub satisfied: bool,
}

impl RuleState {
    /// Satisfied by an actual approval, as opposed to a degenerate rule.
    pub fn approved_by_someone(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.approved && is_eligible(&self.rule, e.user_id))
    }
}

/// Approval state of one record for one gated method.
#[derive(Debug, Clone)]
pub(super) struct Evaluation {
    pub rules: Vec<RuleState>,
    /// Lowest level with an unsatisfied rule; `None` once everything is approved
    pub level: Option<i32>,
}

impl Evaluation {
    pub fn approved(&self) -> bool {
        self.level.is_none()
    }

    pub fn rule(&self, rule_id: Uuid) -> Option<&RuleState> {
        self.rules.iter().find(|r| r.rule.id == rule_id)
    }

    pub fn visible(&self) -> impl Iterator<Item = &RuleState> {
        self.rules
            .iter()
            .filter(|r| self.level.is_none_or(|level| r.rule.notification_order <= level))
    }

    pub fn pending_names(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| !r.satisfied)
            .map(|r| r.rule.name.as_str())
            .collect()
    }
}

fn is_eligible(rule: &ApprovalRule, user_id: Uuid) -> bool {
    rule.approver_ids.is_empty() || rule.approver_ids.contains(&user_id)
}

/// Whether `user` may record a decision on `rule`.
pub(super) fn can_approve(rule: &ApprovalRule, user: &Approver) -> bool {
    if rule.approver_ids.contains(&user.user_id) {
        return true;
    }
    rule.approver_ids.is_empty()
        && rule.can_validate_without_approver
        && rule
            .approval_group
            .as_ref()
            .is_none_or(|group| user.groups.contains(group))
}

impl ApprovalService {
    /// Active rules gating (model, method, action) that match the record.
    pub(super) async fn matching_rules(
        &self,
        model: &str,
        method: &str,
        action_id: Option<&str>,
        res_id: Uuid,
    ) -> AppResult<Vec<ApprovalRule>> {
        let candidates: Vec<ApprovalRule> = self
            .store
            .active_rules(model, method)
            .await?
            .into_iter()
            .filter(|r| r.targets(model, method, action_id))
            .collect();

        // only load the record when some rule filters on it
        let mut record: Option<Value> = None;
        let mut matching = Vec::with_capacity(candidates.len());
        for rule in candidates {
            let domain = Domain::parse(rule.domain.as_ref())?;
            if domain != Domain::All && record.is_none() {
                record = Some(self.records.fetch(model, res_id).await?.unwrap_or(Value::Null));
            }
            if domain.matches(record.as_ref().unwrap_or(&Value::Null)) {
                matching.push(rule);
            }
        }
        Ok(matching)
    }

    /// Evaluates the rules on a record. With an executor, exclusive rules
    /// ignore that user's own approvals.
    pub(super) async fn evaluate(
        &self,
        rules: Vec<ApprovalRule>,
        res_id: Uuid,
        executor: Option<Uuid>,
    ) -> AppResult<Evaluation> {
        let rule_ids: Vec<Uuid> = rules.iter().map(|r| r.id).collect();
        let entries = self.store.entries_for(&rule_ids, res_id).await?;

        let rules: Vec<RuleState> = rules
            .into_iter()
            .map(|rule| {
                let entries: Vec<ApprovalEntry> =
                    entries.iter().filter(|e| e.rule_id == rule.id).cloned().collect();
                let satisfied = rule.is_degenerate()
                    || entries.iter().any(|e| {
                        e.approved
                            && is_eligible(&rule, e.user_id)
                            && !(rule.exclusive_user && Some(e.user_id) == executor)
                    });
                RuleState {
                    rule,
                    entries,
                    satisfied,
                }
            })
            .collect();

        let level = rules
            .iter()
            .filter(|r| !r.satisfied)
            .map(|r| r.rule.notification_order)
            .min();
        Ok(Evaluation { rules, level })
    }

    pub(super) async fn evaluate_target(
        &self,
        model: &str,
        method: &str,
        action_id: Option<&str>,
        res_id: Uuid,
        executor: Option<Uuid>,
    ) -> AppResult<Evaluation> {
        let rules = self.matching_rules(model, method, action_id, res_id).await?;
        self.evaluate(rules, res_id, executor).await
    }

    /// Rules and decisions visible on each record, as seen by `user`.
    pub async fn get_spec(&self, user: &Approver, queries: &[SpecQuery]) -> AppResult<Vec<RecordSpec>> {
        let mut specs = Vec::with_capacity(queries.len());
        for q in queries {
            let eval = self
                .evaluate_target(&q.model, &q.method, q.action_id.as_deref(), q.res_id, None)
                .await?;
            let rules = eval
                .visible()
                .map(|state| RuleSpec {
                    can_approve: can_approve(&state.rule, user),
                    rule: state.rule.clone(),
                    entries: state.entries.clone(),
                    satisfied: state.satisfied,
                })
                .collect();
            specs.push(RecordSpec {
                model: q.model.clone(),
                method: q.method.clone(),
                action_id: q.action_id.clone(),
                res_id: q.res_id,
                current_level: eval.level,
                approved: eval.approved(),
                rules,
            });
        }
        Ok(specs)
    }

    /// Records `user`'s decision on a rule for one record.
    pub async fn set_approval(
        &self,
        user: &Approver,
        req: SetApprovalRequest,
        today: NaiveDate,
    ) -> AppResult<ApprovalEntry> {
        let rule = self.get_rule(req.rule_id).await?;
        if !rule.active {
            return Err(AppError::Validation(format!(
                "approval rule '{}' is archived",
                rule.name
            )));
        }

        let _guard = self.locks.acquire(&(rule.model.clone(), req.res_id)).await;

        let eval = self
            .evaluate_target(&rule.model, &rule.method, rule.action_id.as_deref(), req.res_id, None)
            .await?;
        if eval.rule(rule.id).is_none() {
            return Err(AppError::Validation(format!(
                "approval rule '{}' does not apply to this record",
                rule.name
            )));
        }
        if !can_approve(&rule, user) {
            return Err(AppError::Forbidden(format!(
                "{} cannot approve '{}'",
                user.name, rule.name
            )));
        }
        if eval.level.is_some_and(|level| rule.notification_order > level) {
            return Err(AppError::Validation(format!(
                "'{}' cannot be decided yet: previous level not approved",
                rule.name
            )));
        }

        let entry = self
            .store
            .upsert_entry(&ApprovalEntry {
                id: Uuid::new_v4(),
                rule_id: rule.id,
                model: rule.model.clone(),
                res_id: req.res_id,
                user_id: user.user_id,
                user_name: user.name.clone(),
                approved: req.approved,
                created_at: Utc::now(),
            })
            .await?;
        info!(
            "{} {} '{}' on {}/{}",
            user.name,
            if req.approved { "approved" } else { "rejected" },
            rule.name,
            rule.model,
            req.res_id
        );

        let eval = self
            .evaluate_target(&rule.model, &rule.method, rule.action_id.as_deref(), req.res_id, None)
            .await?;
        self.sync_activities(&rule.model, &rule.method, req.res_id, &eval, today)
            .await?;
        Ok(entry)
    }

    /// Withdraws the caller's decision, unless a later level already built on it.
    pub async fn delete_approval(
        &self,
        user: &Approver,
        req: DeleteApprovalRequest,
        today: NaiveDate,
    ) -> AppResult<()> {
        let rule = self.get_rule(req.rule_id).await?;
        let owner = req.user_id.unwrap_or(user.user_id);
        if owner != user.user_id {
            return Err(AppError::Forbidden(
                "only the approver can withdraw an approval".to_string(),
            ));
        }

        let _guard = self.locks.acquire(&(rule.model.clone(), req.res_id)).await;

        let entry = self
            .store
            .get_entry(rule.id, req.res_id, owner)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No decision by {} on '{}'", user.name, rule.name))
            })?;

        let eval = self
            .evaluate_target(&rule.model, &rule.method, rule.action_id.as_deref(), req.res_id, None)
            .await?;
        if let Some(later) = eval.rules.iter().find(|r| {
            r.rule.notification_order > rule.notification_order && r.approved_by_someone()
        }) {
            return Err(AppError::CannotRevoke(format!(
                "'{}' was approved after '{}'",
                later.rule.name, rule.name
            )));
        }

        self.store.delete_entry(entry.id).await?;
        info!(
            "{} withdrew their decision on '{}' for {}/{}",
            user.name, rule.name, rule.model, req.res_id
        );

        let eval = self
            .evaluate_target(&rule.model, &rule.method, rule.action_id.as_deref(), req.res_id, None)
            .await?;
        self.sync_activities(&rule.model, &rule.method, req.res_id, &eval, today)
            .await
    }

    /// Runs a gated method once the record is fully approved.
    pub async fn try_execute(
        &self,
        user: &Approver,
        req: ExecuteRequest,
        today: NaiveDate,
    ) -> AppResult<ExecuteResponse> {
        let handler = self.registry.get(&req.model, &req.method).await.ok_or_else(|| {
            AppError::NotFound(format!("No method {}.{}", req.model, req.method))
        })?;

        let _guard = self.locks.acquire(&(req.model.clone(), req.res_id)).await;

        let eval = self
            .evaluate_target(
                &req.model,
                &req.method,
                req.action_id.as_deref(),
                req.res_id,
                Some(user.user_id),
            )
            .await?;
        if !eval.approved() {
            self.sync_activities(&req.model, &req.method, req.res_id, &eval, today)
                .await?;
            let pending = eval.pending_names().join(", ");
            warn!(
                "{}.{} on {} blocked, waiting for: {}",
                req.model, req.method, req.res_id, pending
            );
            return Err(AppError::ApprovalRequired(format!(
                "{} needs approval: {}",
                req.method, pending
            )));
        }

        let ctx = ExecutionContext {
            user: user.clone(),
            args: if req.args.is_null() { json!({}) } else { req.args },
            today,
        };
        let result = handler.call(req.res_id, ctx).await?;
        self.close_record_activities(&req.model, &req.method, req.res_id)
            .await?;
        info!("{} ran {}.{} on {}", user.name, req.model, req.method, req.res_id);

        Ok(ExecuteResponse {
            res_id: req.res_id,
            result,
        })
    }
}
