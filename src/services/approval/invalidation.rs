// src/services/approval/invalidation.rs

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use super::{
    ApprovalService,
    domain::{Domain, lookup},
};
use crate::{
    errors::{AppError, AppResult},
    models::approval::{EnsureTriggerRequest, InvalidationTrigger, RecordEvent, RecordEventOutcome},
    services::hooks::RecordWriteHook,
};

impl ApprovalService {
    /// Registers the reversion that voids approvals of (model, method).
    /// The first trigger for a pair wins; later calls return it unchanged.
    pub async fn ensure_invalidation_trigger(
        &self,
        req: EnsureTriggerRequest,
    ) -> AppResult<InvalidationTrigger> {
        if req.watched_field.trim().is_empty() {
            return Err(AppError::Validation("watched_field is required".to_string()));
        }
        Domain::parse(Some(&req.pre_domain))?;
        Domain::parse(Some(&req.post_domain))?;

        let candidate = InvalidationTrigger {
            id: Uuid::new_v4(),
            model: req.model,
            method: req.method,
            watched_field: req.watched_field,
            pre_domain: req.pre_domain,
            post_domain: req.post_domain,
        };
        let stored = self.store.insert_trigger(&candidate).await?;
        if stored.id == candidate.id {
            info!(
                "Approvals of {}.{} now reset when '{}' reverts",
                stored.model, stored.method, stored.watched_field
            );
        }
        Ok(stored)
    }

    /// Deletes the entries of every trigger the write fires. Returns how many
    /// entries were removed.
    pub async fn on_record_write(
        &self,
        model: &str,
        res_id: Uuid,
        before: &Value,
        after: &Value,
    ) -> AppResult<u64> {
        let mut removed = 0;
        for trigger in self.store.model_triggers(model).await? {
            let field = trigger.watched_field.as_str();
            if lookup(before, field) == lookup(after, field) {
                continue;
            }
            let pre = Domain::parse(Some(&trigger.pre_domain))?;
            let post = Domain::parse(Some(&trigger.post_domain))?;
            if !(pre.matches(before) && post.matches(after)) {
                continue;
            }

            let rule_ids: Vec<Uuid> = self
                .store
                .list_rules(Some(model))
                .await?
                .into_iter()
                .filter(|r| r.method == trigger.method)
                .map(|r| r.id)
                .collect();
            let count = self.store.delete_entries(&rule_ids, res_id).await?;
            self.close_record_activities(model, &trigger.method, res_id)
                .await?;
            info!(
                "'{}' of {}/{} reverted: {} approvals of {} removed",
                field, model, res_id, count, trigger.method
            );
            removed += count;
        }
        Ok(removed)
    }

    /// Write reported by a system that owns the record.
    pub async fn record_event(&self, event: RecordEvent) -> AppResult<RecordEventOutcome> {
        let entries_removed = self
            .on_record_write(&event.model, event.res_id, &event.before, &event.after)
            .await?;
        self.records
            .remember(&event.model, event.res_id, event.after)
            .await;
        Ok(RecordEventOutcome { entries_removed })
    }
}

#[async_trait]
impl RecordWriteHook for ApprovalService {
    async fn record_written(&self, model: &str, res_id: Uuid, before: &Value, after: &Value) {
        if let Err(e) = self.on_record_write(model, res_id, before, after).await {
            error!("Approval invalidation failed for {}/{}: {}", model, res_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::models::approval::{SetApprovalRequest, SpecQuery};
    use chrono::NaiveDate;
    use serde_json::json;

    fn trigger_request(pre: Value) -> EnsureTriggerRequest {
        EnsureTriggerRequest {
            model: MODEL.to_string(),
            method: METHOD.to_string(),
            watched_field: "state".to_string(),
            pre_domain: pre,
            post_domain: json!([["state", "!=", "confirmed"]]),
        }
    }

    #[tokio::test]
    async fn reverting_the_watched_state_clears_entries() {
        let approvals = service();
        let admin = user("admin");
        let rule = approvals.create_rule(rule_request("Buyer", 1, &[&admin])).await.unwrap();
        let po = Uuid::new_v4();
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let first = approvals
            .ensure_invalidation_trigger(trigger_request(json!([["state", "=", "confirmed"]])))
            .await
            .unwrap();
        let second = approvals
            .ensure_invalidation_trigger(trigger_request(json!([])))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        approvals
            .set_approval(
                &admin,
                SetApprovalRequest {
                    rule_id: rule.id,
                    res_id: po,
                    approved: true,
                },
                today,
            )
            .await
            .unwrap();

        // unrelated writes keep the approval
        let event = RecordEvent {
            model: MODEL.to_string(),
            res_id: po,
            before: json!({"state": "draft", "note": "a"}),
            after: json!({"state": "confirmed", "note": "b"}),
        };
        assert_eq!(approvals.record_event(event).await.unwrap().entries_removed, 0);

        let event = RecordEvent {
            model: MODEL.to_string(),
            res_id: po,
            before: json!({"state": "confirmed"}),
            after: json!({"state": "draft"}),
        };
        assert_eq!(approvals.record_event(event).await.unwrap().entries_removed, 1);

        let query = SpecQuery {
            model: MODEL.to_string(),
            method: METHOD.to_string(),
            action_id: None,
            res_id: po,
        };
        let spec = approvals.get_spec(&admin, &[query]).await.unwrap();
        assert!(!spec[0].approved);
        assert!(spec[0].rules[0].entries.is_empty());
    }
}
