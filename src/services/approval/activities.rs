// src/services/approval/activities.rs

use chrono::{Duration, NaiveDate, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ApprovalService, engine::Evaluation};
use crate::{
    errors::AppResult,
    models::approval::{ApprovalActivity, ApprovalRequest},
};

impl ApprovalService {
    /// Aligns the open activities of a record with its current level: one per
    /// recipient of each unsatisfied rule at that level who has not decided.
    pub(super) async fn sync_activities(
        &self,
        model: &str,
        method: &str,
        res_id: Uuid,
        eval: &Evaluation,
        today: NaiveDate,
    ) -> AppResult<()> {
        let open: Vec<ApprovalActivity> = self
            .store
            .record_activities(model, res_id)
            .await?
            .into_iter()
            .filter(|a| a.method == method)
            .collect();

        let has_decided = |rule_id: Uuid, user_id: Uuid| {
            eval.rule(rule_id)
                .is_some_and(|state| state.entries.iter().any(|e| e.user_id == user_id))
        };

        let stale: Vec<Uuid> = open
            .iter()
            .filter(|a| {
                let current = eval.rule(a.rule_id).is_some_and(|state| {
                    !state.satisfied && Some(state.rule.notification_order) == eval.level
                });
                !current || has_decided(a.rule_id, a.user_id)
            })
            .map(|a| a.id)
            .collect();
        if !stale.is_empty() {
            self.store.close_activities(&stale).await?;
            debug!("Closed {} approval activities on {}/{}", stale.len(), model, res_id);
        }

        let Some(level) = eval.level else {
            return Ok(());
        };
        let deadline = today + Duration::days(self.settings.deadline_days);

        for state in eval
            .rules
            .iter()
            .filter(|s| !s.satisfied && s.rule.notification_order == level)
        {
            let rule = &state.rule;
            let mut recipients: Vec<Uuid> = Vec::new();
            for user_id in rule.approver_ids.iter().chain(rule.notifier_ids.iter()) {
                if !recipients.contains(user_id) {
                    recipients.push(*user_id);
                }
            }

            for user_id in recipients {
                let already_open = open
                    .iter()
                    .any(|a| a.rule_id == rule.id && a.user_id == user_id && !stale.contains(&a.id));
                if already_open || has_decided(rule.id, user_id) {
                    continue;
                }

                let activity = ApprovalActivity {
                    id: Uuid::new_v4(),
                    model: model.to_string(),
                    res_id,
                    method: method.to_string(),
                    rule_id: rule.id,
                    notification_order: rule.notification_order,
                    user_id,
                    summary: format!("Approval needed: {}", rule.name),
                    deadline,
                    created_at: Utc::now(),
                };
                let request = ApprovalRequest {
                    id: Uuid::new_v4(),
                    rule_id: rule.id,
                    res_id,
                    activity_id: activity.id,
                };
                self.store.insert_activity(&activity, &request).await?;
                info!(
                    "Approval activity for '{}' on {}/{} assigned to {} (due {})",
                    rule.name, model, res_id, user_id, deadline
                );
            }
        }
        Ok(())
    }

    /// Closes every activity of a record for one method.
    pub(super) async fn close_record_activities(
        &self,
        model: &str,
        method: &str,
        res_id: Uuid,
    ) -> AppResult<usize> {
        let ids: Vec<Uuid> = self
            .store
            .record_activities(model, res_id)
            .await?
            .into_iter()
            .filter(|a| a.method == method)
            .map(|a| a.id)
            .collect();
        if !ids.is_empty() {
            self.store.close_activities(&ids).await?;
            debug!("Closed {} approval activities on {}/{}", ids.len(), model, res_id);
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[tokio::test]
    async fn notifiers_get_one_activity_with_a_deadline() {
        let approvals = service();
        let admin = user("admin");
        let watcher = user("watcher");
        let mut req = rule_request("Buyer", 1, &[&admin]);
        req.notifier_ids = vec![watcher.user_id, admin.user_id];
        approvals.create_rule(req).await.unwrap();
        let po = Uuid::new_v4();
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        for _ in 0..2 {
            let eval = approvals.evaluate_target(MODEL, METHOD, None, po, None).await.unwrap();
            approvals.sync_activities(MODEL, METHOD, po, &eval, today).await.unwrap();
        }

        let admin_todo = approvals.list_activities(admin.user_id).await.unwrap();
        let watcher_todo = approvals.list_activities(watcher.user_id).await.unwrap();
        assert_eq!(admin_todo.len(), 1);
        assert_eq!(watcher_todo.len(), 1);
        assert_eq!(watcher_todo[0].deadline, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());

        assert_eq!(approvals.close_record_activities(MODEL, METHOD, po).await.unwrap(), 2);
        assert!(approvals.list_activities(admin.user_id).await.unwrap().is_empty());
    }
}
