// src/services/approval/records.rs

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::AppResult;

/// Read access to the records rules are evaluated against.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// JSON snapshot of the record, `None` when it does not exist.
    async fn fetch(&self, res_id: Uuid) -> AppResult<Option<Value>>;
}

/// Record sources per model. Models without a registered source fall back to
/// the snapshots pushed by their owners through record events.
#[derive(Default)]
pub struct RecordSources {
    sources: RwLock<HashMap<String, Arc<dyn RecordSource>>>,
    pushed: RwLock<HashMap<(String, Uuid), Value>>,
}

impl RecordSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, model: &str, source: Arc<dyn RecordSource>) {
        self.sources.write().await.insert(model.to_string(), source);
    }

    /// Keeps the latest snapshot an external system sent for a record.
    pub async fn remember(&self, model: &str, res_id: Uuid, snapshot: Value) {
        self.pushed
            .write()
            .await
            .insert((model.to_string(), res_id), snapshot);
    }

    pub async fn fetch(&self, model: &str, res_id: Uuid) -> AppResult<Option<Value>> {
        let source = self.sources.read().await.get(model).cloned();
        match source {
            Some(source) => source.fetch(res_id).await,
            None => Ok(self
                .pushed
                .read()
                .await
                .get(&(model.to_string(), res_id))
                .cloned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Value);

    #[async_trait]
    impl RecordSource for Fixed {
        async fn fetch(&self, _res_id: Uuid) -> AppResult<Option<Value>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn registered_sources_win_over_pushed_snapshots() {
        let sources = RecordSources::new();
        let id = Uuid::new_v4();
        sources.remember("purchase.order", id, json!({"state": "draft"})).await;
        sources.remember("sale.order", id, json!({"state": "pushed"})).await;
        sources
            .register("sale.order", Arc::new(Fixed(json!({"state": "live"}))))
            .await;

        let pushed = sources.fetch("purchase.order", id).await.unwrap();
        assert_eq!(pushed, Some(json!({"state": "draft"})));
        let live = sources.fetch("sale.order", id).await.unwrap();
        assert_eq!(live, Some(json!({"state": "live"})));
        assert_eq!(sources.fetch("purchase.order", Uuid::new_v4()).await.unwrap(), None);
    }
}
