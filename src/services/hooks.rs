// src/services/hooks.rs

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Observer of record writes. Receives full snapshots before and after the
/// write; implementations handle their own failures.
#[async_trait]
pub trait RecordWriteHook: Send + Sync {
    async fn record_written(&self, model: &str, res_id: Uuid, before: &Value, after: &Value);
}

#[derive(Clone, Default)]
pub struct NoopHook;

#[async_trait]
impl RecordWriteHook for NoopHook {
    async fn record_written(&self, _model: &str, _res_id: Uuid, _before: &Value, _after: &Value) {}
}
