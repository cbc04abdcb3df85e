// src/services/approval/registry.rs

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{errors::AppResult, models::approval::Approver};

/// Who runs a gated method, with which arguments, on which business day.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub user: Approver,
    pub args: Value,
    pub today: NaiveDate,
}

/// Entry point of a method that can be gated by approval rules.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, res_id: Uuid, ctx: ExecutionContext) -> AppResult<Value>;
}

/// Maps (model, method) to its handler.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: RwLock<HashMap<(String, String), Arc<dyn MethodHandler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, model: &str, method: &str, handler: Arc<dyn MethodHandler>) {
        self.handlers
            .write()
            .await
            .insert((model.to_string(), method.to_string()), handler);
    }

    pub async fn get(&self, model: &str, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers
            .read()
            .await
            .get(&(model.to_string(), method.to_string()))
            .cloned()
    }
}
