pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One row of the pipeline table: a single job and its full JSON state.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRecord {
    pub pkey: String,
    pub app_name: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// App name recorded for jobs driven from ad-hoc embedding callers rather
/// than a registered workflow.
pub const ADHOC_APP_NAME: &str = "notebook";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Insert collided with an existing record for the same pkey.
    #[error("pipeline key '{0}' is already in use")]
    KeyInUse(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Pipeline records
    async fn get_record(&self, pkey: &str) -> Option<PipelineRecord>;
    /// Insert only; fails with `KeyInUse` when the pkey already exists.
    async fn insert_record(&self, record: PipelineRecord) -> Result<(), StoreError>;
    /// Insert-or-replace; last write wins on the JSON blob.
    async fn upsert_record(&self, record: PipelineRecord) -> Result<(), StoreError>;
    async fn list_records(&self, app_name: Option<&str>) -> Vec<PipelineRecord>;
    async fn delete_record(&self, pkey: &str) -> Result<bool, StoreError>;

    // Plain key/value side table
    async fn kv_get(&self, key: &str) -> Option<String>;
    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError>;
}
