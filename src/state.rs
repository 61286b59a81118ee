use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use crate::steps::{
    FINALIZE_STEP_ID, REVERT_TARGET_KEY, StepSequence, all_steps_complete, is_finalized,
};
use crate::store::{PipelineRecord, Store, StoreError};

pub type JsonMap = serde_json::Map<String, Value>;

pub const CREATED_KEY: &str = "created";
pub const UPDATED_KEY: &str = "updated";

/// Conditions a caller is expected to show to the user rather than crash on.
/// Absence of a record is deliberately NOT here: missing state reads as empty.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("pipeline key '{0}' is already in use")]
    KeyInUse(String),
    #[error("job '{0}' is finalized; unlock it before reverting")]
    Locked(String),
    #[error("cannot finalize: incomplete steps: {}", missing.join(", "))]
    Incomplete { missing: Vec<String> },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::KeyInUse(k) => StateError::KeyInUse(k),
            StoreError::Storage(s) => StateError::Storage(s),
        }
    }
}

/// Translates between the persisted JSON blob and structured per-step access.
/// The only component that mutates pipeline records.
pub struct StateAccessor {
    store: Arc<dyn Store>,
    app_name: String,
}

impl StateAccessor {
    pub fn new(store: Arc<dyn Store>, app_name: &str) -> Self {
        Self {
            store,
            app_name: app_name.to_string(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Full state for a job, `{}` when the record is missing or unreadable.
    /// Absence is normal, not exceptional: a fresh job and a job with no
    /// completed steps look identical to every call site.
    pub async fn read_state(&self, pkey: &str) -> JsonMap {
        match self.store.get_record(pkey).await {
            Some(record) => record.data,
            None => JsonMap::new(),
        }
    }

    /// Stamps `updated`, persists, then reads back for verification logging.
    pub async fn write_state(&self, pkey: &str, mut state: JsonMap) -> Result<(), StateError> {
        let now = Utc::now();
        state
            .entry(CREATED_KEY.to_string())
            .or_insert_with(|| json!(now.to_rfc3339()));
        state.insert(UPDATED_KEY.to_string(), json!(now.to_rfc3339()));

        let created = self
            .store
            .get_record(pkey)
            .await
            .map(|r| r.created)
            .unwrap_or(now);

        self.store
            .upsert_record(PipelineRecord {
                pkey: pkey.to_string(),
                app_name: self.app_name.clone(),
                data: state,
                created,
                updated: now,
            })
            .await?;

        let verify = self.read_state(pkey).await;
        tracing::debug!(pkey = %pkey, keys = verify.len(), "Wrote pipeline state");
        Ok(())
    }

    pub async fn get_step_data(&self, pkey: &str, step_id: &str, default: JsonMap) -> JsonMap {
        let state = self.read_state(pkey).await;
        match state.get(step_id) {
            Some(Value::Object(entry)) => entry.clone(),
            _ => default,
        }
    }

    /// Records a step completion: optionally clears all later steps first,
    /// then writes `{done_field: value}` for the step and drops any pending
    /// revert marker. Returns the value for confirmation messages.
    pub async fn set_step_data(
        &self,
        pkey: &str,
        step_id: &str,
        value: Value,
        steps: &StepSequence,
        clear_previous: bool,
    ) -> Result<Value, StateError> {
        let mut state = if clear_previous {
            self.clear_steps_from(pkey, step_id, steps).await?
        } else {
            self.read_state(pkey).await
        };

        let done_field = steps
            .get(step_id)
            .map(|s| s.done.clone())
            .unwrap_or_else(|| step_id.to_string());

        let mut entry = JsonMap::new();
        entry.insert(done_field, value.clone());
        state.insert(step_id.to_string(), Value::Object(entry));
        state.remove(REVERT_TARGET_KEY);

        self.write_state(pkey, state).await?;
        Ok(value)
    }

    /// Deletes state for every step after `step_id`, keeping refill-marked
    /// steps' values so their inputs can be pre-populated on revisit.
    /// An unknown step id is a logged no-op returning the state unchanged;
    /// this guards against stale UI requests from another workflow version.
    pub async fn clear_steps_from(
        &self,
        pkey: &str,
        step_id: &str,
        steps: &StepSequence,
    ) -> Result<JsonMap, StateError> {
        let mut state = self.read_state(pkey).await;

        let Some(position) = steps.position(step_id) else {
            tracing::error!(pkey = %pkey, step_id = %step_id, "Step not found in workflow; not clearing");
            return Ok(state);
        };

        for step in steps.iter().skip(position + 1) {
            if !step.refill {
                state.remove(&step.id);
            }
        }

        self.write_state(pkey, state.clone()).await?;
        Ok(state)
    }

    /// Rolls the job back to `step_id`: the target step and everything after
    /// it no longer count as completed. Refused while the job is finalized.
    pub async fn revert_to(
        &self,
        pkey: &str,
        step_id: &str,
        steps: &StepSequence,
    ) -> Result<JsonMap, StateError> {
        let state = self.read_state(pkey).await;
        if is_finalized(&state) {
            return Err(StateError::Locked(pkey.to_string()));
        }
        if steps.position(step_id).is_none() {
            tracing::error!(pkey = %pkey, step_id = %step_id, "Revert target not in workflow; ignoring");
            return Ok(state);
        }

        // The target's own entry survives so its value can still be shown;
        // the marker suppresses "complete" rendering until it is re-run.
        let mut state = self.clear_steps_from(pkey, step_id, steps).await?;
        state.insert(REVERT_TARGET_KEY.to_string(), json!(step_id));
        self.write_state(pkey, state.clone()).await?;
        Ok(state)
    }

    /// Locks the job. Only permitted once every non-finalize step carries a
    /// truthy `done` value.
    pub async fn finalize(&self, pkey: &str, steps: &StepSequence) -> Result<JsonMap, StateError> {
        let mut state = self.read_state(pkey).await;
        if !all_steps_complete(&state, steps) {
            let missing = steps
                .workflow_steps()
                .filter(|s| {
                    !state
                        .get(&s.id)
                        .and_then(|e| e.get(&s.done))
                        .is_some_and(crate::steps::is_truthy)
                })
                .map(|s| s.id.clone())
                .collect();
            return Err(StateError::Incomplete { missing });
        }

        state.insert(FINALIZE_STEP_ID.to_string(), json!({"finalized": true}));
        self.write_state(pkey, state.clone()).await?;
        Ok(state)
    }

    /// Removes the finalize entry entirely, returning the job to in-progress.
    pub async fn unfinalize(&self, pkey: &str) -> Result<JsonMap, StateError> {
        let mut state = self.read_state(pkey).await;
        state.remove(FINALIZE_STEP_ID);
        self.write_state(pkey, state.clone()).await?;
        Ok(state)
    }

    /// Returns existing state untouched, or creates a fresh record with
    /// timestamps and optional seed data. A lost insert race surfaces as
    /// `KeyInUse` for direct display, never a panic.
    pub async fn initialize_if_missing(
        &self,
        pkey: &str,
        initial_step_data: Option<JsonMap>,
    ) -> Result<JsonMap, StateError> {
        if let Some(record) = self.store.get_record(pkey).await {
            return Ok(record.data);
        }

        let now = Utc::now();
        let mut state = initial_step_data.unwrap_or_default();
        state.insert(CREATED_KEY.to_string(), json!(now.to_rfc3339()));
        state.insert(UPDATED_KEY.to_string(), json!(now.to_rfc3339()));

        self.store
            .insert_record(PipelineRecord {
                pkey: pkey.to_string(),
                app_name: self.app_name.clone(),
                data: state.clone(),
                created: now,
                updated: now,
            })
            .await?;

        tracing::info!(pkey = %pkey, app = %self.app_name, "Created pipeline record");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepDef;
    use crate::store::sqlite::SqliteStore;
    use serde_json::json;

    fn accessor() -> StateAccessor {
        StateAccessor::new(Arc::new(SqliteStore::in_memory().unwrap()), "demo")
    }

    fn demo_steps() -> StepSequence {
        StepSequence::new(vec![
            StepDef::new("project", "botify_project", "Project"),
            StepDef::new("analysis", "analysis_slug", "Analysis"),
            StepDef::finalize(),
        ])
        .unwrap()
    }

    fn refill_steps() -> StepSequence {
        StepSequence::new(vec![
            StepDef::new("a", "a_done", "A"),
            StepDef::new("b", "b_done", "B").refill(),
            StepDef::new("c", "c_done", "C"),
            StepDef::finalize(),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_is_empty() {
        let state = accessor();
        assert!(state.read_state("never-written").await.is_empty());
        // Repeated reads stay empty with no side effects
        assert!(state.read_state("never-written").await.is_empty());
        let step = state
            .get_step_data("never-written", "project", JsonMap::new())
            .await;
        assert!(step.is_empty());
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let state = accessor();
        let mut s = JsonMap::new();
        s.insert(
            "step1".to_string(),
            json!({"done": {"rows": [1, 2, 3], "label": "df"}}),
        );
        state.write_state("k1", s).await.unwrap();

        let back = state.read_state("k1").await;
        assert_eq!(back["step1"]["done"], json!({"rows": [1, 2, 3], "label": "df"}));
        assert!(back.contains_key(CREATED_KEY));
        assert!(back.contains_key(UPDATED_KEY));
    }

    #[tokio::test]
    async fn test_set_step_data_scenario() {
        let state = accessor();
        let steps = demo_steps();

        let value = state
            .set_step_data("alice-demo-01", "project", json!("example.com"), &steps, true)
            .await
            .unwrap();
        assert_eq!(value, json!("example.com"));

        let entry = state
            .get_step_data("alice-demo-01", "project", JsonMap::new())
            .await;
        assert_eq!(entry["botify_project"], "example.com");
    }

    #[tokio::test]
    async fn test_revert_erases_later_steps() {
        let state = accessor();
        let steps = demo_steps();

        state
            .set_step_data("alice-demo-01", "project", json!("example.com"), &steps, true)
            .await
            .unwrap();
        state
            .set_step_data("alice-demo-01", "analysis", json!("20260801"), &steps, true)
            .await
            .unwrap();

        let after = state.revert_to("alice-demo-01", "project", &steps).await.unwrap();
        assert!(!after.contains_key("analysis"), "later step erased");
        assert_eq!(after["project"]["botify_project"], "example.com");
        assert_eq!(after[REVERT_TARGET_KEY], "project");

        // Completing the step again drops the revert marker
        state
            .set_step_data("alice-demo-01", "analysis", json!("20260901"), &steps, true)
            .await
            .unwrap();
        let done = state.read_state("alice-demo-01").await;
        assert!(!done.contains_key(REVERT_TARGET_KEY));
        assert_eq!(done["analysis"]["analysis_slug"], "20260901");
    }

    #[tokio::test]
    async fn test_clear_keeps_refill_steps() {
        let state = accessor();
        let steps = refill_steps();

        for (id, val) in [("a", "1"), ("b", "2"), ("c", "3")] {
            state
                .set_step_data("k1", id, json!(val), &steps, false)
                .await
                .unwrap();
        }

        let after = state.clear_steps_from("k1", "a", &steps).await.unwrap();
        assert!(after.contains_key("a"));
        assert!(after.contains_key("b"), "refill step survives the clear");
        assert!(!after.contains_key("c"));
    }

    #[tokio::test]
    async fn test_clear_unknown_step_is_noop() {
        let state = accessor();
        let steps = demo_steps();
        state
            .set_step_data("k1", "project", json!("example.com"), &steps, true)
            .await
            .unwrap();

        let before = state.read_state("k1").await;
        let after = state.clear_steps_from("k1", "ghost-step", &steps).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_finalize_requires_completion() {
        let state = accessor();
        let steps = demo_steps();
        state
            .set_step_data("k1", "project", json!("example.com"), &steps, true)
            .await
            .unwrap();

        let err = state.finalize("k1", &steps).await.unwrap_err();
        match err {
            StateError::Incomplete { missing } => assert_eq!(missing, vec!["analysis"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!is_finalized(&state.read_state("k1").await));
    }

    #[tokio::test]
    async fn test_finalize_unfinalize_inverse() {
        let state = accessor();
        let steps = demo_steps();
        state
            .set_step_data("k1", "project", json!("example.com"), &steps, true)
            .await
            .unwrap();
        state
            .set_step_data("k1", "analysis", json!("20260801"), &steps, true)
            .await
            .unwrap();

        let finalized = state.finalize("k1", &steps).await.unwrap();
        assert!(is_finalized(&finalized));

        let unlocked = state.unfinalize("k1").await.unwrap();
        assert!(!unlocked.contains_key(FINALIZE_STEP_ID));
        assert_eq!(unlocked["project"]["botify_project"], "example.com");
        assert_eq!(unlocked["analysis"]["analysis_slug"], "20260801");

        let again = state.finalize("k1", &steps).await.unwrap();
        assert!(is_finalized(&again));
        assert_eq!(again["project"]["botify_project"], "example.com");
    }

    #[tokio::test]
    async fn test_revert_refused_while_finalized() {
        let state = accessor();
        let steps = demo_steps();
        state
            .set_step_data("k1", "project", json!("example.com"), &steps, true)
            .await
            .unwrap();
        state
            .set_step_data("k1", "analysis", json!("20260801"), &steps, true)
            .await
            .unwrap();
        state.finalize("k1", &steps).await.unwrap();

        let err = state.revert_to("k1", "project", &steps).await.unwrap_err();
        assert!(matches!(err, StateError::Locked(_)));
        // State untouched
        let s = state.read_state("k1").await;
        assert_eq!(s["analysis"]["analysis_slug"], "20260801");
    }

    #[tokio::test]
    async fn test_initialize_if_missing() {
        let state = accessor();
        let created = state.initialize_if_missing("k1", None).await.unwrap();
        assert!(created.contains_key(CREATED_KEY));

        // Second call returns existing state unchanged
        let mut seed = JsonMap::new();
        seed.insert("x".to_string(), json!(1));
        let existing = state.initialize_if_missing("k1", Some(seed)).await.unwrap();
        assert!(!existing.contains_key("x"));
        assert_eq!(existing[CREATED_KEY], created[CREATED_KEY]);
    }

    #[tokio::test]
    async fn test_initialize_conflict_surfaces_as_value() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let state = StateAccessor::new(store.clone(), "demo");

        // Simulate another process inserting between the existence check and
        // the insert by going through the store directly.
        state.initialize_if_missing("k1", None).await.unwrap();
        let other = StateAccessor::new(store, "other-app");
        // get_record finds it, so this path returns existing state; force the
        // race by deleting the read path's view: insert directly instead.
        let err = other
            .store
            .insert_record(crate::store::PipelineRecord {
                pkey: "k1".to_string(),
                app_name: "other-app".to_string(),
                data: JsonMap::new(),
                created: Utc::now(),
                updated: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyInUse(_)));
    }
}
