use std::sync::Arc;

use serde_json::Value;

use crate::queue::{MessageQueue, MessageSink, UiMessage};
use crate::state::{CREATED_KEY, JsonMap, StateAccessor, StateError, UPDATED_KEY};
use crate::steps::StepSequence;
use crate::store::Store;
use crate::stream::StreamInterceptor;
use crate::tools::ToolRegistry;

/// Key/value slot remembering the profile of the most recent key generation.
const LAST_PROFILE_KEY: &str = "last_profile";

/// Top-level entry point assembling the store, state accessor, message queue
/// and tool registry. Workflow plugins use the step-aware methods; embedding
/// callers that just want job-scoped key-value semantics use `get`/`set`/
/// `read`/`write` and never touch a step list.
pub struct Pipulate {
    store: Arc<dyn Store>,
    state: StateAccessor,
    queue: MessageQueue,
    registry: Arc<ToolRegistry>,
}

impl Pipulate {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn MessageSink>,
        registry: Arc<ToolRegistry>,
        app_name: &str,
    ) -> Self {
        Self {
            state: StateAccessor::new(store.clone(), app_name),
            queue: MessageQueue::new(sink),
            store,
            registry,
        }
    }

    pub fn state(&self) -> &StateAccessor {
        &self.state
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn interceptor(&self) -> StreamInterceptor {
        StreamInterceptor::new(self.registry.clone())
    }

    // ------ bare job-scoped key-value access (no step model) ------

    /// One step's value, or None when the job or key is absent.
    pub async fn get(&self, job: &str, step: &str) -> Option<Value> {
        self.state.read_state(job).await.get(step).cloned()
    }

    pub async fn get_or(&self, job: &str, step: &str, default: Value) -> Value {
        self.get(job, step).await.unwrap_or(default)
    }

    /// Writes one key directly into the job's state, creating the record on
    /// first use. Deliberately bypasses revert-aware `set_step_data`: bare
    /// key-value callers have no step list.
    pub async fn set(&self, job: &str, step: &str, value: Value) -> Result<(), StateError> {
        let mut state = self.state.read_state(job).await;
        state.insert(step.to_string(), value);
        self.state.write_state(job, state).await
    }

    /// Full job state with the `created`/`updated` housekeeping keys stripped,
    /// leaving pure step payloads.
    pub async fn read(&self, job: &str) -> JsonMap {
        let mut state = self.state.read_state(job).await;
        state.remove(CREATED_KEY);
        state.remove(UPDATED_KEY);
        state
    }

    /// Replaces the job's step payloads wholesale; the original `created`
    /// timestamp survives.
    pub async fn write(&self, job: &str, state: JsonMap) -> Result<(), StateError> {
        let existing = self.state.read_state(job).await;
        let mut merged = state;
        if let Some(created) = existing.get(CREATED_KEY) {
            merged.insert(CREATED_KEY.to_string(), created.clone());
        }
        self.state.write_state(job, merged).await
    }

    // ------ step-aware workflow operations ------

    /// Confirmation messages are best-effort; a dead transport must not fail
    /// the state change itself, but it is worth a log line since everything
    /// queued behind it is going nowhere.
    async fn notify(&self, message: UiMessage) {
        if let Err(e) = self.queue.add(message).await {
            tracing::warn!(error = %e, "Failed to deliver UI message");
        }
    }

    /// Default value to offer for a step, derived from the prior step's
    /// completed output through the step's transform. None when the step has
    /// no transform, no predecessor, or the predecessor isn't done yet.
    pub async fn suggested_value(
        &self,
        pkey: &str,
        step_id: &str,
        steps: &StepSequence,
    ) -> Option<Value> {
        let step = steps.get(step_id)?;
        let transform = step.transform.as_ref()?;
        let position = steps.position(step_id)?;
        let prior = steps.iter().nth(position.checked_sub(1)?)?;

        let state = self.state.read_state(pkey).await;
        let prior_value = state.get(&prior.id)?.get(&prior.done)?;
        Some(transform(prior_value))
    }

    pub async fn set_step(
        &self,
        pkey: &str,
        step_id: &str,
        value: Value,
        steps: &StepSequence,
    ) -> Result<Value, StateError> {
        let value = self
            .state
            .set_step_data(pkey, step_id, value, steps, true)
            .await?;
        let label = steps
            .get(step_id)
            .map(|s| s.show.clone())
            .unwrap_or_else(|| step_id.to_string());
        self.notify(UiMessage::success(format!("{label} complete."))).await;
        Ok(value)
    }

    pub async fn revert(
        &self,
        pkey: &str,
        step_id: &str,
        steps: &StepSequence,
    ) -> Result<JsonMap, StateError> {
        match self.state.revert_to(pkey, step_id, steps).await {
            Ok(state) => {
                self.notify(UiMessage::warning(format!("Reverted to {step_id}."))).await;
                Ok(state)
            }
            Err(e) => {
                self.notify(UiMessage::error(e.to_string())).await;
                Err(e)
            }
        }
    }

    pub async fn finalize(
        &self,
        pkey: &str,
        steps: &StepSequence,
    ) -> Result<JsonMap, StateError> {
        match self.state.finalize(pkey, steps).await {
            Ok(state) => {
                self.notify(UiMessage::success("Workflow locked.".to_string())).await;
                Ok(state)
            }
            Err(e) => {
                self.notify(UiMessage::error(e.to_string())).await;
                Err(e)
            }
        }
    }

    pub async fn unfinalize(&self, pkey: &str) -> Result<JsonMap, StateError> {
        let state = self.state.unfinalize(pkey).await?;
        self.notify(UiMessage::info("Workflow unlocked for edits.".to_string())).await;
        Ok(state)
    }

    // ------ job identifiers ------

    /// Next free key under `{profile}-{plugin}-`: a zero-padded two-digit
    /// auto-increment for the first 99 jobs, the plain integer thereafter.
    /// The profile is remembered in the key/value side table so the UI can
    /// preselect it on the next visit.
    pub async fn generate_pipeline_key(&self, profile: &str, plugin: &str) -> String {
        if let Err(e) = self.store.kv_set(LAST_PROFILE_KEY, profile).await {
            tracing::warn!(error = %e, "Failed to record last-used profile");
        }
        let prefix = format!("{profile}-{plugin}-");
        let highest = self
            .store
            .list_records(None)
            .await
            .iter()
            .filter_map(|r| r.pkey.strip_prefix(&prefix))
            .filter_map(|part| part.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        let next = highest + 1;
        if next <= 99 {
            format!("{prefix}{next:02}")
        } else {
            format!("{prefix}{next}")
        }
    }

    /// Profile used by the most recent key generation, if any.
    pub async fn last_profile(&self) -> Option<String> {
        self.store.kv_get(LAST_PROFILE_KEY).await
    }
}
