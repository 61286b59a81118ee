use std::fmt;
use std::sync::Arc;

use serde_json::Value;

pub const FINALIZE_STEP_ID: &str = "finalize";

/// Marker key written into job state while a revert is in flight; its
/// presence suppresses "step complete" rendering for the target step on the
/// next read.
pub const REVERT_TARGET_KEY: &str = "_revert_target";

/// Derives a suggested value for a step from the prior step's output.
pub type Transform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct StepDef {
    /// Unique step identifier within the workflow.
    pub id: String,
    /// Key written into the job's state when the step completes.
    pub done: String,
    /// Human-readable label.
    pub show: String,
    /// Refill steps keep their value across a revert so the input can be
    /// pre-populated on revisit.
    pub refill: bool,
    pub transform: Option<Transform>,
}

impl StepDef {
    pub fn new(id: &str, done: &str, show: &str) -> Self {
        Self {
            id: id.to_string(),
            done: done.to_string(),
            show: show.to_string(),
            refill: false,
            transform: None,
        }
    }

    pub fn refill(mut self) -> Self {
        self.refill = true;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// The terminal lock step every workflow ends with.
    pub fn finalize() -> Self {
        Self::new(FINALIZE_STEP_ID, "finalized", "Finalize")
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("id", &self.id)
            .field("done", &self.done)
            .field("show", &self.show)
            .field("refill", &self.refill)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StepError {
    #[error("workflow has no 'finalize' step")]
    MissingFinalize,
    #[error("'finalize' must be the last step")]
    FinalizeNotLast,
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
}

/// Immutable ordered step list with index-based successor lookup.
#[derive(Debug, Clone)]
pub struct StepSequence {
    steps: Vec<StepDef>,
}

impl StepSequence {
    pub fn new(steps: Vec<StepDef>) -> Result<Self, StepError> {
        for (i, step) in steps.iter().enumerate() {
            if steps[..i].iter().any(|s| s.id == step.id) {
                return Err(StepError::DuplicateStep(step.id.clone()));
            }
        }
        match steps.iter().position(|s| s.id == FINALIZE_STEP_ID) {
            None => return Err(StepError::MissingFinalize),
            Some(pos) if pos != steps.len() - 1 => return Err(StepError::FinalizeNotLast),
            Some(_) => {}
        }
        Ok(Self { steps })
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn get(&self, step_id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn next_step_id(&self, step_id: &str) -> Option<&str> {
        let pos = self.position(step_id)?;
        self.steps.get(pos + 1).map(|s| s.id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDef> {
        self.steps.iter()
    }

    /// All steps except the terminal finalize step.
    pub fn workflow_steps(&self) -> impl Iterator<Item = &StepDef> {
        self.steps.iter().filter(|s| s.id != FINALIZE_STEP_ID)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// JSON truthiness used by the finalize gate: null, false, 0, "", empty
/// arrays and empty objects all count as incomplete.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Whether every non-finalize step has a truthy `done` value in `state`.
pub fn all_steps_complete(state: &serde_json::Map<String, Value>, steps: &StepSequence) -> bool {
    steps.workflow_steps().all(|step| {
        state
            .get(&step.id)
            .and_then(|entry| entry.get(&step.done))
            .is_some_and(is_truthy)
    })
}

/// Whether the job has been locked by its finalize step.
pub fn is_finalized(state: &serde_json::Map<String, Value>) -> bool {
    state
        .get(FINALIZE_STEP_ID)
        .and_then(|entry| entry.get("finalized"))
        .is_some_and(is_truthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demo_steps() -> StepSequence {
        StepSequence::new(vec![
            StepDef::new("project", "botify_project", "Project"),
            StepDef::new("analysis", "analysis_slug", "Analysis"),
            StepDef::finalize(),
        ])
        .unwrap()
    }

    #[test]
    fn test_missing_finalize_rejected() {
        let err = StepSequence::new(vec![StepDef::new("a", "a_done", "A")]).unwrap_err();
        assert_eq!(err, StepError::MissingFinalize);
    }

    #[test]
    fn test_finalize_must_be_last() {
        let err = StepSequence::new(vec![
            StepDef::finalize(),
            StepDef::new("a", "a_done", "A"),
        ])
        .unwrap_err();
        assert_eq!(err, StepError::FinalizeNotLast);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = StepSequence::new(vec![
            StepDef::new("a", "a_done", "A"),
            StepDef::new("a", "other", "A again"),
            StepDef::finalize(),
        ])
        .unwrap_err();
        assert_eq!(err, StepError::DuplicateStep("a".to_string()));
    }

    #[test]
    fn test_next_step_lookup() {
        let steps = demo_steps();
        assert_eq!(steps.next_step_id("project"), Some("analysis"));
        assert_eq!(steps.next_step_id("analysis"), Some(FINALIZE_STEP_ID));
        assert_eq!(steps.next_step_id(FINALIZE_STEP_ID), None);
        assert_eq!(steps.next_step_id("ghost"), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("example.com")));
        assert!(is_truthy(&json!(7)));
        assert!(is_truthy(&json!({"k": 1})));
    }

    #[test]
    fn test_all_steps_complete() {
        let steps = demo_steps();
        let mut state = serde_json::Map::new();
        assert!(!all_steps_complete(&state, &steps));

        state.insert("project".into(), json!({"botify_project": "example.com"}));
        assert!(!all_steps_complete(&state, &steps));

        state.insert("analysis".into(), json!({"analysis_slug": "20260801"}));
        assert!(all_steps_complete(&state, &steps));

        // Empty string is not a completion
        state.insert("analysis".into(), json!({"analysis_slug": ""}));
        assert!(!all_steps_complete(&state, &steps));
    }

    #[test]
    fn test_is_finalized() {
        let mut state = serde_json::Map::new();
        assert!(!is_finalized(&state));
        state.insert(FINALIZE_STEP_ID.into(), json!({"finalized": true}));
        assert!(is_finalized(&state));
        state.insert(FINALIZE_STEP_ID.into(), json!({"finalized": false}));
        assert!(!is_finalized(&state));
    }

    #[test]
    fn test_transform_derives_value() {
        let step = StepDef::new("analysis", "analysis_slug", "Analysis").with_transform(Arc::new(
            |prior: &Value| json!(format!("{}-latest", prior.as_str().unwrap_or(""))),
        ));
        let derived = (step.transform.as_ref().unwrap())(&json!("example.com"));
        assert_eq!(derived, json!("example.com-latest"));
    }
}
