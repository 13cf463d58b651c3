use serde::{Deserialize, Serialize};

use crate::task::{Action, StepResult, Task};

/// Lifecycle of one attempt, as seen by the protocol driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Errored,
}

/// Why an unsuccessful attempt failed. Serialized snake_case into the report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    CommunicationError,
    FormatError,
    MissingOutputs,
    IncompleteOutputs,
    TaskIncomplete,
    EnvironmentError,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::CommunicationError => "communication_error",
            FailureCategory::FormatError => "format_error",
            FailureCategory::MissingOutputs => "missing_outputs",
            FailureCategory::IncompleteOutputs => "incomplete_outputs",
            FailureCategory::TaskIncomplete => "task_incomplete",
            FailureCategory::EnvironmentError => "environment_error",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working state for one in-flight attempt. Owned exclusively by a single
/// protocol driver invocation and dropped when the attempt concludes.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub context_id: String,
    pub task: Task,
    pub step_count: u32,
    pub transcript: Vec<(Action, StepResult)>,
    pub status: AttemptStatus,
}

impl AttemptContext {
    pub fn new(context_id: String, task: Task) -> Self {
        Self {
            context_id,
            task,
            step_count: 0,
            transcript: Vec::new(),
            status: AttemptStatus::Running,
        }
    }

    pub fn record_step(&mut self, action: Action, step: StepResult) {
        self.step_count += 1;
        self.transcript.push((action, step));
    }
}

/// Immutable snapshot of a concluded attempt, appended to the report in
/// execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptOutcome {
    pub context_id: String,
    pub success: bool,
    pub reward: f64,
    pub step_count: u32,
    pub wall_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
}

impl AttemptOutcome {
    pub fn failed(context_id: String, category: FailureCategory) -> Self {
        Self {
            context_id,
            success: false,
            reward: 0.0,
            step_count: 0,
            wall_time_ms: 0,
            failure_category: Some(category),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_category_serializes_snake_case() {
        let json = serde_json::to_string(&FailureCategory::CommunicationError).unwrap();
        assert_eq!(json, "\"communication_error\"");
    }

    #[test]
    fn outcome_omits_category_when_successful() {
        let outcome = AttemptOutcome {
            context_id: "atk-1".to_string(),
            success: true,
            reward: 1.0,
            step_count: 3,
            wall_time_ms: 42,
            failure_category: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("failure_category").is_none());
    }

    #[test]
    fn record_step_advances_count_and_transcript() {
        let task = Task {
            domain: crate::Domain::Retail,
            task_id: 1,
            policy_text: String::new(),
            tool_catalog: Vec::new(),
        };
        let mut ctx = AttemptContext::new("atk-0".to_string(), task);
        ctx.record_step(
            Action {
                name: "respond".to_string(),
                arguments: serde_json::Map::new(),
            },
            StepResult {
                observation: "hi".to_string(),
                reward: 0.0,
                done: false,
                info: serde_json::Map::new(),
            },
        );
        assert_eq!(ctx.step_count, 1);
        assert_eq!(ctx.transcript.len(), 1);
    }
}
