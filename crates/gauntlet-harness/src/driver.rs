use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use gauntlet_env::{ResetResult, TaskEnvironment};
use gauntlet_observability::{emit_event, truncate_text, ObservabilityEvent, ProcessKind};
use gauntlet_peer::PeerChannel;
use gauntlet_types::{
    Action, AttemptContext, AttemptOutcome, AttemptStatus, EvalEvent, FailureCategory,
    HarnessError, Task, TaskRef,
};

use crate::events::EventBus;
use crate::parse::extract_action;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Step cap per attempt.
    pub max_steps: u32,
    /// Minimum reward for a terminated episode to count as success.
    pub success_threshold: f64,
    /// Action name the peer uses to reply to the user directly instead of
    /// calling a tool.
    pub respond_action: String,
    /// Per-turn peer timeout; enforced by the peer channel itself, used
    /// here to derive the attempt budget.
    pub step_timeout: Duration,
    /// Margin added on top of step_timeout * max_steps.
    pub attempt_margin: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            success_threshold: 1.0,
            respond_action: "respond".to_string(),
            step_timeout: Duration::from_secs(90),
            attempt_margin: Duration::from_secs(30),
        }
    }
}

impl DriverConfig {
    /// Wall-clock budget for one whole attempt.
    pub fn attempt_budget(&self) -> Duration {
        self.step_timeout * self.max_steps + self.attempt_margin
    }
}

struct AttemptEnd {
    status: AttemptStatus,
    reward: f64,
    category: Option<FailureCategory>,
}

impl AttemptEnd {
    fn failed(category: FailureCategory) -> Self {
        Self {
            status: AttemptStatus::Failed,
            reward: 0.0,
            category: Some(category),
        }
    }

    fn errored(category: FailureCategory) -> Self {
        Self {
            status: AttemptStatus::Errored,
            reward: 0.0,
            category: Some(category),
        }
    }
}

/// Run one evaluation attempt against a fresh context.
///
/// Every terminal transition produces exactly one AttemptOutcome; failures
/// are contained here and never raised to the caller.
pub async fn run_attempt(
    env: &mut dyn TaskEnvironment,
    peer: &dyn PeerChannel,
    task_ref: TaskRef,
    context_id: &str,
    config: &DriverConfig,
    cancel: &CancellationToken,
    bus: &EventBus,
) -> AttemptOutcome {
    let started = Instant::now();

    let mut step_count: u32 = 0;
    let end = match tokio::time::timeout(
        config.attempt_budget(),
        drive(env, peer, task_ref, context_id, config, cancel, bus, &mut step_count),
    )
    .await
    {
        Ok(end) => end,
        Err(_) => AttemptEnd {
            status: AttemptStatus::TimedOut,
            reward: 0.0,
            category: Some(FailureCategory::Timeout),
        },
    };

    let success = end.status == AttemptStatus::Succeeded;
    let outcome = AttemptOutcome {
        context_id: context_id.to_string(),
        success,
        reward: end.reward,
        step_count,
        wall_time_ms: started.elapsed().as_millis() as u64,
        failure_category: end.category,
    };

    emit_event(
        if success { Level::INFO } else { Level::WARN },
        ProcessKind::Harness,
        ObservabilityEvent {
            event: "attempt.finished",
            component: "driver",
            run_id: None,
            attempt_index: None,
            context_id: Some(context_id),
            domain: Some(task_ref.domain.as_str()),
            task_id: Some(task_ref.task_id),
            status: Some(if success { "succeeded" } else { "failed" }),
            error_code: outcome.failure_category.map(FailureCategory::as_str),
            detail: Some(&format!(
                "steps={} reward={} wall_ms={}",
                outcome.step_count, outcome.reward, outcome.wall_time_ms
            )),
        },
    );
    bus.publish(EvalEvent::new(
        "attempt.finished",
        json!({
            "context_id": context_id,
            "success": success,
            "reward": outcome.reward,
            "step_count": outcome.step_count,
            "failure_category": outcome.failure_category,
        }),
    ));

    outcome
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    env: &mut dyn TaskEnvironment,
    peer: &dyn PeerChannel,
    task_ref: TaskRef,
    context_id: &str,
    config: &DriverConfig,
    cancel: &CancellationToken,
    bus: &EventBus,
    step_count: &mut u32,
) -> AttemptEnd {
    // Init: reset the environment and compose the task framing.
    let reset = match env.reset(task_ref).await {
        Ok(reset) => reset,
        Err(err) => {
            tracing::warn!("environment reset failed for {task_ref}: {err}");
            return AttemptEnd::errored(FailureCategory::EnvironmentError);
        }
    };

    let task = Task {
        domain: task_ref.domain,
        task_id: task_ref.task_id,
        policy_text: reset.policy_text.clone(),
        tool_catalog: reset.tool_catalog.clone(),
    };
    let mut context = AttemptContext::new(context_id.to_string(), task);
    let mut message = initial_message(&reset, &config.respond_action);

    for step_num in 0..config.max_steps {
        if cancel.is_cancelled() {
            context.status = AttemptStatus::Errored;
            return AttemptEnd::errored(FailureCategory::CommunicationError);
        }

        bus.publish(EvalEvent::new(
            "attempt.step",
            json!({
                "context_id": context_id,
                "step": step_num + 1,
                "total_steps": config.max_steps,
                "message": truncate_text(&message, 500),
            }),
        ));

        // AwaitingPeer. Dropping the send future on cancel closes the
        // in-flight call.
        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                context.status = AttemptStatus::Errored;
                return AttemptEnd::errored(FailureCategory::CommunicationError);
            }
            reply = peer.send(context_id, &message) => reply,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(HarnessError::Timeout(detail)) => {
                tracing::warn!("peer timed out at step {}: {detail}", step_num + 1);
                context.status = AttemptStatus::TimedOut;
                return AttemptEnd {
                    status: AttemptStatus::TimedOut,
                    reward: 0.0,
                    category: Some(FailureCategory::Timeout),
                };
            }
            Err(err) => {
                tracing::warn!("peer transport failure at step {}: {err}", step_num + 1);
                context.status = AttemptStatus::Errored;
                return AttemptEnd::errored(FailureCategory::CommunicationError);
            }
        };

        let action = match extract_action(&reply) {
            Ok(action) => action,
            Err(err) => {
                tracing::warn!("unparseable peer reply at step {}: {err}", step_num + 1);
                context.status = AttemptStatus::Failed;
                return AttemptEnd::failed(FailureCategory::FormatError);
            }
        };

        // ApplyingAction.
        let step = match env.step(&action).await {
            Ok(step) => step,
            Err(err) => {
                tracing::error!("environment step failed at step {}: {err}", step_num + 1);
                context.status = AttemptStatus::Errored;
                return AttemptEnd::errored(FailureCategory::EnvironmentError);
            }
        };

        let done = step.done;
        let reward = step.reward;
        let observation = step.observation.clone();
        let info = step.info.clone();
        context.record_step(action.clone(), step);
        *step_count = context.step_count;

        if done {
            // Terminal: the environment is the sole authority on reward.
            if reward >= config.success_threshold {
                context.status = AttemptStatus::Succeeded;
                return AttemptEnd {
                    status: AttemptStatus::Succeeded,
                    reward,
                    category: None,
                };
            }
            context.status = AttemptStatus::Failed;
            return AttemptEnd {
                status: AttemptStatus::Failed,
                reward,
                category: Some(categorize_shortfall(&info)),
            };
        }

        message = followup_message(&action, &config.respond_action, &observation);
    }

    // Step budget exhausted without termination.
    context.status = AttemptStatus::Failed;
    AttemptEnd::failed(FailureCategory::Timeout)
}

/// First message to the peer: policy, tool catalog as structured data, the
/// expected reply encoding, and the opening observation.
fn initial_message(reset: &ResetResult, respond_action: &str) -> String {
    let tools = serde_json::to_string_pretty(&reset.tool_catalog)
        .unwrap_or_else(|_| "[]".to_string());
    format!(
        "{policy}\n\
         Here's a list of tools you can use (you can use at most one tool at a time):\n\
         {tools}\n\
         Please respond in JSON format and wrap the JSON part in <json>...</json> tags.\n\
         The JSON must contain:\n\
         - \"name\": the tool call function name, or \"{respond_action}\" if you want to respond directly.\n\
         - \"arguments\": the arguments for the tool call, or {{\"content\": \"your message here\"}} if you want to respond directly.\n\
         \n\
         Next, I'll provide you with the user message and tool call results.\n\
         User message: {obs}",
        policy = reset.policy_text,
        obs = reset.observation,
    )
}

/// Later turns carry only the newest observation; the peer owns whatever
/// conversational memory it wants to keep.
fn followup_message(action: &Action, respond_action: &str, observation: &str) -> String {
    if action.name == respond_action {
        format!("User message:\n{observation}")
    } else {
        format!("Tool call result:\n{observation}")
    }
}

fn categorize_shortfall(info: &serde_json::Map<String, serde_json::Value>) -> FailureCategory {
    if truthy(info.get("missing_outputs")) {
        FailureCategory::MissingOutputs
    } else if truthy(info.get("incomplete_outputs")) {
        FailureCategory::IncompleteOutputs
    } else {
        FailureCategory::TaskIncomplete
    }
}

fn truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        None => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::ToolSchema;

    fn reset_fixture() -> ResetResult {
        ResetResult {
            observation: "Hi, I need to return an order.".to_string(),
            policy_text: "You are a retail support agent.".to_string(),
            tool_catalog: vec![ToolSchema {
                name: "get_order".to_string(),
                description: "Look up an order".to_string(),
                parameters: json!({"type": "object"}),
            }],
        }
    }

    #[test]
    fn initial_message_carries_policy_tools_and_observation() {
        let message = initial_message(&reset_fixture(), "respond");
        assert!(message.starts_with("You are a retail support agent."));
        assert!(message.contains("\"get_order\""));
        assert!(message.contains("<json>...</json>"));
        assert!(message.contains("\"respond\""));
        assert!(message.ends_with("User message: Hi, I need to return an order."));
    }

    #[test]
    fn followup_message_frames_tool_results_and_user_turns() {
        let tool_action = Action {
            name: "get_order".to_string(),
            arguments: serde_json::Map::new(),
        };
        let respond_action = Action {
            name: "respond".to_string(),
            arguments: serde_json::Map::new(),
        };
        assert!(
            followup_message(&tool_action, "respond", "order found").starts_with("Tool call result:")
        );
        assert!(
            followup_message(&respond_action, "respond", "thanks!").starts_with("User message:")
        );
    }

    #[test]
    fn shortfall_category_prefers_missing_then_incomplete() {
        let mut info = serde_json::Map::new();
        assert_eq!(categorize_shortfall(&info), FailureCategory::TaskIncomplete);

        info.insert("incomplete_outputs".to_string(), json!(["x"]));
        assert_eq!(
            categorize_shortfall(&info),
            FailureCategory::IncompleteOutputs
        );

        info.insert("missing_outputs".to_string(), json!(true));
        assert_eq!(categorize_shortfall(&info), FailureCategory::MissingOutputs);
    }

    #[test]
    fn empty_marker_values_are_not_truthy() {
        let mut info = serde_json::Map::new();
        info.insert("missing_outputs".to_string(), json!([]));
        info.insert("incomplete_outputs".to_string(), json!(false));
        assert_eq!(categorize_shortfall(&info), FailureCategory::TaskIncomplete);
    }

    #[test]
    fn attempt_budget_scales_with_steps() {
        let config = DriverConfig {
            max_steps: 10,
            step_timeout: Duration::from_secs(60),
            attempt_margin: Duration::from_secs(30),
            ..DriverConfig::default()
        };
        assert_eq!(config.attempt_budget(), Duration::from_secs(630));
    }
}
