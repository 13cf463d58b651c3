use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gauntlet_types::{Action, HarnessError, Result, StepResult, TaskRef, ToolSchema};

/// Everything the benchmark hands back when an episode begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResult {
    pub observation: String,
    pub policy_text: String,
    pub tool_catalog: Vec<ToolSchema>,
}

/// The stateful task simulator, at its interface boundary.
///
/// The environment is the sole authority on reward and termination; callers
/// must not second-guess either. `step` after the episode has terminated is
/// a driver bug and fails with `InvalidState`.
#[async_trait]
pub trait TaskEnvironment: Send + Sync {
    async fn reset(&mut self, task: TaskRef) -> Result<ResetResult>;
    async fn step(&mut self, action: &Action) -> Result<StepResult>;
}

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8110".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP adapter to the benchmark collaborator's simulator service.
pub struct HttpEnvironment {
    config: EnvironmentConfig,
    client: reqwest::Client,
    episode_done: bool,
    episode_started: bool,
}

#[derive(Serialize)]
struct ResetRequest<'a> {
    domain: &'a str,
    task_id: u32,
}

impl HttpEnvironment {
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HarnessError::Environment(format!("failed to build client: {e}")))?;
        Ok(Self {
            config,
            client,
            episode_done: false,
            episode_started: false,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TaskEnvironment for HttpEnvironment {
    async fn reset(&mut self, task: TaskRef) -> Result<ResetResult> {
        let response = self
            .client
            .post(self.endpoint("reset"))
            .json(&ResetRequest {
                domain: task.domain.as_str(),
                task_id: task.task_id,
            })
            .send()
            .await
            .map_err(|e| HarnessError::Environment(format!("reset request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HarnessError::Environment(format!(
                "reset for {task} returned status {}",
                response.status()
            )));
        }

        let reset: ResetResult = response
            .json()
            .await
            .map_err(|e| HarnessError::Environment(format!("reset response malformed: {e}")))?;

        self.episode_done = false;
        self.episode_started = true;
        tracing::debug!(task = %task, tools = reset.tool_catalog.len(), "environment reset");
        Ok(reset)
    }

    async fn step(&mut self, action: &Action) -> Result<StepResult> {
        if !self.episode_started {
            return Err(HarnessError::InvalidState(
                "step called before reset".to_string(),
            ));
        }
        if self.episode_done {
            return Err(HarnessError::InvalidState(
                "step called on a terminated episode".to_string(),
            ));
        }

        let response = self
            .client
            .post(self.endpoint("step"))
            .json(action)
            .send()
            .await
            .map_err(|e| HarnessError::Environment(format!("step request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HarnessError::Environment(format!(
                "step returned status {}",
                response.status()
            )));
        }

        let step: StepResult = response
            .json()
            .await
            .map_err(|e| HarnessError::Environment(format!("step response malformed: {e}")))?;

        if step.done {
            self.episode_done = true;
        }
        Ok(step)
    }
}
