use serde::{Deserialize, Serialize};

/// Task domains offered by the benchmark service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Retail,
    Airline,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Retail => "retail",
            Domain::Airline => "airline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "retail" => Some(Domain::Retail),
            "airline" => Some(Domain::Airline),
            _ => None,
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (domain, task_id) addressing for a benchmark task, before it is fetched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub domain: Domain,
    pub task_id: u32,
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.task_id)
    }
}

/// One entry of the environment's tool catalog, passed through to the peer
/// as structured data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A fetched task. Immutable for the lifetime of an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub domain: Domain,
    pub task_id: u32,
    pub policy_text: String,
    pub tool_catalog: Vec<ToolSchema>,
}

/// A single proposed action parsed out of a peer reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub name: String,
    #[serde(default, alias = "kwargs")]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Result of applying one action to the environment. The environment is the
/// sole authority on reward and termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub observation: String,
    pub reward: f64,
    pub done: bool,
    #[serde(default)]
    pub info: serde_json::Map<String, serde_json::Value>,
}
