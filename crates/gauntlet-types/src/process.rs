use serde::{Deserialize, Serialize};

/// Supervisor state machine: Stopped -> Starting -> Running -> Terminating
/// -> Stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Terminating,
}

/// Result of a single liveness probe, decoupled from the business health of
/// the agent behind the port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Up,
    Down,
}

/// Snapshot of the supervised target process. A restart destroys and
/// replaces this value rather than mutating it in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub port: u16,
    pub state: ProcessState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ProcessState::Terminating).unwrap(),
            "\"terminating\""
        );
    }
}
