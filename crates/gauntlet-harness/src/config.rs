use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use gauntlet_supervisor::SupervisorConfig;
use gauntlet_types::{Domain, HarnessError, Result, TaskRef};

use crate::aggregator::PassKConfig;
use crate::driver::DriverConfig;
use crate::events::ReportConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Manual,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub binary_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Fixed listen port for the target. 0 selects an ephemeral port, which
    /// is incompatible with restart_between_attempts.
    #[serde(default = "default_target_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_message_path")]
    pub message_path: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_ready_probes")]
    pub ready_probes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSinkConfig {
    pub backend_url: String,
    pub battle_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default = "default_mode")]
    pub mode: RunMode,
    /// Manual mode task address.
    pub domain: Option<Domain>,
    pub task_id: Option<u32>,
    /// Random mode task pool; sampled without replacement.
    #[serde(default)]
    pub task_set: Vec<TaskRef>,
    #[serde(default = "default_num_battles")]
    pub num_battles: u32,
    #[serde(default = "default_k")]
    pub k: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_attempt_margin_secs")]
    pub attempt_margin_secs: u64,
    #[serde(default = "default_inter_attempt_delay_secs")]
    pub inter_attempt_delay_secs: u64,
    #[serde(default)]
    pub restart_between_attempts: bool,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_respond_action")]
    pub respond_action: String,
    #[serde(default = "default_env_url")]
    pub env_url: String,
    pub target: TargetConfig,
    pub report: Option<ReportSinkConfig>,
}

fn default_mode() -> RunMode {
    RunMode::Manual
}
fn default_target_port() -> u16 {
    9004
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_message_path() -> String {
    "/message".to_string()
}
fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_ready_probes() -> u32 {
    2
}
fn default_num_battles() -> u32 {
    5
}
fn default_k() -> u32 {
    4
}
fn default_max_steps() -> u32 {
    30
}
fn default_step_timeout_secs() -> u64 {
    90
}
fn default_attempt_margin_secs() -> u64 {
    30
}
fn default_inter_attempt_delay_secs() -> u64 {
    2
}
fn default_success_threshold() -> f64 {
    1.0
}
fn default_respond_action() -> String {
    "respond".to_string()
}
fn default_env_url() -> String {
    "http://127.0.0.1:8110".to_string()
}

impl EvalConfig {
    /// Load configuration as layered JSON: config file, then environment,
    /// then CLI overrides, deep-merged in that order. Validation runs before
    /// any attempt does.
    pub fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self> {
        let mut merged = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    HarnessError::Config(format!("cannot read config {}: {e}", path.display()))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    HarnessError::Config(format!("config {} is not valid JSON: {e}", path.display()))
                })?
            }
            None => Value::Object(Map::new()),
        };

        deep_merge(&mut merged, &env_layer());
        if let Some(cli) = cli_overrides {
            deep_merge(&mut merged, &cli);
        }

        let config: EvalConfig = serde_json::from_value(merged)
            .map_err(|e| HarnessError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.k < 2 || self.k % 2 != 0 {
            return Err(HarnessError::Config(format!(
                "k must be even and >= 2, got {}",
                self.k
            )));
        }
        if self.max_steps == 0 {
            return Err(HarnessError::Config("max_steps must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(HarnessError::Config(format!(
                "success_threshold must be within 0.0..=1.0, got {}",
                self.success_threshold
            )));
        }
        match self.mode {
            RunMode::Manual => {
                if self.domain.is_none() || self.task_id.is_none() {
                    return Err(HarnessError::Config(
                        "manual mode requires domain and task_id".to_string(),
                    ));
                }
            }
            RunMode::Random => {
                if self.task_set.is_empty() {
                    return Err(HarnessError::Config(
                        "random mode requires a non-empty task_set".to_string(),
                    ));
                }
                if self.num_battles == 0 {
                    return Err(HarnessError::Config("num_battles must be >= 1".to_string()));
                }
                if self.num_battles as usize > self.task_set.len() {
                    return Err(HarnessError::Config(format!(
                        "num_battles {} exceeds task_set size {} (sampling is without replacement)",
                        self.num_battles,
                        self.task_set.len()
                    )));
                }
            }
        }
        if self.restart_between_attempts && self.target.port == 0 {
            return Err(HarnessError::Config(
                "restart_between_attempts requires a fixed target port".to_string(),
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            max_steps: self.max_steps,
            success_threshold: self.success_threshold,
            respond_action: self.respond_action.clone(),
            step_timeout: self.step_timeout(),
            attempt_margin: Duration::from_secs(self.attempt_margin_secs),
        }
    }

    pub fn pass_k_config(&self) -> PassKConfig {
        PassKConfig {
            k: self.k,
            restart_between_attempts: self.restart_between_attempts,
            inter_attempt_delay: Duration::from_secs(self.inter_attempt_delay_secs),
            driver: self.driver_config(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary_path: self.target.binary_path.clone(),
            args: self.target.args.clone(),
            preferred_port: self.target.port,
            health_path: self.target.health_path.clone(),
            startup_timeout: Duration::from_secs(self.target.startup_timeout_secs),
            ready_probes: self.target.ready_probes,
            ..SupervisorConfig::default()
        }
    }

    pub fn report_config(&self) -> Option<ReportConfig> {
        self.report.as_ref().map(|r| ReportConfig {
            backend_url: r.backend_url.clone(),
            battle_id: r.battle_id.clone(),
        })
    }
}

/// Environment layer: a handful of deployment-facing knobs, merged above
/// the config file and below CLI overrides.
fn env_layer() -> Value {
    let mut root = Map::new();
    if let Ok(url) = std::env::var("GAUNTLET_ENV_URL") {
        if !url.trim().is_empty() {
            root.insert("env_url".to_string(), Value::String(url));
        }
    }
    if let Ok(bin) = std::env::var("GAUNTLET_TARGET_BIN") {
        if !bin.trim().is_empty() {
            let mut target = Map::new();
            target.insert("binary_path".to_string(), Value::String(bin));
            root.insert("target".to_string(), Value::Object(target));
        }
    }
    if let (Ok(backend), Ok(battle)) = (
        std::env::var("GAUNTLET_BACKEND_URL"),
        std::env::var("GAUNTLET_BATTLE_ID"),
    ) {
        if !backend.trim().is_empty() && !battle.trim().is_empty() {
            let mut report = Map::new();
            report.insert("backend_url".to_string(), Value::String(backend));
            report.insert("battle_id".to_string(), Value::String(battle));
            root.insert("report".to_string(), Value::Object(report));
        }
    }
    Value::Object(root)
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_config_json() -> Value {
        json!({
            "mode": "manual",
            "domain": "retail",
            "task_id": 1,
            "target": {"binary_path": "/usr/local/bin/target-agent"}
        })
    }

    fn config_from(value: Value) -> EvalConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_fill_unspecified_fields() {
        let config = config_from(base_config_json());
        config.validate().unwrap();
        assert_eq!(config.k, 4);
        assert_eq!(config.max_steps, 30);
        assert_eq!(config.step_timeout_secs, 90);
        assert_eq!(config.respond_action, "respond");
        assert_eq!(config.target.port, 9004);
        assert!(!config.restart_between_attempts);
    }

    #[test]
    fn odd_k_is_rejected_before_any_attempt() {
        let mut value = base_config_json();
        value["k"] = json!(3);
        let err = config_from(value).validate().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(err.to_string().contains("even"));
    }

    #[test]
    fn k_of_zero_is_rejected() {
        let mut value = base_config_json();
        value["k"] = json!(0);
        assert!(config_from(value).validate().is_err());
    }

    #[test]
    fn manual_mode_requires_task_address() {
        let value = json!({
            "mode": "manual",
            "target": {"binary_path": "/bin/agent"}
        });
        let err = config_from(value).validate().unwrap_err();
        assert!(err.to_string().contains("domain and task_id"));
    }

    #[test]
    fn random_mode_requires_enough_tasks() {
        let value = json!({
            "mode": "random",
            "num_battles": 3,
            "task_set": [
                {"domain": "retail", "task_id": 1},
                {"domain": "retail", "task_id": 2}
            ],
            "target": {"binary_path": "/bin/agent"}
        });
        let err = config_from(value).validate().unwrap_err();
        assert!(err.to_string().contains("without replacement"));
    }

    #[test]
    fn restart_with_ephemeral_port_is_rejected() {
        let mut value = base_config_json();
        value["restart_between_attempts"] = json!(true);
        value["target"]["port"] = json!(0);
        let err = config_from(value).validate().unwrap_err();
        assert!(err.to_string().contains("fixed target port"));
    }

    #[test]
    fn deep_merge_overlays_nested_objects() {
        let mut base = json!({"target": {"binary_path": "/a", "port": 9004}, "k": 4});
        deep_merge(&mut base, &json!({"target": {"port": 9014}, "k": 6}));
        assert_eq!(base["target"]["binary_path"], "/a");
        assert_eq!(base["target"]["port"], 9014);
        assert_eq!(base["k"], 6);
    }

    #[test]
    fn load_merges_file_and_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gauntlet.json");
        std::fs::write(&path, base_config_json().to_string()).unwrap();

        let config = EvalConfig::load(Some(&path), Some(json!({"k": 2, "max_steps": 5}))).unwrap();
        assert_eq!(config.k, 2);
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.domain, Some(Domain::Retail));
    }

    #[test]
    fn load_rejects_invalid_merged_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gauntlet.json");
        std::fs::write(&path, base_config_json().to_string()).unwrap();

        let err = EvalConfig::load(Some(&path), Some(json!({"k": 5}))).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn derived_configs_carry_timeouts_through() {
        let mut value = base_config_json();
        value["step_timeout_secs"] = json!(10);
        value["max_steps"] = json!(4);
        value["attempt_margin_secs"] = json!(5);
        let config = config_from(value);
        let driver = config.driver_config();
        assert_eq!(driver.attempt_budget(), Duration::from_secs(45));
        let pass_k = config.pass_k_config();
        assert_eq!(pass_k.k, 4);
    }
}
