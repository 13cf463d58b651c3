use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gauntlet_harness::{EvalConfig, EvaluationController, RunOutput};
use gauntlet_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind, WorkerGuard,
};
use gauntlet_supervisor::ProcessSupervisor;
use gauntlet_types::Domain;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "gauntlet-engine")]
#[command(about = "Pass@k evaluation engine for conversational tool-use agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one chosen benchmark task over k attempts.
    Run {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        task_id: Option<u32>,
        #[arg(long)]
        k: Option<u32>,
        #[arg(long)]
        max_steps: Option<u32>,
        #[arg(long)]
        target_bin: Option<String>,
        #[arg(long)]
        target_port: Option<u16>,
        #[arg(long)]
        env_url: Option<String>,
        #[arg(long, default_value_t = false)]
        restart_between_attempts: bool,
        #[arg(long)]
        logs_dir: Option<String>,
    },
    /// Evaluate a random sample of tasks from the configured pool.
    Battle {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        num_battles: Option<u32>,
        #[arg(long)]
        k: Option<u32>,
        #[arg(long)]
        target_bin: Option<String>,
        #[arg(long)]
        target_port: Option<u16>,
        #[arg(long)]
        env_url: Option<String>,
        #[arg(long)]
        logs_dir: Option<String>,
    },
    /// Launch the target, probe its health endpoint once, and stop it.
    Probe {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        target_bin: Option<String>,
        #[arg(long)]
        target_port: Option<u16>,
        #[arg(long)]
        logs_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            domain,
            task_id,
            k,
            max_steps,
            target_bin,
            target_port,
            env_url,
            restart_between_attempts,
            logs_dir,
        } => {
            let _log_guard = init_logging(logs_dir)?;
            let overrides = build_cli_overrides(RunOverrides {
                mode: Some("manual"),
                domain: parse_domain_flag(domain)?,
                task_id,
                num_battles: None,
                k,
                max_steps,
                target_bin,
                target_port,
                env_url,
                restart_between_attempts,
            });
            let config = EvalConfig::load(config.as_deref().map(Path::new), overrides)?;
            run_controller(config).await
        }
        Command::Battle {
            config,
            num_battles,
            k,
            target_bin,
            target_port,
            env_url,
            logs_dir,
        } => {
            let _log_guard = init_logging(logs_dir)?;
            let overrides = build_cli_overrides(RunOverrides {
                mode: Some("random"),
                domain: None,
                task_id: None,
                num_battles,
                k,
                max_steps: None,
                target_bin,
                target_port,
                env_url,
                restart_between_attempts: false,
            });
            let config = EvalConfig::load(config.as_deref().map(Path::new), overrides)?;
            run_controller(config).await
        }
        Command::Probe {
            config,
            target_bin,
            target_port,
            logs_dir,
        } => {
            let _log_guard = init_logging(logs_dir)?;
            let overrides = build_cli_overrides(RunOverrides {
                mode: None,
                domain: None,
                task_id: None,
                num_battles: None,
                k: None,
                max_steps: None,
                target_bin,
                target_port,
                env_url: None,
                restart_between_attempts: false,
            });
            let config = load_unvalidated(config.as_deref().map(Path::new), overrides)?;
            probe_target(config).await
        }
    }
}

async fn run_controller(config: EvalConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing the current attempt then stopping");
            signal_cancel.cancel();
        }
    });

    let controller = EvaluationController::new(config);
    let output = controller.run(cancel).await?;

    match output {
        RunOutput::Single(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        RunOutput::Battle(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

/// One-shot target diagnostics. Starts the child, reports the probe result,
/// and always stops it.
async fn probe_target(config: EvalConfig) -> anyhow::Result<()> {
    let supervisor = ProcessSupervisor::new(config.supervisor_config())?;
    let handle = supervisor.start().await?;
    let liveness = supervisor.health().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "pid": handle.pid,
            "port": handle.port,
            "state": supervisor.state().await,
            "liveness": liveness,
        }))?
    );
    supervisor.stop().await?;
    Ok(())
}

fn init_logging(logs_dir_flag: Option<String>) -> anyhow::Result<WorkerGuard> {
    let logs_dir = resolve_logs_dir(logs_dir_flag);
    let (guard, log_info) =
        init_process_logging(ProcessKind::Harness, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Harness,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            run_id: None,
            attempt_index: None,
            context_id: None,
            domain: None,
            task_id: None,
            status: Some("ok"),
            error_code: None,
            detail: Some("harness jsonl logging initialized"),
        },
    );
    info!("harness logging initialized: {log_info:?}");
    Ok(guard)
}

fn resolve_logs_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("GAUNTLET_LOGS_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    canonical_logs_dir_from_root(Path::new(".gauntlet"))
}

fn parse_domain_flag(flag: Option<String>) -> anyhow::Result<Option<Domain>> {
    let Some(raw) = flag else {
        return Ok(None);
    };
    match Domain::parse(&raw) {
        Some(domain) => Ok(Some(domain)),
        None => anyhow::bail!("unsupported domain `{raw}`. supported domains: retail, airline"),
    }
}

#[derive(Debug, Default)]
struct RunOverrides {
    mode: Option<&'static str>,
    domain: Option<Domain>,
    task_id: Option<u32>,
    num_battles: Option<u32>,
    k: Option<u32>,
    max_steps: Option<u32>,
    target_bin: Option<String>,
    target_port: Option<u16>,
    env_url: Option<String>,
    restart_between_attempts: bool,
}

/// Flags become the topmost configuration layer, shaped like the config
/// file so they deep-merge over it.
fn build_cli_overrides(overrides: RunOverrides) -> Option<serde_json::Value> {
    let mut root = serde_json::Map::new();

    if let Some(mode) = overrides.mode {
        root.insert("mode".to_string(), serde_json::Value::String(mode.to_string()));
    }
    if let Some(domain) = overrides.domain {
        root.insert(
            "domain".to_string(),
            serde_json::Value::String(domain.as_str().to_string()),
        );
    }
    if let Some(task_id) = overrides.task_id {
        root.insert("task_id".to_string(), serde_json::json!(task_id));
    }
    if let Some(num_battles) = overrides.num_battles {
        root.insert("num_battles".to_string(), serde_json::json!(num_battles));
    }
    if let Some(k) = overrides.k {
        root.insert("k".to_string(), serde_json::json!(k));
    }
    if let Some(max_steps) = overrides.max_steps {
        root.insert("max_steps".to_string(), serde_json::json!(max_steps));
    }
    if let Some(env_url) = overrides.env_url {
        root.insert("env_url".to_string(), serde_json::Value::String(env_url));
    }
    if overrides.restart_between_attempts {
        root.insert(
            "restart_between_attempts".to_string(),
            serde_json::Value::Bool(true),
        );
    }

    if overrides.target_bin.is_some() || overrides.target_port.is_some() {
        let mut target = serde_json::Map::new();
        if let Some(bin) = overrides.target_bin {
            target.insert("binary_path".to_string(), serde_json::Value::String(bin));
        }
        if let Some(port) = overrides.target_port {
            target.insert("port".to_string(), serde_json::json!(port));
        }
        root.insert("target".to_string(), serde_json::Value::Object(target));
    }

    if root.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(root))
    }
}

/// Probe does not need a runnable evaluation, only a target; skip the full
/// validation `EvalConfig::load` applies.
fn load_unvalidated(
    path: Option<&Path>,
    overrides: Option<serde_json::Value>,
) -> anyhow::Result<EvalConfig> {
    let mut merged = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        }
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    if let Some(cli) = overrides {
        gauntlet_harness::deep_merge(&mut merged, &cli);
    }
    Ok(serde_json::from_value(merged)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cli_overrides_nests_target_fields() {
        let overrides = build_cli_overrides(RunOverrides {
            mode: Some("manual"),
            domain: Some(Domain::Airline),
            task_id: Some(17),
            k: Some(6),
            target_bin: Some("/opt/target/agent".to_string()),
            target_port: Some(9100),
            ..RunOverrides::default()
        })
        .unwrap();

        assert_eq!(overrides["mode"], "manual");
        assert_eq!(overrides["domain"], "airline");
        assert_eq!(overrides["task_id"], 17);
        assert_eq!(overrides["k"], 6);
        assert_eq!(overrides["target"]["binary_path"], "/opt/target/agent");
        assert_eq!(overrides["target"]["port"], 9100);
        assert!(overrides.get("max_steps").is_none());
    }

    #[test]
    fn build_cli_overrides_without_flags_is_none() {
        assert!(build_cli_overrides(RunOverrides::default()).is_none());
    }

    #[test]
    fn restart_flag_only_appears_when_set() {
        let overrides = build_cli_overrides(RunOverrides {
            restart_between_attempts: true,
            target_port: Some(9004),
            ..RunOverrides::default()
        })
        .unwrap();
        assert_eq!(overrides["restart_between_attempts"], true);

        let none = build_cli_overrides(RunOverrides {
            env_url: Some("http://10.0.0.5:8110".to_string()),
            ..RunOverrides::default()
        })
        .unwrap();
        assert!(none.get("restart_between_attempts").is_none());
    }

    #[test]
    fn parse_domain_flag_is_case_insensitive_and_strict() {
        assert_eq!(
            parse_domain_flag(Some("Retail".to_string())).unwrap(),
            Some(Domain::Retail)
        );
        assert_eq!(parse_domain_flag(None).unwrap(), None);
        assert!(parse_domain_flag(Some("banking".to_string())).is_err());
    }
}
