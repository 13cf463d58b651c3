mod log_buffer;

pub use log_buffer::{LogLine, LogRingBuffer};

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::Level;

use gauntlet_observability::{emit_event, ObservabilityEvent, ProcessKind};
use gauntlet_types::{HarnessError, Liveness, ProcessHandle, ProcessState, Result};

/// The slice of the supervisor the aggregator needs at attempt boundaries:
/// crash detection and restart. Stubbable in tests that drive the
/// aggregator without a real child process.
#[async_trait]
pub trait TargetLifecycle: Send + Sync {
    async fn check_alive(&self) -> Result<()>;
    async fn restart(&self) -> Result<ProcessHandle>;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the target agent executable.
    pub binary_path: PathBuf,
    /// Arguments passed before the generated `--port` flag.
    pub args: Vec<String>,
    /// Preferred listen port. 0 selects an ephemeral port.
    pub preferred_port: u16,
    /// Liveness probe path on the target, e.g. `/health`.
    pub health_path: String,
    /// Budget for the whole Starting phase.
    pub startup_timeout: Duration,
    /// Timeout for a single liveness probe.
    pub probe_timeout: Duration,
    /// Delay between probes while Starting.
    pub probe_interval: Duration,
    /// Consecutive successful probes required before Starting becomes
    /// Running (debounce against flaky boot).
    pub ready_probes: u32,
    /// Settle delay between stop and start during a restart.
    pub restart_settle: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("target-agent"),
            args: Vec::new(),
            preferred_port: 0,
            health_path: "/health".to_string(),
            startup_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_millis(500),
            ready_probes: 2,
            restart_settle: Duration::from_millis(500),
        }
    }
}

/// Owns the target agent's runtime process.
///
/// State machine: Stopped -> Starting -> Running -> Terminating -> Stopped.
/// Lifecycle transitions are serialized by `lifecycle_lock` so concurrent
/// start/stop calls cannot race into duplicate spawns, and restarts only
/// ever happen at attempt boundaries (the aggregator is the only caller).
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    state: RwLock<ProcessState>,
    lifecycle_lock: Mutex<()>,
    process: Mutex<Option<Child>>,
    handle: RwLock<Option<ProcessHandle>>,
    log_buffer: Arc<LogRingBuffer>,
    probe_client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| HarnessError::Launch(format!("failed to build probe client: {e}")))?;
        Ok(Self {
            config,
            state: RwLock::new(ProcessState::Stopped),
            lifecycle_lock: Mutex::new(()),
            process: Mutex::new(None),
            handle: RwLock::new(None),
            log_buffer: Arc::new(LogRingBuffer::new(2000)),
            probe_client,
        })
    }

    pub async fn state(&self) -> ProcessState {
        *self.state.read().await
    }

    pub async fn handle(&self) -> Option<ProcessHandle> {
        self.handle.read().await.clone()
    }

    pub fn logs_tail(&self, last_n: usize) -> String {
        self.log_buffer.tail_text(last_n)
    }

    /// Start the target process and probe it to readiness.
    pub async fn start(&self) -> Result<ProcessHandle> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if *self.state.read().await == ProcessState::Running {
            if let Some(handle) = self.handle.read().await.clone() {
                tracing::debug!("target already running on port {}", handle.port);
                return Ok(handle);
            }
        }

        *self.state.write().await = ProcessState::Starting;

        let port = match self.claim_port() {
            Ok(port) => port,
            Err(err) => {
                *self.state.write().await = ProcessState::Stopped;
                return Err(err);
            }
        };

        tracing::info!(
            "starting target agent from {} on port {}",
            self.config.binary_path.display(),
            port
        );

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(&self.config.args);
        cmd.args(["--port", &port.to_string()]);
        cmd.env("GAUNTLET_TARGET_PORT", port.to_string());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.state.write().await = ProcessState::Stopped;
                return Err(HarnessError::Launch(format!(
                    "failed to spawn target {}: {e}",
                    self.config.binary_path.display()
                )));
            }
        };
        let pid = child.id();

        // Always drain piped stdio; the child deadlocks once the OS pipe
        // buffer fills otherwise.
        {
            use std::io::{BufRead, BufReader};
            if let Some(stdout) = child.stdout.take() {
                let log_buf = self.log_buffer.clone();
                std::thread::spawn(move || {
                    let reader = BufReader::new(stdout);
                    for line in reader.lines().map_while(|l| l.ok()) {
                        log_buf.push(format!("STDOUT {line}"));
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                let log_buf = self.log_buffer.clone();
                std::thread::spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines().map_while(|l| l.ok()) {
                        log_buf.push(format!("STDERR {line}"));
                    }
                });
            }
        }

        *self.process.lock().await = Some(child);

        match self.wait_for_ready(port).await {
            Ok(()) => {
                let handle = ProcessHandle {
                    pid,
                    port,
                    state: ProcessState::Running,
                };
                *self.handle.write().await = Some(handle.clone());
                *self.state.write().await = ProcessState::Running;
                emit_event(
                    Level::INFO,
                    ProcessKind::Harness,
                    ObservabilityEvent {
                        event: "supervisor.start.ready",
                        component: "supervisor",
                        run_id: None,
                        attempt_index: None,
                        context_id: None,
                        domain: None,
                        task_id: None,
                        status: Some("ok"),
                        error_code: None,
                        detail: Some(&format!("pid={pid} port={port}")),
                    },
                );
                Ok(handle)
            }
            Err(err) => {
                // Reap the half-started child before reporting the failure.
                if let Some(mut child) = self.process.lock().await.take() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                *self.handle.write().await = None;
                *self.state.write().await = ProcessState::Stopped;
                emit_event(
                    Level::WARN,
                    ProcessKind::Harness,
                    ObservabilityEvent {
                        event: "supervisor.start.failed",
                        component: "supervisor",
                        run_id: None,
                        attempt_index: None,
                        context_id: None,
                        domain: None,
                        task_id: None,
                        status: Some("failed"),
                        error_code: Some("LAUNCH_ERROR"),
                        detail: Some(&err.to_string()),
                    },
                );
                Err(err)
            }
        }
    }

    /// Stop the target process. Idempotent: stopping an already-stopped
    /// supervisor is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if *self.state.read().await == ProcessState::Stopped {
            return Ok(());
        }

        *self.state.write().await = ProcessState::Terminating;
        tracing::info!("stopping target agent");

        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill();
            let _ = child.wait();
        }

        *self.handle.write().await = None;
        *self.state.write().await = ProcessState::Stopped;
        Ok(())
    }

    /// Stop, settle, start. Callers invoke this only between attempts —
    /// replacing the process mid-conversation would destroy target state
    /// non-deterministically.
    pub async fn restart(&self) -> Result<ProcessHandle> {
        self.stop().await?;
        tokio::time::sleep(self.config.restart_settle).await;
        self.start().await
    }

    /// One liveness probe against the current handle, with its own short
    /// timeout. Decoupled from the business health of the agent.
    pub async fn health(&self) -> Liveness {
        let Some(handle) = self.handle.read().await.clone() else {
            return Liveness::Down;
        };
        self.probe(handle.port).await
    }

    /// Detect unexpected exit from Running. Called by the aggregator at
    /// attempt boundaries so a crash annotates outcomes instead of being
    /// silently absorbed.
    pub async fn check_alive(&self) -> Result<()> {
        if *self.state.read().await != ProcessState::Running {
            return Ok(());
        }
        let exited = {
            let mut process_guard = self.process.lock().await;
            match process_guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => Some(status.to_string()),
                    Ok(None) => None,
                    Err(e) => Some(format!("status query failed: {e}")),
                },
                None => Some("process handle missing".to_string()),
            }
        };
        let Some(status) = exited else {
            return Ok(());
        };

        *self.process.lock().await = None;
        *self.handle.write().await = None;
        *self.state.write().await = ProcessState::Stopped;

        let tail = self.log_buffer.tail_text(40);
        let detail = if tail.trim().is_empty() {
            format!("target exited unexpectedly ({status})")
        } else {
            format!("target exited unexpectedly ({status})\nrecent logs:\n{tail}")
        };
        emit_event(
            Level::ERROR,
            ProcessKind::Harness,
            ObservabilityEvent {
                event: "supervisor.crash_detected",
                component: "supervisor",
                run_id: None,
                attempt_index: None,
                context_id: None,
                domain: None,
                task_id: None,
                status: Some("crashed"),
                error_code: Some("CRASH_DETECTED"),
                detail: Some(&detail),
            },
        );
        Err(HarnessError::CrashDetected(detail))
    }

    /// Claim the configured port, or an ephemeral one when none is set.
    /// A bound preferred port is a launch failure, not a silent fallback:
    /// whatever is squatting on it would answer our probes.
    fn claim_port(&self) -> Result<u16> {
        let preferred = self.config.preferred_port;
        if preferred != 0 {
            return match std::net::TcpListener::bind(("127.0.0.1", preferred)) {
                Ok(_) => Ok(preferred),
                Err(e) => Err(HarnessError::Launch(format!(
                    "configured port {preferred} is already bound: {e}"
                ))),
            };
        }

        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|e| HarnessError::Launch(format!("failed to find available port: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| HarnessError::Launch(format!("failed to read port: {e}")))?
            .port();
        drop(listener);
        Ok(port)
    }

    async fn probe(&self, port: u16) -> Liveness {
        let url = format!(
            "http://127.0.0.1:{port}{}",
            normalize_path(&self.config.health_path)
        );
        match self.probe_client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Liveness::Up,
            Ok(response) => {
                tracing::trace!("health probe returned status {}", response.status());
                Liveness::Down
            }
            Err(e) => {
                tracing::trace!("health probe failed: {e}");
                Liveness::Down
            }
        }
    }

    async fn wait_for_ready(&self, port: u16) -> Result<()> {
        let start = Instant::now();
        let mut consecutive_up: u32 = 0;

        tracing::debug!("waiting for target readiness on port {port}");

        while start.elapsed() < self.config.startup_timeout {
            // Fail fast if the child exited before becoming healthy.
            {
                let mut process_guard = self.process.lock().await;
                if let Some(child) = process_guard.as_mut() {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            let tail = self.log_buffer.tail_text(40);
                            let detail = if tail.trim().is_empty() {
                                format!("target exited early with status {status}")
                            } else {
                                format!(
                                    "target exited early with status {status}\nrecent logs:\n{tail}"
                                )
                            };
                            return Err(HarnessError::Launch(detail));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("failed to query target process status: {e}");
                        }
                    }
                }
            }

            match self.probe(port).await {
                Liveness::Up => {
                    consecutive_up += 1;
                    if consecutive_up >= self.config.ready_probes {
                        tracing::info!("target ready after {:?}", start.elapsed());
                        return Ok(());
                    }
                }
                Liveness::Down => {
                    consecutive_up = 0;
                }
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        Err(HarnessError::Launch(format!(
            "target did not become healthy within {:?} on port {port}",
            self.config.startup_timeout
        )))
    }
}

#[async_trait]
impl TargetLifecycle for ProcessSupervisor {
    async fn check_alive(&self) -> Result<()> {
        ProcessSupervisor::check_alive(self).await
    }

    async fn restart(&self) -> Result<ProcessHandle> {
        ProcessSupervisor::restart(self).await
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
