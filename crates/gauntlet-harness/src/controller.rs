use rand::seq::SliceRandom;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use gauntlet_env::{EnvironmentConfig, HttpEnvironment};
use gauntlet_observability::{emit_event, ObservabilityEvent, ProcessKind};
use gauntlet_peer::HttpPeerChannel;
use gauntlet_supervisor::{ProcessSupervisor, TargetLifecycle};
use gauntlet_types::{BattleSummary, EvalEvent, PassKReport, Result, TaskRef};

use crate::aggregator::run_pass_k;
use crate::config::{EvalConfig, RunMode};
use crate::events::{BattleReporter, EventBus};

#[derive(Debug, Clone)]
pub enum RunOutput {
    Single(Box<PassKReport>),
    Battle(BattleSummary),
}

/// Top-level coordinator: wires supervisor, environment, peer channel, and
/// aggregator per configuration. Sequencing only — no scoring logic lives
/// here.
pub struct EvaluationController {
    config: EvalConfig,
    bus: EventBus,
}

impl EvaluationController {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            config,
            bus: EventBus::new(),
        }
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutput> {
        self.config.validate()?;

        // Forward progress to the external battle sink, best-effort.
        let reporter = match self.config.report_config() {
            Some(report_config) => {
                let reporter = BattleReporter::new(report_config).map_err(|e| {
                    gauntlet_types::HarnessError::Config(format!("bad report sink: {e}"))
                })?;
                let mut rx = self.bus.subscribe();
                let forward = std::sync::Arc::new(reporter);
                let sink = forward.clone();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        sink.progress(&event).await;
                    }
                });
                Some(forward)
            }
            None => None,
        };

        let tasks = self.select_tasks()?;

        // Total supervisor unavailability is the one launch failure that is
        // a run-level error rather than an attempt outcome.
        let supervisor = ProcessSupervisor::new(self.config.supervisor_config())?;
        let handle = supervisor.start().await?;

        let mut env = HttpEnvironment::new(EnvironmentConfig {
            base_url: self.config.env_url.clone(),
            request_timeout: self.config.step_timeout(),
        })?;
        let peer = HttpPeerChannel::for_port(
            handle.port,
            &self.config.target.message_path,
            self.config.step_timeout(),
        )?;

        let pass_k_config = self.config.pass_k_config();
        let mut reports = Vec::with_capacity(tasks.len());

        for (index, task_ref) in tasks.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            emit_event(
                Level::INFO,
                ProcessKind::Harness,
                ObservabilityEvent {
                    event: "battle.started",
                    component: "controller",
                    run_id: None,
                    attempt_index: None,
                    context_id: None,
                    domain: Some(task_ref.domain.as_str()),
                    task_id: Some(task_ref.task_id),
                    status: Some("start"),
                    error_code: None,
                    detail: Some(&format!("battle {}/{}", index + 1, tasks.len())),
                },
            );

            let report = run_pass_k(
                &mut env,
                &peer,
                Some(&supervisor as &dyn TargetLifecycle),
                *task_ref,
                &pass_k_config,
                &cancel,
                &self.bus,
            )
            .await;

            let report = match report {
                Ok(report) => report,
                Err(err) => {
                    // Run-level failure: stop the target before propagating.
                    let _ = supervisor.stop().await;
                    return Err(err);
                }
            };

            if let Some(reporter) = &reporter {
                reporter.report_result(&report).await;
            }
            reports.push(report);
        }

        supervisor.stop().await?;
        self.bus.publish(EvalEvent::new(
            "controller.finished",
            json!({"battles": reports.len()}),
        ));

        build_output(self.config.mode, reports)
    }

    fn select_tasks(&self) -> Result<Vec<TaskRef>> {
        match self.config.mode {
            RunMode::Manual => match (self.config.domain, self.config.task_id) {
                (Some(domain), Some(task_id)) => Ok(vec![TaskRef { domain, task_id }]),
                _ => Err(gauntlet_types::HarnessError::Config(
                    "manual mode requires domain and task_id".to_string(),
                )),
            },
            RunMode::Random => Ok(sample_tasks(
                &self.config.task_set,
                self.config.num_battles as usize,
            )),
        }
    }
}

/// An abort before the first battle finishes leaves a manual run with no
/// report to hand back; that is an operator cancellation, not a
/// configuration problem.
fn build_output(mode: RunMode, reports: Vec<PassKReport>) -> Result<RunOutput> {
    match mode {
        RunMode::Manual => {
            let report = reports.into_iter().next().ok_or_else(|| {
                gauntlet_types::HarnessError::Aborted(
                    "run cancelled before the first battle finished".to_string(),
                )
            })?;
            Ok(RunOutput::Single(Box::new(report)))
        }
        RunMode::Random => Ok(RunOutput::Battle(BattleSummary::from_reports(reports))),
    }
}

/// Sample `count` distinct tasks without replacement.
fn sample_tasks(task_set: &[TaskRef], count: usize) -> Vec<TaskRef> {
    let mut pool: Vec<TaskRef> = task_set.to_vec();
    pool.shuffle(&mut rand::thread_rng());
    pool.truncate(count);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::Domain;

    fn pool(n: u32) -> Vec<TaskRef> {
        (0..n)
            .map(|task_id| TaskRef {
                domain: Domain::Retail,
                task_id,
            })
            .collect()
    }

    #[test]
    fn manual_run_with_no_reports_is_an_abort_not_a_config_error() {
        let err = build_output(RunMode::Manual, Vec::new()).unwrap_err();
        assert!(matches!(err, gauntlet_types::HarnessError::Aborted(_)));
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn random_run_with_no_reports_yields_an_empty_summary() {
        let output = build_output(RunMode::Random, Vec::new()).unwrap();
        match output {
            RunOutput::Battle(summary) => assert!(summary.reports.is_empty()),
            other => panic!("expected battle summary, got {other:?}"),
        }
    }

    #[test]
    fn sample_tasks_draws_distinct_tasks() {
        let pool = pool(10);
        let sampled = sample_tasks(&pool, 6);
        assert_eq!(sampled.len(), 6);
        let unique: std::collections::HashSet<_> = sampled.iter().collect();
        assert_eq!(unique.len(), 6);
        for task in &sampled {
            assert!(pool.contains(task));
        }
    }

    #[test]
    fn sample_tasks_with_full_pool_is_a_permutation() {
        let pool = pool(4);
        let mut sampled = sample_tasks(&pool, 4);
        sampled.sort_by_key(|t| t.task_id);
        assert_eq!(sampled, pool);
    }
}
