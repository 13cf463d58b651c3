use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use gauntlet_env::TaskEnvironment;
use gauntlet_observability::{emit_event, ObservabilityEvent, ProcessKind};
use gauntlet_peer::PeerChannel;
use gauntlet_supervisor::TargetLifecycle;
use gauntlet_types::{
    AttemptOutcome, EvalEvent, FailureCategory, HarnessError, PassKReport, Result, TaskRef, Winner,
};

use crate::driver::{run_attempt, DriverConfig};
use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct PassKConfig {
    /// Number of attempts. Must be even and at least 2: pass^(k/2) is
    /// defined over an integer half.
    pub k: u32,
    /// Restart the target between attempts. Never mid-attempt.
    pub restart_between_attempts: bool,
    /// Fixed settle delay between attempts, letting the target release
    /// resources. Stability trade-off, not a correctness requirement.
    pub inter_attempt_delay: Duration,
    pub driver: DriverConfig,
}

impl Default for PassKConfig {
    fn default() -> Self {
        Self {
            k: 4,
            restart_between_attempts: false,
            inter_attempt_delay: Duration::from_secs(2),
            driver: DriverConfig::default(),
        }
    }
}

/// Context ids are derived from a monotonically increasing counter plus a
/// random suffix, so uniqueness within a run is structural rather than
/// probabilistic, and the peer cannot correlate attempts by conversation
/// identity.
pub struct ContextIdGenerator {
    counter: AtomicU64,
}

impl ContextIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("atk-{n}-{}", Uuid::new_v4())
    }
}

impl Default for ContextIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Strict pass^k: every one of the first k attempts, in order, succeeded.
pub fn pass_k_metric(successes: &[bool], k: usize) -> bool {
    successes.len() == k && successes.iter().all(|s| *s)
}

/// pass^(k/2): some contiguous window of length half is all successes.
pub fn pass_half_k_metric(successes: &[bool], half: usize) -> bool {
    if half == 0 || successes.len() < half {
        return false;
    }
    successes.windows(half).any(|w| w.iter().all(|s| *s))
}

/// Run the protocol driver k times with isolated contexts and aggregate
/// reliability metrics.
///
/// Attempts execute strictly sequentially; outcomes are appended in
/// execution order, which pass^k depends on. Attempt failures are contained
/// to their outcome — a completed run always records exactly k outcomes.
#[allow(clippy::too_many_arguments)]
pub async fn run_pass_k(
    env: &mut dyn TaskEnvironment,
    peer: &dyn PeerChannel,
    supervisor: Option<&dyn TargetLifecycle>,
    task_ref: TaskRef,
    config: &PassKConfig,
    cancel: &CancellationToken,
    bus: &EventBus,
) -> Result<PassKReport> {
    if config.k < 2 || config.k % 2 != 0 {
        return Err(HarnessError::Config(format!(
            "k must be even and >= 2, got {}",
            config.k
        )));
    }

    let run_id = Uuid::new_v4().to_string();
    let context_ids = ContextIdGenerator::new();
    let mut attempts: Vec<AttemptOutcome> = Vec::with_capacity(config.k as usize);
    let mut aborted = false;

    bus.publish(EvalEvent::new(
        "run.started",
        json!({
            "run_id": run_id,
            "domain": task_ref.domain,
            "task_id": task_ref.task_id,
            "k": config.k,
        }),
    ));

    for attempt_index in 0..config.k {
        // Cancellation is honored at attempt boundaries; a cut run is
        // flagged rather than padded with fabricated outcomes.
        if cancel.is_cancelled() {
            aborted = true;
            break;
        }

        if attempt_index > 0 {
            tokio::time::sleep(config.inter_attempt_delay).await;
        }

        let context_id = context_ids.next_id();
        emit_event(
            Level::INFO,
            ProcessKind::Harness,
            ObservabilityEvent {
                event: "attempt.started",
                component: "aggregator",
                run_id: Some(&run_id),
                attempt_index: Some(attempt_index + 1),
                context_id: Some(&context_id),
                domain: Some(task_ref.domain.as_str()),
                task_id: Some(task_ref.task_id),
                status: Some("start"),
                error_code: None,
                detail: None,
            },
        );
        bus.publish(EvalEvent::new(
            "attempt.started",
            json!({
                "run_id": run_id,
                "attempt": attempt_index + 1,
                "total_attempts": config.k,
                "context_id": context_id,
            }),
        ));

        if let Some(category) =
            prepare_target(supervisor, config.restart_between_attempts, attempt_index).await
        {
            bus.publish(EvalEvent::new(
                "attempt.finished",
                json!({
                    "context_id": context_id,
                    "success": false,
                    "reward": 0.0,
                    "step_count": 0,
                    "failure_category": category,
                }),
            ));
            attempts.push(AttemptOutcome::failed(context_id, category));
            continue;
        }

        let outcome = run_attempt(
            env,
            peer,
            task_ref,
            &context_id,
            &config.driver,
            cancel,
            bus,
        )
        .await;
        attempts.push(outcome);
    }

    let report = build_report(run_id, task_ref, attempts, config.k, aborted);

    bus.publish(EvalEvent::new(
        "run.finished",
        json!({
            "run_id": report.run_id,
            "pass_k": report.pass_k,
            "pass_half_k": report.pass_half_k,
            "success_rate": report.success_rate,
            "winner": report.winner,
            "aborted": report.aborted,
        }),
    ));

    Ok(report)
}

/// Make sure the target is alive before an attempt starts. Restarts only
/// ever happen here, at the attempt boundary.
async fn prepare_target(
    supervisor: Option<&dyn TargetLifecycle>,
    restart_between_attempts: bool,
    attempt_index: u32,
) -> Option<FailureCategory> {
    let supervisor = supervisor?;

    let crashed = supervisor.check_alive().await.is_err();
    let wants_restart = restart_between_attempts && attempt_index > 0;

    if crashed && !wants_restart {
        // Crash is fatal to the upcoming attempt when no restart policy can
        // bring the target back.
        return Some(FailureCategory::CommunicationError);
    }

    if crashed || wants_restart {
        if let Err(err) = supervisor.restart().await {
            tracing::warn!("target restart before attempt {} failed: {err}", attempt_index + 1);
            return Some(FailureCategory::CommunicationError);
        }
    }

    None
}

fn build_report(
    run_id: String,
    task_ref: TaskRef,
    attempts: Vec<AttemptOutcome>,
    k: u32,
    aborted: bool,
) -> PassKReport {
    let successes: Vec<bool> = attempts.iter().map(|a| a.success).collect();
    let half = (k / 2) as usize;

    let success_count = successes.iter().filter(|s| **s).count();
    let success_rate = if attempts.is_empty() {
        0.0
    } else {
        success_count as f64 / attempts.len() as f64
    };

    let mut failure_histogram: BTreeMap<FailureCategory, u64> = BTreeMap::new();
    for outcome in attempts.iter().filter(|a| !a.success) {
        if let Some(category) = outcome.failure_category {
            *failure_histogram.entry(category).or_insert(0) += 1;
        }
    }

    // A single success credits the target with capability; zero successes
    // is definitive failure.
    let winner = if success_rate > 0.0 {
        Winner::Target
    } else {
        Winner::Evaluator
    };

    PassKReport {
        run_id,
        domain: task_ref.domain,
        task_id: task_ref.task_id,
        pass_k: pass_k_metric(&successes, k as usize),
        pass_half_k: pass_half_k_metric(&successes, half),
        success_rate,
        failure_histogram,
        winner,
        aborted,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::Domain;

    const T: bool = true;
    const F: bool = false;

    #[test]
    fn pass_k_requires_every_attempt_in_order() {
        assert!(pass_k_metric(&[T, T, T, T], 4));
        assert!(!pass_k_metric(&[F, T, T, F], 4));
        assert!(!pass_k_metric(&[T, T], 4));
    }

    #[test]
    fn pass_half_k_finds_any_contiguous_window() {
        // S=[F,T,T,F], k=4: window [1,2] is all successes.
        assert!(pass_half_k_metric(&[F, T, T, F], 2));
        // S=[T,F,F,T], k=4: no window of 2.
        assert!(!pass_half_k_metric(&[T, F, F, T], 2));
        assert!(pass_half_k_metric(&[T, T, T, T], 2));
        assert!(!pass_half_k_metric(&[F, F, F, F], 2));
        // window at the tail
        assert!(pass_half_k_metric(&[F, F, T, T], 2));
        // fewer attempts than the window
        assert!(!pass_half_k_metric(&[T], 2));
    }

    #[test]
    fn context_ids_are_unique_under_rapid_generation() {
        let generator = ContextIdGenerator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generator.next_id()));
        }
    }

    #[test]
    fn context_ids_embed_monotonic_counter() {
        let generator = ContextIdGenerator::new();
        let first = generator.next_id();
        let second = generator.next_id();
        assert!(first.starts_with("atk-0-"));
        assert!(second.starts_with("atk-1-"));
    }

    fn outcome(success: bool, category: Option<FailureCategory>) -> AttemptOutcome {
        AttemptOutcome {
            context_id: "atk".to_string(),
            success,
            reward: if success { 1.0 } else { 0.0 },
            step_count: 1,
            wall_time_ms: 1,
            failure_category: category,
        }
    }

    fn task_ref() -> TaskRef {
        TaskRef {
            domain: Domain::Retail,
            task_id: 1,
        }
    }

    #[test]
    fn report_for_mixed_outcomes_matches_metric_definitions() {
        // S=[T,F,F,T], k=4 => pass_4=false, pass_2=false, rate=0.5.
        let attempts = vec![
            outcome(true, None),
            outcome(false, Some(FailureCategory::Timeout)),
            outcome(false, Some(FailureCategory::FormatError)),
            outcome(true, None),
        ];
        let report = build_report("r".to_string(), task_ref(), attempts, 4, false);
        assert!(!report.pass_k);
        assert!(!report.pass_half_k);
        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.winner, Winner::Target);
        assert_eq!(report.failure_histogram[&FailureCategory::Timeout], 1);
        assert_eq!(report.failure_histogram[&FailureCategory::FormatError], 1);
    }

    #[test]
    fn report_for_all_successes() {
        let attempts = vec![
            outcome(true, None),
            outcome(true, None),
            outcome(true, None),
            outcome(true, None),
        ];
        let report = build_report("r".to_string(), task_ref(), attempts, 4, false);
        assert!(report.pass_k);
        assert!(report.pass_half_k);
        assert_eq!(report.success_rate, 1.0);
        assert!(report.failure_histogram.is_empty());
    }

    #[test]
    fn report_for_all_failures_credits_evaluator() {
        let attempts = vec![
            outcome(false, Some(FailureCategory::Timeout)),
            outcome(false, Some(FailureCategory::Timeout)),
        ];
        let report = build_report("r".to_string(), task_ref(), attempts, 2, false);
        assert_eq!(report.winner, Winner::Evaluator);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.failure_histogram[&FailureCategory::Timeout], 2);
    }

    #[test]
    fn aborted_report_does_not_claim_pass_k() {
        let attempts = vec![outcome(true, None)];
        let report = build_report("r".to_string(), task_ref(), attempts, 4, true);
        assert!(report.aborted);
        assert!(!report.pass_k);
        assert_eq!(report.attempts.len(), 1);
    }
}
