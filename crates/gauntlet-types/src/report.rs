use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attempt::{AttemptOutcome, FailureCategory};
use crate::task::Domain;

/// Which party a completed run is credited to. The target wins if it solved
/// the task at least once; zero successes credit the evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Target,
    Evaluator,
}

/// The persisted result of one pass@k run. Built once at the end of a run
/// and never mutated afterwards; its serialized shape is the contract for
/// downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassKReport {
    pub run_id: String,
    pub domain: Domain,
    pub task_id: u32,
    pub attempts: Vec<AttemptOutcome>,
    pub pass_k: bool,
    pub pass_half_k: bool,
    pub success_rate: f64,
    pub failure_histogram: BTreeMap<FailureCategory, u64>,
    pub winner: Winner,
    /// True only when an operator abort cut the run short; an aborted report
    /// may hold fewer than k attempts.
    #[serde(default)]
    pub aborted: bool,
}

/// Aggregate view over the reports of one randomized multi-task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleSummary {
    pub reports: Vec<PassKReport>,
    pub mean_success_rate: f64,
    pub min_success_rate: f64,
    pub max_success_rate: f64,
}

impl BattleSummary {
    pub fn from_reports(reports: Vec<PassKReport>) -> Self {
        let rates: Vec<f64> = reports.iter().map(|r| r.success_rate).collect();
        let mean = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };
        let min = rates.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = rates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self {
            reports,
            mean_success_rate: mean,
            min_success_rate: if min.is_finite() { min } else { 0.0 },
            max_success_rate: if max.is_finite() { max } else { 0.0 },
        }
    }
}
