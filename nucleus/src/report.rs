//! Aggregated results of an experiment run.

use std::fmt;
use std::time::Duration;

use crate::error::{NucleusError, NucleusResult};

/// Metrics recorded for one successfully completed scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioMetrics {
    /// Wall-clock time spent running the scenario's simulation.
    pub wall_time: Duration,
    /// Simulation time when the run ended.
    pub final_time: f64,
    /// Number of plan callbacks executed.
    pub plans_executed: u64,
    /// Number of output items released.
    pub output_items: u64,
}

/// The terminal record of one scenario: its identity, seed, metadata, and
/// either metrics or the error that aborted it.
#[derive(Debug)]
pub struct ScenarioOutcome {
    /// The scenario's stable sequential id.
    pub scenario_id: usize,
    /// The seed the scenario's RNG stream was initialized with, kept so a
    /// failing scenario can be replayed in isolation.
    pub seed: u64,
    /// Concatenated metadata strings of the scenario's dimension levels.
    pub meta_data: Vec<String>,
    /// Metrics on success, the aborting error otherwise.
    pub result: NucleusResult<ScenarioMetrics>,
}

/// Aggregated report over every scenario an experiment ran.
///
/// Outcomes are ordered by scenario id regardless of completion order.
#[derive(Debug)]
pub struct ExperimentReport {
    scenario_count: usize,
    outcomes: Vec<ScenarioOutcome>,
}

impl ExperimentReport {
    pub(crate) fn new(scenario_count: usize, mut outcomes: Vec<ScenarioOutcome>) -> Self {
        outcomes.sort_by_key(|outcome| outcome.scenario_id);
        Self {
            scenario_count,
            outcomes,
        }
    }

    /// Total number of scenarios the experiment planned (the cross product of
    /// dimension level counts).
    pub fn scenario_count(&self) -> usize {
        self.scenario_count
    }

    /// Per-scenario outcomes, ordered by scenario id. Scenarios skipped after
    /// a batch abort have no outcome.
    pub fn outcomes(&self) -> &[ScenarioOutcome] {
        &self.outcomes
    }

    /// Number of scenarios that completed without error.
    pub fn successes(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count()
    }

    /// Number of scenarios that aborted with an error.
    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }

    /// Number of planned scenarios that never ran (batch aborted first).
    pub fn skipped(&self) -> usize {
        self.scenario_count - self.outcomes.len()
    }

    /// Fraction of planned scenarios that completed without error.
    pub fn success_rate(&self) -> f64 {
        if self.scenario_count == 0 {
            return 1.0;
        }
        self.successes() as f64 / self.scenario_count as f64
    }

    /// `true` when every planned scenario ran and succeeded.
    pub fn is_success(&self) -> bool {
        self.failures() == 0 && self.skipped() == 0
    }

    /// Sum of plan callbacks executed across successful scenarios.
    pub fn total_plans_executed(&self) -> u64 {
        self.metrics().map(|m| m.plans_executed).sum()
    }

    /// Sum of output items released across successful scenarios.
    pub fn total_output_items(&self) -> u64 {
        self.metrics().map(|m| m.output_items).sum()
    }

    /// The first error among failed scenarios, if any, with its scenario id.
    pub fn first_failure(&self) -> Option<(usize, &NucleusError)> {
        self.outcomes.iter().find_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|err| (outcome.scenario_id, err))
        })
    }

    fn metrics(&self) -> impl Iterator<Item = &ScenarioMetrics> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok())
    }
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "experiment: {}/{} scenarios succeeded ({:.1}%), {} failed, {} skipped",
            self.successes(),
            self.scenario_count,
            self.success_rate() * 100.0,
            self.failures(),
            self.skipped(),
        )?;
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(metrics) => writeln!(
                    f,
                    "  scenario {} [seed {}]: ok, final time {}, {} plans, {} outputs ({:?})",
                    outcome.scenario_id,
                    outcome.seed,
                    metrics.final_time,
                    metrics.plans_executed,
                    metrics.output_items,
                    metrics.wall_time,
                )?,
                Err(err) => writeln!(
                    f,
                    "  scenario {} [seed {}]: FAILED: {err}",
                    outcome.scenario_id, outcome.seed,
                )?,
            }
        }
        Ok(())
    }
}
