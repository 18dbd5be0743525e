//! Seed campaigns.
//!
//! Runs many seeds with one fault profile, collecting pass/fail results and
//! the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::oracle::{FeedOracle, InvariantViolation, OracleResult};
use crate::transport::FaultConfig;
use crate::workload::WorkloadConfig;
use crate::{SimulationConfig, SimulationResult, Simulator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    pub workload: WorkloadConfig,
    pub fault: FaultConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            workload: WorkloadConfig::default(),
            fault: FaultConfig::default(),
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            workload: self.workload,
            fault: self.fault,
            ..SimulationConfig::default()
        }
    }

    /// # Errors
    ///
    /// Returns an error for an empty seed range or an unusable per-seed
    /// config.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// Lowest failing seed, replayed first when debugging.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A replayed seed with its oracle verdict.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Oracle verdict for a finished run, including stalls.
pub fn judge(result: &SimulationResult) -> OracleResult {
    let mut oracle = FeedOracle::check_all(&result.feed, &result.workload);
    if !result.completed {
        oracle.passed = false;
        oracle.violations.insert(
            0,
            InvariantViolation::Stalled {
                last_seen: result.last_event_id.clone(),
            },
        );
    }
    oracle
}

/// Run every seed in the range.
///
/// # Errors
///
/// Returns an error if validation fails or a runtime cannot be built.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let trace = replay_seed(seed, config)?;
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        if trace.oracle.passed {
            report.seeds_passed += 1;
            continue;
        }
        warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
        report.first_failure.get_or_insert(seed);
        report.failures.push(SeedFailure {
            seed,
            violations: trace
                .oracle
                .violations
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        "campaign finished"
    );
    Ok(report)
}

/// Run one seed and return its result with the oracle verdict.
///
/// # Errors
///
/// Returns an error when the config is invalid or the runtime cannot be
/// built.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let oracle = judge(&result);
    Ok(DetailedTrace { result, oracle })
}
