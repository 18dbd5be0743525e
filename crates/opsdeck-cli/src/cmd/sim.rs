//! `deck sim`: deterministic stream simulation campaigns.

use std::io::{self, Write};
use std::ops::Range;

use anyhow::{Result, bail};
use clap::Args;
use opsdeck_sim::campaign::{CampaignConfig, CampaignReport, replay_seed, run_campaign};
use opsdeck_sim::transport::FaultConfig;
use opsdeck_sim::workload::WorkloadConfig;
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct SimArgs {
    /// Seed range to run, `start..end` (end exclusive).
    #[arg(long, default_value = "0..100", value_parser = parse_seed_range)]
    pub seeds: Range<u64>,

    /// Replay one seed with details instead of running a campaign.
    #[arg(long, conflicts_with = "seeds")]
    pub replay: Option<u64>,

    /// Events streamed per seed.
    #[arg(long, default_value = "60")]
    pub events: usize,

    /// Simulate a server that ignores resume cursors.
    #[arg(long)]
    pub replay_server: bool,

    /// Percentage of sessions cut short.
    #[arg(long, default_value = "30")]
    pub disconnect: u8,

    /// Percentage of frames sent twice.
    #[arg(long, default_value = "5")]
    pub duplicate: u8,
}

fn parse_seed_range(raw: &str) -> Result<Range<u64>, String> {
    let (start, end) = raw
        .split_once("..")
        .ok_or_else(|| format!("expected start..end, got '{raw}'"))?;
    let start: u64 = start.trim().parse().map_err(|_| format!("bad start seed '{start}'"))?;
    let end: u64 = end.trim().parse().map_err(|_| format!("bad end seed '{end}'"))?;
    if end <= start {
        return Err(format!("empty seed range {start}..{end}"));
    }
    Ok(start..end)
}

impl SimArgs {
    fn campaign(&self) -> CampaignConfig {
        CampaignConfig {
            seed_range: self.seeds.clone(),
            workload: WorkloadConfig {
                events: self.events,
                ..WorkloadConfig::default()
            },
            fault: FaultConfig {
                duplicate_percent: self.duplicate.min(100),
                disconnect_percent: self.disconnect.min(100),
                replay_on_reconnect: self.replay_server,
                ..FaultConfig::default()
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    seed: u64,
    passed: bool,
    completed: bool,
    final_status: String,
    items: usize,
    total: Option<u64>,
    connects: u32,
    disconnects: u32,
    refused: u32,
    duplicates_sent: u32,
    malformed_sent: u32,
    manual_retries: u32,
    elapsed_ms: u128,
    violations: Vec<String>,
}

fn write_campaign_text(report: &CampaignReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "seeds={} passed={} interesting={} first_failure={}",
        report.seeds_run,
        report.seeds_passed,
        report.interesting_states_reached,
        report
            .first_failure
            .map_or_else(|| "-".to_string(), |seed| seed.to_string())
    )?;
    for failure in &report.failures {
        for violation in &failure.violations {
            writeln!(w, "{}\t{violation}", failure.seed)?;
        }
    }
    Ok(())
}

fn write_campaign_pretty(report: &CampaignReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Simulation campaign")?;
    pretty_kv(w, "seeds run", report.seeds_run.to_string())?;
    pretty_kv(w, "passed", report.seeds_passed.to_string())?;
    pretty_kv(w, "interesting", report.interesting_states_reached.to_string())?;
    if let Some(seed) = report.first_failure {
        pretty_kv(w, "first failure", seed.to_string())?;
        writeln!(w, "replay with: deck sim --replay {seed}")?;
    }
    Ok(())
}

fn write_replay_text(report: &ReplayReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "seed={} passed={} connects={} disconnects={} manual_retries={} elapsed_ms={}",
        report.seed,
        report.passed,
        report.connects,
        report.disconnects,
        report.manual_retries,
        report.elapsed_ms
    )?;
    for violation in &report.violations {
        writeln!(w, "{violation}")?;
    }
    Ok(())
}

fn write_replay_pretty(report: &ReplayReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Seed {}", report.seed))?;
    pretty_kv(w, "verdict", if report.passed { "pass" } else { "FAIL" })?;
    pretty_kv(w, "stream", &report.final_status)?;
    pretty_kv(w, "items / total", format!("{} / {:?}", report.items, report.total))?;
    pretty_kv(w, "connects", report.connects.to_string())?;
    pretty_kv(w, "refused", report.refused.to_string())?;
    pretty_kv(w, "disconnects", report.disconnects.to_string())?;
    pretty_kv(w, "duplicates", report.duplicates_sent.to_string())?;
    pretty_kv(w, "malformed", report.malformed_sent.to_string())?;
    pretty_kv(w, "manual retries", report.manual_retries.to_string())?;
    pretty_kv(w, "virtual time", format!("{}ms", report.elapsed_ms))?;
    for violation in &report.violations {
        writeln!(w, "  ✗ {violation}")?;
    }
    Ok(())
}

/// # Errors
///
/// Returns an error for invalid parameters or when any seed fails.
pub fn run_sim(args: &SimArgs, output: OutputMode) -> Result<()> {
    let config = args.campaign();

    if let Some(seed) = args.replay {
        let trace = replay_seed(seed, &config)?;
        let result = &trace.result;
        let report = ReplayReport {
            seed,
            passed: trace.oracle.passed,
            completed: result.completed,
            final_status: result.final_status.clone(),
            items: result.feed.items().len(),
            total: result.feed.total,
            connects: result.stats.connects,
            disconnects: result.stats.disconnects,
            refused: result.stats.refused,
            duplicates_sent: result.stats.duplicates_sent,
            malformed_sent: result.stats.malformed_sent,
            manual_retries: result.manual_retries,
            elapsed_ms: result.elapsed.as_millis(),
            violations: trace.oracle.violations.iter().map(ToString::to_string).collect(),
        };
        render_mode(output, &report, write_replay_text, write_replay_pretty)?;
        if !report.passed {
            bail!("seed {seed} violated {} invariant(s)", report.violations.len());
        }
        return Ok(());
    }

    let report = run_campaign(&config)?;
    render_mode(output, &report, write_campaign_text, write_campaign_pretty)?;
    if let Some(seed) = report.first_failure {
        bail!(
            "{} of {} seeds failed; first failing seed {seed}",
            report.failures.len(),
            report.seeds_run
        );
    }
    Ok(())
}
