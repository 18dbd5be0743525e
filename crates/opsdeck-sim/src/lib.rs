//! opsdeck-sim library.
//!
//! Deterministic simulation of the live stream merge engine. A seeded
//! workload is played through a fault-injecting transport into the real
//! [`LiveStreams`] engine on a paused tokio clock, and the merged feed is
//! checked by [`oracle::FeedOracle`].
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `debug!`).

#![forbid(unsafe_code)]

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod transport;
pub mod workload;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use opsdeck_core::config::StreamConfig;
use chrono::{DateTime, Utc};
use opsdeck_core::ports::{ApiResponse, Clock, MutationRequest, RequestPort, StaticIdentity};
use opsdeck_core::query::{QueryCache, QueryEntry, QueryKey};
use opsdeck_core::stream::{LiveStreams, StreamStatus, TotalPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rng::DeterministicRng;
use crate::transport::{FaultConfig, ScriptedTransport, TransportStats};
use crate::workload::{Workload, WorkloadConfig};

pub const FEED_ENDPOINT: &str = "/api/v1/boards/sim/activity/stream";

const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub workload: WorkloadConfig,
    pub fault: FaultConfig,
    /// `jitter_seed` is overwritten with `seed`.
    pub stream: StreamConfig,
    /// Virtual time allowed before the run counts as stalled.
    pub deadline_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            workload: WorkloadConfig::default(),
            fault: FaultConfig::default(),
            stream: StreamConfig {
                base_delay_ms: 100,
                max_delay_ms: 2_000,
                jitter: 0.2,
                max_retries: Some(3),
                resume: true,
                dedup_window: 4_096,
                jitter_seed: None,
            },
            deadline_secs: 3_600,
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Rejects configurations that cannot finish or whose replays would
    /// outgrow the dedup window.
    pub fn validate(&self) -> Result<()> {
        if self.deadline_secs == 0 {
            bail!("deadline_secs must be > 0");
        }
        if self.fault.replay_on_reconnect {
            let ids = self.workload.events * (1 + self.fault.faulty_sessions as usize);
            if self.stream.dedup_window < ids {
                bail!(
                    "dedup_window {} cannot cover {ids} replayed event ids",
                    self.stream.dedup_window
                );
            }
        }
        Ok(())
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub seed: u64,
    pub workload: Workload,
    pub feed: QueryEntry,
    /// The final event was delivered before the deadline.
    pub completed: bool,
    pub last_event_id: Option<String>,
    pub final_status: String,
    pub stats: TransportStats,
    pub manual_retries: u32,
    /// Virtual time the run took.
    pub elapsed: Duration,
    /// At least one fault actually fired.
    pub interesting_state_reached: bool,
}

struct NoReads;

#[async_trait]
impl RequestPort for NoReads {
    async fn list(&self, key: &QueryKey) -> anyhow::Result<ApiResponse> {
        bail!("simulation issues no reads ({key})")
    }

    async fn mutate(&self, request: &MutationRequest) -> anyhow::Result<ApiResponse> {
        bail!("simulation issues no mutations ({})", request.collection)
    }
}

/// Wall clock driven by the paused tokio clock, so `last_updated_at`
/// stamps replay exactly.
struct VirtualClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl VirtualClock {
    /// Must be created inside the simulation runtime.
    fn start() -> Self {
        Self {
            origin: workload::epoch(),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default();
        self.origin + elapsed
    }
}

pub struct Simulator {
    config: SimulationConfig,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns the validation error for an unusable config.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run to completion on a fresh paused single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Fails only when the runtime cannot be built.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .context("failed to build simulation runtime")?;
        Ok(runtime.block_on(self.drive()))
    }

    async fn drive(&self) -> SimulationResult {
        let seed = self.config.seed;
        let mut rng = DeterministicRng::new(seed);
        let workload = Workload::generate(&self.config.workload, &mut rng.fork(1));
        let transport = Arc::new(ScriptedTransport::new(
            workload.log.clone(),
            self.config.fault,
            rng.fork(2),
        ));

        let cache = QueryCache::builder(Arc::new(NoReads))
            .identity(Arc::new(StaticIdentity::signed_in("sim")))
            .clock(Arc::new(VirtualClock::start()))
            .build();
        let key = QueryKey::new("activity").param("board_id", "sim");
        cache.set(
            &key,
            QueryEntry::success(workload.initial.clone(), Some(workload.initial_total), cache.now()),
        );

        let mut stream = self.config.stream.clone();
        stream.jitter_seed = Some(seed);
        let streams = LiveStreams::new(cache.clone(), transport.clone(), stream);
        let subscription = streams.subscribe(FEED_ENDPOINT, key.clone(), TotalPolicy::CountInserts);

        let started = tokio::time::Instant::now();
        let deadline = Duration::from_secs(self.config.deadline_secs);
        let target = workload.last_event_id().map(str::to_string);
        let mut manual_retries = 0_u32;
        let (completed, last_event_id) = loop {
            let last = streams
                .connection(FEED_ENDPOINT)
                .and_then(|connection| connection.last_event_id().map(str::to_string));
            let status = subscription.status();
            if last == target && status.is_live() {
                break (true, last);
            }
            if matches!(status, StreamStatus::Failed(_)) && subscription.retry() {
                manual_retries += 1;
                debug!(seed, manual_retries, "retrying failed stream");
            }
            if started.elapsed() >= deadline {
                break (false, last);
            }
            tokio::time::sleep(POLL).await;
        };

        let feed = cache.get(&key);
        let final_status = subscription.status().to_string();
        drop(subscription);

        let stats = transport.stats();
        let interesting_state_reached = stats.connects > 1
            || stats.duplicates_sent > 0
            || stats.malformed_sent > 0
            || manual_retries > 0;
        info!(seed, completed, connects = stats.connects, "simulation finished");

        SimulationResult {
            seed,
            workload,
            feed,
            completed,
            last_event_id,
            final_status,
            stats,
            manual_retries,
            elapsed: started.elapsed(),
            interesting_state_reached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn replay_needs_a_wide_dedup_window() {
        let mut config = SimulationConfig::default();
        config.fault.replay_on_reconnect = true;
        config.stream.dedup_window = 16;
        assert!(Simulator::new(config).is_err());
    }

    #[test]
    fn clean_run_delivers_everything() {
        let config = SimulationConfig {
            seed: 3,
            fault: FaultConfig {
                duplicate_percent: 0,
                disconnect_percent: 0,
                refuse_percent: 0,
                malformed_percent: 0,
                replay_on_reconnect: false,
                faulty_sessions: 0,
            },
            ..SimulationConfig::default()
        };
        let result = Simulator::new(config).unwrap().run().unwrap();
        assert!(result.completed);
        assert_eq!(result.stats.connects, 1);
        assert!(!result.interesting_state_reached);
        assert_eq!(result.final_status, "live");
        assert_eq!(
            result.feed.items().len(),
            result.workload.initial.len() + result.workload.inserted_ids()
        );
    }

    #[test]
    fn feed_stamps_follow_simulated_time() {
        let config = SimulationConfig {
            seed: 11,
            ..SimulationConfig::default()
        };
        let result = Simulator::new(config).unwrap().run().unwrap();
        let stamp = result.feed.last_updated_at.unwrap();
        let elapsed = chrono::Duration::from_std(result.elapsed).unwrap();
        assert!(stamp >= workload::epoch());
        assert!(stamp <= workload::epoch() + elapsed);
    }
}
