//! Scripted stream transport with injected faults.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use opsdeck_core::ports::{StreamFrame, StreamMessage, StreamTransport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::rng::DeterministicRng;

/// Fault injection for simulated stream sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Percentage of frames sent twice.
    pub duplicate_percent: u8,
    /// Percentage of sessions cut short at a random frame.
    pub disconnect_percent: u8,
    /// Percentage of connects refused outright.
    pub refuse_percent: u8,
    /// Percentage of frames preceded by an undecodable frame.
    pub malformed_percent: u8,
    /// Ignore resume cursors and replay the whole log on every connect.
    pub replay_on_reconnect: bool,
    /// Sessions after which no more faults are injected, so every run ends.
    pub faulty_sessions: u32,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            duplicate_percent: 5,
            disconnect_percent: 30,
            refuse_percent: 10,
            malformed_percent: 3,
            replay_on_reconnect: false,
            faulty_sessions: 12,
        }
    }
}

/// What the transport did, for traces and "interesting state" detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub connects: u32,
    pub refused: u32,
    pub disconnects: u32,
    pub resumed: u32,
    pub replayed: u32,
    pub duplicates_sent: u32,
    pub malformed_sent: u32,
    pub frames_sent: u64,
}

struct State {
    rng: DeterministicRng,
    stats: TransportStats,
    /// Keeps the final session's sender alive so the stream stays live.
    held: Option<mpsc::Sender<StreamMessage>>,
    /// Log index to resume from for every event id ever sent.
    cursors: HashMap<String, usize>,
}

/// Plays a fixed event log, honouring resume cursors unless configured to
/// replay.
pub struct ScriptedTransport {
    log: Vec<StreamFrame>,
    fault: FaultConfig,
    state: Mutex<State>,
}

impl ScriptedTransport {
    pub fn new(log: Vec<StreamFrame>, fault: FaultConfig, rng: DeterministicRng) -> Self {
        let cursors = log
            .iter()
            .enumerate()
            .map(|(index, frame)| (frame.event_id.clone(), index + 1))
            .collect();
        Self {
            log,
            fault,
            state: Mutex::new(State {
                rng,
                stats: TransportStats::default(),
                held: None,
                cursors,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> TransportStats {
        self.lock().stats
    }

    fn start_index(&self, state: &mut State, resume_from: Option<&str>) -> usize {
        let Some(cursor) = resume_from else {
            return 0;
        };
        match state.cursors.get(cursor) {
            Some(index) => {
                state.stats.resumed += 1;
                *index
            }
            None => {
                debug!(cursor, "unknown resume cursor; replaying");
                state.stats.replayed += 1;
                0
            }
        }
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(
        &self,
        endpoint: &str,
        resume_from: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<StreamMessage>> {
        let mut state = self.lock();
        state.held = None;
        state.stats.connects += 1;
        let faulty = state.stats.connects <= self.fault.faulty_sessions;

        if faulty && state.rng.chance(self.fault.refuse_percent) {
            state.stats.refused += 1;
            debug!(endpoint, "connect refused");
            anyhow::bail!("connection refused by simulated server");
        }

        let start = self.start_index(&mut state, resume_from);
        let remaining = self.log.len().saturating_sub(start);
        let cut = (faulty && remaining > 0 && state.rng.chance(self.fault.disconnect_percent))
            .then(|| start + state.rng.index(remaining));

        let mut messages = Vec::with_capacity(remaining + 8);
        for (index, frame) in self.log.iter().enumerate().skip(start) {
            if faulty && state.rng.chance(self.fault.malformed_percent) {
                let bad_id = format!("{}~malformed~{}", frame.event_id, state.stats.connects);
                state.cursors.insert(bad_id.clone(), index);
                messages.push(StreamMessage::Event(StreamFrame {
                    event_id: bad_id,
                    payload: json!({"message": "missing id"}),
                }));
                state.stats.malformed_sent += 1;
            }
            messages.push(StreamMessage::Event(frame.clone()));
            state.stats.frames_sent += 1;
            if faulty && state.rng.chance(self.fault.duplicate_percent) {
                messages.push(StreamMessage::Event(frame.clone()));
                state.stats.duplicates_sent += 1;
            }
            if cut == Some(index) {
                messages.push(StreamMessage::Error("simulated disconnect".to_string()));
                state.stats.disconnects += 1;
                break;
            }
        }

        let (tx, rx) = mpsc::channel(messages.len() + 1);
        let disconnected = messages
            .last()
            .is_some_and(|message| matches!(message, StreamMessage::Error(_)));
        for message in messages {
            tx.try_send(message)
                .map_err(|_| anyhow::anyhow!("simulated session overflowed its channel"))?;
        }
        if !disconnected {
            state.held = Some(tx);
        }
        Ok(rx)
    }

    fn supports_resume(&self) -> bool {
        !self.fault.replay_on_reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(n: usize) -> Vec<StreamFrame> {
        (0..n)
            .map(|i| StreamFrame {
                event_id: format!("e{i}"),
                payload: json!({"id": format!("i{i}")}),
            })
            .collect()
    }

    fn quiet() -> FaultConfig {
        FaultConfig {
            duplicate_percent: 0,
            disconnect_percent: 0,
            refuse_percent: 0,
            malformed_percent: 0,
            replay_on_reconnect: false,
            faulty_sessions: 0,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<StreamMessage>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                StreamMessage::Event(frame) => ids.push(frame.event_id),
                StreamMessage::Error(_) => ids.push("!".to_string()),
            }
        }
        ids
    }

    #[tokio::test]
    async fn resume_starts_after_the_cursor() {
        let transport = ScriptedTransport::new(log(4), quiet(), DeterministicRng::new(1));
        let mut rx = transport.connect("/s", Some("e1")).await.unwrap();
        assert_eq!(drain(&mut rx), ["e2", "e3"]);
        assert_eq!(transport.stats().resumed, 1);
    }

    #[tokio::test]
    async fn unknown_cursor_replays_everything() {
        let transport = ScriptedTransport::new(log(3), quiet(), DeterministicRng::new(1));
        let mut rx = transport.connect("/s", Some("zzz")).await.unwrap();
        assert_eq!(drain(&mut rx), ["e0", "e1", "e2"]);
        assert_eq!(transport.stats().replayed, 1);
    }

    #[tokio::test]
    async fn forced_faults_cut_and_duplicate() {
        let fault = FaultConfig {
            duplicate_percent: 100,
            disconnect_percent: 100,
            faulty_sessions: 1,
            ..quiet()
        };
        let transport = ScriptedTransport::new(log(5), fault, DeterministicRng::new(8));
        let mut rx = transport.connect("/s", None).await.unwrap();
        let ids = drain(&mut rx);
        assert_eq!(ids.last().map(String::as_str), Some("!"));
        assert_eq!(ids[0], ids[1]);

        // Past the faulty budget the full log arrives cleanly.
        let mut rx = transport.connect("/s", None).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 5);
    }

    #[tokio::test]
    async fn refusals_are_errors() {
        let fault = FaultConfig {
            refuse_percent: 100,
            faulty_sessions: 2,
            ..quiet()
        };
        let transport = ScriptedTransport::new(log(1), fault, DeterministicRng::new(2));
        assert!(transport.connect("/s", None).await.is_err());
        assert!(transport.connect("/s", None).await.is_err());
        assert!(transport.connect("/s", None).await.is_ok());
        assert_eq!(transport.stats().refused, 2);
    }
}
