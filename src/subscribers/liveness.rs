//! # Stage liveness tracker.
//!
//! Follows stage attempts through the event stream and remembers which stages
//! are in flight and how often they have heartbeated.
//!
//! ```text
//! activity::execute ──► Bus ──► listener ──► LivenessTracker::update()
//!                                                   │
//!                                                   ▼
//!                                      HashMap<stage, StageLiveness>
//!                                      (seq, active, beats, last_beat)
//! ```
//!
//! ## Rules
//! - `StageStarting` marks a stage active; `StageCompleted` / `StageFailed` clear it.
//! - `Heartbeat` bumps the beat counter of its stage.
//! - Events with `seq <= last_seq` for the same stage are rejected as stale.
//! - Reads are eventually consistent with the bus.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Liveness of one stage as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLiveness {
    pub last_seq: u64,
    pub active: bool,
    /// Heartbeats observed across all attempts.
    pub beats: u64,
    pub last_beat: Option<SystemTime>,
    /// Run of the most recent attempt.
    pub run: Option<String>,
}

/// Thread-safe tracker of in-flight stages.
pub struct LivenessTracker {
    state: RwLock<HashMap<String, StageLiveness>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Applies an event; returns `true` if it changed the active flag or beat count.
    pub async fn update(&self, ev: &Event) -> bool {
        if !matches!(
            ev.kind,
            EventKind::StageStarting
                | EventKind::StageCompleted
                | EventKind::StageFailed
                | EventKind::Heartbeat
        ) {
            return false;
        }
        let Some(stage) = ev.stage.as_deref() else {
            return false;
        };

        let mut state = self.state.write().await;
        let entry = state.entry(stage.to_string()).or_insert(StageLiveness {
            last_seq: 0,
            active: false,
            beats: 0,
            last_beat: None,
            run: None,
        });
        if ev.seq <= entry.last_seq {
            return false;
        }
        entry.last_seq = ev.seq;

        match ev.kind {
            EventKind::StageStarting => {
                entry.active = true;
                entry.run = ev.run.as_deref().map(str::to_string);
            }
            EventKind::StageCompleted | EventKind::StageFailed => entry.active = false,
            _ => {
                entry.beats += 1;
                entry.last_beat = Some(ev.at);
            }
        }
        true
    }

    /// Sorted names of stages with an attempt in flight.
    pub async fn snapshot(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut active: Vec<String> = state
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(name, _)| name.clone())
            .collect();
        active.sort_unstable();
        active
    }

    pub async fn is_active(&self, stage: &str) -> bool {
        self.state
            .read()
            .await
            .get(stage)
            .is_some_and(|s| s.active)
    }

    /// Total heartbeats seen for `stage`.
    pub async fn beats(&self, stage: &str) -> u64 {
        self.state.read().await.get(stage).map_or(0, |s| s.beats)
    }

    pub async fn get(&self, stage: &str) -> Option<StageLiveness> {
        self.state.read().await.get(stage).cloned()
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscribe for LivenessTracker {
    async fn on_event(&self, event: &Event) {
        self.update(event).await;
    }

    fn name(&self) -> &'static str {
        "liveness"
    }

    fn queue_capacity(&self) -> usize {
        2048
    }
}
