//! Run stages and their timing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Macro-protocol stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SetupCheck,
    Priming,
    Baseline,
    FirstSample,
    SamplingLoop,
    Stopping,
    Cleaning,
    ShutDown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SetupCheck => "setup check",
            Stage::Priming => "priming",
            Stage::Baseline => "baseline",
            Stage::FirstSample => "first sample",
            Stage::SamplingLoop => "sampling loop",
            Stage::Stopping => "stopping",
            Stage::Cleaning => "cleaning",
            Stage::ShutDown => "shut down",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    /// Offset from the start of the run
    pub offset_s: f64,
}

/// Stage history of one run
///
/// Offsets come from the tokio clock, so a paused test clock yields the
/// simulated durations.
#[derive(Debug)]
pub struct Timeline {
    origin: Instant,
    started_at: DateTime<Utc>,
    stages: Vec<StageRecord>,
}

impl Timeline {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            started_at: Utc::now(),
            stages: Vec::new(),
        }
    }

    pub fn enter(&mut self, stage: Stage) {
        let offset = self.elapsed();
        info!(stage = %stage, offset_s = offset.as_secs_f64(), "Entering stage");
        self.stages.push(StageRecord {
            stage,
            started_at: Utc::now(),
            offset_s: offset.as_secs_f64(),
        });
    }

    pub fn current(&self) -> Option<Stage> {
        self.stages.last().map(|record| record.stage)
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }
}

/// Sampling loop clock; starts when the loop is entered
#[derive(Debug, Clone, Copy)]
pub struct LoopClock {
    started: Instant,
    budget: Duration,
}

impl LoopClock {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Past the middle of the budget
    pub fn past_midpoint(&self) -> bool {
        self.elapsed() > self.budget / 2
    }
}
