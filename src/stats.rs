//! Run counters and timing

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Skipped,
    Failed,
}

/// Lock-free counters shared by parallel workers; each worker only adds,
/// the owner reads a [`CounterSnapshot`] once the batch is done
#[derive(Debug, Default)]
pub struct RunCounters {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Processed => &self.processed,
            Outcome::Skipped => &self.skipped,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl CounterSnapshot {
    pub fn total(&self) -> u64 {
        self.processed + self.skipped + self.failed
    }
}

/// Wall-clock time of a run, split into named phases
#[derive(Debug)]
pub struct PhaseTimer {
    started: Instant,
    lap_start: Instant,
    phases: Vec<(&'static str, Duration)>,
}

impl PhaseTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            lap_start: now,
            phases: Vec::new(),
        }
    }

    /// Close the running phase under `name` and begin the next one
    pub fn lap(&mut self, name: &'static str) -> Duration {
        let now = Instant::now();
        let took = now - self.lap_start;
        self.lap_start = now;
        self.phases.push((name, took));
        took
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }
}
