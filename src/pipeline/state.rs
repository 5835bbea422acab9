//! Daemon-wide mutable state: the cooperative stop flag and rolling counters
//!
//! Both live in a `DaemonContext` that the consumption loop owns and lends to
//! the record handler; there are no process-global singletons.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop signal, sampled between records
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Named counters reported as one status line per interval
///
/// Counters reset to zero after each emission; names seen once stay in the
/// line so a quiet period shows explicit zeros.
#[derive(Debug)]
pub struct DaemonStats {
    counters: BTreeMap<&'static str, u64>,
    last_emit: Instant,
    interval: Duration,
}

impl DaemonStats {
    pub fn new(interval: Duration) -> Self {
        Self {
            counters: BTreeMap::new(),
            last_emit: Instant::now(),
            interval,
        }
    }

    pub fn incr(&mut self, name: &'static str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&mut self, name: &'static str, value: u64) {
        *self.counters.entry(name).or_insert(0) += value;
    }

    /// Overwrite a gauge-style value (e.g. a queue depth)
    pub fn set(&mut self, name: &'static str, value: u64) {
        self.counters.insert(name, value);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn is_due(&self) -> bool {
        self.last_emit.elapsed() > self.interval
    }

    /// `name:value | name:value` summary of the current counters
    pub fn summary(&self) -> String {
        self.counters
            .iter()
            .map(|(name, value)| format!("{}:{}", name, value))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Log the summary line if the interval elapsed, then reset counters
    ///
    /// Returns the emitted line.
    pub fn show_status(&mut self) -> Option<String> {
        if !self.is_due() {
            return None;
        }
        Some(self.emit())
    }

    /// Log and reset unconditionally
    pub fn emit(&mut self) -> String {
        let line = self.summary();
        log::info!("now: {}", line);
        self.last_emit = Instant::now();
        for value in self.counters.values_mut() {
            *value = 0;
        }
        line
    }
}

/// Everything the consumption loop shares with its record handler
#[derive(Debug)]
pub struct DaemonContext {
    pub stop: StopFlag,
    pub stats: DaemonStats,
}

impl DaemonContext {
    pub fn new(stop: StopFlag, status_interval: Duration) -> Self {
        Self {
            stop,
            stats: DaemonStats::new(status_interval),
        }
    }

    /// Break the run loop at the next possible opportunity
    pub fn is_stopping(&self) -> bool {
        self.stop.is_set()
    }
}
