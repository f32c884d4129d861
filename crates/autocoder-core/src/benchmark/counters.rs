//! Per-run progress counters.
//!
//! One instance per benchmark run, shared by its worker tasks. Increments are
//! lock-free; [`BenchmarkCounters::flush`] emits all values as one event.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BenchmarkCounters {
    started: AtomicU64,
    finished: AtomicU64,
    resolved: AtomicU64,
    errored: AtomicU64,
    timed_out: AtomicU64,
    environments_released: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub started: u64,
    pub finished: u64,
    pub resolved: u64,
    pub errored: u64,
    pub timed_out: u64,
    pub environments_released: u64,
}

impl BenchmarkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Environments torn down by forced release.
    pub fn add_released(&self, n: usize) {
        self.environments_released.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Instances currently between start and finish.
    pub fn in_flight(&self) -> u64 {
        let s = self.snapshot();
        s.started.saturating_sub(s.finished)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            started: self.started.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            environments_released: self.environments_released.load(Ordering::Relaxed),
        }
    }

    pub fn flush(&self, run_id: &str) {
        let s = self.snapshot();
        tracing::info!(
            metric = "benchmark.flush",
            run_id = %run_id,
            started = s.started,
            finished = s.finished,
            resolved = s.resolved,
            errored = s.errored,
            timed_out = s.timed_out,
            environments_released = s.environments_released,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_increment() {
        let c = BenchmarkCounters::new();
        c.inc_started();
        c.inc_started();
        c.inc_finished();
        c.add_released(3);
        let s = c.snapshot();
        assert_eq!(s.started, 2);
        assert_eq!(s.finished, 1);
        assert_eq!(s.environments_released, 3);
        assert_eq!(c.in_flight(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let c = Arc::new(BenchmarkCounters::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let c = c.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    c.inc_finished();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(c.snapshot().finished, 1_600);
    }
}
