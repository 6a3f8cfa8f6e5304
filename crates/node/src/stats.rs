use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chainsync_primitives::ChainId;
use serde::{Deserialize, Serialize};

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct SyncMetrics {
    blocks: AtomicU64,
    transactions: AtomicU64,
    reorgs: AtomicU64,
    failures: AtomicU64,
    missing_waits: AtomicU64,
    passes: AtomicU64,
    last_height: AtomicU64,
}

impl SyncMetrics {
    pub fn record_block(&self, height: u64, transactions: u64) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.transactions.fetch_add(transactions, Ordering::Relaxed);
        self.last_height.store(height, Ordering::Relaxed);
    }

    pub fn record_reorg(&self) {
        self.reorgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missing_wait(&self) {
        self.missing_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks: self.blocks.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            missing_waits: self.missing_waits.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            last_height: self.last_height.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub blocks: u64,
    pub transactions: u64,
    pub reorgs: u64,
    pub failures: u64,
    pub missing_waits: u64,
    pub passes: u64,
    pub last_height: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Throughput line emitted while a pass is catching up.
#[derive(Clone, Debug)]
pub struct ProgressReport {
    pub chain: ChainId,
    pub blocks: u64,
    pub elapsed: Duration,
    pub height: u64,
}

impl ProgressReport {
    pub fn blocks_per_minute(&self) -> f64 {
        let minutes = self.elapsed.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.blocks as f64 / minutes
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Syncing... | Chain: {} | Network: {} |{:>8.2} blocks/min | Height: {:>7}",
            self.chain.chain,
            self.chain.network,
            self.blocks_per_minute(),
            self.height
        )
    }
}

/// Lets one report through per interval.
#[derive(Debug)]
pub struct ProgressLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_primitives::Network;

    #[test]
    fn report_formats_throughput() {
        let report = ProgressReport {
            chain: ChainId::new("XQC", Network::Mainnet),
            blocks: 120,
            elapsed: Duration::from_secs(30),
            height: 4521,
        };
        assert!((report.blocks_per_minute() - 240.0).abs() < f64::EPSILON);
        assert_eq!(
            report.to_string(),
            "Syncing... | Chain: XQC | Network: mainnet |  240.00 blocks/min | Height:    4521"
        );

        let instant = ProgressReport {
            elapsed: Duration::ZERO,
            ..report
        };
        assert_eq!(instant.blocks_per_minute(), 0.0);
    }

    #[test]
    fn limiter_allows_one_report_per_interval() {
        let mut limiter = ProgressLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(limiter.ready(start));
        assert!(!limiter.ready(start + Duration::from_millis(500)));
        assert!(limiter.ready(start + Duration::from_millis(1000)));
        assert!(!limiter.ready(start + Duration::from_millis(1999)));
    }

    #[test]
    fn metrics_snapshot() {
        let metrics = SyncMetrics::default();
        metrics.record_block(10, 3);
        metrics.record_block(11, 1);
        metrics.record_reorg();
        metrics.record_failure();
        metrics.record_missing_wait();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.blocks, 2);
        assert_eq!(snapshot.transactions, 4);
        assert_eq!(snapshot.last_height, 11);
        assert_eq!(snapshot.reorgs, 1);
        assert!(snapshot.to_json().contains("\"failures\":1"));
    }
}
