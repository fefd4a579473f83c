//! Worker statistics: per-worker atomic counters, aggregation, rate
//! computation for the periodic printout, and optional process resource
//! sampling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::info;

/// Counters owned by one worker; mutated only by that worker, read by the
/// aggregator. Relaxed ordering is enough: values are monotonic and only
/// displayed.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_truncated: AtomicU64,
    pub bytes_truncated: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_truncated: self.packets_truncated.load(Ordering::Relaxed),
            bytes_truncated: self.bytes_truncated.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.packets_truncated.store(0, Ordering::Relaxed);
        self.bytes_truncated.store(0, Ordering::Relaxed);
    }
}

/// Plain-value copy of the counters at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_truncated: u64,
    pub bytes_truncated: u64,
}

impl StatsSnapshot {
    pub fn accumulate(&mut self, other: &StatsSnapshot) {
        self.packets_received += other.packets_received;
        self.packets_sent += other.packets_sent;
        self.packets_dropped += other.packets_dropped;
        self.bytes_received += other.bytes_received;
        self.bytes_sent += other.bytes_sent;
        self.packets_truncated += other.packets_truncated;
        self.bytes_truncated += other.bytes_truncated;
    }

    /// Per-interval rates against an older snapshot.
    pub fn rates_since(&self, prev: &StatsSnapshot, interval: Duration) -> Rates {
        let secs = interval.as_secs_f64().max(1.0);
        Rates {
            rx_pps: (self.packets_received - prev.packets_received) as f64 / secs,
            tx_pps: (self.packets_sent - prev.packets_sent) as f64 / secs,
            rx_mbps: (self.bytes_received - prev.bytes_received) as f64 * 8.0 / (secs * 1e6),
            tx_mbps: (self.bytes_sent - prev.bytes_sent) as f64 * 8.0 / (secs * 1e6),
        }
    }
}

/// Sum snapshots of many workers.
pub fn aggregate<'a, I: IntoIterator<Item = &'a WorkerStats>>(workers: I) -> StatsSnapshot {
    let mut total = StatsSnapshot::default();
    for w in workers {
        total.accumulate(&w.snapshot());
    }
    total
}

#[derive(Debug, Clone, Copy)]
pub struct Rates {
    pub rx_pps: f64,
    pub tx_pps: f64,
    pub rx_mbps: f64,
    pub tx_mbps: f64,
}

/// Samples RSS and per-thread CPU usage of this process.
pub struct ResourceSampler {
    system: System,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new() -> ResourceSampler {
        ResourceSampler {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Refresh and log one resource-usage line (plus one per thread).
    /// CPU percentages are meaningful from the second call on.
    pub fn sample(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let Some(proc_) = self.system.process(self.pid) else {
            return;
        };
        info!(
            rss_kb = proc_.memory() / 1024,
            cpu_percent = format!("{:.1}", proc_.cpu_usage()),
            "resource usage"
        );
        if let Some(tasks) = proc_.tasks() {
            let mut tids: Vec<_> = tasks.iter().collect();
            tids.sort();
            for tid in tids {
                if let Some(task) = self.system.process(*tid) {
                    info!(
                        tid = tid.as_u32(),
                        name = task.name().to_string_lossy().as_ref(),
                        cpu_percent = format!("{:.1}", task.cpu_usage()),
                        "thread usage"
                    );
                }
            }
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with(rx: u64, tx: u64, drop: u64) -> WorkerStats {
        let s = WorkerStats::default();
        s.packets_received.store(rx, Ordering::Relaxed);
        s.packets_sent.store(tx, Ordering::Relaxed);
        s.packets_dropped.store(drop, Ordering::Relaxed);
        s.bytes_received.store(rx * 100, Ordering::Relaxed);
        s.bytes_sent.store(tx * 100, Ordering::Relaxed);
        s
    }

    #[test]
    fn aggregate_sums_all_workers() {
        let workers = [stats_with(10, 8, 2), stats_with(5, 5, 0), stats_with(0, 0, 0)];
        let total = aggregate(workers.iter());
        assert_eq!(total.packets_received, 15);
        assert_eq!(total.packets_sent, 13);
        assert_eq!(total.packets_dropped, 2);
        assert_eq!(total.bytes_received, 1500);
    }

    #[test]
    fn every_received_packet_is_sent_or_dropped() {
        let w = stats_with(10, 8, 2);
        let s = w.snapshot();
        assert_eq!(s.packets_received, s.packets_sent + s.packets_dropped);
    }

    #[test]
    fn reset_zeroes_everything() {
        let w = stats_with(10, 8, 2);
        w.reset();
        assert_eq!(w.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn rates_are_per_interval_deltas() {
        let prev = StatsSnapshot { packets_received: 100, bytes_received: 1_000_000, ..Default::default() };
        let now = StatsSnapshot {
            packets_received: 1100,
            bytes_received: 2_000_000,
            ..Default::default()
        };
        let r = now.rates_since(&prev, Duration::from_secs(2));
        assert!((r.rx_pps - 500.0).abs() < f64::EPSILON);
        assert!((r.rx_mbps - 4.0).abs() < 1e-9);
    }
}
