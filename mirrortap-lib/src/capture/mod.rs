//! Capture backends behind one contract: init, start, stop, stats.

pub mod afpacket;
pub mod tc;

use std::sync::Arc;

use crate::config::{CaptureMode, Config};
use crate::error::Result;
use crate::filter::FilterEngine;
use crate::forward::Shared;
use crate::stats::{self, StatsSnapshot, WorkerStats};
use crate::tunnel::Tunnel;

pub use afpacket::AfPacketCapture;
pub use tc::TcCapture;

/// The running tap: backend-selected workers plus the shared state they
/// process against.
pub struct Capture {
    backend: Backend,
    shared: Arc<Shared>,
    tunnel: Option<Arc<Tunnel>>,
}

enum Backend {
    AfPacket(AfPacketCapture),
    Tc(TcCapture),
}

impl Capture {
    /// Build filter, tunnel, and the selected backend from a validated
    /// config. Partially-built state is released in reverse order on error
    /// (each component owns its resources).
    pub fn init(cfg: &Config) -> Result<Capture> {
        let filter = cfg
            .filter
            .as_ref()
            .map(|f| FilterEngine::new(f, cfg.runtime.filter_stats));

        let tunnel = match &cfg.tunnel {
            Some(tcfg) => Some(Arc::new(Tunnel::open(tcfg, &cfg.runtime.output_iface)?)),
            None => None,
        };

        let shared = Arc::new(Shared {
            filter,
            truncate: cfg.runtime.truncate,
            own_tunnel: tunnel.as_ref().map(|t| t.params().clone()),
        });

        let backend = match cfg.runtime.mode {
            CaptureMode::Afpacket => Backend::AfPacket(AfPacketCapture::init(
                &cfg.runtime.input_iface,
                &cfg.runtime.output_iface,
                cfg.runtime.workers,
                cfg.runtime.debug,
                Arc::clone(&shared),
                tunnel.clone(),
            )?),
            CaptureMode::Ebpf => Backend::Tc(TcCapture::init(
                &cfg.runtime.input_iface,
                &cfg.runtime.output_iface,
                cfg.runtime.debug,
                Arc::clone(&shared),
                tunnel.clone(),
            )?),
        };

        Ok(Capture { backend, shared, tunnel })
    }

    pub fn start(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::AfPacket(b) => b.start(),
            Backend::Tc(b) => b.start(),
        }
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        match &mut self.backend {
            Backend::AfPacket(b) => b.stop(),
            Backend::Tc(b) => b.stop(),
        }
    }

    pub fn filter(&self) -> Option<&FilterEngine> {
        self.shared.filter.as_ref()
    }

    pub fn tunnel(&self) -> Option<&Arc<Tunnel>> {
        self.tunnel.as_ref()
    }

    fn worker_stats(&self) -> &[Arc<WorkerStats>] {
        match &self.backend {
            Backend::AfPacket(b) => b.worker_stats(),
            Backend::Tc(b) => b.worker_stats(),
        }
    }

    /// Sum of all workers. With a tunnel active, its counters are the
    /// authoritative TX numbers (the encapsulation step would otherwise be
    /// double-counted).
    pub fn aggregate_stats(&self) -> StatsSnapshot {
        let mut total = stats::aggregate(self.worker_stats().iter().map(Arc::as_ref));
        if let Some(tunnel) = &self.tunnel {
            let (pkts, bytes) = tunnel.stats();
            total.packets_sent = pkts;
            total.bytes_sent = bytes;
        }
        total
    }

    /// One snapshot per worker, in worker order.
    pub fn per_worker_stats(&self) -> Vec<StatsSnapshot> {
        self.worker_stats().iter().map(|w| w.snapshot()).collect()
    }

    /// Zero every counter; used once at startup.
    pub fn reset_stats(&self) {
        for w in self.worker_stats() {
            w.reset();
        }
        if let Some(filter) = &self.shared.filter {
            filter.reset_hits();
        }
    }
}
