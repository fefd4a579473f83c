//! TC classifier capture.
//!
//! A pre-compiled classifier object is attached at the ingress and egress
//! hooks of the input interface; it copies every packet, prefixed with a
//! [`PacketMeta`] header, into a per-CPU perf ring and always returns the
//! accept action so forwarding is undisturbed. One dedicated thread drains
//! the perf ring for all CPUs and runs the shared per-packet path.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use aya::maps::perf::{PerfEventArray, PerfEventArrayBuffer};
use aya::maps::MapData;
use aya::programs::tc::SchedClassifierLink;
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::Ebpf;
use bytes::BytesMut;
use mirrortap_ebpf_common::PacketMeta;
use tracing::{debug, info, warn};

use crate::error::{Result, TapError};
use crate::forward::{self, Frame, Output, Shared, SCRATCH_LEN};
use crate::stats::WorkerStats;
use crate::tunnel::Tunnel;
use crate::tx_ring::TxRing;

/// Compiled classifier object, loaded at runtime; compilation is external.
pub const DEFAULT_BPF_OBJECT: &str = "tc_mirror.bpf.o";

const INGRESS_PROG: &str = "tc_ingress";
const EGRESS_PROG: &str = "tc_egress";
const EVENTS_MAP: &str = "events";

/// Pages per CPU for the perf ring.
const PERF_BUFFER_PAGES: usize = 64;
const PERF_POLL_TIMEOUT_MS: libc::c_int = 100;
/// Flush the TX ring after this many queued frames.
const TX_BATCH: u32 = 32;
/// Per-sample buffers handed to each read; each must hold a whole sample.
const SAMPLE_BUFFERS: usize = 16;
const SAMPLE_BUF_CAPACITY: usize = PacketMeta::SIZE + 65_535 + 64;

#[derive(Debug, thiserror::Error)]
pub enum TcTapError {
    #[error("failed to load BPF object {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: aya::EbpfError,
    },

    #[error("program '{0}' not found in BPF object")]
    ProgramNotFound(&'static str),

    #[error("'{name}' is not a TC classifier program: {source}")]
    ProgramType {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to load '{name}' into the kernel: {source}")]
    ProgramLoad {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to attach '{name}' to {iface}: {source}")]
    Attach {
        name: &'static str,
        iface: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to create clsact qdisc on {iface}: {source}")]
    Qdisc {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("map '{0}' not found in BPF object")]
    MapNotFound(&'static str),

    #[error("failed to open perf buffer for CPU {cpu}: {source}")]
    PerfOpen {
        cpu: u32,
        #[source]
        source: aya::maps::perf::PerfBufferError,
    },

    #[error("failed to enumerate online CPUs: {0}")]
    OnlineCpus(std::io::Error),
}

/// Classifier attachment state. Links are owned so detach happens on drop
/// as well; `detach()` is explicit and idempotent.
pub struct TcTap {
    ebpf: Ebpf,
    iface: String,
    ingress: Option<SchedClassifierLink>,
    egress: Option<SchedClassifierLink>,
}

impl TcTap {
    /// Load the classifier object and attach at both hooks of `iface`.
    pub fn attach(iface: &str, object_path: &Path) -> std::result::Result<TcTap, TcTapError> {
        raise_memlock();

        let mut ebpf = Ebpf::load_file(object_path).map_err(|source| TcTapError::Load {
            path: object_path.display().to_string(),
            source,
        })?;

        // clsact hosts both directions; an existing qdisc is fine.
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            if e.raw_os_error() != Some(libc::EEXIST) {
                return Err(TcTapError::Qdisc { iface: iface.to_string(), source: e });
            }
        }

        // On egress failure the ingress link detaches when it drops.
        let ingress = attach_one(&mut ebpf, iface, INGRESS_PROG, TcAttachType::Ingress)?;
        let egress = attach_one(&mut ebpf, iface, EGRESS_PROG, TcAttachType::Egress)?;

        info!(iface, "TC classifier attached (ingress + egress)");

        Ok(TcTap {
            ebpf,
            iface: iface.to_string(),
            ingress: Some(ingress),
            egress: Some(egress),
        })
    }

    /// Detach both hooks. Safe to call more than once.
    pub fn detach(&mut self) {
        if self.ingress.take().is_some() | self.egress.take().is_some() {
            info!(iface = %self.iface, "TC classifier detached");
        }
    }

    fn open_perf_buffers(
        &mut self,
    ) -> std::result::Result<Vec<PerfEventArrayBuffer<MapData>>, TcTapError> {
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .ok_or(TcTapError::MapNotFound(EVENTS_MAP))?;
        let mut events: PerfEventArray<MapData> =
            PerfEventArray::try_from(map).map_err(|_| TcTapError::MapNotFound(EVENTS_MAP))?;

        let cpus = aya::util::online_cpus().map_err(|(_, e)| TcTapError::OnlineCpus(e))?;
        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let buf = events
                .open(cpu, Some(PERF_BUFFER_PAGES))
                .map_err(|source| TcTapError::PerfOpen { cpu, source })?;
            buffers.push(buf);
        }
        Ok(buffers)
    }
}

impl Drop for TcTap {
    fn drop(&mut self) {
        self.detach();
    }
}

fn attach_one(
    ebpf: &mut Ebpf,
    iface: &str,
    name: &'static str,
    hook: TcAttachType,
) -> std::result::Result<SchedClassifierLink, TcTapError> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(name)
        .ok_or(TcTapError::ProgramNotFound(name))?
        .try_into()
        .map_err(|source| TcTapError::ProgramType { name, source })?;
    program
        .load()
        .map_err(|source| TcTapError::ProgramLoad { name, source })?;
    let link_id = program.attach(iface, hook).map_err(|source| TcTapError::Attach {
        name,
        iface: iface.to_string(),
        source,
    })?;
    program.take_link(link_id).map_err(|source| TcTapError::Attach {
        name,
        iface: iface.to_string(),
        source,
    })
}

/// Remove the locked-memory limit so BPF maps can be created without a
/// `memlock` ulimit override in the environment.
fn raise_memlock() {
    unsafe {
        let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
        let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim);
    }
}

/// The classifier backend: attachment plus the single perf consumer.
pub struct TcCapture {
    tap: TcTap,
    buffers: Option<Vec<PerfEventArrayBuffer<MapData>>>,
    output: Option<Output>,
    stats: Vec<Arc<WorkerStats>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl TcCapture {
    /// Attach the classifier and prepare the consumer. The perf ring is
    /// drained by a single thread regardless of the configured worker
    /// count — perf draining is inherently multi-CPU on the kernel side.
    pub fn init(
        input_iface: &str,
        output_iface: &str,
        debug: bool,
        shared: Arc<Shared>,
        tunnel: Option<Arc<Tunnel>>,
    ) -> Result<TcCapture> {
        let mut tap = TcTap::attach(input_iface, Path::new(DEFAULT_BPF_OBJECT))?;
        let buffers = tap.open_perf_buffers()?;

        let output = match &tunnel {
            Some(t) => Output::Tunnel(Arc::clone(t)),
            None if output_iface.is_empty() => {
                info!("no output interface configured, running in drop mode");
                Output::Drop
            }
            None => Output::Ring(TxRing::setup(output_iface, debug)?),
        };

        info!("using 1 worker thread (perf ring consumer handles all CPUs)");

        Ok(TcCapture {
            tap,
            buffers: Some(buffers),
            output: Some(output),
            stats: vec![Arc::new(WorkerStats::default())],
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            shared,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        let buffers = self
            .buffers
            .take()
            .ok_or_else(|| TapError::Config("capture already started".into()))?;
        let output = self.output.take().expect("output present until start");

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let shared = Arc::clone(&self.shared);
        let stats = Arc::clone(&self.stats[0]);

        let handle = std::thread::Builder::new()
            .name("tap-perf".into())
            .spawn(move || consumer_loop(buffers, output, shared, stats, running))
            .map_err(TapError::Io)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Idempotent: stops the consumer and detaches the classifier.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.tap.detach();
    }

    pub fn worker_stats(&self) -> &[Arc<WorkerStats>] {
        &self.stats
    }
}

impl Drop for TcCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consumer_loop(
    mut buffers: Vec<PerfEventArrayBuffer<MapData>>,
    mut output: Output,
    shared: Arc<Shared>,
    stats: Arc<WorkerStats>,
    running: Arc<AtomicBool>,
) {
    let mut scratch = vec![0u8; SCRATCH_LEN];
    let mut sample_bufs: Vec<BytesMut> = (0..SAMPLE_BUFFERS)
        .map(|_| BytesMut::with_capacity(SAMPLE_BUF_CAPACITY))
        .collect();
    let mut pollfds: Vec<libc::pollfd> = buffers
        .iter()
        .map(|b| libc::pollfd {
            fd: b.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let mut tx_pending = 0u32;

    while running.load(Ordering::Relaxed) {
        let rc = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, PERF_POLL_TIMEOUT_MS)
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!(%err, "perf poll failed");
            }
            continue;
        }

        for (i, buf) in buffers.iter_mut().enumerate() {
            if pollfds[i].revents & libc::POLLIN == 0 {
                continue;
            }
            pollfds[i].revents = 0;

            let events = match buf.read_events(&mut sample_bufs) {
                Ok(ev) => ev,
                Err(err) => {
                    warn!(cpu = i, %err, "perf read failed");
                    continue;
                }
            };

            if events.lost > 0 {
                // the kernel overwrote samples we never saw
                stats
                    .packets_dropped
                    .fetch_add(events.lost as u64, Ordering::Relaxed);
                debug!(cpu = i, lost = events.lost, "perf samples lost");
            }

            for sample in sample_bufs.iter().take(events.read) {
                let Some((meta, payload)) = PacketMeta::parse(sample) else {
                    continue;
                };
                let pkt_len = (meta.len as usize).min(payload.len());
                if pkt_len == 0 {
                    continue;
                }
                if forward::process_packet(
                    &shared,
                    &stats,
                    &mut output,
                    &mut scratch,
                    Frame::ReadOnly(&payload[..pkt_len]),
                ) {
                    tx_pending += 1;
                    if tx_pending >= TX_BATCH {
                        output.flush();
                        tx_pending = 0;
                    }
                }
            }
        }
    }

    output.flush();
    debug!("perf consumer exiting");
}
