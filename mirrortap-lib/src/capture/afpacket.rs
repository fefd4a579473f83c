//! TPACKET_V3 mmap capture with PACKET_FANOUT.
//!
//! Every worker owns an AF_PACKET socket with its own mmap'd RX ring; all
//! sockets join one fanout group so the kernel hashes each flow to a fixed
//! worker and rolls over when one falls behind. Workers share nothing but
//! atomic counters.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{Result, TapError};
use crate::forward::{self, Frame, Output, Shared, SCRATCH_LEN};
use crate::iface;
use crate::stats::WorkerStats;
use crate::sys::{self, Tpacket3Hdr, TpacketBlockDesc, TpacketReq3};
use crate::tunnel::Tunnel;
use crate::tx_ring::TxRing;

const BLOCK_SIZE: u32 = 1 << 18; // 256 KB per block
const BLOCK_NR: u32 = 64; // 64 blocks = 16 MB per worker
const FRAME_SIZE: u32 = 1 << 11; // 2048 bytes per frame
/// Block retire timeout so partial blocks surface at low rates.
const BLOCK_TIMEOUT_MS: u32 = 100;
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// All sockets join the same group; the id is arbitrary but fixed.
const FANOUT_GROUP_ID: u32 = 42;

/// One worker's mmap'd RX ring.
struct RxRing {
    fd: OwnedFd,
    map: *mut u8,
    map_size: usize,
    block_nr: u32,
    current_block: u32,
}

// The mapping is owned exclusively by its worker thread.
unsafe impl Send for RxRing {}

impl Drop for RxRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_size);
        }
    }
}

impl RxRing {
    fn setup(ifname: &str, ifindex: u32) -> Result<RxRing> {
        let fd = sys::packet_socket(libc::ETH_P_ALL as u16).map_err(|e| TapError::Iface {
            op: "rx socket",
            iface: ifname.to_string(),
            source: e,
        })?;
        let raw = fd.as_raw_fd();

        sys::setsockopt(raw, sys::SOL_PACKET, sys::PACKET_VERSION, &sys::TPACKET_V3)
            .map_err(TapError::Io)?;

        let req = TpacketReq3 {
            tp_block_size: BLOCK_SIZE,
            tp_block_nr: BLOCK_NR,
            tp_frame_size: FRAME_SIZE,
            tp_frame_nr: (BLOCK_SIZE / FRAME_SIZE) * BLOCK_NR,
            tp_retire_blk_tov: BLOCK_TIMEOUT_MS,
            tp_sizeof_priv: 0,
            tp_feature_req_word: sys::TP_FT_REQ_FILL_RXHASH,
        };
        sys::setsockopt(raw, sys::SOL_PACKET, sys::PACKET_RX_RING, &req).map_err(|e| {
            TapError::Iface { op: "PACKET_RX_RING", iface: ifname.to_string(), source: e }
        })?;

        sys::bind_to_ifindex(raw, ifindex as libc::c_int).map_err(|e| TapError::Iface {
            op: "bind",
            iface: ifname.to_string(),
            source: e,
        })?;

        let map_size = (BLOCK_SIZE * BLOCK_NR) as usize;
        let (map, locked) = sys::mmap_ring(raw, map_size).map_err(|e| TapError::Iface {
            op: "mmap rx ring",
            iface: ifname.to_string(),
            source: e,
        })?;
        if !locked {
            debug!(iface = ifname, "rx ring mapped without MAP_LOCKED");
        }

        Ok(RxRing { fd, map, map_size, block_nr: BLOCK_NR, current_block: 0 })
    }

    /// Join the fanout group. Must happen after bind.
    fn join_fanout(&self) -> Result<()> {
        let arg: u32 = FANOUT_GROUP_ID
            | ((sys::PACKET_FANOUT_HASH
                | sys::PACKET_FANOUT_FLAG_DEFRAG
                | sys::PACKET_FANOUT_FLAG_ROLLOVER)
                << 16);
        sys::setsockopt(self.fd.as_raw_fd(), sys::SOL_PACKET, sys::PACKET_FANOUT, &arg)
            .map_err(TapError::Io)
    }

    #[inline]
    fn block(&self, idx: u32) -> *mut TpacketBlockDesc {
        unsafe { self.map.add(idx as usize * BLOCK_SIZE as usize) as *mut TpacketBlockDesc }
    }

    #[inline]
    fn block_user_owned(&self, block: *mut TpacketBlockDesc) -> bool {
        let status = unsafe { std::ptr::addr_of!((*block).hdr.block_status).read_volatile() };
        status & sys::TP_STATUS_USER != 0
    }

    #[inline]
    fn release_block(&self, block: *mut TpacketBlockDesc) {
        std::sync::atomic::fence(Ordering::Release);
        unsafe {
            std::ptr::addr_of_mut!((*block).hdr.block_status).write_volatile(sys::TP_STATUS_KERNEL);
        }
    }

    fn poll(&self) {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!(%err, "rx poll failed");
            }
        }
    }
}

struct WorkerState {
    id: usize,
    cpu: usize,
    rx: RxRing,
    output: Output,
    stats: Arc<WorkerStats>,
}

pub struct AfPacketCapture {
    workers: Vec<WorkerState>,
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl AfPacketCapture {
    /// Bring up `num_workers` rings on `input_iface` (0 = one per online
    /// CPU). Each worker gets its own TX ring on `output_iface` unless a
    /// tunnel is the sink or drop mode is active.
    pub fn init(
        input_iface: &str,
        output_iface: &str,
        num_workers: u32,
        debug: bool,
        shared: Arc<Shared>,
        tunnel: Option<Arc<Tunnel>>,
    ) -> Result<AfPacketCapture> {
        let ifindex = iface::ifindex(input_iface)?;
        let num_cpus = online_cpus();
        let num_workers = if num_workers == 0 { num_cpus } else { num_workers as usize };

        info!(
            iface = input_iface,
            workers = num_workers,
            "afpacket capture with FANOUT_HASH"
        );

        let mut workers = Vec::with_capacity(num_workers);
        let mut stats = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let rx = RxRing::setup(input_iface, ifindex)?;
            rx.join_fanout()?;

            let output = match &tunnel {
                Some(t) => Output::Tunnel(Arc::clone(t)),
                None if output_iface.is_empty() => Output::Drop,
                None => Output::Ring(TxRing::setup(output_iface, debug)?),
            };

            let worker_stats = Arc::new(WorkerStats::default());
            stats.push(Arc::clone(&worker_stats));
            workers.push(WorkerState {
                id,
                cpu: id % num_cpus,
                rx,
                output,
                stats: worker_stats,
            });
        }

        if tunnel.is_none() && output_iface.is_empty() {
            info!("no output interface configured, running in drop mode");
        }

        Ok(AfPacketCapture {
            workers,
            handles: Vec::new(),
            stats,
            running: Arc::new(AtomicBool::new(false)),
            shared,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        for state in self.workers.drain(..) {
            let running = Arc::clone(&self.running);
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("tap-worker-{}", state.id))
                .spawn(move || worker_loop(state, shared, running))
                .map_err(TapError::Io)?;
            self.handles.push(handle);
        }
        info!(workers = self.handles.len(), "afpacket workers started");
        Ok(())
    }

    /// Idempotent: clears the running flag and joins every worker.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("afpacket workers stopped");
    }

    pub fn worker_stats(&self) -> &[Arc<WorkerStats>] {
        &self.stats
    }
}

impl Drop for AfPacketCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn online_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Pin the calling thread to one CPU; failure is logged, not fatal.
pub(crate) fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(cpu, err = %std::io::Error::last_os_error(), "failed to pin worker");
        }
    }
}

fn worker_loop(mut state: WorkerState, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    pin_to_cpu(state.cpu);
    debug!(worker = state.id, cpu = state.cpu, "worker pinned");

    let mut scratch = vec![0u8; SCRATCH_LEN];

    while running.load(Ordering::Relaxed) {
        let block = state.rx.block(state.rx.current_block);
        if !state.rx.block_user_owned(block) {
            state.rx.poll();
            continue;
        }

        process_block(block, &shared, &state.stats, &mut state.output, &mut scratch);

        state.rx.release_block(block);
        state.rx.current_block = (state.rx.current_block + 1) % state.rx.block_nr;
    }

    debug!(worker = state.id, "worker exiting");
}

/// Walk the packet-header chain of one user-owned block and run each frame
/// through the shared path; headers are chained by `tp_next_offset`, never
/// walked linearly.
fn process_block(
    block: *mut TpacketBlockDesc,
    shared: &Shared,
    stats: &WorkerStats,
    output: &mut Output,
    scratch: &mut [u8],
) {
    // The kernel published this block with a release; its contents (other
    // than the live status word) are stable until we hand it back.
    let (num_pkts, first_offset) = unsafe {
        (
            std::ptr::addr_of!((*block).hdr.num_pkts).read(),
            std::ptr::addr_of!((*block).hdr.offset_to_first_pkt).read(),
        )
    };

    let mut queued = 0u32;
    let mut pkt = unsafe { (block as *mut u8).add(first_offset as usize) as *mut Tpacket3Hdr };

    for _ in 0..num_pkts {
        let (tp_mac, tp_snaplen, tp_next) = unsafe {
            (
                std::ptr::addr_of!((*pkt).tp_mac).read(),
                std::ptr::addr_of!((*pkt).tp_snaplen).read(),
                std::ptr::addr_of!((*pkt).tp_next_offset).read(),
            )
        };

        let data = unsafe {
            std::slice::from_raw_parts_mut(
                (pkt as *mut u8).add(tp_mac as usize),
                tp_snaplen as usize,
            )
        };

        if forward::process_packet(shared, stats, output, scratch, Frame::Writable(data)) {
            queued += 1;
        }

        pkt = unsafe { (pkt as *mut u8).add(tp_next as usize) as *mut Tpacket3Hdr };
    }

    if queued > 0 {
        output.flush();
    }
}
