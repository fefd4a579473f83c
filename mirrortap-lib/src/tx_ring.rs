//! TPACKET_V2 mmap TX ring.
//!
//! Frames are written directly into the shared ring and handed to the kernel
//! by flipping the per-slot status word; one zero-length `sendto` per batch
//! drains every Send-Request slot. Each ring is owned by exactly one worker.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{fence, AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::error::{Result, TapError};
use crate::iface;
use crate::sys::{self, Tpacket2Hdr, TpacketReq};

const BLOCK_SIZE: u32 = 1 << 18; // 256 KB per block
const BLOCK_NR: u32 = 16; // 16 blocks = 4 MB
const FRAME_SIZE: u32 = 1 << 11; // 2048 bytes per frame

/// Bounded spin while waiting for the kernel to return a slot after a flush.
const SLOT_RETRY_YIELDS: u32 = 64;

pub struct TxRing {
    fd: OwnedFd,
    ring: *mut u8,
    ring_size: usize,
    frame_nr: u32,
    frame_size: u32,
    current: u32,
    /// Largest frame we will put on the ring:
    /// min(interface MTU + Ethernet header, frame capacity).
    max_frame_len: usize,
    debug_dump: Option<AtomicBool>,
}

// The mapping is owned exclusively by this ring and the ring by one worker.
unsafe impl Send for TxRing {}

/// Write clamp for an interface MTU: oversized frames would be rejected by
/// the kernel and wedge the whole ring, so everything is cut to fit.
pub fn max_writable_len(mtu: u32, frame_size: u32) -> usize {
    let capacity = frame_size as usize - sys::TX_PAYLOAD_OFFSET;
    (mtu as usize + crate::packet::ETH_HLEN).min(capacity)
}

impl TxRing {
    /// Bring up a TX ring bound to `ifname`.
    pub fn setup(ifname: &str, debug: bool) -> Result<TxRing> {
        let ifindex = iface::ifindex(ifname)?;
        let fd = sys::packet_socket(0).map_err(|e| TapError::Iface {
            op: "tx socket",
            iface: ifname.to_string(),
            source: e,
        })?;
        let raw = fd.as_raw_fd();

        sys::setsockopt(raw, sys::SOL_PACKET, sys::PACKET_VERSION, &sys::TPACKET_V2)
            .map_err(TapError::Io)?;

        // Best-effort performance hints; neither affects correctness.
        let one: libc::c_int = 1;
        let _ = sys::setsockopt(raw, sys::SOL_PACKET, sys::PACKET_QDISC_BYPASS, &one);
        let sndbuf: libc::c_int = 4 * 1024 * 1024;
        if sys::setsockopt(raw, libc::SOL_SOCKET, libc::SO_SNDBUFFORCE, &sndbuf).is_err() {
            let _ = sys::setsockopt(raw, libc::SOL_SOCKET, libc::SO_SNDBUF, &sndbuf);
        }

        let frame_nr = (BLOCK_SIZE / FRAME_SIZE) * BLOCK_NR;
        let req = TpacketReq {
            tp_block_size: BLOCK_SIZE,
            tp_block_nr: BLOCK_NR,
            tp_frame_size: FRAME_SIZE,
            tp_frame_nr: frame_nr,
        };
        sys::setsockopt(raw, sys::SOL_PACKET, sys::PACKET_TX_RING, &req).map_err(|e| {
            TapError::Iface { op: "PACKET_TX_RING", iface: ifname.to_string(), source: e }
        })?;

        sys::bind_to_ifindex(raw, ifindex as libc::c_int).map_err(|e| TapError::Iface {
            op: "bind",
            iface: ifname.to_string(),
            source: e,
        })?;

        let mtu = iface::mtu(ifname)?;
        let max_frame_len = max_writable_len(mtu, FRAME_SIZE);

        let ring_size = (BLOCK_SIZE * BLOCK_NR) as usize;
        let (ring, locked) = sys::mmap_ring(raw, ring_size).map_err(|e| TapError::Iface {
            op: "mmap tx ring",
            iface: ifname.to_string(),
            source: e,
        })?;
        if !locked {
            debug!(iface = ifname, "tx ring mapped without MAP_LOCKED");
        }

        debug!(
            iface = ifname,
            frames = frame_nr,
            frame_size = FRAME_SIZE,
            ring_kb = ring_size / 1024,
            max_frame_len,
            "tx ring ready"
        );

        Ok(TxRing {
            fd,
            ring,
            ring_size,
            frame_nr,
            frame_size: FRAME_SIZE,
            current: 0,
            max_frame_len,
            debug_dump: debug.then(|| AtomicBool::new(false)),
        })
    }

    #[inline]
    fn frame(&self, idx: u32) -> *mut Tpacket2Hdr {
        debug_assert!(idx < self.frame_nr);
        unsafe { self.ring.add(idx as usize * self.frame_size as usize) as *mut Tpacket2Hdr }
    }

    /// Queue one frame. Returns false when the ring stayed full after a
    /// flush and a bounded wait (the packet is dropped by the caller).
    pub fn write(&mut self, data: &[u8]) -> bool {
        let len = data.len().min(self.max_frame_len);
        let hdr = self.frame(self.current);

        let status = unsafe { std::ptr::addr_of_mut!((*hdr).tp_status) };
        let mut st = unsafe { std::ptr::read_volatile(status) };
        if st != sys::TP_STATUS_AVAILABLE && st != sys::TP_STATUS_WRONG_FORMAT {
            // Kernel still owns this slot: kick a flush and wait briefly.
            self.flush();
            let mut retries = SLOT_RETRY_YIELDS;
            loop {
                st = unsafe { std::ptr::read_volatile(status) };
                if st == sys::TP_STATUS_AVAILABLE || st == sys::TP_STATUS_WRONG_FORMAT {
                    break;
                }
                if retries == 0 {
                    return false;
                }
                retries -= 1;
                std::thread::yield_now();
            }
        }

        unsafe {
            std::ptr::addr_of_mut!((*hdr).tp_len).write_volatile(len as u32);
            std::ptr::addr_of_mut!((*hdr).tp_snaplen).write_volatile(len as u32);
            let payload = (hdr as *mut u8).add(sys::TX_PAYLOAD_OFFSET);
            std::ptr::copy_nonoverlapping(data.as_ptr(), payload, len);
        }

        if let Some(dumped) = &self.debug_dump {
            if len >= crate::packet::ETH_HLEN
                && dumped
                    .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                let n = len.min(64);
                let hex: String = data[..n].iter().map(|b| format!("{b:02x}")).collect();
                debug!(len, first_bytes = %hex, "first tx frame");
            }
        }

        // Publish the payload before handing the slot to the kernel.
        fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(status, sys::TP_STATUS_SEND_REQUEST) };

        self.current = (self.current + 1) % self.frame_nr;
        true
    }

    /// Tell the kernel to transmit every Send-Request slot; one syscall for
    /// the whole batch. Transient EAGAIN/ENOBUFS leave the frames queued for
    /// the next flush. A no-op with no pending frames, and idempotent.
    pub fn flush(&self) {
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOBUFS) | Some(libc::EINTR) => {}
                _ => warn!(%err, "tx ring flush failed"),
            }
        }
    }
}

impl Drop for TxRing {
    fn drop(&mut self) {
        self.flush();
        unsafe {
            libc::munmap(self.ring as *mut libc::c_void, self.ring_size);
        }
        // fd closes with OwnedFd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_uses_mtu_when_it_fits_the_frame() {
        // 1500 MTU + 14 = 1514 < 2048 - 32
        assert_eq!(max_writable_len(1500, 2048), 1514);
    }

    #[test]
    fn clamp_caps_at_frame_capacity() {
        // jumbo MTU exceeds what a 2048-byte slot can hold
        assert_eq!(max_writable_len(9000, 2048), 2048 - sys::TX_PAYLOAD_OFFSET);
    }
}
