//! Types shared between the TC classifier BPF program and the userspace tap.
//!
//! This crate is `no_std` so the same definition can be compiled for both
//! targets: `bpfel-unknown-none` (kernel-side classifier) and the host target
//! (the perf-ring consumer in `mirrortap-lib`).
#![no_std]

/// Packet direction as recorded by the classifier.
pub const DIR_INGRESS: u8 = 0;
/// Packet direction as recorded by the classifier.
pub const DIR_EGRESS: u8 = 1;

/// Largest packet payload the classifier will copy into a perf sample.
pub const MAX_CAPTURE_LEN: u32 = 65_535;

/// Metadata header the classifier emits in front of every captured packet.
///
/// **Layout must match `struct pkt_meta` in the TC program exactly**
/// (both packed, little-endian on every supported target).
///
/// ```text
/// offset  0: len        u32  original packet length in bytes
/// offset  4: ifindex    u32  capture interface index
/// offset  8: direction  u8   DIR_INGRESS | DIR_EGRESS
/// offset  9: pad        [u8; 3]
/// offset 12: timestamp  u64  bpf_ktime_get_ns() at capture
/// ```
///
/// The perf sample carries this header followed by `len` bytes of packet
/// data (capped at [`MAX_CAPTURE_LEN`]).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct PacketMeta {
    pub len: u32,
    pub ifindex: u32,
    pub direction: u8,
    pub pad: [u8; 3],
    pub timestamp: u64,
}

impl PacketMeta {
    /// Byte size of the header inside a perf sample.
    pub const SIZE: usize = 20;

    /// Decode a header from the front of a perf sample.
    ///
    /// Returns the header and the remaining bytes, or `None` when the sample
    /// is shorter than the header. The remainder may still be shorter than
    /// `len` if the kernel capped the copy; callers must check.
    pub fn parse(sample: &[u8]) -> Option<(PacketMeta, &[u8])> {
        if sample.len() < Self::SIZE {
            return None;
        }
        let meta = PacketMeta {
            len: u32::from_ne_bytes([sample[0], sample[1], sample[2], sample[3]]),
            ifindex: u32::from_ne_bytes([sample[4], sample[5], sample[6], sample[7]]),
            direction: sample[8],
            pad: [sample[9], sample[10], sample[11]],
            timestamp: u64::from_ne_bytes([
                sample[12], sample[13], sample[14], sample[15], sample[16], sample[17],
                sample[18], sample[19],
            ]),
        };
        Some((meta, &sample[Self::SIZE..]))
    }
}
