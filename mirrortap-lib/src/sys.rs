//! AF_PACKET ring plumbing the `libc` crate does not cover.
//!
//! Constants and `repr(C)` layouts from `<linux/if_packet.h>`; values are
//! spelled out because libc's TPACKET coverage is incomplete across versions.

#![allow(dead_code)]

use libc::c_int;

pub const SOL_PACKET: c_int = 263;

pub const PACKET_RX_RING: c_int = 5;
pub const PACKET_VERSION: c_int = 10;
pub const PACKET_TX_RING: c_int = 13;
pub const PACKET_FANOUT: c_int = 18;
pub const PACKET_QDISC_BYPASS: c_int = 20;

pub const TPACKET_V2: c_int = 1;
pub const TPACKET_V3: c_int = 2;

pub const PACKET_FANOUT_HASH: u32 = 0;
pub const PACKET_FANOUT_FLAG_ROLLOVER: u32 = 0x1000;
pub const PACKET_FANOUT_FLAG_DEFRAG: u32 = 0x8000;

/// RX ring block ownership bit (block_status).
pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1;

/// TX ring frame states (tp_status).
pub const TP_STATUS_AVAILABLE: u32 = 0;
pub const TP_STATUS_SEND_REQUEST: u32 = 1;
pub const TP_STATUS_SENDING: u32 = 2;
pub const TP_STATUS_WRONG_FORMAT: u32 = 4;

/// Request the kernel fill tp_rxhash in TPACKET_V3 frames.
pub const TP_FT_REQ_FILL_RXHASH: u32 = 1;

pub const TPACKET_ALIGNMENT: usize = 16;

#[inline]
pub const fn tpacket_align(len: usize) -> usize {
    (len + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// struct tpacket_req (TPACKET_V2 TX ring request)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketReq {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
}

/// struct tpacket_req3 (TPACKET_V3 RX ring request)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketReq3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

/// struct tpacket2_hdr — one TX (or V2 RX) frame slot header.
/// Payload for TX starts at `tpacket_align(size_of::<Tpacket2Hdr>())`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Tpacket2Hdr {
    pub tp_status: u32,
    pub tp_len: u32,
    pub tp_snaplen: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_vlan_tci: u16,
    pub tp_vlan_tpid: u16,
    pub tp_padding: [u8; 4],
}

/// TX payload offset: aligned header, no sockaddr_ll (TX frames carry the
/// payload directly after the aligned tpacket2_hdr).
pub const TX_PAYLOAD_OFFSET: usize = tpacket_align(std::mem::size_of::<Tpacket2Hdr>());

/// struct tpacket_hdr_v1 — the block descriptor header inside
/// struct tpacket_block_desc (after version + offset_to_priv).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TpacketHdrV1 {
    pub block_status: u32,
    pub num_pkts: u32,
    pub offset_to_first_pkt: u32,
    pub blk_len: u32,
    pub seq_num: u64,
    pub ts_first_pkt_sec: u32,
    pub ts_first_pkt_nsec: u32,
    pub ts_last_pkt_sec: u32,
    pub ts_last_pkt_nsec: u32,
}

/// struct tpacket_block_desc, fields we use.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TpacketBlockDesc {
    pub version: u32,
    pub offset_to_priv: u32,
    pub hdr: TpacketHdrV1,
}

/// struct tpacket3_hdr — one RX packet header inside a block.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Tpacket3Hdr {
    pub tp_next_offset: u32,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_snaplen: u32,
    pub tp_len: u32,
    pub tp_status: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_rxhash: u32,
    pub tp_vlan_tci: u32,
    pub tp_vlan_tpid: u16,
    pub tp_padding: u16,
}

/// Open an AF_PACKET raw socket. `protocol` is in host order
/// (e.g. `libc::ETH_P_ALL`) and converted here; 0 means "send only".
pub fn packet_socket(protocol: u16) -> std::io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;
    let fd = unsafe {
        libc::socket(libc::AF_PACKET, libc::SOCK_RAW, i32::from(protocol.to_be()))
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) })
}

/// Bind an AF_PACKET socket to an interface, all protocols.
pub fn bind_to_ifindex(fd: c_int, ifindex: c_int) -> std::io::Result<()> {
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    sll.sll_ifindex = ifindex;
    let rc = unsafe {
        libc::bind(
            fd,
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn setsockopt<T>(fd: c_int, level: c_int, name: c_int, value: &T) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// mmap a kernel packet ring; tries MAP_LOCKED first and falls back to an
/// unlocked mapping on systems that restrict locked memory. Returns the
/// mapping and whether it is locked.
pub fn mmap_ring(fd: c_int, size: usize) -> std::io::Result<(*mut u8, bool)> {
    let locked = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_LOCKED,
            fd,
            0,
        )
    };
    if locked != libc::MAP_FAILED {
        return Ok((locked as *mut u8, true));
    }
    let unlocked = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if unlocked == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok((unlocked as *mut u8, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_payload_offset_is_aligned_header() {
        // tpacket2_hdr is 32 bytes and already 16-aligned
        assert_eq!(std::mem::size_of::<Tpacket2Hdr>(), 32);
        assert_eq!(TX_PAYLOAD_OFFSET, 32);
    }

    #[test]
    fn align_rounds_up_to_16() {
        assert_eq!(tpacket_align(1), 16);
        assert_eq!(tpacket_align(16), 16);
        assert_eq!(tpacket_align(17), 32);
    }
}
