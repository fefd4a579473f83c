//! Userspace VXLAN/GRE encapsulation.
//!
//! Outer frames are built byte-by-byte into a scratch buffer and pushed out
//! through a raw AF_PACKET socket on the underlay interface; no kernel
//! tunnel device is involved. Frame building and own-packet detection are
//! pure functions over [`TunnelParams`] so they stay testable without
//! sockets or root.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{info, warn};

use crate::config::{TunnelConfig, TunnelType};
use crate::error::{Result, TapError};
use crate::iface;
use crate::packet::{be16, ETHERTYPE_IPV4, ETHERTYPE_VLAN, ETH_HLEN, VLAN_HLEN};
use crate::truncate::checksum16;

const OUTER_IP_LEN: usize = 20;
const OUTER_UDP_LEN: usize = 8;
const VXLAN_HDR_LEN: usize = 8;
const GRE_HDR_LEN: usize = 4;
const ENCAP_BUF_SIZE: usize = 2048;
const DEFAULT_MTU: u32 = 1500;

const IPPROTO_UDP: u8 = 17;
const IPPROTO_GRE: u8 = 47;
/// GRE protocol field for Transparent Ethernet Bridging.
const GRE_PROTO_TEB: u16 = 0x6558;

const ARP_RETRIES: u32 = 3;
const ARP_WAIT: Duration = Duration::from_millis(300);

/// Immutable endpoint identity and frame-building parameters.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    pub kind: TunnelType,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_mac: [u8; 6],
    pub remote_mac: [u8; 6],
    /// VXLAN UDP destination port.
    pub dstport: u16,
    /// 24-bit VXLAN network identifier.
    pub vni: u32,
    /// GRE key; part of the endpoint identity, not emitted by the 4-byte
    /// flagless header.
    pub key: u32,
    /// Largest inner frame that fits the underlay MTU after encapsulation.
    pub max_inner: usize,
}

impl TunnelParams {
    pub fn overhead(kind: TunnelType) -> usize {
        match kind {
            TunnelType::Vxlan => ETH_HLEN + OUTER_IP_LEN + OUTER_UDP_LEN + VXLAN_HDR_LEN,
            TunnelType::Gre => ETH_HLEN + OUTER_IP_LEN + GRE_HDR_LEN,
        }
    }

    /// Build the full outer frame around `inner` into `buf`; returns the
    /// total frame length. `buf` must hold `overhead + inner.len()` bytes
    /// and `inner` must fit `max_inner` (checked by the caller).
    pub fn encap_into(&self, buf: &mut [u8], inner: &[u8]) -> usize {
        let overhead = Self::overhead(self.kind);
        let total = overhead + inner.len();

        buf[0..6].copy_from_slice(&self.remote_mac);
        buf[6..12].copy_from_slice(&self.local_mac);
        buf[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let ip_payload = total - ETH_HLEN;
        let ip = &mut buf[ETH_HLEN..ETH_HLEN + OUTER_IP_LEN];
        ip.fill(0);
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(ip_payload as u16).to_be_bytes());
        ip[8] = 64; // TTL
        ip[9] = match self.kind {
            TunnelType::Vxlan => IPPROTO_UDP,
            TunnelType::Gre => IPPROTO_GRE,
        };
        ip[12..16].copy_from_slice(&self.local_ip.octets());
        ip[16..20].copy_from_slice(&self.remote_ip.octets());
        let sum = checksum16(&buf[ETH_HLEN..ETH_HLEN + OUTER_IP_LEN]);
        buf[ETH_HLEN + 10..ETH_HLEN + 12].copy_from_slice(&sum.to_be_bytes());

        let mut off = ETH_HLEN + OUTER_IP_LEN;
        match self.kind {
            TunnelType::Vxlan => {
                let udp_len = (OUTER_UDP_LEN + VXLAN_HDR_LEN + inner.len()) as u16;
                buf[off..off + 2].copy_from_slice(&0u16.to_be_bytes()); // src port 0
                buf[off + 2..off + 4].copy_from_slice(&self.dstport.to_be_bytes());
                buf[off + 4..off + 6].copy_from_slice(&udp_len.to_be_bytes());
                buf[off + 6..off + 8].copy_from_slice(&0u16.to_be_bytes()); // no checksum
                off += OUTER_UDP_LEN;

                // VXLAN: I-bit set, then the VNI in the high three bytes.
                buf[off..off + 4].copy_from_slice(&0x0800_0000u32.to_be_bytes());
                buf[off + 4] = (self.vni >> 16) as u8;
                buf[off + 5] = (self.vni >> 8) as u8;
                buf[off + 6] = self.vni as u8;
                buf[off + 7] = 0;
                off += VXLAN_HDR_LEN;
            }
            TunnelType::Gre => {
                buf[off..off + 2].copy_from_slice(&0u16.to_be_bytes()); // flags
                buf[off + 2..off + 4].copy_from_slice(&GRE_PROTO_TEB.to_be_bytes());
                off += GRE_HDR_LEN;
            }
        }

        buf[off..off + inner.len()].copy_from_slice(inner);
        total
    }

    /// Does `pkt` carry our encapsulation at byte offset `l2_off`?
    fn is_own_tunnel_at(&self, pkt: &[u8], l2_off: usize) -> bool {
        if pkt.len() < l2_off + ETH_HLEN + 20 {
            return false;
        }
        let eth_type = be16(&pkt[l2_off + 12..]);
        let ip_off = if eth_type == ETHERTYPE_IPV4 {
            l2_off + ETH_HLEN
        } else if eth_type == ETHERTYPE_VLAN
            && pkt.len() >= l2_off + ETH_HLEN + VLAN_HLEN + 20
            && be16(&pkt[l2_off + 16..]) == ETHERTYPE_IPV4
        {
            l2_off + ETH_HLEN + VLAN_HLEN
        } else {
            return false;
        };

        if pkt.len() < ip_off + 20 {
            return false;
        }
        let ihl = usize::from(pkt[ip_off] & 0x0F) * 4;
        if ihl < 20 || pkt.len() < ip_off + ihl {
            return false;
        }

        let src = Ipv4Addr::new(pkt[ip_off + 12], pkt[ip_off + 13], pkt[ip_off + 14], pkt[ip_off + 15]);
        let dst = Ipv4Addr::new(pkt[ip_off + 16], pkt[ip_off + 17], pkt[ip_off + 18], pkt[ip_off + 19]);
        if src != self.local_ip || dst != self.remote_ip {
            return false;
        }

        let protocol = pkt[ip_off + 9];
        match self.kind {
            TunnelType::Vxlan => {
                if protocol != IPPROTO_UDP
                    || pkt.len() < ip_off + ihl + OUTER_UDP_LEN + VXLAN_HDR_LEN
                {
                    return false;
                }
                let udp_dst = be16(&pkt[ip_off + ihl + 2..]);
                if udp_dst != self.dstport {
                    return false;
                }
                let vni_off = ip_off + ihl + OUTER_UDP_LEN + 4;
                let vni = u32::from(pkt[vni_off]) << 16
                    | u32::from(pkt[vni_off + 1]) << 8
                    | u32::from(pkt[vni_off + 2]);
                vni == self.vni
            }
            TunnelType::Gre => {
                protocol == IPPROTO_GRE
                    && pkt.len() >= ip_off + ihl + GRE_HDR_LEN
                    && be16(&pkt[ip_off + ihl + 2..]) == GRE_PROTO_TEB
            }
        }
    }

    /// True when `pkt` looks like a frame this tunnel produced. Checked at
    /// offset 0 and again behind one VXLAN encapsulation, so a frame we
    /// already re-encapsulated is also recognized when the capture and
    /// output interfaces overlap.
    pub fn is_own_packet(&self, pkt: &[u8]) -> bool {
        if pkt.len() < ETH_HLEN {
            return false;
        }
        if self.is_own_tunnel_at(pkt, 0) {
            return true;
        }
        let outer = ETH_HLEN + OUTER_IP_LEN + OUTER_UDP_LEN + VXLAN_HDR_LEN;
        pkt.len() >= outer + ETH_HLEN + 20 && self.is_own_tunnel_at(pkt, outer)
    }
}

/// A live tunnel endpoint: params + raw send socket + shared scratch buffer.
pub struct Tunnel {
    params: TunnelParams,
    /// The encap buffer is shared across callers; builds are serialized.
    encap: Mutex<Vec<u8>>,
    fd: OwnedFd,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    mismatch_logged: AtomicBool,
}

impl Tunnel {
    /// Bring up the endpoint on the underlay `output_iface`: resolve our MAC
    /// and IPv4, resolve the remote MAC through the ARP cache, open the raw
    /// send socket, size the inner limit from the MTU. Fatal on any failure;
    /// the remote MAC is never re-resolved at runtime.
    pub fn open(cfg: &TunnelConfig, output_iface: &str) -> Result<Tunnel> {
        if output_iface.is_empty() {
            return Err(TapError::Tunnel("output interface is required".into()));
        }
        if output_iface == "lo" {
            return Err(TapError::Tunnel(
                "output interface cannot be loopback; use an interface that can \
                 reach the remote endpoint"
                    .into(),
            ));
        }

        let ifindex = iface::ifindex(output_iface)?;
        let local_mac = iface::mac(output_iface)?;
        let local_ip = match cfg.local_ip {
            Some(ip) => ip,
            None => iface::ipv4_addr(output_iface)?,
        };
        let remote_mac = resolve_remote_mac(output_iface, cfg.remote_ip)?;

        let mtu = iface::mtu(output_iface).unwrap_or(DEFAULT_MTU);
        let overhead = TunnelParams::overhead(cfg.r#type);
        let max_inner = (mtu as usize).saturating_sub(overhead);

        let params = TunnelParams {
            kind: cfg.r#type,
            local_ip,
            remote_ip: cfg.remote_ip,
            local_mac,
            remote_mac,
            dstport: cfg.dstport,
            vni: cfg.vni,
            key: cfg.key,
            max_inner,
        };

        let fd = sys_raw_socket(output_iface, ifindex)?;

        info!(
            kind = ?params.kind,
            local = %params.local_ip,
            remote = %params.remote_ip,
            vni = params.vni,
            iface = output_iface,
            max_inner,
            "tunnel endpoint ready"
        );

        // Big enough for any inner the MTU admits, jumbo underlays included.
        let buf_size = (max_inner + overhead).max(ENCAP_BUF_SIZE);
        Ok(Tunnel {
            params,
            encap: Mutex::new(vec![0u8; buf_size]),
            fd,
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            mismatch_logged: AtomicBool::new(false),
        })
    }

    pub fn params(&self) -> &TunnelParams {
        &self.params
    }

    pub fn is_own_packet(&self, pkt: &[u8]) -> bool {
        self.params.is_own_packet(pkt)
    }

    /// Encapsulate and send one inner frame. Returns false on drop
    /// (oversized inner, or a short/failed raw send).
    pub fn send(&self, inner: &[u8]) -> bool {
        if inner.len() > self.params.max_inner {
            return false;
        }
        let mut buf = match self.encap.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let total = self.params.encap_into(&mut buf, inner);
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                total,
                libc::MSG_DONTWAIT,
            )
        };
        drop(buf);
        if rc != total as isize {
            return false;
        }
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(total as u64, Ordering::Relaxed);
        true
    }

    /// Sends are synchronous; nothing to flush.
    pub fn flush(&self) {}

    pub fn stats(&self) -> (u64, u64) {
        (
            self.packets_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }

    /// One-shot diagnostic: a packet carries our tunnel IP pair but was not
    /// skipped as our own, so the port/VNI must differ. Logged once so a
    /// re-encapsulation loop is visible without flooding.
    pub fn warn_own_mismatch(&self, pkt: &[u8]) {
        if self.mismatch_logged.load(Ordering::Relaxed) || pkt.len() < ETH_HLEN + 20 {
            return;
        }
        let Some(summary) = crate::packet::parse(pkt) else { return };
        let Some(l3) = summary.l3 else { return };
        if Ipv4Addr::from(l3.src) != self.params.local_ip
            || Ipv4Addr::from(l3.dst) != self.params.remote_ip
        {
            return;
        }
        if self
            .mismatch_logged
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if self.params.kind == TunnelType::Vxlan && l3.protocol == IPPROTO_UDP {
            let port = summary.l4.map(|l4| l4.dst).unwrap_or(0);
            warn!(
                pkt_udp_dst = port,
                tunnel_dstport = self.params.dstport,
                tunnel_vni = self.params.vni,
                "packet with our tunnel endpoints was not skipped (re-encapsulation?)"
            );
        } else {
            warn!(
                protocol = l3.protocol,
                "packet with our tunnel endpoints was not skipped"
            );
        }
    }
}

fn sys_raw_socket(ifname: &str, ifindex: u32) -> Result<OwnedFd> {
    let fd = crate::sys::packet_socket(libc::ETH_P_ALL as u16).map_err(|e| TapError::Iface {
        op: "tunnel socket",
        iface: ifname.to_string(),
        source: e,
    })?;
    crate::sys::bind_to_ifindex(fd.as_raw_fd(), ifindex as libc::c_int).map_err(|e| {
        TapError::Iface { op: "tunnel bind", iface: ifname.to_string(), source: e }
    })?;
    Ok(fd)
}

/// Resolve the remote endpoint's MAC through the OS ARP cache, provoking
/// resolution with a throwaway datagram when the cache is cold. Bounded:
/// after the retries the tunnel cannot come up.
fn resolve_remote_mac(ifname: &str, remote: Ipv4Addr) -> Result<[u8; 6]> {
    if let Some(mac) = iface::arp_lookup(ifname, remote)? {
        return Ok(mac);
    }

    for _ in 0..ARP_RETRIES {
        prime_arp(ifname, remote);
        std::thread::sleep(ARP_WAIT);
        if let Some(mac) = iface::arp_lookup(ifname, remote)? {
            return Ok(mac);
        }
    }

    warn!(iface = ifname, %remote, tries = ARP_RETRIES + 1, "ARP resolution failed");
    Err(TapError::ArpUnresolved(remote))
}

/// Send nothing, connect a UDP socket toward the remote bound to the
/// underlay device: the kernel emits the ARP request for us.
fn prime_arp(ifname: &str, remote: Ipv4Addr) {
    let Ok(sock) = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) else {
        return;
    };
    let _ = sock.bind_device(Some(ifname.as_bytes()));
    let addr = SockAddr::from(std::net::SocketAddrV4::new(remote, 4789));
    let _ = sock.connect(&addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vxlan_params() -> TunnelParams {
        TunnelParams {
            kind: TunnelType::Vxlan,
            local_ip: Ipv4Addr::new(10, 0, 0, 1),
            remote_ip: Ipv4Addr::new(10, 0, 0, 2),
            local_mac: [0x02, 0, 0, 0, 0, 0x01],
            remote_mac: [0x02, 0, 0, 0, 0, 0x02],
            dstport: 4789,
            vni: 1000,
            key: 0,
            max_inner: 1450,
        }
    }

    fn gre_params() -> TunnelParams {
        TunnelParams { kind: TunnelType::Gre, key: 7, ..vxlan_params() }
    }

    #[test]
    fn vxlan_frame_shape() {
        let params = vxlan_params();
        let inner = vec![0xABu8; 100];
        let mut buf = vec![0u8; 2048];
        let total = params.encap_into(&mut buf, &inner);

        assert_eq!(total, 14 + 20 + 8 + 8 + 100);
        // outer MACs + ethertype
        assert_eq!(&buf[0..6], &params.remote_mac);
        assert_eq!(&buf[6..12], &params.local_mac);
        assert_eq!(be16(&buf[12..]), ETHERTYPE_IPV4);
        // outer IPv4
        assert_eq!(buf[14], 0x45);
        assert_eq!(be16(&buf[16..]), (20 + 8 + 8 + 100) as u16);
        assert_eq!(buf[23], IPPROTO_UDP);
        assert_eq!(&buf[26..30], &[10, 0, 0, 1]);
        assert_eq!(&buf[30..34], &[10, 0, 0, 2]);
        // outer IPv4 checksum covers the 20-byte header
        assert_eq!(checksum16(&buf[14..34]), 0);
        // UDP dst at 14+20+2 = 36
        assert_eq!(be16(&buf[34..]), 0); // src port 0
        assert_eq!(be16(&buf[36..]), 4789);
        // VXLAN header at 42: flags word then VNI 0x0003E8
        assert_eq!(&buf[42..46], &[0x08, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[46..49], &[0x00, 0x03, 0xE8]);
        assert_eq!(buf[49], 0x00);
        // inner copied verbatim
        assert!(buf[50..total].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn gre_frame_shape() {
        let params = gre_params();
        let inner = vec![0xCDu8; 60];
        let mut buf = vec![0u8; 2048];
        let total = params.encap_into(&mut buf, &inner);

        assert_eq!(total, 14 + 20 + 4 + 60);
        assert_eq!(buf[23], IPPROTO_GRE);
        assert_eq!(checksum16(&buf[14..34]), 0);
        // GRE: flags 0, protocol 0x6558, then the inner frame
        assert_eq!(be16(&buf[34..]), 0);
        assert_eq!(be16(&buf[36..]), GRE_PROTO_TEB);
        assert!(buf[38..total].iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn own_packet_detected_for_every_encapsulated_frame() {
        for params in [vxlan_params(), gre_params()] {
            let inner = crate::packet::testutil::tcpudp_frame(
                6,
                [192, 168, 1, 1],
                [192, 168, 1, 2],
                1234,
                80,
                100,
            );
            let mut buf = vec![0u8; 2048];
            let total = params.encap_into(&mut buf, &inner);
            assert!(params.is_own_packet(&buf[..total]), "{:?}", params.kind);
        }
    }

    #[test]
    fn foreign_vxlan_is_not_ours() {
        let params = vxlan_params();
        let inner = vec![0u8; 64];
        let mut buf = vec![0u8; 2048];

        // same endpoints, different VNI
        let other_vni = TunnelParams { vni: 2000, ..params.clone() };
        let total = other_vni.encap_into(&mut buf, &inner);
        assert!(!params.is_own_packet(&buf[..total]));

        // different remote
        let other_remote =
            TunnelParams { remote_ip: Ipv4Addr::new(10, 0, 0, 9), ..params.clone() };
        let total = other_remote.encap_into(&mut buf, &inner);
        assert!(!params.is_own_packet(&buf[..total]));

        // different UDP port
        let other_port = TunnelParams { dstport: 4790, ..params.clone() };
        let total = other_port.encap_into(&mut buf, &inner);
        assert!(!params.is_own_packet(&buf[..total]));
    }

    #[test]
    fn own_packet_detected_behind_one_encapsulation() {
        // Encapsulate our own tunnel frame again, as happens when input and
        // output interfaces overlap.
        let params = vxlan_params();
        let inner = vec![0u8; 64];
        let mut first = vec![0u8; 2048];
        let first_len = params.encap_into(&mut first, &inner);

        let mut second = vec![0u8; 4096];
        let second_len = params.encap_into(&mut second, &first[..first_len]);
        assert!(params.is_own_packet(&second[..second_len]));

        // Same frame wrapped by a foreign VXLAN outer (different VNI): the
        // offset-0 check fails, the offset-50 check must still recognize it.
        let foreign = TunnelParams { vni: 9999, ..params.clone() };
        let mut wrapped = vec![0u8; 4096];
        let wrapped_len = foreign.encap_into(&mut wrapped, &first[..first_len]);
        assert!(params.is_own_packet(&wrapped[..wrapped_len]));
    }

    #[test]
    fn plain_traffic_is_not_ours() {
        let params = vxlan_params();
        let pkt = crate::packet::testutil::tcpudp_frame(
            17,
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            5000,
            53,
            100,
        );
        // same IP pair but not UDP/4789+VNI
        assert!(!params.is_own_packet(&pkt));
        assert!(!params.is_own_packet(&[0u8; 10]));
    }

    #[test]
    fn overhead_values() {
        assert_eq!(TunnelParams::overhead(TunnelType::Vxlan), 50);
        assert_eq!(TunnelParams::overhead(TunnelType::Gre), 38);
    }
}
