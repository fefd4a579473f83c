//! The per-packet path shared by both capture backends:
//! own-packet skip → filter → truncate → emit, with the counter discipline
//! that every received packet ends as exactly one of sent or dropped
//! (own-packet skips excepted — those leave no output-side trace).

use std::sync::Arc;

use crate::config::{Action, TruncateConfig};
use crate::filter::FilterEngine;
use crate::stats::WorkerStats;
use crate::truncate::truncate_in_place;
use crate::tunnel::{Tunnel, TunnelParams};
use crate::tx_ring::TxRing;

/// Writable scratch for truncating read-only capture regions; sized for the
/// largest MTU the config admits.
pub const SCRATCH_LEN: usize = 9216;

/// Read-only state every worker shares.
pub struct Shared {
    pub filter: Option<FilterEngine>,
    pub truncate: TruncateConfig,
    /// Set when tunneling: used to recognize frames we encapsulated
    /// ourselves when the capture and output interfaces overlap.
    pub own_tunnel: Option<TunnelParams>,
}

/// Where a worker's packets go. Each worker owns its sink; the tunnel is the
/// one shared sink and serializes internally.
pub enum Output {
    /// No output interface configured: count and discard.
    Drop,
    Ring(TxRing),
    Tunnel(Arc<Tunnel>),
    #[cfg(test)]
    Collect(Vec<Vec<u8>>),
}

impl Output {
    pub fn flush(&mut self) {
        match self {
            Output::Ring(ring) => ring.flush(),
            Output::Tunnel(t) => t.flush(),
            _ => {}
        }
    }
}

/// One captured frame on its way through the path. Perf samples are
/// read-only; ring frames can be truncated in place.
pub enum Frame<'a> {
    Writable(&'a mut [u8]),
    ReadOnly(&'a [u8]),
}

/// Run one frame through the shared path. Returns true when the frame was
/// queued on the output (callers batch one flush per RX burst).
pub fn process_packet(
    shared: &Shared,
    stats: &WorkerStats,
    output: &mut Output,
    scratch: &mut [u8],
    frame: Frame<'_>,
) -> bool {
    use std::sync::atomic::Ordering::Relaxed;

    let len = match &frame {
        Frame::Writable(b) => b.len(),
        Frame::ReadOnly(b) => b.len(),
    };
    stats.packets_received.fetch_add(1, Relaxed);
    stats.bytes_received.fetch_add(len as u64, Relaxed);

    // Break the tap-its-own-output loop: a frame this process already
    // encapsulated is skipped silently, with no sent/dropped accounting.
    if let Some(own) = &shared.own_tunnel {
        let data = match &frame {
            Frame::Writable(b) => &b[..],
            Frame::ReadOnly(b) => b,
        };
        if own.is_own_packet(data) {
            return false;
        }
    }

    if matches!(output, Output::Drop) {
        stats.packets_dropped.fetch_add(1, Relaxed);
        return false;
    }

    if let Some(filter) = &shared.filter {
        let data = match &frame {
            Frame::Writable(b) => &b[..],
            Frame::ReadOnly(b) => b,
        };
        if filter.evaluate(data).action == Action::Drop {
            stats.packets_dropped.fetch_add(1, Relaxed);
            return false;
        }
    }

    // Truncate. In-place for writable frames; read-only frames are copied
    // into the scratch buffer first. A read-only frame too large for the
    // scratch goes out untruncated rather than dropped.
    let target = shared.truncate.length as usize;
    let (data, send_len): (&[u8], usize) = match frame {
        Frame::Writable(buf) => {
            let new_len = truncate_in_place(buf, len, shared.truncate.enabled, target);
            let buf: &[u8] = buf;
            (buf, new_len)
        }
        Frame::ReadOnly(buf) => {
            if shared.truncate.enabled && len <= scratch.len() {
                scratch[..len].copy_from_slice(buf);
                let new_len = truncate_in_place(scratch, len, true, target);
                (&scratch[..], new_len)
            } else {
                (buf, len)
            }
        }
    };
    if send_len < len {
        stats.packets_truncated.fetch_add(1, Relaxed);
        stats.bytes_truncated.fetch_add((len - send_len) as u64, Relaxed);
    }
    let payload = &data[..send_len];

    let queued = match output {
        Output::Drop => unreachable!("handled above"),
        Output::Ring(ring) => ring.write(payload),
        Output::Tunnel(tunnel) => {
            tunnel.warn_own_mismatch(payload);
            tunnel.send(payload)
        }
        #[cfg(test)]
        Output::Collect(frames) => {
            frames.push(payload.to_vec());
            true
        }
    };

    if queued {
        stats.packets_sent.fetch_add(1, Relaxed);
        stats.bytes_sent.fetch_add(send_len as u64, Relaxed);
    } else {
        stats.packets_dropped.fetch_add(1, Relaxed);
    }
    queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, MatchConfig, RuleConfig};
    use crate::packet::testutil::tcpudp_frame;
    use crate::packet::{be16, IPPROTO_TCP, IPPROTO_UDP};

    fn shared_with(filter: Option<FilterConfig>, truncate: TruncateConfig) -> Shared {
        Shared {
            filter: filter.map(|f| FilterEngine::new(&f, true)),
            truncate,
            own_tunnel: None,
        }
    }

    fn drop_https_filter() -> FilterConfig {
        FilterConfig {
            default_action: Action::Allow,
            rules: vec![RuleConfig {
                action: Action::Drop,
                r#match: MatchConfig {
                    protocol: Some(6),
                    port_dst: Some(443),
                    ..Default::default()
                },
            }],
        }
    }

    #[test]
    fn allowed_packet_is_counted_sent() {
        let shared = shared_with(Some(drop_https_filter()), TruncateConfig::default());
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; SCRATCH_LEN];

        let mut dns = tcpudp_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 33000, 53, 90);
        let queued =
            process_packet(&shared, &stats, &mut out, &mut scratch, Frame::Writable(&mut dns));
        assert!(queued);

        let s = stats.snapshot();
        assert_eq!(s.packets_received, 1);
        assert_eq!(s.bytes_received, 90);
        assert_eq!(s.packets_sent, 1);
        assert_eq!(s.packets_dropped, 0);
    }

    #[test]
    fn filtered_packet_is_counted_dropped() {
        let shared = shared_with(Some(drop_https_filter()), TruncateConfig::default());
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; SCRATCH_LEN];

        let https = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 33000, 443, 90);
        let queued =
            process_packet(&shared, &stats, &mut out, &mut scratch, Frame::ReadOnly(&https));
        assert!(!queued);

        let s = stats.snapshot();
        assert_eq!(s.packets_received, 1);
        assert_eq!(s.packets_sent, 0);
        assert_eq!(s.packets_dropped, 1);
        let hits = shared.filter.as_ref().unwrap().hit_counts().unwrap();
        assert_eq!(hits, vec![1, 0]);
    }

    #[test]
    fn drop_mode_counts_without_filtering() {
        let shared = shared_with(Some(drop_https_filter()), TruncateConfig::default());
        let stats = WorkerStats::default();
        let mut out = Output::Drop;
        let mut scratch = [0u8; SCRATCH_LEN];

        let pkt = tcpudp_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 64);
        process_packet(&shared, &stats, &mut out, &mut scratch, Frame::ReadOnly(&pkt));

        assert_eq!(stats.snapshot().packets_dropped, 1);
        // the filter never ran
        let hits = shared.filter.as_ref().unwrap().hit_counts().unwrap();
        assert_eq!(hits, vec![0, 0]);
    }

    #[test]
    fn readonly_frame_is_truncated_via_scratch() {
        let shared = shared_with(
            None,
            TruncateConfig { enabled: true, length: 128 },
        );
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; SCRATCH_LEN];

        let pkt = tcpudp_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000, 300);
        process_packet(&shared, &stats, &mut out, &mut scratch, Frame::ReadOnly(&pkt));

        let Output::Collect(frames) = &out else { unreachable!() };
        assert_eq!(frames[0].len(), 128);
        // IPv4 total-length repaired in the copy, original untouched
        assert_eq!(be16(&frames[0][16..]), 114);
        assert_eq!(be16(&pkt[16..]), 286);

        let s = stats.snapshot();
        assert_eq!(s.packets_truncated, 1);
        assert_eq!(s.bytes_truncated, 300 - 128);
        assert_eq!(s.bytes_sent, 128);
    }

    #[test]
    fn oversized_readonly_frame_goes_out_untruncated() {
        let shared = shared_with(None, TruncateConfig { enabled: true, length: 128 });
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; 64]; // deliberately tiny

        let pkt = tcpudp_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 300);
        process_packet(&shared, &stats, &mut out, &mut scratch, Frame::ReadOnly(&pkt));

        let Output::Collect(frames) = &out else { unreachable!() };
        assert_eq!(frames[0].len(), 300);
        assert_eq!(stats.snapshot().packets_truncated, 0);
    }

    #[test]
    fn writable_frame_is_truncated_in_place() {
        let shared = shared_with(None, TruncateConfig { enabled: true, length: 128 });
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; SCRATCH_LEN];

        let mut pkt = tcpudp_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 300);
        process_packet(&shared, &stats, &mut out, &mut scratch, Frame::Writable(&mut pkt));

        // repaired in the original buffer
        assert_eq!(be16(&pkt[16..]), 114);
        let s = stats.snapshot();
        assert_eq!(s.packets_sent, 1);
        assert_eq!(s.bytes_sent, 128);
    }

    #[test]
    fn own_tunnel_frame_is_skipped_silently() {
        use crate::config::TunnelType;
        use std::net::Ipv4Addr;

        let params = TunnelParams {
            kind: TunnelType::Vxlan,
            local_ip: Ipv4Addr::new(10, 0, 0, 1),
            remote_ip: Ipv4Addr::new(10, 0, 0, 2),
            local_mac: [0x02, 0, 0, 0, 0, 1],
            remote_mac: [0x02, 0, 0, 0, 0, 2],
            dstport: 4789,
            vni: 1000,
            key: 0,
            max_inner: 1450,
        };
        let inner = tcpudp_frame(IPPROTO_TCP, [192, 168, 1, 1], [192, 168, 1, 2], 1, 2, 80);
        let mut wire = vec![0u8; 2048];
        let wire_len = params.encap_into(&mut wire, &inner);

        let mut shared = shared_with(Some(drop_https_filter()), TruncateConfig::default());
        shared.own_tunnel = Some(params);
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; SCRATCH_LEN];

        let queued = process_packet(
            &shared,
            &stats,
            &mut out,
            &mut scratch,
            Frame::ReadOnly(&wire[..wire_len]),
        );
        assert!(!queued);

        // received is counted, but neither sent nor dropped, and the filter
        // never saw the frame
        let s = stats.snapshot();
        assert_eq!(s.packets_received, 1);
        assert_eq!(s.packets_sent, 0);
        assert_eq!(s.packets_dropped, 0);
        let hits = shared.filter.as_ref().unwrap().hit_counts().unwrap();
        assert_eq!(hits, vec![0, 0]);
        let Output::Collect(frames) = &out else { unreachable!() };
        assert!(frames.is_empty());
    }

    #[test]
    fn no_filter_means_allow_all() {
        let shared = shared_with(None, TruncateConfig::default());
        let stats = WorkerStats::default();
        let mut out = Output::Collect(vec![]);
        let mut scratch = [0u8; SCRATCH_LEN];

        let pkt = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 33000, 443, 64);
        assert!(process_packet(&shared, &stats, &mut out, &mut scratch, Frame::ReadOnly(&pkt)));
        assert_eq!(stats.snapshot().packets_sent, 1);
    }
}
