use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer};

/// Capture backend selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// TC classifier programs + perf ring (single consumer thread)
    Ebpf,
    /// TPACKET_V3 mmap rings + PACKET_FANOUT (one worker per CPU)
    Afpacket,
}

/// Terminal filter decision
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Forward the packet to the configured output
    #[default]
    Allow,
    /// Discard the packet before any output attempt
    Drop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Drop => write!(f, "drop"),
        }
    }
}

/// Tunnel encapsulation selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Vxlan,
    Gre,
}

/// IPv4 address with optional CIDR prefix, as written in rule matches.
///
/// Stored in canonical host byte order: `addr` is the (mask-applied) network
/// address as a host-order `u32`, `mask` the prefix mask. The packet parser
/// produces addresses in the same order, so a match is a plain
/// `(pkt & mask) == addr`. A `/0` prefix is `mask == 0` and matches any
/// address; a bare address means `/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrV4 {
    pub addr: u32,
    pub mask: u32,
}

impl CidrV4 {
    pub fn matches(&self, ip: u32) -> bool {
        (ip & self.mask) == self.addr
    }

    pub fn prefix_len(&self) -> u32 {
        self.mask.count_ones()
    }
}

impl FromStr for CidrV4 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            let net: Ipv4Net = s
                .parse()
                .map_err(|e| format!("invalid CIDR '{s}': {e}"))?;
            let mask = u32::from(net.netmask());
            Ok(CidrV4 { addr: u32::from(net.network()) & mask, mask })
        } else {
            let ip: Ipv4Addr = s
                .parse()
                .map_err(|e| format!("invalid IP address '{s}': {e}"))?;
            Ok(CidrV4 { addr: u32::from(ip), mask: u32::MAX })
        }
    }
}

impl fmt::Display for CidrV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv4Addr::from(self.addr))?;
        if self.mask != 0 && self.mask != u32::MAX {
            write!(f, "/{}", self.prefix_len())?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for CidrV4 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Truncation settings
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct TruncateConfig {
    /// Enable fixed-length truncation of forwarded packets
    #[serde(default)]
    pub enabled: bool,
    /// Truncation target in bytes (64..9000); 0 means no truncation
    #[serde(default)]
    pub length: u32,
}

/// Runtime section (required)
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Interface to capture from (e.g. "eth0")
    pub input_iface: String,
    /// Interface to mirror to; empty means drop mode (capture and count only)
    #[serde(default)]
    pub output_iface: String,
    /// Capture backend: "ebpf" or "afpacket"
    pub mode: CaptureMode,
    /// Worker thread count, 0..128; 0 means one per online CPU
    /// (the ebpf backend always runs a single consumer)
    #[serde(default)]
    pub workers: u32,
    /// Verbose bring-up and shutdown logging
    #[serde(default)]
    pub verbose: bool,
    /// One-shot hex dump of the first transmitted frame per ring
    #[serde(default)]
    pub debug: bool,
    /// Print aggregate statistics at 1 Hz
    #[serde(default)]
    pub stats: bool,
    /// Count and print per-rule filter hits
    #[serde(default)]
    pub filter_stats: bool,
    /// Sample process RSS and per-thread CPU alongside the statistics
    #[serde(default)]
    pub resource_usage: bool,
    /// Truncation settings
    #[serde(default)]
    pub truncate: TruncateConfig,
}

/// One ACL rule: action plus a set of optional match constraints.
/// Omitted fields do not constrain; a rule with an empty match matches
/// every packet.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuleConfig {
    /// What to do when the rule matches
    #[serde(default)]
    pub action: Action,
    /// Match constraints
    #[serde(default)]
    pub r#match: MatchConfig,
}

/// Match constraints for one rule. A constraint on a field the packet does
/// not carry (no IPv4 header, no TCP/UDP ports) fails the rule; it never
/// matches by absence.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MatchConfig {
    /// Ethertype, hex ("0x0800") or decimal
    #[serde(default, deserialize_with = "de_eth_type")]
    pub eth_type: Option<u16>,
    /// Source IPv4, "a.b.c.d" or "a.b.c.d/prefix"
    #[serde(default)]
    pub ip_src: Option<CidrV4>,
    /// Destination IPv4, "a.b.c.d" or "a.b.c.d/prefix"
    #[serde(default)]
    pub ip_dst: Option<CidrV4>,
    /// L4 protocol: "tcp", "udp", "icmp", "icmpv6", or a number 0..255
    #[serde(default, deserialize_with = "de_protocol")]
    pub protocol: Option<u8>,
    /// TCP/UDP source port
    #[serde(default)]
    pub port_src: Option<u16>,
    /// TCP/UDP destination port
    #[serde(default)]
    pub port_dst: Option<u16>,
}

/// Filter section (optional; absent means allow everything, count nothing)
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    /// Action when no rule matches
    #[serde(default)]
    pub default_action: Action,
    /// Ordered rule list; first match wins; at most 64 rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Tunnel section (optional). When present, `runtime.output_iface` is the
/// underlay interface and must not be loopback.
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Encapsulation: "vxlan" or "gre"
    pub r#type: TunnelType,
    /// Remote endpoint (VTEP) IPv4 address
    pub remote_ip: Ipv4Addr,
    /// VXLAN network identifier, 24 bits
    #[serde(default)]
    pub vni: u32,
    /// VXLAN UDP destination port
    #[serde(default = "default_vxlan_port")]
    pub dstport: u16,
    /// GRE key (kept for endpoint identity; the 4-byte header carries no key)
    #[serde(default)]
    pub key: u32,
    /// Local endpoint IPv4; probed from the output interface when absent
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
}

fn default_vxlan_port() -> u16 {
    4789
}

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Runtime section (required)
    pub runtime: RuntimeConfig,
    /// Filter section (optional)
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    /// Tunnel section (optional)
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

/// Accept "0x0800"-style hex strings, decimal strings, or plain integers.
fn de_eth_type<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u16),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => {
            let s = s.trim();
            let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u16::from_str_radix(hex, 16)
            } else {
                s.parse()
            };
            parsed
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid eth_type '{s}'")))
        }
    }
}

/// Accept protocol names ("tcp", "udp", "icmp", "icmpv6") or numbers 0..255.
fn de_protocol<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u8),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => match s.as_str() {
            "tcp" => Ok(Some(6)),
            "udp" => Ok(Some(17)),
            "icmp" => Ok(Some(1)),
            "icmpv6" => Ok(Some(58)),
            other => other
                .parse()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid protocol '{other}'"))),
        },
    }
}
