//! Ordered first-match packet filter.
//!
//! Rules come from the `filter` config section; evaluation order is rule
//! order; the first matching rule decides. When no rule matches, the default
//! action applies and the sentinel index `num_rules` is reported. Per-rule
//! hit counters are optional and atomic, safe to bump from any worker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{Action, FilterConfig, MatchConfig};
use crate::packet::{self, PacketSummary};

/// Hard cap on the rule list, mirrored by config validation.
pub const MAX_RULES: usize = 64;

/// One evaluation outcome: the action plus which slot decided it
/// (`rule` is the rule index, or `num_rules` for the default action).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub slot: usize,
}

#[derive(Debug, Clone)]
struct Rule {
    action: Action,
    m: MatchConfig,
}

impl Rule {
    fn matches(&self, s: &PacketSummary) -> bool {
        if let Some(et) = self.m.eth_type {
            if et != s.eth_type {
                return false;
            }
        }
        if let Some(cidr) = &self.m.ip_src {
            match s.l3 {
                Some(l3) if cidr.matches(l3.src) => {}
                _ => return false,
            }
        }
        if let Some(cidr) = &self.m.ip_dst {
            match s.l3 {
                Some(l3) if cidr.matches(l3.dst) => {}
                _ => return false,
            }
        }
        if let Some(proto) = self.m.protocol {
            match s.l3 {
                Some(l3) if l3.protocol == proto => {}
                _ => return false,
            }
        }
        if let Some(port) = self.m.port_src {
            match s.l4 {
                Some(l4) if l4.src == port => {}
                _ => return false,
            }
        }
        if let Some(port) = self.m.port_dst {
            match s.l4 {
                Some(l4) if l4.dst == port => {}
                _ => return false,
            }
        }
        true
    }
}

/// Compiled filter shared read-only by all workers.
pub struct FilterEngine {
    rules: Vec<Rule>,
    default_action: Action,
    /// `rules.len() + 1` slots; the last one counts default-action packets.
    /// `None` when per-rule accounting is disabled.
    hits: Option<Vec<AtomicU64>>,
}

impl FilterEngine {
    pub fn new(cfg: &FilterConfig, count_hits: bool) -> Self {
        let rules: Vec<Rule> = cfg
            .rules
            .iter()
            .map(|r| Rule { action: r.action, m: r.r#match.clone() })
            .collect();
        let hits =
            count_hits.then(|| (0..=rules.len()).map(|_| AtomicU64::new(0)).collect());
        FilterEngine { rules, default_action: cfg.default_action, hits }
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate one frame and account the hit.
    ///
    /// Frames shorter than an Ethernet header cannot be matched and are
    /// allowed, accounted at the default slot.
    pub fn evaluate(&self, pkt: &[u8]) -> Verdict {
        let verdict = match packet::parse(pkt) {
            Some(summary) => self.decide(&summary),
            None => Verdict { action: Action::Allow, slot: self.rules.len() },
        };
        if let Some(hits) = &self.hits {
            hits[verdict.slot].fetch_add(1, Ordering::Relaxed);
        }
        verdict
    }

    fn decide(&self, summary: &PacketSummary) -> Verdict {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.matches(summary) {
                return Verdict { action: rule.action, slot: i };
            }
        }
        Verdict { action: self.default_action, slot: self.rules.len() }
    }

    /// Snapshot of the hit counters (rule slots first, default slot last),
    /// or `None` when accounting is disabled.
    pub fn hit_counts(&self) -> Option<Vec<u64>> {
        self.hits
            .as_ref()
            .map(|hits| hits.iter().map(|h| h.load(Ordering::Relaxed)).collect())
    }

    pub fn reset_hits(&self) {
        if let Some(hits) = &self.hits {
            for h in hits {
                h.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Human-readable form of one slot for the hit dump;
    /// `slot == num_rules` formats the default action.
    pub fn describe_slot(&self, slot: usize) -> String {
        match self.rules.get(slot) {
            None => format!("(default) {}", self.default_action),
            Some(rule) => rule.to_string(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.action)?;
        let m = &self.m;
        if m.eth_type.is_none()
            && m.ip_src.is_none()
            && m.ip_dst.is_none()
            && m.protocol.is_none()
            && m.port_src.is_none()
            && m.port_dst.is_none()
        {
            return write!(f, "match: (any)");
        }
        write!(f, "match:")?;
        if let Some(et) = m.eth_type {
            write!(f, " eth_type=0x{et:x}")?;
        }
        if let Some(p) = m.protocol {
            match p {
                1 => write!(f, " protocol=icmp")?,
                6 => write!(f, " protocol=tcp")?,
                17 => write!(f, " protocol=udp")?,
                58 => write!(f, " protocol=icmpv6")?,
                other => write!(f, " protocol={other}")?,
            }
        }
        if let Some(p) = m.port_src {
            write!(f, " port_src={p}")?;
        }
        if let Some(p) = m.port_dst {
            write!(f, " port_dst={p}")?;
        }
        if let Some(c) = &m.ip_src {
            write!(f, " ip_src={c}")?;
        }
        if let Some(c) = &m.ip_dst {
            write!(f, " ip_dst={c}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::packet::testutil::tcpudp_frame;
    use crate::packet::{IPPROTO_TCP, IPPROTO_UDP};

    fn rule(action: Action, m: MatchConfig) -> RuleConfig {
        RuleConfig { action, r#match: m }
    }

    fn engine(default_action: Action, rules: Vec<RuleConfig>) -> FilterEngine {
        FilterEngine::new(&FilterConfig { default_action, rules }, true)
    }

    #[test]
    fn drop_https_allow_rest() {
        let eng = engine(
            Action::Allow,
            vec![rule(
                Action::Drop,
                MatchConfig { protocol: Some(6), port_dst: Some(443), ..Default::default() },
            )],
        );

        let https = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 33000, 443, 64);
        let dns = tcpudp_frame(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 33000, 53, 64);

        let v1 = eng.evaluate(&https);
        assert_eq!((v1.action, v1.slot), (Action::Drop, 0));
        let v2 = eng.evaluate(&dns);
        assert_eq!((v2.action, v2.slot), (Action::Allow, 1));

        assert_eq!(eng.hit_counts().unwrap(), vec![1, 1]);
    }

    #[test]
    fn cidr_source_match() {
        let eng = engine(
            Action::Drop,
            vec![rule(
                Action::Allow,
                MatchConfig {
                    ip_src: Some("192.168.200.0/24".parse().unwrap()),
                    ..Default::default()
                },
            )],
        );

        let inside = tcpudp_frame(IPPROTO_TCP, [192, 168, 200, 17], [8, 8, 8, 8], 55000, 443, 64);
        let outside = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [8, 8, 8, 8], 55000, 443, 64);

        assert_eq!(eng.evaluate(&inside).action, Action::Allow);
        let v = eng.evaluate(&outside);
        assert_eq!(v.action, Action::Drop);
        assert_eq!(v.slot, 1);
    }

    #[test]
    fn first_match_wins() {
        let eng = engine(
            Action::Drop,
            vec![
                rule(
                    Action::Allow,
                    MatchConfig { protocol: Some(6), ..Default::default() },
                ),
                rule(
                    Action::Drop,
                    MatchConfig { protocol: Some(6), port_dst: Some(22), ..Default::default() },
                ),
            ],
        );
        // Both rules match; rule 0 decides.
        let ssh = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 40000, 22, 64);
        let v = eng.evaluate(&ssh);
        assert_eq!((v.action, v.slot), (Action::Allow, 0));
    }

    #[test]
    fn constraint_on_missing_field_never_matches() {
        // Port constraint against an ICMP packet (no ports parsed).
        let eng = engine(
            Action::Allow,
            vec![rule(
                Action::Drop,
                MatchConfig { port_dst: Some(443), ..Default::default() },
            )],
        );
        let icmp = tcpudp_frame(1, [10, 0, 0, 1], [10, 0, 0, 2], 0, 0, 64);
        let v = eng.evaluate(&icmp);
        assert_eq!((v.action, v.slot), (Action::Allow, 1));
    }

    #[test]
    fn empty_match_matches_everything() {
        let eng = engine(Action::Allow, vec![rule(Action::Drop, MatchConfig::default())]);
        let pkt = tcpudp_frame(IPPROTO_UDP, [1, 1, 1, 1], [2, 2, 2, 2], 1000, 2000, 64);
        assert_eq!(eng.evaluate(&pkt).slot, 0);
    }

    #[test]
    fn short_frames_bypass_as_allow() {
        let eng = engine(Action::Drop, vec![rule(Action::Drop, MatchConfig::default())]);
        let v = eng.evaluate(&[0u8; 10]);
        assert_eq!(v.action, Action::Allow);
        assert_eq!(v.slot, 1); // accounted at the default slot
    }

    #[test]
    fn evaluation_is_deterministic() {
        let eng = engine(
            Action::Allow,
            vec![rule(
                Action::Drop,
                MatchConfig { protocol: Some(6), port_dst: Some(443), ..Default::default() },
            )],
        );
        let pkt = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 33000, 443, 300);
        let a = eng.evaluate(&pkt);
        let b = eng.evaluate(&pkt);
        assert_eq!(a, b);
    }

    #[test]
    fn hit_counts_sum_to_packets_filtered() {
        let eng = engine(
            Action::Allow,
            vec![rule(
                Action::Drop,
                MatchConfig { protocol: Some(17), ..Default::default() },
            )],
        );
        for i in 0..10u16 {
            let proto = if i % 2 == 0 { IPPROTO_UDP } else { IPPROTO_TCP };
            let pkt = tcpudp_frame(proto, [10, 0, 0, 1], [10, 0, 0, 2], 1000 + i, 53, 64);
            eng.evaluate(&pkt);
        }
        let hits = eng.hit_counts().unwrap();
        assert_eq!(hits.iter().sum::<u64>(), 10);
        assert_eq!(hits, vec![5, 5]);
    }

    #[test]
    fn disabled_accounting_counts_nothing() {
        let eng = FilterEngine::new(
            &FilterConfig { default_action: Action::Allow, rules: vec![] },
            false,
        );
        let pkt = tcpudp_frame(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 64);
        eng.evaluate(&pkt);
        assert!(eng.hit_counts().is_none());
    }

    #[test]
    fn slot_descriptions() {
        let eng = engine(
            Action::Allow,
            vec![rule(
                Action::Drop,
                MatchConfig {
                    protocol: Some(6),
                    port_dst: Some(443),
                    ip_src: Some("10.0.0.0/8".parse().unwrap()),
                    ..Default::default()
                },
            )],
        );
        assert_eq!(
            eng.describe_slot(0),
            "drop match: protocol=tcp port_dst=443 ip_src=10.0.0.0/8"
        );
        assert_eq!(eng.describe_slot(1), "(default) allow");
    }
}
