//! Built-in fraud rules.

use {
    super::{Detection, Rule, Severity},
    crate::domain::{account::PeerId, telemetry},
    dashmap::DashMap,
    std::{
        collections::VecDeque,
        time::{Duration, Instant},
    },
};

/// Fires when a peer pushes more packets inside the window than the
/// configured ceiling. Catches floods that stay just under the token
/// bucket's sustained rate.
pub struct PacketFlood {
    window: Duration,
    max_packets: usize,
    seen: DashMap<PeerId, VecDeque<Instant>>,
}

impl PacketFlood {
    pub fn new(window: Duration, max_packets: usize) -> Self {
        Self {
            window,
            max_packets,
            seen: DashMap::new(),
        }
    }
}

impl Rule for PacketFlood {
    fn name(&self) -> &'static str {
        "packet-flood"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, event: &telemetry::Event) -> anyhow::Result<Option<Detection>> {
        let telemetry::Kind::PacketReceived { peer_id, .. } = &event.kind else {
            return Ok(None);
        };
        let now = Instant::now();
        let mut timestamps = self.seen.entry(peer_id.clone()).or_default();
        timestamps.push_back(now);
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() > self.max_packets {
            timestamps.clear();
            return Ok(Some(Detection {
                peer_id: Some(peer_id.clone()),
                details: format!(
                    "more than {} packets within {:?}",
                    self.max_packets, self.window
                ),
            }));
        }
        Ok(None)
    }
}

/// Fires when nearly everything a peer sends gets rejected. A high reject
/// ratio usually means probing or a broken integration burning liquidity
/// reservations.
pub struct RejectStorm {
    min_samples: usize,
    max_reject_ratio: f64,
    counts: DashMap<PeerId, (u64, u64)>,
}

impl RejectStorm {
    pub fn new(min_samples: usize, max_reject_ratio: f64) -> Self {
        Self {
            min_samples,
            max_reject_ratio,
            counts: DashMap::new(),
        }
    }
}

impl Rule for RejectStorm {
    fn name(&self) -> &'static str {
        "reject-storm"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn check(&self, event: &telemetry::Event) -> anyhow::Result<Option<Detection>> {
        let peer_id = match &event.kind {
            telemetry::Kind::PacketReceived { peer_id, .. } => {
                self.counts.entry(peer_id.clone()).or_insert((0, 0)).0 += 1;
                return Ok(None);
            }
            telemetry::Kind::PacketRejected { peer_id, .. } => peer_id.clone(),
            _ => return Ok(None),
        };

        let mut counts = self.counts.entry(peer_id.clone()).or_insert((0, 0));
        counts.1 += 1;
        let (received, rejected) = *counts;
        let total = received + rejected;
        if (total as usize) < self.min_samples {
            return Ok(None);
        }
        let ratio = rejected as f64 / total as f64;
        if ratio > self.max_reject_ratio {
            *counts = (0, 0);
            return Ok(Some(Detection {
                peer_id: Some(peer_id),
                details: format!("reject ratio {ratio:.2} over {total} packets"),
            }));
        }
        Ok(None)
    }
}

/// Escalates wallet-balance mismatches reported by reconciliation. A node
/// wallet that does not hold what the ledger says it should is either a
/// double-settlement or an external drain.
pub struct BalanceMismatch;

impl Rule for BalanceMismatch {
    fn name(&self) -> &'static str {
        "wallet-balance-mismatch"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(&self, event: &telemetry::Event) -> anyhow::Result<Option<Detection>> {
        let telemetry::Kind::WalletBalanceMismatch {
            address,
            expected,
            actual,
        } = &event.kind
        else {
            return Ok(None);
        };
        Ok(Some(Detection {
            peer_id: None,
            details: format!("wallet {address} holds {actual}, ledger expects {expected}"),
        }))
    }
}

/// The default rule set.
pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(PacketFlood::new(Duration::from_secs(10), 500)),
        Box::new(RejectStorm::new(20, 0.8)),
        Box::new(BalanceMismatch),
    ]
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::domain::{eth::U256, packet::PacketId, telemetry::Timestamp},
    };

    fn received(peer: &str) -> telemetry::Event {
        telemetry::Event {
            node_id: "node-test".to_owned(),
            timestamp: Timestamp::now(),
            kind: telemetry::Kind::PacketReceived {
                peer_id: PeerId::new(peer),
                packet_id: PacketId::random(),
                destination: "g.c.x".parse().unwrap(),
                amount: U256::from(1),
            },
        }
    }

    fn rejected(peer: &str) -> telemetry::Event {
        telemetry::Event {
            node_id: "node-test".to_owned(),
            timestamp: Timestamp::now(),
            kind: telemetry::Kind::PacketRejected {
                peer_id: PeerId::new(peer),
                packet_id: PacketId::random(),
                code: "F02".to_owned(),
                message: "no route".to_owned(),
            },
        }
    }

    #[test]
    fn packet_flood_fires_above_ceiling() {
        let rule = PacketFlood::new(Duration::from_secs(60), 5);
        for _ in 0..5 {
            assert!(rule.check(&received("peer-a")).unwrap().is_none());
        }
        let detection = rule.check(&received("peer-a")).unwrap().unwrap();
        assert_eq!(detection.peer_id, Some(PeerId::new("peer-a")));
    }

    #[test]
    fn reject_storm_needs_samples_and_ratio() {
        let rule = RejectStorm::new(4, 0.5);
        assert!(rule.check(&rejected("peer-a")).unwrap().is_none());
        assert!(rule.check(&received("peer-a")).unwrap().is_none());
        assert!(rule.check(&rejected("peer-a")).unwrap().is_none());
        // Fourth sample, 3 of 4 rejected.
        let detection = rule.check(&rejected("peer-a")).unwrap();
        assert!(detection.is_some());
    }

    #[test]
    fn balance_mismatch_always_detects() {
        let event = telemetry::Event {
            node_id: "node-test".to_owned(),
            timestamp: Timestamp::now(),
            kind: telemetry::Kind::WalletBalanceMismatch {
                address: "0xabc".to_owned(),
                expected: U256::from(100),
                actual: U256::from(40),
            },
        };
        let detection = BalanceMismatch.check(&event).unwrap().unwrap();
        assert!(detection.details.contains("0xabc"));
    }
}
