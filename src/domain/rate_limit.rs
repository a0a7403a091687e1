//! Per-peer token-bucket admission control.
//!
//! This is also the enforcement point for fraud pauses: a paused peer's
//! bucket reports exhausted until the peer is resumed.

use {
    crate::domain::{account::PeerId, fraud},
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    serde::Serialize,
    std::{collections::HashMap, time::Instant},
};

/// Bucket parameters: capacity and sustained refill rate.
#[derive(Clone, Copy, Debug)]
pub struct Limit {
    pub burst: u32,
    pub refill_per_sec: f64,
}

impl Default for Limit {
    fn default() -> Self {
        Self {
            burst: 100,
            refill_per_sec: 50.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
    limit: Limit,
}

impl Bucket {
    fn new(limit: Limit) -> Self {
        Self {
            tokens: limit.burst as f64,
            refilled: Instant::now(),
            limit,
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.limit.refill_per_sec).min(self.limit.burst as f64);
        self.refilled = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Why a peer was paused, kept for the control API and telemetry.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRecord {
    pub reason: String,
    pub rule: String,
    pub severity: fraud::Severity,
    pub paused_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum Decision {
    Allowed,
    Exhausted,
    Paused,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<PeerId, Bucket>,
    overrides: HashMap<PeerId, Limit>,
    default_limit: Limit,
    paused: DashMap<PeerId, PauseRecord>,
}

impl RateLimiter {
    pub fn new(default_limit: Limit, overrides: HashMap<PeerId, Limit>) -> Self {
        Self {
            buckets: DashMap::new(),
            overrides,
            default_limit,
            paused: DashMap::new(),
        }
    }

    pub fn check(&self, peer: &PeerId) -> Decision {
        if self.paused.contains_key(peer) {
            return Decision::Paused;
        }
        let limit = self
            .overrides
            .get(peer)
            .copied()
            .unwrap_or(self.default_limit);
        let mut bucket = self
            .buckets
            .entry(peer.clone())
            .or_insert_with(|| Bucket::new(limit));
        if bucket.try_take() {
            Decision::Allowed
        } else {
            Decision::Exhausted
        }
    }

    pub fn pause_record(&self, peer: &PeerId) -> Option<PauseRecord> {
        self.paused.get(peer).map(|record| record.clone())
    }
}

impl fraud::PauseController for RateLimiter {
    fn pause_peer(&self, peer: &PeerId, reason: &str, rule: &str, severity: fraud::Severity) {
        self.paused.insert(
            peer.clone(),
            PauseRecord {
                reason: reason.to_owned(),
                rule: rule.to_owned(),
                severity,
                paused_at: Utc::now(),
            },
        );
    }

    fn resume_peer(&self, peer: &PeerId) {
        self.paused.remove(peer);
    }

    fn is_paused(&self, peer: &PeerId) -> bool {
        self.paused.contains_key(peer)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::domain::fraud::PauseController};

    #[test]
    fn burst_exhausts_then_denies() {
        let limiter = RateLimiter::new(
            Limit {
                burst: 3,
                refill_per_sec: 0.0,
            },
            HashMap::new(),
        );
        let peer = PeerId::new("peer-a");
        assert!(matches!(limiter.check(&peer), Decision::Allowed));
        assert!(matches!(limiter.check(&peer), Decision::Allowed));
        assert!(matches!(limiter.check(&peer), Decision::Allowed));
        assert!(matches!(limiter.check(&peer), Decision::Exhausted));
    }

    #[test]
    fn paused_peer_is_denied_until_resumed() {
        let limiter = RateLimiter::new(Limit::default(), HashMap::new());
        let peer = PeerId::new("peer-a");
        limiter.pause_peer(&peer, "reject storm", "reject-storm", fraud::Severity::High);
        assert!(matches!(limiter.check(&peer), Decision::Paused));
        assert!(limiter.is_paused(&peer));

        limiter.resume_peer(&peer);
        assert!(matches!(limiter.check(&peer), Decision::Allowed));
    }

    #[test]
    fn per_peer_overrides_apply() {
        let peer = PeerId::new("peer-a");
        let limiter = RateLimiter::new(
            Limit::default(),
            HashMap::from([(
                peer.clone(),
                Limit {
                    burst: 1,
                    refill_per_sec: 0.0,
                },
            )]),
        );
        assert!(matches!(limiter.check(&peer), Decision::Allowed));
        assert!(matches!(limiter.check(&peer), Decision::Exhausted));
    }
}
