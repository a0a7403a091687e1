//! Rule-driven misuse detection over the telemetry stream.
//!
//! The detector is deliberately decoupled from the packet pipeline: it only
//! sees telemetry and acts back through the narrow [`PauseController`] seam,
//! so neither side owns the other.

use {
    crate::{
        domain::{account::PeerId, telemetry},
        infra::telemetry::Broker,
    },
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    tokio::sync::broadcast,
};

pub mod rules;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What a rule reports when it fires.
#[derive(Clone, Debug)]
pub struct Detection {
    pub peer_id: Option<PeerId>,
    pub details: String,
}

/// A single fraud rule. Failures are isolated: an error from one rule never
/// prevents the remaining rules from running.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;
    fn severity(&self) -> Severity;
    fn check(&self, event: &telemetry::Event) -> anyhow::Result<Option<Detection>>;
}

/// The seam through which detections throttle a peer's traffic. Implemented
/// by the pipeline's rate limiter.
pub trait PauseController: Send + Sync {
    fn pause_peer(&self, peer: &PeerId, reason: &str, rule: &str, severity: Severity);
    fn resume_peer(&self, peer: &PeerId);
    fn is_paused(&self, peer: &PeerId) -> bool;
}

pub struct Detector {
    rules: Vec<Box<dyn Rule>>,
    scores: DashMap<PeerId, f64>,
    pause: Arc<dyn PauseController>,
    broker: Arc<Broker>,
    pause_threshold: Severity,
}

impl Detector {
    pub fn new(
        rules: Vec<Box<dyn Rule>>,
        pause: Arc<dyn PauseController>,
        broker: Arc<Broker>,
        pause_threshold: Severity,
    ) -> Arc<Self> {
        Arc::new(Self {
            rules,
            scores: DashMap::new(),
            pause,
            broker,
            pause_threshold,
        })
    }

    pub fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<telemetry::Event>,
    ) -> tokio::task::JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => detector.evaluate(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "fraud detector lagged behind telemetry");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn evaluate(&self, event: &telemetry::Event) {
        // Events from paused peers are ignored until resumption.
        if let Some(peer) = event_peer(event) {
            if self.pause.is_paused(&peer) {
                return;
            }
        }
        for rule in &self.rules {
            match rule.check(event) {
                Ok(Some(detection)) => self.on_detection(rule.as_ref(), detection),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(rule = rule.name(), ?err, "fraud rule failed, continuing");
                }
            }
        }
    }

    /// Reputation score in `[0, 1]`, starting at 1.0 and dropping with
    /// detections by rule severity.
    pub fn reputation(&self, peer: &PeerId) -> f64 {
        self.scores.get(peer).map(|score| *score).unwrap_or(1.0)
    }

    pub fn resume_peer(&self, peer: &PeerId) {
        self.pause.resume_peer(peer);
        self.scores.insert(peer.clone(), 1.0);
        self.broker.emit(telemetry::Kind::PeerResumed {
            peer_id: peer.clone(),
        });
    }

    fn on_detection(&self, rule: &dyn Rule, detection: Detection) {
        let severity = rule.severity();
        tracing::warn!(
            rule = rule.name(),
            ?severity,
            peer = ?detection.peer_id,
            details = %detection.details,
            "fraud rule fired"
        );
        self.broker.emit(telemetry::Kind::SuspiciousActivityDetected {
            peer_id: detection.peer_id.clone(),
            rule: rule.name().to_owned(),
            severity,
            details: detection.details.clone(),
        });
        self.broker.emit(telemetry::Kind::FraudDetected {
            peer_id: detection.peer_id.clone(),
            rule: rule.name().to_owned(),
            severity,
            details: detection.details.clone(),
        });

        let Some(peer) = detection.peer_id else {
            return;
        };
        let penalty = match severity {
            Severity::Low => 0.05,
            Severity::Medium => 0.15,
            Severity::High => 0.4,
            Severity::Critical => 1.0,
        };
        let mut score = self.scores.entry(peer.clone()).or_insert(1.0);
        *score = (*score - penalty).max(0.0);
        drop(score);

        if severity >= self.pause_threshold {
            self.pause
                .pause_peer(&peer, &detection.details, rule.name(), severity);
            self.broker.emit(telemetry::Kind::PeerPaused {
                peer_id: peer,
                reason: detection.details,
                rule: rule.name().to_owned(),
                severity,
            });
        }
    }
}

fn event_peer(event: &telemetry::Event) -> Option<PeerId> {
    event.kind.extracted().peer_id.map(PeerId::new)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Default)]
    struct RecordingPause {
        paused: Mutex<Vec<PeerId>>,
    }

    impl PauseController for RecordingPause {
        fn pause_peer(&self, peer: &PeerId, _: &str, _: &str, _: Severity) {
            self.paused.lock().unwrap().push(peer.clone());
        }

        fn resume_peer(&self, peer: &PeerId) {
            self.paused.lock().unwrap().retain(|p| p != peer);
        }

        fn is_paused(&self, peer: &PeerId) -> bool {
            self.paused.lock().unwrap().contains(peer)
        }
    }

    struct FailingRule;

    impl Rule for FailingRule {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn severity(&self) -> Severity {
            Severity::Low
        }

        fn check(&self, _: &telemetry::Event) -> anyhow::Result<Option<Detection>> {
            anyhow::bail!("rule blew up")
        }
    }

    struct CountingRule {
        calls: AtomicUsize,
        severity: Severity,
    }

    impl Rule for CountingRule {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn severity(&self) -> Severity {
            self.severity
        }

        fn check(&self, event: &telemetry::Event) -> anyhow::Result<Option<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Detection {
                peer_id: event_peer(event),
                details: "always fires".to_owned(),
            }))
        }
    }

    fn event(peer: &str) -> telemetry::Event {
        telemetry::Event {
            node_id: "node-test".to_owned(),
            timestamp: telemetry::Timestamp::now(),
            kind: telemetry::Kind::PacketRejected {
                peer_id: PeerId::new(peer),
                packet_id: crate::domain::packet::PacketId::new("p-1"),
                code: "T05".to_owned(),
                message: "rate limited".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn rule_failure_does_not_stop_later_rules() {
        let pause = Arc::new(RecordingPause::default());
        let broker = Arc::new(Broker::new("node-test", None, 16));
        let detector = Detector::new(
            vec![
                Box::new(FailingRule),
                Box::new(CountingRule {
                    calls: AtomicUsize::new(0),
                    severity: Severity::Low,
                }),
            ],
            pause,
            broker,
            Severity::High,
        );

        detector.evaluate(&event("peer-a"));
        // The counting rule ran despite the failing rule before it.
        assert!(detector.reputation(&PeerId::new("peer-a")) < 1.0);
    }

    #[tokio::test]
    async fn severe_detection_pauses_and_mutes_the_peer() {
        let pause = Arc::new(RecordingPause::default());
        let broker = Arc::new(Broker::new("node-test", None, 16));
        let detector = Detector::new(
            vec![Box::new(CountingRule {
                calls: AtomicUsize::new(0),
                severity: Severity::High,
            })],
            Arc::clone(&pause) as Arc<dyn PauseController>,
            broker,
            Severity::High,
        );

        let peer = PeerId::new("peer-a");
        detector.evaluate(&event("peer-a"));
        assert!(pause.is_paused(&peer));

        // Further events from the paused peer are ignored.
        let before = detector.reputation(&peer);
        detector.evaluate(&event("peer-a"));
        assert_eq!(detector.reputation(&peer), before);

        detector.resume_peer(&peer);
        assert!(!pause.is_paused(&peer));
        assert_eq!(detector.reputation(&peer), 1.0);
    }
}
