//! Periodic scan that turns accrued imbalances into settlement triggers.

use {
    crate::{
        domain::{
            account::SettlementState,
            ledger::Ledger,
            settlement::SettlementRequired,
            telemetry,
        },
        infra::telemetry::Broker,
    },
    std::{sync::Arc, time::Duration},
    tokio::sync::mpsc,
};

pub struct Monitor {
    ledger: Arc<Ledger>,
    broker: Arc<Broker>,
    triggers: mpsc::Sender<SettlementRequired>,
    interval: Duration,
}

impl Monitor {
    pub fn new(
        ledger: Arc<Ledger>,
        broker: Arc<Broker>,
        triggers: mpsc::Sender<SettlementRequired>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            broker,
            triggers,
            interval,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.scan().await;
            }
        })
    }

    /// One pass over all accounts with a configured threshold. We settle
    /// what we owe: the scan fires when the credit balance reaches the
    /// threshold, and settles the full accrued credit.
    pub async fn scan(&self) {
        for (key, account) in self.ledger.snapshot_all().await {
            let Some(threshold) = account.settlement_threshold else {
                continue;
            };
            // PENDING and IN_PROGRESS accounts are re-evaluated only after
            // the settlement engine resolved them.
            if account.settlement_state != SettlementState::Idle {
                continue;
            }
            if account.credit_balance < threshold {
                continue;
            }
            if !self.ledger.begin_settlement(&key).await {
                continue;
            }

            let amount = account.credit_balance;
            self.broker.emit(telemetry::Kind::SettlementTriggered {
                peer_id: key.peer.clone(),
                asset: key.asset.clone(),
                current_balance: amount,
                threshold,
                exceeds_by: amount - threshold,
            });
            if self
                .triggers
                .send(SettlementRequired {
                    peer: key.peer.clone(),
                    asset: key.asset.clone(),
                    amount,
                })
                .await
                .is_err()
            {
                tracing::error!("settlement engine is gone, aborting trigger");
                self.ledger.abort_settlement(&key).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::domain::{
            account::{AssetId, PeerId},
            eth::U256,
        },
    };

    #[tokio::test]
    async fn triggers_only_above_threshold() {
        let ledger = Arc::new(Ledger::default());
        let broker = Arc::new(Broker::new("node-test", None, 16));
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = Monitor::new(
            Arc::clone(&ledger),
            broker,
            tx,
            Duration::from_secs(30),
        );

        let peer = PeerId::new("peer-b");
        let asset = AssetId::new("ILP");
        ledger.ensure_account(peer.clone(), asset.clone(), None, Some(U256::from(5000)));
        ledger.credit(&peer, &asset, U256::from(4000)).await.unwrap();

        monitor.scan().await;
        assert!(rx.try_recv().is_err());

        ledger.credit(&peer, &asset, U256::from(1500)).await.unwrap();
        monitor.scan().await;
        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.amount, U256::from(5500));

        // The account is PENDING now; a second scan must not re-trigger.
        monitor.scan().await;
        assert!(rx.try_recv().is_err());
    }
}
