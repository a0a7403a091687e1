//! Double-entry ledger of bilateral balances.
//!
//! Every mutation of one `(peer, asset)` account is serialized behind a
//! per-key async lock. When an external two-phase engine is configured, the
//! ledger mirrors reservations into it and fails closed if it becomes
//! unreachable: accounting must never lag behind forwarding.

use {
    crate::{
        domain::{
            account::{Account, AccountKey, AssetId, PeerId, SettlementState},
            eth::U256,
        },
        util::retry::Retryable,
    },
    async_trait::async_trait,
    dashmap::DashMap,
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    tokio::sync::Mutex,
};

/// An external double-entry engine with two-phase transfers
/// (TigerBeetle-style). The in-process ledger stays authoritative for
/// snapshots; the engine sees the same prepare/commit/rollback stream.
#[async_trait]
pub trait TwoPhaseEngine: Send + Sync + 'static {
    async fn prepare(&self, key: &AccountKey, amount: U256) -> Result<(), EngineError>;
    async fn commit(&self, key: &AccountKey, amount: U256) -> Result<(), EngineError>;
    async fn rollback(&self, key: &AccountKey, amount: U256) -> Result<(), EngineError>;
    async fn credit(&self, key: &AccountKey, amount: U256) -> Result<(), EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ledger engine unavailable: {0}")]
    Unavailable(String),
    #[error("ledger engine rejected transfer: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credit limit exceeded")]
    InsufficientCredit,
    #[error("ledger is failed closed")]
    Unavailable,
    #[error("no account for {0:?}")]
    UnknownAccount(AccountKey),
}

impl Retryable for Error {
    fn retryable(&self) -> bool {
        false
    }
}

/// A pending debit reserved against an account. Must be resolved with
/// [`Ledger::commit`] or [`Ledger::rollback`]; dropping it unresolved is a
/// pipeline bug and is logged as such.
#[derive(Debug)]
pub struct Reservation {
    key: AccountKey,
    amount: U256,
    resolved: bool,
}

impl Reservation {
    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn amount(&self) -> U256 {
        self.amount
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::error!(
                peer = %self.key.peer,
                asset = %self.key.asset,
                amount = %self.amount,
                "reservation dropped without commit or rollback"
            );
        }
    }
}

#[derive(Default)]
pub struct Ledger {
    accounts: DashMap<AccountKey, Arc<Mutex<Account>>>,
    engine: Option<Arc<dyn TwoPhaseEngine>>,
    failed_closed: AtomicBool,
}

impl Ledger {
    pub fn new(engine: Option<Arc<dyn TwoPhaseEngine>>) -> Self {
        Self {
            accounts: DashMap::new(),
            engine,
            failed_closed: AtomicBool::new(false),
        }
    }

    /// Creates the account for a configured peer with its limits. Accounts
    /// for unconfigured keys are created on first touch without limits.
    pub fn ensure_account(
        &self,
        peer: PeerId,
        asset: AssetId,
        credit_limit: Option<U256>,
        settlement_threshold: Option<U256>,
    ) {
        self.accounts
            .entry(AccountKey { peer, asset })
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(credit_limit, settlement_threshold))));
    }

    fn account(&self, key: &AccountKey) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(None, None))))
            .clone()
    }

    /// Reserves `amount` as a pending debit. Enforces the credit limit and
    /// mirrors into the external engine before the local balance moves.
    pub async fn prepare(
        &self,
        peer: &PeerId,
        asset: &AssetId,
        amount: U256,
    ) -> Result<Reservation, Error> {
        if self.failed_closed.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        let key = AccountKey {
            peer: peer.clone(),
            asset: asset.clone(),
        };
        let account = self.account(&key);
        let mut account = account.lock().await;

        if let Some(limit) = account.credit_limit {
            // The reservation pushes net in the negative direction; the
            // resulting debt must stay within the peer's credit limit.
            let debit_after = account.debit_balance.saturating_add(amount);
            let owed = debit_after.saturating_sub(account.credit_balance);
            if owed > limit {
                return Err(Error::InsufficientCredit);
            }
        }

        self.mirror(|engine| engine.prepare(&key, amount)).await?;

        account.debit_balance += amount;
        account.record();
        Ok(Reservation {
            key,
            amount,
            resolved: false,
        })
    }

    /// Finalizes a reservation after a valid Fulfill came back.
    pub async fn commit(&self, mut reservation: Reservation) -> Result<(), Error> {
        reservation.resolved = true;
        let key = reservation.key.clone();
        let account = self.account(&key);
        let mut account = account.lock().await;
        self.mirror(|engine| engine.commit(&key, reservation.amount))
            .await?;
        account.record();
        Ok(())
    }

    /// Releases a reservation after a Reject or timeout.
    pub async fn rollback(&self, mut reservation: Reservation) -> Result<(), Error> {
        reservation.resolved = true;
        let key = reservation.key.clone();
        let account = self.account(&key);
        let mut account = account.lock().await;
        self.mirror(|engine| engine.rollback(&key, reservation.amount))
            .await?;
        account.debit_balance = account.debit_balance.saturating_sub(reservation.amount);
        account.record();
        Ok(())
    }

    /// Credits the peer for value they delivered on our behalf.
    pub async fn credit(&self, peer: &PeerId, asset: &AssetId, amount: U256) -> Result<(), Error> {
        let key = AccountKey {
            peer: peer.clone(),
            asset: asset.clone(),
        };
        let account = self.account(&key);
        let mut account = account.lock().await;
        self.mirror(|engine| engine.credit(&key, amount)).await?;
        account.credit_balance += amount;
        account.record();
        Ok(())
    }

    /// Reduces the outstanding credit balance by the settled amount and
    /// returns the account to IDLE.
    pub async fn record_settlement(&self, peer: &PeerId, asset: &AssetId, amount: U256) {
        let key = AccountKey {
            peer: peer.clone(),
            asset: asset.clone(),
        };
        let account = self.account(&key);
        let mut account = account.lock().await;
        account.credit_balance = account.credit_balance.saturating_sub(amount);
        account.settlement_state = SettlementState::Idle;
        account.record();
    }

    /// IDLE → PENDING, owned by the threshold monitor. Returns false when the
    /// account is already being settled.
    pub async fn begin_settlement(&self, key: &AccountKey) -> bool {
        let account = self.account(key);
        let mut account = account.lock().await;
        if account.settlement_state == SettlementState::Idle {
            account.settlement_state = SettlementState::Pending;
            true
        } else {
            false
        }
    }

    /// PENDING → IN_PROGRESS, owned by the settlement engine.
    pub async fn mark_in_progress(&self, key: &AccountKey) {
        let account = self.account(key);
        account.lock().await.settlement_state = SettlementState::InProgress;
    }

    /// Returns a failed settlement attempt to IDLE so a later scan can
    /// re-trigger it.
    pub async fn abort_settlement(&self, key: &AccountKey) {
        let account = self.account(key);
        account.lock().await.settlement_state = SettlementState::Idle;
    }

    pub async fn snapshot(&self, peer: &PeerId, asset: &AssetId) -> Option<Account> {
        let key = AccountKey {
            peer: peer.clone(),
            asset: asset.clone(),
        };
        let account = self.accounts.get(&key)?.clone();
        let snapshot = account.lock().await.clone();
        Some(snapshot)
    }

    pub async fn snapshot_all(&self) -> Vec<(AccountKey, Account)> {
        let handles: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for (key, account) in handles {
            let snapshot = account.lock().await.clone();
            snapshots.push((key, snapshot));
        }
        snapshots
    }

    pub fn is_failed_closed(&self) -> bool {
        self.failed_closed.load(Ordering::SeqCst)
    }

    async fn mirror<'a, F, Fut>(&'a self, op: F) -> Result<(), Error>
    where
        F: FnOnce(&'a dyn TwoPhaseEngine) -> Fut,
        Fut: std::future::Future<Output = Result<(), EngineError>> + 'a,
    {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        match op(engine.as_ref()).await {
            Ok(()) => Ok(()),
            Err(EngineError::Unavailable(reason)) => {
                tracing::error!(%reason, "ledger engine unreachable, failing closed");
                self.failed_closed.store(true, Ordering::SeqCst);
                Err(Error::Unavailable)
            }
            Err(EngineError::Rejected(reason)) => {
                tracing::warn!(%reason, "ledger engine rejected transfer");
                Err(Error::InsufficientCredit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::domain::eth::I256};

    fn key() -> (PeerId, AssetId) {
        (PeerId::new("peer-a"), AssetId::new("ILP"))
    }

    #[tokio::test]
    async fn prepare_commit_finalizes_debit() {
        let ledger = Ledger::default();
        let (peer, asset) = key();
        let reservation = ledger.prepare(&peer, &asset, U256::from(1000)).await.unwrap();
        ledger.commit(reservation).await.unwrap();

        let account = ledger.snapshot(&peer, &asset).await.unwrap();
        assert_eq!(account.debit_balance, U256::from(1000));
        assert_eq!(account.net_balance, I256::try_from(-1000).unwrap());
    }

    #[tokio::test]
    async fn rollback_releases_the_reservation() {
        let ledger = Ledger::default();
        let (peer, asset) = key();
        let reservation = ledger.prepare(&peer, &asset, U256::from(1000)).await.unwrap();
        ledger.rollback(reservation).await.unwrap();

        let account = ledger.snapshot(&peer, &asset).await.unwrap();
        assert_eq!(account.debit_balance, U256::ZERO);
        assert_eq!(account.net_balance, I256::ZERO);
    }

    #[tokio::test]
    async fn credit_limit_bounds_reservations() {
        let ledger = Ledger::default();
        let (peer, asset) = key();
        ledger.ensure_account(peer.clone(), asset.clone(), Some(U256::from(500)), None);

        assert!(ledger.prepare(&peer, &asset, U256::from(400)).await.is_ok());
        assert!(matches!(
            ledger.prepare(&peer, &asset, U256::from(200)).await,
            Err(Error::InsufficientCredit)
        ));
    }

    #[tokio::test]
    async fn settlement_reduces_credit_and_returns_to_idle() {
        let ledger = Ledger::default();
        let (peer, asset) = key();
        ledger.credit(&peer, &asset, U256::from(5500)).await.unwrap();

        let account_key = AccountKey {
            peer: peer.clone(),
            asset: asset.clone(),
        };
        assert!(ledger.begin_settlement(&account_key).await);
        // A second trigger while pending is suppressed.
        assert!(!ledger.begin_settlement(&account_key).await);

        ledger.mark_in_progress(&account_key).await;
        ledger.record_settlement(&peer, &asset, U256::from(5500)).await;

        let account = ledger.snapshot(&peer, &asset).await.unwrap();
        assert_eq!(account.credit_balance, U256::ZERO);
        assert_eq!(account.settlement_state, SettlementState::Idle);
        assert!(ledger.begin_settlement(&account_key).await);
    }

    #[tokio::test]
    async fn net_matches_credit_minus_debit_after_interleaving() {
        let ledger = Ledger::default();
        let (peer, asset) = key();
        let r1 = ledger.prepare(&peer, &asset, U256::from(300)).await.unwrap();
        ledger.credit(&peer, &asset, U256::from(1000)).await.unwrap();
        ledger.commit(r1).await.unwrap();
        let r2 = ledger.prepare(&peer, &asset, U256::from(100)).await.unwrap();
        ledger.rollback(r2).await.unwrap();

        let account = ledger.snapshot(&peer, &asset).await.unwrap();
        assert_eq!(
            account.net_balance,
            crate::domain::account::net_of(account.credit_balance, account.debit_balance),
        );
        assert_eq!(account.net_balance, I256::try_from(700).unwrap());
    }
}
