//! Bilateral accounts kept per (peer, asset) pair.

use {
    crate::{domain::eth::{I256, U256}, util::serialize},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_with::serde_as,
    std::{
        collections::VecDeque,
        fmt::{self, Debug, Display, Formatter},
    },
};

/// Opaque identifier of a directly connected counterparty.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Asset identifier in its smallest unit, e.g. `"ILP"`, `"USDC"`, `"XRP"`.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for AssetId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for AssetId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Ledger key of one bilateral account.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct AccountKey {
    pub peer: PeerId,
    pub asset: AssetId,
}

/// Where an account is in its settlement lifecycle. The threshold monitor
/// owns the transition into PENDING, the settlement engine owns IN_PROGRESS.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Idle,
    Pending,
    InProgress,
}

/// Net-balance samples retained per account.
pub const HISTORY_SAMPLES: usize = 20;

/// One bilateral account. `debit` is what the peer owes us for packets we
/// forwarded on their behalf, `credit` is what we owe them.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde_as(as = "serialize::U256")]
    pub debit_balance: U256,
    #[serde_as(as = "serialize::U256")]
    pub credit_balance: U256,
    /// `credit − debit`, maintained eagerly; serialized as a decimal string.
    #[serde(serialize_with = "serialize_i256")]
    pub net_balance: I256,
    #[serde_as(as = "Option<serialize::U256>")]
    pub credit_limit: Option<U256>,
    #[serde_as(as = "Option<serialize::U256>")]
    pub settlement_threshold: Option<U256>,
    pub settlement_state: SettlementState,
    pub last_updated: DateTime<Utc>,
    /// Ring of the most recent `(unix_ms, net)` samples, oldest first.
    #[serde(serialize_with = "serialize_history")]
    pub history: VecDeque<(i64, I256)>,
}

fn serialize_i256<S: serde::Serializer>(value: &I256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

fn serialize_history<S: serde::Serializer>(
    history: &VecDeque<(i64, I256)>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(history.len()))?;
    for (timestamp, net) in history {
        seq.serialize_element(&(timestamp, net.to_string()))?;
    }
    seq.end()
}

impl Account {
    pub fn new(credit_limit: Option<U256>, settlement_threshold: Option<U256>) -> Self {
        Self {
            debit_balance: U256::ZERO,
            credit_balance: U256::ZERO,
            net_balance: I256::ZERO,
            credit_limit,
            settlement_threshold,
            settlement_state: SettlementState::Idle,
            last_updated: Utc::now(),
            history: VecDeque::with_capacity(HISTORY_SAMPLES),
        }
    }

    /// Recomputes the net balance and appends a history sample. Called after
    /// every balance mutation.
    pub fn record(&mut self) {
        self.net_balance = net_of(self.credit_balance, self.debit_balance);
        self.last_updated = Utc::now();
        if self.history.len() == HISTORY_SAMPLES {
            self.history.pop_front();
        }
        self.history
            .push_back((self.last_updated.timestamp_millis(), self.net_balance));
    }
}

/// `credit − debit` as a signed 256-bit value, saturating at the (practically
/// unreachable) I256 range ends.
pub fn net_of(credit: U256, debit: U256) -> I256 {
    if credit >= debit {
        I256::try_from(credit - debit).unwrap_or(I256::MAX)
    } else {
        -I256::try_from(debit - credit).unwrap_or(I256::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_is_credit_minus_debit() {
        assert_eq!(net_of(U256::from(10), U256::from(3)), I256::try_from(7).unwrap());
        assert_eq!(net_of(U256::from(3), U256::from(10)), I256::try_from(-7).unwrap());
        assert_eq!(net_of(U256::ZERO, U256::ZERO), I256::ZERO);
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut account = Account::new(None, None);
        for i in 0..(HISTORY_SAMPLES + 5) {
            account.credit_balance = U256::from(i);
            account.record();
        }
        assert_eq!(account.history.len(), HISTORY_SAMPLES);
        let (_, newest) = account.history.back().unwrap();
        assert_eq!(*newest, account.net_balance);
    }
}
