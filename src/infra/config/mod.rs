//! Node configuration, immutable after startup. `file` parses the TOML and
//! applies the environment overrides; this module holds the validated form
//! handed to each component at construction.

use {
    crate::{
        domain::{
            account::{AssetId, PeerId},
            eth::U256,
            fee,
            packet::Address,
            rate_limit,
            routing::Route,
            settlement,
        },
        infra::{btp, chain, keys, store},
    },
    std::{fmt::Debug, net::SocketAddr, time::Duration},
};

pub mod file;

/// One configured peer with its account limits and on-chain identities.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    pub secret: String,
    /// Dial this BTP URL; `None` means the peer dials us.
    pub url: Option<String>,
    pub asset: AssetId,
    pub credit_limit: Option<U256>,
    pub settlement_threshold: Option<U256>,
    pub evm_address: Option<String>,
    pub xrp_address: Option<String>,
    pub rate_limit: Option<rate_limit::Limit>,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub ilp_address: Address,
    pub api_addr: SocketAddr,
    pub btp_addr: SocketAddr,
    pub prometheus_enabled: bool,
}

#[derive(Clone, Debug)]
pub struct Settlement {
    pub engine: settlement::Config,
    pub scan_interval: Duration,
    pub evm: Option<chain::evm::Config>,
    pub xrp: Option<chain::xrp::Config>,
}

#[derive(Clone, Debug)]
pub struct EventStoreConfig {
    pub path: Option<std::path::PathBuf>,
    pub retention: store::Retention,
    pub retention_interval: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub node: Node,
    pub peers: Vec<Peer>,
    pub routes: Vec<Route>,
    pub default_rate_limit: rate_limit::Limit,
    pub fee: fee::Schedule,
    pub settlement: Option<Settlement>,
    pub keys: Option<keys::Options>,
    pub event_store: EventStoreConfig,
    pub telemetry_queue: usize,
    pub btp: btp::Settings,
}

/// Unwraps a config-parsing result or exits with the fatal-configuration
/// code. Details go to the log only when explicitly requested, since raw
/// errors can echo secrets from the file.
pub fn unwrap_or_log<T, E, P>(result: Result<T, E>, path: &P) -> T
where
    E: Debug,
    P: Debug,
{
    result.unwrap_or_else(|err| {
        if std::env::var("TOML_TRACE_ERROR").is_ok_and(|value| value == "1") {
            eprintln!("failed to parse configuration {path:?}: {err:#?}");
        } else {
            eprintln!(
                "failed to parse configuration {path:?}; set TOML_TRACE_ERROR=1 to print the parser error"
            );
        }
        std::process::exit(1);
    })
}
