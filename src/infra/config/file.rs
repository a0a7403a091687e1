//! TOML configuration parsing plus the environment overrides from the
//! deployment surface (`NODE_ID`, `BTP_PORT`, `BTP_PEER_<id>_SECRET`, …).

use {
    super::{unwrap_or_log, Config, EventStoreConfig, Node, Peer, Settlement},
    crate::{
        domain::{
            account::{AssetId, PeerId},
            eth::U256,
            fee,
            rate_limit,
            routing::Route,
            settlement::{self, Method},
        },
        infra::{btp, chain, keys, store},
        util::{retry::Backoff, serialize},
    },
    serde::Deserialize,
    serde_with::serde_as,
    std::{net::SocketAddr, path::Path, time::Duration},
    tokio::fs,
};

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    node: RawNode,
    #[serde(default)]
    peers: Vec<RawPeer>,
    #[serde(default)]
    routes: Vec<RawRoute>,
    #[serde(default)]
    rate_limit: RawRateLimit,
    #[serde(default)]
    fee: RawFee,
    #[serde(default)]
    settlement: Option<RawSettlement>,
    #[serde(default)]
    keys: Option<keys::Options>,
    #[serde(default)]
    event_store: RawEventStore,
    #[serde(default)]
    telemetry: RawTelemetry,
    #[serde(default)]
    btp: RawBtp,
    #[serde(default)]
    ledger: Option<RawLedger>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawNode {
    id: String,
    ilp_address: String,
    #[serde(default = "default_api_addr")]
    api_addr: SocketAddr,
    #[serde(default = "default_btp_addr")]
    btp_addr: SocketAddr,
    #[serde(default)]
    prometheus_enabled: bool,
}

fn default_api_addr() -> SocketAddr {
    "127.0.0.1:7770".parse().unwrap()
}

fn default_btp_addr() -> SocketAddr {
    "127.0.0.1:7768".parse().unwrap()
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawPeer {
    id: String,
    /// Shared BTP secret; `BTP_PEER_<ID>_SECRET` overrides or supplies it.
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "default_asset")]
    asset: String,
    #[serde(default)]
    #[serde_as(as = "Option<serialize::U256>")]
    credit_limit: Option<U256>,
    #[serde(default)]
    #[serde_as(as = "Option<serialize::U256>")]
    settlement_threshold: Option<U256>,
    #[serde(default)]
    evm_address: Option<String>,
    #[serde(default)]
    xrp_address: Option<String>,
    #[serde(default)]
    rate_limit: Option<RawRateLimit>,
}

fn default_asset() -> String {
    "ILP".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRoute {
    prefix: String,
    next_hop: String,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRateLimit {
    #[serde(default = "default_burst")]
    burst: u32,
    #[serde(default = "default_refill")]
    refill_per_sec: f64,
}

impl Default for RawRateLimit {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_per_sec: default_refill(),
        }
    }
}

fn default_burst() -> u32 {
    100
}

fn default_refill() -> f64 {
    50.0
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawFee {
    /// The relative spread taken on forwarded packets.
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    relative: Option<bigdecimal::BigDecimal>,
    #[serde(default)]
    #[serde_as(as = "Option<serialize::U256>")]
    absolute_min: Option<U256>,
}

impl Default for RawFee {
    fn default() -> Self {
        Self {
            relative: None,
            absolute_min: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawSettlement {
    #[serde(default = "default_preference")]
    preference: String,
    #[serde(default = "default_initial_deposit")]
    #[serde_as(as = "serialize::U256")]
    default_initial_deposit: U256,
    #[serde(with = "humantime_serde", default = "default_settle_timeout")]
    settle_timeout: Duration,
    #[serde(default = "default_headroom")]
    deposit_headroom_pct: u32,
    #[serde(default = "default_retry_attempts")]
    retry_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    retry_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_retry_cap")]
    retry_delay_cap: Duration,
    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    call_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    scan_interval: Duration,
    #[serde(default)]
    evm: Option<chain::evm::Config>,
    #[serde(default)]
    xrp: Option<chain::xrp::Config>,
}

fn default_preference() -> String {
    "both".to_owned()
}

fn default_initial_deposit() -> U256 {
    U256::from(1_000_000_u64)
}

fn default_settle_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_headroom() -> u32 {
    20
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_retry_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawEventStore {
    #[serde(default)]
    path: Option<std::path::PathBuf>,
    #[serde(default = "default_max_event_count")]
    max_event_count: u64,
    #[serde(with = "humantime_serde", default = "default_max_age")]
    max_age: Duration,
    #[serde(with = "humantime_serde", default = "default_retention_interval")]
    retention_interval: Duration,
}

impl Default for RawEventStore {
    fn default() -> Self {
        Self {
            path: None,
            max_event_count: default_max_event_count(),
            max_age: default_max_age(),
            retention_interval: default_retention_interval(),
        }
    }
}

fn default_max_event_count() -> u64 {
    1_000_000
}

fn default_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTelemetry {
    #[serde(default = "default_client_queue")]
    client_queue: usize,
}

impl Default for RawTelemetry {
    fn default() -> Self {
        Self {
            client_queue: default_client_queue(),
        }
    }
}

fn default_client_queue() -> usize {
    1024
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawBtp {
    #[serde(default)]
    send_queue: Option<usize>,
    #[serde(with = "humantime_serde", default)]
    slack: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    heartbeat: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    handshake_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    reconnect_base: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    reconnect_cap: Option<Duration>,
    #[serde(default)]
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawLedger {
    engine: String,
    #[serde(default)]
    tigerbeetle_cluster_id: Option<u64>,
    #[serde(default)]
    tigerbeetle_replicas: Option<Vec<String>>,
}

fn fatal(message: &str) -> ! {
    eprintln!("configuration error: {message}");
    std::process::exit(1);
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn peer_secret_var(id: &str) -> String {
    format!(
        "BTP_PEER_{}_SECRET",
        id.to_uppercase().replace('-', "_")
    )
}

fn apply_env(raw: &mut RawConfig) {
    if let Some(id) = env_var("NODE_ID") {
        raw.node.id = id;
    }
    if let Some(port) = env_var("BTP_PORT") {
        match port.parse() {
            Ok(port) => raw.node.btp_addr.set_port(port),
            Err(_) => fatal("BTP_PORT is not a port number"),
        }
    }
    if let Some(port) = env_var("HEALTH_CHECK_PORT") {
        match port.parse() {
            Ok(port) => raw.node.api_addr.set_port(port),
            Err(_) => fatal("HEALTH_CHECK_PORT is not a port number"),
        }
    }
    if let Some(enabled) = env_var("PROMETHEUS_ENABLED") {
        raw.node.prometheus_enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
    }
    for peer in &mut raw.peers {
        if let Some(secret) = env_var(&peer_secret_var(&peer.id)) {
            peer.secret = Some(secret);
        }
    }
    if let Some(settlement) = &mut raw.settlement {
        if let Some(preference) = env_var("SETTLEMENT_PREFERENCE") {
            settlement.preference = preference;
        }
        if let Some(evm) = &mut settlement.evm {
            if let Some(rpc_url) = env_var("BASE_RPC_URL") {
                match rpc_url.parse() {
                    Ok(url) => evm.rpc_url = url,
                    Err(_) => fatal("BASE_RPC_URL is not a URL"),
                }
            }
            if let Some(address) = env_var("EVM_ADDRESS") {
                match address.parse() {
                    Ok(address) => evm.expected_address = Some(address),
                    Err(_) => fatal("EVM_ADDRESS is not an EVM address"),
                }
            }
        }
        if let Some(xrp) = &mut settlement.xrp {
            if let Some(url) = env_var("XRPL_WSS_URL") {
                xrp.wss_url = url;
            }
            if let Some(account) = env_var("XRP_ADDRESS") {
                xrp.account = account;
            }
        }
    }
    if let Some(keys) = &mut raw.keys {
        if let Some(backend) = env_var("KEY_BACKEND") {
            keys.backend = match backend.as_str() {
                "env" => crate::infra::keys::BackendKind::Env,
                "aws-kms" => crate::infra::keys::BackendKind::AwsKms,
                "gcp-kms" => crate::infra::keys::BackendKind::GcpKms,
                "azure-kv" => crate::infra::keys::BackendKind::AzureKv,
                "hsm" => crate::infra::keys::BackendKind::Hsm,
                _ => fatal("KEY_BACKEND must be one of env, aws-kms, gcp-kms, azure-kv, hsm"),
            };
        }
    }
    if let Some(ledger) = &mut raw.ledger {
        if let Some(cluster) = env_var("TIGERBEETLE_CLUSTER_ID") {
            ledger.tigerbeetle_cluster_id = cluster.parse().ok();
        }
        if let Some(replicas) = env_var("TIGERBEETLE_REPLICAS") {
            ledger.tigerbeetle_replicas =
                Some(replicas.split(',').map(str::to_owned).collect());
        }
    }
}

fn preference_methods(preference: &str) -> Vec<Method> {
    match preference {
        "evm" => vec![Method::Evm],
        "xrp" => vec![Method::Xrp],
        "both" => vec![Method::Evm, Method::Xrp],
        other => fatal(&format!(
            "settlement preference {other:?} is not one of evm, xrp, both"
        )),
    }
}

/// Loads the node configuration from a TOML file.
///
/// Invalid configuration is fatal: the process exits with code 1.
pub async fn load(path: &Path) -> Config {
    let data = fs::read_to_string(path)
        .await
        .unwrap_or_else(|err| fatal(&format!("I/O error while reading {path:?}: {err}")));
    let mut raw = unwrap_or_log(toml::de::from_str::<RawConfig>(&data), &path);
    apply_env(&mut raw);

    if let Some(ledger) = &raw.ledger {
        if ledger.engine == "tigerbeetle" {
            // The two-phase engine seam exists, but no TigerBeetle client is
            // compiled into this binary. Failing closed beats forwarding
            // without the accounting backend the operator asked for.
            fatal("ledger engine \"tigerbeetle\" requires an external engine client; none is built in");
        } else if ledger.engine != "memory" {
            fatal(&format!("unknown ledger engine {:?}", ledger.engine));
        }
    }

    let ilp_address = raw
        .node
        .ilp_address
        .parse()
        .unwrap_or_else(|_| fatal("node.ilp-address is not a valid ILP address"));

    let mut peers = Vec::with_capacity(raw.peers.len());
    for peer in raw.peers {
        let secret = peer.secret.clone().unwrap_or_else(|| {
            fatal(&format!(
                "peer {:?} has no secret; set it in the file or via {}",
                peer.id,
                peer_secret_var(&peer.id)
            ))
        });
        peers.push(Peer {
            id: PeerId::new(&peer.id),
            secret,
            url: peer.url,
            asset: AssetId::new(peer.asset),
            credit_limit: peer.credit_limit,
            settlement_threshold: peer.settlement_threshold,
            evm_address: peer.evm_address,
            xrp_address: peer.xrp_address,
            rate_limit: peer.rate_limit.map(|limit| rate_limit::Limit {
                burst: limit.burst,
                refill_per_sec: limit.refill_per_sec,
            }),
        });
    }

    let routes = raw
        .routes
        .into_iter()
        .map(|route| Route {
            prefix: route
                .prefix
                .parse()
                .unwrap_or_else(|_| fatal(&format!("route prefix {:?} is invalid", route.prefix))),
            next_hop: PeerId::new(route.next_hop),
            priority: route.priority,
        })
        .collect();

    let fee = fee::Schedule::new(
        raw.fee.relative.unwrap_or_else(|| 0.into()),
        raw.fee.absolute_min,
    )
    .unwrap_or_else(|| fatal("fee.relative must be in [0, 1)"));

    let settlement = raw.settlement.map(|settlement| {
        let peer_addresses = peers
            .iter()
            .flat_map(|peer| {
                let mut addresses = Vec::new();
                if let Some(address) = &peer.evm_address {
                    addresses.push(((peer.id.clone(), Method::Evm), address.clone()));
                }
                if let Some(address) = &peer.xrp_address {
                    addresses.push(((peer.id.clone(), Method::Xrp), address.clone()));
                }
                addresses
            })
            .collect();
        Settlement {
            engine: settlement::Config {
                default_initial_deposit: settlement.default_initial_deposit,
                settle_timeout: settlement.settle_timeout,
                deposit_headroom_pct: settlement.deposit_headroom_pct,
                retry: Backoff {
                    base: settlement.retry_delay,
                    cap: settlement.retry_delay_cap,
                    max_retries: settlement.retry_attempts,
                },
                call_timeout: settlement.call_timeout,
                preference: preference_methods(&settlement.preference),
                peer_addresses,
            },
            scan_interval: settlement.scan_interval,
            evm: settlement.evm,
            xrp: settlement.xrp,
        }
    });

    let mut btp_settings = btp::Settings::default();
    if let Some(send_queue) = raw.btp.send_queue {
        btp_settings.send_queue = send_queue;
    }
    if let Some(slack) = raw.btp.slack {
        btp_settings.slack = slack;
    }
    if let Some(heartbeat) = raw.btp.heartbeat {
        btp_settings.heartbeat = heartbeat;
    }
    if let Some(handshake_timeout) = raw.btp.handshake_timeout {
        btp_settings.handshake_timeout = handshake_timeout;
    }
    if let Some(reconnect_base) = raw.btp.reconnect_base {
        btp_settings.reconnect_base = reconnect_base;
    }
    if let Some(reconnect_cap) = raw.btp.reconnect_cap {
        btp_settings.reconnect_cap = reconnect_cap;
    }
    if let Some(max_reconnect_attempts) = raw.btp.max_reconnect_attempts {
        btp_settings.max_reconnect_attempts = max_reconnect_attempts;
    }

    Config {
        node: Node {
            id: raw.node.id,
            ilp_address,
            api_addr: raw.node.api_addr,
            btp_addr: raw.node.btp_addr,
            prometheus_enabled: raw.node.prometheus_enabled,
        },
        peers,
        routes,
        default_rate_limit: rate_limit::Limit {
            burst: raw.rate_limit.burst,
            refill_per_sec: raw.rate_limit.refill_per_sec,
        },
        fee,
        settlement,
        keys: raw.keys,
        event_store: EventStoreConfig {
            path: raw.event_store.path,
            retention: store::Retention {
                max_age: raw.event_store.max_age,
                max_event_count: raw.event_store.max_event_count,
            },
            retention_interval: raw.event_store.retention_interval,
        },
        telemetry_queue: raw.telemetry.client_queue,
        btp: btp_settings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let raw: RawConfig = toml::de::from_str(
            r#"
            [node]
            id = "node-a"
            ilp-address = "g.node-a"

            [[peers]]
            id = "peer-b"
            secret = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(raw.node.api_addr, default_api_addr());
        assert_eq!(raw.peers[0].asset, "ILP");
        assert!(raw.settlement.is_none());
    }

    #[test]
    fn full_config_parses() {
        let raw: RawConfig = toml::de::from_str(
            r#"
            [node]
            id = "node-a"
            ilp-address = "g.node-a"
            api-addr = "127.0.0.1:8080"
            btp-addr = "0.0.0.0:7768"
            prometheus-enabled = true

            [[peers]]
            id = "peer-b"
            secret = "hunter2"
            url = "ws://peer-b:7768/btp"
            asset = "USDC"
            credit-limit = "100000"
            settlement-threshold = "5000"
            evm-address = "0x2222222222222222222222222222222222222222"
            rate-limit = { burst = 10, refill-per-sec = 5.0 }

            [[routes]]
            prefix = "g.peer-b"
            next-hop = "peer-b"
            priority = 1

            [fee]
            relative = "0.01"
            absolute-min = "1"

            [settlement]
            preference = "evm"
            default-initial-deposit = "1000000"
            retry-attempts = 3
            retry-delay = "100ms"
            scan-interval = "30s"

            [settlement.evm]
            rpc-url = "http://localhost:8545"
            chain-id = 8453
            contract = "0x1111111111111111111111111111111111111111"
            key-id = "evm"

            [keys]
            backend = "env"

            [keys.env.keys.evm]
            scheme = "secp256k1"
            secret-hex = "1111111111111111111111111111111111111111111111111111111111111111"

            [event-store]
            path = "events.db"
            max-event-count = 500000
            max-age = "7days"

            [telemetry]
            client-queue = 64

            [btp]
            send-queue = 128
            slack = "1s"
            "#,
        )
        .unwrap();
        assert_eq!(raw.peers[0].credit_limit, Some(U256::from(100_000_u64)));
        let settlement = raw.settlement.unwrap();
        assert_eq!(settlement.preference, "evm");
        assert_eq!(settlement.evm.unwrap().chain_id, 8453);
        assert_eq!(raw.event_store.max_event_count, 500_000);
        assert_eq!(raw.btp.send_queue, Some(128));
    }

    #[test]
    fn preference_strings_map_to_methods() {
        assert_eq!(preference_methods("evm"), vec![Method::Evm]);
        assert_eq!(preference_methods("xrp"), vec![Method::Xrp]);
        assert_eq!(preference_methods("both"), vec![Method::Evm, Method::Xrp]);
    }
}
