#[cfg(unix)]
use tokio::signal::unix::{self, SignalKind};
use {
    crate::{
        api,
        domain::{
            fraud::{self, rules},
            ledger::Ledger,
            pipeline::{Pipeline, RejectingLocalHandler},
            rate_limit::RateLimiter,
            routing::RoutingTable,
            settlement::{self, threshold, ChannelLedger, ChannelRegistry, Method},
            telemetry,
        },
        infra::{
            btp, chain, cli, config,
            keys::{self, evm::EvmSigner},
            store::EventStore,
            telemetry::Broker,
        },
    },
    clap::Parser,
    std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration},
    tokio::sync::{mpsc, oneshot},
    tracing_subscriber::EnvFilter,
};

pub async fn start(args: impl IntoIterator<Item = String>) {
    let args = cli::Args::parse_from(args);
    run_with(args, None).await;
}

pub async fn run(
    args: impl IntoIterator<Item = String>,
    bind: Option<oneshot::Sender<(SocketAddr, SocketAddr)>>,
) {
    let args = cli::Args::parse_from(args);
    run_with(args, bind).await;
}

fn init_tracing(filter: &str, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(!json);
    // Tests spawn several nodes in one process; only the first init wins.
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing already initialized");
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("startup error: {message}");
    std::process::exit(1);
}

async fn run_with(args: cli::Args, bind: Option<oneshot::Sender<(SocketAddr, SocketAddr)>>) {
    init_tracing(&args.log, args.use_json_logs);
    tracing::info!("starting connector with {args:#?}");
    let config = config::file::load(&args.config).await;

    let store = match &config.event_store.path {
        Some(path) => Some(Arc::new(
            EventStore::open(path, config.event_store.retention)
                .await
                .unwrap_or_else(|err| fatal(&format!("cannot open event store: {err}"))),
        )),
        None => None,
    };
    if let Some(store) = store.clone() {
        let interval = config.event_store.retention_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick doubles as a startup cleanup.
            loop {
                ticker.tick().await;
                if let Err(err) = store.run_retention_policy().await {
                    tracing::warn!(?err, "retention pass failed");
                }
            }
        });
    }

    let broker = Arc::new(Broker::new(
        config.node.id.clone(),
        store.clone(),
        config.telemetry_queue,
    ));

    let ledger = Arc::new(Ledger::new(None));
    for peer in &config.peers {
        ledger.ensure_account(
            peer.id.clone(),
            peer.asset.clone(),
            peer.credit_limit,
            peer.settlement_threshold,
        );
    }

    let routing = Arc::new(RoutingTable::new(config.routes.iter().cloned()));
    let limiter = Arc::new(RateLimiter::new(
        config.default_rate_limit,
        config
            .peers
            .iter()
            .filter_map(|peer| peer.rate_limit.map(|limit| (peer.id.clone(), limit)))
            .collect(),
    ));

    let key_manager = config.keys.clone().map(|options| {
        Arc::new(
            keys::KeyManager::new(options)
                .unwrap_or_else(|err| fatal(&format!("key manager: {err}"))),
        )
    });

    let channels = Arc::new(ChannelRegistry::default());
    if let Some(settlement_config) = &config.settlement {
        spawn_settlement(
            settlement_config,
            key_manager.clone(),
            Arc::clone(&ledger),
            Arc::clone(&channels),
            Arc::clone(&broker),
        )
        .await;
    }

    let registry = btp::Registry::new(
        config.node.id.clone(),
        config.node.ilp_address.clone(),
        config
            .peers
            .iter()
            .map(|peer| btp::PeerConfig {
                id: peer.id.clone(),
                secret: peer.secret.clone(),
                url: peer.url.clone(),
                asset: peer.asset.clone(),
            })
            .collect(),
        Arc::clone(&broker),
        config.btp,
    );
    let pipeline = Pipeline::new(
        config.node.ilp_address.clone(),
        Arc::clone(&ledger),
        Arc::clone(&routing),
        Arc::clone(&limiter),
        config.fee.clone(),
        Arc::clone(&registry) as Arc<dyn crate::domain::pipeline::PeerDirectory>,
        Arc::new(RejectingLocalHandler {
            own_address: config.node.ilp_address.clone(),
        }),
        Arc::clone(&broker),
        Duration::from_secs(1),
    );
    registry.set_pipeline(pipeline);
    registry.spawn_dialers();

    let detector = fraud::Detector::new(
        rules::default_rules(),
        Arc::clone(&limiter) as Arc<dyn fraud::PauseController>,
        Arc::clone(&broker),
        fraud::Severity::High,
    );
    detector.spawn(broker.subscribe());

    install_hydrators(&broker, &channels, &ledger);

    broker.emit(telemetry::Kind::NodeStatus {
        status: "started".to_owned(),
        detail: None,
        peer_id: None,
    });

    api::Api {
        api_addr: config.node.api_addr,
        btp_addr: config.node.btp_addr,
        state: Arc::new(api::AppState {
            node_id: config.node.id.clone(),
            prometheus_enabled: config.node.prometheus_enabled,
            ledger,
            routing,
            channels,
            broker,
            store,
            registry,
        }),
    }
    .serve(bind, shutdown_signal())
    .await
    .unwrap_or_else(|err| fatal(&format!("server error: {err}")));
}

async fn spawn_settlement(
    settlement_config: &config::Settlement,
    key_manager: Option<Arc<keys::KeyManager>>,
    ledger: Arc<Ledger>,
    channels: Arc<ChannelRegistry>,
    broker: Arc<Broker>,
) {
    let key_manager = key_manager
        .unwrap_or_else(|| fatal("settlement is configured but the [keys] section is missing"));

    let mut rails: HashMap<Method, Arc<dyn ChannelLedger>> = HashMap::new();
    let mut evm_signer = None;
    if let Some(evm_config) = settlement_config
        .evm
        .clone()
        .filter(|_| settlement_config.engine.preference.contains(&Method::Evm))
    {
        let signer = EvmSigner::new(Arc::clone(&key_manager), &evm_config.key_id);
        let domain = settlement::proof::Eip712Domain {
            chain_id: evm_config.chain_id,
            verifying_contract: evm_config.contract,
        };
        let rail = chain::evm::EvmChannels::new(evm_config, signer.clone())
            .await
            .unwrap_or_else(|err| fatal(&format!("EVM settlement rail: {err}")));
        rails.insert(Method::Evm, Arc::new(rail));
        evm_signer = Some((signer, domain));
    }

    let mut xrp_signer = None;
    if let Some(xrp_config) = settlement_config
        .xrp
        .clone()
        .filter(|_| settlement_config.engine.preference.contains(&Method::Xrp))
    {
        let key_id = xrp_config.key_id.clone();
        let rail = chain::xrp::XrpChannels::new(xrp_config)
            .unwrap_or_else(|err| fatal(&format!("XRP settlement rail: {err}")));
        rails.insert(Method::Xrp, Arc::new(rail));
        xrp_signer = Some((Arc::clone(&key_manager), key_id));
    }

    if rails.is_empty() {
        fatal("settlement is configured but no rail matches the preference");
    }

    let signer = keys::evm::RailSigner::new(evm_signer, xrp_signer);
    let engine = settlement::Engine::new(
        settlement_config.engine.clone(),
        Arc::clone(&ledger),
        rails,
        signer,
        channels,
        Arc::clone(&broker),
    );
    let (triggers, trigger_queue) = mpsc::channel(64);
    engine.spawn(trigger_queue);
    threshold::Monitor::new(ledger, broker, triggers, settlement_config.scan_interval).spawn();
}

fn install_hydrators(broker: &Arc<Broker>, channels: &Arc<ChannelRegistry>, ledger: &Arc<Ledger>) {
    let channels = Arc::clone(channels);
    broker.add_hydrator(Box::new(move || {
        let channels = Arc::clone(&channels);
        Box::pin(async move {
            serde_json::json!({
                "type": "INITIAL_CHANNEL_STATE",
                "channels": channels.snapshot(),
            })
        })
    }));

    let ledger = Arc::clone(ledger);
    broker.add_hydrator(Box::new(move || {
        let ledger = Arc::clone(&ledger);
        Box::pin(async move {
            let balances: Vec<_> = ledger
                .snapshot_all()
                .await
                .into_iter()
                .map(|(key, account)| {
                    serde_json::json!({
                        "peerId": key.peer,
                        "asset": key.asset,
                        "account": account,
                    })
                })
                .collect();
            serde_json::json!({
                "type": "INITIAL_BALANCE_STATE",
                "balances": balances,
            })
        })
    }));
}

#[cfg(unix)]
async fn shutdown_signal() {
    // Intercept main signals for graceful shutdown.
    // Kubernetes sends sigterm, whereas locally sigint (ctrl-c) is most common.
    let mut interrupt = unix::signal(SignalKind::interrupt()).unwrap();
    let mut terminate = unix::signal(SignalKind::terminate()).unwrap();
    tokio::select! {
        _ = interrupt.recv() => (),
        _ = terminate.recv() => (),
    };
}

#[cfg(windows)]
async fn shutdown_signal() {
    // We don't support signal handling on Windows.
    std::future::pending().await
}
