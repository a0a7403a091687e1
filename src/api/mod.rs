//! The node's HTTP/WebSocket surface: the control API plus the two upgrade
//! endpoints (inbound BTP on its own listener, telemetry observers on the
//! API listener).

use {
    crate::{
        domain::{ledger::Ledger, routing::RoutingTable, settlement::ChannelRegistry},
        infra::{btp, store::EventStore, telemetry::Broker},
    },
    axum::{routing::get, Router},
    std::{future::Future, net::SocketAddr, sync::Arc},
    tokio::sync::{oneshot, watch},
    tower_http::trace::TraceLayer,
};

mod routes;

pub struct AppState {
    pub node_id: String,
    pub prometheus_enabled: bool,
    pub ledger: Arc<Ledger>,
    pub routing: Arc<RoutingTable>,
    pub channels: Arc<ChannelRegistry>,
    pub broker: Arc<Broker>,
    pub store: Option<Arc<EventStore>>,
    pub registry: Arc<btp::Registry>,
}

pub struct Api {
    pub api_addr: SocketAddr,
    pub btp_addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl Api {
    /// Serves both listeners until `shutdown` resolves. `bind` reports the
    /// actually bound addresses, which tests use with port 0.
    pub async fn serve(
        self,
        bind: Option<oneshot::Sender<(SocketAddr, SocketAddr)>>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), hyper::Error> {
        let api_router = Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/api/balances", get(routes::balances))
            .route("/api/routes", get(routes::routes))
            .route("/api/settlements/recent", get(routes::recent_settlements))
            .route("/api/accounts/events", get(routes::account_events))
            .route("/api/channels", get(routes::channels))
            .route("/ws", get(routes::telemetry_ws))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state));
        let btp_router = Router::new()
            .route("/btp", get(routes::btp_ws))
            .with_state(Arc::clone(&self.state));

        let api_server = axum::Server::bind(&self.api_addr).serve(api_router.into_make_service());
        let btp_server = axum::Server::bind(&self.btp_addr).serve(btp_router.into_make_service());
        if let Some(bind) = bind {
            let _ = bind.send((api_server.local_addr(), btp_server.local_addr()));
        }

        // One shutdown signal fans out to both listeners.
        let (stop, stopped) = watch::channel(());
        tokio::spawn(async move {
            shutdown.await;
            let _ = stop.send(());
        });
        let wait = |mut stopped: watch::Receiver<()>| async move {
            let _ = stopped.changed().await;
        };

        let api_server = api_server.with_graceful_shutdown(wait(stopped.clone()));
        let btp_server = btp_server.with_graceful_shutdown(wait(stopped));
        tokio::try_join!(api_server, btp_server)?;
        Ok(())
    }
}
