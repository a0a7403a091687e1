//! Route handlers for the control/observation API.

use {
    super::AppState,
    crate::{
        domain::account::Account,
        infra::{metrics as node_metrics, store},
    },
    axum::{
        extract::{
            ws::{Message, WebSocket, WebSocketUpgrade},
            Query, State,
        },
        http::StatusCode,
        response::{IntoResponse, Response},
        Json,
    },
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    if !state.prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&node_metrics::registry().gather()) {
        Ok(body) => body.into_response(),
        Err(err) => {
            tracing::error!(?err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRow {
    peer_id: String,
    asset: String,
    #[serde(flatten)]
    account: Account,
}

pub async fn balances(State(state): State<Arc<AppState>>) -> Json<Vec<BalanceRow>> {
    let mut rows: Vec<_> = state
        .ledger
        .snapshot_all()
        .await
        .into_iter()
        .map(|(key, account)| BalanceRow {
            peer_id: key.peer.to_string(),
            asset: key.asset.to_string(),
            account,
        })
        .collect();
    rows.sort_by(|a, b| (&a.peer_id, &a.asset).cmp(&(&b.peer_id, &b.asset)));
    Json(rows)
}

pub async fn routes(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let routes = state.routing.snapshot();
    Json(serde_json::json!({"routes": &*routes}))
}

pub async fn channels(State(state): State<Arc<AppState>>) -> Response {
    Json(state.channels.snapshot()).into_response()
}

const SETTLEMENT_EVENT_TYPES: &[&str] = &[
    "SETTLEMENT_TRIGGERED",
    "SETTLEMENT_PENDING",
    "SETTLEMENT_COMPLETED",
    "SETTLEMENT_FAILED",
];

pub async fn recent_settlements(State(state): State<Arc<AppState>>) -> Response {
    let Some(store) = &state.store else {
        return Json(Vec::<serde_json::Value>::new()).into_response();
    };
    let filter = store::Filter {
        event_types: SETTLEMENT_EVENT_TYPES
            .iter()
            .map(|name| (*name).to_owned())
            .collect(),
        ..Default::default()
    };
    match store.query_events(&filter, 100, 0).await {
        Ok(events) => Json(
            events
                .into_iter()
                .map(|event| event.payload)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => {
            tracing::error!(?err, "settlement query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types.
    #[serde(default)]
    types: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default)]
    packet_id: Option<String>,
}

#[derive(Serialize)]
pub struct EventEnvelope {
    payload: serde_json::Value,
}

#[derive(Serialize)]
pub struct EventsResponse {
    events: Vec<EventEnvelope>,
    total: i64,
}

pub async fn account_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(store) = &state.store else {
        return Json(EventsResponse {
            events: Vec::new(),
            total: 0,
        })
        .into_response();
    };
    let filter = store::Filter {
        event_types: query
            .types
            .map(|types| {
                types
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        peer_id: query.peer_id,
        packet_id: query.packet_id,
        ..Default::default()
    };
    let limit = query.limit.unwrap_or(store::DEFAULT_QUERY_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let events = store.query_events(&filter, limit, offset).await;
    let total = store.count_events(&filter).await;
    match (events, total) {
        (Ok(events), Ok(total)) => Json(EventsResponse {
            events: events
                .into_iter()
                .map(|event| EventEnvelope {
                    payload: event.payload,
                })
                .collect(),
            total,
        })
        .into_response(),
        (events, total) => {
            tracing::error!(?events, ?total, "event query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Inbound BTP upgrade; everything after the upgrade is the registry's
/// problem.
pub async fn btp_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| registry.accept(socket))
}

/// Telemetry observer upgrade: `CLIENT_CONNECT`, hydration snapshots, then
/// the live stream.
pub async fn telemetry_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| observe(socket, state))
}

async fn observe(mut socket: WebSocket, state: Arc<AppState>) {
    // Wait for the subscription message; anything else is a protocol error.
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let parsed: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
                if parsed["type"] == serde_json::json!("CLIENT_CONNECT") {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(_)) => return,
        }
    }

    // Register first so nothing emitted while hydrating is lost; queued live
    // events drain only after the snapshots went out.
    let (client_id, mut live) = state.broker.register_client();
    for snapshot in state.broker.snapshots().await {
        if socket.send(Message::Text(snapshot)).await.is_err() {
            state.broker.unregister_client(client_id);
            return;
        }
    }

    loop {
        tokio::select! {
            event = live.recv() => match event {
                Some(event) => {
                    if socket.send(Message::Text(event)).await.is_err() {
                        break;
                    }
                }
                // Queue dropped by the broker: we were too slow.
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    state.broker.unregister_client(client_id);
}
