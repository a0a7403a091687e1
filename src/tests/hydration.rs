//! Telemetry observer hydration: snapshots first, live events after.

use {
    super::{peer::Peer, relay_config, ConnectorNode},
    crate::{
        domain::{
            account::{AssetId, PeerId},
            eth::U256,
            settlement::{Channel, ChannelId, ChannelRegistry, ChannelStatus, Method},
            telemetry,
        },
        infra::telemetry::Broker,
    },
    chrono::Utc,
    futures::{SinkExt, StreamExt},
    std::sync::Arc,
    tokio_tungstenite::tungstenite::Message,
};

fn channel(id: &str) -> Channel {
    Channel {
        channel_id: ChannelId::new(id),
        method: Method::Evm,
        peer_id: PeerId::new("peer-b"),
        asset: AssetId::new("USDC"),
        my_deposit: U256::from(11_000_u64),
        their_deposit: U256::ZERO,
        my_nonce: 1,
        their_nonce: 0,
        my_transferred: U256::from(5500_u64),
        their_transferred: U256::ZERO,
        status: ChannelStatus::Active,
        opened_at: Utc::now(),
        closed_at: None,
    }
}

#[tokio::test]
async fn late_observers_get_existing_channels_before_live_events() {
    let broker = Arc::new(Broker::new("node-test", None, 64));
    let channels = Arc::new(ChannelRegistry::default());
    channels.insert(channel("C1"));

    let channels_for_snapshot = Arc::clone(&channels);
    broker.add_hydrator(Box::new(move || {
        let channels = Arc::clone(&channels_for_snapshot);
        Box::pin(async move {
            serde_json::json!({
                "type": "INITIAL_CHANNEL_STATE",
                "channels": channels.snapshot(),
            })
        })
    }));

    // A client connecting after C1 was opened: snapshot first, then live.
    let (_, mut queue) = broker.register_client();
    let snapshots = broker.snapshots().await;
    broker.emit(telemetry::Kind::PaymentChannelBalanceUpdate {
        channel_id: ChannelId::new("C1"),
        nonce: 2,
        transferred: U256::from(6000_u64),
    });

    let snapshot: serde_json::Value = serde_json::from_str(&snapshots[0]).unwrap();
    assert_eq!(snapshot["type"], "INITIAL_CHANNEL_STATE");
    assert_eq!(snapshot["channels"][0]["channelId"], "C1");
    assert_eq!(snapshot["channels"][0]["status"], "ACTIVE");

    let live: serde_json::Value =
        serde_json::from_str(&queue.recv().await.unwrap()).unwrap();
    assert_eq!(live["type"], "PAYMENT_CHANNEL_BALANCE_UPDATE");
}

#[tokio::test]
async fn websocket_observers_hydrate_then_stream() {
    let tempdir = tempfile::tempdir().unwrap();
    let node = ConnectorNode::start(relay_config(&tempdir), Some(tempdir)).await;

    let ws_url = format!("{}/ws", node.api_url.replace("http://", "ws://"));
    let (mut observer, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();
    observer
        .send(Message::Text(r#"{"type":"CLIENT_CONNECT"}"#.to_owned()))
        .await
        .unwrap();

    // The snapshots arrive before anything live.
    let first = next_json(&mut observer).await;
    assert_eq!(first["type"], "INITIAL_CHANNEL_STATE");
    let second = next_json(&mut observer).await;
    assert_eq!(second["type"], "INITIAL_BALANCE_STATE");
    assert!(second["balances"]
        .as_array()
        .unwrap()
        .iter()
        .any(|row| row["peerId"] == "peer-a"));

    // A peer connecting is a live event the observer now sees.
    let _peer = Peer::connect(&node.btp_url, "peer-a", "secret-a").await.unwrap();
    let live = next_json(&mut observer).await;
    assert_eq!(live["type"], "NODE_STATUS");
    assert_eq!(live["peerId"], "peer-a");
}

async fn next_json(
    observer: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    loop {
        match observer.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).unwrap();
            }
            Some(Ok(_)) => continue,
            other => panic!("observer stream ended: {other:?}"),
        }
    }
}
