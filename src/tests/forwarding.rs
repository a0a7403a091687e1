//! Forwarding scenarios over the real BTP wire protocol.

use {
    super::{peer::Peer, relay_config, ConnectorNode},
    crate::{
        domain::{
            eth::U256,
            packet::{code, Fulfillment},
        },
        infra::btp::protocol::Frame,
    },
    chrono::{Duration as ChronoDuration, Utc},
};

fn prepare(packet_id: &str, destination: &str, amount: u64, condition: [u8; 32]) -> Frame {
    Frame::Prepare {
        packet_id: crate::domain::packet::PacketId::new(packet_id),
        destination: destination.to_owned(),
        amount: U256::from(amount),
        condition,
        expires_at: Utc::now() + ChronoDuration::seconds(30),
        data: Vec::new(),
    }
}

#[tokio::test]
async fn two_hop_forward_happy_path() {
    let tempdir = tempfile::tempdir().unwrap();
    let node = ConnectorNode::start(relay_config(&tempdir), Some(tempdir)).await;

    let mut peer_c = Peer::connect(&node.btp_url, "peer-c", "secret-c").await.unwrap();
    let mut peer_a = Peer::connect(&node.btp_url, "peer-a", "secret-a").await.unwrap();

    let fulfillment = Fulfillment([9; 32]);
    let condition = fulfillment.condition();
    peer_a
        .send(prepare("p-1", "g.c.x", 1000, condition.0))
        .await
        .unwrap();

    // The egress leg re-keys the packet; the fulfill must correlate by the
    // egress id and come back to the origin under the ingress id.
    let egress = peer_c.expect_prepare().await.unwrap();
    let Frame::Prepare {
        packet_id: egress_id,
        destination,
        amount,
        ..
    } = egress
    else {
        unreachable!()
    };
    assert_eq!(destination, "g.c.x");
    assert_eq!(amount, U256::from(1000));
    assert_ne!(egress_id.as_str(), "p-1");

    peer_c
        .send(Frame::Fulfill {
            packet_id: egress_id,
            fulfillment: fulfillment.0,
            data: Vec::new(),
        })
        .await
        .unwrap();

    let reply = peer_a.recv().await.unwrap();
    let Frame::Fulfill {
        packet_id,
        fulfillment: returned,
        ..
    } = reply
    else {
        panic!("expected FULFILL, got {reply:?}");
    };
    assert_eq!(packet_id.as_str(), "p-1");
    assert_eq!(returned, fulfillment.0);

    // Accounting finalized: A owes the node, the node owes C.
    let balances = node.get_json("/api/balances").await.unwrap();
    let balance = |peer: &str| -> serde_json::Value {
        balances
            .as_array()
            .unwrap()
            .iter()
            .find(|row| row["peerId"] == serde_json::json!(peer))
            .cloned()
            .unwrap()
    };
    assert_eq!(balance("peer-a")["debitBalance"], "1000");
    assert_eq!(balance("peer-a")["netBalance"], "-1000");
    assert_eq!(balance("peer-c")["creditBalance"], "1000");

    // Telemetry made it to the store: a receive and a forward.
    node.await_events("types=PACKET_RECEIVED", |body| {
        body["total"].as_i64().unwrap_or(0) >= 1
    })
    .await;
    let forwarded = node
        .await_events("types=PACKET_FORWARDED", |body| {
            body["total"].as_i64().unwrap_or(0) >= 1
        })
        .await;
    assert_eq!(
        forwarded["events"][0]["payload"]["destination"],
        serde_json::json!("g.c.x")
    );
}

#[tokio::test]
async fn unroutable_destination_is_rejected_with_f02() {
    let tempdir = tempfile::tempdir().unwrap();
    let node = ConnectorNode::start(relay_config(&tempdir), Some(tempdir)).await;
    let mut peer_a = Peer::connect(&node.btp_url, "peer-a", "secret-a").await.unwrap();

    let condition = Fulfillment([1; 32]).condition();
    peer_a
        .send(prepare("p-2", "g.unknown", 1000, condition.0))
        .await
        .unwrap();

    let reply = peer_a.recv().await.unwrap();
    let Frame::Reject {
        packet_id, code, ..
    } = reply
    else {
        panic!("expected REJECT, got {reply:?}");
    };
    assert_eq!(packet_id.as_str(), "p-2");
    assert_eq!(code, code::F02_UNREACHABLE);

    // The reservation was rolled back and nothing was forwarded.
    let balances = node.get_json("/api/balances").await.unwrap();
    let row = balances
        .as_array()
        .unwrap()
        .iter()
        .find(|row| row["peerId"] == serde_json::json!("peer-a"))
        .cloned()
        .unwrap();
    assert_eq!(row["debitBalance"], "0");

    node.await_events("types=PACKET_REJECTED", |body| {
        body["total"].as_i64().unwrap_or(0) >= 1
    })
    .await;
    let forwarded = node
        .get_json("/api/accounts/events?types=PACKET_FORWARDED")
        .await
        .unwrap();
    assert_eq!(forwarded["total"], 0);
}

#[tokio::test]
async fn wrong_secret_never_reaches_ready() {
    let tempdir = tempfile::tempdir().unwrap();
    let node = ConnectorNode::start(relay_config(&tempdir), Some(tempdir)).await;
    let result = Peer::connect(&node.btp_url, "peer-a", "wrong").await;
    assert!(result.is_err());

    let result = Peer::connect(&node.btp_url, "peer-unknown", "secret-a").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn missing_downstream_reply_times_out_as_r00() {
    let tempdir = tempfile::tempdir().unwrap();
    let node = ConnectorNode::start(relay_config(&tempdir), Some(tempdir)).await;
    let mut peer_c = Peer::connect(&node.btp_url, "peer-c", "secret-c").await.unwrap();
    let mut peer_a = Peer::connect(&node.btp_url, "peer-a", "secret-a").await.unwrap();

    let condition = Fulfillment([2; 32]).condition();
    peer_a
        .send(Frame::Prepare {
            packet_id: crate::domain::packet::PacketId::new("p-3"),
            destination: "g.c.x".to_owned(),
            amount: U256::from(10),
            condition: condition.0,
            expires_at: Utc::now() + ChronoDuration::seconds(3),
            data: Vec::new(),
        })
        .await
        .unwrap();

    // The egress peer goes silent.
    let _ = peer_c.expect_prepare().await.unwrap();

    let reply = peer_a.recv().await.unwrap();
    let Frame::Reject { code, .. } = reply else {
        panic!("expected REJECT, got {reply:?}");
    };
    assert_eq!(code, code::R00_TRANSFER_TIMED_OUT);
}
