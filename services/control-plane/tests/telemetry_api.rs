//! Stats ingest and the telemetry WebSocket.

mod support;

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use support::{Harness, OWNER_HEADER};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn subscribe(h: &Harness) -> Socket {
    let mut request = format!("{}/v1/telemetry/subscribe", h.ws_url)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(OWNER_HEADER, h.owner.to_string().parse().unwrap());
    let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    socket
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no telemetry message")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn push(h: &Harness, node_id: &str, cpu: f64) -> reqwest::Response {
    h.client
        .post(h.url("/v1/agent/stats"))
        .json(&json!({
            "nodeId": node_id,
            "stats": {"cpuPct": cpu, "ramPct": 42.5, "diskPct": 12.0, "networkRate": 1024.0},
        }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn subscriber_gets_snapshot_then_updates() {
    let h = Harness::start().await;
    let mut socket = subscribe(&h).await;

    let initial = next_json(&mut socket).await;
    assert_eq!(initial, json!({}));

    let resp = push(&h, &h.node_id, 37.5).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack, json!({"status": "ok"}));

    let update = next_json(&mut socket).await;
    let sample = &update[h.node_id.as_str()];
    assert_eq!(sample["cpuPct"], 37.5);
    assert_eq!(sample["ramPct"], 42.5);
    assert_eq!(sample["nodeId"], h.node_id.as_str());
}

#[tokio::test]
async fn late_subscriber_sees_latest_reading() {
    let h = Harness::start().await;
    push(&h, &h.node_id, 10.0).await;
    push(&h, &h.node_id, 90.0).await;

    let mut socket = subscribe(&h).await;
    let initial = next_json(&mut socket).await;
    assert_eq!(initial[h.node_id.as_str()]["cpuPct"], 90.0);
}

#[tokio::test]
async fn malformed_node_id_is_rejected() {
    let h = Harness::start().await;
    let resp = push(&h, "not-a-node", 10.0).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_node_is_accepted() {
    let h = Harness::start().await;
    let stranger = kiln_id::NodeId::new().to_string();
    let resp = push(&h, &stranger, 5.0).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn out_of_range_readings_are_clamped() {
    let h = Harness::start().await;
    push(&h, &h.node_id, 250.0).await;

    let history: Value = h
        .get(&format!("/v1/nodes/{}/telemetry", h.node_id))
        .await
        .json()
        .await
        .unwrap();
    let samples = history["samples"].as_array().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0]["cpuPct"], 100.0);
}

#[tokio::test]
async fn history_is_oldest_first() {
    let h = Harness::start().await;
    for cpu in [1.0, 2.0, 3.0] {
        push(&h, &h.node_id, cpu).await;
    }

    let history: Value = h
        .get(&format!("/v1/nodes/{}/telemetry", h.node_id))
        .await
        .json()
        .await
        .unwrap();
    let cpus: Vec<f64> = history["samples"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["cpuPct"].as_f64().unwrap())
        .collect();
    assert_eq!(cpus, vec![1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn push_refreshes_heartbeat() {
    let h = Harness::start().await;
    let before: Value = h
        .get(&format!("/v1/nodes/{}", h.node_id))
        .await
        .json()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    push(&h, &h.node_id, 5.0).await;

    let after: Value = h
        .get(&format!("/v1/nodes/{}", h.node_id))
        .await
        .json()
        .await
        .unwrap();
    assert_ne!(before["last_heartbeat"], after["last_heartbeat"]);
    assert_eq!(after["status"], "online");
}

#[tokio::test]
async fn subscribe_requires_identity() {
    let h = Harness::start().await;
    let result =
        tokio_tungstenite::connect_async(format!("{}/v1/telemetry/subscribe", h.ws_url)).await;
    assert!(result.is_err());
}
