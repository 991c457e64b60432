//! End-to-end tests for admission, the shard channel, and signal relay
//!
//! Each test boots the full router on an ephemeral port and drives it with
//! real HTTP requests and WebSocket connections.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use voicegrid::app::AppState;
use voicegrid::client::{SignalingClient, SignalingConfig, SignalingEvent};
use voicegrid::config::Config;
use voicegrid::geo::Vec3;
use voicegrid::http::build_router;
use voicegrid::ws::protocol::ServerMsg;

const FRAME_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Start the server on a random port and return its base URL.
async fn start_test_server() -> String {
    let state = AppState::new(Config::default());
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

/// POST /join and return the parsed response body.
async fn join(base_url: &str, player_id: &str, position: (f64, f64, f64)) -> Value {
    let response = reqwest::Client::new()
        .post(format!("{}/join", base_url))
        .json(&json!({
            "playerId": player_id,
            "position": { "x": position.0, "y": position.1, "z": position.2 },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "admission should succeed");
    response.json().await.unwrap()
}

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A raw shard-channel connection driven frame by frame
struct TestClient {
    write: SplitSink<WsConn, Message>,
    read: SplitStream<WsConn>,
}

impl TestClient {
    async fn connect(admission: &Value) -> Self {
        let url = admission["cellWebSocketUrl"].as_str().unwrap();
        let (ws, _) = connect_async(url).await.unwrap();
        let (write, read) = ws.split();
        Self { write, read }
    }

    async fn connect_and_register(admission: &Value, player_id: &str) -> Self {
        let mut client = Self::connect(admission).await;
        client
            .send(json!({
                "type": "register",
                "playerId": player_id,
                "sessionToken": admission["sessionToken"],
            }))
            .await;
        let frame = client.next_json().await;
        assert_eq!(frame["type"], "registered", "got {}", frame);
        assert_eq!(frame["playerId"], player_id);
        client
    }

    async fn send(&mut self, frame: Value) {
        self.write
            .send(Message::Text(frame.to_string()))
            .await
            .unwrap();
    }

    /// Next text frame, decoded
    async fn next_json(&mut self) -> Value {
        loop {
            let msg = timeout(FRAME_TIMEOUT, self.read.next())
                .await
                .expect("timed out waiting for frame")
                .expect("channel ended")
                .expect("receive error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Skip frames until one with the given type arrives
    async fn next_of_type(&mut self, frame_type: &str) -> Value {
        loop {
            let frame = self.next_json().await;
            if frame["type"] == frame_type {
                return frame;
            }
        }
    }

    /// Await a close frame and return its code
    async fn expect_close(&mut self) -> u16 {
        loop {
            match timeout(FRAME_TIMEOUT, self.read.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => panic!("connection ended without close frame"),
            }
        }
    }
}

// ============================================================================
// Admission
// ============================================================================

mod admission {
    use super::*;

    #[tokio::test]
    async fn join_returns_cell_token_and_relay_servers() {
        let base_url = start_test_server().await;
        let admission = join(&base_url, "p1", (1.0, 2.0, 3.0)).await;

        assert_eq!(admission["cellId"], "cell:0:0:0");
        assert_eq!(admission["transportMode"], "p2p");
        assert!(admission["sessionToken"].as_str().unwrap().len() >= 22);
        assert!(admission["cellWebSocketUrl"]
            .as_str()
            .unwrap()
            .starts_with("ws://"));
        assert!(!admission["iceServers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn positions_in_distinct_cells_get_distinct_endpoints() {
        let base_url = start_test_server().await;
        let near = join(&base_url, "p1", (10.0, 0.0, 0.0)).await;
        let far = join(&base_url, "p2", (100.0, 0.0, 0.0)).await;
        assert_eq!(near["cellId"], "cell:0:0:0");
        assert_eq!(far["cellId"], "cell:1:0:0");
        assert_ne!(near["cellWebSocketUrl"], far["cellWebSocketUrl"]);
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_with_400() {
        let base_url = start_test_server().await;
        let client = reqwest::Client::new();

        for body in [
            json!({ "position": { "x": 0.0, "y": 0.0, "z": 0.0 } }),
            json!({ "playerId": "", "position": { "x": 0.0, "y": 0.0, "z": 0.0 } }),
            json!({ "playerId": "p1" }),
            json!({ "playerId": "p1", "position": { "x": "not-a-number", "y": 0.0, "z": 0.0 } }),
        ] {
            let response = client
                .post(format!("{}/join", base_url))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 400, "body {} should be rejected", body);
            let error: Value = response.json().await.unwrap();
            assert!(error["error"].is_string());
        }
    }

    #[tokio::test]
    async fn preflight_gets_204_with_permissive_headers() {
        let base_url = start_test_server().await;
        let response = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("{}/join", base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-methods")
                .unwrap(),
            "GET,HEAD,POST,OPTIONS"
        );
    }

    #[tokio::test]
    async fn plain_get_on_cell_endpoint_requires_upgrade() {
        let base_url = start_test_server().await;
        let response = reqwest::get(format!("{}/cell/cell:0:0:0", base_url))
            .await
            .unwrap();
        assert_eq!(response.status(), 426);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let base_url = start_test_server().await;
        let health: Value = reqwest::get(format!("{}/health", base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
    }
}

// ============================================================================
// Shard channel
// ============================================================================

mod shard_channel {
    use super::*;

    #[tokio::test]
    async fn happy_path_join_proximity_and_relay() {
        let base_url = start_test_server().await;
        let admission_a = join(&base_url, "alice", (0.0, 0.0, 0.0)).await;
        let admission_b = join(&base_url, "bob", (5.0, 0.0, 0.0)).await;
        assert_eq!(admission_a["cellId"], admission_b["cellId"]);

        let mut alice = TestClient::connect_and_register(&admission_a, "alice").await;
        let mut bob = TestClient::connect_and_register(&admission_b, "bob").await;

        alice
            .send(json!({ "type": "position", "position": { "x": 0.0, "y": 0.0, "z": 0.0 } }))
            .await;
        bob.send(json!({ "type": "position", "position": { "x": 5.0, "y": 0.0, "z": 0.0 } }))
            .await;

        let peers_a = alice.next_of_type("peers").await;
        assert_eq!(peers_a["peers"], json!(["bob"]));
        assert_eq!(peers_a["totalPlayers"], 2);
        assert!((peers_a["distances"]["bob"].as_f64().unwrap() - 5.0).abs() < 1e-9);

        let peers_b = bob.next_of_type("peers").await;
        assert_eq!(peers_b["peers"], json!(["alice"]));
        assert!((peers_b["distances"]["alice"].as_f64().unwrap() - 5.0).abs() < 1e-9);

        // Opaque relay
        alice
            .send(json!({ "type": "signal", "targetId": "bob", "payload": { "t": "offer" } }))
            .await;
        let signal = bob.next_of_type("signal").await;
        assert_eq!(signal["from"], "alice");
        assert_eq!(signal["payload"], json!({ "t": "offer" }));

        // Unknown target
        alice
            .send(json!({ "type": "signal", "targetId": "zzz", "payload": {} }))
            .await;
        let failed = alice.next_of_type("signal-delivery-failed").await;
        assert_eq!(failed["targetId"], "zzz");

        // Proximity exit: bob leaves the audibility radius
        tokio::time::sleep(Duration::from_millis(150)).await;
        bob.send(json!({ "type": "position", "position": { "x": 200.0, "y": 0.0, "z": 0.0 } }))
            .await;

        let exit = alice.next_of_type("peers").await;
        assert_eq!(exit["peers"], json!([]));
        assert_eq!(exit["removed"], json!(["bob"]));
    }

    #[tokio::test]
    async fn duplicate_register_closes_the_first_socket() {
        let base_url = start_test_server().await;
        let first_admission = join(&base_url, "alice", (0.0, 0.0, 0.0)).await;
        let mut first = TestClient::connect_and_register(&first_admission, "alice").await;

        // A second admission mints a distinct token for the same player
        let second_admission = join(&base_url, "alice", (0.0, 0.0, 0.0)).await;
        assert_ne!(first_admission["sessionToken"], second_admission["sessionToken"]);

        let mut second = TestClient::connect(&second_admission).await;
        second
            .send(json!({
                "type": "register",
                "playerId": "alice",
                "sessionToken": second_admission["sessionToken"],
            }))
            .await;

        assert_eq!(first.expect_close().await, 1001);
        let registered = second.next_of_type("registered").await;
        assert_eq!(registered["playerId"], "alice");
    }

    #[tokio::test]
    async fn register_with_unissued_token_is_fatal() {
        let base_url = start_test_server().await;
        let admission = join(&base_url, "alice", (0.0, 0.0, 0.0)).await;

        let mut client = TestClient::connect(&admission).await;
        client
            .send(json!({
                "type": "register",
                "playerId": "alice",
                "sessionToken": "never-issued",
            }))
            .await;

        let error = client.next_json().await;
        assert_eq!(error["type"], "error");
        assert_eq!(client.expect_close().await, 4001);
    }

    #[tokio::test]
    async fn malformed_frames_get_error_replies_and_keep_the_connection() {
        let base_url = start_test_server().await;
        let admission = join(&base_url, "alice", (0.0, 0.0, 0.0)).await;
        let mut client = TestClient::connect(&admission).await;

        client.send(json!({ "no": "type" })).await;
        assert_eq!(client.next_json().await["type"], "error");

        client
            .write
            .send(Message::Binary(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(client.next_json().await["type"], "error");

        // Still usable: register succeeds afterwards
        client
            .send(json!({
                "type": "register",
                "playerId": "alice",
                "sessionToken": admission["sessionToken"],
            }))
            .await;
        assert_eq!(client.next_of_type("registered").await["playerId"], "alice");
    }
}

// ============================================================================
// Signaling client
// ============================================================================

mod signaling_client {
    use super::*;

    #[tokio::test]
    async fn client_registers_streams_positions_and_receives_relay() {
        let base_url = start_test_server().await;
        let admission_a = join(&base_url, "alice", (0.0, 0.0, 0.0)).await;
        let admission_b = join(&base_url, "bob", (3.0, 0.0, 0.0)).await;

        let config = SignalingConfig::new(
            "alice",
            admission_a["sessionToken"].as_str().unwrap(),
        )
        .with_position_interval(Duration::from_millis(120))
        .with_position_source(|| Some(Vec3::new(0.0, 0.0, 0.0)));

        let (alice, mut events) = SignalingClient::connect(
            admission_a["cellWebSocketUrl"].as_str().unwrap(),
            config,
        )
        .await
        .unwrap();

        match timeout(FRAME_TIMEOUT, events.recv()).await.unwrap().unwrap() {
            SignalingEvent::Frame(ServerMsg::Registered { player_id }) => {
                assert_eq!(player_id, "alice");
            }
            other => panic!("expected registered event, got {:?}", other),
        }
        assert!(alice.is_registered());

        // Bob arrives nearby on a raw connection
        let mut bob = TestClient::connect_and_register(&admission_b, "bob").await;
        bob.send(json!({ "type": "position", "position": { "x": 3.0, "y": 0.0, "z": 0.0 } }))
            .await;

        // Alice's polled position stream makes the pair mutually audible
        let peers = loop {
            match timeout(FRAME_TIMEOUT, events.recv()).await.unwrap().unwrap() {
                SignalingEvent::Frame(ServerMsg::Peers { peers, .. }) => break peers,
                SignalingEvent::Frame(_) => continue,
                SignalingEvent::Disconnected => panic!("channel dropped early"),
            }
        };
        assert_eq!(peers, vec!["bob".to_string()]);

        bob.send(json!({ "type": "signal", "targetId": "alice", "payload": { "t": "answer" } }))
            .await;
        loop {
            match timeout(FRAME_TIMEOUT, events.recv()).await.unwrap().unwrap() {
                SignalingEvent::Frame(ServerMsg::Signal { from, payload }) => {
                    assert_eq!(from, "bob");
                    assert_eq!(payload, json!({ "t": "answer" }));
                    break;
                }
                SignalingEvent::Frame(_) => continue,
                SignalingEvent::Disconnected => panic!("channel dropped early"),
            }
        }

        alice.shutdown().await;
    }
}
