//! End-to-end tests: the real router on an ephemeral port, driven by a
//! WebSocket charge point and an HTTP client.

use futures_util::{SinkExt, StreamExt};
use ocpp_gateway::api;
use ocpp_gateway::config::{Config, StaticToken};
use ocpp_gateway::gateway::{spawn_gateway_tasks, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const GATEWAY_KEY: &str = "test-gateway-key-0123456789abcdef";

type ChargePoint = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
}

impl TestGateway {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let mut cfg = Config::default();
        cfg.auth.gateway_api_key = GATEWAY_KEY.into();
        cfg.auth.static_tokens = vec![StaticToken {
            token: "user-token".into(),
            user_id: "user-1".into(),
        }];
        cfg.ocpp.request_timeout_ms = 5_000;
        tweak(&mut cfg);

        let (state, events) = AppState::new(cfg).expect("state");
        let shutdown = CancellationToken::new();
        spawn_gateway_tasks(state.clone(), events, shutdown.clone());

        let app = api::router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self, id: &str, subprotocols: &str) -> Result<ChargePoint, WsError> {
        let mut request = format!("ws://{}/ocpp/{}", self.addr, id)
            .into_client_request()
            .expect("request");
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(subprotocols).expect("header"),
        );
        connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn wait_for_connections(&self, n: usize) {
        for _ in 0..100 {
            if self.state.connections.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {n} connections, have {}", self.state.connections.len());
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn call(ws: &mut ChargePoint, frame: Value) -> Value {
    ws.send(Message::Text(frame.to_string())).await.expect("send");
    next_frame(ws).await
}

async fn next_frame(ws: &mut ChargePoint) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("frame ok");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
        other => panic!("unexpected message {other:?}"),
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn test_boot_and_heartbeat_over_ocpp16() {
    let gw = TestGateway::start().await;
    let mut ws = gw.connect("CP-100", "ocpp1.6").await.expect("upgrade");

    let boot = call(
        &mut ws,
        json!([2, "1", "BootNotification", {"chargePointVendor": "Acme", "chargePointModel": "X1"}]),
    )
    .await;
    assert_eq!(boot[0], 3);
    assert_eq!(boot[1], "1");
    assert_eq!(boot[2]["status"], "Accepted");
    assert_eq!(boot[2]["interval"], 60);
    assert!(boot[2]["currentTime"].is_string());

    let beat = call(&mut ws, json!([2, "2", "Heartbeat", {}])).await;
    assert_eq!(beat[1], "2");
    assert!(beat[2]["currentTime"].is_string());

    let body: Value = http()
        .get(gw.url("/connections/CP-100"))
        .header("x-api-key", GATEWAY_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"][0]["chargePointId"], "CP-100");
    assert_eq!(body["data"][0]["ocppVersion"], "1.6");
    assert_eq!(body["data"][0]["status"], "AVAILABLE");
}

#[tokio::test]
async fn test_newest_offered_version_wins() {
    let gw = TestGateway::start().await;
    let mut ws = gw
        .connect("CP-200", "ocpp1.6,ocpp2.0.1")
        .await
        .expect("upgrade");

    let boot = call(
        &mut ws,
        json!([2, "b1", "BootNotification", {
            "reason": "PowerUp",
            "chargingStation": {"vendorName": "Acme", "model": "X2"}
        }]),
    )
    .await;
    assert_eq!(boot[2]["status"], "Accepted");

    let connection = gw.state.connections.authoritative("CP-200").unwrap();
    assert_eq!(connection.ocpp_version, "2.0.1");
}

#[tokio::test]
async fn test_unsupported_subprotocol_is_refused() {
    let gw = TestGateway::start().await;
    match gw.connect("CP-300", "ocpp0.9").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("upgrade should be refused"),
    }
    assert!(gw.state.connections.is_empty());
}

#[tokio::test]
async fn test_unknown_action_gets_not_implemented() {
    let gw = TestGateway::start().await;
    let mut ws = gw.connect("CP-400", "ocpp1.6").await.expect("upgrade");

    let reply = call(&mut ws, json!([2, "9", "FooBar", {}])).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "9");
    assert_eq!(reply[2], "NotImplemented");

    // Malformed frames are dropped without closing the session.
    ws.send(Message::Text("not json".into())).await.unwrap();
    let beat = call(&mut ws, json!([2, "10", "Heartbeat", {}])).await;
    assert_eq!(beat[1], "10");
}

#[tokio::test]
async fn test_correlated_get_configuration_via_rest() {
    let gw = TestGateway::start().await;
    let mut ws = gw.connect("CP-500", "ocpp1.6").await.expect("upgrade");
    gw.wait_for_connections(1).await;

    let url = gw.url("/connections/CP-500/send");
    let request = tokio::spawn(async move {
        http()
            .post(url)
            .header("x-api-key", GATEWAY_KEY)
            .json(&json!({"action": "GetConfiguration", "payload": {"key": ["HeartbeatInterval"]}}))
            .send()
            .await
            .unwrap()
    });

    let outbound = next_frame(&mut ws).await;
    assert_eq!(outbound[0], 2);
    assert_eq!(outbound[2], "GetConfiguration");
    assert_eq!(outbound[3], json!({"key": ["HeartbeatInterval"]}));
    let message_id = outbound[1].as_str().unwrap().to_string();

    ws.send(Message::Text(
        json!([3, message_id, {
            "configurationKey": [{"key": "HeartbeatInterval", "readonly": false, "value": "60"}]
        }])
        .to_string(),
    ))
    .await
    .unwrap();

    let response = request.await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["result"]["configurationKey"][0]["value"], "60");
    assert_eq!(gw.state.requests.pending_count(), 0);
}

#[tokio::test]
async fn test_remote_start_uses_2x_wire_name() {
    let gw = TestGateway::start().await;
    let mut ws = gw.connect("CP-600", "ocpp2.0.1").await.expect("upgrade");
    gw.wait_for_connections(1).await;

    let response = http()
        .post(gw.url("/connections/CP-600/send"))
        .header("x-api-key", GATEWAY_KEY)
        .json(&json!({
            "action": "RemoteStartTransaction",
            "payload": {"idTag": "TAG-1", "connectorId": 1},
            "awaitReply": false
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["sentCount"], 1);

    let outbound = next_frame(&mut ws).await;
    assert_eq!(outbound[2], "RequestStartTransaction");
    assert_eq!(outbound[3]["idToken"]["idToken"], "TAG-1");
    assert_eq!(outbound[3]["evseId"], 1);
}

#[tokio::test]
async fn test_route_guard() {
    let gw = TestGateway::start().await;
    let client = http();

    let health = client.get(gw.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let missing = client.get(gw.url("/connections")).send().await.unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .get(gw.url("/statistics"))
        .header("x-api-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let ok = client
        .get(gw.url("/statistics"))
        .header("x-api-key", GATEWAY_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let anonymous = client.get(gw.url("/transactions/1")).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let signed_in = client
        .get(gw.url("/transactions/1"))
        .bearer_auth("user-token")
        .send()
        .await
        .unwrap();
    assert_eq!(signed_in.status(), 404);
}

#[tokio::test]
async fn test_idle_connection_is_evicted_and_socket_closed() {
    let gw = TestGateway::start().await;
    let mut ws = gw.connect("CP-700", "ocpp1.6").await.expect("upgrade");
    gw.wait_for_connections(1).await;

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(gw.state.connections.evict_idle_since(cutoff).len(), 1);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket should be closed after eviction");
    assert!(gw.state.connections.is_empty());
}
