//! End-to-end tests for the HTTP + WebSocket transport
//!
//! Each test binds an ephemeral port, drives the server with `reqwest` for
//! the HTTP endpoints and `tokio-tungstenite` for the push channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use serial_test::serial;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use dbtools_hosting::{DispatcherBuilder, RequestContext};
use dbtools_http_hosting::{WebServer, WebServerConfig};
use dbtools_json_rpc::AsyncBridge;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: WebServer,
    addr: SocketAddr,
    http: reqwest::Client,
    serving: JoinHandle<dbtools_http_hosting::Result<()>>,
}

impl TestServer {
    async fn start(builder: DispatcherBuilder, config: WebServerConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = WebServer::builder(builder.build()).config(config).build();
        let runner = server.clone();
        let serving = tokio::spawn(async move { runner.serve(listener).await });

        Self {
            server,
            addr,
            http: reqwest::Client::new(),
            serving,
        }
    }

    async fn with_defaults() -> Self {
        Self::start(DispatcherBuilder::new(), test_config()).await
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn start_session(&self) -> String {
        let response = self.http.post(self.url("/start-session")).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        body["session_id"].as_str().unwrap().to_string()
    }

    async fn post_message(&self, session: Option<&str>, message: Value) -> (u16, Value) {
        let mut request = self.http.post(self.url("/json-rpc")).json(&message);
        if let Some(session) = session {
            request = request.header("Cookie", format!("session_id={}", session));
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn connect(&self, session: Option<&str>) -> Socket {
        let mut request = format!("ws://{}/ws", self.addr)
            .into_client_request()
            .unwrap();
        if let Some(session) = session {
            request.headers_mut().insert(
                "Cookie",
                HeaderValue::from_str(&format!("session_id={}", session)).unwrap(),
            );
        }
        let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        socket
    }

    /// Connect and wait until the server has bound the connection
    async fn connect_bound(&self, session: &str) -> Socket {
        let socket = self.connect(Some(session)).await;
        timeout(WAIT, async {
            while !self.server.sessions().is_connected(session) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was never bound");
        socket
    }
}

fn test_config() -> WebServerConfig {
    WebServerConfig::default()
        .listen_address("127.0.0.1")
        .secure_cookie(false)
        .reject_grace_period(Duration::from_millis(100))
}

/// Next push event, skipping control frames. `None` once the socket closes.
async fn next_event(socket: &mut Socket) -> Option<Value> {
    timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .expect("timed out waiting for a push event")
}

async fn send_event(socket: &mut Socket, event: Value) {
    socket
        .send(Message::Text(event.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_start_session_reuses_cookie() {
    let test = TestServer::with_defaults().await;

    let response = test.http.post(test.url("/start-session")).send().await.unwrap();
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let session: Value = response.json().await.unwrap();
    let session_id = session["session_id"].as_str().unwrap();
    assert!(cookie.starts_with(&format!("session_id={}", session_id)));

    let again: Value = test
        .http
        .post(test.url("/start-session"))
        .header("Cookie", format!("session_id={}", session_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["session_id"], session_id);
    assert_eq!(test.server.sessions().session_count(), 1);

    let get = test.http.get(test.url("/start-session")).send().await.unwrap();
    assert_eq!(get.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_json_rpc_requires_session_and_connection() {
    let test = TestServer::with_defaults().await;
    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "version"});

    let (status, body) = test.post_message(None, request.clone()).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"], "No session ID found. Please authenticate first.");

    let (status, _) = test.post_message(Some("forged"), request.clone()).await;
    assert_eq!(status, 403);

    let session = test.start_session().await;
    let (status, body) = test.post_message(Some(&session), request).await;
    assert_eq!(status, 404);
    assert_eq!(
        body["error"],
        "No active WebSocket connection found for this session"
    );

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_http_request_answered_over_websocket() {
    let test = TestServer::with_defaults().await;
    let session = test.start_session().await;
    let mut socket = test.connect_bound(&session).await;

    let (status, body) = test
        .post_message(
            Some(&session),
            json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"q": "select 1"}}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"result": "ok"}));

    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "response");
    assert_eq!(
        event["data"],
        json!({"jsonrpc": "2.0", "id": 1, "result": {"q": "select 1"}})
    );

    let (status, _) = test
        .post_message(Some(&session), json!({"jsonrpc": "2.0", "id": 2, "method": "nope"}))
        .await;
    assert_eq!(status, 200);
    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["error"]["code"], -32601);

    let (status, _) = test.post_message(Some(&session), json!([1, 2, 3])).await;
    assert_eq!(status, 400);

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_websocket_message_events() {
    let test = TestServer::with_defaults().await;
    let session = test.start_session().await;
    let mut socket = test.connect_bound(&session).await;

    send_event(
        &mut socket,
        json!({"event": "message", "data": {"jsonrpc": "2.0", "id": "v1", "method": "version"}}),
    )
    .await;
    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "response");
    assert_eq!(event["data"]["id"], "v1");
    assert_eq!(event["data"]["result"], "1");

    send_event(&mut socket, json!({"event": "message", "data": {"jsonrpc": "2.0"}})).await;
    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["result"], "Error processing request!");
    assert!(event["data"]["exception"].is_string());

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_websocket_without_session_is_rejected() {
    let test = TestServer::with_defaults().await;
    let mut socket = test.connect(None).await;

    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "error");
    assert_eq!(
        event["data"]["result"],
        "No session ID found. Please authenticate first."
    );
    // closed after the grace period
    assert!(next_event(&mut socket).await.is_none());

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_server_request_round_trip() {
    let test = TestServer::with_defaults().await;
    let session = test.start_session().await;
    let mut socket = test.connect_bound(&session).await;

    let peer = test.server.session_peer(&session);
    let pending = tokio::spawn(async move {
        peer.send_request("workspace/configuration", Some(json!({"section": "pgsql"})))
            .await
    });

    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "request");
    assert_eq!(event["data"]["method"], "workspace/configuration");
    let id = event["data"]["id"].clone();

    send_event(
        &mut socket,
        json!({"event": "message", "data": {"jsonrpc": "2.0", "id": id, "result": {"timeout": 30}}}),
    )
    .await;

    let response = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(response.result, json!({"timeout": 30}));

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_handler_waiting_on_client_does_not_stall_connection() {
    let bridge = Arc::new(AsyncBridge::dedicated().unwrap());
    let runner = Arc::clone(&bridge);
    let builder = DispatcherBuilder::new()
        .request_timeout(Duration::from_secs(2))
        .raw_request_handler(
            "connection/connect",
            move |ctx: &RequestContext, _params: Option<Value>| {
                let asking = ctx.clone();
                let answer = runner.run(async move {
                    asking
                        .send_request("workspace/configuration", Some(json!({"section": "pgsql"})))
                        .await
                })??;
                ctx.send_response(json!({"configured": answer.result}))?;
                Ok(())
            },
        );
    let test = TestServer::start(builder, test_config()).await;
    let session = test.start_session().await;
    let mut socket = test.connect_bound(&session).await;

    let started = Instant::now();
    send_event(
        &mut socket,
        json!({"event": "message", "data": {"jsonrpc": "2.0", "id": 1, "method": "connection/connect"}}),
    )
    .await;

    // the handler's request reaches the client while the handler is still waiting
    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "request");
    assert_eq!(event["data"]["method"], "workspace/configuration");
    assert!(started.elapsed() < Duration::from_secs(1));

    let id = event["data"]["id"].clone();
    send_event(
        &mut socket,
        json!({"event": "message", "data": {"jsonrpc": "2.0", "id": id, "result": {"timeout": 30}}}),
    )
    .await;

    let event = next_event(&mut socket).await.unwrap();
    assert_eq!(event["event"], "response");
    assert_eq!(
        event["data"],
        json!({"jsonrpc": "2.0", "id": 1, "result": {"configured": {"timeout": 30}}})
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    test.server.stop();
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_broadcast_notification_reaches_every_session() {
    let test = TestServer::with_defaults().await;
    let first = test.start_session().await;
    let second = test.start_session().await;
    let mut first_socket = test.connect_bound(&first).await;
    let mut second_socket = test.connect_bound(&second).await;

    test.server
        .send_notification("window/showMessage", json!({"message": "hello"}))
        .unwrap();

    for socket in [&mut first_socket, &mut second_socket] {
        let event = next_event(socket).await.unwrap();
        assert_eq!(event["event"], "notification");
        assert_eq!(event["data"]["method"], "window/showMessage");
        assert_eq!(event["data"]["params"]["message"], "hello");
    }

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_reconnect_replaces_previous_connection() {
    let test = TestServer::with_defaults().await;
    let session = test.start_session().await;
    let mut old_socket = test.connect_bound(&session).await;
    let mut new_socket = test.connect(Some(&session)).await;

    // the first connection is closed once the second binds
    assert!(next_event(&mut old_socket).await.is_none());
    assert!(test.server.sessions().is_connected(&session));

    send_event(
        &mut new_socket,
        json!({"event": "message", "data": {"jsonrpc": "2.0", "id": 1, "method": "version"}}),
    )
    .await;
    assert_eq!(next_event(&mut new_socket).await.unwrap()["event"], "response");

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_shutdown_request_stops_server() {
    let test = TestServer::with_defaults().await;
    let session = test.start_session().await;
    let mut socket = test.connect_bound(&session).await;

    send_event(
        &mut socket,
        json!({"event": "message", "data": {"jsonrpc": "2.0", "id": 9, "method": "shutdown"}}),
    )
    .await;

    assert!(next_event(&mut socket).await.is_none());
    timeout(WAIT, test.serving).await.unwrap().unwrap().unwrap();
    assert!(test.server.is_stop_requested());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_cors_headers_follow_policy() {
    let test = TestServer::with_defaults().await;

    let allowed = test
        .http
        .post(test.url("/start-session"))
        .header("Origin", "http://localhost")
        .send()
        .await
        .unwrap();
    assert_eq!(
        allowed.headers()["access-control-allow-origin"],
        "http://localhost"
    );
    assert_eq!(allowed.headers()["access-control-allow-credentials"], "true");

    let denied = test
        .http
        .post(test.url("/start-session"))
        .header("Origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert!(denied.headers().get("access-control-allow-origin").is_none());

    let preflight = test
        .http
        .request(reqwest::Method::OPTIONS, test.url("/json-rpc"))
        .header("Origin", "http://localhost")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), reqwest::StatusCode::NO_CONTENT);

    let mut request = format!("ws://{}/ws", test.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://evil.example"));
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    test.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_dynamic_cors_accepts_any_origin() {
    let test = TestServer::start(
        DispatcherBuilder::new(),
        test_config().enable_dynamic_cors(true),
    )
    .await;

    let response = test
        .http
        .post(test.url("/start-session"))
        .header("Origin", "https://anywhere.example")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://anywhere.example"
    );

    test.server.stop();
}
