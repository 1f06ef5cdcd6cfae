//! HTTP + WebSocket server
//!
//! Routes:
//! - `POST /start-session` creates (or reuses) a session and sets its cookie
//! - `POST /json-rpc` dispatches one JSON-RPC message for the caller's session
//! - `GET <websocket_path>` upgrades to the session's push channel

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, COOKIE, HeaderValue, ORIGIN, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use dbtools_hosting::{Dispatcher, RpcPeer, SharedTransport, TransportContext};
use dbtools_json_rpc::{CallError, JsonRpcMessage, JsonRpcResponse, MessageDirection, MessageTap};

use crate::config::WebServerConfig;
use crate::cors::CorsPolicy;
use crate::push::PushEvent;
use crate::session::SessionRegistry;
use crate::{Result, websocket};

pub(crate) const NO_SESSION: &str = "No session ID found. Please authenticate first.";
pub(crate) const NO_CONNECTION: &str = "No active WebSocket connection found for this session";
pub(crate) const NOT_BOUND: &str = "This WebSocket connection does not match an active session.";
pub(crate) const PROCESSING_FAILED: &str = "Error processing request!";

const SESSION_QUERY_PARAM: &str = "session_id";

pub(crate) type HttpResponse = Response<Full<Bytes>>;

/// State shared by the accept loop, every connection task and the server handle
pub(crate) struct ServerState {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) config: WebServerConfig,
    pub(crate) cors: CorsPolicy,
    pub(crate) sessions: SessionRegistry,
    tap: Option<Arc<dyn MessageTap>>,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub(crate) fn observe(&self, message: &JsonRpcMessage, direction: MessageDirection) {
        if let Some(tap) = &self.tap {
            tap.on_message(message, direction);
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Stopping web server");
        }
        self.sessions.close_all();
    }

    fn session_transport(self: &Arc<Self>, session_id: &str) -> SharedTransport {
        Arc::new(SessionTransport {
            session_id: session_id.to_string(),
            state: Arc::clone(self),
        })
    }

    /// Dispatch a message on behalf of `session_id`.
    ///
    /// Responses only complete a pending request and are delivered inline.
    /// Everything else runs on the blocking pool since handlers may block.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        session_id: &str,
        message: JsonRpcMessage,
    ) -> std::result::Result<(), tokio::task::JoinError> {
        self.observe(&message, MessageDirection::Incoming);
        let transport = self.session_transport(session_id);

        if message.is_response() {
            self.dispatcher.dispatch(message, &transport);
            return Ok(());
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::task::spawn_blocking(move || dispatcher.dispatch(message, &transport)).await
    }
}

/// Routes a session's outgoing messages to its push channel
struct SessionTransport {
    session_id: String,
    state: Arc<ServerState>,
}

impl TransportContext for SessionTransport {
    fn send(&self, message: JsonRpcMessage) {
        self.state.observe(&message, MessageDirection::Outgoing);
        if !self
            .state
            .sessions
            .push(&self.session_id, PushEvent::for_message(&message))
        {
            warn!(
                session_id = %self.session_id,
                "No active WebSocket connection for session, dropping outgoing message"
            );
        }
    }

    fn stop(&self) {
        self.state.stop();
    }
}

/// Sends server-initiated traffic to every connected session
struct BroadcastTransport {
    state: Arc<ServerState>,
}

impl TransportContext for BroadcastTransport {
    fn send(&self, message: JsonRpcMessage) {
        self.state.observe(&message, MessageDirection::Outgoing);
        let event = PushEvent::for_message(&message);
        let sessions = self.state.sessions.connected_sessions();
        if sessions.is_empty() {
            debug!("No connected sessions, dropping broadcast message");
        }
        for session_id in sessions {
            self.state.sessions.push(&session_id, event.clone());
        }
    }

    fn stop(&self) {
        self.state.stop();
    }
}

/// Multi-session JSON-RPC server over HTTP and WebSocket
#[derive(Clone)]
pub struct WebServer {
    state: Arc<ServerState>,
}

impl WebServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: WebServerConfig) -> Self {
        WebServerBuilder::new(dispatcher).config(config).build()
    }

    pub fn builder(dispatcher: Arc<Dispatcher>) -> WebServerBuilder {
        WebServerBuilder::new(dispatcher)
    }

    pub fn config(&self) -> &WebServerConfig {
        &self.state.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.state.dispatcher
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.state.sessions
    }

    /// Bind the configured address and serve until stopped
    pub async fn run(&self) -> Result<()> {
        let address = self.state.config.bind_address()?;
        let listener = TcpListener::bind(address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Web server listening on {}", listener.local_addr()?);
        info!(
            "WebSocket endpoint available at: {}",
            self.state.config.websocket_path
        );
        if self.state.cors.is_dynamic() {
            info!("Dynamic CORS enabled, accepting every origin");
        }

        let mut shutdown = self.state.shutdown_signal();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => continue,
            };
            debug!("New connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    let err_str = err.to_string();
                    if err_str.contains("connection closed before message completed") {
                        debug!("Client disconnected (normal): {}", err);
                    } else {
                        error!("Error serving connection: {}", err);
                    }
                }
            });
        }

        info!("Web server stopped");
        Ok(())
    }

    /// Stop accepting connections and close every push channel
    pub fn stop(&self) {
        self.state.stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.is_stop_requested()
    }

    /// Peer addressing a single session
    pub fn session_peer(&self, session_id: &str) -> RpcPeer {
        self.state
            .dispatcher
            .peer(self.state.session_transport(session_id))
    }

    /// Peer addressing every connected session
    pub fn broadcast_peer(&self) -> RpcPeer {
        self.state.dispatcher.peer(Arc::new(BroadcastTransport {
            state: Arc::clone(&self.state),
        }))
    }

    pub fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> std::result::Result<(), serde_json::Error> {
        self.broadcast_peer().send_notification(method, params)
    }

    /// Broadcast a request; the first response received completes it
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<JsonRpcResponse, CallError> {
        self.broadcast_peer().send_request(method, params).await
    }
}

pub struct WebServerBuilder {
    dispatcher: Arc<Dispatcher>,
    config: WebServerConfig,
    tap: Option<Arc<dyn MessageTap>>,
}

impl WebServerBuilder {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            config: WebServerConfig::default(),
            tap: None,
        }
    }

    pub fn config(mut self, config: WebServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe every message entering or leaving the server
    pub fn tap(mut self, tap: Arc<dyn MessageTap>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn build(self) -> WebServer {
        let (shutdown, _) = watch::channel(false);
        WebServer {
            state: Arc::new(ServerState {
                dispatcher: self.dispatcher,
                cors: CorsPolicy::from_config(&self.config),
                sessions: SessionRegistry::with_idle_timeout(self.config.session_idle_timeout),
                config: self.config,
                tap: self.tap,
                shutdown,
            }),
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> std::result::Result<HttpResponse, Infallible> {
    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    debug!("Handling {} {}", req.method(), req.uri().path());
    let mut response = route(req, &state, origin.as_deref()).await;
    state
        .cors
        .apply_headers(response.headers_mut(), origin.as_deref());
    Ok(response)
}

async fn route(
    req: Request<Incoming>,
    state: &Arc<ServerState>,
    origin: Option<&str>,
) -> HttpResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => {
            if state.cors.permits(origin) {
                empty_response(StatusCode::NO_CONTENT)
            } else {
                error_response(StatusCode::FORBIDDEN, "Origin not allowed")
            }
        }
        (&Method::POST, "/start-session") => start_session(&req, state),
        (&Method::POST, "/json-rpc") => json_rpc(req, state).await,
        (&Method::GET, p) if p == state.config.websocket_path => {
            websocket::upgrade(req, Arc::clone(state), origin)
        }
        (_, "/start-session" | "/json-rpc") => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

fn start_session(req: &Request<Incoming>, state: &ServerState) -> HttpResponse {
    let existing = cookie_value(req.headers(), &state.config.session_cookie_name);
    let session_id = state.sessions.ensure_session(existing.as_deref());
    info!(session_id = %session_id, "Session started");

    let mut response = json_response(StatusCode::OK, &json!({ "session_id": session_id }));
    let cookie = session_cookie(&state.config, &session_id);
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().insert(SET_COOKIE, value);
        }
        Err(e) => warn!("Could not encode session cookie: {}", e),
    }
    response
}

async fn json_rpc(req: Request<Incoming>, state: &Arc<ServerState>) -> HttpResponse {
    let Some(session_id) = request_session(req.headers(), req.uri(), state) else {
        warn!("JSON-RPC request without a valid session");
        return error_response(StatusCode::FORBIDDEN, NO_SESSION);
    };
    if !state.sessions.is_connected(&session_id) {
        warn!(session_id = %session_id, "JSON-RPC request for session without a WebSocket connection");
        return error_response(StatusCode::NOT_FOUND, NO_CONNECTION);
    }

    let body = match Limited::new(req.into_body(), state.config.max_body_size)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Failed to read request body: {}", e),
            );
        }
    };

    let message = match JsonRpcMessage::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id = %session_id, "Rejecting malformed JSON-RPC body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    match state.dispatch(&session_id, message).await {
        Ok(()) => json_response(StatusCode::OK, &json!({ "result": "ok" })),
        Err(e) => {
            error!(session_id = %session_id, "Dispatch failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Session id from the cookie, falling back to the `session_id` query parameter.
/// Only ids the registry knows are returned.
pub(crate) fn request_session(
    headers: &HeaderMap,
    uri: &Uri,
    state: &ServerState,
) -> Option<String> {
    cookie_value(headers, &state.config.session_cookie_name)
        .or_else(|| query_value(uri, SESSION_QUERY_PARAM))
        .filter(|id| state.sessions.contains(id))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn query_value(uri: &Uri, name: &str) -> Option<String> {
    form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn session_cookie(config: &WebServerConfig, session_id: &str) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly",
        config.session_cookie_name, session_id
    );
    if config.secure_cookie {
        cookie.push_str("; Secure; SameSite=None");
    }
    cookie
}

pub(crate) fn json_response(status: StatusCode, body: &Value) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    json_response(status, &json!({ "error": message }))
}

pub(crate) fn empty_response(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
