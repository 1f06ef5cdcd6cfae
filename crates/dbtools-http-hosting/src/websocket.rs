//! WebSocket push channel: handshake, session binding and the per-connection loop

use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dbtools_json_rpc::JsonRpcMessage;

use crate::HttpHostingError;
use crate::push::{EventKind, PushEvent};
use crate::server::{
    HttpResponse, NO_SESSION, NOT_BOUND, PROCESSING_FAILED, ServerState, error_response,
    request_session,
};
use crate::session::{ConnectionHandle, Outbound};

type Socket = WebSocketStream<TokioIo<Upgraded>>;

/// Answer the handshake and hand the upgraded connection to a background task
pub(crate) fn upgrade(
    mut req: Request<Incoming>,
    state: Arc<ServerState>,
    origin: Option<&str>,
) -> HttpResponse {
    if !state.cors.permits(origin) {
        warn!("Rejecting WebSocket connection from disallowed origin {:?}", origin);
        return error_response(StatusCode::FORBIDDEN, "Origin not allowed");
    }
    if !header_has_token(req.headers(), &CONNECTION, "upgrade")
        || !header_has_token(req.headers(), &UPGRADE, "websocket")
    {
        return error_response(StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade request");
    }
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key header");
    };
    let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid handshake key");
    };

    let session_id = request_session(req.headers(), req.uri(), &state);
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let socket =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                match session_id {
                    Some(session_id) => serve_session(socket, state, session_id).await,
                    None => reject(socket, &state).await,
                }
            }
            Err(e) => error!("WebSocket upgrade failed: {}", e),
        }
    });

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Tell the client why, give it a moment to read the event, then disconnect
async fn reject(mut socket: Socket, state: &ServerState) {
    warn!("WebSocket connection without a valid session, disconnecting client");
    if let Err(e) = send_event(&mut socket, &PushEvent::status_error(NO_SESSION)).await {
        debug!("Could not notify rejected client: {}", e);
    }
    tokio::time::sleep(state.config.reject_grace_period).await;
    let _ = socket.close(None).await;
}

async fn serve_session(socket: Socket, state: Arc<ServerState>, session_id: String) {
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let replies = tx.clone();
    let handle = ConnectionHandle::new(tx);
    let connection_id = handle.id();
    if let Some(previous) = state.sessions.bind(&session_id, handle) {
        info!(session_id = %session_id, "Replacing existing WebSocket connection for session");
        state.sessions.close(&previous);
    }
    info!(session_id = %session_id, "Client connected");

    // requests and notifications run in arrival order on their own task so
    // this loop keeps writing events and reading responses meanwhile
    let (queue, pending) = mpsc::unbounded_channel();
    tokio::spawn(run_dispatch_queue(
        Arc::clone(&state),
        session_id.clone(),
        pending,
        replies,
    ));

    let (mut sink, mut stream) = socket.split();
    let mut shutdown = state.shutdown_signal();
    let mut keep_alive = state
        .config
        .keep_alive_interval()
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(Outbound::Event(event)) => {
                    if let Err(e) = send_event(&mut sink, &event).await {
                        debug!(session_id = %session_id, "WebSocket send failed: {}", e);
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = match decode_text(&state, &session_id, connection_id, text.as_str()) {
                        Ok(message) if message.is_response() => {
                            dispatch_message(&state, &session_id, message).await
                        }
                        Ok(message) => {
                            if queue.send(message).is_err() {
                                error!(session_id = %session_id, "Dispatch queue closed");
                                break;
                            }
                            None
                        }
                        Err(event) => Some(event),
                    };
                    if let Some(event) = reply
                        && let Err(e) = send_event(&mut sink, &event).await
                    {
                        debug!(session_id = %session_id, "WebSocket send failed: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    warn!(session_id = %session_id, "Ignoring binary WebSocket frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, "WebSocket read failed: {}", e);
                    break;
                }
            },
            _ = next_tick(&mut keep_alive) => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            },
            _ = shutdown.changed() => {}
        }
    }

    let _ = sink.close().await;
    if state.sessions.unbind(&session_id, connection_id) {
        info!(session_id = %session_id, "Client disconnected");
    } else {
        debug!(session_id = %session_id, "Replaced WebSocket connection closed");
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Dispatch queued messages one at a time until the connection loop exits
async fn run_dispatch_queue(
    state: Arc<ServerState>,
    session_id: String,
    mut pending: mpsc::UnboundedReceiver<JsonRpcMessage>,
    replies: mpsc::UnboundedSender<Outbound>,
) {
    while let Some(message) = pending.recv().await {
        if let Some(event) = dispatch_message(&state, &session_id, message).await
            && replies.send(Outbound::Event(event)).is_err()
        {
            break;
        }
    }
    debug!(session_id = %session_id, "Dispatch queue drained");
}

/// Decode one client frame. The error is a status event for this connection.
fn decode_text(
    state: &ServerState,
    session_id: &str,
    connection_id: Uuid,
    text: &str,
) -> Result<JsonRpcMessage, PushEvent> {
    if state.sessions.bound_connection(session_id) != Some(connection_id) {
        warn!(session_id = %session_id, "Message from a connection not bound to its session");
        return Err(PushEvent::status_error(NOT_BOUND));
    }

    let event: PushEvent = serde_json::from_str(text).map_err(|e| {
        warn!(session_id = %session_id, "Malformed WebSocket event: {}", e);
        PushEvent::status_error_with_exception(PROCESSING_FAILED, e.to_string())
    })?;
    if event.event != EventKind::Message {
        warn!(session_id = %session_id, "Ignoring unsupported client event {:?}", event.event);
        return Err(PushEvent::status_error(format!(
            "Unsupported event: {:?}",
            event.event
        )));
    }

    JsonRpcMessage::parse(event.data).map_err(|e| {
        warn!(session_id = %session_id, "Rejecting malformed JSON-RPC message: {}", e);
        PushEvent::status_error_with_exception(PROCESSING_FAILED, e.to_string())
    })
}

async fn dispatch_message(
    state: &Arc<ServerState>,
    session_id: &str,
    message: JsonRpcMessage,
) -> Option<PushEvent> {
    match state.dispatch(session_id, message).await {
        Ok(()) => None,
        Err(e) => {
            error!(session_id = %session_id, "Dispatch failed: {}", e);
            Some(PushEvent::status_error_with_exception(
                PROCESSING_FAILED,
                e.to_string(),
            ))
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &PushEvent) -> Result<(), HttpHostingError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = event.to_text()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
