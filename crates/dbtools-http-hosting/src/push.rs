//! Events carried over the WebSocket push channel.
//!
//! Every frame is a JSON object `{"event": <kind>, "data": <payload>}`.
//! Clients submit JSON-RPC messages with the `message` event; the server
//! pushes `response`, `error`, `notification` and `request` events.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use dbtools_json_rpc::{JsonRpcMessage, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Client to server: a JSON-RPC message to dispatch
    Message,
    Response,
    Error,
    Notification,
    Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl PushEvent {
    pub fn new(event: EventKind, data: Value) -> Self {
        Self { event, data }
    }

    /// Wrap an outgoing JSON-RPC message in the event matching its kind
    pub fn for_message(message: &JsonRpcMessage) -> Self {
        let event = match message.kind() {
            MessageKind::Request => EventKind::Request,
            MessageKind::Notification => EventKind::Notification,
            MessageKind::ResponseSuccess => EventKind::Response,
            MessageKind::ResponseError => EventKind::Error,
        };
        Self::new(event, message.to_value())
    }

    /// Transport-level failure reported to the client (not a JSON-RPC error)
    pub fn status_error(reason: impl Into<String>) -> Self {
        Self::new(EventKind::Error, json!({ "result": reason.into() }))
    }

    pub fn status_error_with_exception(
        reason: impl Into<String>,
        exception: impl Into<String>,
    ) -> Self {
        Self::new(
            EventKind::Error,
            json!({ "result": reason.into(), "exception": exception.into() }),
        )
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
