//! The four wire-level message kinds and their classification.
//!
//! Classification works on the generic JSON form, in priority order:
//!
//! 1. no `id` (or `"id": null`) ⇒ notification, which requires `method`
//! 2. `id` + `result` ⇒ success response (`"result": null` included)
//! 3. `id` + `error` ⇒ error response
//! 4. `id` + `method` ⇒ request
//!
//! Anything else, or a body carrying both `result` and `error`, is rejected.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{JsonRpcErrorObject, ProtocolError};
use crate::notification::JsonRpcNotification;
use crate::request::JsonRpcRequest;
use crate::response::{JsonRpcError, JsonRpcResponse};
use crate::types::{JsonRpcVersion, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Notification,
    ResponseSuccess,
    ResponseError,
}

/// Any JSON-RPC message crossing a transport boundary
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Parse raw bytes into a classified message
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::parse(value)
    }

    /// Classify a generic JSON value
    pub fn parse(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match object.get("jsonrpc") {
            None => {}
            Some(Value::String(v)) if v == crate::JSONRPC_VERSION => {}
            Some(other) => return Err(ProtocolError::InvalidVersion(other.to_string())),
        }

        let id = parse_id(object.remove("id"))?;
        let method = parse_method(object.remove("method"), id.as_ref())?;
        let params = object.remove("params");

        let Some(id) = id else {
            return match method {
                Some(method) => Ok(JsonRpcMessage::Notification(JsonRpcNotification::new(
                    method, params,
                ))),
                None => Err(ProtocolError::invalid(None, "message has neither id nor method")),
            };
        };

        let result = object.remove("result");
        let error = object.remove("error");

        match (result, error) {
            (Some(_), Some(_)) => Err(ProtocolError::invalid(
                Some(id),
                "message carries both result and error",
            )),
            (Some(result), None) => Ok(JsonRpcMessage::Response(JsonRpcResponse::success(
                id, result,
            ))),
            (None, Some(error)) => {
                let error: JsonRpcErrorObject = serde_json::from_value(error).map_err(|e| {
                    ProtocolError::invalid(Some(id.clone()), format!("malformed error object: {}", e))
                })?;
                Ok(JsonRpcMessage::Error(JsonRpcError::new(id, error)))
            }
            (None, None) => match method {
                Some(method) => Ok(JsonRpcMessage::Request(JsonRpcRequest::new(
                    id, method, params,
                ))),
                None => Err(ProtocolError::invalid(
                    Some(id),
                    "message has an id but no method, result or error",
                )),
            },
        }
    }

    /// Convert to the generic JSON form. Never fails.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "jsonrpc".to_string(),
            Value::String(JsonRpcVersion::V2_0.as_str().to_string()),
        );

        match self {
            JsonRpcMessage::Request(request) => {
                object.insert("id".to_string(), id_value(&request.id));
                object.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            JsonRpcMessage::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::String(notification.method.clone()),
                );
                if let Some(params) = &notification.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            JsonRpcMessage::Response(response) => {
                object.insert("id".to_string(), id_value(&response.id));
                object.insert("result".to_string(), response.result.clone());
            }
            JsonRpcMessage::Error(error) => {
                let mut error_object = Map::new();
                error_object.insert("code".to_string(), Value::from(error.error.code));
                error_object.insert(
                    "message".to_string(),
                    Value::String(error.error.message.clone()),
                );
                if let Some(data) = &error.error.data {
                    error_object.insert("data".to_string(), data.clone());
                }
                object.insert("id".to_string(), id_value(&error.id));
                object.insert("error".to_string(), Value::Object(error_object));
            }
        }

        Value::Object(object)
    }

    /// Serialize to a compact JSON byte body
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            JsonRpcMessage::Request(_) => MessageKind::Request,
            JsonRpcMessage::Notification(_) => MessageKind::Notification,
            JsonRpcMessage::Response(_) => MessageKind::ResponseSuccess,
            JsonRpcMessage::Error(_) => MessageKind::ResponseError,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.id),
            JsonRpcMessage::Notification(_) => None,
            JsonRpcMessage::Response(response) => Some(&response.id),
            JsonRpcMessage::Error(error) => Some(&error.id),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.method),
            JsonRpcMessage::Notification(notification) => Some(&notification.method),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_))
    }
}

fn parse_id(raw: Option<Value>) -> Result<Option<RequestId>, ProtocolError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::String(s))),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or_else(|| ProtocolError::invalid(None, format!("id {} is not an integer", n))),
        Some(other) => Err(ProtocolError::invalid(
            None,
            format!("id must be a string or an integer, got {}", other),
        )),
    }
}

fn parse_method(raw: Option<Value>, id: Option<&RequestId>) -> Result<Option<String>, ProtocolError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(method)) => Ok(Some(method)),
        Some(other) => Err(ProtocolError::invalid(
            id.cloned(),
            format!("method must be a string, got {}", other),
        )),
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::parse(value).map_err(serde::de::Error::custom)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        Self::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        Self::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

impl From<JsonRpcError> for JsonRpcMessage {
    fn from(error: JsonRpcError) -> Self {
        Self::Error(error)
    }
}

/// Which side of the boundary a message is travelling towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDirection {
    /// Received from the client
    Incoming,
    /// Sent by this server
    Outgoing,
}

/// Observer for every message crossing a transport boundary.
///
/// Taps must not block and must not fail the transport; implementations
/// handle their own errors.
pub trait MessageTap: Send + Sync {
    fn on_message(&self, message: &JsonRpcMessage, direction: MessageDirection);
}
