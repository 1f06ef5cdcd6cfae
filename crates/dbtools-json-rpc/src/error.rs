use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::types::RequestId;

/// JSON-RPC and LSP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerNotInitialized,
    UnknownErrorCode,
    RequestFailed,
    ServerCancelled,
    ContentModified,
    RequestCancelled,
    ServerError(i64), // -32099 to -32000
}

impl JsonRpcErrorCode {
    pub fn code(&self) -> i64 {
        use crate::error_codes::*;
        match self {
            JsonRpcErrorCode::ParseError => PARSE_ERROR,
            JsonRpcErrorCode::InvalidRequest => INVALID_REQUEST,
            JsonRpcErrorCode::MethodNotFound => METHOD_NOT_FOUND,
            JsonRpcErrorCode::InvalidParams => INVALID_PARAMS,
            JsonRpcErrorCode::InternalError => INTERNAL_ERROR,
            JsonRpcErrorCode::ServerNotInitialized => SERVER_NOT_INITIALIZED,
            JsonRpcErrorCode::UnknownErrorCode => UNKNOWN_ERROR_CODE,
            JsonRpcErrorCode::RequestFailed => REQUEST_FAILED,
            JsonRpcErrorCode::ServerCancelled => SERVER_CANCELLED,
            JsonRpcErrorCode::ContentModified => CONTENT_MODIFIED,
            JsonRpcErrorCode::RequestCancelled => REQUEST_CANCELLED,
            JsonRpcErrorCode::ServerError(code) => *code,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            JsonRpcErrorCode::ParseError => "Parse error",
            JsonRpcErrorCode::InvalidRequest => "Invalid Request",
            JsonRpcErrorCode::MethodNotFound => "Method not found",
            JsonRpcErrorCode::InvalidParams => "Invalid params",
            JsonRpcErrorCode::InternalError => "Internal error",
            JsonRpcErrorCode::ServerNotInitialized => "Server not initialized",
            JsonRpcErrorCode::UnknownErrorCode => "Unknown error",
            JsonRpcErrorCode::RequestFailed => "Request failed",
            JsonRpcErrorCode::ServerCancelled => "Server cancelled",
            JsonRpcErrorCode::ContentModified => "Content modified",
            JsonRpcErrorCode::RequestCancelled => "Request cancelled",
            JsonRpcErrorCode::ServerError(_) => "Server error",
        }
    }
}

impl fmt::Display for JsonRpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// The `error` member of an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new(code: JsonRpcErrorCode, message: Option<String>, data: Option<Value>) -> Self {
        Self {
            code: code.code(),
            message: message.unwrap_or_else(|| code.message().to_string()),
            data,
        }
    }

    /// Build an error object from a raw numeric code
    pub fn with_code(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(data: Option<Value>) -> Self {
        Self::new(JsonRpcErrorCode::ParseError, None, data)
    }

    pub fn invalid_request(data: Option<Value>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidRequest, None, data)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound,
            Some(format!("Requested method is unsupported: {}", method)),
            None,
        )
    }

    pub fn invalid_params(message: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidParams,
            Some(message.to_string()),
            None,
        )
    }

    pub fn internal_error(message: Option<String>) -> Self {
        Self::new(JsonRpcErrorCode::InternalError, message, None)
    }
}

impl fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A body that does not form a valid JSON-RPC message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Unsupported jsonrpc version: {0}")]
    InvalidVersion(String),

    #[error("Invalid message: {reason}")]
    InvalidMessage {
        id: Option<RequestId>,
        reason: String,
    },
}

impl ProtocolError {
    pub fn invalid(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidMessage {
            id,
            reason: reason.into(),
        }
    }

    /// Request id recovered from the body before classification failed, if any
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ProtocolError::InvalidMessage { id, .. } => id.as_ref(),
            _ => None,
        }
    }
}

/// Outcome of a failed outbound request
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("Request {id} timed out after {timeout_ms}ms")]
    Timeout { id: RequestId, timeout_ms: u128 },

    #[error("Request {id} failed with error {code}: {message}")]
    Response {
        id: RequestId,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Response channel for request {0} was closed")]
    Closed(RequestId),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    /// The error object carried by a protocol-level error response
    pub fn error_object(&self) -> Option<JsonRpcErrorObject> {
        match self {
            CallError::Response {
                code,
                message,
                data,
                ..
            } => Some(JsonRpcErrorObject::with_code(*code, message.clone(), data.clone())),
            _ => None,
        }
    }
}
