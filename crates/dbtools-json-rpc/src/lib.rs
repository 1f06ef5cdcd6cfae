//! # JSON-RPC 2.0 Core
//!
//! Transport-agnostic building blocks shared by every transport of the
//! database tools service:
//!
//! - the wire-level message model ([`JsonRpcMessage`]) with strict
//!   classification of requests, notifications and responses
//! - the response correlation stores used by outbound requests
//! - the async bridge that lets blocking call sites drive async work
//! - the [`MessageTap`] hook used to observe traffic (session recording)
//!
//! Payloads (`params`, `result`, `error.data`) are treated as opaque JSON values.

pub mod bridge;
pub mod correlation;
pub mod error;
pub mod message;
pub mod notification;
pub mod prelude;
pub mod request;
pub mod response;
pub mod types;

// Re-export main types
pub use bridge::{AsyncBridge, BridgeError};
pub use correlation::{
    AsyncCorrelationStore, BlockingCorrelationStore, CorrelationStore, PendingRequest,
    SharedCorrelationStore,
};
pub use error::{CallError, JsonRpcErrorCode, JsonRpcErrorObject, ProtocolError};
pub use message::{JsonRpcMessage, MessageDirection, MessageKind, MessageTap};
pub use notification::JsonRpcNotification;
pub use request::JsonRpcRequest;
pub use response::{JsonRpcError, JsonRpcResponse};
pub use types::{JsonRpcVersion, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 and LSP error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const UNKNOWN_ERROR_CODE: i64 = -32001;

    // LSP reserved range: -32899 to -32800
    pub const REQUEST_FAILED: i64 = -32803;
    pub const SERVER_CANCELLED: i64 = -32802;
    pub const CONTENT_MODIFIED: i64 = -32801;
    pub const REQUEST_CANCELLED: i64 = -32800;
}
