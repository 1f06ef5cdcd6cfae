//! # JSON-RPC Core Prelude
//!
//! Convenient re-exports of the most commonly used message, correlation and
//! bridging types.
//!
//! ```rust
//! use dbtools_json_rpc::prelude::*;
//! ```

// Core JSON-RPC types
pub use crate::error::{CallError, JsonRpcErrorCode, JsonRpcErrorObject, ProtocolError};
pub use crate::message::{JsonRpcMessage, MessageDirection, MessageKind, MessageTap};
pub use crate::notification::JsonRpcNotification;
pub use crate::request::JsonRpcRequest;
pub use crate::response::{JsonRpcError, JsonRpcResponse};
pub use crate::types::{JsonRpcVersion, RequestId};

// Correlation and bridging
pub use crate::bridge::{AsyncBridge, BridgeError};
pub use crate::correlation::{
    AsyncCorrelationStore, BlockingCorrelationStore, CorrelationStore, PendingRequest,
    SharedCorrelationStore,
};

// Standard error codes
pub use crate::error_codes::*;
