//! Response correlation for outbound requests.
//!
//! A [`CorrelationStore`] maps the id of an outstanding request to the
//! channel its response will be delivered on. Two implementations share the
//! same contract:
//!
//! - [`AsyncCorrelationStore`] suspends the waiting task (tokio oneshot)
//! - [`BlockingCorrelationStore`] blocks the waiting OS thread (std channel)
//!
//! Every entry is delivered at most once. Delivering to an unknown or
//! already-removed id is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::message::JsonRpcMessage;
use crate::response::JsonRpcResponse;
use crate::types::RequestId;

pub type SharedCorrelationStore = Arc<dyn CorrelationStore>;

enum ResponseSlot {
    Async(oneshot::Receiver<JsonRpcMessage>),
    Blocking(mpsc::Receiver<JsonRpcMessage>),
}

/// Receiving half of a registered request, consumed by `await_response`
pub struct PendingRequest {
    id: RequestId,
    created_at: Instant,
    slot: ResponseSlot,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Register an outstanding request. Re-registering an id replaces the previous entry.
    fn register_pending(&self, id: RequestId) -> PendingRequest;

    /// Hand a response to the waiter registered under `id`.
    ///
    /// Returns `false` when nothing was waiting (unknown id, late or duplicate delivery).
    fn deliver(&self, id: &RequestId, message: JsonRpcMessage) -> bool;

    /// Wait for the response of `pending`, removing the entry on timeout
    async fn await_response(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, CallError>;

    /// Discard the entry for `id`. Idempotent.
    fn remove(&self, id: &RequestId);

    fn pending_count(&self) -> usize;

    /// Drop every entry; waiters observe [`CallError::Closed`]
    fn clear(&self);
}

fn into_outcome(id: RequestId, message: JsonRpcMessage) -> Result<JsonRpcResponse, CallError> {
    match message {
        JsonRpcMessage::Response(response) => Ok(response),
        JsonRpcMessage::Error(error) => Err(error.into_call_error()),
        other => Err(CallError::Transport(format!(
            "request {} received a non-response message of kind {:?}",
            id,
            other.kind()
        ))),
    }
}

fn timeout_error(id: RequestId, timeout: Duration) -> CallError {
    CallError::Timeout {
        id,
        timeout_ms: timeout.as_millis(),
    }
}

/// Correlation store whose waiters suspend cooperatively
#[derive(Default)]
pub struct AsyncCorrelationStore {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcMessage>>>,
}

impl AsyncCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedCorrelationStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl CorrelationStore for AsyncCorrelationStore {
    fn register_pending(&self, id: RequestId) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(id.clone(), tx).is_some() {
            warn!("Replacing pending request with duplicate id {}", id);
        }
        PendingRequest {
            id,
            created_at: Instant::now(),
            slot: ResponseSlot::Async(rx),
        }
    }

    fn deliver(&self, id: &RequestId, message: JsonRpcMessage) -> bool {
        let sender = self.pending.lock().remove(id);
        match sender {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    async fn await_response(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, CallError> {
        let PendingRequest { id, slot, .. } = pending;
        let ResponseSlot::Async(rx) = slot else {
            return Err(CallError::Transport(
                "pending request was registered with a blocking store".to_string(),
            ));
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => into_outcome(id, message),
            Ok(Err(_)) => Err(CallError::Closed(id)),
            Err(_) => {
                self.remove(&id);
                debug!("Request {} timed out after {:?}", id, timeout);
                Err(timeout_error(id, timeout))
            }
        }
    }

    fn remove(&self, id: &RequestId) {
        self.pending.lock().remove(id);
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// Correlation store whose waiters block their OS thread
#[derive(Default)]
pub struct BlockingCorrelationStore {
    pending: Mutex<HashMap<RequestId, mpsc::SyncSender<JsonRpcMessage>>>,
}

impl BlockingCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedCorrelationStore {
        Arc::new(Self::new())
    }

    /// Block the current thread until the response arrives or `timeout` elapses
    pub fn wait(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, CallError> {
        let PendingRequest { id, slot, .. } = pending;
        let ResponseSlot::Blocking(rx) = slot else {
            return Err(CallError::Transport(
                "pending request was registered with an async store".to_string(),
            ));
        };

        match rx.recv_timeout(timeout) {
            Ok(message) => into_outcome(id, message),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CallError::Closed(id)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.remove(&id);
                debug!("Request {} timed out after {:?}", id, timeout);
                Err(timeout_error(id, timeout))
            }
        }
    }
}

#[async_trait]
impl CorrelationStore for BlockingCorrelationStore {
    fn register_pending(&self, id: RequestId) -> PendingRequest {
        let (tx, rx) = mpsc::sync_channel(1);
        if self.pending.lock().insert(id.clone(), tx).is_some() {
            warn!("Replacing pending request with duplicate id {}", id);
        }
        PendingRequest {
            id,
            created_at: Instant::now(),
            slot: ResponseSlot::Blocking(rx),
        }
    }

    fn deliver(&self, id: &RequestId, message: JsonRpcMessage) -> bool {
        let sender = self.pending.lock().remove(id);
        match sender {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    async fn await_response(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, CallError> {
        self.wait(pending, timeout)
    }

    fn remove(&self, id: &RequestId) {
        self.pending.lock().remove(id);
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn clear(&self) {
        self.pending.lock().clear();
    }
}
