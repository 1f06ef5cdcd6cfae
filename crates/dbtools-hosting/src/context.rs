//! Contexts handed to handlers and the transport seam they write through.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use dbtools_json_rpc::{
    CallError, JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    SharedCorrelationStore,
};

/// Outbound side of a transport, as seen by the dispatcher.
///
/// `send` must not block on the peer: transports queue or push the message
/// and return.
pub trait TransportContext: Send + Sync {
    /// Queue a message for delivery to the peer this context addresses
    fn send(&self, message: JsonRpcMessage);

    /// Stop the transport this context belongs to
    fn stop(&self);
}

pub type SharedTransport = Arc<dyn TransportContext>;

/// Handle for server-initiated traffic towards one peer
#[derive(Clone)]
pub struct RpcPeer {
    transport: SharedTransport,
    correlation: SharedCorrelationStore,
    request_timeout: Duration,
}

impl RpcPeer {
    pub fn new(
        transport: SharedTransport,
        correlation: SharedCorrelationStore,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            correlation,
            request_timeout,
        }
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn correlation(&self) -> &SharedCorrelationStore {
        &self.correlation
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn send_message(&self, message: JsonRpcMessage) {
        self.transport.send(message);
    }

    pub fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<(), serde_json::Error> {
        let params = serde_json::to_value(params)?;
        self.send_message(JsonRpcNotification::new(method, Some(params)).into());
        Ok(())
    }

    /// Send a request and wait for its response with the configured timeout
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, CallError> {
        self.send_request_with_timeout(method, params, self.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, CallError> {
        let id = RequestId::generate();
        let pending = self.correlation.register_pending(id.clone());
        debug!(request_id = %id, method = method, "Sending server request");

        self.send_message(JsonRpcRequest::new(id, method, params).into());
        self.correlation.await_response(pending, timeout).await
    }
}

/// Context passed to request handlers; addresses the requesting peer
#[derive(Clone)]
pub struct RequestContext {
    peer: RpcPeer,
    request_id: RequestId,
    method: String,
}

impl RequestContext {
    pub fn new(peer: RpcPeer, request_id: RequestId, method: impl Into<String>) -> Self {
        Self {
            peer,
            request_id,
            method: method.into(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn peer(&self) -> &RpcPeer {
        &self.peer
    }

    /// Answer the request with a success response
    pub fn send_response<T: Serialize>(&self, result: T) -> Result<(), serde_json::Error> {
        let result = serde_json::to_value(result)?;
        self.peer
            .send_message(JsonRpcResponse::success(self.request_id.clone(), result).into());
        Ok(())
    }

    /// Answer the request with an error response
    pub fn send_error(&self, code: i64, message: impl Into<String>, data: Option<Value>) {
        let error = JsonRpcErrorObject::with_code(code, message, data);
        self.send_error_object(error);
    }

    pub fn send_error_object(&self, error: JsonRpcErrorObject) {
        self.peer
            .send_message(JsonRpcError::new(self.request_id.clone(), error).into());
    }

    /// Answer the request with an internal error describing `error`
    pub fn send_unhandled_error(&self, error: &dyn Display) {
        self.send_error_object(JsonRpcErrorObject::new(
            JsonRpcErrorCode::InternalError,
            Some(format!("Unhandled exception: {}", error)),
            None,
        ));
    }

    pub fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<(), serde_json::Error> {
        self.peer.send_notification(method, params)
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, CallError> {
        self.peer.send_request(method, params).await
    }

    /// Stop the transport that delivered this request
    pub fn stop_transport(&self) {
        self.peer.transport().stop();
    }
}

/// Context passed to notification handlers
#[derive(Clone)]
pub struct NotificationContext {
    peer: RpcPeer,
    method: String,
}

impl NotificationContext {
    pub fn new(peer: RpcPeer, method: impl Into<String>) -> Self {
        Self {
            peer,
            method: method.into(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn peer(&self) -> &RpcPeer {
        &self.peer
    }

    pub fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<(), serde_json::Error> {
        self.peer.send_notification(method, params)
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, CallError> {
        self.peer.send_request(method, params).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport that keeps every sent message in memory
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<JsonRpcMessage>>,
        pub stopped: AtomicBool,
    }

    impl RecordingTransport {
        pub fn take(&self) -> Vec<JsonRpcMessage> {
            std::mem::take(&mut *self.sent.lock())
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    impl TransportContext for RecordingTransport {
        fn send(&self, message: JsonRpcMessage) {
            self.sent.lock().push(message);
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;
    use dbtools_json_rpc::AsyncCorrelationStore;
    use serde_json::json;

    fn peer(transport: &Arc<RecordingTransport>) -> RpcPeer {
        RpcPeer::new(
            transport.clone(),
            AsyncCorrelationStore::shared(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_request_context_responses() {
        let transport = Arc::new(RecordingTransport::default());
        let ctx = RequestContext::new(peer(&transport), RequestId::Number(4), "m");

        ctx.send_response(json!({"ok": true})).unwrap();
        ctx.send_error(-32001, "bad", Some(json!("detail")));
        ctx.send_unhandled_error(&"oops");

        let sent = transport.take();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0],
            JsonRpcMessage::Response(JsonRpcResponse::success(
                RequestId::Number(4),
                json!({"ok": true})
            ))
        );
        match &sent[1] {
            JsonRpcMessage::Error(e) => {
                assert_eq!(e.error.code, -32001);
                assert_eq!(e.error.data, Some(json!("detail")));
            }
            other => panic!("unexpected message {:?}", other),
        }
        match &sent[2] {
            JsonRpcMessage::Error(e) => {
                assert_eq!(e.error.code, -32603);
                assert_eq!(e.error.message, "Unhandled exception: oops");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_request_round_trip() {
        let transport = Arc::new(RecordingTransport::default());
        let peer = peer(&transport);
        let correlation = peer.correlation().clone();

        let caller = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.send_request("client/ask", Some(json!([1]))).await })
        };

        // wait for the request to be queued, then answer it
        let id = loop {
            if let Some(JsonRpcMessage::Request(request)) = transport.sent.lock().first().cloned() {
                break request.id;
            }
            tokio::task::yield_now().await;
        };
        correlation.deliver(
            &id,
            JsonRpcResponse::success(id.clone(), json!("answer")).into(),
        );

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.result, json!("answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_times_out() {
        let transport = Arc::new(RecordingTransport::default());
        let peer = peer(&transport);

        let err = peer
            .send_request_with_timeout("client/ask", None, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(peer.correlation().pending_count(), 0);
    }
}
