//! Message dispatcher shared by every transport.
//!
//! Handlers are registered on a [`DispatcherBuilder`]; [`DispatcherBuilder::build`]
//! freezes the registry into an immutable [`Dispatcher`] that transports
//! share behind an `Arc`. Registering the same method twice keeps the last
//! handler and logs a warning.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use dbtools_json_rpc::{
    AsyncCorrelationStore, JsonRpcErrorCode, JsonRpcErrorObject, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, SharedCorrelationStore,
};

use crate::config::{DEFAULT_PROTOCOL_VERSION, DEFAULT_REQUEST_TIMEOUT};
use crate::context::{NotificationContext, RequestContext, RpcPeer, SharedTransport};

/// Built-in method names
pub mod methods {
    pub const ECHO: &str = "echo";
    pub const VERSION: &str = "version";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
}

/// Why a handler invocation failed
enum HandlerFailure {
    InvalidParams(serde_json::Error),
    Failed(anyhow::Error),
}

type RequestCallback =
    Arc<dyn Fn(&RequestContext, Option<Value>) -> Result<(), HandlerFailure> + Send + Sync>;
type NotificationCallback =
    Arc<dyn Fn(&NotificationContext, Option<Value>) -> Result<(), HandlerFailure> + Send + Sync>;
type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

enum RequestRoute {
    Handler(RequestCallback),
    Version,
    Shutdown,
}

enum NotificationRoute {
    Handler(NotificationCallback),
    Shutdown,
}

fn decode<P: DeserializeOwned>(params: Option<Value>) -> Result<P, HandlerFailure> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(HandlerFailure::InvalidParams)
}

pub struct DispatcherBuilder {
    protocol_version: String,
    request_timeout: Duration,
    correlation: SharedCorrelationStore,
    request_routes: HashMap<String, RequestRoute>,
    notification_routes: HashMap<String, NotificationRoute>,
    shutdown_callbacks: Vec<ShutdownCallback>,
}

impl DispatcherBuilder {
    /// Create a builder with the built-in handlers already registered
    pub fn new() -> Self {
        let mut builder = Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            correlation: AsyncCorrelationStore::shared(),
            request_routes: HashMap::new(),
            notification_routes: HashMap::new(),
            shutdown_callbacks: Vec::new(),
        };

        builder.insert_request(
            methods::ECHO,
            RequestRoute::Handler(Arc::new(|ctx: &RequestContext, params: Option<Value>| {
                ctx.send_response(params.unwrap_or(Value::Null))
                    .map_err(|e| HandlerFailure::Failed(e.into()))
            })),
        );
        builder.insert_request(methods::VERSION, RequestRoute::Version);
        builder.insert_request(methods::SHUTDOWN, RequestRoute::Shutdown);
        builder.insert_request(methods::EXIT, RequestRoute::Shutdown);
        builder.insert_notification(methods::EXIT, NotificationRoute::Shutdown);
        builder
    }

    /// Protocol version answered by the `version` request
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Timeout for requests handlers send to the peer
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Correlation store that receives responses to server-initiated requests
    pub fn correlation_store(mut self, store: SharedCorrelationStore) -> Self {
        self.correlation = store;
        self
    }

    /// Register a request handler whose params decode into `P`
    pub fn request_handler<P, F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&RequestContext, P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_request(
            method,
            RequestRoute::Handler(Arc::new(move |ctx: &RequestContext, params: Option<Value>| {
                let params = decode::<P>(params)?;
                handler(ctx, params).map_err(HandlerFailure::Failed)
            })),
        );
        self
    }

    /// Register a request handler that receives params untouched
    pub fn raw_request_handler<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RequestContext, Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_request(
            method,
            RequestRoute::Handler(Arc::new(move |ctx: &RequestContext, params: Option<Value>| {
                handler(ctx, params).map_err(HandlerFailure::Failed)
            })),
        );
        self
    }

    /// Register a notification handler whose params decode into `P`
    pub fn notification_handler<P, F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&NotificationContext, P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_notification(
            method,
            NotificationRoute::Handler(Arc::new(
                move |ctx: &NotificationContext, params: Option<Value>| {
                    let params = decode::<P>(params)?;
                    handler(ctx, params).map_err(HandlerFailure::Failed)
                },
            )),
        );
        self
    }

    pub fn raw_notification_handler<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&NotificationContext, Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_notification(
            method,
            NotificationRoute::Handler(Arc::new(
                move |ctx: &NotificationContext, params: Option<Value>| {
                    handler(ctx, params).map_err(HandlerFailure::Failed)
                },
            )),
        );
        self
    }

    /// Run `callback` when a `shutdown` or `exit` request arrives
    pub fn on_shutdown<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shutdown_callbacks.push(Arc::new(callback));
        self
    }

    pub fn shutdown_callback_count(&self) -> usize {
        self.shutdown_callbacks.len()
    }

    pub fn build(self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            protocol_version: self.protocol_version,
            request_timeout: self.request_timeout,
            correlation: self.correlation,
            request_routes: self.request_routes,
            notification_routes: self.notification_routes,
            shutdown_callbacks: self.shutdown_callbacks,
        })
    }

    fn insert_request(&mut self, method: impl Into<String>, route: RequestRoute) {
        let method = method.into();
        if self.request_routes.insert(method.clone(), route).is_some() {
            warn!("Replacing request handler for method '{}'", method);
        }
    }

    fn insert_notification(&mut self, method: impl Into<String>, route: NotificationRoute) {
        let method = method.into();
        if self.notification_routes.insert(method.clone(), route).is_some() {
            warn!("Replacing notification handler for method '{}'", method);
        }
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable routing table shared by transports
pub struct Dispatcher {
    protocol_version: String,
    request_timeout: Duration,
    correlation: SharedCorrelationStore,
    request_routes: HashMap<String, RequestRoute>,
    notification_routes: HashMap<String, NotificationRoute>,
    shutdown_callbacks: Vec<ShutdownCallback>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn correlation_store(&self) -> &SharedCorrelationStore {
        &self.correlation
    }

    pub fn shutdown_callback_count(&self) -> usize {
        self.shutdown_callbacks.len()
    }

    /// Methods answered as requests, built-ins included
    pub fn registered_request_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.request_routes.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn registered_notification_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.notification_routes.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Handle for server-initiated traffic over `transport`
    pub fn peer(&self, transport: SharedTransport) -> RpcPeer {
        RpcPeer::new(transport, self.correlation.clone(), self.request_timeout)
    }

    /// Route one incoming message. Never fails and never panics on handler errors.
    pub fn dispatch(&self, message: JsonRpcMessage, transport: &SharedTransport) {
        match message {
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                if !self.correlation.deliver(&id, response.into()) {
                    debug!(request_id = %id, "Dropping response with no pending request");
                }
            }
            JsonRpcMessage::Error(error) => {
                let id = error.id.clone();
                if !self.correlation.deliver(&id, error.into()) {
                    debug!(request_id = %id, "Dropping error response with no pending request");
                }
            }
            JsonRpcMessage::Request(request) => self.dispatch_request(request, transport),
            JsonRpcMessage::Notification(notification) => {
                self.dispatch_notification(notification, transport)
            }
        }
    }

    fn dispatch_request(&self, request: JsonRpcRequest, transport: &SharedTransport) {
        info!(request_id = %request.id, method = %request.method, "Received request");
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let ctx = RequestContext::new(self.peer(transport.clone()), id, method.clone());

        let handler = match self.request_routes.get(&method) {
            Some(RequestRoute::Handler(handler)) => handler,
            Some(RequestRoute::Version) => {
                if let Err(e) = ctx.send_response(&self.protocol_version) {
                    error!("Failed to send version response: {}", e);
                }
                return;
            }
            Some(RequestRoute::Shutdown) => return self.shutdown(transport),
            None => {
                warn!("Unsupported method: {}", method);
                ctx.send_error_object(JsonRpcErrorObject::method_not_found(&method));
                return;
            }
        };

        match catch_unwind(AssertUnwindSafe(|| handler(&ctx, params))) {
            Ok(Ok(())) => {}
            Ok(Err(HandlerFailure::InvalidParams(e))) => {
                warn!("Invalid params for method {}: {}", method, e);
                ctx.send_error_object(JsonRpcErrorObject::invalid_params(&format!(
                    "Invalid params for method {}: {}",
                    method, e
                )));
            }
            Ok(Err(HandlerFailure::Failed(e))) => {
                let message = format!("Unhandled exception for method {}: {}", method, e);
                error!("{}", message);
                ctx.send_error_object(JsonRpcErrorObject::new(
                    JsonRpcErrorCode::InternalError,
                    Some(message),
                    None,
                ));
            }
            Err(panic) => {
                let message = format!(
                    "Unhandled exception for method {}: {}",
                    method,
                    panic_message(panic.as_ref())
                );
                error!("{}", message);
                ctx.send_error_object(JsonRpcErrorObject::new(
                    JsonRpcErrorCode::InternalError,
                    Some(message),
                    None,
                ));
            }
        }
    }

    fn dispatch_notification(&self, notification: JsonRpcNotification, transport: &SharedTransport) {
        info!(method = %notification.method, "Received notification");
        let JsonRpcNotification { method, params, .. } = notification;

        let handler = match self.notification_routes.get(&method) {
            Some(NotificationRoute::Handler(handler)) => handler,
            Some(NotificationRoute::Shutdown) => return self.shutdown(transport),
            None => {
                warn!("Notification method {} is unsupported", method);
                return;
            }
        };

        let ctx = NotificationContext::new(self.peer(transport.clone()), method.clone());
        match catch_unwind(AssertUnwindSafe(|| handler(&ctx, params))) {
            Ok(Ok(())) => {}
            Ok(Err(HandlerFailure::InvalidParams(e))) => {
                warn!("Invalid params for notification {}: {}", method, e);
            }
            Ok(Err(HandlerFailure::Failed(e))) => {
                error!("Unhandled exception for notification {}: {}", method, e);
            }
            Err(panic) => {
                error!(
                    "Unhandled exception for notification {}: {}",
                    method,
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Run shutdown callbacks, then stop the transport. No response is sent.
    fn shutdown(&self, transport: &SharedTransport) {
        info!("Received shutdown request");
        for callback in &self.shutdown_callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback())) {
                error!("Shutdown callback panicked: {}", panic_message(panic.as_ref()));
            }
        }
        transport.stop();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
