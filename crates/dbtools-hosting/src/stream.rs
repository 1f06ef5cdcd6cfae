//! Content-Length stream transport.
//!
//! One input thread reads frames and dispatches them; one output thread
//! drains the outgoing queue and writes frames. Both block their own OS
//! thread and never suspend cooperatively.

use std::io::{BufReader, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use dbtools_json_rpc::{
    CallError, JsonRpcError, JsonRpcMessage, JsonRpcResponse, MessageDirection, MessageTap,
};

use crate::config::StreamServerConfig;
use crate::context::{RpcPeer, SharedTransport, TransportContext};
use crate::dispatcher::Dispatcher;
use crate::error::{FrameError, HostingError, Result};
use crate::framing::{FrameReader, FrameWriter};

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

/// `None` is the stop sentinel for the output thread
type OutgoingItem = Option<JsonRpcMessage>;

/// Outbound half shared by the input thread, handlers and the server handle
struct StreamTransport {
    outgoing: mpsc::UnboundedSender<OutgoingItem>,
    stop_requested: AtomicBool,
    tap: Option<Arc<dyn MessageTap>>,
}

impl StreamTransport {
    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn observe(&self, message: &JsonRpcMessage, direction: MessageDirection) {
        if let Some(tap) = &self.tap {
            tap.on_message(message, direction);
        }
    }
}

impl TransportContext for StreamTransport {
    fn send(&self, message: JsonRpcMessage) {
        self.observe(&message, MessageDirection::Outgoing);
        if self.outgoing.send(Some(message)).is_err() {
            debug!("Output queue closed, dropping outgoing message");
        }
    }

    fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            info!("Stopping JSON-RPC stream server");
        }
        // unblock the output thread
        let _ = self.outgoing.send(None);
    }
}

struct Threads {
    input: JoinHandle<BoxedReader>,
    output: JoinHandle<BoxedWriter>,
}

/// JSON-RPC server over a pair of byte streams (typically stdin/stdout)
pub struct StreamServer {
    dispatcher: Arc<Dispatcher>,
    config: StreamServerConfig,
    transport: Arc<StreamTransport>,
    pending_io: Mutex<Option<(BoxedReader, BoxedWriter, mpsc::UnboundedReceiver<OutgoingItem>)>>,
    threads: Mutex<Option<Threads>>,
}

impl StreamServer {
    pub fn new<R, W>(dispatcher: Arc<Dispatcher>, reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        StreamServerBuilder::new(dispatcher).build(reader, writer)
    }

    pub fn builder(dispatcher: Arc<Dispatcher>) -> StreamServerBuilder {
        StreamServerBuilder::new(dispatcher)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handle for server-initiated requests and notifications
    pub fn peer(&self) -> RpcPeer {
        self.dispatcher.peer(self.shared_transport())
    }

    pub fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> std::result::Result<(), serde_json::Error> {
        self.peer().send_notification(method, params)
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<JsonRpcResponse, CallError> {
        self.peer().send_request(method, params).await
    }

    pub fn is_stop_requested(&self) -> bool {
        self.transport.is_stop_requested()
    }

    /// Start the input and output threads
    pub fn start(&self) -> Result<()> {
        let (reader, writer, outgoing) = self
            .pending_io
            .lock()
            .take()
            .ok_or(HostingError::AlreadyStarted)?;
        info!("Starting JSON-RPC stream server");

        let output_name = self.config.output_thread_name();
        let output = std::thread::Builder::new()
            .name(output_name.clone())
            .spawn(move || consume_output(writer, outgoing))
            .map_err(|source| HostingError::ThreadSpawn {
                name: output_name,
                source,
            })?;

        let input_name = self.config.input_thread_name();
        let dispatcher = Arc::clone(&self.dispatcher);
        let transport = Arc::clone(&self.transport);
        let max_message_size = self.config.max_message_size;
        let input = match std::thread::Builder::new()
            .name(input_name.clone())
            .spawn(move || consume_input(reader, max_message_size, dispatcher, transport))
        {
            Ok(handle) => handle,
            Err(source) => {
                self.transport.stop();
                let _ = output.join();
                return Err(HostingError::ThreadSpawn {
                    name: input_name,
                    source,
                });
            }
        };

        *self.threads.lock() = Some(Threads { input, output });
        info!("JSON-RPC stream server started with input and output stream processing");
        Ok(())
    }

    /// Ask both threads to halt. Messages queued before this call are still written.
    pub fn stop(&self) {
        self.transport.stop();
    }

    /// Block until both threads return, then close the reader and writer
    pub fn wait_for_exit(&self) -> Result<()> {
        let threads = self.threads.lock().take().ok_or(HostingError::NotStarted)?;

        let reader = threads
            .input
            .join()
            .map_err(|_| HostingError::ThreadPanicked(self.config.input_thread_name()))?;
        let writer = threads
            .output
            .join()
            .map_err(|_| HostingError::ThreadPanicked(self.config.output_thread_name()))?;
        info!("Input and output threads have completed");

        // closed only now so the last in-flight message is read or written
        drop(reader);
        drop(writer);
        Ok(())
    }

    fn shared_transport(&self) -> SharedTransport {
        self.transport.clone()
    }
}

pub struct StreamServerBuilder {
    dispatcher: Arc<Dispatcher>,
    config: StreamServerConfig,
    tap: Option<Arc<dyn MessageTap>>,
}

impl StreamServerBuilder {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            config: StreamServerConfig::default(),
            tap: None,
        }
    }

    pub fn config(mut self, config: StreamServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe every message read from or written to the stream
    pub fn tap(mut self, tap: Arc<dyn MessageTap>) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Build the server after checking the configuration
    pub fn try_build<R, W>(self, reader: R, writer: W) -> Result<StreamServer>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        self.config.validate()?;
        Ok(self.build(reader, writer))
    }

    pub fn build<R, W>(self, reader: R, writer: W) -> StreamServer
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(StreamTransport {
            outgoing: tx,
            stop_requested: AtomicBool::new(false),
            tap: self.tap,
        });

        StreamServer {
            dispatcher: self.dispatcher,
            config: self.config,
            transport,
            pending_io: Mutex::new(Some((Box::new(reader), Box::new(writer), rx))),
            threads: Mutex::new(None),
        }
    }
}

fn consume_input(
    reader: BoxedReader,
    max_message_size: usize,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<StreamTransport>,
) -> BoxedReader {
    info!("JSON-RPC input thread started");
    let shared: SharedTransport = transport.clone();
    let mut frames = FrameReader::new(BufReader::new(reader)).max_message_size(max_message_size);

    while !transport.is_stop_requested() {
        let body = match frames.read_frame() {
            Ok(body) => body,
            Err(FrameError::EndOfStream) => {
                info!("JSON-RPC input reached end of stream");
                transport.stop();
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Discarding malformed frame: {}", e);
                continue;
            }
            Err(e) => {
                error!("JSON-RPC input thread failed: {}", e);
                transport.stop();
                break;
            }
        };

        match JsonRpcMessage::from_slice(&body) {
            Ok(message) => {
                transport.observe(&message, MessageDirection::Incoming);
                dispatcher.dispatch(message, &shared);
            }
            Err(e) => match e.request_id() {
                Some(id) => {
                    warn!(request_id = %id, "Invalid JSON-RPC message: {}", e);
                    shared.send(JsonRpcError::parse_error(id.clone(), e.to_string()).into());
                }
                None => warn!("Dropping unparseable JSON-RPC message: {}", e),
            },
        }
    }

    debug!("JSON-RPC input thread exiting");
    frames.into_inner().into_inner()
}

fn consume_output(
    writer: BoxedWriter,
    mut outgoing: mpsc::UnboundedReceiver<OutgoingItem>,
) -> BoxedWriter {
    info!("JSON-RPC output thread started");
    let mut frames = FrameWriter::new(writer);

    while let Some(Some(message)) = outgoing.blocking_recv() {
        if let Err(e) = frames.write_frame(&message.to_bytes()) {
            error!("Failed to write JSON-RPC message: {}", e);
        }
    }

    debug!("JSON-RPC output thread exiting");
    frames.into_inner()
}
