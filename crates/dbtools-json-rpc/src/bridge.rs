//! Bridge between blocking call sites and async work.
//!
//! [`AsyncBridge`] either owns a dedicated single-worker tokio runtime or
//! borrows a runtime that already exists. Blocking callers drive futures to
//! completion with [`AsyncBridge::run`]; fire-and-forget work goes through
//! [`AsyncBridge::run_detached`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::debug;

const BRIDGE_THREAD_NAME: &str = "dbtools-async-bridge";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to start async bridge runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Cannot block on the async bridge from inside a current-thread runtime")]
    WouldDeadlock,

    #[error("Async bridge has been shut down")]
    ShutDown,

    #[error("Bridged task failed: {0}")]
    TaskFailed(String),
}

pub struct AsyncBridge {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    owns_runtime: bool,
    shut_down: AtomicBool,
}

impl AsyncBridge {
    /// Reuse the runtime of the calling context if there is one, otherwise
    /// start a dedicated runtime thread.
    pub fn new() -> Result<Self, BridgeError> {
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Async bridge reusing the current runtime");
                Ok(Self::with_handle(handle))
            }
            Err(_) => Self::dedicated(),
        }
    }

    /// Always start a dedicated runtime thread owned by this bridge
    pub fn dedicated() -> Result<Self, BridgeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(BRIDGE_THREAD_NAME)
            .enable_all()
            .build()?;
        debug!("Async bridge started dedicated runtime");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            owns_runtime: true,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Run on an externally supplied runtime. `shutdown` leaves it untouched.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: Mutex::new(None),
            owns_runtime: false,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn owns_runtime(&self) -> bool {
        self.owns_runtime
    }

    /// Block the caller until `future` completes on the bridge runtime
    pub fn run<F>(&self, future: F) -> Result<F::Output, BridgeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BridgeError::ShutDown);
        }

        // Blocking a current-thread runtime would stop it from ever polling the task
        let inside_runtime = match Handle::try_current() {
            Ok(current) => match current.runtime_flavor() {
                RuntimeFlavor::CurrentThread => return Err(BridgeError::WouldDeadlock),
                _ => true,
            },
            Err(_) => false,
        };

        let join = self.handle.spawn(future);
        let outcome = if inside_runtime {
            tokio::task::block_in_place(|| self.handle.block_on(join))
        } else {
            self.handle.block_on(join)
        };

        outcome.map_err(|e| BridgeError::TaskFailed(e.to_string()))
    }

    /// Spawn `future` on the bridge runtime without waiting for it
    pub fn run_detached<F>(&self, future: F) -> Result<JoinHandle<F::Output>, BridgeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BridgeError::ShutDown);
        }
        Ok(self.handle.spawn(future))
    }

    /// Stop the runtime thread if this bridge started it. No-op otherwise.
    pub fn shutdown(&self) {
        if !self.owns_runtime {
            return;
        }
        self.shut_down.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.lock().take() {
            debug!("Async bridge shutting down dedicated runtime");
            runtime.shutdown_background();
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AsyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBridge")
            .field("owns_runtime", &self.owns_runtime)
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish()
    }
}
