//! # Database Tools HTTP Hosting
//!
//! Multi-session socket transport. Clients authenticate over HTTP, open a
//! WebSocket push channel bound to their session, and submit JSON-RPC
//! messages either over HTTP or over the push channel. Every message the
//! service produces for a session travels back over that session's channel.
//!
//! ```rust,no_run
//! use dbtools_hosting::DispatcherBuilder;
//! use dbtools_http_hosting::{WebServer, WebServerConfig};
//!
//! # async fn run() -> dbtools_http_hosting::Result<()> {
//! let dispatcher = DispatcherBuilder::new().build();
//! let server = WebServer::builder(dispatcher)
//!     .config(WebServerConfig::from_env()?)
//!     .build();
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod cors;
pub mod push;
pub mod server;
pub mod session;
mod websocket;

pub use config::WebServerConfig;
pub use cors::CorsPolicy;
pub use push::{EventKind, PushEvent};
pub use server::{WebServer, WebServerBuilder};
pub use session::{DEFAULT_SESSION_IDLE_TIMEOUT, SessionRegistry};

/// Result type for HTTP hosting operations
pub type Result<T> = std::result::Result<T, HttpHostingError>;

/// HTTP hosting specific errors
#[derive(Debug, thiserror::Error)]
pub enum HttpHostingError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
