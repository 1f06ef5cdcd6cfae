//! # Database Tools Service
//!
//! Hosts the JSON-RPC dispatch core over stdin/stdout (the default) or over
//! HTTP + WebSocket, optionally recording the session for later playback.
//!
//! ## Usage:
//! ```bash
//! # Editor integration over stdio
//! dbtools-service --log-level debug
//!
//! # Browser clients
//! dbtools-service --enable-web-server --listen-port 8443 --enable-dynamic-cors
//!
//! # Record a session
//! dbtools-service --record-session ./sessions/run.json --record-interval 30
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use dbtools_hosting::{DEFAULT_PROTOCOL_VERSION, Dispatcher, DispatcherBuilder, StreamServer};
use dbtools_http_hosting::{WebServer, WebServerConfig};
use dbtools_json_rpc::MessageTap;
use dbtools_recorder::MessageRecorder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serve HTTP + WebSocket instead of stdin/stdout
    #[arg(long, env = "ENABLE_WEB_SERVER")]
    enable_web_server: bool,

    /// Address for the web server (overrides LISTEN_ADDRESS)
    #[arg(long)]
    listen_address: Option<String>,

    /// Port for the web server (overrides LISTEN_PORT)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Stop sending WebSocket keep-alive pings
    #[arg(long)]
    disable_keep_alive: bool,

    /// Accept every CORS origin
    #[arg(long)]
    enable_dynamic_cors: bool,

    /// Record the session to this file
    #[arg(long, value_name = "PATH")]
    record_session: Option<String>,

    /// Also save the recorded session every SECS seconds
    #[arg(long, value_name = "SECS", requires = "record_session")]
    record_interval: Option<u64>,

    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Protocol version reported by the `version` request
    #[arg(long, default_value = DEFAULT_PROTOCOL_VERSION)]
    protocol_version: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the stream transport, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let recorder = match &args.record_session {
        Some(path) => Some(Arc::new(build_recorder(Path::new(path), args.record_interval)?)),
        None => None,
    };
    let tap = recorder
        .clone()
        .map(|recorder| recorder as Arc<dyn MessageTap>);

    let dispatcher = DispatcherBuilder::new()
        .protocol_version(args.protocol_version.clone())
        .build();

    let outcome = if args.enable_web_server {
        run_web_server(&args, dispatcher, tap)
    } else {
        run_stream_server(dispatcher, tap)
    };

    if let Some(recorder) = recorder {
        match recorder.close() {
            Ok(()) => info!("Recorded session saved to {}", recorder.file_path().display()),
            Err(e) => error!("Failed to save recorded session: {}", e),
        }
    }

    outcome
}

fn build_recorder(path: &Path, interval: Option<u64>) -> anyhow::Result<MessageRecorder> {
    info!("Recording session to {}", path.display());
    let mut builder = MessageRecorder::builder(path);
    if let Some(secs) = interval {
        builder = builder.save_interval(Duration::from_secs(secs));
    }
    builder.build().context("failed to start session recorder")
}

fn run_stream_server(
    dispatcher: Arc<Dispatcher>,
    tap: Option<Arc<dyn MessageTap>>,
) -> anyhow::Result<()> {
    let mut builder = StreamServer::builder(dispatcher);
    if let Some(tap) = tap {
        builder = builder.tap(tap);
    }
    let server = builder.try_build(std::io::stdin(), std::io::stdout())?;

    server.start()?;
    server.wait_for_exit()?;
    info!("JSON-RPC stream server exited");
    Ok(())
}

fn run_web_server(
    args: &Args,
    dispatcher: Arc<Dispatcher>,
    tap: Option<Arc<dyn MessageTap>>,
) -> anyhow::Result<()> {
    let config = web_config(args)?;
    let mut builder = WebServer::builder(dispatcher).config(config);
    if let Some(tap) = tap {
        builder = builder.tap(tap);
    }
    let server = builder.build();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        tokio::select! {
            result = server.run() => result.context("web server failed"),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                server.stop();
                Ok(())
            }
        }
    })
}

fn web_config(args: &Args) -> anyhow::Result<WebServerConfig> {
    let mut config = WebServerConfig::from_env()?;
    if let Some(address) = &args.listen_address {
        config = config.listen_address(address.clone());
    }
    if let Some(port) = args.listen_port {
        config = config.listen_port(port);
    }
    if args.disable_keep_alive {
        config = config.disable_keep_alive(true);
    }
    if args.enable_dynamic_cors {
        config = config.enable_dynamic_cors(true);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let args = Args::try_parse_from([
            "dbtools-service",
            "--enable-web-server",
            "--listen-address",
            "127.0.0.1",
            "--listen-port",
            "9000",
            "--enable-dynamic-cors",
            "--record-session",
            "out/session.json",
            "--record-interval",
            "5",
        ])
        .unwrap();

        assert!(args.enable_web_server);
        assert_eq!(args.record_interval, Some(5));
        assert_eq!(args.protocol_version, DEFAULT_PROTOCOL_VERSION);

        let config = web_config(&args).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.listen_port, 9000);
        assert!(config.enable_dynamic_cors);
    }

    #[test]
    fn test_record_interval_requires_path() {
        assert!(Args::try_parse_from(["dbtools-service", "--record-interval", "5"]).is_err());
    }
}
