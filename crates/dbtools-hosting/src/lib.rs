//! # Database Tools Hosting
//!
//! The dispatch core shared by every transport plus the Content-Length
//! stream transport used when the service runs over stdin/stdout.
//!
//! ```rust,no_run
//! use dbtools_hosting::prelude::*;
//!
//! let dispatcher = DispatcherBuilder::new()
//!     .raw_request_handler("connection/list", |ctx, _params| {
//!         ctx.send_response(Vec::<String>::new())?;
//!         Ok(())
//!     })
//!     .build();
//!
//! let server = StreamServer::new(dispatcher, std::io::stdin(), std::io::stdout());
//! server.start()?;
//! server.wait_for_exit()?;
//! # Ok::<(), dbtools_hosting::HostingError>(())
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod prelude;
pub mod stream;

pub use config::{DEFAULT_PROTOCOL_VERSION, DEFAULT_REQUEST_TIMEOUT, StreamServerConfig};
pub use context::{NotificationContext, RequestContext, RpcPeer, SharedTransport, TransportContext};
pub use dispatcher::{Dispatcher, DispatcherBuilder, methods};
pub use error::{FrameError, HostingError, Result};
pub use framing::{DEFAULT_MAX_MESSAGE_SIZE, FrameReader, FrameWriter};
pub use stream::{StreamServer, StreamServerBuilder};
