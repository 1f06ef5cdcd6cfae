//! # Hosting Prelude
//!
//! ```rust
//! use dbtools_hosting::prelude::*;
//! ```

pub use dbtools_json_rpc::prelude::*;

pub use crate::config::StreamServerConfig;
pub use crate::context::{
    NotificationContext, RequestContext, RpcPeer, SharedTransport, TransportContext,
};
pub use crate::dispatcher::{Dispatcher, DispatcherBuilder};
pub use crate::error::{FrameError, HostingError};
pub use crate::stream::{StreamServer, StreamServerBuilder};
