//! # Session Recorder
//!
//! Observes every message crossing the transport boundary and rebuilds a
//! [`RecordedSession`]: client requests paired with their responses, each
//! followed by the server traffic and client notifications it caused.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dbtools_recorder::MessageRecorder;
//!
//! let recorder = Arc::new(MessageRecorder::new("session.json"));
//! // attach `recorder.clone()` as a transport tap, run the session ...
//! recorder.close()?;
//! # Ok::<(), dbtools_recorder::RecorderError>(())
//! ```

pub mod error;
pub mod record;
pub mod recorder;

pub use error::{RecorderError, RequestOrigin, Result};
pub use record::{
    ClientRequestGroupRecord, MessageRecord, PreSessionRecord, RecordedSession,
    RequestResponseRecord,
};
pub use recorder::{Clock, MessageRecorder, MessageRecorderBuilder};
