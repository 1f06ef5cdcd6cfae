use std::fmt;
use std::path::PathBuf;

use dbtools_json_rpc::RequestId;

pub type Result<T> = std::result::Result<T, RecorderError>;

/// Which side issued an unpaired request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Client,
    Server,
}

impl RequestOrigin {
    /// The side expected to answer
    pub fn counterpart(self) -> RequestOrigin {
        match self {
            RequestOrigin::Client => RequestOrigin::Server,
            RequestOrigin::Server => RequestOrigin::Client,
        }
    }
}

impl fmt::Display for RequestOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOrigin::Client => write!(f, "client"),
            RequestOrigin::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("No matching {} response found for {origin} request id {id}", .origin.counterpart())]
    UnpairedRequest { origin: RequestOrigin, id: RequestId },

    #[error("Invalid recorded message: {0}")]
    InvalidRecord(String),

    #[error("Clock produced a non-finite timestamp")]
    InvalidTimestamp,

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start background saver: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
