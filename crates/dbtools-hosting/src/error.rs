use thiserror::Error;

/// Errors raised while reading a Content-Length framed message
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("End of stream")]
    EndOfStream,

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length header '{0}'")]
    InvalidContentLength(String),

    #[error("Malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("Message of {length} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { length: u64, limit: usize },

    #[error("Header line longer than {0} bytes")]
    HeaderTooLong(usize),

    #[error("Stream ended after {read} of {expected} body bytes")]
    TruncatedBody { expected: usize, read: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the read loop can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::MissingContentLength
                | FrameError::InvalidContentLength(_)
                | FrameError::MalformedHeader(_)
                | FrameError::MessageTooLarge { .. }
                | FrameError::HeaderTooLong(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum HostingError {
    #[error("Unsupported body encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server was not started")]
    NotStarted,

    #[error("{0} thread panicked")]
    ThreadPanicked(String),
}

pub type Result<T> = std::result::Result<T, HostingError>;
