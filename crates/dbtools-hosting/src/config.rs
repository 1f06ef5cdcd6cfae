//! Stream server configuration

use std::time::Duration;

use crate::error::HostingError;
use crate::framing::DEFAULT_MAX_MESSAGE_SIZE;

/// Default protocol version answered by the built-in `version` request
pub const DEFAULT_PROTOCOL_VERSION: &str = "1";

/// Default timeout for server-initiated requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the Content-Length stream transport
#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    /// Body encoding label. Only UTF-8 is supported.
    pub encoding: String,
    /// Name prefix for the input and output threads
    pub thread_name_prefix: String,
    /// Frames with a larger body are skipped
    pub max_message_size: usize,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_string(),
            thread_name_prefix: "dbtools-jsonrpc".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl StreamServerConfig {
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Reject encodings the framing codec cannot decode
    pub fn validate(&self) -> Result<(), HostingError> {
        match self.encoding.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(()),
            _ => Err(HostingError::UnsupportedEncoding(self.encoding.clone())),
        }
    }

    pub(crate) fn input_thread_name(&self) -> String {
        format!("{}-input", self.thread_name_prefix)
    }

    pub(crate) fn output_thread_name(&self) -> String {
        format!("{}-output", self.thread_name_prefix)
    }
}
