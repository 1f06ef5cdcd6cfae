//! Recorded session file model.
//!
//! ```json
//! {
//!   "client_request_groups": [
//!     {
//!       "client_request": {
//!         "request":  {"message": {"jsonrpc": "2.0", "id": 1, "method": "version"}, "timestamp": 0.5},
//!         "response": {"message": {"jsonrpc": "2.0", "id": 1, "result": "1"}, "timestamp": 0.6}
//!       },
//!       "server_requests": [],
//!       "server_notifications": [],
//!       "client_notifications": []
//!     }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use dbtools_json_rpc::{JsonRpcMessage, MessageKind};

use crate::error::{RecorderError, Result};

/// A message and the time it crossed the transport boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: JsonRpcMessage,
    pub timestamp: f64,
}

impl MessageRecord {
    pub fn new(message: JsonRpcMessage, timestamp: f64) -> Self {
        Self { message, timestamp }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponseRecord {
    pub request: MessageRecord,
    pub response: MessageRecord,
}

/// A client request with its response, plus the server requests and
/// notifications and the client notifications that followed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequestGroupRecord {
    pub client_request: RequestResponseRecord,
    #[serde(default)]
    pub server_requests: Vec<RequestResponseRecord>,
    #[serde(default)]
    pub server_notifications: Vec<MessageRecord>,
    #[serde(default)]
    pub client_notifications: Vec<MessageRecord>,
}

impl ClientRequestGroupRecord {
    pub fn new(client_request: RequestResponseRecord) -> Self {
        Self {
            client_request,
            server_requests: Vec::new(),
            server_notifications: Vec::new(),
            client_notifications: Vec::new(),
        }
    }
}

/// Traffic recorded before the first client request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreSessionRecord {
    #[serde(default)]
    pub server_requests: Vec<RequestResponseRecord>,
    #[serde(default)]
    pub server_notifications: Vec<MessageRecord>,
    #[serde(default)]
    pub client_notifications: Vec<MessageRecord>,
}

impl PreSessionRecord {
    pub fn is_empty(&self) -> bool {
        self.server_requests.is_empty()
            && self.server_notifications.is_empty()
            && self.client_notifications.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedSession {
    pub client_request_groups: Vec<ClientRequestGroupRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_session: Option<PreSessionRecord>,
}

impl RecordedSession {
    /// Load and validate a recorded session file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| RecorderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let session: RecordedSession = serde_json::from_str(&contents)?;
        session.validate()?;
        Ok(session)
    }

    /// Write pretty JSON, creating parent directories as needed
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RecorderError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| RecorderError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every slot holds the kind of message its position implies
    pub fn validate(&self) -> Result<()> {
        for group in &self.client_request_groups {
            check_pair(&group.client_request)?;
            group.server_requests.iter().try_for_each(check_pair)?;
            check_notifications(&group.server_notifications)?;
            check_notifications(&group.client_notifications)?;
        }
        if let Some(pre) = &self.pre_session {
            pre.server_requests.iter().try_for_each(check_pair)?;
            check_notifications(&pre.server_notifications)?;
            check_notifications(&pre.client_notifications)?;
        }
        Ok(())
    }

    /// Client requests in playback order
    pub fn client_requests(&self) -> impl Iterator<Item = &MessageRecord> {
        self.client_request_groups
            .iter()
            .map(|group| &group.client_request.request)
    }
}

fn check_pair(pair: &RequestResponseRecord) -> Result<()> {
    let request = &pair.request.message;
    if request.kind() != MessageKind::Request {
        return Err(RecorderError::InvalidRecord(format!(
            "expected a request, found a {:?}",
            request.kind()
        )));
    }
    let response = &pair.response.message;
    if !response.is_response() {
        return Err(RecorderError::InvalidRecord(format!(
            "expected a response, found a {:?}",
            response.kind()
        )));
    }
    if request.id() != response.id() {
        return Err(RecorderError::InvalidRecord(format!(
            "response id {:?} does not match request id {:?}",
            response.id(),
            request.id()
        )));
    }
    Ok(())
}

fn check_notifications(records: &[MessageRecord]) -> Result<()> {
    match records
        .iter()
        .find(|record| record.message.kind() != MessageKind::Notification)
    {
        Some(record) => Err(RecorderError::InvalidRecord(format!(
            "expected a notification, found a {:?}",
            record.message.kind()
        ))),
        None => Ok(()),
    }
}
