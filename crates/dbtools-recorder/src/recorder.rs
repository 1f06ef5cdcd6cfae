//! Live message recorder and session reconstruction

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use dbtools_json_rpc::{JsonRpcMessage, MessageDirection, MessageTap};

use crate::error::{RecorderError, RequestOrigin, Result};
use crate::record::{
    ClientRequestGroupRecord, MessageRecord, PreSessionRecord, RecordedSession,
    RequestResponseRecord,
};

/// Timestamp source, in seconds
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Requests that never get a response and would break pairing
const UNPAIRED_METHODS: [&str; 2] = ["shutdown", "exit"];

#[derive(Debug, Clone, Default)]
struct Buckets {
    client_requests: Vec<MessageRecord>,
    server_requests: Vec<MessageRecord>,
    client_responses: Vec<MessageRecord>,
    server_responses: Vec<MessageRecord>,
    client_notifications: Vec<MessageRecord>,
    server_notifications: Vec<MessageRecord>,
}

impl Buckets {
    fn insert(&mut self, record: MessageRecord, direction: MessageDirection) {
        use MessageDirection::{Incoming, Outgoing};

        let bucket = match (&record.message, direction) {
            (JsonRpcMessage::Request(_), Incoming) => &mut self.client_requests,
            (JsonRpcMessage::Request(_), Outgoing) => &mut self.server_requests,
            (JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_), Incoming) => {
                &mut self.client_responses
            }
            (JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_), Outgoing) => {
                &mut self.server_responses
            }
            (JsonRpcMessage::Notification(_), Incoming) => &mut self.client_notifications,
            (JsonRpcMessage::Notification(_), Outgoing) => &mut self.server_notifications,
        };
        bucket.push(record);
    }
}

struct RecorderInner {
    file_path: PathBuf,
    clock: Clock,
    silence_errors: bool,
    buckets: Mutex<Buckets>,
}

impl RecorderInner {
    fn save(&self) -> Result<()> {
        let session = self.build_session()?;
        session.to_file(&self.file_path)?;
        info!("Saved recorded session to {}", self.file_path.display());
        Ok(())
    }

    fn build_session(&self) -> Result<RecordedSession> {
        let buckets = self.buckets.lock().clone();
        reconstruct(buckets)
    }
}

struct BackgroundSaver {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Records every message crossing the transport boundary.
///
/// Attach it to a transport as a [`MessageTap`]; call [`MessageRecorder::close`]
/// when the session ends to write the reconstructed session file.
pub struct MessageRecorder {
    inner: Arc<RecorderInner>,
    saver: Mutex<Option<BackgroundSaver>>,
}

impl MessageRecorder {
    /// Recorder with the default monotonic clock and no background saving
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self::from_parts(MessageRecorderBuilder::new(file_path))
    }

    pub fn builder(file_path: impl Into<PathBuf>) -> MessageRecorderBuilder {
        MessageRecorderBuilder::new(file_path)
    }

    fn from_parts(builder: MessageRecorderBuilder) -> Self {
        let clock = builder.clock.unwrap_or_else(|| {
            let start = Instant::now();
            Arc::new(move || start.elapsed().as_secs_f64())
        });
        Self {
            inner: Arc::new(RecorderInner {
                file_path: builder.file_path,
                clock,
                silence_errors: builder.silence_errors,
                buckets: Mutex::new(Buckets::default()),
            }),
            saver: Mutex::new(None),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    /// Record a message stamped with the recorder's clock.
    ///
    /// With `silence_errors` set (the default) failures are logged and
    /// swallowed so recording can never disturb message flow.
    pub fn record(&self, message: &JsonRpcMessage, direction: MessageDirection) -> Result<()> {
        let timestamp = (self.inner.clock)();
        self.record_at(message, direction, timestamp)
    }

    /// Record a message with an explicit timestamp
    pub fn record_at(
        &self,
        message: &JsonRpcMessage,
        direction: MessageDirection,
        timestamp: f64,
    ) -> Result<()> {
        match self.try_record(message, direction, timestamp) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to record {:?} message: {}", direction, e);
                if self.inner.silence_errors {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn try_record(
        &self,
        message: &JsonRpcMessage,
        direction: MessageDirection,
        timestamp: f64,
    ) -> Result<()> {
        if !timestamp.is_finite() {
            return Err(RecorderError::InvalidTimestamp);
        }
        if let JsonRpcMessage::Request(request) = message
            && direction == MessageDirection::Incoming
            && UNPAIRED_METHODS.contains(&request.method.as_str())
        {
            debug!(method = %request.method, "Not recording lifecycle request");
            return Ok(());
        }

        self.inner
            .buckets
            .lock()
            .insert(MessageRecord::new(message.clone(), timestamp), direction);
        Ok(())
    }

    /// Number of messages recorded so far
    pub fn len(&self) -> usize {
        let buckets = self.inner.buckets.lock();
        buckets.client_requests.len()
            + buckets.server_requests.len()
            + buckets.client_responses.len()
            + buckets.server_responses.len()
            + buckets.client_notifications.len()
            + buckets.server_notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pair requests with responses and group traffic under client requests
    pub fn build_session(&self) -> Result<RecordedSession> {
        self.inner.build_session()
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save()
    }

    /// Stop background saving and write the session file
    pub fn close(&self) -> Result<()> {
        self.stop_saver();
        self.inner.save()
    }

    fn start_saver(&self, interval: Duration) -> Result<()> {
        let (stop, stopped) = mpsc::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("dbtools-recorder-save".to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    if let Err(e) = inner.save() {
                        error!("Periodic session save failed: {}", e);
                    }
                }
            })
            .map_err(RecorderError::ThreadSpawn)?;
        *self.saver.lock() = Some(BackgroundSaver { stop, handle });
        Ok(())
    }

    fn stop_saver(&self) {
        if let Some(saver) = self.saver.lock().take() {
            let _ = saver.stop.send(());
            if saver.handle.join().is_err() {
                error!("Background session saver panicked");
            }
        }
    }
}

impl Drop for MessageRecorder {
    fn drop(&mut self) {
        self.stop_saver();
    }
}

impl MessageTap for MessageRecorder {
    fn on_message(&self, message: &JsonRpcMessage, direction: MessageDirection) {
        // errors were already logged
        let _ = self.record(message, direction);
    }
}

pub struct MessageRecorderBuilder {
    file_path: PathBuf,
    clock: Option<Clock>,
    save_interval: Option<Duration>,
    silence_errors: bool,
}

impl MessageRecorderBuilder {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            clock: None,
            save_interval: None,
            silence_errors: true,
        }
    }

    /// Replace the timestamp source (deterministic tests)
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Save the session file periodically in the background
    pub fn save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = Some(interval);
        self
    }

    pub fn silence_errors(mut self, silence: bool) -> Self {
        self.silence_errors = silence;
        self
    }

    pub fn build(mut self) -> Result<MessageRecorder> {
        let interval = self.save_interval.take();
        let recorder = MessageRecorder::from_parts(self);
        if let Some(interval) = interval {
            recorder.start_saver(interval)?;
        }
        Ok(recorder)
    }
}

fn by_timestamp(records: &mut [MessageRecord]) {
    records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
}

/// Pair each request (in timestamp order) with the first unconsumed response
/// carrying its id and recorded no earlier than the request
fn pair(
    mut requests: Vec<MessageRecord>,
    mut responses: Vec<MessageRecord>,
    origin: RequestOrigin,
) -> Result<Vec<RequestResponseRecord>> {
    by_timestamp(&mut requests);

    requests
        .into_iter()
        .map(|request| {
            let id = request.message.id().cloned();
            let position = responses
                .iter()
                .position(|r| r.message.id() == id.as_ref() && r.timestamp >= request.timestamp);
            match (position, id) {
                (Some(position), _) => Ok(RequestResponseRecord {
                    request,
                    response: responses.remove(position),
                }),
                (None, Some(id)) => Err(RecorderError::UnpairedRequest { origin, id }),
                (None, None) => Err(RecorderError::InvalidRecord(
                    "request without an id".to_string(),
                )),
            }
        })
        .collect()
}

fn reconstruct(buckets: Buckets) -> Result<RecordedSession> {
    let Buckets {
        client_requests,
        server_requests,
        client_responses,
        server_responses,
        mut client_notifications,
        mut server_notifications,
    } = buckets;

    let client_pairs = pair(client_requests, server_responses, RequestOrigin::Client)?;
    let server_pairs = pair(server_requests, client_responses, RequestOrigin::Server)?;
    by_timestamp(&mut client_notifications);
    by_timestamp(&mut server_notifications);

    // client_pairs is sorted by request timestamp
    let group_of = |timestamp: f64| -> Option<usize> {
        client_pairs
            .partition_point(|pair| pair.request.timestamp < timestamp)
            .checked_sub(1)
    };

    let mut pre_session = PreSessionRecord::default();
    let mut server_requests_by_group: Vec<Vec<RequestResponseRecord>> =
        vec![Vec::new(); client_pairs.len()];
    let mut server_notifications_by_group: Vec<Vec<MessageRecord>> =
        vec![Vec::new(); client_pairs.len()];
    let mut client_notifications_by_group: Vec<Vec<MessageRecord>> =
        vec![Vec::new(); client_pairs.len()];

    for pair in server_pairs {
        match group_of(pair.request.timestamp) {
            Some(index) => server_requests_by_group[index].push(pair),
            None => pre_session.server_requests.push(pair),
        }
    }
    for record in server_notifications {
        match group_of(record.timestamp) {
            Some(index) => server_notifications_by_group[index].push(record),
            None => pre_session.server_notifications.push(record),
        }
    }
    for record in client_notifications {
        match group_of(record.timestamp) {
            Some(index) => client_notifications_by_group[index].push(record),
            None => pre_session.client_notifications.push(record),
        }
    }

    let client_request_groups = client_pairs
        .into_iter()
        .zip(server_requests_by_group)
        .zip(server_notifications_by_group)
        .zip(client_notifications_by_group)
        .map(
            |(((client_request, server_requests), server_notifications), client_notifications)| {
                ClientRequestGroupRecord {
                    client_request,
                    server_requests,
                    server_notifications,
                    client_notifications,
                }
            },
        )
        .collect();

    Ok(RecordedSession {
        client_request_groups,
        pre_session: (!pre_session.is_empty()).then_some(pre_session),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbtools_json_rpc::{
        JsonRpcError, JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
        RequestId,
    };
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    use MessageDirection::{Incoming, Outgoing};

    /// Clock returning the given timestamps in order
    fn scripted(timestamps: Vec<f64>) -> impl Fn() -> f64 + Send + Sync + 'static {
        let next = AtomicUsize::new(0);
        move || timestamps[next.fetch_add(1, Ordering::SeqCst)]
    }

    fn recorder(timestamps: Vec<f64>) -> MessageRecorder {
        MessageRecorder::builder("unused.json")
            .with_clock(scripted(timestamps))
            .silence_errors(false)
            .build()
            .unwrap()
    }

    fn request(id: &str, method: &str) -> JsonRpcMessage {
        JsonRpcRequest::new(id.into(), method, Some(json!({}))).into()
    }

    fn response(id: &str, result: Value) -> JsonRpcMessage {
        JsonRpcResponse::success(id.into(), result).into()
    }

    fn notification(method: &str, params: Value) -> JsonRpcMessage {
        JsonRpcNotification::new(method, Some(params)).into()
    }

    fn result_of(record: &MessageRecord) -> Value {
        match &record.message {
            JsonRpcMessage::Response(response) => response.result.clone(),
            other => panic!("expected a response, got {:?}", other),
        }
    }

    fn params_of(record: &MessageRecord) -> Value {
        match &record.message {
            JsonRpcMessage::Notification(n) => n.params.clone().unwrap_or(Value::Null),
            other => panic!("expected a notification, got {:?}", other),
        }
    }

    #[test]
    fn test_client_request_server_response() {
        let recorder = recorder(vec![1.0, 2.0]);
        recorder.record(&request("a", "foo"), Incoming).unwrap();
        recorder
            .record(&response("a", json!({"key": "value"})), Outgoing)
            .unwrap();

        let session = recorder.build_session().unwrap();
        assert_eq!(session.client_request_groups.len(), 1);
        let group = &session.client_request_groups[0];
        assert_eq!(
            group.client_request.response.message.id(),
            Some(&RequestId::from("a"))
        );
        assert_eq!(result_of(&group.client_request.response), json!({"key": "value"}));
        assert!(group.server_requests.is_empty());
        assert!(group.server_notifications.is_empty());
        assert!(group.client_notifications.is_empty());
        assert!(session.pre_session.is_none());
    }

    #[test]
    fn test_server_request_client_response() {
        let recorder = recorder(vec![1.0, 2.0, 3.0, 4.0]);
        recorder.record(&request("1", "foo"), Incoming).unwrap();
        recorder.record(&response("1", json!({"key": "value"})), Outgoing).unwrap();
        recorder.record(&request("2", "bar"), Outgoing).unwrap();
        recorder.record(&response("2", json!({"value": "baz"})), Incoming).unwrap();

        let session = recorder.build_session().unwrap();
        let group = &session.client_request_groups[0];
        assert_eq!(group.server_requests.len(), 1);
        let server_pair = &group.server_requests[0];
        assert_eq!(server_pair.request.message.id(), Some(&RequestId::from("2")));
        assert_eq!(result_of(&server_pair.response), json!({"value": "baz"}));
    }

    #[test]
    fn test_notifications_group_under_preceding_request() {
        let recorder = recorder(vec![2.0, 3.0, 4.0, 5.0]);
        recorder.record(&request("3", "clientReq"), Incoming).unwrap();
        recorder
            .record(&notification("serverNotify", json!({"note": "second"})), Outgoing)
            .unwrap();
        recorder
            .record(&notification("clientNotify", json!({"msg": "hello"})), Incoming)
            .unwrap();
        recorder.record(&response("3", json!({"status": "ok"})), Outgoing).unwrap();

        let session = recorder.build_session().unwrap();
        let group = &session.client_request_groups[0];
        assert_eq!(params_of(&group.server_notifications[0]), json!({"note": "second"}));
        assert_eq!(group.client_notifications[0].message.method(), Some("clientNotify"));
    }

    #[test]
    fn test_missing_server_response() {
        let recorder = recorder(vec![1.0]);
        recorder.record(&request("4", "req"), Incoming).unwrap();

        let err = recorder.build_session().unwrap_err();
        assert_eq!(
            err.to_string(),
            "No matching server response found for client request id 4"
        );
    }

    #[test]
    fn test_missing_client_response() {
        let recorder = recorder(vec![1.0]);
        recorder.record(&request("5", "req"), Outgoing).unwrap();

        let err = recorder.build_session().unwrap_err();
        assert!(matches!(
            err,
            RecorderError::UnpairedRequest {
                origin: RequestOrigin::Server,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "No matching client response found for server request id 5"
        );
    }

    #[test]
    fn test_response_before_request_is_not_paired() {
        let recorder = recorder(vec![]);
        recorder.record_at(&response("a", json!(1)), Outgoing, 1.0).unwrap();
        recorder.record_at(&request("a", "m"), Incoming, 2.0).unwrap();
        assert!(recorder.build_session().is_err());
    }

    #[test]
    fn test_duplicate_ids_consume_responses_in_order() {
        let recorder = recorder(vec![]);
        recorder.record_at(&request("x", "first"), Incoming, 1.0).unwrap();
        recorder.record_at(&response("x", json!(1)), Outgoing, 2.0).unwrap();
        recorder.record_at(&request("x", "second"), Incoming, 3.0).unwrap();
        recorder.record_at(&response("x", json!(2)), Outgoing, 4.0).unwrap();

        let session = recorder.build_session().unwrap();
        let results: Vec<Value> = session
            .client_request_groups
            .iter()
            .map(|g| result_of(&g.client_request.response))
            .collect();
        assert_eq!(results, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_ordering_from_unsorted_buckets() {
        let recorder = recorder(vec![]);
        // recorded out of chronological order
        recorder.record_at(&request("b", "req_b"), Incoming, 15.0).unwrap();
        recorder.record_at(&request("a", "req_a"), Incoming, 10.0).unwrap();
        recorder.record_at(&response("b", json!({"b": 2})), Outgoing, 16.0).unwrap();
        recorder.record_at(&response("a", json!({"a": 1})), Outgoing, 11.0).unwrap();
        recorder.record_at(&request("c", "req_c"), Outgoing, 13.0).unwrap();
        recorder.record_at(&response("c", json!({"c": 3})), Incoming, 14.0).unwrap();
        recorder
            .record_at(&notification("notify", json!({"note": "server"})), Outgoing, 11.0)
            .unwrap();
        recorder
            .record_at(&notification("notify", json!({"note": "client"})), Incoming, 16.0)
            .unwrap();

        let session = recorder.build_session().unwrap();
        assert_eq!(session.client_request_groups.len(), 2);
        let (group_a, group_b) = (
            &session.client_request_groups[0],
            &session.client_request_groups[1],
        );
        assert_eq!(group_a.client_request.request.message.method(), Some("req_a"));
        assert_eq!(group_a.server_requests[0].request.message.id(), Some(&RequestId::from("c")));
        assert_eq!(params_of(&group_a.server_notifications[0]), json!({"note": "server"}));
        assert!(group_b.server_requests.is_empty());
        assert_eq!(params_of(&group_b.client_notifications[0]), json!({"note": "client"}));
    }

    #[test]
    fn test_simultaneous_item_goes_to_earlier_group() {
        let recorder = recorder(vec![]);
        recorder.record_at(&request("a", "first"), Incoming, 1.0).unwrap();
        recorder.record_at(&response("a", json!(null)), Outgoing, 1.5).unwrap();
        recorder.record_at(&request("b", "second"), Incoming, 2.0).unwrap();
        recorder.record_at(&response("b", json!(null)), Outgoing, 3.0).unwrap();
        // same timestamp as request "b": grouping is strictly-before
        recorder
            .record_at(&notification("tick", json!({})), Outgoing, 2.0)
            .unwrap();

        let session = recorder.build_session().unwrap();
        assert_eq!(session.client_request_groups[0].server_notifications.len(), 1);
        assert!(session.client_request_groups[1].server_notifications.is_empty());
    }

    #[test]
    fn test_traffic_before_first_request_is_kept() {
        let recorder = recorder(vec![]);
        recorder
            .record_at(&notification("window/logMessage", json!({"message": "up"})), Outgoing, 0.5)
            .unwrap();
        recorder.record_at(&request("s", "workspace/configuration"), Outgoing, 0.6).unwrap();
        recorder.record_at(&response("s", json!([])), Incoming, 0.7).unwrap();
        recorder.record_at(&request("a", "version"), Incoming, 1.0).unwrap();
        recorder.record_at(&response("a", json!("1")), Outgoing, 1.1).unwrap();

        let session = recorder.build_session().unwrap();
        let pre = session.pre_session.unwrap();
        assert_eq!(pre.server_notifications.len(), 1);
        assert_eq!(pre.server_requests.len(), 1);
        assert!(session.client_request_groups[0].server_requests.is_empty());
    }

    #[test]
    fn test_error_response_pairs_with_request() {
        let recorder = recorder(vec![1.0, 2.0]);
        recorder.record(&request("err1", "errorMethod"), Incoming).unwrap();
        let error = JsonRpcError::new(
            "err1".into(),
            JsonRpcErrorObject::with_code(-32603, "Internal error", Some(json!({"info": "failure"}))),
        );
        recorder.record(&error.into(), Outgoing).unwrap();

        let session = recorder.build_session().unwrap();
        match &session.client_request_groups[0].client_request.response.message {
            JsonRpcMessage::Error(e) => {
                assert_eq!(e.error.code, -32603);
                assert_eq!(e.error.message, "Internal error");
                assert_eq!(e.error.data, Some(json!({"info": "failure"})));
            }
            other => panic!("expected an error response, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_requests_are_skipped() {
        let recorder = recorder(vec![1.0, 2.0, 3.0]);
        recorder.record(&request("9", "shutdown"), Incoming).unwrap();
        recorder.record(&request("10", "exit"), Incoming).unwrap();
        recorder.record(&notification("exit", json!(null)), Incoming).unwrap();

        assert_eq!(recorder.len(), 1);
        assert!(recorder.build_session().is_ok());
    }

    #[test]
    #[traced_test]
    fn test_silenced_errors_are_logged() {
        let recorder = MessageRecorder::builder("unused.json")
            .with_clock(|| f64::NAN)
            .build()
            .unwrap();
        recorder.on_message(&request("1", "m"), Incoming);

        assert!(recorder.is_empty());
        assert!(logs_contain("Failed to record"));
    }

    #[test]
    fn test_unsilenced_errors_propagate() {
        let recorder = MessageRecorder::builder("unused.json")
            .with_clock(|| f64::INFINITY)
            .silence_errors(false)
            .build()
            .unwrap();
        assert!(matches!(
            recorder.record(&request("1", "m"), Incoming),
            Err(RecorderError::InvalidTimestamp)
        ));
    }

    #[test]
    fn test_close_writes_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("session.json");
        let recorder = MessageRecorder::builder(&path)
            .with_clock(scripted(vec![1.0, 2.0]))
            .save_interval(Duration::from_secs(3600))
            .build()
            .unwrap();

        recorder.on_message(&request("1", "version"), Incoming);
        recorder.on_message(&response("1", json!("1")), Outgoing);
        recorder.close().unwrap();

        let session = RecordedSession::from_file(&path).unwrap();
        assert_eq!(session.client_request_groups.len(), 1);
    }

    #[test]
    fn test_background_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let recorder = MessageRecorder::builder(&path)
            .save_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        recorder.on_message(&request("1", "version"), Incoming);
        recorder.on_message(&response("1", json!("1")), Outgoing);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(path.exists());
        drop(recorder);
    }
}
