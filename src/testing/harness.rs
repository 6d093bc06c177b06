use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::cluster::ArchiveClient;
use crate::cluster::ArchiveContext;
use crate::cluster::ClusterClient;
use crate::cluster::ControlResponseCode;
use crate::cluster::EpochClock;
use crate::cluster::PendingArchiveConnect;
use crate::cluster::Publication;
use crate::cluster::RecordingEventConsumer;
use crate::cluster::RecordingSignalEvent;
use crate::cluster::SourceLocation;
use crate::cluster::Subscription;
use crate::counters::NULL_VALUE;
use crate::error::BackupError;

/// A settable test clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    time_ms: Cell<i64>,
}

impl ManualClock {
    /// Create a clock at `time_ms`.
    pub fn new(time_ms: i64) -> Self {
        Self {
            time_ms: Cell::new(time_ms),
        }
    }

    /// Set the clock.
    pub fn set(&self, time_ms: i64) {
        self.time_ms.set(time_ms);
    }

    /// Advance the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.time_ms.set(self.time_ms.get() + delta_ms);
    }
}

impl EpochClock for ManualClock {
    fn time_ms(&self) -> i64 {
        self.time_ms.get()
    }
}

/// A request the agent issued against a [`FakeArchive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveRequest {
    /// `get_stop_position` was requested.
    GetStopPosition {
        /// Target recording.
        recording_id: i64,
        /// Correlation id of the request.
        correlation_id: i64,
    },
    /// `replay` was requested.
    Replay {
        /// Source recording.
        recording_id: i64,
        /// Start position of the replay.
        start_position: i64,
        /// Replay length.
        length: i64,
        /// Destination channel.
        channel: String,
        /// Destination stream id.
        stream_id: i32,
        /// Correlation id of the request.
        correlation_id: i64,
    },
    /// `bounded_replay` was requested.
    BoundedReplay {
        /// Source recording.
        recording_id: i64,
        /// Start position of the replay.
        start_position: i64,
        /// Replay length.
        length: i64,
        /// Counter bounding the replay.
        limit_counter_id: i32,
        /// Destination channel.
        channel: String,
        /// Destination stream id.
        stream_id: i32,
        /// Correlation id of the request.
        correlation_id: i64,
    },
    /// `start_recording` was requested.
    StartRecording {
        /// Recorded channel.
        channel: String,
        /// Recorded stream id.
        stream_id: i32,
        /// Source location of the stream.
        source_location: SourceLocation,
    },
    /// `extend_recording` was requested.
    ExtendRecording {
        /// The recording being extended.
        recording_id: i64,
        /// Recorded channel.
        channel: String,
        /// Recorded stream id.
        stream_id: i32,
        /// Source location of the stream.
        source_location: SourceLocation,
    },
    /// `try_stop_recording` was requested.
    TryStopRecording {
        /// Subscription to stop.
        subscription_id: i64,
    },
}

enum QueuedEvent {
    Signal(RecordingSignalEvent),
    Response {
        correlation_id: i64,
        relevant_id: i64,
        code: ControlResponseCode,
        error_message: String,
    },
}

struct ArchiveState {
    control_session_id: i64,
    requests: Vec<ArchiveRequest>,
    pending_responses: VecDeque<(i64, Result<i64, String>)>,
    stop_positions: HashMap<i64, i64>,
    replay_sessions: HashMap<i64, i64>,
    fail_next: Option<String>,
    next_subscription_id: i64,
    events: VecDeque<QueuedEvent>,
}

/// A scripted archive control session.
///
/// Request results are configured per operation: a stop position per
/// recording, a replay session id per recording. A request with no script
/// entry stays pending forever, which is how connect and response timeouts
/// are exercised.
#[derive(Clone)]
pub struct FakeArchive {
    state: Rc<RefCell<ArchiveState>>,
}

impl FakeArchive {
    /// Create an archive with the given control session id.
    pub fn new(control_session_id: i64) -> Self {
        Self {
            state: Rc::new(RefCell::new(ArchiveState {
                control_session_id,
                requests: Vec::new(),
                pending_responses: VecDeque::new(),
                stop_positions: HashMap::new(),
                replay_sessions: HashMap::new(),
                fail_next: None,
                next_subscription_id: 2000,
                events: VecDeque::new(),
            })),
        }
    }

    /// Script the stop position of a recording; serves both the
    /// `get_stop_position` request and the synchronous `stop_position` call.
    pub fn set_stop_position(&self, recording_id: i64, position: i64) {
        self.state.borrow_mut().stop_positions.insert(recording_id, position);
    }

    /// Script the session id handed out for a replay of `recording_id`.
    pub fn set_replay_session(&self, recording_id: i64, session_id: i64) {
        self.state.borrow_mut().replay_sessions.insert(recording_id, session_id);
    }

    /// Fail the next control request with an error response.
    pub fn fail_next_request(&self, message: impl ToString) {
        self.state.borrow_mut().fail_next = Some(message.to_string());
    }

    /// Enqueue a recording signal for the next `poll_signals`.
    pub fn signal(&self, event: RecordingSignalEvent) {
        self.state.borrow_mut().events.push_back(QueuedEvent::Signal(event));
    }

    /// Enqueue an error control response on the signal stream.
    pub fn signal_error(&self, message: impl ToString) {
        self.state.borrow_mut().events.push_back(QueuedEvent::Response {
            correlation_id: NULL_VALUE,
            relevant_id: NULL_VALUE,
            code: ControlResponseCode::Error,
            error_message: message.to_string(),
        });
    }

    /// Every request issued so far, in order.
    pub fn requests(&self) -> Vec<ArchiveRequest> {
        self.state.borrow().requests.clone()
    }

    fn record(&self, request: ArchiveRequest, result: Option<Result<i64, String>>, correlation_id: i64) {
        let mut state = self.state.borrow_mut();
        state.requests.push(request);

        if let Some(message) = state.fail_next.take() {
            state.pending_responses.push_back((correlation_id, Err(message)));
            return;
        }
        if let Some(result) = result {
            state.pending_responses.push_back((correlation_id, result));
        }
    }
}

impl ArchiveClient for FakeArchive {
    fn control_session_id(&self) -> i64 {
        self.state.borrow().control_session_id
    }

    fn get_stop_position(&mut self, recording_id: i64, correlation_id: i64) -> Result<bool, BackupError> {
        let scripted = self.state.borrow().stop_positions.get(&recording_id).copied();
        self.record(
            ArchiveRequest::GetStopPosition {
                recording_id,
                correlation_id,
            },
            scripted.map(Ok),
            correlation_id,
        );
        Ok(true)
    }

    fn replay(
        &mut self,
        recording_id: i64,
        start_position: i64,
        length: i64,
        channel: &str,
        stream_id: i32,
        correlation_id: i64,
    ) -> Result<bool, BackupError> {
        let scripted = self.state.borrow().replay_sessions.get(&recording_id).copied();
        self.record(
            ArchiveRequest::Replay {
                recording_id,
                start_position,
                length,
                channel: channel.to_string(),
                stream_id,
                correlation_id,
            },
            scripted.map(Ok),
            correlation_id,
        );
        Ok(true)
    }

    fn bounded_replay(
        &mut self,
        recording_id: i64,
        start_position: i64,
        length: i64,
        limit_counter_id: i32,
        channel: &str,
        stream_id: i32,
        correlation_id: i64,
    ) -> Result<bool, BackupError> {
        let scripted = self.state.borrow().replay_sessions.get(&recording_id).copied();
        self.record(
            ArchiveRequest::BoundedReplay {
                recording_id,
                start_position,
                length,
                limit_counter_id,
                channel: channel.to_string(),
                stream_id,
                correlation_id,
            },
            scripted.map(Ok),
            correlation_id,
        );
        Ok(true)
    }

    fn poll_response(&mut self, correlation_id: i64) -> Result<Option<i64>, BackupError> {
        let mut state = self.state.borrow_mut();
        loop {
            let matches = match state.pending_responses.front() {
                None => return Ok(None),
                Some((pending_correlation_id, _)) => *pending_correlation_id == correlation_id,
            };

            let (_, result) = state.pending_responses.pop_front().expect("front checked above");
            if !matches {
                continue;
            }

            return match result {
                Ok(relevant_id) => Ok(Some(relevant_id)),
                Err(message) => Err(BackupError::Archive {
                    correlation_id,
                    message,
                }),
            };
        }
    }

    fn start_recording(
        &mut self,
        channel: &str,
        stream_id: i32,
        source_location: SourceLocation,
        _auto_stop: bool,
    ) -> Result<i64, BackupError> {
        let mut state = self.state.borrow_mut();
        state.next_subscription_id += 1;
        let subscription_id = state.next_subscription_id;
        state.requests.push(ArchiveRequest::StartRecording {
            channel: channel.to_string(),
            stream_id,
            source_location,
        });
        Ok(subscription_id)
    }

    fn extend_recording(
        &mut self,
        recording_id: i64,
        channel: &str,
        stream_id: i32,
        source_location: SourceLocation,
        _auto_stop: bool,
    ) -> Result<i64, BackupError> {
        let mut state = self.state.borrow_mut();
        state.next_subscription_id += 1;
        let subscription_id = state.next_subscription_id;
        state.requests.push(ArchiveRequest::ExtendRecording {
            recording_id,
            channel: channel.to_string(),
            stream_id,
            source_location,
        });
        Ok(subscription_id)
    }

    fn stop_position(&mut self, recording_id: i64) -> Result<i64, BackupError> {
        self.state
            .borrow()
            .stop_positions
            .get(&recording_id)
            .copied()
            .ok_or_else(|| BackupError::Archive {
                correlation_id: NULL_VALUE,
                message: format!("unknown recording {}", recording_id),
            })
    }

    fn try_stop_recording(&mut self, subscription_id: i64) -> Result<(), BackupError> {
        self.state.borrow_mut().requests.push(ArchiveRequest::TryStopRecording { subscription_id });
        Ok(())
    }

    fn poll_signals(&mut self, consumer: &mut dyn RecordingEventConsumer, limit: usize) -> Result<usize, BackupError> {
        let mut count = 0;
        while count < limit {
            let event = match self.state.borrow_mut().events.pop_front() {
                Some(event) => event,
                None => break,
            };

            match event {
                QueuedEvent::Signal(signal) => consumer.on_signal(&signal),
                QueuedEvent::Response {
                    correlation_id,
                    relevant_id,
                    code,
                    error_message,
                } => consumer.on_response(correlation_id, relevant_id, code, &error_message),
            }
            count += 1;
        }
        Ok(count)
    }
}

struct PublicationState {
    channel: String,
    stream_id: i32,
    connected: bool,
    accept_offers: bool,
    frames: Vec<Bytes>,
    closed: bool,
}

/// Scripting view over one publication the agent opened.
#[derive(Clone)]
pub struct PublicationHandle {
    state: Rc<RefCell<PublicationState>>,
}

impl PublicationHandle {
    /// The channel the publication was opened on.
    pub fn channel(&self) -> String {
        self.state.borrow().channel.clone()
    }

    /// The stream id the publication was opened on.
    pub fn stream_id(&self) -> i32 {
        self.state.borrow().stream_id
    }

    /// Script whether the publication reports a connected subscriber.
    pub fn set_connected(&self, connected: bool) {
        self.state.borrow_mut().connected = connected;
    }

    /// Script whether offers are accepted.
    pub fn set_accept_offers(&self, accept: bool) {
        self.state.borrow_mut().accept_offers = accept;
    }

    /// Frames the agent offered so far.
    pub fn frames(&self) -> Vec<Bytes> {
        self.state.borrow().frames.clone()
    }

    /// Whether the agent dropped the publication.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

/// The agent-owned side of a publication.
pub struct FakePublication {
    state: Rc<RefCell<PublicationState>>,
}

impl Publication for FakePublication {
    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn try_offer(&mut self, frame: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.accept_offers {
            return false;
        }
        state.frames.push(Bytes::copy_from_slice(frame));
        true
    }
}

impl Drop for FakePublication {
    fn drop(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}

/// The agent-owned side of the consensus subscription.
pub struct FakeSubscription {
    shared: Rc<RefCell<ClusterState>>,
}

impl Subscription for FakeSubscription {
    fn poll(&mut self, fragment_limit: usize) -> Vec<Bytes> {
        let mut shared = self.shared.borrow_mut();
        let count = shared.inbound.len().min(fragment_limit);
        shared.inbound.drain(..count).collect()
    }
}

/// An in-flight connect yielding the next archive the test pushed.
pub struct FakeConnect {
    shared: Rc<RefCell<ClusterState>>,
}

impl PendingArchiveConnect for FakeConnect {
    type Archive = FakeArchive;

    fn poll(&mut self) -> Result<Option<FakeArchive>, BackupError> {
        Ok(self.shared.borrow_mut().pending_cluster_archives.pop_front())
    }
}

struct ClusterState {
    next_correlation_id: i64,
    inbound: VecDeque<Bytes>,
    publications: Vec<Rc<RefCell<PublicationState>>>,
    publications_connected_by_default: bool,
    backup_archive: FakeArchive,
    pending_cluster_archives: VecDeque<FakeArchive>,
    cluster_connects: Vec<ArchiveContext>,
    recording_counters: Vec<(i32, i32, i64)>,
    counter_values: HashMap<i32, i64>,
    unavailable: VecDeque<i32>,
    invoke_count: usize,
}

/// A scripted [`ClusterClient`].
///
/// Clone it before handing it to the agent; the clone shares all state.
#[derive(Clone)]
pub struct FakeCluster {
    shared: Rc<RefCell<ClusterState>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// Create a cluster whose local archive has control session id `1`.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(ClusterState {
                next_correlation_id: 0,
                inbound: VecDeque::new(),
                publications: Vec::new(),
                publications_connected_by_default: true,
                backup_archive: FakeArchive::new(1),
                pending_cluster_archives: VecDeque::new(),
                cluster_connects: Vec::new(),
                recording_counters: Vec::new(),
                counter_values: HashMap::new(),
                unavailable: VecDeque::new(),
                invoke_count: 0,
            })),
        }
    }

    /// The local backup archive.
    pub fn backup_archive(&self) -> FakeArchive {
        self.shared.borrow().backup_archive.clone()
    }

    /// Queue an archive for the next leader-archive connect to yield.
    pub fn push_cluster_archive(&self, archive: FakeArchive) {
        self.shared.borrow_mut().pending_cluster_archives.push_back(archive);
    }

    /// Contexts of every leader-archive connect the agent started.
    pub fn cluster_connects(&self) -> Vec<ArchiveContext> {
        self.shared.borrow().cluster_connects.clone()
    }

    /// Deliver a frame to the consensus subscription.
    pub fn deliver(&self, frame: Bytes) {
        self.shared.borrow_mut().inbound.push_back(frame);
    }

    /// Whether publications report connected as soon as they open.
    pub fn set_publications_connected_by_default(&self, connected: bool) {
        self.shared.borrow_mut().publications_connected_by_default = connected;
    }

    /// Number of publications the agent has opened so far.
    pub fn publication_count(&self) -> usize {
        self.shared.borrow().publications.len()
    }

    /// Scripting handle for the `index`-th publication opened.
    pub fn publication(&self, index: usize) -> PublicationHandle {
        PublicationHandle {
            state: self.shared.borrow().publications[index].clone(),
        }
    }

    /// Register a recording-position counter for a replay session.
    pub fn add_recording_counter(&self, session_id: i32, counter_id: i32, recording_id: i64, value: i64) {
        let mut shared = self.shared.borrow_mut();
        shared.recording_counters.push((session_id, counter_id, recording_id));
        shared.counter_values.insert(counter_id, value);
    }

    /// Script the value of a counter.
    pub fn set_counter_value(&self, counter_id: i32, value: i64) {
        self.shared.borrow_mut().counter_values.insert(counter_id, value);
    }

    /// Report a counter as gone from the registry.
    pub fn make_counter_unavailable(&self, counter_id: i32) {
        let mut shared = self.shared.borrow_mut();
        shared.recording_counters.retain(|(_, id, _)| *id != counter_id);
        shared.counter_values.remove(&counter_id);
        shared.unavailable.push_back(counter_id);
    }

    /// How many times the agent invoked the client conductor.
    pub fn invoke_count(&self) -> usize {
        self.shared.borrow().invoke_count
    }
}

impl ClusterClient for FakeCluster {
    type Publication = FakePublication;
    type Subscription = FakeSubscription;
    type Archive = FakeArchive;
    type ArchiveConnect = FakeConnect;

    fn invoke(&mut self) -> usize {
        self.shared.borrow_mut().invoke_count += 1;
        0
    }

    fn next_correlation_id(&mut self) -> i64 {
        let mut shared = self.shared.borrow_mut();
        shared.next_correlation_id += 1;
        shared.next_correlation_id
    }

    fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<FakePublication, BackupError> {
        let mut shared = self.shared.borrow_mut();
        let state = Rc::new(RefCell::new(PublicationState {
            channel: channel.to_string(),
            stream_id,
            connected: shared.publications_connected_by_default,
            accept_offers: true,
            frames: Vec::new(),
            closed: false,
        }));
        shared.publications.push(state.clone());
        Ok(FakePublication { state })
    }

    fn add_subscription(&mut self, _channel: &str, _stream_id: i32) -> Result<FakeSubscription, BackupError> {
        Ok(FakeSubscription {
            shared: self.shared.clone(),
        })
    }

    fn connect_archive(&mut self, _ctx: &ArchiveContext) -> Result<FakeArchive, BackupError> {
        Ok(self.shared.borrow().backup_archive.clone())
    }

    fn async_connect_archive(&mut self, ctx: &ArchiveContext) -> Result<FakeConnect, BackupError> {
        self.shared.borrow_mut().cluster_connects.push(ctx.clone());
        Ok(FakeConnect {
            shared: self.shared.clone(),
        })
    }

    fn find_recording_counter_by_session(&self, session_id: i32) -> Option<i32> {
        self.shared
            .borrow()
            .recording_counters
            .iter()
            .find(|(s, _, _)| *s == session_id)
            .map(|(_, counter_id, _)| *counter_id)
    }

    fn recording_id(&self, counter_id: i32) -> Option<i64> {
        self.shared
            .borrow()
            .recording_counters
            .iter()
            .find(|(_, id, _)| *id == counter_id)
            .map(|(_, _, recording_id)| *recording_id)
    }

    fn counter_value(&self, counter_id: i32) -> i64 {
        self.shared.borrow().counter_values.get(&counter_id).copied().unwrap_or(NULL_VALUE)
    }

    fn next_unavailable_counter(&mut self) -> Option<i32> {
        self.shared.borrow_mut().unavailable.pop_front()
    }
}
