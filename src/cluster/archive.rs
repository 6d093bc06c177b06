use crate::cluster::signal::RecordingEventConsumer;
use crate::error::BackupError;

/// Where the archive should record a stream from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SourceLocation {
    /// The stream originates on the archive's own host.
    Local,
    /// The stream is received over the network.
    Remote,
}

/// Connection parameters of an archive control session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ArchiveContext {
    /// Channel control requests are sent on.
    pub control_request_channel: String,
    /// Stream id for control requests.
    pub control_request_stream_id: i32,
    /// Channel control responses are received on.
    pub control_response_channel: String,
    /// Stream id for control responses.
    pub control_response_stream_id: i32,
}

impl Default for ArchiveContext {
    fn default() -> Self {
        Self {
            control_request_channel: "backup:udp?endpoint=localhost:8010".to_string(),
            control_request_stream_id: 10,
            control_response_channel: "backup:udp?endpoint=localhost:0".to_string(),
            control_response_stream_id: 20,
        }
    }
}

impl ArchiveContext {
    /// Set the control request channel.
    pub fn control_request_channel(mut self, channel: impl ToString) -> Self {
        self.control_request_channel = channel.to_string();
        self
    }

    /// Set the control request stream id.
    pub fn control_request_stream_id(mut self, stream_id: i32) -> Self {
        self.control_request_stream_id = stream_id;
        self
    }

    /// Set the control response channel.
    pub fn control_response_channel(mut self, channel: impl ToString) -> Self {
        self.control_response_channel = channel.to_string();
        self
    }

    /// Set the control response stream id.
    pub fn control_response_stream_id(mut self, stream_id: i32) -> Self {
        self.control_response_stream_id = stream_id;
        self
    }
}

/// An archive connect in flight; polled once per duty cycle.
pub trait PendingArchiveConnect {
    /// The connected client type.
    type Archive;

    /// Poll the connect. Returns the client once the control session is
    /// established, `None` while still connecting.
    fn poll(&mut self) -> Result<Option<Self::Archive>, BackupError>;
}

/// A connected archive control session.
///
/// Request methods return `Ok(false)` when the request could not be sent
/// this cycle (backpressure); the caller retries on its next duty cycle. At
/// most one control request may be outstanding per connection; the agent
/// enforces this with the correlation id it carries in its state.
pub trait ArchiveClient {
    /// Id of this control session.
    fn control_session_id(&self) -> i64;

    /// Request the stop position of a recording.
    fn get_stop_position(&mut self, recording_id: i64, correlation_id: i64) -> Result<bool, BackupError>;

    /// Request a replay of `recording_id` on `channel`/`stream_id`.
    fn replay(
        &mut self,
        recording_id: i64,
        start_position: i64,
        length: i64,
        channel: &str,
        stream_id: i32,
        correlation_id: i64,
    ) -> Result<bool, BackupError>;

    /// Request a replay whose tail follows the counter `limit_counter_id`,
    /// so it never reads past committed data.
    #[allow(clippy::too_many_arguments)]
    fn bounded_replay(
        &mut self,
        recording_id: i64,
        start_position: i64,
        length: i64,
        limit_counter_id: i32,
        channel: &str,
        stream_id: i32,
        correlation_id: i64,
    ) -> Result<bool, BackupError>;

    /// Poll for the control response matching `correlation_id`.
    ///
    /// Returns the response's relevant id once it arrives, `None` while
    /// still pending. A response carrying an error code is raised as
    /// [`BackupError::Archive`]; responses for other correlation ids or
    /// sessions are discarded.
    fn poll_response(&mut self, correlation_id: i64) -> Result<Option<i64>, BackupError>;

    /// Start recording a channel; returns the recording subscription id.
    fn start_recording(
        &mut self,
        channel: &str,
        stream_id: i32,
        source_location: SourceLocation,
        auto_stop: bool,
    ) -> Result<i64, BackupError>;

    /// Extend an existing recording with a new stream; returns the recording
    /// subscription id.
    fn extend_recording(
        &mut self,
        recording_id: i64,
        channel: &str,
        stream_id: i32,
        source_location: SourceLocation,
        auto_stop: bool,
    ) -> Result<i64, BackupError>;

    /// The current stop position of a recording held by this archive.
    fn stop_position(&mut self, recording_id: i64) -> Result<i64, BackupError>;

    /// Stop the recording behind `subscription_id` if it is still running.
    fn try_stop_recording(&mut self, subscription_id: i64) -> Result<(), BackupError>;

    /// Drain recording signals (and stray control responses) scoped to this
    /// control session into `consumer`, up to `limit` events.
    fn poll_signals(&mut self, consumer: &mut dyn RecordingEventConsumer, limit: usize) -> Result<usize, BackupError>;
}
