/// State changes of a recording, observed on an archive control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RecordingSignal {
    /// A recording started.
    Start,
    /// A recording stopped.
    Stop,
    /// An existing recording was extended.
    Extend,
    /// A recording is being replicated from another archive.
    Replicate,
    /// A recording caught up with its live stream.
    Sync,
    /// A recording was deleted.
    Delete,
}

/// Status code of an archive control response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ControlResponseCode {
    /// The request succeeded.
    Ok,
    /// The request failed; the response carries an error message.
    Error,
    /// The referenced recording does not exist.
    RecordingUnknown,
    /// The referenced subscription does not exist.
    SubscriptionUnknown,
}

/// A recording signal delivered on an archive control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingSignalEvent {
    /// Control session the signal belongs to.
    pub control_session_id: i64,
    /// Correlation id of the operation that caused the signal.
    pub correlation_id: i64,
    /// The recording the signal refers to.
    pub recording_id: i64,
    /// The subscription feeding the recording.
    pub subscription_id: i64,
    /// Recording position at the time of the signal.
    pub position: i64,
    /// What happened.
    pub signal: RecordingSignal,
}

/// Consumer of recording signals and stray control responses drained from an
/// archive control session.
pub trait RecordingEventConsumer {
    /// A recording signal arrived.
    fn on_signal(&mut self, event: &RecordingSignalEvent);

    /// A control response arrived on the same session.
    fn on_response(&mut self, correlation_id: i64, relevant_id: i64, code: ControlResponseCode, error_message: &str) {
        let _ = (correlation_id, relevant_id, code, error_message);
    }
}
