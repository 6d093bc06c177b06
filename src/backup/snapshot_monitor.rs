use crate::cluster::ControlResponseCode;
use crate::cluster::RecordingEventConsumer;
use crate::cluster::RecordingSignal;
use crate::cluster::RecordingSignalEvent;
use crate::error::BackupError;

/// Watches the recording signals of one snapshot transfer.
///
/// The monitor expects the local recording to start at position `0` and to
/// stop exactly at the stop position previously measured on the leader.
/// Anything else, and any archive error response observed while the transfer
/// runs, latches an error that [`error_check`](Self::error_check) raises at
/// the next poll.
#[derive(Debug)]
pub struct SnapshotRetrieveMonitor {
    expected_stop_position: i64,
    recording_id: Option<i64>,
    is_done: bool,
    error: Option<String>,
}

impl SnapshotRetrieveMonitor {
    /// Monitor a transfer that must stop at `expected_stop_position`.
    pub fn new(expected_stop_position: i64) -> Self {
        Self {
            expected_stop_position,
            recording_id: None,
            is_done: false,
            error: None,
        }
    }

    /// Whether the recording stopped at the expected position.
    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// The locally assigned recording id, once the start signal was seen.
    pub fn recording_id(&self) -> Option<i64> {
        self.recording_id
    }

    /// Raise any latched error.
    pub fn error_check(&self) -> Result<(), BackupError> {
        match &self.error {
            Some(message) => Err(BackupError::SnapshotRetrieve(message.clone())),
            None => Ok(()),
        }
    }
}

impl RecordingEventConsumer for SnapshotRetrieveMonitor {
    fn on_signal(&mut self, event: &RecordingSignalEvent) {
        match event.signal {
            RecordingSignal::Start if self.recording_id.is_none() => {
                if event.position != 0 {
                    self.error = Some(format!("unexpected start position expected = 0, actual = {}", event.position));
                } else {
                    self.recording_id = Some(event.recording_id);
                }
            }
            RecordingSignal::Stop if self.recording_id == Some(event.recording_id) => {
                if event.position == self.expected_stop_position {
                    self.is_done = true;
                } else {
                    self.error = Some(format!(
                        "unexpected stop position expected = {}, actual = {}",
                        self.expected_stop_position, event.position
                    ));
                }
            }
            _ => {}
        }
    }

    fn on_response(&mut self, _correlation_id: i64, _relevant_id: i64, code: ControlResponseCode, error_message: &str) {
        if code == ControlResponseCode::Error {
            self.error = Some(error_message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SnapshotRetrieveMonitor;
    use crate::cluster::ControlResponseCode;
    use crate::cluster::RecordingEventConsumer;
    use crate::cluster::RecordingSignal;
    use crate::cluster::RecordingSignalEvent;

    fn signal(recording_id: i64, position: i64, signal: RecordingSignal) -> RecordingSignalEvent {
        RecordingSignalEvent {
            control_session_id: 1,
            correlation_id: 1,
            recording_id,
            subscription_id: 1,
            position,
            signal,
        }
    }

    #[test]
    fn test_start_then_stop_at_expected_position() {
        let mut monitor = SnapshotRetrieveMonitor::new(4096);

        monitor.on_signal(&signal(100, 0, RecordingSignal::Start));
        assert_eq!(Some(100), monitor.recording_id());
        assert!(!monitor.is_done());

        monitor.on_signal(&signal(100, 4096, RecordingSignal::Stop));
        assert!(monitor.is_done());
        assert!(monitor.error_check().is_ok());
    }

    #[test]
    fn test_start_at_non_zero_position_is_fatal() {
        let mut monitor = SnapshotRetrieveMonitor::new(4096);

        monitor.on_signal(&signal(100, 64, RecordingSignal::Start));

        let err = monitor.error_check().unwrap_err();
        assert!(err.to_string().contains("unexpected start position"));
    }

    #[test]
    fn test_stop_at_wrong_position_is_fatal() {
        let mut monitor = SnapshotRetrieveMonitor::new(4096);

        monitor.on_signal(&signal(100, 0, RecordingSignal::Start));
        monitor.on_signal(&signal(100, 2048, RecordingSignal::Stop));

        assert!(!monitor.is_done());
        let err = monitor.error_check().unwrap_err();
        assert!(err.to_string().contains("unexpected stop position expected = 4096, actual = 2048"));
    }

    #[test]
    fn test_stop_position_beyond_2_gib_is_not_truncated() {
        let expected = 3 * 1024 * 1024 * 1024_i64;
        let mut monitor = SnapshotRetrieveMonitor::new(expected);

        monitor.on_signal(&signal(100, 0, RecordingSignal::Start));
        monitor.on_signal(&signal(100, expected, RecordingSignal::Stop));

        assert!(monitor.is_done());
        assert!(monitor.error_check().is_ok());
    }

    #[test]
    fn test_signals_for_other_recordings_are_ignored() {
        let mut monitor = SnapshotRetrieveMonitor::new(4096);

        monitor.on_signal(&signal(100, 0, RecordingSignal::Start));
        monitor.on_signal(&signal(999, 2048, RecordingSignal::Stop));

        assert!(!monitor.is_done());
        assert!(monitor.error_check().is_ok());
    }

    #[test]
    fn test_error_response_latches() {
        let mut monitor = SnapshotRetrieveMonitor::new(4096);

        monitor.on_response(1, 0, ControlResponseCode::Ok, "");
        assert!(monitor.error_check().is_ok());

        monitor.on_response(2, 0, ControlResponseCode::Error, "recording unknown");
        let err = monitor.error_check().unwrap_err();
        assert!(err.to_string().contains("recording unknown"));
    }
}
