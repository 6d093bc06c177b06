//! The backup agent's state machine.

use std::fmt;

use crate::backup::SnapshotRetrieveMonitor;

/// Sub-steps of retrieving one snapshot from the leader archive.
#[derive(Debug)]
pub enum RetrieveStep {
    /// A replay of the snapshot recording must be requested.
    Request,
    /// The replay request is in flight.
    AwaitSession {
        /// Correlation id of the replay request.
        correlation_id: i64,
    },
    /// The replayed stream is being recorded locally; signals are monitored
    /// until the recording stops at the expected position.
    Monitor(SnapshotRetrieveMonitor),
}

/// Sub-steps of establishing the live-log replay.
#[derive(Debug)]
pub enum ReplayStep {
    /// A bounded replay of the leader log must be requested.
    Request,
    /// The bounded-replay request is in flight.
    AwaitSession {
        /// Correlation id of the bounded-replay request.
        correlation_id: i64,
    },
    /// The local recording has started; waiting for its position counter to
    /// appear in the counters registry.
    AwaitRecordingCounter {
        /// Session id of the replay feeding the recording.
        session_id: i32,
    },
}

/// State of the backup agent, dispatched once per duty cycle.
///
/// Long-lived resources (publication, archives, recording log) are owned by
/// the agent; a variant only carries the data local to its phase, so an
/// in-flight request exists exactly as long as the state that issued it.
#[derive(Debug, Default)]
pub enum AgentState {
    /// Opening the recording log before the first (or next) backup attempt.
    #[default]
    Init,

    /// Probing consensus endpoints for a backup response.
    BackupQuery {
        /// Correlation id of the outstanding query, if one was sent.
        correlation_id: Option<i64>,
        /// When the current endpoint was last queried; rotation triggers
        /// once the response timeout elapses.
        last_query_ms: i64,
    },

    /// Measuring the stop position of every snapshot to be retrieved.
    SnapshotLengthRetrieve {
        /// Index into the pending snapshot list.
        cursor: usize,
        /// Correlation id of the outstanding stop-position query.
        in_flight: Option<i64>,
    },

    /// Replaying pending snapshots into the local archive, one at a time.
    SnapshotRetrieve {
        /// Index into the pending snapshot list.
        cursor: usize,
        /// Where the current snapshot's transfer stands.
        step: RetrieveStep,
    },

    /// Establishing a bounded replay of the leader's committed log.
    LiveLogReplay {
        /// Where the replay establishment stands.
        step: ReplayStep,
    },

    /// Applying new terms and snapshots to the recording log.
    UpdateRecordingLog,

    /// Steady state: tracking live-log progress until the next query is due.
    BackingUp,

    /// Tearing down after a failure and waiting out the cool-down.
    ResetBackup {
        /// Deadline after which the agent restarts; `None` until the first
        /// dispatch has torn the session down.
        cool_down_deadline_ms: Option<i64>,
    },
}

impl AgentState {
    /// Stable ordinal published through the state counter.
    pub fn code(&self) -> i64 {
        match self {
            AgentState::Init => 0,
            AgentState::BackupQuery { .. } => 1,
            AgentState::SnapshotLengthRetrieve { .. } => 2,
            AgentState::SnapshotRetrieve { .. } => 3,
            AgentState::LiveLogReplay { .. } => 4,
            AgentState::UpdateRecordingLog => 5,
            AgentState::BackingUp => 6,
            AgentState::ResetBackup { .. } => 7,
        }
    }

    /// The state name behind a counter ordinal.
    pub fn name_of(code: i64) -> &'static str {
        match code {
            0 => "INIT",
            1 => "BACKUP_QUERY",
            2 => "SNAPSHOT_LENGTH_RETRIEVE",
            3 => "SNAPSHOT_RETRIEVE",
            4 => "LIVE_LOG_REPLAY",
            5 => "UPDATE_RECORDING_LOG",
            6 => "BACKING_UP",
            7 => "RESET_BACKUP",
            _ => "UNKNOWN",
        }
    }

    /// Human-readable state name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Init => "INIT",
            AgentState::BackupQuery { .. } => "BACKUP_QUERY",
            AgentState::SnapshotLengthRetrieve { .. } => "SNAPSHOT_LENGTH_RETRIEVE",
            AgentState::SnapshotRetrieve { .. } => "SNAPSHOT_RETRIEVE",
            AgentState::LiveLogReplay { .. } => "LIVE_LOG_REPLAY",
            AgentState::UpdateRecordingLog => "UPDATE_RECORDING_LOG",
            AgentState::BackingUp => "BACKING_UP",
            AgentState::ResetBackup { .. } => "RESET_BACKUP",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
