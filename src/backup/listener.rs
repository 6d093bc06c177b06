use crate::error::BackupError;
use crate::model::ClusterMember;
use crate::model::SnapshotDescriptor;
use crate::recording_log::RecordingLog;

/// Observer of backup progress.
///
/// All hooks default to no-ops; implement the ones of interest. Hooks are
/// invoked from the agent's duty cycle and must not block or panic back into
/// it.
pub trait ClusterBackupEventsListener {
    /// The agent entered the query state and will probe for a leader.
    fn on_backup_query(&mut self) {}

    /// A backup response was accepted.
    fn on_backup_response(
        &mut self,
        cluster_members: &[ClusterMember],
        leader: &ClusterMember,
        snapshots_to_retrieve: &[SnapshotDescriptor],
    ) {
        let _ = (cluster_members, leader, snapshots_to_retrieve);
    }

    /// New terms or snapshots were appended to the recording log.
    fn on_updated_recording_log(&mut self, recording_log: &RecordingLog, snapshots_retrieved: &[SnapshotDescriptor]) {
        let _ = (recording_log, snapshots_retrieved);
    }

    /// The live-log position counter advanced.
    fn on_live_log_progress(&mut self, recording_id: i64, recording_counter_id: i32, log_position: i64) {
        let _ = (recording_id, recording_counter_id, log_position);
    }

    /// The backup hit a failure and will reset.
    fn on_possible_failure(&mut self, error: &BackupError) {
        let _ = error;
    }
}
