/// A snapshot advertised by the leader in a backup response.
///
/// `service_id == -1` denotes the consensus-module snapshot; non-negative
/// values denote state-machine services. The recording id refers to the
/// advertising archive until the snapshot has been retrieved, after which
/// the locally assigned recording id is carried instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SnapshotDescriptor {
    /// Recording holding the snapshot stream.
    pub recording_id: i64,
    /// Leadership term the snapshot was taken in.
    pub leadership_term_id: i64,
    /// Base log position of that term.
    pub term_base_log_position: i64,
    /// Log position the snapshot covers up to.
    pub log_position: i64,
    /// Epoch-ms timestamp of the snapshot.
    pub timestamp: i64,
    /// Owning service, `-1` for the consensus module.
    pub service_id: i32,
}

/// A decoded `BackupResponse` consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BackupResponse {
    /// Correlation id echoing the originating `BackupQuery`.
    pub correlation_id: i64,
    /// Recording id of the leader's log.
    pub log_recording_id: i64,
    /// Leadership term id at the head of the leader's log.
    pub log_leadership_term_id: i64,
    /// Base log position of that term.
    pub log_term_base_log_position: i64,
    /// Most recent leadership term id known to the leader.
    pub last_leadership_term_id: i64,
    /// Base log position of the most recent term.
    pub last_term_base_log_position: i64,
    /// Counter id of the leader's commit position.
    pub commit_position_counter_id: i32,
    /// Member id of the current leader.
    pub leader_member_id: i32,
    /// Snapshot inventory offered by the leader.
    pub snapshots: Vec<SnapshotDescriptor>,
    /// Encoded member list, see `model::parse_members`.
    pub cluster_members: String,
}
