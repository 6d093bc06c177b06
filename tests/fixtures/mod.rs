//! Fixtures for driving a backup agent against the scripted cluster fakes.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use cluster_backup::codec;
use cluster_backup::codec::encode_backup_response;
use cluster_backup::model::BackupResponse;
use cluster_backup::model::SnapshotDescriptor;
use cluster_backup::testing::FakeCluster;
use cluster_backup::testing::ManualClock;
use cluster_backup::Agent;
use cluster_backup::ArchiveContext;
use cluster_backup::BackupError;
use cluster_backup::ClusterBackupAgent;
use cluster_backup::ClusterBackupEventsListener;
use cluster_backup::ClusterMember;
use cluster_backup::Config;

/// The agent under test plus every handle needed to script its world.
pub struct Harness {
    pub agent: ClusterBackupAgent<FakeCluster, Rc<ManualClock>>,
    pub cluster: FakeCluster,
    pub clock: Rc<ManualClock>,
    pub events: Rc<RefCell<Vec<String>>>,
    pub cluster_dir: tempfile::TempDir,
}

/// Listener that records every hook invocation as a line of text.
struct RecordingListener {
    events: Rc<RefCell<Vec<String>>>,
}

impl ClusterBackupEventsListener for RecordingListener {
    fn on_backup_query(&mut self) {
        self.events.borrow_mut().push("backup-query".to_string());
    }

    fn on_backup_response(
        &mut self,
        cluster_members: &[ClusterMember],
        leader: &ClusterMember,
        snapshots_to_retrieve: &[SnapshotDescriptor],
    ) {
        self.events.borrow_mut().push(format!(
            "backup-response: members={} leader={} snapshots={}",
            cluster_members.len(),
            leader.id,
            snapshots_to_retrieve.len()
        ));
    }

    fn on_updated_recording_log(
        &mut self,
        _recording_log: &cluster_backup::RecordingLog,
        snapshots_retrieved: &[SnapshotDescriptor],
    ) {
        self.events.borrow_mut().push(format!("recording-log-updated: snapshots={}", snapshots_retrieved.len()));
    }

    fn on_live_log_progress(&mut self, recording_id: i64, recording_counter_id: i32, log_position: i64) {
        self.events.borrow_mut().push(format!(
            "live-log-progress: recordingId={} counterId={} position={}",
            recording_id, recording_counter_id, log_position
        ));
    }

    fn on_possible_failure(&mut self, error: &BackupError) {
        self.events.borrow_mut().push(format!("possible-failure: {}", error));
    }
}

/// Initialize tracing output for a test; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").with_test_writer().try_init();
}

/// The endpoints configured by [`harness`].
pub const ENDPOINTS: [&str; 2] = ["node0:9010", "node1:9010"];

/// Build a config with short, test-friendly deadlines (in ms: response 100,
/// query interval 1000, progress 500, cool-down 200).
pub fn test_config(cluster_dir: &std::path::Path) -> Config {
    Config {
        cluster_consensus_endpoints: ENDPOINTS.join(","),
        cluster_dir: cluster_dir.to_path_buf(),
        cluster_backup_response_timeout_ns: 100 * 1_000_000,
        cluster_backup_interval_ns: 1_000 * 1_000_000,
        cluster_backup_progress_timeout_ns: 500 * 1_000_000,
        cluster_backup_cool_down_interval_ns: 200 * 1_000_000,
        ..Config::default()
    }
}

/// Build a started agent over fresh fakes.
pub fn harness() -> anyhow::Result<Harness> {
    let cluster_dir = tempfile::tempdir()?;
    let config = test_config(cluster_dir.path());
    harness_with(config, cluster_dir)
}

/// Build a started agent with a custom config; `cluster_dir` keeps the
/// config's directory alive.
pub fn harness_with(config: Config, cluster_dir: tempfile::TempDir) -> anyhow::Result<Harness> {
    init_tracing();

    let cluster = FakeCluster::new();
    let clock = Rc::new(ManualClock::new(1_000));
    let events = Rc::new(RefCell::new(Vec::new()));

    let mut agent = ClusterBackupAgent::new(
        config,
        ArchiveContext::default(),
        cluster.clone(),
        clock.clone(),
        Some(Box::new(RecordingListener { events: events.clone() })),
    )?;
    agent.on_start()?;

    Ok(Harness {
        agent,
        cluster,
        clock,
        events,
        cluster_dir,
    })
}

impl Harness {
    /// Advance the clock one millisecond and run one duty cycle, asserting
    /// the state-counter law afterwards.
    pub fn step(&mut self) -> Result<usize, BackupError> {
        self.clock.advance(1);
        let res = self.agent.do_work();
        assert_eq!(
            self.agent.state_code(),
            self.agent.state_counter().get(),
            "state counter must equal the state after do_work"
        );
        res
    }

    /// Run `n` duty cycles, failing the test on any error.
    pub fn steps(&mut self, n: usize) -> anyhow::Result<usize> {
        let mut work = 0;
        for _ in 0..n {
            work += self.step()?;
        }
        Ok(work)
    }

    /// The correlation id of the last backup query offered on publication
    /// `index`.
    pub fn last_query_correlation_id(&self, index: usize) -> anyhow::Result<i64> {
        let frames = self.cluster.publication(index).frames();
        let frame = frames.last().expect("no query frame was offered");
        Ok(codec::decode_backup_query(frame)?.correlation_id)
    }

    /// Deliver a leader response frame.
    pub fn deliver_response(&self, response: &BackupResponse) {
        self.cluster.deliver(encode_backup_response(response));
    }
}

/// A one-snapshot leader response matching the cold-start scenario: log
/// recording 11 in term 3, one consensus-module snapshot in recording 10
/// covering position 4096, leader member 0 of 2.
pub fn leader_response(correlation_id: i64) -> BackupResponse {
    BackupResponse {
        correlation_id,
        log_recording_id: 11,
        log_leadership_term_id: 3,
        log_term_base_log_position: 0,
        last_leadership_term_id: 3,
        last_term_base_log_position: 0,
        commit_position_counter_id: 42,
        leader_member_id: 0,
        snapshots: vec![SnapshotDescriptor {
            recording_id: 10,
            leadership_term_id: 3,
            term_base_log_position: 0,
            log_position: 4096,
            timestamp: 100,
            service_id: -1,
        }],
        cluster_members: members_string(),
    }
}

/// Two members, ids 0 and 1, with distinct archive endpoints.
pub fn members_string() -> String {
    "0,node0:20000,node0:9010,node0:20002,node0:20003,node0:8010|\
     1,node1:20000,node1:9010,node1:20002,node1:20003,node1:8010"
        .to_string()
}

/// Recording signal helper.
pub fn recording_signal(
    recording_id: i64,
    position: i64,
    signal: cluster_backup::cluster::RecordingSignal,
) -> cluster_backup::cluster::RecordingSignalEvent {
    cluster_backup::cluster::RecordingSignalEvent {
        control_session_id: 1,
        correlation_id: 0,
        recording_id,
        subscription_id: 0,
        position,
        signal,
    }
}

/// Frame with a valid header but an unknown template id.
pub fn unknown_template_frame() -> Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::new();
    buf.put_u16_le(0);
    buf.put_u16_le(9999);
    buf.put_u16_le(codec::SCHEMA_ID);
    buf.put_u16_le(codec::SCHEMA_VERSION);
    buf.freeze()
}

/// Frame carrying a foreign schema id.
pub fn foreign_schema_frame() -> Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::new();
    buf.put_u16_le(0);
    buf.put_u16_le(codec::TEMPLATE_BACKUP_RESPONSE);
    buf.put_u16_le(codec::SCHEMA_ID + 1);
    buf.put_u16_le(codec::SCHEMA_VERSION);
    buf.freeze()
}
