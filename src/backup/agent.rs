//! The backup agent's duty cycle and state dispatch.

use std::error::Error;

use validit::Valid;
use validit::Validate;

use crate::agent::Agent;
use crate::backup::listener::ClusterBackupEventsListener;
use crate::backup::snapshot_monitor::SnapshotRetrieveMonitor;
use crate::channel::ChannelUri;
use crate::channel::ENDPOINT_PARAM_NAME;
use crate::channel::SESSION_ID_PARAM_NAME;
use crate::cluster::ArchiveClient;
use crate::cluster::ArchiveContext;
use crate::cluster::ClusterClient;
use crate::cluster::EpochClock;
use crate::cluster::PendingArchiveConnect;
use crate::cluster::Publication;
use crate::cluster::SourceLocation;
use crate::cluster::Subscription;
use crate::codec::decode_backup_response;
use crate::codec::encode_backup_query;
use crate::codec::protocol_semantic_version;
use crate::codec::BackupQuery;
use crate::codec::MessageHeader;
use crate::codec::SCHEMA_ID;
use crate::codec::TEMPLATE_BACKUP_RESPONSE;
use crate::config::Config;
use crate::counters::Counter;
use crate::counters::NULL_COUNTER_ID;
use crate::counters::NULL_LENGTH;
use crate::counters::NULL_POSITION;
use crate::counters::NULL_TIMESTAMP;
use crate::counters::NULL_VALUE;
use crate::error::BackupError;
use crate::error::StorageVerb;
use crate::mark_file::MarkFile;
use crate::model::find_member;
use crate::model::parse_members;
use crate::model::BackupResponse;
use crate::model::ClusterMember;
use crate::model::SnapshotDescriptor;
use crate::recording_log::RecordingLog;
use crate::state::AgentState;
use crate::state::ReplayStep;
use crate::state::RetrieveStep;

/// Frames polled from the consensus subscription, and recording signals
/// drained from an archive control session, per duty cycle.
const FRAGMENT_POLL_LIMIT: usize = 10;

/// Media the catch-up replay traffic arrives over.
const CATCHUP_CHANNEL_TEMPLATE: &str = "backup:udp";

/// A term entry decided from a backup response, pending its append to the
/// recording log once the live recording it will be mapped to exists.
#[derive(Debug, Clone, Copy)]
struct PendingTermEntry {
    leadership_term_id: i64,
    term_base_log_position: i64,
    timestamp: i64,
}

/// Bookkeeping of one snapshot retrieval round.
///
/// `lengths[i]` is the expected stop position of `to_retrieve[i]` and is
/// filled in cursor order; `retrieved` carries the same descriptors with the
/// locally assigned recording ids.
#[derive(Debug, Default)]
struct RetrieveSession {
    to_retrieve: Vec<SnapshotDescriptor>,
    lengths: Vec<i64>,
    retrieved: Vec<SnapshotDescriptor>,
}

impl Validate for RetrieveSession {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        validit::less_equal!(self.lengths.len(), self.to_retrieve.len());
        validit::less_equal!(self.retrieved.len(), self.to_retrieve.len());
        Ok(())
    }
}

/// Single-threaded agent maintaining an off-cluster replica of a consensus
/// cluster.
///
/// The agent owns every resource it creates: the recording log, the local
/// and leader archive connections, and the consensus publication. State is
/// dispatched by pattern match once per [`do_work`](Agent::do_work); any
/// failure is reported to the optional events listener, diverts the state
/// machine to `RESET_BACKUP`, and is re-raised to the caller, which keeps
/// invoking `do_work` to resume after the cool-down.
pub struct ClusterBackupAgent<M, C>
where
    M: ClusterClient,
    C: EpochClock,
{
    client: M,
    clock: C,
    listener: Option<Box<dyn ClusterBackupEventsListener>>,

    config: Config,
    archive_ctx: ArchiveContext,
    consensus_endpoints: Vec<String>,
    response_timeout_ms: i64,
    query_interval_ms: i64,
    progress_timeout_ms: i64,
    cool_down_interval_ms: i64,

    mark_file: MarkFile,
    state: AgentState,
    state_counter: Counter,
    live_log_position_counter: Counter,
    next_query_deadline_ms_counter: Counter,

    recording_log: Option<RecordingLog>,
    backup_archive: Option<M::Archive>,
    consensus_subscription: M::Subscription,
    consensus_publication: Option<M::Publication>,
    cluster_archive: Option<M::Archive>,
    cluster_archive_connect: Option<M::ArchiveConnect>,

    cluster_members: Vec<ClusterMember>,
    leader_member: Option<ClusterMember>,
    leader_log_entry: Option<PendingTermEntry>,
    leader_last_term_entry: Option<PendingTermEntry>,
    leader_log_recording_id: Option<i64>,
    leader_commit_position_counter_id: Option<i32>,

    session: Valid<RetrieveSession>,
    endpoint_cursor: Option<usize>,

    time_of_last_tick_ms: i64,
    time_of_last_progress_ms: i64,

    live_log_replay_subscription_id: Option<i64>,
    live_log_recording_id: Option<i64>,
    live_log_rec_counter_id: Option<i32>,
}

impl<M, C> ClusterBackupAgent<M, C>
where
    M: ClusterClient,
    C: EpochClock,
{
    /// Create an agent over `client`, validating `config` first.
    ///
    /// The consensus subscription is opened here; archives are connected in
    /// [`on_start`](Agent::on_start).
    pub fn new(
        config: Config,
        archive_ctx: ArchiveContext,
        mut client: M,
        clock: C,
        listener: Option<Box<dyn ClusterBackupEventsListener>>,
    ) -> Result<Self, BackupError> {
        let config = config.validate()?;

        std::fs::create_dir_all(&config.cluster_dir)
            .map_err(|e| BackupError::storage(StorageVerb::Open, config.cluster_dir.display(), &e))?;
        let mark_file = MarkFile::create(&config.cluster_dir)?;

        let consensus_subscription = client.add_subscription(&config.consensus_channel, config.consensus_stream_id)?;

        let consensus_endpoints = config.consensus_endpoints();
        let response_timeout_ms = config.response_timeout_ms();
        let query_interval_ms = config.query_interval_ms();
        let progress_timeout_ms = config.progress_timeout_ms();
        let cool_down_interval_ms = config.cool_down_interval_ms();

        Ok(Self {
            client,
            clock,
            listener,
            config,
            archive_ctx,
            consensus_endpoints,
            response_timeout_ms,
            query_interval_ms,
            progress_timeout_ms,
            cool_down_interval_ms,
            mark_file,
            state: AgentState::Init,
            state_counter: Counter::new(AgentState::Init.code()),
            live_log_position_counter: Counter::new(NULL_VALUE),
            next_query_deadline_ms_counter: Counter::new(0),
            recording_log: None,
            backup_archive: None,
            consensus_subscription,
            consensus_publication: None,
            cluster_archive: None,
            cluster_archive_connect: None,
            cluster_members: Vec::new(),
            leader_member: None,
            leader_log_entry: None,
            leader_last_term_entry: None,
            leader_log_recording_id: None,
            leader_commit_position_counter_id: None,
            session: Valid::new(RetrieveSession::default()),
            endpoint_cursor: None,
            time_of_last_tick_ms: 0,
            time_of_last_progress_ms: 0,
            live_log_replay_subscription_id: None,
            live_log_recording_id: None,
            live_log_rec_counter_id: None,
        })
    }

    /// The current state.
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Ordinal of the current state, as published through the state counter.
    pub fn state_code(&self) -> i64 {
        self.state.code()
    }

    /// Handle to the state counter.
    pub fn state_counter(&self) -> Counter {
        self.state_counter.clone()
    }

    /// Handle to the live-log position counter.
    pub fn live_log_position_counter(&self) -> Counter {
        self.live_log_position_counter.clone()
    }

    /// Handle to the next-query deadline counter, in epoch milliseconds.
    pub fn next_query_deadline_ms_counter(&self) -> Counter {
        self.next_query_deadline_ms_counter.clone()
    }

    /// The leader the backup is currently replicating from, if known.
    pub fn leader_member(&self) -> Option<&ClusterMember> {
        self.leader_member.as_ref()
    }

    /// Members of the backed-up cluster from the last accepted response.
    pub fn cluster_members(&self) -> &[ClusterMember] {
        &self.cluster_members
    }

    /// The local recording the leader log is replicated into, once known.
    pub fn live_log_recording_id(&self) -> Option<i64> {
        self.live_log_recording_id
    }

    /// A counter the agent depends on became unavailable.
    ///
    /// Losing the live-log recording counter means the local recording is no
    /// longer advancing; the agent reports a warning and resets.
    pub fn on_unavailable_counter(&mut self, counter_id: i32, now_ms: i64) {
        if Some(counter_id) == self.live_log_rec_counter_id {
            tracing::warn!("live log recording counter {} became unavailable; resetting", counter_id);
            if let Some(listener) = self.listener.as_deref_mut() {
                listener.on_possible_failure(&BackupError::CounterUnavailable);
            }
            self.set_state(
                AgentState::ResetBackup {
                    cool_down_deadline_ms: None,
                },
                now_ms,
            );
        }
    }

    /// Tear down the current backup session.
    ///
    /// Owning fields are moved out before the resources are dropped, so a
    /// re-entrant call observes them already cleared; calling `reset` twice
    /// leaves the agent in the same observable state as calling it once.
    pub fn reset(&mut self) {
        tracing::debug!("resetting backup session");

        self.cluster_members.clear();
        self.leader_member = None;
        self.session.lengths.clear();
        self.session.retrieved.clear();
        self.session.to_retrieve.clear();
        self.leader_log_entry = None;
        self.leader_last_term_entry = None;
        self.endpoint_cursor = None;
        self.leader_log_recording_id = None;
        self.leader_commit_position_counter_id = None;
        self.live_log_rec_counter_id = None;
        self.live_log_recording_id = None;
        self.live_log_replay_subscription_id = None;

        let recording_log = self.recording_log.take();
        let publication = self.consensus_publication.take();
        let cluster_archive = self.cluster_archive.take();
        let cluster_archive_connect = self.cluster_archive_connect.take();

        drop(recording_log);
        drop(publication);
        drop(cluster_archive);
        drop(cluster_archive_connect);
    }

    fn set_state(&mut self, next: AgentState, now_ms: i64) {
        let from_code = self.state.code();
        self.state = next;
        self.after_transition(from_code, now_ms);
    }

    fn after_transition(&mut self, from_code: i64, _now_ms: i64) {
        let to_code = self.state.code();
        if from_code == to_code {
            return;
        }

        tracing::debug!("state {} -> {}", AgentState::name_of(from_code), self.state);
        self.state_counter.set_release(to_code);

        if matches!(self.state, AgentState::BackupQuery { .. }) {
            if let Some(listener) = self.listener.as_deref_mut() {
                listener.on_backup_query();
            }
        }
    }

    fn init(&mut self, now_ms: i64) -> Result<usize, BackupError> {
        self.recording_log = None;
        self.recording_log = Some(RecordingLog::open(&self.config.cluster_dir)?);
        self.time_of_last_progress_ms = now_ms;
        self.set_state(
            AgentState::BackupQuery {
                correlation_id: None,
                last_query_ms: 0,
            },
            now_ms,
        );
        Ok(1)
    }

    fn poll_and_dispatch(&mut self, now_ms: i64) -> Result<usize, BackupError> {
        let mut work_count = 0;

        let frames = self.consensus_subscription.poll(FRAGMENT_POLL_LIMIT);
        work_count += frames.len();
        for frame in frames {
            self.on_fragment(&frame, now_ms)?;
        }

        let state = std::mem::take(&mut self.state);
        let from_code = state.code();
        let (next, work) = match state {
            AgentState::Init => (AgentState::Init, 0),
            AgentState::BackupQuery {
                correlation_id,
                last_query_ms,
            } => self.backup_query(correlation_id, last_query_ms, now_ms)?,
            AgentState::SnapshotLengthRetrieve { cursor, in_flight } => {
                self.snapshot_length_retrieve(cursor, in_flight, now_ms)?
            }
            AgentState::SnapshotRetrieve { cursor, step } => self.snapshot_retrieve(cursor, step, now_ms)?,
            AgentState::LiveLogReplay { step } => self.live_log_replay(step, now_ms)?,
            AgentState::UpdateRecordingLog => self.update_recording_log(now_ms)?,
            AgentState::BackingUp => self.backing_up(now_ms)?,
            AgentState::ResetBackup { cool_down_deadline_ms } => self.reset_backup(cool_down_deadline_ms, now_ms)?,
        };
        self.state = next;
        self.after_transition(from_code, now_ms);
        work_count += work;

        if self.has_progress_stalled(now_ms) {
            tracing::warn!("progress has stalled; resetting backup");
            if let Some(listener) = self.listener.as_deref_mut() {
                listener.on_possible_failure(&BackupError::ProgressStalled);
            }
            self.set_state(
                AgentState::ResetBackup {
                    cool_down_deadline_ms: None,
                },
                now_ms,
            );
            work_count += 1;
        }

        Ok(work_count)
    }

    fn on_fragment(&mut self, frame: &[u8], now_ms: i64) -> Result<(), BackupError> {
        let mut buf = frame;
        let header = MessageHeader::decode(&mut buf)?;

        if header.schema_id != SCHEMA_ID {
            return Err(BackupError::ProtocolMismatch {
                expected: SCHEMA_ID,
                actual: header.schema_id,
            });
        }

        if header.template_id != TEMPLATE_BACKUP_RESPONSE {
            return Ok(());
        }

        let response = decode_backup_response(&mut buf)?;
        self.on_backup_response(response, now_ms)
    }

    fn on_backup_response(&mut self, response: BackupResponse, now_ms: i64) -> Result<(), BackupError> {
        let expected = matches!(
            &self.state,
            AgentState::BackupQuery {
                correlation_id: Some(outstanding),
                ..
            } if *outstanding == response.correlation_id
        );
        if !expected {
            tracing::debug!("discarding backup response with correlationId={}", response.correlation_id);
            return Ok(());
        }

        debug_assert!(self.recording_log.is_some(), "recording log must be open in {}", self.state);
        let Some(recording_log) = self.recording_log.as_ref() else {
            return Ok(());
        };

        let mut snapshots_to_retrieve = Vec::new();
        for snapshot in &response.snapshots {
            match recording_log.get_latest_snapshot(snapshot.service_id) {
                Some(entry) if entry.log_position == snapshot.log_position => {}
                _ => snapshots_to_retrieve.push(*snapshot),
            }
        }

        let leader_changed = self.leader_member.as_ref().map_or(true, |m| m.id != response.leader_member_id);
        if leader_changed || self.leader_log_recording_id != Some(response.log_recording_id) {
            self.leader_log_recording_id = Some(response.log_recording_id);
            self.leader_log_entry = Some(PendingTermEntry {
                leadership_term_id: response.log_leadership_term_id,
                term_base_log_position: response.log_term_base_log_position,
                timestamp: NULL_TIMESTAMP,
            });
        }

        let last_term_differs = recording_log.find_last_term().map_or(true, |e| {
            e.leadership_term_id != response.last_leadership_term_id
                || e.term_base_log_position != response.last_term_base_log_position
        });
        if last_term_differs {
            self.leader_last_term_entry = Some(PendingTermEntry {
                leadership_term_id: response.last_leadership_term_id,
                term_base_log_position: response.last_term_base_log_position,
                timestamp: NULL_TIMESTAMP,
            });
        }

        let members = parse_members(&response.cluster_members)?;
        let leader = find_member(&members, response.leader_member_id).cloned().ok_or_else(|| BackupError::Frame {
            reason: format!(
                "leader memberId={} not found in cluster members {:?}",
                response.leader_member_id, response.cluster_members
            ),
        })?;

        self.cluster_members = members;
        self.leader_commit_position_counter_id = Some(response.commit_position_counter_id);

        tracing::info!(
            "backup response: leader memberId={} logRecordingId={} snapshots to retrieve={}",
            leader.id,
            response.log_recording_id,
            snapshots_to_retrieve.len()
        );

        if let Some(listener) = self.listener.as_deref_mut() {
            listener.on_backup_response(&self.cluster_members, &leader, &snapshots_to_retrieve);
        }

        // A leader change must migrate the archive connection as well, even
        // when one is live.
        if leader_changed {
            self.cluster_archive = None;
        }
        self.leader_member = Some(leader.clone());

        if self.cluster_archive.is_none() {
            let mut uri = ChannelUri::parse(&self.archive_ctx.control_request_channel)?;
            uri.put(ENDPOINT_PARAM_NAME, &leader.archive_endpoint);

            let leader_archive_ctx = self
                .archive_ctx
                .clone()
                .control_request_channel(uri.to_string());

            self.cluster_archive_connect = None;
            self.cluster_archive_connect = Some(self.client.async_connect_archive(&leader_archive_ctx)?);
        }

        self.session.to_retrieve = snapshots_to_retrieve;
        self.session.lengths.clear();
        self.session.retrieved.clear();
        self.time_of_last_progress_ms = now_ms;

        if self.session.to_retrieve.is_empty() {
            self.set_state(
                AgentState::LiveLogReplay {
                    step: ReplayStep::Request,
                },
                now_ms,
            );
        } else {
            self.set_state(
                AgentState::SnapshotLengthRetrieve {
                    cursor: 0,
                    in_flight: None,
                },
                now_ms,
            );
        }

        Ok(())
    }

    fn backup_query(
        &mut self,
        correlation_id: Option<i64>,
        last_query_ms: i64,
        now_ms: i64,
    ) -> Result<(AgentState, usize), BackupError> {
        if self.consensus_publication.is_none() || now_ms > last_query_ms + self.response_timeout_ms {
            let cursor = match self.endpoint_cursor {
                None => 0,
                Some(c) => (c + 1) % self.consensus_endpoints.len(),
            };
            self.endpoint_cursor = Some(cursor);

            self.cluster_archive_connect = None;
            self.cluster_archive = None;
            self.consensus_publication = None;

            let mut uri = ChannelUri::parse(&self.config.consensus_channel)?;
            uri.put(ENDPOINT_PARAM_NAME, &self.consensus_endpoints[cursor]);

            tracing::debug!("probing consensus endpoint {}", self.consensus_endpoints[cursor]);
            let publication = self.client.add_publication(&uri.to_string(), self.config.consensus_stream_id)?;
            self.consensus_publication = Some(publication);

            return Ok((
                AgentState::BackupQuery {
                    correlation_id: None,
                    last_query_ms: now_ms,
                },
                1,
            ));
        }

        if correlation_id.is_none() {
            let connected = self.consensus_publication.as_ref().map_or(false, |p| p.is_connected());
            if connected {
                let new_correlation_id = self.client.next_correlation_id();
                let query = BackupQuery {
                    correlation_id: new_correlation_id,
                    response_stream_id: self.config.consensus_stream_id,
                    version: protocol_semantic_version(),
                    response_channel: self.config.consensus_channel.clone(),
                    encoded_credentials: Vec::new(),
                };
                let frame = encode_backup_query(&query);

                let offered = self.consensus_publication.as_mut().map_or(false, |p| p.try_offer(&frame));
                if offered {
                    tracing::debug!("backup query sent: correlationId={}", new_correlation_id);
                    return Ok((
                        AgentState::BackupQuery {
                            correlation_id: Some(new_correlation_id),
                            last_query_ms: now_ms,
                        },
                        1,
                    ));
                }
            }
        }

        Ok((
            AgentState::BackupQuery {
                correlation_id,
                last_query_ms,
            },
            0,
        ))
    }

    /// Poll the in-flight leader-archive connect; returns the work done.
    fn poll_cluster_archive(&mut self, now_ms: i64) -> Result<usize, BackupError> {
        let connected = match self.cluster_archive_connect.as_mut() {
            Some(connect) => connect.poll()?,
            None => None,
        };

        match connected {
            Some(archive) => {
                tracing::debug!("leader archive connected: controlSessionId={}", archive.control_session_id());
                self.cluster_archive = Some(archive);
                self.time_of_last_progress_ms = now_ms;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn snapshot_length_retrieve(
        &mut self,
        cursor: usize,
        in_flight: Option<i64>,
        now_ms: i64,
    ) -> Result<(AgentState, usize), BackupError> {
        if self.cluster_archive.is_none() {
            let work = self.poll_cluster_archive(now_ms)?;
            return Ok((AgentState::SnapshotLengthRetrieve { cursor, in_flight }, work));
        }

        match in_flight {
            None => {
                let correlation_id = self.client.next_correlation_id();
                let recording_id = self.session.to_retrieve[cursor].recording_id;

                let sent = match self.cluster_archive.as_mut() {
                    Some(archive) => archive.get_stop_position(recording_id, correlation_id)?,
                    None => false,
                };
                if sent {
                    self.time_of_last_progress_ms = now_ms;
                    return Ok((
                        AgentState::SnapshotLengthRetrieve {
                            cursor,
                            in_flight: Some(correlation_id),
                        },
                        1,
                    ));
                }

                Ok((AgentState::SnapshotLengthRetrieve { cursor, in_flight: None }, 0))
            }
            Some(correlation_id) => {
                let response = match self.cluster_archive.as_mut() {
                    Some(archive) => archive.poll_response(correlation_id)?,
                    None => None,
                };

                let Some(stop_position) = response else {
                    return Ok((
                        AgentState::SnapshotLengthRetrieve {
                            cursor,
                            in_flight: Some(correlation_id),
                        },
                        0,
                    ));
                };

                if stop_position == NULL_POSITION {
                    tracing::warn!(
                        "leader cannot supply snapshot recordingId={}; resetting",
                        self.session.to_retrieve[cursor].recording_id
                    );
                    return Ok((
                        AgentState::ResetBackup {
                            cool_down_deadline_ms: None,
                        },
                        1,
                    ));
                }

                self.session.lengths.push(stop_position);
                self.time_of_last_progress_ms = now_ms;

                let next_cursor = cursor + 1;
                if next_cursor >= self.session.to_retrieve.len() {
                    Ok((
                        AgentState::SnapshotRetrieve {
                            cursor: 0,
                            step: RetrieveStep::Request,
                        },
                        1,
                    ))
                } else {
                    Ok((
                        AgentState::SnapshotLengthRetrieve {
                            cursor: next_cursor,
                            in_flight: None,
                        },
                        1,
                    ))
                }
            }
        }
    }

    fn snapshot_retrieve(
        &mut self,
        cursor: usize,
        step: RetrieveStep,
        now_ms: i64,
    ) -> Result<(AgentState, usize), BackupError> {
        if self.cluster_archive.is_none() {
            let work = self.poll_cluster_archive(now_ms)?;
            return Ok((AgentState::SnapshotRetrieve { cursor, step }, work));
        }

        match step {
            RetrieveStep::Request => {
                let correlation_id = self.client.next_correlation_id();
                let recording_id = self.session.to_retrieve[cursor].recording_id;
                let channel = self.catchup_channel(None)?;

                let sent = match self.cluster_archive.as_mut() {
                    Some(archive) => archive.replay(
                        recording_id,
                        0,
                        NULL_LENGTH,
                        &channel,
                        self.config.replay_stream_id,
                        correlation_id,
                    )?,
                    None => false,
                };
                if sent {
                    self.time_of_last_progress_ms = now_ms;
                    return Ok((
                        AgentState::SnapshotRetrieve {
                            cursor,
                            step: RetrieveStep::AwaitSession { correlation_id },
                        },
                        1,
                    ));
                }

                Ok((
                    AgentState::SnapshotRetrieve {
                        cursor,
                        step: RetrieveStep::Request,
                    },
                    0,
                ))
            }
            RetrieveStep::AwaitSession { correlation_id } => {
                let response = match self.cluster_archive.as_mut() {
                    Some(archive) => archive.poll_response(correlation_id)?,
                    None => None,
                };

                let Some(replay_session_id) = response else {
                    return Ok((
                        AgentState::SnapshotRetrieve {
                            cursor,
                            step: RetrieveStep::AwaitSession { correlation_id },
                        },
                        0,
                    ));
                };

                let session_id = replay_session_id as i32;
                let channel = self.catchup_channel(Some(session_id))?;
                let expected_stop_position = self.session.lengths[cursor];
                let monitor = SnapshotRetrieveMonitor::new(expected_stop_position);

                if let Some(archive) = self.backup_archive.as_mut() {
                    archive.start_recording(&channel, self.config.replay_stream_id, SourceLocation::Remote, true)?;
                }

                self.time_of_last_progress_ms = now_ms;
                Ok((
                    AgentState::SnapshotRetrieve {
                        cursor,
                        step: RetrieveStep::Monitor(monitor),
                    },
                    1,
                ))
            }
            RetrieveStep::Monitor(mut monitor) => {
                let work = match self.backup_archive.as_mut() {
                    Some(archive) => archive.poll_signals(&mut monitor, FRAGMENT_POLL_LIMIT)?,
                    None => 0,
                };
                monitor.error_check()?;
                self.time_of_last_progress_ms = now_ms;

                if let (true, Some(local_recording_id)) = (monitor.is_done(), monitor.recording_id()) {
                    let snapshot = self.session.to_retrieve[cursor];
                    self.session.retrieved.push(SnapshotDescriptor {
                        recording_id: local_recording_id,
                        ..snapshot
                    });

                    tracing::info!(
                        "snapshot retrieved: serviceId={} local recordingId={}",
                        snapshot.service_id,
                        local_recording_id
                    );

                    let next_cursor = cursor + 1;
                    if next_cursor >= self.session.to_retrieve.len() {
                        return Ok((
                            AgentState::LiveLogReplay {
                                step: ReplayStep::Request,
                            },
                            1,
                        ));
                    }
                    return Ok((
                        AgentState::SnapshotRetrieve {
                            cursor: next_cursor,
                            step: RetrieveStep::Request,
                        },
                        1,
                    ));
                }

                Ok((
                    AgentState::SnapshotRetrieve {
                        cursor,
                        step: RetrieveStep::Monitor(monitor),
                    },
                    work,
                ))
            }
        }
    }

    fn live_log_replay(&mut self, step: ReplayStep, now_ms: i64) -> Result<(AgentState, usize), BackupError> {
        if self.live_log_recording_id.is_some() {
            self.time_of_last_progress_ms = now_ms;
            return Ok((AgentState::UpdateRecordingLog, 1));
        }

        if self.cluster_archive.is_none() {
            let work = self.poll_cluster_archive(now_ms)?;
            return Ok((AgentState::LiveLogReplay { step }, work));
        }

        match step {
            ReplayStep::Request => {
                let Some(leader_log_recording_id) = self.leader_log_recording_id else {
                    debug_assert!(false, "leader log recording id must be known before replay");
                    return Ok((
                        AgentState::ResetBackup {
                            cool_down_deadline_ms: None,
                        },
                        1,
                    ));
                };
                let limit_counter_id = self.leader_commit_position_counter_id.unwrap_or(NULL_COUNTER_ID);

                // Resume from where the backup left off, or from the live
                // tail when no term has been recorded yet.
                let last_term_recording_id = self.recording_log.as_ref().and_then(|l| l.find_last_term()).map(|e| e.recording_id);
                let start_position = match last_term_recording_id {
                    None => NULL_POSITION,
                    Some(recording_id) => match self.backup_archive.as_mut() {
                        Some(archive) => archive.stop_position(recording_id)?,
                        None => NULL_POSITION,
                    },
                };

                let correlation_id = self.client.next_correlation_id();
                let channel = self.catchup_channel(None)?;

                let sent = match self.cluster_archive.as_mut() {
                    Some(archive) => archive.bounded_replay(
                        leader_log_recording_id,
                        start_position,
                        NULL_LENGTH,
                        limit_counter_id,
                        &channel,
                        self.config.log_stream_id,
                        correlation_id,
                    )?,
                    None => false,
                };
                if sent {
                    self.time_of_last_progress_ms = now_ms;
                    return Ok((
                        AgentState::LiveLogReplay {
                            step: ReplayStep::AwaitSession { correlation_id },
                        },
                        1,
                    ));
                }

                Ok((
                    AgentState::LiveLogReplay {
                        step: ReplayStep::Request,
                    },
                    0,
                ))
            }
            ReplayStep::AwaitSession { correlation_id } => {
                let response = match self.cluster_archive.as_mut() {
                    Some(archive) => archive.poll_response(correlation_id)?,
                    None => None,
                };

                let Some(replay_id) = response else {
                    return Ok((
                        AgentState::LiveLogReplay {
                            step: ReplayStep::AwaitSession { correlation_id },
                        },
                        0,
                    ));
                };

                let session_id = replay_id as i32;
                let channel = self.catchup_channel(Some(session_id))?;
                let last_term_recording_id = self.recording_log.as_ref().and_then(|l| l.find_last_term()).map(|e| e.recording_id);

                let subscription_id = match self.backup_archive.as_mut() {
                    Some(archive) => match last_term_recording_id {
                        None => {
                            Some(archive.start_recording(&channel, self.config.log_stream_id, SourceLocation::Remote, true)?)
                        }
                        Some(recording_id) => Some(archive.extend_recording(
                            recording_id,
                            &channel,
                            self.config.log_stream_id,
                            SourceLocation::Remote,
                            true,
                        )?),
                    },
                    None => None,
                };

                self.live_log_replay_subscription_id = subscription_id;
                self.time_of_last_progress_ms = now_ms;

                Ok((
                    AgentState::LiveLogReplay {
                        step: ReplayStep::AwaitRecordingCounter { session_id },
                    },
                    1,
                ))
            }
            ReplayStep::AwaitRecordingCounter { session_id } => {
                let Some(counter_id) = self.client.find_recording_counter_by_session(session_id) else {
                    return Ok((
                        AgentState::LiveLogReplay {
                            step: ReplayStep::AwaitRecordingCounter { session_id },
                        },
                        0,
                    ));
                };

                let Some(recording_id) = self.client.recording_id(counter_id) else {
                    return Ok((
                        AgentState::LiveLogReplay {
                            step: ReplayStep::AwaitRecordingCounter { session_id },
                        },
                        0,
                    ));
                };

                self.live_log_position_counter.propose_max_release(self.client.counter_value(counter_id));
                self.live_log_rec_counter_id = Some(counter_id);
                self.live_log_recording_id = Some(recording_id);
                self.time_of_last_progress_ms = now_ms;

                tracing::info!(
                    "live log recording established: recordingId={} counterId={}",
                    recording_id,
                    counter_id
                );

                Ok((AgentState::UpdateRecordingLog, 1))
            }
        }
    }

    fn update_recording_log(&mut self, now_ms: i64) -> Result<(AgentState, usize), BackupError> {
        debug_assert!(self.recording_log.is_some(), "recording log must be open before updating it");
        debug_assert!(self.live_log_recording_id.is_some(), "live log must be established before updating");

        let (Some(recording_log), Some(live_log_recording_id)) =
            (self.recording_log.as_mut(), self.live_log_recording_id)
        else {
            return Ok((
                AgentState::ResetBackup {
                    cool_down_deadline_ms: None,
                },
                1,
            ));
        };

        let mut was_updated = false;
        let snapshot_leadership_term_id =
            self.session.retrieved.first().map(|s| s.leadership_term_id).unwrap_or(NULL_VALUE);

        if let Some(entry) = self.leader_log_entry {
            if recording_log.is_unknown(entry.leadership_term_id)
                && entry.leadership_term_id <= snapshot_leadership_term_id
            {
                recording_log.append_term(
                    live_log_recording_id,
                    entry.leadership_term_id,
                    entry.term_base_log_position,
                    entry.timestamp,
                )?;
                was_updated = true;
                self.leader_log_entry = None;
            }
        }

        // Reverse of retrieval order, so the consensus-module snapshot that
        // was retrieved first is appended last.
        if !self.session.retrieved.is_empty() {
            for snapshot in self.session.retrieved.iter().rev() {
                recording_log.append_snapshot(
                    snapshot.recording_id,
                    snapshot.leadership_term_id,
                    snapshot.term_base_log_position,
                    snapshot.log_position,
                    snapshot.timestamp,
                    snapshot.service_id,
                )?;
            }
            was_updated = true;
        }

        if let Some(entry) = self.leader_last_term_entry {
            if recording_log.is_unknown(entry.leadership_term_id) {
                recording_log.append_term(
                    live_log_recording_id,
                    entry.leadership_term_id,
                    entry.term_base_log_position,
                    entry.timestamp,
                )?;
                was_updated = true;
                self.leader_last_term_entry = None;
            }
        }

        if was_updated {
            if let Some(listener) = self.listener.as_deref_mut() {
                listener.on_updated_recording_log(recording_log, &self.session.retrieved);
            }
        }

        self.session.lengths.clear();
        self.session.retrieved.clear();
        self.session.to_retrieve.clear();
        self.time_of_last_progress_ms = now_ms;

        self.next_query_deadline_ms_counter.set_release(now_ms + self.query_interval_ms);

        Ok((AgentState::BackingUp, 1))
    }

    fn backing_up(&mut self, now_ms: i64) -> Result<(AgentState, usize), BackupError> {
        let mut work_count = 0;
        let mut next = AgentState::BackingUp;

        if now_ms > self.next_query_deadline_ms_counter.get() {
            self.time_of_last_progress_ms = now_ms;
            next = AgentState::BackupQuery {
                correlation_id: None,
                last_query_ms: now_ms,
            };
            work_count += 1;
        }

        if let Some(counter_id) = self.live_log_rec_counter_id {
            let position = self.client.counter_value(counter_id);
            if self.live_log_position_counter.propose_max_release(position) {
                if let Some(listener) = self.listener.as_deref_mut() {
                    listener.on_live_log_progress(
                        self.live_log_recording_id.unwrap_or(NULL_VALUE),
                        counter_id,
                        position,
                    );
                }
                work_count += 1;
            }
        }

        Ok((next, work_count))
    }

    fn reset_backup(&mut self, cool_down_deadline_ms: Option<i64>, now_ms: i64) -> Result<(AgentState, usize), BackupError> {
        self.time_of_last_progress_ms = now_ms;

        match cool_down_deadline_ms {
            None => {
                self.reset();
                Ok((
                    AgentState::ResetBackup {
                        cool_down_deadline_ms: Some(now_ms + self.cool_down_interval_ms),
                    },
                    1,
                ))
            }
            Some(deadline) if now_ms > deadline => Ok((AgentState::Init, 1)),
            Some(deadline) => Ok((
                AgentState::ResetBackup {
                    cool_down_deadline_ms: Some(deadline),
                },
                0,
            )),
        }
    }

    fn has_progress_stalled(&self, now_ms: i64) -> bool {
        self.live_log_rec_counter_id.is_none() && now_ms > self.time_of_last_progress_ms + self.progress_timeout_ms
    }

    fn catchup_channel(&self, session_id: Option<i32>) -> Result<String, BackupError> {
        let mut uri = ChannelUri::parse(CATCHUP_CHANNEL_TEMPLATE)?;
        uri.put(ENDPOINT_PARAM_NAME, &self.config.catchup_endpoint);
        if let Some(session_id) = session_id {
            uri.put(SESSION_ID_PARAM_NAME, session_id);
        }
        Ok(uri.to_string())
    }
}

impl<M, C> Agent for ClusterBackupAgent<M, C>
where
    M: ClusterClient,
    C: EpochClock,
{
    fn on_start(&mut self) -> Result<(), BackupError> {
        let archive = self.client.connect_archive(&self.archive_ctx)?;
        tracing::debug!("local archive connected: controlSessionId={}", archive.control_session_id());
        self.backup_archive = Some(archive);

        self.state_counter.set_release(self.state.code());
        self.next_query_deadline_ms_counter.set_release(self.clock.time_ms() - 1);
        Ok(())
    }

    fn do_work(&mut self) -> Result<usize, BackupError> {
        let now_ms = self.clock.time_ms();
        let mut work_count = 0;

        if matches!(self.state, AgentState::Init) {
            work_count += self.init(now_ms)?;
        }

        if now_ms != self.time_of_last_tick_ms {
            self.time_of_last_tick_ms = now_ms;
            work_count += self.client.invoke();
            self.mark_file.update_activity_timestamp(now_ms)?;

            while let Some(counter_id) = self.client.next_unavailable_counter() {
                self.on_unavailable_counter(counter_id, now_ms);
            }
        }

        match self.poll_and_dispatch(now_ms) {
            Ok(work) => work_count += work,
            Err(e) => {
                tracing::warn!("backup cycle failed: {}", e);
                if let Some(listener) = self.listener.as_deref_mut() {
                    listener.on_possible_failure(&e);
                }
                self.set_state(
                    AgentState::ResetBackup {
                        cool_down_deadline_ms: None,
                    },
                    now_ms,
                );
                return Err(e);
            }
        }

        Ok(work_count)
    }

    fn on_close(&mut self) {
        self.consensus_publication = None;

        if let Some(subscription_id) = self.live_log_replay_subscription_id.take() {
            if let Some(archive) = self.backup_archive.as_mut() {
                if let Err(e) = archive.try_stop_recording(subscription_id) {
                    tracing::warn!("failed to stop live log recording on close: {}", e);
                }
            }
        }

        self.backup_archive = None;
        self.cluster_archive_connect = None;
        self.cluster_archive = None;
        self.recording_log = None;
    }

    fn role_name(&self) -> &str {
        "cluster-backup"
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::ClusterBackupAgent;
    use crate::counters::NULL_VALUE;
    use crate::testing::FakeCluster;
    use crate::testing::ManualClock;
    use crate::ArchiveContext;
    use crate::Config;

    fn new_agent(dir: &std::path::Path) -> ClusterBackupAgent<FakeCluster, Rc<ManualClock>> {
        let config = Config {
            cluster_consensus_endpoints: "a:1,b:2".to_string(),
            cluster_dir: dir.to_path_buf(),
            ..Config::default()
        };

        ClusterBackupAgent::new(
            config,
            ArchiveContext::default(),
            FakeCluster::new(),
            Rc::new(ManualClock::new(0)),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_new_agent_starts_in_init() {
        let dir = tempfile::tempdir().unwrap();
        let agent = new_agent(dir.path());

        assert_eq!(0, agent.state_code());
        assert_eq!(0, agent.state_counter().get());
        assert_eq!(NULL_VALUE, agent.live_log_position_counter().get());
        assert!(agent.leader_member().is_none());
        assert!(agent.live_log_recording_id().is_none());
    }

    #[test]
    fn test_catchup_channel_pins_session_when_known() {
        let dir = tempfile::tempdir().unwrap();
        let agent = new_agent(dir.path());

        assert_eq!("backup:udp?endpoint=localhost:9510", agent.catchup_channel(None).unwrap());
        assert_eq!(
            "backup:udp?endpoint=localhost:9510|session-id=9001",
            agent.catchup_channel(Some(9001)).unwrap()
        );
    }

    #[test]
    fn test_progress_stall_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = new_agent(dir.path());
        agent.time_of_last_progress_ms = 1_000;

        // Default progress timeout is 10s.
        assert!(!agent.has_progress_stalled(11_000));
        assert!(agent.has_progress_stalled(11_001));

        // An established live log recording disables the stall detector.
        agent.live_log_rec_counter_id = Some(7);
        assert!(!agent.has_progress_stalled(11_001));
    }

    #[test]
    fn test_reset_clears_session_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = new_agent(dir.path());

        agent.live_log_recording_id = Some(101);
        agent.live_log_rec_counter_id = Some(7);
        agent.endpoint_cursor = Some(1);

        agent.reset();

        assert!(agent.live_log_recording_id.is_none());
        assert!(agent.live_log_rec_counter_id.is_none());
        assert!(agent.endpoint_cursor.is_none());
        assert!(agent.recording_log.is_none());
        assert!(agent.consensus_publication.is_none());
    }
}
