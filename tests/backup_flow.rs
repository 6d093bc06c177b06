//! The happy path: cold start, steady state and re-query behavior.

mod fixtures;

use anyhow::Result;
use cluster_backup::cluster::RecordingSignal;
use cluster_backup::recording_log::EntryType;
use cluster_backup::testing::ArchiveRequest;
use cluster_backup::testing::FakeArchive;
use cluster_backup::RecordingLog;
use cluster_backup::NULL_POSITION;
use pretty_assertions::assert_eq;

use crate::fixtures::harness;
use crate::fixtures::leader_response;
use crate::fixtures::recording_signal;
use crate::fixtures::Harness;

/// Script a leader archive able to serve the cold-start scenario: snapshot
/// recording 10 stops at 4096 and replays with session 9001, the log
/// recording 11 replays with session 9002.
fn scripted_leader_archive() -> FakeArchive {
    let archive = FakeArchive::new(2);
    archive.set_stop_position(10, 4096);
    archive.set_replay_session(10, 9001);
    archive.set_replay_session(11, 9002);
    archive
}

/// Drive a cold-start harness up to the `BACKING_UP` state; returns the
/// leader archive handle for request assertions.
fn drive_to_backing_up(h: &mut Harness) -> Result<FakeArchive> {
    let leader_archive = scripted_leader_archive();
    h.cluster.push_cluster_archive(leader_archive.clone());

    // INIT -> BACKUP_QUERY, publication opened against the first endpoint.
    h.step()?;
    // Query offered once the publication is connected.
    h.step()?;

    let correlation_id = h.last_query_correlation_id(0)?;
    h.deliver_response(&leader_response(correlation_id));

    // Response accepted, leader archive connected.
    h.step()?;
    // Stop position requested, then received.
    h.steps(2)?;
    // Snapshot replay requested, session received, local recording started.
    h.steps(2)?;

    let backup_archive = h.cluster.backup_archive();
    backup_archive.signal(recording_signal(100, 0, RecordingSignal::Start));
    backup_archive.signal(recording_signal(100, 4096, RecordingSignal::Stop));

    // Snapshot transfer observed to completion.
    h.step()?;
    // Bounded replay of the log requested, then the session received.
    h.steps(2)?;

    h.cluster.add_recording_counter(9002, 7, 101, 0);

    // Recording counter found, then the recording log updated.
    h.steps(2)?;

    assert_eq!(6, h.agent.state_code(), "expected BACKING_UP");
    Ok(leader_archive)
}

/// Cold start with no local state and one snapshot to retrieve.
///
/// What does this test do?
///
/// - the first query is answered with one consensus-module snapshot and a
///   live log in term 3.
/// - the snapshot is measured (4096), replayed and recorded locally as
///   recording 100.
/// - the log is replayed boundedly into local recording 101.
/// - the recording log ends up with `TERM(101, 3, 0)` then
///   `SNAPSHOT(100, 3, 0, 4096, -1)`.
#[test]
fn test_cold_start_with_one_snapshot() -> Result<()> {
    let mut h = harness()?;
    let leader_archive = drive_to_backing_up(&mut h)?;

    // The log replay is bounded by the leader's commit-position counter and
    // starts from the live tail, there being no local term to resume from.
    let bounded = leader_archive.requests().into_iter().find_map(|r| match r {
        ArchiveRequest::BoundedReplay {
            recording_id,
            start_position,
            limit_counter_id,
            ..
        } => Some((recording_id, start_position, limit_counter_id)),
        _ => None,
    });
    assert_eq!(Some((11, NULL_POSITION, 42)), bounded);

    let log = RecordingLog::open(h.cluster_dir.path())?;
    let entries = log.entries();
    assert_eq!(2, entries.len());

    assert_eq!(EntryType::Term, entries[0].entry_type);
    assert_eq!(101, entries[0].recording_id);
    assert_eq!(3, entries[0].leadership_term_id);
    assert_eq!(0, entries[0].term_base_log_position);
    assert_eq!(NULL_POSITION, entries[0].log_position);

    assert_eq!(EntryType::Snapshot, entries[1].entry_type);
    assert_eq!(100, entries[1].recording_id);
    assert_eq!(3, entries[1].leadership_term_id);
    assert_eq!(0, entries[1].term_base_log_position);
    assert_eq!(4096, entries[1].log_position);
    assert_eq!(-1, entries[1].service_id);

    let events = h.events.borrow();
    assert!(events.iter().any(|e| e.starts_with("backup-response: members=2 leader=0 snapshots=1")));
    assert!(events.iter().any(|e| e.starts_with("recording-log-updated: snapshots=1")));

    Ok(())
}

/// The snapshot states are skipped entirely when the leader offers nothing
/// the backup does not already have.
#[test]
fn test_no_missing_snapshots_goes_straight_to_live_log_replay() -> Result<()> {
    let mut h = harness()?;

    let archive = FakeArchive::new(2);
    archive.set_replay_session(11, 9002);
    h.cluster.push_cluster_archive(archive);

    let mut visited = Vec::new();

    h.step()?;
    h.step()?;
    let correlation_id = h.last_query_correlation_id(0)?;

    let mut response = leader_response(correlation_id);
    response.snapshots.clear();
    h.deliver_response(&response);

    for _ in 0..4 {
        h.step()?;
        visited.push(h.agent.state_code());
    }
    h.cluster.add_recording_counter(9002, 7, 101, 0);
    h.steps(2)?;

    assert_eq!(6, h.agent.state_code(), "expected BACKING_UP");
    assert!(!visited.contains(&2), "must not visit SNAPSHOT_LENGTH_RETRIEVE");
    assert!(!visited.contains(&3), "must not visit SNAPSHOT_RETRIEVE");

    // Without a covering snapshot the head term entry is withheld; only the
    // last-term entry is recorded, mapped to the local live recording.
    let log = RecordingLog::open(h.cluster_dir.path())?;
    assert_eq!(1, log.entries().len());
    assert_eq!(EntryType::Term, log.entries()[0].entry_type);
    assert_eq!(101, log.entries()[0].recording_id);

    Ok(())
}

/// Leader change in steady state.
///
/// What does this test do?
///
/// - runs the cold-start scenario to `BACKING_UP`.
/// - the next periodic query is answered by a different leader with the
///   same log recording.
/// - the leader-archive connection must migrate to the new leader's archive
///   endpoint even though a connection is live.
/// - no recording-log entries are appended, the terms are already known.
#[test]
fn test_leader_change_migrates_archive_connection() -> Result<()> {
    let mut h = harness()?;
    drive_to_backing_up(&mut h)?;

    let connects = h.cluster.cluster_connects();
    assert_eq!(1, connects.len());
    assert!(connects[0].control_request_channel.contains("node0:8010"));

    // Past the next-query deadline the agent re-queries on the existing
    // publication.
    h.clock.advance(1_100);
    h.step()?;
    assert_eq!(1, h.agent.state_code(), "expected BACKUP_QUERY");
    h.step()?;

    let correlation_id = h.last_query_correlation_id(0)?;
    let mut response = leader_response(correlation_id);
    response.leader_member_id = 1;
    h.deliver_response(&response);

    h.steps(3)?;
    assert_eq!(6, h.agent.state_code(), "expected BACKING_UP");

    let connects = h.cluster.cluster_connects();
    assert_eq!(2, connects.len(), "leader change must reconnect the leader archive");
    assert!(connects[1].control_request_channel.contains("node1:8010"));
    assert_eq!(Some(1), h.agent.leader_member().map(|m| m.id));

    // Both terms were already known; history is not rewritten.
    let log = RecordingLog::open(h.cluster_dir.path())?;
    assert_eq!(2, log.entries().len());

    Ok(())
}

/// After a reset, the next backup round resumes by extending the existing
/// local recording from its stop position.
///
/// What does this test do?
///
/// - runs the cold-start scenario, then loses the live-log counter so the
///   agent resets and cools down.
/// - the next round finds term 3 already recorded locally (recording 101,
///   stopped at 8192), so the bounded replay starts at 8192 and the local
///   archive extends recording 101 instead of starting a new one.
#[test]
fn test_resumes_by_extending_existing_recording() -> Result<()> {
    let mut h = harness()?;
    drive_to_backing_up(&mut h)?;

    h.cluster.make_counter_unavailable(7);
    h.step()?;
    assert_eq!(7, h.agent.state_code(), "expected RESET_BACKUP");
    h.step()?;

    h.clock.advance(201);
    h.step()?;
    assert_eq!(0, h.agent.state_code(), "expected INIT");

    let backup_archive = h.cluster.backup_archive();
    backup_archive.set_stop_position(101, 8_192);

    let leader_archive = FakeArchive::new(3);
    leader_archive.set_replay_session(11, 9_003);
    h.cluster.push_cluster_archive(leader_archive.clone());

    h.steps(2)?;
    let publication_index = h.cluster.publication_count() - 1;
    let correlation_id = h.last_query_correlation_id(publication_index)?;
    h.deliver_response(&leader_response(correlation_id));

    h.steps(3)?;
    h.cluster.add_recording_counter(9_003, 8, 101, 8_192);
    h.steps(2)?;
    assert_eq!(6, h.agent.state_code(), "expected BACKING_UP");

    let bounded = leader_archive.requests().into_iter().find_map(|r| match r {
        ArchiveRequest::BoundedReplay {
            recording_id,
            start_position,
            limit_counter_id,
            ..
        } => Some((recording_id, start_position, limit_counter_id)),
        _ => None,
    });
    assert_eq!(Some((11, 8_192, 42)), bounded);

    let extended = backup_archive.requests().into_iter().any(|r| {
        matches!(r, ArchiveRequest::ExtendRecording { recording_id: 101, ref channel, .. }
            if channel.contains("session-id=9003"))
    });
    assert!(extended, "the live log must extend the existing recording");

    // Terms were already known; the recording log is unchanged.
    let log = RecordingLog::open(h.cluster_dir.path())?;
    assert_eq!(2, log.entries().len());

    Ok(())
}

/// The live-log position counter only ever moves forward, even when the
/// sampled recording counter regresses.
#[test]
fn test_live_log_position_is_monotonic() -> Result<()> {
    let mut h = harness()?;
    drive_to_backing_up(&mut h)?;

    let position = h.agent.live_log_position_counter();

    h.cluster.set_counter_value(7, 2_048);
    h.step()?;
    assert_eq!(2_048, position.get());
    assert!(h.events.borrow().iter().any(|e| e.contains("live-log-progress")));

    h.cluster.set_counter_value(7, 1_024);
    h.step()?;
    assert_eq!(2_048, position.get(), "a regressing sample must not move the counter back");

    h.cluster.set_counter_value(7, 4_096);
    h.step()?;
    assert_eq!(4_096, position.get());

    Ok(())
}
