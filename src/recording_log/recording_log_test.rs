use pretty_assertions::assert_eq;

use crate::recording_log::EntryType;
use crate::recording_log::RecordingLog;
use crate::recording_log::SERVICE_ID_CONSENSUS_MODULE;
use crate::NULL_POSITION;
use crate::NULL_TIMESTAMP;

#[test]
fn test_open_empty() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let log = RecordingLog::open(dir.path())?;

    assert!(log.entries().is_empty());
    assert!(log.find_last_term().is_none());
    assert!(log.get_latest_snapshot(SERVICE_ID_CONSENSUS_MODULE).is_none());
    assert!(log.is_unknown(0));
    Ok(())
}

#[test]
fn test_append_term_and_snapshot() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut log = RecordingLog::open(dir.path())?;

    log.append_term(101, 3, 0, NULL_TIMESTAMP)?;
    log.append_snapshot(100, 3, 0, 4096, 100, SERVICE_ID_CONSENSUS_MODULE)?;

    let last_term = log.find_last_term().unwrap();
    assert_eq!(101, last_term.recording_id);
    assert_eq!(3, last_term.leadership_term_id);
    assert_eq!(NULL_POSITION, last_term.log_position);
    assert_eq!(EntryType::Term, last_term.entry_type);

    let snapshot = log.get_latest_snapshot(SERVICE_ID_CONSENSUS_MODULE).unwrap();
    assert_eq!(100, snapshot.recording_id);
    assert_eq!(4096, snapshot.log_position);

    assert!(!log.is_unknown(3));
    assert!(log.is_unknown(4));
    Ok(())
}

#[test]
fn test_latest_snapshot_is_per_service() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut log = RecordingLog::open(dir.path())?;

    log.append_snapshot(100, 3, 0, 4096, 100, SERVICE_ID_CONSENSUS_MODULE)?;
    log.append_snapshot(102, 3, 0, 4096, 100, 0)?;
    log.append_snapshot(104, 5, 4096, 8192, 200, SERVICE_ID_CONSENSUS_MODULE)?;

    assert_eq!(104, log.get_latest_snapshot(SERVICE_ID_CONSENSUS_MODULE).unwrap().recording_id);
    assert_eq!(102, log.get_latest_snapshot(0).unwrap().recording_id);
    assert!(log.get_latest_snapshot(1).is_none());
    Ok(())
}

#[test]
fn test_reload_from_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let mut log = RecordingLog::open(dir.path())?;
        log.append_term(101, 3, 0, NULL_TIMESTAMP)?;
        log.append_snapshot(100, 3, 0, 4096, 100, SERVICE_ID_CONSENSUS_MODULE)?;
    }

    let log = RecordingLog::open(dir.path())?;
    assert_eq!(2, log.entries().len());
    assert_eq!(3, log.find_last_term().unwrap().leadership_term_id);
    assert_eq!(4096, log.get_latest_snapshot(SERVICE_ID_CONSENSUS_MODULE).unwrap().log_position);
    assert_eq!(vec![0, 1], log.entries().iter().map(|e| e.entry_index).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_open_rejects_torn_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let mut log = RecordingLog::open(dir.path())?;
        log.append_term(101, 3, 0, NULL_TIMESTAMP)?;
    }

    let path = dir.path().join(super::RECORDING_LOG_FILE_NAME);
    let mut raw = std::fs::read(&path)?;
    raw.pop();
    std::fs::write(&path, &raw)?;

    assert!(RecordingLog::open(dir.path()).is_err());
    Ok(())
}
