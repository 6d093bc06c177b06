//! Durable append-only index of terms and snapshots held by the backup.
//!
//! The log is the local source of truth for which leadership terms have a
//! recording and which snapshots have been retrieved. It only ever grows:
//! the agent appends entries for unknown terms and newly retrieved
//! snapshots and never rewrites history.

#[cfg(test)] mod recording_log_test;

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::counters::NULL_POSITION;
use crate::error::BackupError;
use crate::error::StorageVerb;

/// File name of the recording log inside the cluster directory.
pub const RECORDING_LOG_FILE_NAME: &str = "recording.log";

/// Service id of the consensus-module snapshot.
pub const SERVICE_ID_CONSENSUS_MODULE: i32 = -1;

const RECORD_LENGTH: usize = 48;

/// What an [`Entry`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EntryType {
    /// A leadership term mapped to a local recording.
    Term,
    /// A retrieved snapshot.
    Snapshot,
}

impl EntryType {
    fn code(&self) -> u8 {
        match self {
            EntryType::Term => 0,
            EntryType::Snapshot => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EntryType::Term),
            1 => Some(EntryType::Snapshot),
            _ => None,
        }
    }
}

/// One record of the recording log.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Entry {
    /// Local recording holding the data.
    pub recording_id: i64,
    /// Leadership term this entry belongs to.
    pub leadership_term_id: i64,
    /// Base log position of that term.
    pub term_base_log_position: i64,
    /// Covered log position; `NULL_POSITION` for an open-ended term.
    pub log_position: i64,
    /// Epoch-ms timestamp of the entry.
    pub timestamp: i64,
    /// Owning service for snapshots, `-1` for the consensus module.
    pub service_id: i32,
    /// Whether this is a term or a snapshot record.
    pub entry_type: EntryType,
    /// Invalidated entries are retained on disk but ignored by queries.
    pub valid: bool,
    /// Position of the entry in the log.
    pub entry_index: usize,
}

/// The append-only recording log file.
///
/// All entries are loaded at open; queries are served from memory and
/// appends go straight to disk followed by a data sync.
pub struct RecordingLog {
    path: PathBuf,
    file: File,
    entries: Vec<Entry>,
}

impl RecordingLog {
    /// Open (or create) the recording log in `dir` and load all entries.
    pub fn open(dir: &Path) -> Result<Self, BackupError> {
        let path = dir.join(RECORDING_LOG_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| BackupError::storage(StorageVerb::Open, path.display(), &e))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| BackupError::storage(StorageVerb::Read, path.display(), &e))?;

        if raw.len() % RECORD_LENGTH != 0 {
            return Err(BackupError::Frame {
                reason: format!(
                    "recording log {} is torn: {} bytes is not a whole number of {}-byte records",
                    path.display(),
                    raw.len(),
                    RECORD_LENGTH
                ),
            });
        }

        let mut entries = Vec::with_capacity(raw.len() / RECORD_LENGTH);
        let mut buf = &raw[..];
        while buf.remaining() >= RECORD_LENGTH {
            let entry_index = entries.len();
            entries.push(decode_entry(&mut buf, entry_index, &path)?);
        }

        tracing::debug!("opened recording log {} with {} entries", path.display(), entries.len());

        Ok(Self { path, file, entries })
    }

    /// All entries in append order, including invalidated ones.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Append a term entry mapping `leadership_term_id` to a local recording.
    ///
    /// The log position is left open-ended; the term is still being recorded.
    pub fn append_term(
        &mut self,
        recording_id: i64,
        leadership_term_id: i64,
        term_base_log_position: i64,
        timestamp: i64,
    ) -> Result<(), BackupError> {
        self.append(Entry {
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position: NULL_POSITION,
            timestamp,
            service_id: 0,
            entry_type: EntryType::Term,
            valid: true,
            entry_index: self.entries.len(),
        })
    }

    /// Append a snapshot entry.
    pub fn append_snapshot(
        &mut self,
        recording_id: i64,
        leadership_term_id: i64,
        term_base_log_position: i64,
        log_position: i64,
        timestamp: i64,
        service_id: i32,
    ) -> Result<(), BackupError> {
        self.append(Entry {
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position,
            timestamp,
            service_id,
            entry_type: EntryType::Snapshot,
            valid: true,
            entry_index: self.entries.len(),
        })
    }

    /// The most recently appended valid term entry.
    pub fn find_last_term(&self) -> Option<&Entry> {
        self.entries.iter().rev().find(|e| e.valid && e.entry_type == EntryType::Term)
    }

    /// The most recently appended valid snapshot for `service_id`.
    pub fn get_latest_snapshot(&self, service_id: i32) -> Option<&Entry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.valid && e.entry_type == EntryType::Snapshot && e.service_id == service_id)
    }

    /// Whether no valid term entry exists for `leadership_term_id`.
    pub fn is_unknown(&self, leadership_term_id: i64) -> bool {
        !self
            .entries
            .iter()
            .any(|e| e.valid && e.entry_type == EntryType::Term && e.leadership_term_id == leadership_term_id)
    }

    fn append(&mut self, entry: Entry) -> Result<(), BackupError> {
        let mut buf = BytesMut::with_capacity(RECORD_LENGTH);
        buf.put_i64_le(entry.recording_id);
        buf.put_i64_le(entry.leadership_term_id);
        buf.put_i64_le(entry.term_base_log_position);
        buf.put_i64_le(entry.log_position);
        buf.put_i64_le(entry.timestamp);
        buf.put_i32_le(entry.service_id);
        buf.put_u8(entry.entry_type.code());
        buf.put_u8(entry.valid as u8);
        buf.put_u16_le(0);

        self.file
            .write_all(&buf)
            .map_err(|e| BackupError::storage(StorageVerb::Write, self.path.display(), &e))?;
        self.file
            .sync_data()
            .map_err(|e| BackupError::storage(StorageVerb::Sync, self.path.display(), &e))?;

        tracing::debug!(
            "recording log append: type={:?} recordingId={} leadershipTermId={} position={}",
            entry.entry_type,
            entry.recording_id,
            entry.leadership_term_id,
            entry.log_position,
        );

        self.entries.push(entry);
        Ok(())
    }
}

fn decode_entry(buf: &mut impl Buf, entry_index: usize, path: &Path) -> Result<Entry, BackupError> {
    let recording_id = buf.get_i64_le();
    let leadership_term_id = buf.get_i64_le();
    let term_base_log_position = buf.get_i64_le();
    let log_position = buf.get_i64_le();
    let timestamp = buf.get_i64_le();
    let service_id = buf.get_i32_le();
    let type_code = buf.get_u8();
    let valid = buf.get_u8() != 0;
    let _pad = buf.get_u16_le();

    let entry_type = EntryType::from_code(type_code).ok_or_else(|| BackupError::Frame {
        reason: format!(
            "recording log {} entry {} has unknown type code {}",
            path.display(),
            entry_index,
            type_code
        ),
    })?;

    Ok(Entry {
        recording_id,
        leadership_term_id,
        term_base_log_position,
        log_position,
        timestamp,
        service_id,
        entry_type,
        valid,
        entry_index,
    })
}
