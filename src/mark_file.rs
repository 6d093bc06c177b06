//! Liveness mark file updated once per clock tick.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::error::BackupError;
use crate::error::StorageVerb;

/// File name of the mark file inside the cluster directory.
pub const MARK_FILE_NAME: &str = "cluster-backup-mark.dat";

const MAGIC: u32 = 0x4261_6b55; // "BakU"
const VERSION: u32 = 1;
const HEADER_LENGTH: usize = 16;
const TIMESTAMP_OFFSET: u64 = 8;

/// A small header file whose activity timestamp tells external tooling the
/// agent's duty cycle is still turning over.
pub struct MarkFile {
    path: PathBuf,
    file: File,
}

impl MarkFile {
    /// Create or re-open the mark file in `dir`.
    ///
    /// A pre-existing file must carry the expected magic and version.
    pub fn create(dir: &Path) -> Result<Self, BackupError> {
        let path = dir.join(MARK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BackupError::storage(StorageVerb::Open, path.display(), &e))?;

        let len = file
            .metadata()
            .map_err(|e| BackupError::storage(StorageVerb::Read, path.display(), &e))?
            .len();

        if len == 0 {
            let mut buf = BytesMut::with_capacity(HEADER_LENGTH);
            buf.put_u32_le(MAGIC);
            buf.put_u32_le(VERSION);
            buf.put_i64_le(0);
            file.write_all(&buf)
                .map_err(|e| BackupError::storage(StorageVerb::Write, path.display(), &e))?;
        } else {
            let mut raw = [0u8; 8];
            file.read_exact(&mut raw)
                .map_err(|e| BackupError::storage(StorageVerb::Read, path.display(), &e))?;
            let mut buf = &raw[..];
            let magic = buf.get_u32_le();
            let version = buf.get_u32_le();

            if magic != MAGIC || version != VERSION {
                return Err(BackupError::Frame {
                    reason: format!(
                        "mark file {} has magic={:#x} version={}, expected magic={:#x} version={}",
                        path.display(),
                        magic,
                        version,
                        MAGIC,
                        VERSION
                    ),
                });
            }
        }

        Ok(Self { path, file })
    }

    /// Overwrite the activity timestamp in place.
    pub fn update_activity_timestamp(&mut self, now_ms: i64) -> Result<(), BackupError> {
        self.file
            .seek(SeekFrom::Start(TIMESTAMP_OFFSET))
            .and_then(|_| self.file.write_all(&now_ms.to_le_bytes()))
            .map_err(|e| BackupError::storage(StorageVerb::Write, self.path.display(), &e))
    }

    /// Read back the activity timestamp.
    pub fn activity_timestamp_ms(&mut self) -> Result<i64, BackupError> {
        let mut raw = [0u8; 8];
        self.file
            .seek(SeekFrom::Start(TIMESTAMP_OFFSET))
            .and_then(|_| self.file.read_exact(&mut raw))
            .map_err(|e| BackupError::storage(StorageVerb::Read, self.path.display(), &e))?;
        Ok(i64::from_le_bytes(raw))
    }
}
