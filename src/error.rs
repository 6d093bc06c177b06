//! Error types raised by the backup agent.

use std::fmt;

use anyerror::AnyError;

use crate::config::ConfigError;

/// How severe a [`BackupError`] is for the backup as a whole.
///
/// `Warn` errors are expected operational interruptions: the agent reports
/// them to the events listener, resets, and resumes after the cool-down.
/// `Error` means the current cycle failed in a way the caller should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Severity {
    /// A recoverable interruption, reported and debounced.
    Warn,
    /// A failed operation, reported and re-raised from `do_work`.
    Error,
}

/// What the storage layer was doing when an IO error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum StorageVerb {
    /// Reading data.
    Read,
    /// Writing data.
    Write,
    /// Opening or creating a file.
    Open,
    /// Flushing data to durable media.
    Sync,
}

impl fmt::Display for StorageVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error raised while backing up a cluster.
///
/// The variants map onto three propagation policies: frames with an unknown
/// template id are discarded before an error is ever built, `Warn`-severity
/// variants are reported to the listener and debounced through
/// `RESET_BACKUP`, and everything else is reported, triggers a reset, and is
/// re-raised to the caller of `do_work`.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The consensus subscription delivered a frame from a different schema.
    #[error("expected schemaId={expected}, actual={actual}")]
    ProtocolMismatch {
        /// The schema id this agent speaks.
        expected: u16,
        /// The schema id found in the frame header.
        actual: u16,
    },

    /// An archive control response carried an error code.
    #[error("archive response for correlationId={correlation_id}, error: {message}")]
    Archive {
        /// Correlation id of the failed request.
        correlation_id: i64,
        /// Error message returned by the archive.
        message: String,
    },

    /// No progress was made within the configured progress timeout.
    #[error("progress has stalled")]
    ProgressStalled,

    /// The live-log recording counter disappeared from the counters registry.
    #[error("log recording counter became unavailable")]
    CounterUnavailable,

    /// A snapshot transfer observed an unexpected recording signal or an
    /// archive error while streaming.
    #[error("error occurred while transferring snapshot: {0}")]
    SnapshotRetrieve(String),

    /// A frame could not be decoded.
    #[error("frame decode failed: {reason}")]
    Frame {
        /// Why decoding failed.
        reason: String,
    },

    /// A channel URI string could not be parsed.
    #[error("invalid channel URI {uri:?}: {reason}")]
    Channel {
        /// The offending URI.
        uri: String,
        /// Why parsing failed.
        reason: String,
    },

    /// Durable storage (recording log, mark file) failed.
    #[error("storage failed when {verb} {target}: {source}")]
    Storage {
        /// What the storage layer was doing.
        verb: StorageVerb,
        /// Which file or component failed.
        target: String,
        /// The underlying error.
        source: AnyError,
    },

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BackupError {
    /// Severity of this error: `Warn` for expected operational interruptions,
    /// `Error` otherwise.
    pub fn severity(&self) -> Severity {
        match self {
            Self::ProgressStalled | Self::CounterUnavailable => Severity::Warn,
            _ => Severity::Error,
        }
    }

    /// Build a [`BackupError::Storage`] from an IO error.
    pub fn storage(verb: StorageVerb, target: impl ToString, source: &std::io::Error) -> Self {
        Self::Storage {
            verb,
            target: target.to_string(),
            source: AnyError::new(source),
        }
    }
}
