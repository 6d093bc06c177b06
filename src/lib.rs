//! Off-cluster backup for replicated-log consensus clusters.
//!
//! The crate provides a single-threaded, cooperatively scheduled
//! [`ClusterBackupAgent`] that maintains an off-cluster replica of a
//! consensus cluster. Each duty cycle it discovers the current leader,
//! retrieves snapshots missing from the local store, keeps a bounded replay
//! of the leader's committed log recording into a local archive, and applies
//! the resulting terms and snapshots to a durable [`RecordingLog`] index.
//!
//! The agent never blocks: every long-running operation against the cluster
//! (endpoint probing, archive connect, stop-position query, bounded replay,
//! recording-signal observation, counter lookup) is polled once per
//! invocation of [`Agent::do_work`]. The transport and archive substrate is
//! abstracted behind the traits in [`cluster`], so the agent can be driven
//! against a production messaging layer or the in-memory fakes in
//! [`testing`].
//!
//! ```ignore
//! use cluster_backup::Agent;
//! use cluster_backup::ClusterBackupAgent;
//! use cluster_backup::Config;
//!
//! let config = Config::build(&[
//!     "backup",
//!     "--cluster-consensus-endpoints=host0:9010,host1:9010",
//!     "--cluster-dir=/var/lib/cluster-backup",
//! ])?;
//! let mut agent = ClusterBackupAgent::new(config, client, clock, None)?;
//! agent.on_start()?;
//! loop {
//!     agent.do_work()?;
//! }
//! ```

#![allow(clippy::bool_comparison)]
#![allow(clippy::uninlined_format_args)]
#![deny(unused_qualifications)]

mod agent;
mod channel;
mod counters;
mod error;
mod mark_file;
mod state;

pub mod backup;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod model;
pub mod recording_log;
pub mod testing;

pub use agent::Agent;
pub use agent::AgentRunner;
pub use agent::IdleStrategy;
pub use channel::ChannelUri;
pub use channel::ENDPOINT_PARAM_NAME;
pub use channel::SESSION_ID_PARAM_NAME;
pub use counters::Counter;
pub use counters::NULL_COUNTER_ID;
pub use counters::NULL_LENGTH;
pub use counters::NULL_POSITION;
pub use counters::NULL_TIMESTAMP;
pub use counters::NULL_VALUE;
pub use error::BackupError;
pub use error::Severity;
pub use error::StorageVerb;
pub use mark_file::MarkFile;
pub use state::AgentState;
pub use state::ReplayStep;
pub use state::RetrieveStep;

pub use crate::backup::ClusterBackupAgent;
pub use crate::backup::ClusterBackupEventsListener;
pub use crate::backup::SnapshotRetrieveMonitor;
pub use crate::cluster::ArchiveClient;
pub use crate::cluster::ArchiveContext;
pub use crate::cluster::ClusterClient;
pub use crate::cluster::EpochClock;
pub use crate::cluster::SystemEpochClock;
pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::model::ClusterMember;
pub use crate::model::SnapshotDescriptor;
pub use crate::recording_log::RecordingLog;
