//! The seams between the backup agent and its messaging/archive substrate.
//!
//! The agent is generic over a [`ClusterClient`], which supplies consensus
//! publications and subscriptions, archive connections, and access to the
//! shared counters registry. Production deployments back these traits with a
//! real messaging layer; [`crate::testing`] backs them with scripted fakes.

mod archive;
mod client;
mod clock;
mod signal;

pub use archive::ArchiveClient;
pub use archive::ArchiveContext;
pub use archive::PendingArchiveConnect;
pub use archive::SourceLocation;
pub use client::ClusterClient;
pub use client::Publication;
pub use client::Subscription;
pub use clock::EpochClock;
pub use clock::SystemEpochClock;
pub use signal::ControlResponseCode;
pub use signal::RecordingEventConsumer;
pub use signal::RecordingSignal;
pub use signal::RecordingSignalEvent;
