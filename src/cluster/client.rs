use bytes::Bytes;

use crate::cluster::archive::ArchiveClient;
use crate::cluster::archive::ArchiveContext;
use crate::cluster::archive::PendingArchiveConnect;
use crate::error::BackupError;

/// An exclusive outbound stream to one consensus endpoint.
pub trait Publication {
    /// Whether a subscriber is connected.
    fn is_connected(&self) -> bool;

    /// Offer a frame; `false` means the frame was not accepted this cycle
    /// and should be retried.
    fn try_offer(&mut self, frame: &[u8]) -> bool;
}

/// An inbound stream of consensus frames.
pub trait Subscription {
    /// Poll up to `fragment_limit` whole frames.
    ///
    /// Frames are returned owned so the caller is free to mutate itself
    /// while handling them; an empty poll performs no allocation.
    fn poll(&mut self, fragment_limit: usize) -> Vec<Bytes>;
}

/// The messaging client the agent is built over.
///
/// One implementation drives the production transport; the fakes in
/// [`crate::testing`] implement the same trait for deterministic tests. All
/// operations are non-blocking: connection establishment is asynchronous and
/// polled, and the client's own housekeeping runs inside [`invoke`].
///
/// [`invoke`]: ClusterClient::invoke
pub trait ClusterClient {
    /// Outbound consensus stream type.
    type Publication: Publication;
    /// Inbound consensus stream type.
    type Subscription: Subscription;
    /// Archive control session type.
    type Archive: ArchiveClient;
    /// In-flight archive connect type.
    type ArchiveConnect: PendingArchiveConnect<Archive = Self::Archive>;

    /// Run one duty cycle of the client's own conductor; returns work done.
    fn invoke(&mut self) -> usize;

    /// A client-unique correlation id.
    fn next_correlation_id(&mut self) -> i64;

    /// Open an exclusive publication.
    fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<Self::Publication, BackupError>;

    /// Open a subscription.
    fn add_subscription(&mut self, channel: &str, stream_id: i32) -> Result<Self::Subscription, BackupError>;

    /// Connect an archive control session, blocking only on local setup.
    fn connect_archive(&mut self, ctx: &ArchiveContext) -> Result<Self::Archive, BackupError>;

    /// Begin an asynchronous archive connect.
    fn async_connect_archive(&mut self, ctx: &ArchiveContext) -> Result<Self::ArchiveConnect, BackupError>;

    /// Find the recording-position counter for a recording session.
    fn find_recording_counter_by_session(&self, session_id: i32) -> Option<i32>;

    /// The recording id labelled on a recording-position counter.
    fn recording_id(&self, counter_id: i32) -> Option<i64>;

    /// Current value of a counter.
    fn counter_value(&self, counter_id: i32) -> i64;

    /// Drain the next counter id that became unavailable since the last
    /// call, if any. Replaces a registered unavailable-counter callback in a
    /// poll-friendly shape.
    fn next_unavailable_counter(&mut self) -> Option<i32>;
}
