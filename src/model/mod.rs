//! Data model shared between the wire codec, the recording log and the agent.

mod cluster_member;
mod response;


pub use cluster_member::find_member;
pub use cluster_member::parse_members;
pub use cluster_member::ClusterMember;
pub use response::BackupResponse;
pub use response::SnapshotDescriptor;
