use crate::error::BackupError;

/// A member of the backed-up cluster, as advertised in a backup response.
///
/// The wire encoding is a `|`-separated list of members, each with six
/// `,`-separated fields:
/// `id,client_endpoint,consensus_endpoint,log_endpoint,catchup_endpoint,archive_endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ClusterMember {
    /// Cluster-unique member id.
    pub id: i32,
    /// Endpoint serving client sessions.
    pub client_endpoint: String,
    /// Endpoint for consensus traffic, the one backup queries are sent to.
    pub consensus_endpoint: String,
    /// Endpoint the member publishes its log on.
    pub log_endpoint: String,
    /// Endpoint the member serves catch-up replays from.
    pub catchup_endpoint: String,
    /// Endpoint of the member's archive control channel.
    pub archive_endpoint: String,
}

/// Parse the member list carried in a backup response.
pub fn parse_members(value: &str) -> Result<Vec<ClusterMember>, BackupError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    value.split('|').filter(|m| !m.is_empty()).map(parse_member).collect()
}

fn parse_member(member: &str) -> Result<ClusterMember, BackupError> {
    let fields: Vec<&str> = member.split(',').collect();
    if fields.len() != 6 {
        return Err(BackupError::Frame {
            reason: format!("cluster member must have 6 fields, found {}: {:?}", fields.len(), member),
        });
    }

    let id = fields[0].parse::<i32>().map_err(|e| BackupError::Frame {
        reason: format!("invalid cluster member id {:?}: {}", fields[0], e),
    })?;

    Ok(ClusterMember {
        id,
        client_endpoint: fields[1].to_string(),
        consensus_endpoint: fields[2].to_string(),
        log_endpoint: fields[3].to_string(),
        catchup_endpoint: fields[4].to_string(),
        archive_endpoint: fields[5].to_string(),
    })
}

/// Find a member by id.
pub fn find_member(members: &[ClusterMember], id: i32) -> Option<&ClusterMember> {
    members.iter().find(|m| m.id == id)
}
