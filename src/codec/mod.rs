//! Framed little-endian codec for the consensus backup exchange.
//!
//! Every frame starts with an 8-byte [`MessageHeader`]. A frame whose schema
//! id differs from [`SCHEMA_ID`] is a protocol mismatch; a frame with an
//! unknown template id is ignored by the agent. Only two templates exist:
//! the outbound [`BackupQuery`] and the inbound
//! [`BackupResponse`](crate::model::BackupResponse).


use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::BackupError;
use crate::model::BackupResponse;
use crate::model::SnapshotDescriptor;

/// Schema id of the backup exchange.
pub const SCHEMA_ID: u16 = 111;

/// Version of the frame encoding.
pub const SCHEMA_VERSION: u16 = 1;

/// Template id of a [`BackupQuery`] frame.
pub const TEMPLATE_BACKUP_QUERY: u16 = 70;

/// Template id of a `BackupResponse` frame.
pub const TEMPLATE_BACKUP_RESPONSE: u16 = 71;

const BACKUP_QUERY_BLOCK_LENGTH: u16 = 16;
const BACKUP_RESPONSE_BLOCK_LENGTH: u16 = 56;
const SNAPSHOT_ENTRY_LENGTH: usize = 44;

/// Major component of the protocol semantic version.
pub const PROTOCOL_MAJOR_VERSION: i32 = 1;
/// Minor component of the protocol semantic version.
pub const PROTOCOL_MINOR_VERSION: i32 = 0;
/// Patch component of the protocol semantic version.
pub const PROTOCOL_PATCH_VERSION: i32 = 0;

/// The protocol semantic version carried in every `BackupQuery`.
pub fn protocol_semantic_version() -> i32 {
    (PROTOCOL_MAJOR_VERSION << 16) | (PROTOCOL_MINOR_VERSION << 8) | PROTOCOL_PATCH_VERSION
}

/// Fixed frame header: `{block_length, template_id, schema_id, version}`,
/// all `u16` little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Length of the fixed block following the header.
    pub block_length: u16,
    /// Which message the frame carries.
    pub template_id: u16,
    /// Schema the sender speaks.
    pub schema_id: u16,
    /// Encoding version of that schema.
    pub version: u16,
}

impl MessageHeader {
    /// Encoded length of the header in bytes.
    pub const ENCODED_LENGTH: usize = 8;

    /// Header for a frame of `template_id` with the given block length.
    pub fn new(template_id: u16, block_length: u16) -> Self {
        Self {
            block_length,
            template_id,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        }
    }

    /// Append this header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.block_length);
        buf.put_u16_le(self.template_id);
        buf.put_u16_le(self.schema_id);
        buf.put_u16_le(self.version);
    }

    /// Decode a header, consuming [`Self::ENCODED_LENGTH`] bytes of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, BackupError> {
        ensure(buf, Self::ENCODED_LENGTH, "message header")?;
        Ok(Self {
            block_length: buf.get_u16_le(),
            template_id: buf.get_u16_le(),
            schema_id: buf.get_u16_le(),
            version: buf.get_u16_le(),
        })
    }
}

/// The outbound query asking a consensus endpoint for the cluster's backup
/// inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupQuery {
    /// Correlation id the response must echo.
    pub correlation_id: i64,
    /// Stream id the response should be published on.
    pub response_stream_id: i32,
    /// Protocol semantic version of the sender.
    pub version: i32,
    /// Channel the response should be published to.
    pub response_channel: String,
    /// Credentials blob, empty in the default configuration.
    pub encoded_credentials: Vec<u8>,
}

/// Encode a full `BackupQuery` frame, header included.
pub fn encode_backup_query(query: &BackupQuery) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        MessageHeader::ENCODED_LENGTH
            + BACKUP_QUERY_BLOCK_LENGTH as usize
            + 8
            + query.response_channel.len()
            + query.encoded_credentials.len(),
    );

    MessageHeader::new(TEMPLATE_BACKUP_QUERY, BACKUP_QUERY_BLOCK_LENGTH).encode(&mut buf);
    buf.put_i64_le(query.correlation_id);
    buf.put_i32_le(query.response_stream_id);
    buf.put_i32_le(query.version);
    put_string(&mut buf, &query.response_channel);
    put_bytes(&mut buf, &query.encoded_credentials);

    buf.freeze()
}

/// Decode a full `BackupQuery` frame, header included.
///
/// Verifies schema and template; used by tooling and the test harness, the
/// agent itself only ever decodes responses.
pub fn decode_backup_query(frame: &[u8]) -> Result<BackupQuery, BackupError> {
    let mut buf = frame;
    let header = MessageHeader::decode(&mut buf)?;

    if header.schema_id != SCHEMA_ID {
        return Err(BackupError::ProtocolMismatch {
            expected: SCHEMA_ID,
            actual: header.schema_id,
        });
    }
    if header.template_id != TEMPLATE_BACKUP_QUERY {
        return Err(BackupError::Frame {
            reason: format!("expected templateId={}, actual={}", TEMPLATE_BACKUP_QUERY, header.template_id),
        });
    }

    ensure(&buf, BACKUP_QUERY_BLOCK_LENGTH as usize, "backup query block")?;
    Ok(BackupQuery {
        correlation_id: buf.get_i64_le(),
        response_stream_id: buf.get_i32_le(),
        version: buf.get_i32_le(),
        response_channel: get_string(&mut buf)?,
        encoded_credentials: get_bytes(&mut buf)?,
    })
}

/// Encode a full `BackupResponse` frame, header included.
pub fn encode_backup_response(response: &BackupResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        MessageHeader::ENCODED_LENGTH
            + BACKUP_RESPONSE_BLOCK_LENGTH as usize
            + 8
            + response.snapshots.len() * SNAPSHOT_ENTRY_LENGTH
            + response.cluster_members.len(),
    );

    MessageHeader::new(TEMPLATE_BACKUP_RESPONSE, BACKUP_RESPONSE_BLOCK_LENGTH).encode(&mut buf);
    buf.put_i64_le(response.correlation_id);
    buf.put_i64_le(response.log_recording_id);
    buf.put_i64_le(response.log_leadership_term_id);
    buf.put_i64_le(response.log_term_base_log_position);
    buf.put_i64_le(response.last_leadership_term_id);
    buf.put_i64_le(response.last_term_base_log_position);
    buf.put_i32_le(response.commit_position_counter_id);
    buf.put_i32_le(response.leader_member_id);

    buf.put_u32_le(response.snapshots.len() as u32);
    for s in &response.snapshots {
        buf.put_i64_le(s.recording_id);
        buf.put_i64_le(s.leadership_term_id);
        buf.put_i64_le(s.term_base_log_position);
        buf.put_i64_le(s.log_position);
        buf.put_i64_le(s.timestamp);
        buf.put_i32_le(s.service_id);
    }

    put_string(&mut buf, &response.cluster_members);

    buf.freeze()
}

/// Decode a `BackupResponse` body, the header having already been consumed
/// and verified by the caller.
pub fn decode_backup_response(buf: &mut impl Buf) -> Result<BackupResponse, BackupError> {
    ensure(buf, BACKUP_RESPONSE_BLOCK_LENGTH as usize, "backup response block")?;

    let correlation_id = buf.get_i64_le();
    let log_recording_id = buf.get_i64_le();
    let log_leadership_term_id = buf.get_i64_le();
    let log_term_base_log_position = buf.get_i64_le();
    let last_leadership_term_id = buf.get_i64_le();
    let last_term_base_log_position = buf.get_i64_le();
    let commit_position_counter_id = buf.get_i32_le();
    let leader_member_id = buf.get_i32_le();

    ensure(buf, 4, "snapshots count")?;
    let count = buf.get_u32_le() as usize;

    let mut snapshots = Vec::with_capacity(count);
    for _ in 0..count {
        ensure(buf, SNAPSHOT_ENTRY_LENGTH, "snapshot entry")?;
        snapshots.push(SnapshotDescriptor {
            recording_id: buf.get_i64_le(),
            leadership_term_id: buf.get_i64_le(),
            term_base_log_position: buf.get_i64_le(),
            log_position: buf.get_i64_le(),
            timestamp: buf.get_i64_le(),
            service_id: buf.get_i32_le(),
        });
    }

    let cluster_members = get_string(buf)?;

    Ok(BackupResponse {
        correlation_id,
        log_recording_id,
        log_leadership_term_id,
        log_term_base_log_position,
        last_leadership_term_id,
        last_term_base_log_position,
        commit_position_counter_id,
        leader_member_id,
        snapshots,
        cluster_members,
    })
}

fn ensure(buf: &impl Buf, required: usize, what: &str) -> Result<(), BackupError> {
    if buf.remaining() < required {
        return Err(BackupError::Frame {
            reason: format!("{} requires {} bytes, {} remaining", what, required, buf.remaining()),
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn get_string(buf: &mut impl Buf) -> Result<String, BackupError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw).map_err(|e| BackupError::Frame {
        reason: format!("string field is not UTF-8: {}", e),
    })
}

fn get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>, BackupError> {
    ensure(buf, 4, "length prefix")?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len, "length-prefixed field")?;

    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(raw)
}
