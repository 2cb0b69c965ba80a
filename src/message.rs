//! Inter-node wire message codec.
//!
//! Framing: a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! object, with envelope fields `type`, `sender_id`, `term`, `timestamp`,
//! `message_id`, `data` and a 10 MiB frame cap. `message_id` is generated
//! but never consulted for dedup — every receiver rule in `node` is
//! idempotent under duplicates.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, NodeId, Term};

pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    AppendEntries,
    AppendAck,
    RequestVote,
    VoteResponse,
    ClientRequest,
    ClientResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesData {
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    #[serde(default)]
    pub sub_leaders: BTreeMap<NodeId, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendAckData {
    pub success: bool,
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteData {
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponseData {
    pub vote_granted: bool,
}

/// The type-dependent payload. Deserialization dispatches on the envelope's
/// `type` field rather than relying on serde's untagged-enum field sniffing,
/// so a message that type-checks by accident (e.g. a future client type
/// reusing a field name) can never be misrouted.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageData {
    AppendEntries(AppendEntriesData),
    AppendAck(AppendAckData),
    RequestVote(RequestVoteData),
    VoteResponse(VoteResponseData),
    /// Reserved client message types: carried opaquely, never interpreted
    /// by the consensus core.
    Opaque(serde_json::Value),
}

impl MessageData {
    fn from_value(message_type: MessageType, value: serde_json::Value) -> Result<Self> {
        Ok(match message_type {
            MessageType::AppendEntries => {
                MessageData::AppendEntries(serde_json::from_value(value)?)
            }
            MessageType::AppendAck => MessageData::AppendAck(serde_json::from_value(value)?),
            MessageType::RequestVote => MessageData::RequestVote(serde_json::from_value(value)?),
            MessageType::VoteResponse => {
                MessageData::VoteResponse(serde_json::from_value(value)?)
            }
            MessageType::ClientRequest | MessageType::ClientResponse => {
                MessageData::Opaque(value)
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub sender_id: NodeId,
    pub term: Term,
    pub timestamp: f64,
    pub message_id: String,
    pub data: MessageData,
}

impl Message {
    pub fn new(message_type: MessageType, sender_id: NodeId, term: Term, data: MessageData) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let message_id = format!("{}_{}", sender_id, (timestamp * 1_000_000.0) as u64);
        Message { message_type, sender_id, term, timestamp, message_id, data }
    }

    pub fn append_entries(
        sender_id: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        sub_leaders: BTreeMap<NodeId, u8>,
    ) -> Self {
        Message::new(
            MessageType::AppendEntries,
            sender_id,
            term,
            MessageData::AppendEntries(AppendEntriesData {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                sub_leaders,
            }),
        )
    }

    pub fn append_ack(sender_id: NodeId, term: Term, success: bool, match_index: LogIndex) -> Self {
        Message::new(
            MessageType::AppendAck,
            sender_id,
            term,
            MessageData::AppendAck(AppendAckData { success, match_index }),
        )
    }

    pub fn request_vote(
        sender_id: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Self {
        Message::new(
            MessageType::RequestVote,
            sender_id,
            term,
            MessageData::RequestVote(RequestVoteData { last_log_index, last_log_term }),
        )
    }

    pub fn vote_response(sender_id: NodeId, term: Term, vote_granted: bool) -> Self {
        Message::new(
            MessageType::VoteResponse,
            sender_id,
            term,
            MessageData::VoteResponse(VoteResponseData { vote_granted }),
        )
    }

    /// Serialize to length-prefixed JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len: u32 = json
            .len()
            .try_into()
            .map_err(|_| RaftError::MessageTooLarge { size: u32::MAX, limit: MAX_FRAME_SIZE })?;
        if len > MAX_FRAME_SIZE {
            return Err(RaftError::MessageTooLarge { size: len, limit: MAX_FRAME_SIZE });
        }
        let mut out = Vec::with_capacity(4 + json.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.encode()?)?;
        Ok(())
    }

    /// Blocks until a full frame (or EOF/error) has been read from `r`.
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(RaftError::MessageTooLarge { size: len, limit: MAX_FRAME_SIZE });
        }
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(6))?;
        map.serialize_entry("type", &self.message_type)?;
        map.serialize_entry("sender_id", &self.sender_id)?;
        map.serialize_entry("term", &self.term)?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("message_id", &self.message_id)?;
        map.serialize_entry("data", &self.data)?;
        map.end()
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    message_type: MessageType,
    sender_id: NodeId,
    term: Term,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawMessage::deserialize(deserializer)?;
        let data = MessageData::from_value(raw.message_type, raw.data).map_err(DeError::custom)?;
        Ok(Message {
            message_type: raw.message_type,
            sender_id: raw.sender_id,
            term: raw.term,
            timestamp: raw.timestamp,
            message_id: raw.message_id,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERM: Term = 7;
    const SENDER: NodeId = 2;

    #[test]
    fn append_entries_round_trips_through_encode_decode() {
        let entries = vec![LogEntry::new(TERM, serde_json::json!({"type": "increment"}), 1)];
        let mut subs = BTreeMap::new();
        subs.insert(1u64, 0u8);
        subs.insert(3u64, 1u8);
        let msg = Message::append_entries(SENDER, TERM, 0, 0, entries.clone(), 1, subs.clone());

        let encoded = msg.encode().unwrap();
        let decoded = Message::read_from(&mut &encoded[..]).unwrap();

        assert_eq!(decoded.sender_id, SENDER);
        assert_eq!(decoded.term, TERM);
        match decoded.data {
            MessageData::AppendEntries(d) => {
                assert_eq!(d.entries, entries);
                assert_eq!(d.leader_commit, 1);
                assert_eq!(d.sub_leaders, subs);
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn sub_leader_keys_arrive_as_json_strings_and_decode_back_to_node_ids() {
        let raw = serde_json::json!({
            "type": "AppendEntries",
            "sender_id": 0,
            "term": 1,
            "timestamp": 0.0,
            "message_id": "0_1",
            "data": {
                "prev_log_index": 0,
                "prev_log_term": 0,
                "entries": [],
                "leader_commit": 0,
                "sub_leaders": { "1": 0, "3": 1 }
            }
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        match msg.data {
            MessageData::AppendEntries(d) => {
                assert_eq!(d.sub_leaders.get(&1u64), Some(&0u8));
                assert_eq!(d.sub_leaders.get(&3u64), Some(&1u8));
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn append_entries_with_missing_sub_leaders_defaults_to_empty() {
        let raw = serde_json::json!({
            "type": "AppendAck",
            "sender_id": 4,
            "term": 9,
            "timestamp": 0.0,
            "message_id": "4_1",
            "data": { "success": true, "match_index": 12 }
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        match msg.data {
            MessageData::AppendAck(d) => {
                assert!(d.success);
                assert_eq!(d.match_index, 12);
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocating_the_body() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let err = Message::read_from(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, RaftError::MessageTooLarge { .. }));
    }
}
