//! Wire message schema and its binary codec.
//!
//! Encoded with `bincode` over serde-derived types whose field order is
//! fixed and never reordered across versions, giving the same stability
//! guarantee a hand-maintained tag-numbered schema would.

use serde::{Deserialize, Serialize};

use crate::sequences::NodeSequences;
use crate::update::Update;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GossipPayload {
    pub node_id: String,
    pub known_peers: Vec<String>,
    pub last_sequences: NodeSequences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequestPayload {
    pub since: NodeSequences,
    pub max_results: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchUpdatePayload {
    pub updates: Vec<Update>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub sequences: NodeSequences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageContent {
    Gossip(GossipPayload),
    Update(Update),
    UpdateRequest(UpdateRequestPayload),
    BatchUpdate(BatchUpdatePayload),
    Heartbeat(HeartbeatPayload),
}

/// Every frame carries the sender's full progress vector alongside its
/// specific content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub node_sequences: NodeSequences,
    pub content: MessageContent,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::update::UpdateType;

    fn sample_update() -> Update {
        Update {
            node_id: 1,
            sequence_no: 42,
            timestamp: Timestamp::new(1000, 3),
            update_type: UpdateType::UpsertRecord,
            record_id: "r1".to_string(),
            database_name: "db1".to_string(),
            data_streams: vec![crate::update::DataStream {
                stream_id: 0,
                data: vec![1, 2, 3],
            }],
        }
    }

    fn roundtrip(m: Message) {
        let bytes = m.encode().unwrap();
        let back = Message::decode(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn gossip_roundtrips() {
        let mut seqs = NodeSequences::new();
        seqs.update(1, 5);
        roundtrip(Message {
            node_sequences: seqs.clone(),
            content: MessageContent::Gossip(GossipPayload {
                node_id: "node-1".to_string(),
                known_peers: vec!["ws://a".to_string(), "ws://b".to_string()],
                last_sequences: seqs,
            }),
        });
    }

    #[test]
    fn update_roundtrips() {
        roundtrip(Message {
            node_sequences: NodeSequences::new(),
            content: MessageContent::Update(sample_update()),
        });
    }

    #[test]
    fn update_request_roundtrips() {
        roundtrip(Message {
            node_sequences: NodeSequences::new(),
            content: MessageContent::UpdateRequest(UpdateRequestPayload {
                since: NodeSequences::new(),
                max_results: 100,
            }),
        });
    }

    #[test]
    fn batch_update_roundtrips() {
        roundtrip(Message {
            node_sequences: NodeSequences::new(),
            content: MessageContent::BatchUpdate(BatchUpdatePayload {
                updates: vec![sample_update(), sample_update()],
                has_more: true,
            }),
        });
    }

    #[test]
    fn heartbeat_roundtrips() {
        roundtrip(Message {
            node_sequences: NodeSequences::new(),
            content: MessageContent::Heartbeat(HeartbeatPayload {
                sequences: NodeSequences::new(),
            }),
        });
    }

    #[test]
    fn decode_of_garbage_is_a_protocol_error() {
        assert!(Message::decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
