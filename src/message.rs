//! Wire framing shared by all seven protocols.
//!
//! Every message is tagged with a fixed header `(sender, requestId)` and
//! carries a kind-specific payload (§4.1 of the specification). All seven
//! protocols share the same concrete encoding: a `serde`-derived envelope,
//! encoded with `bincode`. An undecodable message is a programming error,
//! not a recoverable fault, so decode failures are surfaced as
//! [`ErrorKind::MessageDecode`] for the dispatch loop to treat as fatal.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, WrappedResult};
use crate::node_id::NodeId;

/// Fixed header carried by every message: sender id plus a request id that is
/// monotonically increasing, scoped to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub sender: NodeId,
    pub request_id: u64,
}

impl Header {
    pub fn new(sender: NodeId, request_id: u64) -> Self {
        Self { sender, request_id }
    }
}

/// A header paired with a kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage<K> {
    pub header: Header,
    pub kind: K,
}

impl<K> StoredMessage<K> {
    pub fn new(header: Header, kind: K) -> Self {
        Self { header, kind }
    }
}

/// What actually travels down a node's inbox channel: either a protocol
/// message, or the driver's shutdown signal used to unwind the inbox loop
/// once the iteration target has been reached (§4.2, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame<K> {
    Message(StoredMessage<K>),
    Shutdown,
}

/// Serialises a frame into an opaque byte sequence.
pub fn encode<K: Serialize>(frame: &Frame<K>) -> Result<Vec<u8>> {
    bincode::serialize(frame).wrapped(ErrorKind::MessageEncode)
}

/// Deserialises a frame previously produced by [`encode`]. A failure here is
/// fatal: it means either corruption or a protocol/version mismatch, which
/// this closed simulator never produces under correct operation.
pub fn decode<K: DeserializeOwned>(bytes: &[u8]) -> Result<Frame<K>> {
    bincode::deserialize(bytes).wrapped(ErrorKind::MessageDecode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Demo {
        Ping,
        Resources(Vec<u32>),
    }

    #[test]
    fn round_trips_message_variants() {
        let msg = Frame::Message(StoredMessage::new(
            Header::new(NodeId(2), 7),
            Demo::Resources(vec![1, 3, 5]),
        ));
        let bytes = encode(&msg).unwrap();
        let decoded: Frame<Demo> = decode(&bytes).unwrap();
        match decoded {
            Frame::Message(stored) => {
                assert_eq!(stored.header.sender, NodeId(2));
                assert_eq!(stored.header.request_id, 7);
                assert_eq!(stored.kind, Demo::Resources(vec![1, 3, 5]));
            }
            Frame::Shutdown => panic!("expected a message frame"),
        }
    }

    #[test]
    fn round_trips_shutdown() {
        let bytes = encode::<Demo>(&Frame::Shutdown).unwrap();
        let decoded: Frame<Demo> = decode(&bytes).unwrap();
        assert!(matches!(decoded, Frame::Shutdown));
    }

    #[test]
    fn decode_failure_is_reported_not_panicked() {
        let garbage = vec![0xffu8; 4];
        let err = decode::<Demo>(&garbage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageDecode);
    }
}
