//! # Wire Protocol Messages
//!
//! Serializable request/response types for the five Kademlia RPCs, plus the
//! bounded bincode codec used on every frame.
//!
//! ## Envelope
//!
//! Every request carries the sender's [`Contact`] and a fresh `msg_id`; every
//! response echoes that `msg_id` so the caller can reject replies that do not
//! belong to its call.
//!
//! | RPC | Request extras | Response extras |
//! |-----|----------------|-----------------|
//! | PING | — | — |
//! | STORE | key, value | error |
//! | FIND_NODE | target | nodes |
//! | FIND_VALUE | key, update_timestamp | value OR nodes |
//! | DELETE | key | nodes, error |
//!
//! The FIND_VALUE response keeps two wire fields (optional value + node
//! list, one of them empty) for compatibility with other implementations of
//! the same schema; [`FindValueReply`] is the tagged in-process view.
//!
//! ## Security Limits
//!
//! - `MAX_VALUE_SIZE` bounds stored payloads (1 MiB)
//! - All deserialization goes through [`deserialize_bounded`] with a hard
//!   size limit to prevent memory exhaustion from hostile frames

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Contact, NodeId};

/// Maximum size of a stored value (1 MiB). Larger payloads must be chunked
/// by the caller; the DFS layer splits files well below this.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization. Slightly larger than
/// `MAX_VALUE_SIZE` to allow for message framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Bincode options with fixint encoding and the size limit enforced.
/// Always use this for deserialization.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize a wire message with the same options the decoder uses.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Ping {
        sender: Contact,
        msg_id: NodeId,
    },
    Store {
        sender: Contact,
        msg_id: NodeId,
        key: NodeId,
        value: Vec<u8>,
    },
    FindNode {
        sender: Contact,
        msg_id: NodeId,
        target: NodeId,
    },
    FindValue {
        sender: Contact,
        msg_id: NodeId,
        key: NodeId,
        update_timestamp: bool,
    },
    Delete {
        sender: Contact,
        msg_id: NodeId,
        key: NodeId,
    },
}

impl RpcRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            RpcRequest::Ping { sender, .. }
            | RpcRequest::Store { sender, .. }
            | RpcRequest::FindNode { sender, .. }
            | RpcRequest::FindValue { sender, .. }
            | RpcRequest::Delete { sender, .. } => sender,
        }
    }

    pub fn msg_id(&self) -> NodeId {
        match self {
            RpcRequest::Ping { msg_id, .. }
            | RpcRequest::Store { msg_id, .. }
            | RpcRequest::FindNode { msg_id, .. }
            | RpcRequest::FindValue { msg_id, .. }
            | RpcRequest::Delete { msg_id, .. } => *msg_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Pong {
        msg_id: NodeId,
    },
    StoreResult {
        msg_id: NodeId,
        error: Option<String>,
    },
    FindNodeResult {
        msg_id: NodeId,
        nodes: Vec<Contact>,
    },
    /// Wire form of FIND_VALUE: exactly one of `value` / `nodes` is populated.
    FindValueResult {
        msg_id: NodeId,
        value: Option<Vec<u8>>,
        nodes: Vec<Contact>,
    },
    DeleteResult {
        msg_id: NodeId,
        nodes: Vec<Contact>,
        error: Option<String>,
    },
}

impl RpcResponse {
    pub fn msg_id(&self) -> NodeId {
        match self {
            RpcResponse::Pong { msg_id }
            | RpcResponse::StoreResult { msg_id, .. }
            | RpcResponse::FindNodeResult { msg_id, .. }
            | RpcResponse::FindValueResult { msg_id, .. }
            | RpcResponse::DeleteResult { msg_id, .. } => *msg_id,
        }
    }
}

/// In-process view of a FIND_VALUE reply: the value was either present at
/// the queried node, or the node returned its closest known contacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    Value(Vec<u8>),
    Nodes(Vec<Contact>),
}

impl FindValueReply {
    /// Collapse the two-field wire form into the tagged view. A populated
    /// `value` wins; `nodes` is only meaningful when the value is absent.
    pub fn from_wire(value: Option<Vec<u8>>, nodes: Vec<Contact>) -> Self {
        match value {
            Some(v) => FindValueReply::Value(v),
            None => FindValueReply::Nodes(nodes),
        }
    }
}
