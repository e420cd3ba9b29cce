//! Protocol trait for the node's outbound RPC surface.
//!
//! [`KademliaRpc`] abstracts the transport away from the DHT core: the
//! production implementation dials TCP (see `rpc`), while tests drive the
//! same trait with an in-process network. Each method is a single-hop
//! primitive; iterative procedures are built on top of these in `dht`.
//!
//! Implementations generate a fresh `msg_id` per call and must treat a reply
//! carrying any other `msg_id` as a failed call.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Contact, NodeId};
use crate::messages::FindValueReply;

/// Single-hop Kademlia RPC operations.
#[async_trait]
pub trait KademliaRpc: Send + Sync + 'static {
    /// Liveness echo.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Store a key-value pair on a remote node.
    async fn store(&self, to: &Contact, key: NodeId, value: Vec<u8>) -> Result<()>;

    /// Ask a node for the k closest contacts it knows to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Ask a node for the value under `key`, or its closest contacts to it.
    /// `update_timestamp` requests a freshness touch on a hit.
    async fn find_value(
        &self,
        to: &Contact,
        key: NodeId,
        update_timestamp: bool,
    ) -> Result<FindValueReply>;

    /// Remove `key` from a remote node's store; returns its closest contacts.
    async fn delete(&self, to: &Contact, key: NodeId) -> Result<Vec<Contact>>;
}
