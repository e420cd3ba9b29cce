//! # kadfs - Kademlia Key-Value Overlay with a File-System Layer
//!
//! kadfs is a peer-to-peer key-value overlay. Every participating node is
//! symmetric: it routes lookups, stores values on behalf of the network,
//! and acts as a client for its operator. A thin distributed file-system
//! layer encodes directory trees and chunked file blobs as overlay values.
//!
//! ## Architecture
//!
//! - **Identity**: 160-bit identifiers in one XOR metric for nodes and keys
//! - **Routing**: 160 k-buckets with least-recently-seen eviction, guarded
//!   by per-bucket locks that are never held across the network
//! - **Storage**: in-memory timestamped values with background expiry;
//!   reads with the refresh flag extend a value's life
//! - **Lookups**: iterative α-parallel probing over a bounded shortlist
//! - **Transport**: length-prefixed bincode frames over TCP; any
//!   request/response transport can be substituted through [`KademliaRpc`]
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | `NodeId` algebra and `Contact` records |
//! | `routing` | XOR-metric routing table of k-buckets |
//! | `store` | Local timestamped key-value store |
//! | `messages` | Wire types and the bounded bincode codec |
//! | `protocols` | The `KademliaRpc` transport trait |
//! | `rpc` | TCP server and dial-per-call client |
//! | `dht` | The overlay node: handlers, iterative lookups, bootstrap |
//! | `dfs` | Inode tree and chunked files over the overlay |

mod dfs;
mod dht;
mod identity;
mod messages;
mod protocols;
mod routing;
mod rpc;
mod store;

pub use dfs::{Dfs, DirInode, FileInode, Inode, FILE_CHUNK_SIZE};
pub use dht::{
    DhtNode, FindValueOutcome, NodeConfig, ValueFound, ALPHA, K, ROUND_TIMEOUT,
};
pub use identity::{
    distance_cmp, prefix_len, Contact, Distance, NodeId, ParseIdError, ID_BITS, ID_BYTES,
};
pub use messages::{FindValueReply, RpcRequest, RpcResponse, MAX_VALUE_SIZE};
pub use protocols::KademliaRpc;
pub use routing::RoutingTable;
pub use rpc::{RpcClient, RpcServer};
pub use store::{LocalStore, CLEANUP_INTERVAL, STALENESS_WINDOW};
