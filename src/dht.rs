//! # Kademlia Overlay Core
//!
//! [`DhtNode`] ties the routing table, the local store and the transport
//! together into one symmetric overlay participant. It serves the five
//! primitive RPCs for remote peers and runs the iterative procedures on
//! behalf of the local operator.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `handle_request` | Serve one primitive RPC (PING/STORE/FIND_NODE/FIND_VALUE/DELETE) |
//! | `iter_find_node` | Converge on the k closest contacts to a target |
//! | `iter_find_value` | Locate a value, optionally refreshing replica timestamps |
//! | `iter_store` / `iter_delete` | Replicate or erase a key at the k closest nodes |
//! | `start` | Join an existing overlay through one known peer |
//!
//! ## Iterative Driver
//!
//! All iterative procedures share one driver: a shortlist of the k nearest
//! known contacts is probed α at a time, each round merging returned
//! contacts, evicting failed entries, and re-trimming to the k nearest.
//! Rounds are bounded by a single timeout; a round that dispatches nothing
//! new ends the lookup. Shortlist distances are always measured against the
//! lookup target.
//!
//! Every contact seen — requester or returned — is fed to the routing table
//! on a background task so replies and lookups are never delayed by bucket
//! maintenance.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::identity::{distance_cmp, Contact, Distance, NodeId};
use crate::messages::{FindValueReply, RpcRequest, RpcResponse, MAX_VALUE_SIZE};
use crate::protocols::KademliaRpc;
use crate::routing::RoutingTable;
use crate::store::{LocalStore, CLEANUP_INTERVAL, STALENESS_WINDOW};

/// Replication factor and bucket size.
pub const K: usize = 10;

/// Concurrency factor for iterative lookups.
pub const ALPHA: usize = 3;

/// Bound on one round of an iterative lookup.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(8);

/// Whole-procedure retries before `iter_store`/`iter_delete` give up.
const STORE_RETRIES: usize = 3;

/// FIND_NODE attempts against the bootstrap peer before joining fails.
const JOIN_RETRIES: usize = 3;

/// Tunables for one node. `Default` is the production configuration;
/// tests shrink the windows and the concurrency.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub k: usize,
    pub alpha: usize,
    pub round_timeout: Duration,
    pub staleness_window: Duration,
    pub cleanup_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            round_timeout: ROUND_TIMEOUT,
            staleness_window: STALENESS_WINDOW,
            cleanup_interval: CLEANUP_INTERVAL,
        }
    }
}

/// A value located by `iter_find_value`, tagged with the node it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueFound {
    pub value: Vec<u8>,
    pub source: NodeId,
}

/// Result of one iterative value lookup: the value if any replica answered,
/// plus the final shortlist either way.
#[derive(Clone, Debug)]
pub struct FindValueOutcome {
    pub value: Option<ValueFound>,
    pub closest: Vec<Contact>,
}

#[derive(Clone, Copy)]
enum LookupKind {
    Nodes,
    Value { update_timestamp: bool },
}

struct Inner<N: KademliaRpc> {
    self_contact: Contact,
    routing: RoutingTable,
    store: Arc<LocalStore>,
    network: Arc<N>,
    alpha: usize,
    round_timeout: Duration,
}

/// Handle to one overlay node. Cheap to clone; all clones share state.
pub struct DhtNode<N: KademliaRpc> {
    inner: Arc<Inner<N>>,
}

impl<N: KademliaRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: KademliaRpc> DhtNode<N> {
    /// Create a node with production parameters. Must run inside a tokio
    /// runtime: the store's sweeper is spawned here and lives as long as
    /// the process.
    pub fn new(self_contact: Contact, network: N) -> Self {
        Self::with_config(self_contact, network, NodeConfig::default())
    }

    pub fn with_config(self_contact: Contact, network: N, config: NodeConfig) -> Self {
        let store = Arc::new(LocalStore::with_windows(
            config.staleness_window,
            config.cleanup_interval,
        ));
        store.spawn_sweeper();
        let inner = Inner {
            routing: RoutingTable::new(self_contact.id, config.k),
            self_contact,
            store,
            network: Arc::new(network),
            alpha: config.alpha,
            round_timeout: config.round_timeout,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.inner.self_contact.id
    }

    pub fn contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    /// Record a contact as recently alive, off the caller's critical path.
    /// Bucket maintenance (including eviction PINGs) runs on its own task.
    pub fn observe(&self, contact: Contact) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.routing.observe(contact, inner.network.as_ref()).await;
        });
    }

    // ------------------------------------------------------------------
    // Primitive RPC handlers (single hop)
    // ------------------------------------------------------------------

    /// Serve one primitive RPC. The sender is observed on a background
    /// task; the reply always echoes the request's `msg_id` and never
    /// includes the requester or this node in a node list.
    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let sender = request.sender().clone();
        let sender_id = sender.id;
        self.observe(sender);

        let msg_id = request.msg_id();
        let k = self.inner.routing.k();
        match request {
            RpcRequest::Ping { .. } => RpcResponse::Pong { msg_id },
            RpcRequest::Store { key, value, .. } => {
                if value.len() > MAX_VALUE_SIZE {
                    debug!(key = %key, size = value.len(), "rejecting oversized store");
                    RpcResponse::StoreResult {
                        msg_id,
                        error: Some(format!(
                            "value too large: {} bytes (max {})",
                            value.len(),
                            MAX_VALUE_SIZE
                        )),
                    }
                } else {
                    self.inner.store.put(key, &value);
                    RpcResponse::StoreResult { msg_id, error: None }
                }
            }
            RpcRequest::FindNode { target, .. } => RpcResponse::FindNodeResult {
                msg_id,
                nodes: self.inner.routing.find_close(&target, Some(&sender_id), k),
            },
            RpcRequest::FindValue {
                key,
                update_timestamp,
                ..
            } => match self.inner.store.get(&key, update_timestamp) {
                Some(value) => RpcResponse::FindValueResult {
                    msg_id,
                    value: Some(value),
                    nodes: Vec::new(),
                },
                None => RpcResponse::FindValueResult {
                    msg_id,
                    value: None,
                    nodes: self.inner.routing.find_close(&key, Some(&sender_id), k),
                },
            },
            RpcRequest::Delete { key, .. } => {
                let removed = self.inner.store.delete(&key);
                trace!(key = %key, removed, "delete request");
                RpcResponse::DeleteResult {
                    msg_id,
                    nodes: self.inner.routing.find_close(&key, Some(&sender_id), k),
                    error: None,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Iterative procedures
    // ------------------------------------------------------------------

    /// Converge on the k closest contacts to `target`, nearest first.
    pub async fn iter_find_node(&self, target: NodeId) -> Vec<Contact> {
        self.lookup(target, LookupKind::Nodes).await.closest
    }

    /// Locate the value under `key`. With `update_timestamp` set the
    /// iteration runs to completion so every replica along the way gets
    /// its timestamp refreshed; otherwise the first value ends the lookup.
    pub async fn iter_find_value(&self, key: NodeId, update_timestamp: bool) -> FindValueOutcome {
        let outcome = self
            .lookup(key, LookupKind::Value { update_timestamp })
            .await;
        FindValueOutcome {
            value: outcome.value,
            closest: outcome.closest,
        }
    }

    /// Replicate `value` under `key` at the k closest nodes. Returns the
    /// number of replicas that accepted; zero across all retries is an
    /// error (no peers).
    pub async fn iter_store(&self, key: NodeId, value: Vec<u8>) -> Result<usize> {
        for attempt in 1..=STORE_RETRIES {
            let targets = self.iter_find_node(key).await;
            let stored = self.fan_out_store(&targets, key, value.clone()).await;
            if stored > 0 {
                debug!(key = %key, stored, attempt, "iterative store complete");
                return Ok(stored);
            }
            warn!(key = %key, attempt, "iterative store reached no peers");
        }
        bail!("did not store value on any peers")
    }

    /// Best-effort erasure of `key` at the k closest nodes. Same shape as
    /// `iter_store`; full erasure is not guaranteed.
    pub async fn iter_delete(&self, key: NodeId) -> Result<usize> {
        for attempt in 1..=STORE_RETRIES {
            let targets = self.iter_find_node(key).await;
            let deleted = self.fan_out_delete(&targets, key).await;
            if deleted > 0 {
                debug!(key = %key, deleted, attempt, "iterative delete complete");
                return Ok(deleted);
            }
            warn!(key = %key, attempt, "iterative delete reached no peers");
        }
        bail!("did not delete value on any peers")
    }

    async fn fan_out_store(&self, targets: &[Contact], key: NodeId, value: Vec<u8>) -> usize {
        let mut join_set = JoinSet::new();
        for contact in targets.iter().cloned() {
            let network = Arc::clone(&self.inner.network);
            let value = value.clone();
            join_set.spawn(async move {
                let ok = network.store(&contact, key, value).await.is_ok();
                (contact, ok)
            });
        }
        let mut stored = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok((contact, ok)) = joined {
                if ok {
                    stored += 1;
                    self.observe(contact);
                }
            }
        }
        stored
    }

    async fn fan_out_delete(&self, targets: &[Contact], key: NodeId) -> usize {
        let mut join_set = JoinSet::new();
        for contact in targets.iter().cloned() {
            let network = Arc::clone(&self.inner.network);
            join_set.spawn(async move {
                let ok = network.delete(&contact, key).await.is_ok();
                (contact, ok)
            });
        }
        let mut deleted = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok((contact, ok)) = joined {
                if ok {
                    deleted += 1;
                    self.observe(contact);
                }
            }
        }
        deleted
    }

    /// The shared iterative driver.
    async fn lookup(&self, target: NodeId, kind: LookupKind) -> LookupOutcome {
        let k = self.inner.routing.k();
        let alpha = self.inner.alpha;
        let self_id = self.self_id();

        let mut shortlist = Shortlist::new(target, k);
        for contact in self
            .inner
            .routing
            .find_close(&target, None, k)
            .into_iter()
            .take(alpha)
        {
            shortlist.insert(contact);
        }

        let mut value_found: Option<ValueFound> = None;

        loop {
            let batch = shortlist.take_unqueried(alpha);
            if batch.is_empty() {
                break;
            }

            let mut join_set = JoinSet::new();
            for contact in batch {
                let network = Arc::clone(&self.inner.network);
                join_set.spawn(async move {
                    let result = match kind {
                        LookupKind::Nodes => network
                            .find_node(&contact, target)
                            .await
                            .map(|nodes| (None, nodes)),
                        LookupKind::Value { update_timestamp } => network
                            .find_value(&contact, target, update_timestamp)
                            .await
                            .map(|reply| match reply {
                                FindValueReply::Value(v) => (Some(v), Vec::new()),
                                FindValueReply::Nodes(nodes) => (None, nodes),
                            }),
                    };
                    (contact, result)
                });
            }

            let round_deadline = Instant::now() + self.inner.round_timeout;
            let mut round_timed_out = false;
            loop {
                let remaining = round_deadline.saturating_duration_since(Instant::now());
                let joined = match timeout(remaining, join_set.join_next()).await {
                    Ok(Some(joined)) => joined,
                    Ok(None) => break,
                    Err(_) => {
                        // Round deadline: in-flight probes are abandoned and
                        // their late replies discarded with the tasks.
                        join_set.abort_all();
                        round_timed_out = true;
                        break;
                    }
                };
                let (contact, result) = match joined {
                    Ok(pair) => pair,
                    Err(_) => continue,
                };
                match result {
                    Ok((maybe_value, nodes)) => {
                        self.observe(contact.clone());
                        for node in nodes {
                            if node.id == self_id {
                                continue;
                            }
                            self.observe(node.clone());
                            shortlist.insert(node);
                        }
                        if let Some(value) = maybe_value {
                            if value_found.is_none() {
                                value_found = Some(ValueFound {
                                    value,
                                    source: contact.id,
                                });
                            }
                            if let LookupKind::Value {
                                update_timestamp: false,
                            } = kind
                            {
                                join_set.abort_all();
                                return LookupOutcome {
                                    closest: shortlist.contacts(),
                                    value: value_found,
                                };
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %contact.id, error = %e, "lookup probe failed");
                        shortlist.remove(&contact.id);
                    }
                }
            }

            if round_timed_out {
                debug!(target = %target, "lookup round timed out");
                break;
            }
        }

        LookupOutcome {
            closest: shortlist.contacts(),
            value: value_found,
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Join an overlay through one known peer address.
    ///
    /// Issues FIND_NODE for our own identifier to the peer, retrying a few
    /// times; every returned contact is observed, then a self-lookup seeds
    /// buckets across the distance levels. Returns the number of contacts
    /// learned from the bootstrap peer, or an error if every attempt came
    /// back empty.
    pub async fn start(&self, bootstrap_host: &str, bootstrap_port: u16) -> Result<usize> {
        let seed = Contact::new(NodeId::default(), bootstrap_host, bootstrap_port);
        let self_id = self.self_id();

        for attempt in 1..=JOIN_RETRIES {
            match self.inner.network.find_node(&seed, self_id).await {
                Ok(nodes) if !nodes.is_empty() => {
                    let count = nodes.len();
                    for node in nodes {
                        if node.id != self_id {
                            self.inner
                                .routing
                                .observe(node, self.inner.network.as_ref())
                                .await;
                        }
                    }
                    let _ = self.iter_find_node(self_id).await;
                    info!(
                        peer = %seed.addr(),
                        contacts = count,
                        "joined overlay"
                    );
                    return Ok(count);
                }
                Ok(_) => {
                    warn!(peer = %seed.addr(), attempt, "bootstrap peer knows no contacts");
                }
                Err(e) => {
                    warn!(peer = %seed.addr(), attempt, error = %e, "bootstrap attempt failed");
                }
            }
        }
        bail!("no peers found via {}", seed.addr())
    }
}

struct LookupOutcome {
    closest: Vec<Contact>,
    value: Option<ValueFound>,
}

struct ShortlistEntry {
    contact: Contact,
    distance: Distance,
    queried: bool,
}

/// Bounded working set of one iterative lookup: the k nearest known
/// contacts, nearest first, each flagged once probed. An identifier that
/// has ever been admitted is never re-admitted, so failed or trimmed peers
/// cannot be re-suggested into an endless loop.
struct Shortlist {
    target: NodeId,
    capacity: usize,
    entries: Vec<ShortlistEntry>,
    seen: HashSet<NodeId>,
}

impl Shortlist {
    fn new(target: NodeId, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn insert(&mut self, contact: Contact) {
        if !self.seen.insert(contact.id) {
            return;
        }
        let distance = contact.id.distance(&self.target);
        self.entries.push(ShortlistEntry {
            contact,
            distance,
            queried: false,
        });
        self.entries
            .sort_by(|a, b| distance_cmp(&a.distance, &b.distance));
        self.entries.truncate(self.capacity);
    }

    fn remove(&mut self, id: &NodeId) {
        self.entries.retain(|e| e.contact.id != *id);
    }

    /// Mark and return up to `alpha` of the nearest unqueried entries.
    fn take_unqueried(&mut self, alpha: usize) -> Vec<Contact> {
        let mut batch = Vec::new();
        for entry in self.entries.iter_mut() {
            if batch.len() == alpha {
                break;
            }
            if !entry.queried {
                entry.queried = true;
                batch.push(entry.contact.clone());
            }
        }
        batch
    }

    fn contacts(&self) -> Vec<Contact> {
        self.entries.iter().map(|e| e.contact.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU16, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::{Mutex, RwLock};

    use crate::identity::ID_BYTES;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(20000);

    fn next_port() -> u16 {
        PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    /// In-process overlay: peers dispatch RPCs straight into each other's
    /// handlers through a shared registry, with injectable failures.
    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<NodeId, DhtNode<TestNetwork>>>,
        by_addr: RwLock<HashMap<String, NodeId>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            let contact = node.contact();
            self.peers.write().await.insert(contact.id, node.clone());
            self.by_addr.write().await.insert(contact.addr(), contact.id);
        }

        async fn resolve(&self, to: &Contact) -> Option<DhtNode<TestNetwork>> {
            let peers = self.peers.read().await;
            if let Some(node) = peers.get(&to.id) {
                return Some(node.clone());
            }
            // Bootstrap dials by address with an unknown identifier.
            let by_addr = self.by_addr.read().await;
            by_addr.get(&to.addr()).and_then(|id| peers.get(id).cloned())
        }
    }

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_contact: Contact,
        failures: Arc<Mutex<HashSet<NodeId>>>,
        find_value_probes: Arc<Mutex<Vec<NodeId>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
            Self {
                registry,
                self_contact,
                failures: Arc::new(Mutex::new(HashSet::new())),
                find_value_probes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn set_failure(&self, id: NodeId, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail {
                failures.insert(id);
            } else {
                failures.remove(&id);
            }
        }

        async fn find_value_probe_count(&self) -> usize {
            self.find_value_probes.lock().await.len()
        }

        async fn should_fail(&self, id: &NodeId) -> bool {
            self.failures.lock().await.contains(id)
        }

        async fn dispatch(&self, to: &Contact, request: RpcRequest) -> Result<RpcResponse> {
            if self.should_fail(&to.id).await {
                return Err(anyhow!("injected network failure"));
            }
            let peer = self
                .registry
                .resolve(to)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))?;
            let sent_id = request.msg_id();
            let response = peer.handle_request(request).await;
            if response.msg_id() != sent_id {
                return Err(anyhow!("msg id mismatch"));
            }
            Ok(response)
        }
    }

    #[async_trait]
    impl KademliaRpc for TestNetwork {
        async fn ping(&self, to: &Contact) -> Result<()> {
            let request = RpcRequest::Ping {
                sender: self.self_contact.clone(),
                msg_id: NodeId::random(),
            };
            match self.dispatch(to, request).await? {
                RpcResponse::Pong { .. } => Ok(()),
                other => Err(anyhow!("unexpected response: {:?}", other)),
            }
        }

        async fn store(&self, to: &Contact, key: NodeId, value: Vec<u8>) -> Result<()> {
            let request = RpcRequest::Store {
                sender: self.self_contact.clone(),
                msg_id: NodeId::random(),
                key,
                value,
            };
            match self.dispatch(to, request).await? {
                RpcResponse::StoreResult { error: None, .. } => Ok(()),
                other => Err(anyhow!("store failed: {:?}", other)),
            }
        }

        async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
            let request = RpcRequest::FindNode {
                sender: self.self_contact.clone(),
                msg_id: NodeId::random(),
                target,
            };
            match self.dispatch(to, request).await? {
                RpcResponse::FindNodeResult { nodes, .. } => Ok(nodes),
                other => Err(anyhow!("unexpected response: {:?}", other)),
            }
        }

        async fn find_value(
            &self,
            to: &Contact,
            key: NodeId,
            update_timestamp: bool,
        ) -> Result<FindValueReply> {
            self.find_value_probes.lock().await.push(to.id);
            let request = RpcRequest::FindValue {
                sender: self.self_contact.clone(),
                msg_id: NodeId::random(),
                key,
                update_timestamp,
            };
            match self.dispatch(to, request).await? {
                RpcResponse::FindValueResult { value, nodes, .. } => {
                    Ok(FindValueReply::from_wire(value, nodes))
                }
                other => Err(anyhow!("unexpected response: {:?}", other)),
            }
        }

        async fn delete(&self, to: &Contact, key: NodeId) -> Result<Vec<Contact>> {
            let request = RpcRequest::Delete {
                sender: self.self_contact.clone(),
                msg_id: NodeId::random(),
                key,
            };
            match self.dispatch(to, request).await? {
                RpcResponse::DeleteResult { nodes, .. } => Ok(nodes),
                other => Err(anyhow!("unexpected response: {:?}", other)),
            }
        }
    }

    async fn spawn_peer(registry: &Arc<NetworkRegistry>) -> (DhtNode<TestNetwork>, TestNetwork) {
        spawn_peer_with_id(registry, NodeId::random()).await
    }

    async fn spawn_peer_with_id(
        registry: &Arc<NetworkRegistry>,
        id: NodeId,
    ) -> (DhtNode<TestNetwork>, TestNetwork) {
        let contact = Contact::new(id, "127.0.0.1", next_port());
        let network = TestNetwork::new(Arc::clone(registry), contact.clone());
        let node = DhtNode::with_config(contact, network.clone(), NodeConfig::default());
        registry.register(&node).await;
        (node, network)
    }

    fn id_with_bit(bit: usize, tag: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[bit / 8] = 0x80u8 >> (bit % 8);
        bytes[ID_BYTES - 1] = tag;
        NodeId::from_bytes(bytes)
    }

    async fn settle() {
        // Let spawned observe tasks drain.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn every_handler_echoes_the_msg_id() {
        let registry = Arc::new(NetworkRegistry::default());
        let (node, _) = spawn_peer(&registry).await;
        let sender = Contact::new(NodeId::random(), "127.0.0.1", 1);
        let msg_id = NodeId::random();
        let key = NodeId::random();

        let requests = vec![
            RpcRequest::Ping {
                sender: sender.clone(),
                msg_id,
            },
            RpcRequest::Store {
                sender: sender.clone(),
                msg_id,
                key,
                value: b"v".to_vec(),
            },
            RpcRequest::FindNode {
                sender: sender.clone(),
                msg_id,
                target: key,
            },
            RpcRequest::FindValue {
                sender: sender.clone(),
                msg_id,
                key,
                update_timestamp: false,
            },
            RpcRequest::Delete {
                sender,
                msg_id,
                key,
            },
        ];
        for request in requests {
            let response = node.handle_request(request).await;
            assert_eq!(response.msg_id(), msg_id);
        }
    }

    #[tokio::test]
    async fn find_node_with_fewer_than_k_known_returns_them_all() {
        let registry = Arc::new(NetworkRegistry::default());
        let (node, net) = spawn_peer(&registry).await;

        let mut known = Vec::new();
        for i in 0..5u8 {
            let contact = Contact::new(id_with_bit(i as usize, i), "10.0.0.1", 100 + i as u16);
            known.push(contact.clone());
            node.routing().observe(contact, &net).await;
        }

        let sender = Contact::new(NodeId::random(), "127.0.0.1", 1);
        let response = node
            .handle_request(RpcRequest::FindNode {
                sender: sender.clone(),
                msg_id: NodeId::random(),
                target: node.self_id(),
            })
            .await;
        let nodes = match response {
            RpcResponse::FindNodeResult { nodes, .. } => nodes,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(nodes.len(), 5);
        let ids: HashSet<NodeId> = nodes.iter().map(|c| c.id).collect();
        for contact in &known {
            assert!(ids.contains(&contact.id));
        }
        assert!(!ids.contains(&sender.id));
        assert!(!ids.contains(&node.self_id()));
    }

    #[tokio::test]
    async fn find_node_with_more_than_k_returns_exactly_the_closest() {
        let registry = Arc::new(NetworkRegistry::default());
        // A zero self id puts the single-bit contacts below into forty
        // distinct buckets, so the table retains all of them.
        let (node, net) = spawn_peer_with_id(&registry, NodeId::default()).await;

        let mut all = Vec::new();
        for i in 0..40usize {
            let contact = Contact::new(id_with_bit(i, i as u8), "10.0.0.1", 200 + i as u16);
            all.push(contact.clone());
            node.routing().observe(contact, &net).await;
        }

        let target = NodeId::random();
        let response = node
            .handle_request(RpcRequest::FindNode {
                sender: Contact::new(NodeId::random(), "127.0.0.1", 1),
                msg_id: NodeId::random(),
                target,
            })
            .await;
        let nodes = match response {
            RpcResponse::FindNodeResult { nodes, .. } => nodes,
            other => panic!("unexpected response: {:?}", other),
        };

        all.sort_by(|a, b| distance_cmp(&a.id.distance(&target), &b.id.distance(&target)));
        let expected: Vec<NodeId> = all[..K].iter().map(|c| c.id).collect();
        let got: Vec<NodeId> = nodes.iter().map(|c| c.id).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn find_value_miss_matches_find_node() {
        let registry = Arc::new(NetworkRegistry::default());
        let (node, net) = spawn_peer(&registry).await;
        for i in 0..8u8 {
            let contact = Contact::new(id_with_bit(i as usize, i), "10.0.0.1", 300 + i as u16);
            node.routing().observe(contact, &net).await;
        }

        let sender = Contact::new(NodeId::random(), "127.0.0.1", 1);
        let key = NodeId::random();

        let find_node = node
            .handle_request(RpcRequest::FindNode {
                sender: sender.clone(),
                msg_id: NodeId::random(),
                target: key,
            })
            .await;
        let find_value = node
            .handle_request(RpcRequest::FindValue {
                sender,
                msg_id: NodeId::random(),
                key,
                update_timestamp: false,
            })
            .await;

        let expected = match find_node {
            RpcResponse::FindNodeResult { nodes, .. } => nodes,
            other => panic!("unexpected response: {:?}", other),
        };
        match find_value {
            RpcResponse::FindValueResult { value, nodes, .. } => {
                assert!(value.is_none());
                assert_eq!(nodes, expected);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn find_value_touch_extends_replica_lifetime() {
        let registry = Arc::new(NetworkRegistry::default());
        let (node, _) = spawn_peer(&registry).await;
        let key = NodeId::random();
        node.store().put(key, b"v");
        let sender = Contact::new(NodeId::random(), "127.0.0.1", 1);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        tokio::task::yield_now().await;
        let response = node
            .handle_request(RpcRequest::FindValue {
                sender,
                msg_id: NodeId::random(),
                key,
                update_timestamp: true,
            })
            .await;
        assert!(matches!(
            response,
            RpcResponse::FindValueResult { value: Some(_), .. }
        ));

        // Alive at T0+8min thanks to the touch at T0+4min, gone afterwards.
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(node.store().get(&key, false), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(node.store().get(&key, false), None);
    }

    #[tokio::test]
    async fn iterative_lookup_converges_across_hops() {
        let registry = Arc::new(NetworkRegistry::default());
        let (a, net_a) = spawn_peer(&registry).await;
        let (b, net_b) = spawn_peer(&registry).await;
        let (c, _) = spawn_peer(&registry).await;

        // A knows only B; B knows only C.
        a.routing().observe(b.contact(), &net_a).await;
        b.routing().observe(c.contact(), &net_b).await;

        let closest = a.iter_find_node(c.self_id()).await;
        assert!(closest.iter().any(|con| con.id == c.self_id()));
        // Nearest-first ordering of the final shortlist.
        let target = c.self_id();
        for pair in closest.windows(2) {
            assert_ne!(
                distance_cmp(
                    &pair[0].id.distance(&target),
                    &pair[1].id.distance(&target)
                ),
                std::cmp::Ordering::Greater
            );
        }
    }

    #[tokio::test]
    async fn store_and_retrieve_across_the_network() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = Vec::new();
        for _ in 0..8 {
            nodes.push(spawn_peer(&registry).await);
        }
        // Full mesh of observations.
        for (node, net) in &nodes {
            for (other, _) in &nodes {
                if other.self_id() != node.self_id() {
                    node.routing().observe(other.contact(), net).await;
                }
            }
        }

        let key = NodeId::random();
        let (a, _) = &nodes[0];
        let stored = a.iter_store(key, b"replicated".to_vec()).await.unwrap();
        assert!(stored > 0);

        // A node that holds no replica itself still finds the value.
        let (d, _) = nodes
            .iter()
            .find(|(n, _)| n.store().get(&key, false).is_none())
            .expect("with k=10 and 8 nodes someone always misses, unless all hold it");
        let outcome = d.iter_find_value(key, false).await;
        let found = outcome.value.expect("value should be located");
        assert_eq!(found.value, b"replicated".to_vec());
        assert!(nodes.iter().any(|(n, _)| n.self_id() == found.source));
    }

    #[tokio::test]
    async fn iter_store_counts_replicas() {
        let registry = Arc::new(NetworkRegistry::default());
        let (a, net_a) = spawn_peer(&registry).await;
        let (b, _) = spawn_peer(&registry).await;
        let (c, _) = spawn_peer(&registry).await;
        a.routing().observe(b.contact(), &net_a).await;
        a.routing().observe(c.contact(), &net_a).await;

        let key = NodeId::random();
        let stored = a.iter_store(key, b"v".to_vec()).await.unwrap();
        assert_eq!(stored, 2);
        settle().await;
        assert_eq!(b.store().get(&key, false), Some(b"v".to_vec()));
        assert_eq!(c.store().get(&key, false), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn iter_store_with_no_peers_fails() {
        let registry = Arc::new(NetworkRegistry::default());
        let (lonely, _) = spawn_peer(&registry).await;
        let err = lonely
            .iter_store(NodeId::random(), b"v".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not store"));
    }

    #[tokio::test]
    async fn iter_delete_erases_replicas() {
        let registry = Arc::new(NetworkRegistry::default());
        let (a, net_a) = spawn_peer(&registry).await;
        let (b, _) = spawn_peer(&registry).await;
        a.routing().observe(b.contact(), &net_a).await;

        let key = NodeId::random();
        a.iter_store(key, b"v".to_vec()).await.unwrap();
        settle().await;
        assert!(b.store().get(&key, false).is_some());

        let deleted = a.iter_delete(key).await.unwrap();
        assert_eq!(deleted, 1);
        settle().await;
        assert_eq!(b.store().get(&key, false), None);
    }

    #[tokio::test]
    async fn failed_probes_are_evicted_from_the_shortlist() {
        let registry = Arc::new(NetworkRegistry::default());
        let (a, net_a) = spawn_peer(&registry).await;
        let (b, _) = spawn_peer(&registry).await;
        let (c, _) = spawn_peer(&registry).await;
        a.routing().observe(b.contact(), &net_a).await;
        a.routing().observe(c.contact(), &net_a).await;

        net_a.set_failure(b.self_id(), true).await;
        let closest = a.iter_find_node(NodeId::random()).await;
        assert!(closest.iter().all(|con| con.id != b.self_id()));
        assert!(closest.iter().any(|con| con.id == c.self_id()));
    }

    #[tokio::test]
    async fn value_lookup_stops_early_without_update_timestamp() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = NodeConfig {
            alpha: 1,
            ..NodeConfig::default()
        };
        let contact = Contact::new(NodeId::random(), "127.0.0.1", next_port());
        let network = TestNetwork::new(Arc::clone(&registry), contact.clone());
        let a = DhtNode::with_config(contact, network.clone(), config);
        registry.register(&a).await;

        let key = NodeId::random();
        for _ in 0..4 {
            let (node, _) = spawn_peer(&registry).await;
            node.store().put(key, b"v");
            a.routing().observe(node.contact(), &network).await;
        }

        let outcome = a.iter_find_value(key, false).await;
        assert!(outcome.value.is_some());
        // With α=1 and every peer holding the value, the first probe wins.
        assert_eq!(network.find_value_probe_count().await, 1);
    }

    #[tokio::test]
    async fn value_lookup_with_update_timestamp_probes_the_full_round() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = NodeConfig {
            alpha: 2,
            ..NodeConfig::default()
        };
        let contact = Contact::new(NodeId::random(), "127.0.0.1", next_port());
        let network = TestNetwork::new(Arc::clone(&registry), contact.clone());
        let a = DhtNode::with_config(contact, network.clone(), config);
        registry.register(&a).await;

        let key = NodeId::random();
        for _ in 0..2 {
            let (node, _) = spawn_peer(&registry).await;
            node.store().put(key, b"v");
            a.routing().observe(node.contact(), &network).await;
        }

        let outcome = a.iter_find_value(key, true).await;
        assert!(outcome.value.is_some());
        // Refresh mode runs the iteration to completion: both replicas see
        // a FIND_VALUE probe instead of the lookup ending on the first hit.
        assert_eq!(network.find_value_probe_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_lookup_touches_every_replica() {
        let registry = Arc::new(NetworkRegistry::default());
        let (a, net_a) = spawn_peer(&registry).await;
        let (b, _) = spawn_peer(&registry).await;
        let (c, _) = spawn_peer(&registry).await;
        a.routing().observe(b.contact(), &net_a).await;
        a.routing().observe(c.contact(), &net_a).await;

        let key = NodeId::random();
        b.store().put(key, b"v");
        c.store().put(key, b"v");

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        tokio::task::yield_now().await;
        let outcome = a.iter_find_value(key, true).await;
        assert!(outcome.value.is_some());

        // Both replicas were touched at T0+4min, so both survive T0+8min.
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(b.store().get(&key, false), Some(b"v".to_vec()));
        assert_eq!(c.store().get(&key, false), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn bootstrap_learns_contacts_and_fills_buckets() {
        let registry = Arc::new(NetworkRegistry::default());
        let (seed, seed_net) = spawn_peer(&registry).await;
        let (c1, _) = spawn_peer(&registry).await;
        let (c2, _) = spawn_peer(&registry).await;
        seed.routing().observe(c1.contact(), &seed_net).await;
        seed.routing().observe(c2.contact(), &seed_net).await;

        let (joiner, _) = spawn_peer(&registry).await;
        let seed_contact = seed.contact();
        let learned = joiner
            .start(&seed_contact.host, seed_contact.port)
            .await
            .unwrap();
        assert!(learned >= 2);
        assert!(joiner.routing().contact_of(&c1.self_id()).is_some());
        assert!(joiner.routing().contact_of(&c2.self_id()).is_some());
    }

    #[tokio::test]
    async fn bootstrap_against_empty_peer_is_no_peers() {
        let registry = Arc::new(NetworkRegistry::default());
        let (seed, _) = spawn_peer(&registry).await;
        let (joiner, _) = spawn_peer(&registry).await;
        let seed_contact = seed.contact();
        let err = joiner
            .start(&seed_contact.host, seed_contact.port)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no peers"));
    }

    #[tokio::test]
    async fn shortlist_never_readmits_a_removed_id() {
        let target = NodeId::default();
        let mut shortlist = Shortlist::new(target, 4);
        let contact = Contact::new(id_with_bit(0, 1), "10.0.0.1", 1);
        shortlist.insert(contact.clone());
        shortlist.remove(&contact.id);
        shortlist.insert(contact.clone());
        assert!(shortlist.contacts().is_empty());
    }

    #[tokio::test]
    async fn shortlist_keeps_the_nearest_k() {
        let target = NodeId::default();
        let mut shortlist = Shortlist::new(target, 3);
        for i in (0..6usize).rev() {
            shortlist.insert(Contact::new(id_with_bit(i, i as u8), "10.0.0.1", 1));
        }
        let contacts = shortlist.contacts();
        assert_eq!(contacts.len(), 3);
        // Higher bit index means smaller distance to the zero target.
        assert_eq!(contacts[0].id, id_with_bit(5, 5));
        assert_eq!(contacts[1].id, id_with_bit(4, 4));
        assert_eq!(contacts[2].id, id_with_bit(3, 3));
    }
}
