//! # XOR-Metric Routing Table
//!
//! 160 k-buckets indexed by the prefix length of the XOR distance to this
//! node's identifier. Bucket 0 holds the farthest half of the keyspace,
//! bucket 159 the nearest sliver; a node never appears in its own table.
//!
//! ## Bucket Discipline
//!
//! Each bucket is an ordered sequence of up to k contacts, most recently
//! heard-from at the head. [`RoutingTable::observe`] records liveness:
//! known contacts move to the head (their address overwritten, since peers
//! may rebind), unknown contacts are inserted at the head while there is
//! room. A full bucket triggers the eviction probe: occupants are PINGed
//! from the tail up, the first non-responder is dropped to make room, and
//! responders are freshened. If every occupant answers, the newcomer is
//! discarded — old, stable peers are preferred over churny ones.
//!
//! ## Locking
//!
//! One mutex per bucket. `observe` locks exactly one bucket at a time and
//! never holds it across a network call: the probe snapshots the bucket,
//! pings outside the lock, then re-acquires to apply the outcome.
//! `find_close` locks buckets one at a time in visit order.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::time::{timeout, Duration};
use tracing::{debug, trace};

use crate::identity::{distance_cmp, Contact, NodeId, ID_BITS};
use crate::protocols::KademliaRpc;

/// Bound on each liveness PING issued by the eviction probe.
const EVICTION_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Head-is-most-recent sequence of contacts at one distance level.
#[derive(Default)]
struct Bucket {
    contacts: VecDeque<Contact>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.id == *id)
    }

    /// Move `contact` to the head, overwriting the stored address.
    /// Returns false if the id is not present.
    fn freshen(&mut self, contact: &Contact) -> bool {
        match self.position(&contact.id) {
            Some(pos) => {
                self.contacts.remove(pos);
                self.contacts.push_front(contact.clone());
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.contacts.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Routing state for one node: 160 independently locked k-buckets.
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(Mutex::new(Bucket::default()));
        }
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        // Only reached for id != self_id, so the prefix is < 160.
        self.self_id.prefix_len(id)
    }

    /// Record that `contact` was heard from.
    ///
    /// `network` is used only for the eviction probe's liveness PINGs; no
    /// bucket lock is held while those are in flight.
    pub async fn observe<N: KademliaRpc>(&self, contact: Contact, network: &N) {
        if contact.id == self.self_id {
            return;
        }
        let idx = self.bucket_index(&contact.id);

        let occupants: Vec<Contact> = {
            let mut bucket = self.buckets[idx].lock().expect("bucket mutex poisoned");
            if bucket.freshen(&contact) {
                return;
            }
            if bucket.contacts.len() < self.k {
                bucket.contacts.push_front(contact);
                return;
            }
            bucket.contacts.iter().cloned().collect()
        };

        self.evict_and_insert(idx, contact, occupants, network).await;
    }

    /// Probe a full bucket tail-to-head; the first non-responder is evicted
    /// in favor of `contact`, responders are freshened. If everyone answers,
    /// `contact` is dropped.
    async fn evict_and_insert<N: KademliaRpc>(
        &self,
        idx: usize,
        contact: Contact,
        occupants: Vec<Contact>,
        network: &N,
    ) {
        for occupant in occupants.iter().rev() {
            let alive = timeout(EVICTION_PING_TIMEOUT, network.ping(occupant))
                .await
                .map(|res| res.is_ok())
                .unwrap_or(false);

            let mut bucket = self.buckets[idx].lock().expect("bucket mutex poisoned");
            if alive {
                bucket.freshen(occupant);
                continue;
            }

            debug!(
                bucket = idx,
                evicted = %occupant.id,
                replacement = %contact.id,
                "evicting unresponsive contact"
            );
            bucket.remove(&occupant.id);
            if bucket.position(&contact.id).is_none() && bucket.contacts.len() < self.k {
                bucket.contacts.push_front(contact);
            }
            return;
        }

        trace!(bucket = idx, dropped = %contact.id, "bucket full of live contacts");
    }

    /// Up to `n` contacts nearest `target` by XOR, sorted nearest-first,
    /// never including `exclude` (the requester) or this node.
    ///
    /// Visit order starts at the target's bucket. Every bucket above it
    /// falls in the same distance band and may hold the closest contacts,
    /// so the upward sweep is unconditional; buckets below are strictly
    /// farther bands and are drained only until enough candidates exist.
    /// One bucket lock is held at a time.
    pub fn find_close(&self, target: &NodeId, exclude: Option<&NodeId>, n: usize) -> Vec<Contact> {
        if n == 0 {
            return Vec::new();
        }
        let start = self.self_id.prefix_len(target).min(ID_BITS - 1);

        let mut candidates: Vec<Contact> = Vec::new();
        let mut collect = |idx: usize, out: &mut Vec<Contact>| {
            let bucket = self.buckets[idx].lock().expect("bucket mutex poisoned");
            for c in &bucket.contacts {
                if Some(&c.id) != exclude {
                    out.push(c.clone());
                }
            }
        };

        for idx in start..ID_BITS {
            collect(idx, &mut candidates);
        }
        for idx in (0..start).rev() {
            if candidates.len() >= n {
                break;
            }
            collect(idx, &mut candidates);
        }

        candidates.sort_by(|a, b| {
            distance_cmp(&a.id.distance(target), &b.id.distance(target))
        });
        candidates.truncate(n);
        candidates
    }

    /// Look up the stored contact for `id`, if this node knows it.
    pub fn contact_of(&self, id: &NodeId) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = self.bucket_index(id);
        let bucket = self.buckets[idx].lock().expect("bucket mutex poisoned");
        bucket
            .position(id)
            .map(|pos| bucket.contacts[pos].clone())
    }

    /// Contacts in one bucket, head first. Test and diagnostics hook.
    pub fn bucket_contents(&self, idx: usize) -> Vec<Contact> {
        let bucket = self.buckets[idx].lock().expect("bucket mutex poisoned");
        bucket.contacts.iter().cloned().collect()
    }

    /// Total contacts across all buckets.
    pub fn contact_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("bucket mutex poisoned").contacts.len())
            .sum()
    }
}
