//! Consistent hashing with virtual nodes (vnodes) for replica placement.
//!
//! A [`VnodeSnapshot`] is an immutable picture of the hash ring derived
//! from one committed membership. It is shared behind `Arc`: cloning the
//! `Arc` is the acquire, dropping it the release, and the storage backing
//! the ring is freed when the last holder drops. Only the event serializer
//! builds and publishes snapshots; readers never mutate one.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use flock_proto::hash::{hash_buf, hash_next, hash_oid};
use flock_proto::node::Node;

/// Immutable snapshot of the vnode distribution at one epoch.
#[derive(Debug)]
pub struct VnodeSnapshot {
    /// Ring tokens, sorted by position; values index into `nodes`.
    vnodes: BTreeMap<u64, usize>,
    /// The membership the ring was built from, sorted by node identity.
    nodes: Vec<Node>,
    /// Number of distinct fault zones among data-carrying nodes.
    nr_zones: usize,
}

impl VnodeSnapshot {
    /// Build a snapshot from a sorted node list.
    ///
    /// Gateways (`nr_vnodes == 0`) appear in `nodes` but own no ring
    /// tokens and do not count toward `nr_zones`.
    pub fn build(nodes: &[Node]) -> Self {
        let mut vnodes = BTreeMap::new();
        let mut zones = HashSet::new();

        for (idx, node) in nodes.iter().enumerate() {
            if node.is_gateway() {
                continue;
            }
            zones.insert(node.zone);

            let mut wire = Vec::new();
            node.encode_wire(&mut wire);
            let mut token = hash_buf(&wire);
            for _ in 0..node.nr_vnodes {
                vnodes.insert(token, idx);
                token = hash_next(token);
            }
        }

        Self {
            vnodes,
            nodes: nodes.to_vec(),
            nr_zones: zones.len(),
        }
    }

    /// An empty ring; the published snapshot before the first membership.
    pub fn empty() -> Self {
        Self::build(&[])
    }

    /// Ordered replica set for an object: walk the ring from the object's
    /// hash position, skipping vnodes whose owner was already chosen,
    /// until `nr_copies` distinct nodes are collected. Returns fewer when
    /// the ring has fewer distinct data nodes.
    pub fn locate(&self, oid: u64, nr_copies: usize) -> Vec<Node> {
        if self.vnodes.is_empty() || nr_copies == 0 {
            return Vec::new();
        }

        let start = hash_oid(oid);
        let mut result: Vec<usize> = Vec::with_capacity(nr_copies);

        let walk = self
            .vnodes
            .range(start..)
            .chain(self.vnodes.range(..start))
            .map(|(_, &idx)| idx);

        for idx in walk {
            if result.contains(&idx) {
                continue;
            }
            result.push(idx);
            if result.len() == nr_copies {
                break;
            }
        }

        result.into_iter().map(|i| self.nodes[i].clone()).collect()
    }

    /// Number of distinct fault zones among data-carrying nodes.
    pub fn nr_zones(&self) -> usize {
        self.nr_zones
    }

    /// The redundancy level actually achievable: replicas must span
    /// distinct zones, so fewer zones than configured copies degrades to
    /// `nr_zones` copies.
    pub fn max_copies(&self, configured: u8) -> u8 {
        (configured as usize).min(self.nr_zones) as u8
    }

    /// Total number of physical nodes, gateways included.
    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of data-carrying nodes on the ring.
    pub fn nr_data_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_gateway()).count()
    }

    /// The membership this snapshot was built from.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// The handle the current snapshot is published through.
///
/// The serializer stores a replacement; readers load a strong reference.
/// The store happens before the previous snapshot's reference is dropped,
/// so a reader holding snapshot `V` keeps `V` alive and unchanged across
/// any number of publications.
#[derive(Clone)]
pub struct SnapshotHandle {
    inner: Arc<ArcSwap<VnodeSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: VnodeSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Acquire the currently published snapshot.
    pub fn load(&self) -> Arc<VnodeSnapshot> {
        self.inner.load_full()
    }

    /// Publish a replacement snapshot. Only the event serializer calls
    /// this.
    pub fn publish(&self, snapshot: VnodeSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}
