//! Daemon-wide cluster context.
//!
//! All mutable cluster state — registry, status, leave list, epoch,
//! pending queue — lives in [`ClusterCtx`], owned by the event-loop task.
//! Worker tasks never see it; they receive copied-in inputs and report
//! back through channels. The two pieces peers may read concurrently (the
//! VDI bitmap and the published vnode snapshot) sit behind shared handles.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitvec::prelude::*;
use tokio::sync::{Notify, RwLock};

use flock_proto::constants::FLOCK_NR_VDIS;
use flock_proto::node::{ClusterInfo, ClusterStatus, Node};

/// Shared handle to the VDI in-use bitmap: one bit per VDI id. Written by
/// the event serializer, read by the peer service.
pub type VdiBitmap = Arc<RwLock<BitVec<u8, Msb0>>>;

pub fn new_vdi_bitmap() -> VdiBitmap {
    Arc::new(RwLock::new(bitvec![u8, Msb0; 0; FLOCK_NR_VDIS as usize]))
}

/// Members known to have departed since the last quorum, carried across
/// joins until the cluster next reaches Ok with them accounted for.
///
/// Only the event serializer mutates this. It never contains a node that
/// is present in the current registry.
#[derive(Debug, Default)]
pub struct LeaveList {
    entries: Vec<Node>,
}

impl LeaveList {
    pub fn contains(&self, node: &Node) -> bool {
        self.entries.iter().any(|n| n.nid == node.nid)
    }

    pub fn add(&mut self, node: Node) {
        if !self.contains(&node) {
            self.entries.push(node);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter()
    }

    /// Drop entries that reappeared in the registry.
    pub fn retain_absent(&mut self, registry: &[Node]) {
        self.entries
            .retain(|n| !registry.iter().any(|r| r.nid == n.nid));
    }
}

/// Gate between in-flight object I/O and the event serializer: the next
/// membership event is applied only once every request dispatched under
/// the previous snapshot has completed.
#[derive(Clone)]
pub struct IoGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Held for the duration of one I/O request.
pub struct IoGuard {
    inner: Arc<GateInner>,
}

impl IoGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Mark one I/O request in flight.
    pub fn enter(&self) -> IoGuard {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        IoGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Wait until no I/O is outstanding. Returns immediately when idle.
    pub async fn idle(&self) {
        loop {
            if self.outstanding() == 0 {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for IoGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// The cluster state owned by the event-loop task.
pub struct ClusterCtx {
    /// This node's identity.
    pub this_node: Node,
    /// Cluster-wide metadata: epoch, ctime, copies, status, member list.
    /// `cinfo.nodes` is the node registry, always sorted by identity.
    pub cinfo: ClusterInfo,
    /// Set once this node's own join has been applied.
    pub join_finished: bool,
    /// Departed members not yet accounted for.
    pub leave_list: LeaveList,
    /// VDI in-use bitmap, merged from peers at join time.
    pub vdi_inuse: VdiBitmap,
    /// Base directory for persistent state.
    pub dir: PathBuf,
}

impl ClusterCtx {
    pub fn new(this_node: Node, dir: PathBuf) -> Self {
        Self {
            this_node,
            cinfo: ClusterInfo::default(),
            join_finished: false,
            leave_list: LeaveList::default(),
            vdi_inuse: new_vdi_bitmap(),
            dir,
        }
    }

    pub fn status(&self) -> ClusterStatus {
        self.cinfo.status
    }

    pub fn epoch(&self) -> u32 {
        self.cinfo.epoch
    }

    /// Whether membership changes may trigger recovery right now.
    pub fn can_recover(&self) -> bool {
        matches!(self.cinfo.status, ClusterStatus::Ok | ClusterStatus::Halt)
            && !self.cinfo.disable_recovery
    }

    /// Whether the cluster halts writes when redundancy becomes
    /// unreachable. Opt-in via the strict cluster flag.
    pub fn can_halt(&self) -> bool {
        self.cinfo.status == ClusterStatus::Ok
            && self.cinfo.flags & flock_proto::constants::FLOCK_CLUSTER_FLAG_STRICT != 0
    }

    pub fn is_myself(&self, node: &Node) -> bool {
        node.nid == self.this_node.nid
    }
}
