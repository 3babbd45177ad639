//! Cluster membership and epoch management.
//!
//! The [`GroupEngine`] is the membership core: it answers the driver's
//! admission queries, serializes join/leave/notify events through a single
//! FIFO, advances the epoch, rebuilds and publishes the vnode snapshot,
//! keeps the leave list, and routes cluster-wide blocked operations.
//!
//! Every event runs in two phases. Phase A may touch the network (peer
//! bitmap fetch for joins, TCP reachability probes for leaves) and runs on
//! a worker with copied-in inputs only. Phase B mutates cluster state and
//! runs on the event-loop task that owns the engine. The next event is
//! dequeued only when no event is running and no object I/O dispatched
//! under the previous snapshot is still outstanding.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, warn};

use flock_core::ring::{SnapshotHandle, VnodeSnapshot};
use flock_proto::constants::{FLOCK_MAX_COPIES, FLOCK_PROTO_VER};
use flock_proto::error::{FlockError, FlockResult};
use flock_proto::message::{ClusterOpMessage, JoinMessage, OpRequest, OpResponse};
use flock_proto::node::{ClusterStatus, Node};

use crate::cluster::{CheckJoinReply, ClusterDriver, ClusterEvent, JoinResult};
use crate::config::{self, EpochStore};
use crate::ctx::{ClusterCtx, IoGate};
use crate::ops::{self, ClusterOp, WorkInput};
use crate::peer;
use crate::recovery::RecoveryDriver;
use crate::store::StoreAdapter;

/// A cluster-wide operation waiting for its totally-ordered echo.
pub struct PendingOp {
    pub op: ClusterOp,
    pub msg: ClusterOpMessage,
    pub responder: oneshot::Sender<(OpResponse, Vec<u8>)>,
}

/// One serialized membership event.
pub enum Event {
    Join {
        joined: Node,
        members: Vec<Node>,
        msg: JoinMessage,
    },
    Leave {
        left: Node,
        members: Vec<Node>,
    },
    Notify {
        sender: Node,
        msg: ClusterOpMessage,
        req: Option<PendingOp>,
    },
}

/// Phase-A work for the event at the head of the queue. The worker gets
/// copied-in inputs and must not touch shared state.
#[derive(Debug, Clone)]
pub enum PhaseWork {
    /// Fetch the VDI bitmap from each peer and OR them together.
    FetchBitmaps { peers: Vec<Node>, one_is_enough: bool },
    /// Probe each listed member for TCP reachability.
    ProbeMajority { members: Vec<Node> },
    /// Nothing to do off-thread; apply phase B directly.
    Immediate,
}

/// Result of phase A, fed back into [`GroupEngine::complete`].
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// Merged bitmap bytes, or None when every fetch failed.
    Bitmap(Option<Vec<u8>>),
    /// Whether the majority of listed members was reachable.
    Majority { alive: bool },
    /// Phase A was empty.
    Ready,
}

/// Pre-compute for a blocked cluster operation, run on the block pool
/// while the driver holds the cluster-wide critical section.
pub struct BlockWork {
    pub op: ClusterOp,
    pub msg: ClusterOpMessage,
    pub input: WorkInput,
}

/// Terminal decisions the daemon loop must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlAction {
    /// This node was refused by the cluster: leave and terminate so the
    /// operator can restart it cleanly.
    Demote(String),
    /// Majority lost during a leave: halting the process is less
    /// dangerous than diverging.
    Abort(String),
}

pub struct GroupEngine {
    ctx: ClusterCtx,
    epochs: Arc<RwLock<EpochStore>>,
    snapshot: SnapshotHandle,
    io_gate: IoGate,
    driver: Arc<dyn ClusterDriver>,
    store: Arc<dyn StoreAdapter>,
    recovery: Arc<dyn RecoveryDriver>,

    /// Originator-local FIFO of cluster ops awaiting their ordered echo.
    pending: VecDeque<PendingOp>,
    /// Serialized membership events, in driver-committed order.
    event_queue: VecDeque<Event>,
    /// The event between its phase A start and phase B completion.
    cur_event: Option<Event>,
    /// Terminal decision awaiting the daemon loop.
    action: Option<CtrlAction>,
    next_op_id: u32,
}

impl GroupEngine {
    pub async fn new(
        mut ctx: ClusterCtx,
        epochs: Arc<RwLock<EpochStore>>,
        snapshot: SnapshotHandle,
        io_gate: IoGate,
        driver: Arc<dyn ClusterDriver>,
        store: Arc<dyn StoreAdapter>,
        recovery: Arc<dyn RecoveryDriver>,
    ) -> Self {
        let latest = epochs.read().await.latest();
        ctx.cinfo.status = if latest == 0 {
            ClusterStatus::WaitForFormat
        } else {
            ClusterStatus::WaitForJoin
        };
        // The registry is runtime state: a restarted node re-learns the
        // membership from the driver, not from its cached config.
        ctx.cinfo.nodes.clear();
        info!(
            "cluster status: {:?} (latest epoch {})",
            ctx.cinfo.status, latest
        );

        Self {
            ctx,
            epochs,
            snapshot,
            io_gate,
            driver,
            store,
            recovery,
            pending: VecDeque::new(),
            event_queue: VecDeque::new(),
            cur_event: None,
            action: None,
            next_op_id: 1,
        }
    }

    // -------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------

    pub fn status(&self) -> ClusterStatus {
        self.ctx.status()
    }

    pub fn epoch(&self) -> u32 {
        self.ctx.epoch()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.ctx.cinfo.nodes
    }

    pub fn this_node(&self) -> &Node {
        &self.ctx.this_node
    }

    pub fn leave_list(&self) -> &crate::ctx::LeaveList {
        &self.ctx.leave_list
    }

    pub fn join_finished(&self) -> bool {
        self.ctx.join_finished
    }

    pub fn configured_copies(&self) -> u8 {
        self.ctx.cinfo.nr_copies
    }

    pub fn recovery_disabled(&self) -> bool {
        self.ctx.cinfo.disable_recovery
    }

    pub fn snapshot(&self) -> Arc<VnodeSnapshot> {
        self.snapshot.load()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_events(&self) -> usize {
        self.event_queue.len()
    }

    pub fn event_running(&self) -> bool {
        self.cur_event.is_some()
    }

    /// True when the only thing keeping the next event queued is
    /// outstanding I/O.
    pub fn pump_blocked_on_io(&self) -> bool {
        self.cur_event.is_none()
            && !self.event_queue.is_empty()
            && self.io_gate.outstanding() > 0
    }

    pub fn take_action(&mut self) -> Option<CtrlAction> {
        self.action.take()
    }

    // -------------------------------------------------------------------
    // Join request (this node as the joiner)
    // -------------------------------------------------------------------

    /// Build this node's join claim from its durable history.
    pub async fn join_payload(&self) -> FlockResult<Vec<u8>> {
        let mut jm = JoinMessage::new(FLOCK_PROTO_VER);
        jm.nr_copies = self.ctx.cinfo.nr_copies;
        jm.cluster_flags = self.ctx.cinfo.flags;
        {
            let epochs = self.epochs.read().await;
            if let Some(rec) = epochs.latest_record() {
                jm.epoch = rec.epoch;
                jm.ctime = rec.ctime;
                jm.nodes = rec.nodes.clone();
            }
        }
        jm.encode()
    }

    /// Propose this node to the cluster through the driver.
    pub async fn join_request(&self) -> FlockResult<()> {
        let payload = self.join_payload().await?;
        self.driver.join(&self.ctx.this_node, &payload).await?;
        info!("join request sent for {}", self.ctx.this_node);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------

    /// Sanity-check a joiner's claimed `(ctime, epoch, nodes)` against
    /// local truth. Returns a wire result code, `FlockError::SUCCESS`
    /// when compatible.
    async fn cluster_sanity_check(
        &self,
        entries: &[Node],
        ctime: u64,
        epoch: u32,
    ) -> u32 {
        if matches!(
            self.ctx.status(),
            ClusterStatus::WaitForFormat | ClusterStatus::Shutdown
        ) {
            return FlockError::SUCCESS;
        }
        // A newly created node claims nothing and needs no checks.
        if entries.is_empty() {
            return FlockError::SUCCESS;
        }

        if ctime != self.ctx.cinfo.ctime {
            return FlockError::InvalidCtime.to_code();
        }

        let epochs = self.epochs.read().await;
        let latest = epochs.latest();
        if epoch > latest {
            // The joiner is from the future of a different history.
            return FlockError::OldNodeVer.to_code();
        }

        if self.ctx.can_recover() {
            return FlockError::SUCCESS;
        }

        if epoch < latest {
            return FlockError::NewNodeVer.to_code();
        }

        if entries != epochs.read(epoch).as_slice() {
            return FlockError::InvalidEpoch.to_code();
        }

        FlockError::SUCCESS
    }

    /// Full admission decision: result code, advised post-join status,
    /// and whether this join advances the epoch.
    async fn get_cluster_status(
        &self,
        from: &Node,
        entries: &[Node],
        ctime: u64,
        epoch: u32,
    ) -> (u32, ClusterStatus, bool) {
        let mut status = self.ctx.status();
        let mut inc_epoch = false;

        let mut result = self.cluster_sanity_check(entries, ctime, epoch).await;
        if result == FlockError::SUCCESS {
            match self.ctx.status() {
                ClusterStatus::Ok | ClusterStatus::Halt => inc_epoch = true,
                ClusterStatus::WaitForFormat => {
                    if !entries.is_empty() {
                        result = FlockError::NotFormatted.to_code();
                    }
                }
                ClusterStatus::WaitForJoin => {
                    let epochs = self.epochs.read().await;
                    let local_entries = epochs.read(epoch);
                    let need = self.ctx.cinfo.nodes.len() + 1;

                    if need != local_entries.len() {
                        // Some prior members are still missing. If the
                        // leave list accounts for every one of them, they
                        // are permanently lost and the cluster can start
                        // working without them.
                        if local_entries.len() == need + self.ctx.leave_list.len() {
                            inc_epoch = true;
                            status = ClusterStatus::Ok;
                        }
                    } else {
                        let all_accounted = local_entries.iter().all(|e| {
                            e.nid == from.nid
                                || self.ctx.cinfo.nodes.iter().any(|n| n.nid == e.nid)
                        });
                        if all_accounted {
                            status = ClusterStatus::Ok;
                        }
                    }
                }
                ClusterStatus::Shutdown => {
                    result = FlockError::Shutdown.to_code();
                }
            }
        }

        if result != FlockError::SUCCESS {
            warn!("join check for {} failed: {:#x}", from.nid, result);
        }
        (result, status, inc_epoch)
    }

    /// The admission query the driver runs on every existing member
    /// before committing a join. Returns the verdict plus the join
    /// message updated with this side's view.
    pub async fn check_join(&mut self, joining: &Node, payload: &[u8]) -> CheckJoinReply {
        let mut jm = match JoinMessage::decode(payload) {
            Ok(jm) => jm,
            Err(e) => {
                error!("undecodable join message from {}: {}", joining.nid, e);
                return CheckJoinReply {
                    result: JoinResult::Fail,
                    payload: payload.to_vec(),
                };
            }
        };

        if jm.proto_ver != FLOCK_PROTO_VER {
            error!("invalid protocol version from {}: {}", joining.nid, jm.proto_ver);
            jm.result = FlockError::VerMismatch.to_code();
            return self.reply(JoinResult::Fail, jm);
        }

        if self.ctx.is_myself(joining) {
            // First member: nobody else can vouch, so this node elects
            // itself master from its own durable history.
            let record = self.epochs.read().await.latest_record().cloned();
            match record {
                Some(rec) => {
                    self.ctx.cinfo.epoch = rec.epoch;
                    jm.ctime = rec.ctime;
                    let (_, status, _) = self
                        .get_cluster_status(joining, &rec.nodes, rec.ctime, rec.epoch)
                        .await;
                    jm.cluster_status = status;
                }
                None => jm.cluster_status = ClusterStatus::WaitForFormat,
            }
            return self.reply(JoinResult::Success, jm);
        }

        let (result, status, inc_epoch) = self
            .get_cluster_status(joining, &jm.nodes, jm.ctime, jm.epoch)
            .await;
        let claimed_epoch = jm.epoch;
        jm.result = result;
        jm.cluster_status = status;
        jm.inc_epoch = inc_epoch;
        jm.nr_copies = self.ctx.cinfo.nr_copies;
        jm.cluster_flags = self.ctx.cinfo.flags;
        jm.ctime = self.ctx.cinfo.ctime;
        jm.store = self.ctx.cinfo.default_store.clone();
        jm.leave_nodes.clear();

        if result == FlockError::SUCCESS && status != ClusterStatus::Ok {
            // Hand the joiner our leave list so it can account for the
            // missing members too.
            jm.leave_nodes = self.ctx.leave_list.iter().cloned().collect();
            if !jm.leave_nodes.is_empty() {
                jm.nodes.clear();
            }
        } else if result != FlockError::SUCCESS
            && claimed_epoch > self.ctx.cinfo.epoch
            && status == ClusterStatus::WaitForJoin
        {
            // The joiner's history is ahead of ours: it becomes the
            // authoritative master and keeps its own epoch in the
            // message.
            info!(
                "transfer mastership ({}, {})",
                claimed_epoch, self.ctx.cinfo.epoch
            );
            return self.reply(JoinResult::MasterTransfer, jm);
        }
        jm.epoch = self.ctx.cinfo.epoch;

        let verdict = match FlockError::from_code(result) {
            None => JoinResult::Success,
            Some(FlockError::OldNodeVer) | Some(FlockError::NewNodeVer) => JoinResult::JoinLater,
            Some(_) => JoinResult::Fail,
        };
        self.reply(verdict, jm)
    }

    fn reply(&self, result: JoinResult, jm: JoinMessage) -> CheckJoinReply {
        let payload = jm.encode().unwrap_or_default();
        debug!("check_join verdict {:?} ({:#x})", result, jm.result);
        CheckJoinReply { result, payload }
    }

    // -------------------------------------------------------------------
    // Driver callbacks
    // -------------------------------------------------------------------

    /// Dispatch one driver event. A `Block` event yields the pre-compute
    /// the daemon must run on the block pool.
    pub async fn handle_event(&mut self, event: ClusterEvent) -> Option<BlockWork> {
        match event {
            ClusterEvent::CheckJoin {
                joining,
                payload,
                reply,
            } => {
                let verdict = self.check_join(&joining, &payload).await;
                let _ = reply.send(verdict);
                None
            }
            ClusterEvent::Join {
                joined,
                members,
                result,
                payload,
            } => {
                self.handle_join_cb(joined, members, result, &payload).await;
                None
            }
            ClusterEvent::Leave { left, members } => {
                self.handle_leave_cb(left, members);
                None
            }
            ClusterEvent::Notify { sender, payload } => {
                self.handle_notify_cb(sender, &payload);
                None
            }
            ClusterEvent::Block => self.handle_block(),
        }
    }

    /// A join was committed cluster-wide.
    pub async fn handle_join_cb(
        &mut self,
        joined: Node,
        members: Vec<Node>,
        result: JoinResult,
        payload: &[u8],
    ) {
        let jm = match JoinMessage::decode(payload) {
            Ok(jm) => jm,
            Err(e) => {
                error!("undecodable join payload for {}: {}", joined.nid, e);
                return;
            }
        };

        if self.ctx.is_myself(&joined) {
            match result {
                JoinResult::Fail => {
                    error!("failed to join: this node has an invalid epoch history");
                    self.action = Some(CtrlAction::Demote(
                        "join rejected: invalid epoch history".into(),
                    ));
                    return;
                }
                JoinResult::JoinLater => {
                    error!("failed to join: this node must be added after the cluster starts working");
                    self.action = Some(CtrlAction::Demote(
                        "join rejected: wait for a working cluster".into(),
                    ));
                    return;
                }
                _ => {}
            }
        }

        match result {
            JoinResult::Success => {
                debug!("join {}", joined);
                if self.ctx.status() == ClusterStatus::Shutdown {
                    return;
                }
                self.event_queue.push_back(Event::Join {
                    joined,
                    members,
                    msg: jm,
                });
            }
            JoinResult::Fail | JoinResult::JoinLater => {
                // Another node was refused. While reconstituting, record
                // it as permanently gone if it belonged to the last
                // committed membership.
                if self.ctx.status() != ClusterStatus::WaitForJoin {
                    return;
                }
                let last_members = {
                    let epochs = self.epochs.read().await;
                    epochs.read(epochs.latest())
                };
                if self.ctx.leave_list.contains(&joined)
                    || !last_members.iter().any(|n| n.nid == joined.nid)
                {
                    return;
                }
                if !self.ctx.cinfo.nodes.iter().any(|n| n.nid == joined.nid) {
                    self.ctx.leave_list.add(joined);
                }
                self.try_reconstitute(members.len()).await;
            }
            JoinResult::MasterTransfer => {
                let last_members = {
                    let epochs = self.epochs.read().await;
                    epochs.read(epochs.latest())
                };
                for node in &jm.leave_nodes {
                    if self.ctx.leave_list.contains(node)
                        || !last_members.iter().any(|n| n.nid == node.nid)
                        || self.ctx.cinfo.nodes.iter().any(|n| n.nid == node.nid)
                    {
                        continue;
                    }
                    self.ctx.leave_list.add(node.clone());
                }

                // Mastership transfer is done once this node identifies
                // itself as the authoritative master.
                if !self.ctx.join_finished {
                    self.ctx.join_finished = true;
                    let this = self.ctx.this_node.clone();
                    self.update_node_info(vec![this]);
                    self.ctx.cinfo.epoch = self.epochs.read().await.latest();
                }

                self.try_reconstitute(members.len()).await;
            }
        }
    }

    /// A member left or was declared dead.
    pub fn handle_leave_cb(&mut self, left: Node, members: Vec<Node>) {
        debug!("leave {}", left);
        if self.ctx.status() == ClusterStatus::Shutdown {
            return;
        }
        self.event_queue.push_back(Event::Leave { left, members });
    }

    /// A totally-ordered notification arrived.
    pub fn handle_notify_cb(&mut self, sender: Node, payload: &[u8]) {
        let msg = match ClusterOpMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable notify from {}: {}", sender.nid, e);
                return;
            }
        };

        // The originator's own echo resolves the head of its pending
        // queue; the driver preserves per-originator order.
        let req = if self.ctx.is_myself(&sender) {
            let head = self.pending.pop_front();
            if let Some(p) = &head {
                if p.msg.req.id != msg.req.id {
                    warn!(
                        "pending queue out of order: expected op {}, got {}",
                        p.msg.req.id, msg.req.id
                    );
                }
            }
            head
        } else {
            None
        };

        self.event_queue.push_back(Event::Notify { sender, msg, req });
    }

    /// Our blocked operation holds the cluster-wide critical section:
    /// hand its pre-compute to the block pool.
    pub fn handle_block(&mut self) -> Option<BlockWork> {
        let head = match self.pending.front() {
            Some(head) => head,
            None => {
                warn!("block event with empty pending queue");
                return None;
            }
        };
        let snapshot = self.snapshot.load();
        Some(BlockWork {
            op: head.op.clone(),
            msg: head.msg.clone(),
            input: WorkInput {
                nr_zones: snapshot.nr_zones(),
                nr_nodes: snapshot.nr_nodes(),
                configured_copies: self.ctx.cinfo.nr_copies,
            },
        })
    }

    /// When the leave list now accounts for every missing member of the
    /// last committed epoch, the survivors reconstitute the cluster.
    async fn try_reconstitute(&mut self, nr_members: usize) {
        let nr_local = {
            let epochs = self.epochs.read().await;
            epochs.read(self.ctx.cinfo.epoch).len()
        };
        let nr_leave = self.ctx.leave_list.len();
        debug!("{} == {} + {}", nr_local, nr_members, nr_leave);
        if nr_local > 0 && nr_local == nr_members + nr_leave {
            self.ctx.cinfo.status = ClusterStatus::Ok;
            self.ctx.leave_list.clear();
            info!("cluster status: Ok (missing nodes accounted for)");
            self.save_config().await;
        }
    }

    // -------------------------------------------------------------------
    // Cluster-wide operations
    // -------------------------------------------------------------------

    /// Queue a cluster-wide operation. Ops with a pre-compute step go
    /// through the driver's critical section; the rest are packaged and
    /// broadcast directly. Either way the originator awaits the ordered
    /// echo on the returned channel.
    pub async fn submit(
        &mut self,
        op: ClusterOp,
    ) -> FlockResult<oneshot::Receiver<(OpResponse, Vec<u8>)>> {
        if let ClusterOp::Format {
            nr_copies, store, ..
        } = &op
        {
            ops::validate_format(*nr_copies, store)?;
        }

        let id = self.next_op_id;
        self.next_op_id = self.next_op_id.wrapping_add(1);
        let req = OpRequest::new(op.opcode(), self.ctx.cinfo.epoch, id);
        // The body rides along only for ops applied on every node.
        let body = if op.has_process_main() {
            bincode::serialize(&op).map_err(|_| FlockError::SystemError)?
        } else {
            Vec::new()
        };
        let msg = ClusterOpMessage::new(req, body);

        let (tx, rx) = oneshot::channel();
        let blocked = op.has_process_work();
        let encoded = msg.encode();
        self.pending.push_back(PendingOp {
            op,
            msg,
            responder: tx,
        });

        if blocked {
            self.driver.block().await?;
        } else {
            self.driver.notify(&encoded).await?;
        }
        Ok(rx)
    }

    /// Apply an op's main step on this node. Returns the wire result code.
    async fn apply_cluster_op(&mut self, op: &ClusterOp) -> u32 {
        match op {
            ClusterOp::Format {
                nr_copies,
                flags,
                store,
                ctime,
            } => {
                if self.ctx.status() != ClusterStatus::WaitForFormat {
                    error!("format refused: cluster already has an epoch history");
                    return FlockError::ClusterError.to_code();
                }
                self.ctx.cinfo.nr_copies = *nr_copies;
                self.ctx.cinfo.flags = *flags;
                self.ctx.cinfo.default_store = store.clone();
                self.ctx.cinfo.ctime = *ctime;

                let dir = self.ctx.dir.clone();
                if let Err(e) = self.store.init(&dir).await {
                    return e.to_code();
                }

                self.ctx.cinfo.epoch = 1;
                let nodes = self.ctx.cinfo.nodes.clone();
                if let Err(e) = self.epochs.write().await.append(1, *ctime, nodes).await {
                    return e.to_code();
                }
                self.ctx.leave_list.clear();
                self.ctx.cinfo.status = ClusterStatus::Ok;
                info!(
                    "cluster formatted: copies={}, flags={:#x}, store={}",
                    nr_copies, flags, store
                );
                self.save_config().await;
                FlockError::SUCCESS
            }
            ClusterOp::Shutdown => {
                info!("cluster shutdown");
                self.ctx.cinfo.status = ClusterStatus::Shutdown;
                FlockError::SUCCESS
            }
            ClusterOp::AlterCopy { nr_copies } => {
                if *nr_copies == 0 || *nr_copies > FLOCK_MAX_COPIES {
                    return FlockError::InvalidParms.to_code();
                }
                info!(
                    "cluster copies: {} -> {}",
                    self.ctx.cinfo.nr_copies, nr_copies
                );
                self.ctx.cinfo.nr_copies = *nr_copies;
                self.save_config().await;
                FlockError::SUCCESS
            }
            ClusterOp::EnableRecovery => {
                info!("cluster recovery enabled");
                self.ctx.cinfo.disable_recovery = false;
                FlockError::SUCCESS
            }
            ClusterOp::DisableRecovery => {
                info!("cluster recovery disabled");
                self.ctx.cinfo.disable_recovery = true;
                FlockError::SUCCESS
            }
        }
    }

    // -------------------------------------------------------------------
    // Event serializer
    // -------------------------------------------------------------------

    /// Start the next event's phase A if the gate allows: one event at a
    /// time, and never while I/O dispatched under the previous snapshot
    /// is still in flight.
    pub fn pump(&mut self) -> Option<PhaseWork> {
        if self.cur_event.is_some() || self.io_gate.outstanding() > 0 {
            return None;
        }
        let event = self.event_queue.pop_front()?;

        let work = match &event {
            Event::Join { members, msg, .. } => {
                let joining_running_cluster = matches!(
                    msg.cluster_status,
                    ClusterStatus::Ok | ClusterStatus::Halt
                ) && self.ctx.status() != ClusterStatus::Ok;
                if joining_running_cluster {
                    let peers: Vec<Node> = members
                        .iter()
                        .filter(|m| !self.ctx.is_myself(m))
                        .cloned()
                        .collect();
                    if peers.is_empty() {
                        PhaseWork::Immediate
                    } else {
                        PhaseWork::FetchBitmaps {
                            peers,
                            one_is_enough: self.ctx.status() == ClusterStatus::WaitForFormat,
                        }
                    }
                } else {
                    PhaseWork::Immediate
                }
            }
            // Probe the pre-leave membership: the registry still lists
            // the departed node until phase B applies the change.
            Event::Leave { .. } => PhaseWork::ProbeMajority {
                members: self.ctx.cinfo.nodes.clone(),
            },
            Event::Notify { .. } => PhaseWork::Immediate,
        };

        self.cur_event = Some(event);
        Some(work)
    }

    /// Apply phase B of the running event.
    pub async fn complete(&mut self, outcome: PhaseOutcome) -> FlockResult<()> {
        let Some(event) = self.cur_event.take() else {
            warn!("phase completion with no running event");
            return Ok(());
        };

        match event {
            Event::Join {
                joined,
                members,
                msg,
            } => {
                if let PhaseOutcome::Bitmap(Some(raw)) = &outcome {
                    peer::merge_vdi_bitmap(&self.ctx.vdi_inuse, raw).await;
                }
                self.update_cluster_info(&msg, &joined, &members).await?;

                self.ctx.cinfo.status = msg.cluster_status;
                if self.ctx.can_recover() && msg.inc_epoch {
                    self.ctx.leave_list.clear();
                    self.recovery.start_recovery(self.ctx.cinfo.epoch);
                }
                if self.ctx.status() == ClusterStatus::Halt
                    && self.snapshot.load().nr_zones() >= self.ctx.cinfo.nr_copies as usize
                {
                    self.ctx.cinfo.status = ClusterStatus::Ok;
                    info!("cluster status: Halt -> Ok (zones restored)");
                }
                if self.ctx.is_myself(&joined) {
                    info!("joined flock cluster at epoch {}", self.ctx.cinfo.epoch);
                }
                self.save_config().await;
            }
            Event::Leave { left, members } => {
                if let PhaseOutcome::Majority { alive: false } = outcome {
                    error!("perhaps a network partition has occurred?");
                    self.action = Some(CtrlAction::Abort(
                        "majority of nodes unreachable after leave".into(),
                    ));
                    return Ok(());
                }

                info!("node {} left cluster", left.nid);
                self.update_node_info(members);

                if self.ctx.cinfo.nodes.is_empty() {
                    warn!("all nodes have left, cluster shutting down");
                    self.ctx.cinfo.status = ClusterStatus::Shutdown;
                    self.save_config().await;
                    return Ok(());
                }

                if self.ctx.can_recover() {
                    self.ctx.cinfo.epoch += 1;
                    let epoch = self.ctx.cinfo.epoch;
                    let ctime = self.ctx.cinfo.ctime;
                    let nodes = self.ctx.cinfo.nodes.clone();
                    self.epochs.write().await.append(epoch, ctime, nodes).await?;
                    self.recovery.start_recovery(epoch);
                }

                if self.ctx.can_halt()
                    && self.snapshot.load().nr_zones() < self.ctx.cinfo.nr_copies as usize
                {
                    self.ctx.cinfo.status = ClusterStatus::Halt;
                    info!("cluster status: Ok -> Halt (insufficient zones)");
                }
                self.save_config().await;
            }
            Event::Notify { msg, req, .. } => {
                let mut rsp = msg.rsp;
                if rsp.result == FlockError::SUCCESS && !msg.data.is_empty() {
                    match bincode::deserialize::<ClusterOp>(&msg.data) {
                        Ok(op) if op.has_process_main() => {
                            rsp.result = self.apply_cluster_op(&op).await;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            warn!("undecodable cluster op body");
                            rsp.result = FlockError::InvalidParms.to_code();
                        }
                    }
                }
                if let Some(pending) = req {
                    // Only an op's declared output travels back to the
                    // originator, not the request body.
                    let mut data = msg.data.clone();
                    data.truncate(rsp.data_length as usize);
                    let _ = pending.responder.send((rsp, data));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Membership bookkeeping
    // -------------------------------------------------------------------

    /// Replace the registry with the committed membership and publish a
    /// fresh vnode snapshot. The previous snapshot stays alive for any
    /// reader that acquired it.
    fn update_node_info(&mut self, mut members: Vec<Node>) {
        members.sort();
        self.ctx.cinfo.nodes = members;
        self.ctx.leave_list.retain_absent(&self.ctx.cinfo.nodes);
        self.snapshot
            .publish(VnodeSnapshot::build(&self.ctx.cinfo.nodes));
        debug!(
            "registry: {} nodes, {} zones",
            self.ctx.cinfo.nodes.len(),
            self.snapshot.load().nr_zones()
        );
    }

    /// First-join bookkeeping for this node: adopt the cluster's
    /// parameters, make sure the pre-join epoch record exists, take over
    /// the leave list, and bring up the store backend.
    async fn finish_join(
        &mut self,
        msg: &JoinMessage,
        joined: &Node,
        members: &[Node],
    ) -> FlockResult<()> {
        self.ctx.join_finished = true;
        if msg.nr_copies > 0 {
            self.ctx.cinfo.nr_copies = msg.nr_copies;
        }
        self.ctx.cinfo.epoch = msg.epoch;

        // Recovery expects the record for the epoch before this node
        // joined, excluding the joiner.
        if matches!(
            msg.cluster_status,
            ClusterStatus::Ok | ClusterStatus::Halt
        ) && msg.inc_epoch
        {
            let mut old_nodes: Vec<Node> = members
                .iter()
                .filter(|m| m.nid != joined.nid)
                .cloned()
                .collect();
            old_nodes.sort();
            if !old_nodes.is_empty() {
                self.epochs
                    .write()
                    .await
                    .append(msg.epoch, msg.ctime, old_nodes)
                    .await?;
            }
        }

        if msg.cluster_status != ClusterStatus::Ok {
            let last_members = {
                let epochs = self.epochs.read().await;
                epochs.read(epochs.latest())
            };
            for node in &msg.leave_nodes {
                if self.ctx.leave_list.contains(node)
                    || !last_members.iter().any(|n| n.nid == node.nid)
                {
                    continue;
                }
                self.ctx.leave_list.add(node.clone());
            }
        }

        if self.ctx.cinfo.default_store.is_empty() && !msg.store.is_empty() {
            self.ctx.cinfo.default_store = msg.store.clone();
            let dir = self.ctx.dir.clone();
            self.store.init(&dir).await?;
        }

        // A node rejoining after a crash may hold replicas from a dead
        // epoch; they must not shadow live data.
        if msg.inc_epoch {
            if let Err(e) = self.store.purge_stale_objects().await {
                warn!("may have stale objects: {}", e);
            }
        }
        Ok(())
    }

    /// Join phase B: fold the committed join into the cluster state.
    async fn update_cluster_info(
        &mut self,
        msg: &JoinMessage,
        joined: &Node,
        members: &[Node],
    ) -> FlockResult<()> {
        debug!(
            "update_cluster_info: status={:?}, epoch={}, result={:#x}, joined_before={}",
            msg.cluster_status, msg.epoch, msg.result, self.ctx.join_finished
        );

        if !self.ctx.join_finished {
            self.finish_join(msg, joined, members).await?;
        }

        self.update_node_info(members.to_vec());

        if matches!(
            msg.cluster_status,
            ClusterStatus::Ok | ClusterStatus::Halt
        ) {
            if !matches!(
                self.ctx.status(),
                ClusterStatus::Ok | ClusterStatus::Halt
            ) {
                // Fresh node adopting a running cluster's parameters;
                // must land before the epoch record is written so the
                // record carries the cluster's ctime.
                self.ctx.cinfo.nr_copies = msg.nr_copies;
                self.ctx.cinfo.flags = msg.cluster_flags;
                self.ctx.cinfo.ctime = msg.ctime;
            }
            if msg.inc_epoch {
                self.ctx.cinfo.epoch += 1;
                let epoch = self.ctx.cinfo.epoch;
                let ctime = self.ctx.cinfo.ctime;
                let nodes = self.ctx.cinfo.nodes.clone();
                self.epochs.write().await.append(epoch, ctime, nodes).await?;
                info!("epoch {} with {} nodes", epoch, self.ctx.cinfo.nodes.len());
            }
        }
        Ok(())
    }

    async fn save_config(&self) {
        if let Err(e) = config::save_config(&self.ctx.dir, &self.ctx.cinfo).await {
            error!("failed to save config: {}", e);
        }
    }

    /// Persist the current cluster view; called at clean shutdown.
    pub async fn persist(&self) {
        self.save_config().await;
    }
}
