//! Group-communication drivers for the flock daemon.
//!
//! A driver is any totally-ordered broadcast layer: it proposes joins,
//! announces leaves, broadcasts notifications, and single-flights
//! cluster-wide blocked operations. The membership core consumes its
//! callbacks as [`ClusterEvent`]s from a single queue, in the order the
//! driver committed them.
//!
//! One implementation is provided: `local`, an in-process driver for
//! single-node deployments and tests. Payload bytes handed to a driver
//! must come back bit-exact.

use async_trait::async_trait;
use tokio::sync::oneshot;

use flock_proto::error::FlockResult;
use flock_proto::node::Node;

/// Verdict of the admission query run on existing members before a join
/// is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResult {
    /// The joiner is admitted.
    Success,
    /// The joiner's claimed history is incompatible.
    Fail,
    /// The joiner must wait until the cluster starts working.
    JoinLater,
    /// The joiner's epoch is ahead of ours; it becomes the authoritative
    /// master and we adopt its history.
    MasterTransfer,
}

/// Reply to a [`ClusterEvent::CheckJoin`] admission query. `payload` is
/// the join message updated by the admitting side (verdict code, cluster
/// parameters, leave list) and is what the driver commits with the join.
#[derive(Debug)]
pub struct CheckJoinReply {
    pub result: JoinResult,
    pub payload: Vec<u8>,
}

/// Events delivered from the driver to the membership core.
#[derive(Debug)]
pub enum ClusterEvent {
    /// Admission query: run the join checks for `joining` and reply with
    /// the verdict before the driver commits the join.
    CheckJoin {
        joining: Node,
        payload: Vec<u8>,
        reply: oneshot::Sender<CheckJoinReply>,
    },
    /// A join was committed cluster-wide with the given verdict.
    Join {
        joined: Node,
        members: Vec<Node>,
        result: JoinResult,
        payload: Vec<u8>,
    },
    /// A member left or was declared dead.
    Leave { left: Node, members: Vec<Node> },
    /// Totally-ordered broadcast payload. The result of an unblocked
    /// cluster operation also arrives this way, on every node including
    /// the originator.
    Notify { sender: Node, payload: Vec<u8> },
    /// This node's blocked cluster operation holds the cluster-wide
    /// critical section; run its pre-compute and unblock.
    Block,
}

/// Trait all group-driver backends implement.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Human-readable driver name (e.g. "local").
    fn name(&self) -> &str;

    /// Initialize the driver with this node's identity.
    async fn init(&self, this_node: &Node) -> FlockResult<()>;

    /// Propose joining the cluster, carrying the opaque join payload.
    async fn join(&self, node: &Node, payload: &[u8]) -> FlockResult<()>;

    /// Leave the cluster gracefully.
    async fn leave(&self) -> FlockResult<()>;

    /// Totally-ordered broadcast to all members, ourselves included.
    async fn notify(&self, payload: &[u8]) -> FlockResult<()>;

    /// Enter the cluster-wide critical section. The driver delivers
    /// [`ClusterEvent::Block`] to exactly one blocked originator at a
    /// time.
    async fn block(&self) -> FlockResult<()>;

    /// Release the critical section; the driver broadcasts `payload` as
    /// a totally-ordered notify.
    async fn unblock(&self, payload: &[u8]) -> FlockResult<()>;

    /// Receive the next cluster event, in committed order.
    async fn recv_event(&self) -> FlockResult<ClusterEvent>;
}

pub mod local;
