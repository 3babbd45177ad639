//! Multi-node membership scenarios.
//!
//! Each test instantiates one engine per node and plays the driver's
//! role: it runs admission on the master, then delivers the committed
//! events to every engine in the same total order, fabricating phase-A
//! outcomes where the real daemon would touch the network.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;

use flock_core::ring::{SnapshotHandle, VnodeSnapshot};
use flock_proto::constants::{FLOCK_CLUSTER_FLAG_STRICT, FLOCK_PROTO_VER};
use flock_proto::error::FlockError;
use flock_proto::message::{ClusterOpMessage, JoinMessage, OpRequest};
use flock_proto::node::{ClusterStatus, Node, NodeId};

use flockd::cluster::local::LocalDriver;
use flockd::config::{self, EpochStore};
use flockd::ctx::{ClusterCtx, IoGate};
use flockd::group::{CtrlAction, GroupEngine, PhaseOutcome, PhaseWork};
use flockd::ops::ClusterOp;
use flockd::recovery::ChannelRecovery;
use flockd::store::NullStore;

const CTIME: u64 = 1_700_000_000;

fn make_node(last: u8, zone: u32) -> Node {
    let nid = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 7400);
    let mut node = Node::new(nid);
    node.zone = zone;
    node
}

struct Member {
    node: Node,
    engine: GroupEngine,
    epochs: Arc<RwLock<EpochStore>>,
    recovery_rx: UnboundedReceiver<u32>,
    dir: TempDir,
}

impl Member {
    async fn latest(&self) -> u32 {
        self.epochs.read().await.latest()
    }

    async fn log(&self, epoch: u32) -> Vec<Node> {
        self.epochs.read().await.read(epoch)
    }

    fn recovery_epochs(&mut self) -> Vec<u32> {
        let mut epochs = Vec::new();
        while let Ok(epoch) = self.recovery_rx.try_recv() {
            epochs.push(epoch);
        }
        epochs
    }
}

async fn boot_member(node: Node, dir: TempDir) -> Member {
    let mut ctx = ClusterCtx::new(node.clone(), dir.path().to_path_buf());
    if let Ok(cinfo) = config::load_config(dir.path()).await {
        ctx.cinfo = cinfo;
    }
    let epochs = Arc::new(RwLock::new(EpochStore::open(dir.path()).await.unwrap()));
    let (recovery, recovery_rx) = ChannelRecovery::new();
    let engine = GroupEngine::new(
        ctx,
        epochs.clone(),
        SnapshotHandle::new(VnodeSnapshot::empty()),
        IoGate::new(),
        Arc::new(LocalDriver::new()),
        Arc::new(NullStore),
        Arc::new(recovery),
    )
    .await;
    Member {
        node,
        engine,
        epochs,
        recovery_rx,
        dir,
    }
}

async fn new_member(node: Node) -> Member {
    boot_member(node, TempDir::new().unwrap()).await
}

/// Restart a node from its data directory, the way the daemon boots.
async fn restart_member(member: Member) -> Member {
    let Member { node, dir, .. } = member;
    boot_member(node, dir).await
}

/// Apply every queued event, fabricating phase-A outcomes.
async fn drain(engine: &mut GroupEngine) {
    while let Some(work) = engine.pump() {
        let outcome = match work {
            PhaseWork::FetchBitmaps { .. } => PhaseOutcome::Bitmap(None),
            PhaseWork::ProbeMajority { .. } => PhaseOutcome::Majority { alive: true },
            PhaseWork::Immediate => PhaseOutcome::Ready,
        };
        engine.complete(outcome).await.unwrap();
    }
}

/// Run admission for `joiner` on the cluster master and deliver the
/// committed join to every engine. Returns the verdict.
async fn commit_join(
    members: &mut Vec<Member>,
    joiner: &mut Member,
) -> flockd::cluster::JoinResult {
    let payload = joiner.engine.join_payload().await.unwrap();
    let jnode = joiner.node.clone();
    let reply = match members.first_mut() {
        Some(master) => master.engine.check_join(&jnode, &payload).await,
        None => joiner.engine.check_join(&jnode, &payload).await,
    };

    let mut committed: Vec<Node> = members.iter().map(|m| m.node.clone()).collect();
    committed.push(jnode.clone());
    committed.sort();

    for member in members.iter_mut() {
        member
            .engine
            .handle_join_cb(jnode.clone(), committed.clone(), reply.result, &reply.payload)
            .await;
        drain(&mut member.engine).await;
    }
    joiner
        .engine
        .handle_join_cb(jnode, committed, reply.result, &reply.payload)
        .await;
    drain(&mut joiner.engine).await;

    reply.result
}

/// Deliver a leave to every surviving engine and return the departed
/// member (its data directory intact, as after a crash).
async fn commit_leave(members: &mut Vec<Member>, leaver_idx: usize) -> Member {
    let leaver = members.remove(leaver_idx);
    let committed: Vec<Node> = members.iter().map(|m| m.node.clone()).collect();
    for member in members.iter_mut() {
        member
            .engine
            .handle_leave_cb(leaver.node.clone(), committed.clone());
        drain(&mut member.engine).await;
    }
    leaver
}

/// Broadcast a cluster op to every engine as its ordered notify.
async fn commit_op(members: &mut [Member], op: ClusterOp) {
    let body = bincode::serialize(&op).unwrap();
    let req = OpRequest::new(op.opcode(), 0, 1);
    let payload = ClusterOpMessage::new(req, body).encode();
    let sender = make_node(250, 0); // not a member: nobody pops pending
    for member in members.iter_mut() {
        member.engine.handle_notify_cb(sender.clone(), &payload);
        drain(&mut member.engine).await;
    }
}

/// S1 prologue: three fresh nodes in zones 0..2, formatted with the
/// strict flag so redundancy loss halts writes.
async fn three_node_cluster() -> Vec<Member> {
    let mut members: Vec<Member> = Vec::new();
    for last in 1..=3u8 {
        let mut joiner = new_member(make_node(last, (last - 1) as u32)).await;
        let result = commit_join(&mut members, &mut joiner).await;
        assert_eq!(result, flockd::cluster::JoinResult::Success);
        members.push(joiner);
    }
    for member in &members {
        assert_eq!(member.engine.status(), ClusterStatus::WaitForFormat);
    }
    commit_op(
        &mut members,
        ClusterOp::Format {
            nr_copies: 3,
            flags: FLOCK_CLUSTER_FLAG_STRICT,
            store: "plain".into(),
            ctime: CTIME,
        },
    )
    .await;
    members
}

fn sorted_nodes(lasts_zones: &[(u8, u32)]) -> Vec<Node> {
    let mut nodes: Vec<Node> = lasts_zones
        .iter()
        .map(|&(last, zone)| make_node(last, zone))
        .collect();
    nodes.sort();
    nodes
}

#[tokio::test]
async fn s1_fresh_format() {
    let mut members = three_node_cluster().await;

    let expect = sorted_nodes(&[(1, 0), (2, 1), (3, 2)]);
    for member in &mut members {
        assert_eq!(member.engine.status(), ClusterStatus::Ok);
        assert_eq!(member.engine.epoch(), 1);
        assert_eq!(member.latest().await, 1);
        assert_eq!(member.log(1).await, expect);
        assert_eq!(member.engine.nodes(), expect.as_slice());
        assert!(member.engine.leave_list().is_empty());
    }
}

#[tokio::test]
async fn s2_graceful_add() {
    let mut members = three_node_cluster().await;

    let mut joiner = new_member(make_node(4, 3)).await;
    let payload = joiner.engine.join_payload().await.unwrap();

    // Every existing member reaches the same verdict: SUCCESS with
    // inc_epoch set.
    for member in members.iter_mut() {
        let reply = member.engine.check_join(&joiner.node, &payload).await;
        assert_eq!(reply.result, flockd::cluster::JoinResult::Success);
        let jm = JoinMessage::decode(&reply.payload).unwrap();
        assert!(jm.inc_epoch);
        assert_eq!(jm.result, FlockError::SUCCESS);
    }

    let result = commit_join(&mut members, &mut joiner).await;
    assert_eq!(result, flockd::cluster::JoinResult::Success);
    members.push(joiner);

    let expect = sorted_nodes(&[(1, 0), (2, 1), (3, 2), (4, 3)]);
    for member in &mut members {
        assert_eq!(member.engine.status(), ClusterStatus::Ok);
        assert_eq!(member.engine.epoch(), 2);
        assert_eq!(member.log(2).await, expect);
        assert!(member.engine.leave_list().is_empty());
        // Recovery was kicked at the new epoch.
        assert!(member.recovery_epochs().contains(&2));
    }
}

#[tokio::test]
async fn s3_stale_rejoin() {
    let mut members = three_node_cluster().await;
    let mut node4 = new_member(make_node(4, 3)).await;
    commit_join(&mut members, &mut node4).await;
    members.push(node4);

    // Node 4 dies; the survivors commit epoch 3 without it.
    let node4 = commit_leave(&mut members, 3).await;
    for member in &members {
        assert_eq!(member.engine.epoch(), 3);
    }

    // The cluster restarts but only two of the three epoch-3 members
    // come back, so it is stuck reconstituting in WaitForJoin when the
    // stale node 4 shows up with its epoch-2 view.
    let mut came_back: Vec<Member> = members.drain(..2).collect();
    drop(members);
    let mut restarted: Vec<Member> = Vec::new();
    for member in came_back.drain(..) {
        let mut m = restart_member(member).await;
        let result = commit_join(&mut restarted, &mut m).await;
        assert_eq!(result, flockd::cluster::JoinResult::Success);
        restarted.push(m);
    }
    for member in &restarted {
        assert_eq!(member.engine.status(), ClusterStatus::WaitForJoin);
    }

    let mut node4 = restart_member(node4).await;
    {
        let payload = node4.engine.join_payload().await.unwrap();
        let jm = JoinMessage::decode(&payload).unwrap();
        assert_eq!(jm.epoch, 2);
        assert_eq!(jm.nodes.len(), 4);
    }

    let result = commit_join(&mut restarted, &mut node4).await;
    assert_eq!(result, flockd::cluster::JoinResult::JoinLater);

    // The joiner saw its own refusal and demotes itself: the daemon loop
    // turns this into leave() + exit.
    assert!(matches!(
        node4.engine.take_action(),
        Some(CtrlAction::Demote(_))
    ));

    // The stale claim carried NEW_NODE_VER back to the joiner.
    let payload = node4.engine.join_payload().await.unwrap();
    let reply = restarted[0].engine.check_join(&node4.node, &payload).await;
    let jm = JoinMessage::decode(&reply.payload).unwrap();
    assert_eq!(jm.result, FlockError::NewNodeVer.to_code());
}

#[tokio::test]
async fn s3_supplement_stale_rejoin_into_running_cluster() {
    // A running cluster takes a stale node back: recovery plus the
    // stale-object purge make the rejoin safe, with an epoch increment.
    let mut members = three_node_cluster().await;
    let mut node4 = new_member(make_node(4, 3)).await;
    commit_join(&mut members, &mut node4).await;
    members.push(node4);

    let node4 = commit_leave(&mut members, 3).await;
    let mut node4 = restart_member(node4).await;

    let result = commit_join(&mut members, &mut node4).await;
    assert_eq!(result, flockd::cluster::JoinResult::Success);
    members.push(node4);

    for member in &mut members {
        assert_eq!(member.engine.status(), ClusterStatus::Ok);
        assert_eq!(member.engine.epoch(), 4);
    }
}

#[tokio::test]
async fn s4_majority_loss_aborts() {
    let mut members = three_node_cluster().await;
    let mut node4 = new_member(make_node(4, 3)).await;
    commit_join(&mut members, &mut node4).await;
    members.push(node4);

    // A partition isolates nodes 1 and 2 from nodes 3 and 4: each
    // survivor sees the far side leave, and its reachability probe over
    // the pre-leave membership (4 nodes, majority 3) finds only 2 alive.
    let survivor = &mut members[0];
    survivor.engine.handle_leave_cb(
        make_node(3, 2),
        sorted_nodes(&[(1, 0), (2, 1), (4, 3)]),
    );

    let work = survivor.engine.pump().unwrap();
    match &work {
        PhaseWork::ProbeMajority { members } => assert_eq!(members.len(), 4),
        other => panic!("expected ProbeMajority, got {:?}", other),
    }
    survivor
        .engine
        .complete(PhaseOutcome::Majority { alive: false })
        .await
        .unwrap();

    assert!(matches!(
        survivor.engine.take_action(),
        Some(CtrlAction::Abort(_))
    ));
    // The divergent membership change was never applied.
    assert_eq!(survivor.engine.nodes().len(), 4);
}

#[tokio::test]
async fn s5_halt_then_heal() {
    let mut members = three_node_cluster().await;

    // Losing zone 2 drops redundancy below the configured 3 copies.
    let node3 = commit_leave(&mut members, 2).await;
    for member in &mut members {
        assert_eq!(member.engine.status(), ClusterStatus::Halt);
        assert_eq!(member.engine.epoch(), 2);
        assert_eq!(member.engine.snapshot().nr_zones(), 2);
        assert!(member.recovery_epochs().contains(&2));
    }

    // A compatible node restores the zone count; the join increments the
    // epoch and the cluster resumes writes.
    let mut node3 = restart_member(node3).await;
    let result = commit_join(&mut members, &mut node3).await;
    assert_eq!(result, flockd::cluster::JoinResult::Success);
    members.push(node3);

    for member in &mut members {
        assert_eq!(member.engine.status(), ClusterStatus::Ok);
        assert_eq!(member.engine.epoch(), 3);
        assert_eq!(member.engine.snapshot().nr_zones(), 3);
        assert!(member.engine.leave_list().is_empty());
        assert!(member.recovery_epochs().contains(&3));
    }
}

#[tokio::test]
async fn s6_mastership_transfer() {
    let nodes = sorted_nodes(&[(1, 0), (2, 1), (3, 2)]);

    // Two survivors whose history stops at epoch 4, and a node whose
    // history reaches epoch 6.
    let mut survivors: Vec<Member> = Vec::new();
    for last in [1u8, 2] {
        let dir = TempDir::new().unwrap();
        {
            let mut store = EpochStore::open(dir.path()).await.unwrap();
            for epoch in 1..=4u32 {
                store.append(epoch, CTIME, nodes.clone()).await.unwrap();
            }
            let mut cinfo = flock_proto::node::ClusterInfo::default();
            cinfo.ctime = CTIME;
            cinfo.epoch = 4;
            config::save_config(dir.path(), &cinfo).await.unwrap();
        }
        let mut member = boot_member(make_node(last, (last - 1) as u32), dir).await;
        let result = commit_join(&mut survivors, &mut member).await;
        assert_eq!(result, flockd::cluster::JoinResult::Success);
        survivors.push(member);
    }
    for member in &survivors {
        assert_eq!(member.engine.status(), ClusterStatus::WaitForJoin);
        assert_eq!(member.engine.epoch(), 4);
    }

    let ahead_dir = TempDir::new().unwrap();
    {
        let mut store = EpochStore::open(ahead_dir.path()).await.unwrap();
        for epoch in 1..=6u32 {
            store.append(epoch, CTIME, nodes.clone()).await.unwrap();
        }
        let mut cinfo = flock_proto::node::ClusterInfo::default();
        cinfo.ctime = CTIME;
        cinfo.epoch = 6;
        config::save_config(ahead_dir.path(), &cinfo).await.unwrap();
    }
    let mut ahead = boot_member(make_node(3, 2), ahead_dir).await;

    let result = commit_join(&mut survivors, &mut ahead).await;
    assert_eq!(result, flockd::cluster::JoinResult::MasterTransfer);

    // The joiner identifies itself as the authoritative master: it
    // adopts its own higher epoch and, with every member of its latest
    // log accounted for, reaches Ok with an empty leave list.
    assert!(ahead.engine.join_finished());
    assert_eq!(ahead.engine.epoch(), 6);
    assert_eq!(ahead.engine.status(), ClusterStatus::Ok);
    assert!(ahead.engine.leave_list().is_empty());
}

#[tokio::test]
async fn reconstitution_after_failed_join_accounts_missing_node() {
    // Three members committed at epoch 2; nodes 1 and 2 restart, node 3
    // comes back with a forged history and is refused. The refusal makes
    // it permanently gone, which is exactly what the survivors needed to
    // reconstitute.
    let nodes = sorted_nodes(&[(1, 0), (2, 1), (3, 2)]);
    let mut survivors: Vec<Member> = Vec::new();
    for last in [1u8, 2] {
        let dir = TempDir::new().unwrap();
        {
            let mut store = EpochStore::open(dir.path()).await.unwrap();
            store.append(1, CTIME, nodes.clone()).await.unwrap();
            store.append(2, CTIME, nodes.clone()).await.unwrap();
            let mut cinfo = flock_proto::node::ClusterInfo::default();
            cinfo.ctime = CTIME;
            cinfo.epoch = 2;
            config::save_config(dir.path(), &cinfo).await.unwrap();
        }
        let mut member = boot_member(make_node(last, (last - 1) as u32), dir).await;
        commit_join(&mut survivors, &mut member).await;
        survivors.push(member);
    }

    let node3 = make_node(3, 2);
    let mut jm = JoinMessage::new(FLOCK_PROTO_VER);
    jm.ctime = CTIME;
    jm.epoch = 2;
    jm.nodes = sorted_nodes(&[(3, 2), (9, 9)]); // not the committed history
    let payload = jm.encode().unwrap();

    let reply = survivors[0].engine.check_join(&node3, &payload).await;
    assert_eq!(reply.result, flockd::cluster::JoinResult::Fail);
    let back = JoinMessage::decode(&reply.payload).unwrap();
    assert_eq!(back.result, FlockError::InvalidEpoch.to_code());

    let committed: Vec<Node> = survivors.iter().map(|m| m.node.clone()).collect();
    for member in survivors.iter_mut() {
        member
            .engine
            .handle_join_cb(node3.clone(), committed.clone(), reply.result, &reply.payload)
            .await;
        drain(&mut member.engine).await;
    }

    for member in &survivors {
        // I4: the refused node was in no registry, and the transition to
        // Ok cleared the accounting.
        assert_eq!(member.engine.status(), ClusterStatus::Ok);
        assert!(member.engine.leave_list().is_empty());
        assert_eq!(member.engine.nodes().len(), 2);
    }
}

#[tokio::test]
async fn serializer_applies_events_in_input_order() {
    // One engine, four queued events: its own join, node 2's join, node
    // 2's leave, node 2's rejoin. Applied in input order the registry
    // ends with both nodes; any reordering loses node 2 or duplicates it.
    let mut member = new_member(make_node(1, 0)).await;
    let node2 = make_node(2, 1);

    let jm = JoinMessage::new(FLOCK_PROTO_VER).encode().unwrap();
    member
        .engine
        .handle_join_cb(
            member.node.clone(),
            vec![member.node.clone()],
            flockd::cluster::JoinResult::Success,
            &jm,
        )
        .await;
    member
        .engine
        .handle_join_cb(
            node2.clone(),
            vec![member.node.clone(), node2.clone()],
            flockd::cluster::JoinResult::Success,
            &jm,
        )
        .await;
    member
        .engine
        .handle_leave_cb(node2.clone(), vec![member.node.clone()]);
    member
        .engine
        .handle_join_cb(
            node2.clone(),
            vec![member.node.clone(), node2.clone()],
            flockd::cluster::JoinResult::Success,
            &jm,
        )
        .await;

    assert_eq!(member.engine.queued_events(), 4);
    drain(&mut member.engine).await;
    assert_eq!(member.engine.queued_events(), 0);
    assert_eq!(
        member.engine.nodes(),
        sorted_nodes(&[(1, 0), (2, 1)]).as_slice()
    );
}
