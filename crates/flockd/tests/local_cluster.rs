//! Single-node end-to-end flow through the local driver: join handshake,
//! format, a blocked operation, recovery toggles, and shutdown, with the
//! originator's responses delivered through the pending queue.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::time::timeout;

use flock_core::ring::{SnapshotHandle, VnodeSnapshot};
use flock_proto::error::FlockError;
use flock_proto::node::{ClusterStatus, Node, NodeId};

use flockd::cluster::{local::LocalDriver, ClusterDriver};
use flockd::config::EpochStore;
use flockd::ctx::{ClusterCtx, IoGate};
use flockd::group::{GroupEngine, PhaseOutcome, PhaseWork};
use flockd::ops::{self, ClusterOp};
use flockd::recovery::NullRecovery;
use flockd::store::NullStore;

const CTIME: u64 = 1_700_000_000;

struct Daemon {
    engine: GroupEngine,
    driver: Arc<LocalDriver>,
    _dir: TempDir,
}

async fn start_daemon() -> Daemon {
    let dir = TempDir::new().unwrap();
    let node = Node::new(NodeId::new("127.0.0.1".parse().unwrap(), 7400));
    let driver = Arc::new(LocalDriver::new());
    let ctx = ClusterCtx::new(node.clone(), dir.path().to_path_buf());
    let epochs = Arc::new(RwLock::new(EpochStore::open(dir.path()).await.unwrap()));
    let engine = GroupEngine::new(
        ctx,
        epochs,
        SnapshotHandle::new(VnodeSnapshot::empty()),
        IoGate::new(),
        driver.clone(),
        Arc::new(NullStore),
        Arc::new(NullRecovery),
    )
    .await;
    driver.init(&node).await.unwrap();
    Daemon {
        engine,
        driver,
        _dir: dir,
    }
}

/// Drive the daemon loop until the driver queue goes quiet.
async fn settle(daemon: &mut Daemon) {
    loop {
        match timeout(Duration::from_millis(200), daemon.driver.recv_event()).await {
            Ok(Ok(event)) => {
                if let Some(work) = daemon.engine.handle_event(event).await {
                    // Block pool: run the pre-compute, then release the
                    // critical section with the stamped result.
                    let mut msg = work.msg;
                    msg.rsp.result = ops::process_work(&work.op, &work.input);
                    daemon.driver.unblock(&msg.encode()).await.unwrap();
                }
            }
            _ => break,
        }
        while let Some(work) = daemon.engine.pump() {
            let outcome = match work {
                PhaseWork::Immediate => PhaseOutcome::Ready,
                PhaseWork::FetchBitmaps { .. } => PhaseOutcome::Bitmap(None),
                PhaseWork::ProbeMajority { .. } => PhaseOutcome::Majority { alive: true },
            };
            daemon.engine.complete(outcome).await.unwrap();
        }
    }
}

#[tokio::test]
async fn single_node_lifecycle() {
    let mut daemon = start_daemon().await;

    daemon.engine.join_request().await.unwrap();
    settle(&mut daemon).await;
    assert!(daemon.engine.join_finished());
    assert_eq!(daemon.engine.status(), ClusterStatus::WaitForFormat);
    assert_eq!(daemon.engine.nodes().len(), 1);

    // Format: a notify-direct cluster op.
    let rx = daemon
        .engine
        .submit(ClusterOp::Format {
            nr_copies: 1,
            flags: 0,
            store: "plain".into(),
            ctime: CTIME,
        })
        .await
        .unwrap();
    settle(&mut daemon).await;
    let (rsp, _) = rx.await.unwrap();
    assert_eq!(rsp.result, FlockError::SUCCESS);
    assert_eq!(daemon.engine.status(), ClusterStatus::Ok);
    assert_eq!(daemon.engine.epoch(), 1);

    // AlterCopy: goes through block() -> pre-compute -> unblock, and the
    // result comes back as this originator's ordered echo.
    let rx = daemon
        .engine
        .submit(ClusterOp::AlterCopy { nr_copies: 2 })
        .await
        .unwrap();
    settle(&mut daemon).await;
    let (rsp, _) = rx.await.unwrap();
    assert_eq!(rsp.result, FlockError::SUCCESS);
    assert_eq!(rsp.opcode, ClusterOp::AlterCopy { nr_copies: 2 }.opcode());
    assert_eq!(daemon.engine.configured_copies(), 2);
    assert_eq!(daemon.engine.pending_len(), 0);

    // Recovery toggles.
    let rx = daemon.engine.submit(ClusterOp::DisableRecovery).await.unwrap();
    settle(&mut daemon).await;
    rx.await.unwrap();
    assert!(daemon.engine.recovery_disabled());

    let rx = daemon.engine.submit(ClusterOp::EnableRecovery).await.unwrap();
    settle(&mut daemon).await;
    rx.await.unwrap();
    assert!(!daemon.engine.recovery_disabled());

    // Shutdown drains to the terminal state.
    let rx = daemon.engine.submit(ClusterOp::Shutdown).await.unwrap();
    settle(&mut daemon).await;
    let (rsp, _) = rx.await.unwrap();
    assert_eq!(rsp.result, FlockError::SUCCESS);
    assert_eq!(daemon.engine.status(), ClusterStatus::Shutdown);
}

#[tokio::test]
async fn blocked_op_rejects_invalid_copies() {
    let mut daemon = start_daemon().await;
    daemon.engine.join_request().await.unwrap();
    settle(&mut daemon).await;

    let rx = daemon
        .engine
        .submit(ClusterOp::Format {
            nr_copies: 1,
            flags: 0,
            store: "plain".into(),
            ctime: CTIME,
        })
        .await
        .unwrap();
    settle(&mut daemon).await;
    rx.await.unwrap();

    // The pre-compute refuses zero copies; the error code rides the
    // response header back to the originator and no state changes.
    let rx = daemon
        .engine
        .submit(ClusterOp::AlterCopy { nr_copies: 0 })
        .await
        .unwrap();
    settle(&mut daemon).await;
    let (rsp, _) = rx.await.unwrap();
    assert_eq!(rsp.result, FlockError::InvalidParms.to_code());
    assert_eq!(daemon.engine.configured_copies(), 1);
}
