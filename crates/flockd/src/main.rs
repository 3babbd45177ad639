//! flock storage daemon (flockd).
//!
//! Runs the membership core: joins the cluster through the configured
//! group driver, serializes membership events, serves the peer endpoint,
//! and kicks recovery on epoch changes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{error, info, warn};

use flock_core::ring::{SnapshotHandle, VnodeSnapshot};
use flock_proto::constants::FLOCK_LISTEN_PORT;
use flock_proto::node::{ClusterStatus, Node, NodeId};

use flockd::cluster::{local::LocalDriver, ClusterDriver};
use flockd::config::{self, EpochStore};
use flockd::ctx::{ClusterCtx, IoGate};
use flockd::group::{BlockWork, CtrlAction, GroupEngine, PhaseOutcome, PhaseWork};
use flockd::ops;
use flockd::peer::{self, PeerState};
use flockd::recovery::ChannelRecovery;
use flockd::store::PlainStore;

/// flock storage daemon
#[derive(Parser, Debug)]
#[command(name = "flockd", version, about = "flock storage daemon")]
struct Args {
    /// Data directory for cluster state
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = FLOCK_LISTEN_PORT)]
    port: u16,

    /// Fault zone ID (default: derived from the listen address)
    #[arg(short = 'z', long)]
    zone: Option<u32>,

    /// Number of virtual nodes
    #[arg(short = 'v', long, default_value_t = 128)]
    vnodes: u16,

    /// Gateway mode (route only, store no data)
    #[arg(short = 'g', long)]
    gateway: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Cluster driver to use ("local")
    #[arg(long, default_value = "local")]
    cluster_driver: String,
}

/// Derive a zone id from the node address when none was given, so nodes
/// on different hosts land in different failure domains by default.
fn default_zone(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from_le_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            u32::from_le_bytes([octets[12], octets[13], octets[14], octets[15]])
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("flockd v{} starting", env!("CARGO_PKG_VERSION"));

    let bind_addr: IpAddr = args
        .bind_addr
        .parse()
        .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let listen_addr = SocketAddr::new(bind_addr, args.port);

    let mut this_node = Node::new(NodeId::new(bind_addr, args.port));
    this_node.nr_vnodes = if args.gateway { 0 } else { args.vnodes };
    this_node.zone = args.zone.unwrap_or_else(|| default_zone(bind_addr));
    info!("node {} (zone {})", this_node, this_node.zone);

    if let Err(e) = tokio::fs::create_dir_all(&args.dir).await {
        error!("failed to create data directory {}: {}", args.dir.display(), e);
        std::process::exit(1);
    }

    // Build cluster context; a rejoining node restores its cached view.
    let mut ctx = ClusterCtx::new(this_node.clone(), args.dir.clone());
    match config::load_config(&args.dir).await {
        Ok(cinfo) => {
            info!("loaded existing config: epoch={}", cinfo.epoch);
            ctx.cinfo = cinfo;
        }
        Err(flock_proto::FlockError::NotFormatted) => {
            info!("no existing config, starting fresh");
        }
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    }

    let epochs = match EpochStore::open(&args.dir).await {
        Ok(store) => Arc::new(RwLock::new(store)),
        Err(e) => {
            error!("failed to open epoch log: {}", e);
            std::process::exit(1);
        }
    };

    let snapshot = SnapshotHandle::new(VnodeSnapshot::empty());
    let io_gate = IoGate::new();
    let shutdown = Arc::new(Notify::new());

    // Peer service: serves the VDI bitmap and epoch reads to other nodes.
    let peer_state = PeerState {
        vdi_inuse: ctx.vdi_inuse.clone(),
        epochs: epochs.clone(),
    };
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = peer::serve(listen_addr, peer_state, shutdown).await {
                error!("peer service failed: {}", e);
            }
        });
    }

    // Recovery worker: drains fire-and-forget epoch kicks.
    let (recovery, mut recovery_rx) = ChannelRecovery::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    epoch = recovery_rx.recv() => match epoch {
                        Some(epoch) => info!("recovery running toward epoch {}", epoch),
                        None => break,
                    },
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    let driver: Arc<dyn ClusterDriver> = match args.cluster_driver.as_str() {
        "local" => Arc::new(LocalDriver::new()),
        other => {
            warn!("unknown cluster driver '{}', falling back to 'local'", other);
            Arc::new(LocalDriver::new())
        }
    };

    let mut engine = GroupEngine::new(
        ctx,
        epochs,
        snapshot,
        io_gate.clone(),
        driver.clone(),
        Arc::new(PlainStore::new(&args.dir)),
        Arc::new(recovery),
    )
    .await;

    if let Err(e) = driver.init(&this_node).await {
        error!("cluster driver init failed: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = engine.join_request().await {
        error!("failed to join cluster: {}", e);
        std::process::exit(1);
    }

    info!("flockd ready on {} (driver={})", listen_addr, driver.name());

    event_loop(&mut engine, driver.clone(), io_gate).await;

    info!("flockd shutting down");
    shutdown.notify_waiters();
    engine.persist().await;
    info!("flockd stopped");
}

/// The main event loop: owns the engine, pumps the serializer, and acts
/// on terminal decisions.
async fn event_loop(engine: &mut GroupEngine, driver: Arc<dyn ClusterDriver>, io_gate: IoGate) {
    let (phase_tx, mut phase_rx) = mpsc::channel::<PhaseOutcome>(1);
    let mut leaving = false;

    loop {
        // Start the next event's phase A whenever the gate allows.
        while let Some(work) = engine.pump() {
            spawn_phase_a(work, phase_tx.clone());
        }

        if let Some(action) = engine.take_action() {
            match action {
                CtrlAction::Demote(reason) => {
                    error!("self-demotion: {}", reason);
                    let _ = driver.leave().await;
                    std::process::exit(1);
                }
                CtrlAction::Abort(reason) => {
                    error!("aborting: {}", reason);
                    std::process::abort();
                }
            }
        }

        let drained = engine.queued_events() == 0 && !engine.event_running();
        if drained && (engine.status() == ClusterStatus::Shutdown || leaving) {
            break;
        }

        tokio::select! {
            event = driver.recv_event() => {
                match event {
                    Ok(event) => {
                        if let Some(work) = engine.handle_event(event).await {
                            spawn_block_work(work, driver.clone());
                        }
                    }
                    Err(e) => {
                        info!("cluster event stream ended: {}", e);
                        break;
                    }
                }
            }
            Some(outcome) = phase_rx.recv() => {
                if let Err(e) = engine.complete(outcome).await {
                    error!("event application failed: {}", e);
                }
            }
            _ = io_gate.idle(), if engine.pump_blocked_on_io() => {}
            _ = tokio::signal::ctrl_c(), if !leaving => {
                info!("SIGINT received, leaving cluster");
                leaving = true;
                let _ = driver.leave().await;
            }
        }
    }
}

fn spawn_phase_a(work: PhaseWork, tx: mpsc::Sender<PhaseOutcome>) {
    tokio::spawn(async move {
        let outcome = match work {
            PhaseWork::FetchBitmaps {
                peers,
                one_is_enough,
            } => PhaseOutcome::Bitmap(peer::collect_vdi_bitmaps(&peers, one_is_enough).await),
            PhaseWork::ProbeMajority { members } => PhaseOutcome::Majority {
                alive: peer::check_majority(&members).await,
            },
            PhaseWork::Immediate => PhaseOutcome::Ready,
        };
        let _ = tx.send(outcome).await;
    });
}

/// Run a blocked op's pre-compute on the block pool, then release the
/// cluster-wide critical section with the stamped result.
fn spawn_block_work(work: BlockWork, driver: Arc<dyn ClusterDriver>) {
    tokio::spawn(async move {
        let mut msg = work.msg;
        msg.rsp.result = ops::process_work(&work.op, &work.input);
        if let Err(e) = driver.unblock(&msg.encode()).await {
            error!("unblock failed: {}", e);
        }
    });
}
