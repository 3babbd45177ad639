//! Local (single-node) cluster driver.
//!
//! Designed for development, testing, and single-node deployments. No
//! networking: events pass through an in-process tokio mpsc channel and
//! the node admits itself. The admission query still runs — the join
//! payload makes a round trip through [`ClusterEvent::CheckJoin`] exactly
//! as it would through a real driver — so the membership core sees the
//! same event sequence a multi-node driver produces.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use flock_proto::error::{FlockError, FlockResult};
use flock_proto::node::Node;

use super::{ClusterDriver, ClusterEvent, JoinResult};

/// Channel buffer size for the local event queue.
const EVENT_CHANNEL_SIZE: usize = 256;

struct LocalState {
    /// This node's identity, set during `init`.
    this_node: Option<Node>,
    /// Whether the node has joined.
    joined: bool,
    /// Whether a blocked operation currently holds the critical section.
    blocked: bool,
}

/// A single-node cluster driver delivering events via an in-process
/// channel. All operations complete immediately.
pub struct LocalDriver {
    state: RwLock<LocalState>,
    /// Sender half, used by driver methods to enqueue events.
    event_tx: mpsc::Sender<ClusterEvent>,
    /// Receiver half, consumed by `recv_event`.
    /// Wrapped in a Mutex because `mpsc::Receiver::recv` takes `&mut self`.
    event_rx: Arc<Mutex<mpsc::Receiver<ClusterEvent>>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            state: RwLock::new(LocalState {
                this_node: None,
                joined: false,
                blocked: false,
            }),
            event_tx: tx,
            event_rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Directly inject an event into the queue (useful for tests).
    pub async fn inject_event(&self, event: ClusterEvent) -> FlockResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| FlockError::ClusterError)
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    async fn init(&self, this_node: &Node) -> FlockResult<()> {
        let mut state = self.state.write().await;
        info!("local cluster driver: init node {}", this_node.nid);
        state.this_node = Some(this_node.clone());
        Ok(())
    }

    async fn join(&self, node: &Node, payload: &[u8]) -> FlockResult<()> {
        let mut state = self.state.write().await;
        if state.joined {
            debug!("local cluster driver: already joined, ignoring duplicate join");
            return Ok(());
        }
        state.joined = true;
        let node = node.clone();
        drop(state);

        info!("local cluster driver: node {} joining", node.nid);

        // Run the admission query against ourselves, then commit the join
        // with whatever verdict and payload the query produced.
        let (reply_tx, reply_rx) = oneshot::channel();
        self.event_tx
            .send(ClusterEvent::CheckJoin {
                joining: node.clone(),
                payload: payload.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| FlockError::ClusterError)?;

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let reply = match reply_rx.await {
                Ok(r) => r,
                Err(_) => {
                    warn!("local cluster driver: admission query dropped");
                    return;
                }
            };
            let _ = event_tx
                .send(ClusterEvent::Join {
                    joined: node.clone(),
                    members: vec![node],
                    result: reply.result,
                    payload: reply.payload,
                })
                .await;
        });

        Ok(())
    }

    async fn leave(&self) -> FlockResult<()> {
        let mut state = self.state.write().await;
        if !state.joined {
            return Err(FlockError::ClusterError);
        }
        let node = state.this_node.clone().ok_or(FlockError::ClusterError)?;
        state.joined = false;
        drop(state);

        info!("local cluster driver: node {} leaving", node.nid);

        self.event_tx
            .send(ClusterEvent::Leave {
                left: node,
                members: Vec::new(),
            })
            .await
            .map_err(|_| FlockError::ClusterError)?;

        Ok(())
    }

    async fn notify(&self, payload: &[u8]) -> FlockResult<()> {
        let state = self.state.read().await;
        if !state.joined {
            return Err(FlockError::ClusterError);
        }
        let sender = state.this_node.clone().ok_or(FlockError::ClusterError)?;
        drop(state);

        debug!("local cluster driver: notify ({} bytes)", payload.len());

        self.event_tx
            .send(ClusterEvent::Notify {
                sender,
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| FlockError::ClusterError)?;

        Ok(())
    }

    async fn block(&self) -> FlockResult<()> {
        let mut state = self.state.write().await;
        if !state.joined {
            return Err(FlockError::ClusterError);
        }
        if state.blocked {
            debug!("local cluster driver: already blocked");
            return Ok(());
        }
        state.blocked = true;
        drop(state);

        debug!("local cluster driver: block");

        // Single node: the critical section is immediately ours.
        self.event_tx
            .send(ClusterEvent::Block)
            .await
            .map_err(|_| FlockError::ClusterError)?;

        Ok(())
    }

    async fn unblock(&self, payload: &[u8]) -> FlockResult<()> {
        let mut state = self.state.write().await;
        if !state.joined {
            return Err(FlockError::ClusterError);
        }
        state.blocked = false;
        let sender = state.this_node.clone().ok_or(FlockError::ClusterError)?;
        drop(state);

        debug!("local cluster driver: unblock ({} bytes)", payload.len());

        // The unblock result comes back as a totally-ordered notify, the
        // same as it would from a real driver.
        self.event_tx
            .send(ClusterEvent::Notify {
                sender,
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| FlockError::ClusterError)?;

        Ok(())
    }

    async fn recv_event(&self) -> FlockResult<ClusterEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await.ok_or(FlockError::ClusterError)
    }
}
