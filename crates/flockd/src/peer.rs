//! Daemon-to-daemon peer service.
//!
//! A minimal length-prefixed bincode endpoint serving the two requests
//! membership needs from other daemons: the VDI in-use bitmap (fetched
//! during the join handshake) and epoch log reads. Client object I/O does
//! not flow through here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use flock_core::net;
use flock_proto::error::{FlockError, FlockResult};
use flock_proto::node::Node;

use crate::config::EpochStore;
use crate::ctx::VdiBitmap;

/// Per-peer connect/read timeout.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on a peer frame; the VDI bitmap (2 MB) plus headroom.
const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Fetch the raw VDI in-use bitmap bytes.
    ReadVdis,
    /// Read the membership committed at `epoch`.
    GetEpoch { epoch: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    Vdis(Vec<u8>),
    Epoch(Vec<Node>),
    Error(FlockError),
}

/// Read-only view handed to the peer service.
#[derive(Clone)]
pub struct PeerState {
    pub vdi_inuse: VdiBitmap,
    pub epochs: Arc<RwLock<EpochStore>>,
}

async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    msg: &impl Serialize,
) -> FlockResult<()> {
    let encoded = bincode::serialize(msg).map_err(|_| FlockError::SystemError)?;
    if encoded.len() as u32 > MAX_FRAME_SIZE {
        return Err(FlockError::InvalidParms);
    }
    stream
        .write_u32(encoded.len() as u32)
        .await
        .map_err(|_| FlockError::NetworkError)?;
    stream
        .write_all(&encoded)
        .await
        .map_err(|_| FlockError::NetworkError)?;
    stream.flush().await.map_err(|_| FlockError::NetworkError)?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut (impl AsyncReadExt + Unpin),
) -> FlockResult<T> {
    let len = stream
        .read_u32()
        .await
        .map_err(|_| FlockError::NetworkError)?;
    if len > MAX_FRAME_SIZE {
        return Err(FlockError::InvalidParms);
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| FlockError::NetworkError)?;
    bincode::deserialize(&buf).map_err(|_| FlockError::InvalidParms)
}

/// Accept loop for the peer service.
pub async fn serve(addr: SocketAddr, state: PeerState, shutdown: Arc<Notify>) -> FlockResult<()> {
    let listener = net::create_listen_socket(addr).await?;
    info!("peer service listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("peer service shutting down");
                return Ok(());
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, remote)) => {
                        debug!("peer connection from {}", remote);
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_peer(stream, state).await {
                                debug!("peer {} disconnected: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("peer accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_peer(mut stream: TcpStream, state: PeerState) -> FlockResult<()> {
    loop {
        let request: PeerRequest = read_frame(&mut stream).await?;
        let response = match request {
            PeerRequest::ReadVdis => {
                let bitmap = state.vdi_inuse.read().await;
                PeerResponse::Vdis(bitmap.as_raw_slice().to_vec())
            }
            PeerRequest::GetEpoch { epoch } => {
                let store = state.epochs.read().await;
                let nodes = store.read(epoch);
                if nodes.is_empty() {
                    PeerResponse::Error(FlockError::NotFound)
                } else {
                    PeerResponse::Epoch(nodes)
                }
            }
        };
        write_frame(&mut stream, &response).await?;
    }
}

/// Fetch one peer's VDI bitmap.
pub async fn fetch_vdi_bitmap(addr: SocketAddr) -> FlockResult<Vec<u8>> {
    let mut stream = net::connect_to(addr, PEER_TIMEOUT).await?;
    write_frame(&mut stream, &PeerRequest::ReadVdis).await?;
    let response: PeerResponse = tokio::time::timeout(PEER_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| FlockError::NetworkError)??;
    match response {
        PeerResponse::Vdis(bytes) => Ok(bytes),
        PeerResponse::Error(e) => Err(e),
        _ => Err(FlockError::InvalidParms),
    }
}

/// Join phase A: fetch the VDI bitmap from every pre-existing member and
/// OR them together. Fetch failures are logged and skipped; the join goes
/// ahead without them. A fresh node needs only one copy.
pub async fn collect_vdi_bitmaps(peers: &[Node], one_is_enough: bool) -> Option<Vec<u8>> {
    let mut merged: Option<Vec<u8>> = None;

    for peer in peers {
        match fetch_vdi_bitmap(peer.nid.socket_addr()).await {
            Ok(bytes) => {
                match merged.as_mut() {
                    Some(acc) => {
                        for (a, b) in acc.iter_mut().zip(bytes.iter()) {
                            *a |= b;
                        }
                    }
                    None => merged = Some(bytes),
                }
                if one_is_enough {
                    break;
                }
            }
            Err(e) => {
                warn!("unable to get the VDI bitmap from {}: {}", peer.nid, e);
            }
        }
    }

    merged
}

/// OR a fetched raw bitmap into the local one.
pub async fn merge_vdi_bitmap(local: &VdiBitmap, raw: &[u8]) {
    let fetched: BitVec<u8, Msb0> = BitVec::from_slice(raw);
    let mut bitmap = local.write().await;
    let len = bitmap.len().min(fetched.len());
    for idx in fetched[..len].iter_ones() {
        bitmap.set(idx, true);
    }
}

/// Leave phase A: check whether the majority of members are still alive.
///
/// Counts peers that complete a TCP three-way handshake within the probe
/// timeout. Clusters below three nodes cannot distinguish partition from
/// failure, so they always pass.
pub async fn check_majority(members: &[Node]) -> bool {
    let nr_nodes = members.len();
    if nr_nodes < 3 {
        return true;
    }
    let nr_majority = nr_nodes / 2 + 1;

    let mut nr_reachable = 0;
    for member in members {
        if net::probe(member.nid.socket_addr(), PEER_TIMEOUT).await {
            nr_reachable += 1;
            if nr_reachable >= nr_majority {
                debug!("the majority of nodes are alive");
                return true;
            }
        }
    }
    error!(
        "the majority of nodes are not alive ({}/{} reachable, need {})",
        nr_reachable, nr_nodes, nr_majority
    );
    false
}
