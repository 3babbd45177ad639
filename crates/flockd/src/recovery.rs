//! Recovery-module seam.
//!
//! Object migration after an epoch change is owned by an external
//! recovery module; the membership core only kicks it. `start_recovery`
//! is fire-and-forget: the core never awaits completion, and a newer
//! epoch supersedes any run still in progress.

use tokio::sync::mpsc;
use tracing::{debug, info};

pub trait RecoveryDriver: Send + Sync {
    /// Kick recovery toward `epoch`.
    fn start_recovery(&self, epoch: u32);
}

/// Default driver: hands epochs to a background worker over an unbounded
/// channel so the caller never blocks.
pub struct ChannelRecovery {
    tx: mpsc::UnboundedSender<u32>,
}

impl ChannelRecovery {
    /// Create the driver and its worker-side receiver. The daemon spawns
    /// a task draining the receiver into the real recovery machinery.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RecoveryDriver for ChannelRecovery {
    fn start_recovery(&self, epoch: u32) {
        info!("recovery requested for epoch {}", epoch);
        // A closed channel means the daemon is tearing down; nothing to do.
        let _ = self.tx.send(epoch);
    }
}

/// Driver that drops every request; used before the store is formatted
/// and in tests that assert on recovery kicks via `ChannelRecovery`.
pub struct NullRecovery;

impl RecoveryDriver for NullRecovery {
    fn start_recovery(&self, epoch: u32) {
        debug!("recovery for epoch {} ignored (null driver)", epoch);
    }
}
