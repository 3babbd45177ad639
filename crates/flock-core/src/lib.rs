//! # flock-core
//!
//! Placement and network plumbing shared by the flock daemon and tools:
//! the immutable vnode snapshot (consistent-hash ring), the atomic handle
//! it is published through, and TCP connect/listen helpers.

pub mod net;
pub mod ring;

pub use ring::{SnapshotHandle, VnodeSnapshot};
