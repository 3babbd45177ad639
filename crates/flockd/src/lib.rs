//! # flockd
//!
//! The flock storage daemon's cluster membership and coordination core:
//! join admission, the serialized membership event pipeline, epoch
//! management, leave-list bookkeeping, vnode snapshot publication, and
//! cluster-wide blocked operations, all behind a pluggable group driver.

pub mod cluster;
pub mod config;
pub mod ctx;
pub mod group;
pub mod ops;
pub mod peer;
pub mod recovery;
pub mod store;
