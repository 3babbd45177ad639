//! # flock-proto
//!
//! Protocol types, constants, and codecs for the flock distributed
//! block-storage cluster.
//!
//! This crate defines node identity and ordering, cluster status and
//! cluster-wide metadata, the epoch log record, error codes with their
//! wire values, the FNV-1a placement hashes, and the bit-exact join and
//! cluster-operation message layouts exchanged through the group driver.

pub mod constants;
pub mod error;
pub mod hash;
pub mod message;
pub mod node;

// Re-export commonly used types at the crate root
pub use error::{FlockError, FlockResult};
pub use message::{ClusterOpMessage, JoinMessage, OpRequest, OpResponse};
pub use node::{ClusterInfo, ClusterStatus, EpochRecord, Node, NodeId};
