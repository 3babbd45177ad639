/// Protocol and system constants for the flock cluster.

/// Internal daemon-to-daemon protocol version.
pub const FLOCK_PROTO_VER: u8 = 0x01;

/// Default listen port for the peer service.
pub const FLOCK_LISTEN_PORT: u16 = 7400;

/// Default number of replica copies.
pub const FLOCK_DEFAULT_COPIES: u8 = 3;
/// Maximum supported redundancy level.
pub const FLOCK_MAX_COPIES: u8 = 31;

/// Default virtual nodes per physical node.
pub const FLOCK_DEFAULT_VNODES: u16 = 128;
/// Maximum nodes in a cluster.
pub const FLOCK_MAX_NODES: usize = 6144;

/// Total number of VDI ids (2^24); the in-use bitmap carries one bit each.
pub const FLOCK_NR_VDIS: u32 = 1 << 24;

/// Fixed length of the store-backend name field in the join message.
pub const STORE_LEN: usize = 16;

/// Cluster flags carried in the join message.
///
/// STRICT: the cluster halts writes instead of degrading redundancy when
/// the number of zones drops below the configured copy count.
pub const FLOCK_CLUSTER_FLAG_STRICT: u16 = 0x0001;

/// Wire size of one node entry in the join message trailing array.
pub const NODE_WIRE_LEN: usize = 24;
/// Wire size of the fixed join message header.
pub const JOIN_MSG_HDR_LEN: usize = 29 + STORE_LEN;
/// Wire size of a cluster-op request header.
pub const OP_REQ_LEN: usize = 16;
/// Wire size of a cluster-op response header.
pub const OP_RSP_LEN: usize = 20;
