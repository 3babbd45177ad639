/// Node and cluster types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::constants::*;
use crate::error::FlockError;

/// Network identity of a flock node. Two nodes are the same member iff
/// their address and port are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub addr: IpAddr,
    pub port: u16,
}

impl NodeId {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// The address as IPv6 octets (IPv4 addresses are v4-mapped), as laid
    /// out on the wire.
    pub fn addr_octets(&self) -> [u8; 16] {
        match self.addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: FLOCK_LISTEN_PORT,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    /// Stable identity order: address octets, then port. Every member
    /// keeps its node list sorted by this comparator so the hash ring is
    /// identical cluster-wide.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr_octets()
            .cmp(&other.addr_octets())
            .then(self.port.cmp(&other.port))
    }
}

/// A flock cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Network identity.
    pub nid: NodeId,
    /// Number of virtual nodes; 0 marks a pure gateway that stores no data.
    pub nr_vnodes: u16,
    /// Fault domain zone.
    pub zone: u32,
}

impl Node {
    pub fn new(nid: NodeId) -> Self {
        Self {
            nid,
            nr_vnodes: FLOCK_DEFAULT_VNODES,
            zone: 0,
        }
    }

    /// A gateway routes requests but owns no ring tokens.
    pub fn is_gateway(&self) -> bool {
        self.nr_vnodes == 0
    }

    /// Encode to the fixed 24-byte wire entry used by the join message.
    pub fn encode_wire(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nid.addr_octets());
        out.extend_from_slice(&self.nid.port.to_le_bytes());
        out.extend_from_slice(&self.nr_vnodes.to_le_bytes());
        out.extend_from_slice(&self.zone.to_le_bytes());
    }

    /// Decode a fixed 24-byte wire entry.
    pub fn decode_wire(buf: &[u8]) -> Result<Self, FlockError> {
        if buf.len() < NODE_WIRE_LEN {
            return Err(FlockError::InvalidParms);
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[0..16]);
        let v6 = Ipv6Addr::from(octets);
        let addr = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = u16::from_le_bytes([buf[16], buf[17]]);
        let nr_vnodes = u16::from_le_bytes([buf[18], buf[19]]);
        let zone = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        Ok(Self {
            nid: NodeId::new(addr, port),
            nr_vnodes,
            zone,
        })
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.nid.cmp(&other.nid)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (vnodes={}, zone={})",
            self.nid, self.nr_vnodes, self.zone
        )
    }
}

/// Cluster status, with the u32 wire encoding used in the join message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ClusterStatus {
    /// Quorum present, full redundancy reachable, writes allowed.
    Ok = 0x01,
    /// No epoch on disk; the cluster has never been formatted.
    WaitForFormat = 0x02,
    /// An epoch exists; waiting for enough prior members to reconstitute.
    WaitForJoin = 0x04,
    /// Terminal; drains outstanding work and refuses new events.
    Shutdown = 0x08,
    /// Too few zones for full redundancy; reads allowed, writes paused.
    Halt = 0x10,
}

impl ClusterStatus {
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(v: u32) -> Result<Self, FlockError> {
        match v {
            0x01 => Ok(Self::Ok),
            0x02 => Ok(Self::WaitForFormat),
            0x04 => Ok(Self::WaitForJoin),
            0x08 => Ok(Self::Shutdown),
            0x10 => Ok(Self::Halt),
            _ => Err(FlockError::InvalidParms),
        }
    }
}

/// Cluster-wide configuration and state, agreed between all members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Internal protocol version.
    pub proto_ver: u8,
    /// Current epoch number; 0 means never formatted.
    pub epoch: u32,
    /// Cluster creation time (seconds since the UNIX epoch).
    pub ctime: u64,
    /// Cluster flags (`FLOCK_CLUSTER_FLAG_*`).
    pub flags: u16,
    /// Configured number of copies.
    pub nr_copies: u8,
    /// Whether recovery is administratively disabled.
    pub disable_recovery: bool,
    /// Cluster status.
    pub status: ClusterStatus,
    /// Store backend name.
    pub default_store: String,
    /// Current member list, sorted by node identity.
    pub nodes: Vec<Node>,
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            proto_ver: FLOCK_PROTO_VER,
            epoch: 0,
            ctime: 0,
            flags: 0,
            nr_copies: FLOCK_DEFAULT_COPIES,
            disable_recovery: false,
            status: ClusterStatus::WaitForFormat,
            default_store: String::new(),
            nodes: Vec::new(),
        }
    }
}

/// One epoch log record: the membership committed at the transition into
/// `epoch`. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: u32,
    pub ctime: u64,
    /// Wall-clock write time, for operators only.
    pub time: u64,
    pub nodes: Vec<Node>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(addr: [u8; 4], port: u16) -> Node {
        let nid = NodeId::new(IpAddr::V4(Ipv4Addr::from(addr)), port);
        Node::new(nid)
    }

    #[test]
    fn test_node_order_by_addr_then_port() {
        let a = make_node([10, 0, 0, 1], 7400);
        let b = make_node([10, 0, 0, 1], 7401);
        let c = make_node([10, 0, 0, 2], 7000);
        let mut v = vec![c.clone(), b.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn test_node_wire_roundtrip() {
        let mut n = make_node([192, 168, 1, 7], 7400);
        n.nr_vnodes = 64;
        n.zone = 3;

        let mut buf = Vec::new();
        n.encode_wire(&mut buf);
        assert_eq!(buf.len(), NODE_WIRE_LEN);

        let back = Node::decode_wire(&buf).unwrap();
        assert_eq!(back, n);
    }

    #[test]
    fn test_node_wire_v6_roundtrip() {
        let nid = NodeId::new("fd00::17".parse().unwrap(), 7400);
        let n = Node::new(nid);
        let mut buf = Vec::new();
        n.encode_wire(&mut buf);
        let back = Node::decode_wire(&buf).unwrap();
        assert_eq!(back, n);
    }

    #[test]
    fn test_status_wire_roundtrip() {
        for s in [
            ClusterStatus::Ok,
            ClusterStatus::WaitForFormat,
            ClusterStatus::WaitForJoin,
            ClusterStatus::Shutdown,
            ClusterStatus::Halt,
        ] {
            assert_eq!(ClusterStatus::from_wire(s.to_wire()).unwrap(), s);
        }
        assert!(ClusterStatus::from_wire(0x40).is_err());
    }

    #[test]
    fn test_gateway_node() {
        let mut n = make_node([10, 0, 0, 9], 7400);
        n.nr_vnodes = 0;
        assert!(n.is_gateway());
    }
}
