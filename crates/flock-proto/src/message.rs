//! Wire codecs for the payloads routed through the group driver.
//!
//! The driver treats both payloads as opaque bytes and must deliver them
//! bit-exact, so the layouts are hand-encoded little-endian rather than
//! left to a serialization framework:
//!
//! Join message:
//!
//! ```text
//! proto_ver:u8 | nr_copies:u8 | nr_nodes:u16 | nr_leave_nodes:u16 |
//! cluster_flags:u16 | cluster_status:u32 | epoch:u32 | ctime:u64 |
//! result:u32 | inc_epoch:u8 | store[STORE_LEN] |
//! node entries × max(nr_nodes, nr_leave_nodes)
//! ```
//!
//! `nr_nodes` and `nr_leave_nodes` alias the same trailing array; which one
//! is populated depends on the direction of the message and only one is
//! non-zero at a time.
//!
//! Cluster-op message: request header | response header | optional body of
//! `request.data_length` bytes.

use crate::constants::*;
use crate::error::FlockError;
use crate::node::{ClusterStatus, Node};

/// Join handshake payload, sent by a joiner with its claimed history and
/// returned by the admitting members with the cluster's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMessage {
    pub proto_ver: u8,
    pub nr_copies: u8,
    pub cluster_flags: u16,
    pub cluster_status: ClusterStatus,
    pub epoch: u32,
    pub ctime: u64,
    /// Admission result code; `FlockError::SUCCESS` or an error wire code.
    pub result: u32,
    /// Set by the admitting side when this join advances the epoch.
    pub inc_epoch: bool,
    /// Store backend name, at most `STORE_LEN` bytes.
    pub store: String,
    /// Claimed prior membership (joiner → cluster direction).
    pub nodes: Vec<Node>,
    /// Known-departed members (cluster → joiner direction).
    pub leave_nodes: Vec<Node>,
}

impl JoinMessage {
    /// A fresh joiner's message: no claimed history.
    pub fn new(proto_ver: u8) -> Self {
        Self {
            proto_ver,
            nr_copies: 0,
            cluster_flags: 0,
            cluster_status: ClusterStatus::WaitForFormat,
            epoch: 0,
            ctime: 0,
            result: FlockError::SUCCESS,
            inc_epoch: false,
            store: String::new(),
            nodes: Vec::new(),
            leave_nodes: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FlockError> {
        if !self.nodes.is_empty() && !self.leave_nodes.is_empty() {
            return Err(FlockError::InvalidParms);
        }
        if self.store.len() > STORE_LEN {
            return Err(FlockError::InvalidParms);
        }
        let entries = if self.nodes.is_empty() {
            &self.leave_nodes
        } else {
            &self.nodes
        };
        if entries.len() > FLOCK_MAX_NODES {
            return Err(FlockError::InvalidParms);
        }

        let mut out = Vec::with_capacity(JOIN_MSG_HDR_LEN + entries.len() * NODE_WIRE_LEN);
        out.push(self.proto_ver);
        out.push(self.nr_copies);
        out.extend_from_slice(&(self.nodes.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.leave_nodes.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.cluster_flags.to_le_bytes());
        out.extend_from_slice(&self.cluster_status.to_wire().to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.result.to_le_bytes());
        out.push(self.inc_epoch as u8);

        let mut store = [0u8; STORE_LEN];
        store[..self.store.len()].copy_from_slice(self.store.as_bytes());
        out.extend_from_slice(&store);

        for node in entries {
            node.encode_wire(&mut out);
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FlockError> {
        if buf.len() < JOIN_MSG_HDR_LEN {
            return Err(FlockError::InvalidParms);
        }
        let proto_ver = buf[0];
        let nr_copies = buf[1];
        let nr_nodes = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let nr_leave_nodes = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let cluster_flags = u16::from_le_bytes([buf[6], buf[7]]);
        let cluster_status =
            ClusterStatus::from_wire(u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]))?;
        let epoch = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let ctime = u64::from_le_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);
        let result = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        let inc_epoch = buf[28] != 0;

        let store_raw = &buf[29..29 + STORE_LEN];
        let store_len = store_raw.iter().position(|&b| b == 0).unwrap_or(STORE_LEN);
        let store = std::str::from_utf8(&store_raw[..store_len])
            .map_err(|_| FlockError::InvalidParms)?
            .to_string();

        let nr_entries = nr_nodes.max(nr_leave_nodes);
        let need = JOIN_MSG_HDR_LEN + nr_entries * NODE_WIRE_LEN;
        if buf.len() < need {
            return Err(FlockError::InvalidParms);
        }
        let mut entries = Vec::with_capacity(nr_entries);
        for i in 0..nr_entries {
            let off = JOIN_MSG_HDR_LEN + i * NODE_WIRE_LEN;
            entries.push(Node::decode_wire(&buf[off..off + NODE_WIRE_LEN])?);
        }

        let (nodes, leave_nodes) = if nr_nodes > 0 {
            (entries, Vec::new())
        } else {
            (Vec::new(), entries)
        };

        Ok(Self {
            proto_ver,
            nr_copies,
            cluster_flags,
            cluster_status,
            epoch,
            ctime,
            result,
            inc_epoch,
            store,
            nodes,
            leave_nodes,
        })
    }
}

/// Cluster-op request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRequest {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
}

impl OpRequest {
    pub fn new(opcode: u8, epoch: u32, id: u32) -> Self {
        Self {
            proto_ver: FLOCK_PROTO_VER,
            opcode,
            flags: 0,
            epoch,
            id,
            data_length: 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.proto_ver);
        out.push(self.opcode);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.data_length.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, FlockError> {
        if buf.len() < OP_REQ_LEN {
            return Err(FlockError::InvalidParms);
        }
        Ok(Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            epoch: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            id: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_length: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Cluster-op response header; mirrors the request plus the result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpResponse {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub result: u32,
}

impl OpResponse {
    pub fn from_request(req: &OpRequest) -> Self {
        Self {
            proto_ver: req.proto_ver,
            opcode: req.opcode,
            flags: req.flags,
            epoch: req.epoch,
            id: req.id,
            data_length: 0,
            result: FlockError::SUCCESS,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.proto_ver);
        out.push(self.opcode);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.data_length.to_le_bytes());
        out.extend_from_slice(&self.result.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, FlockError> {
        if buf.len() < OP_RSP_LEN {
            return Err(FlockError::InvalidParms);
        }
        Ok(Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            epoch: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            id: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_length: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            result: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

/// A cluster-wide operation in flight: the originator's request, the
/// response filled in as the op progresses, and the optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOpMessage {
    pub req: OpRequest,
    pub rsp: OpResponse,
    pub data: Vec<u8>,
}

impl ClusterOpMessage {
    /// Package a request with an optional body. The body is carried only
    /// when the op has a main-processing step on every node.
    pub fn new(mut req: OpRequest, data: Vec<u8>) -> Self {
        req.data_length = data.len() as u32;
        let rsp = OpResponse::from_request(&req);
        Self { req, rsp, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(OP_REQ_LEN + OP_RSP_LEN + self.data.len());
        self.req.encode(&mut out);
        self.rsp.encode(&mut out);
        out.extend_from_slice(&self.data[..self.req.data_length as usize]);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FlockError> {
        let req = OpRequest::decode(buf)?;
        let rsp = OpResponse::decode(&buf[OP_REQ_LEN..])?;
        let body_off = OP_REQ_LEN + OP_RSP_LEN;
        let body_len = req.data_length as usize;
        if buf.len() < body_off + body_len {
            return Err(FlockError::InvalidParms);
        }
        let data = buf[body_off..body_off + body_len].to_vec();
        Ok(Self { req, rsp, data })
    }
}
