/// Flock error types.
///
/// Error codes from the public protocol (0x00-0x1F) and the internal
/// daemon-to-daemon protocol (0x81-0x93) are represented as a single enum.
/// The numeric values are part of the wire format: the `result` field of
/// the join message and the cluster-op response carry them verbatim.

use serde::{Deserialize, Serialize};

/// Unified error type for all flock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum FlockError {
    #[error("unknown error")]
    Unknown,
    #[error("I/O error")]
    Eio,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    #[error("cluster is shutting down")]
    Shutdown,
    #[error("protocol version mismatch")]
    VerMismatch,
    #[error("waiting for format")]
    WaitForFormat,
    #[error("waiting for nodes to join")]
    WaitForJoin,
    #[error("join failed")]
    JoinFailed,
    #[error("cluster is halted")]
    Halt,

    // Internal errors (inter-daemon protocol)
    #[error("request has old epoch")]
    OldNodeVer,
    #[error("request has new epoch")]
    NewNodeVer,
    #[error("cluster not formatted")]
    NotFormatted,
    #[error("invalid creation time")]
    InvalidCtime,
    #[error("invalid epoch")]
    InvalidEpoch,
    #[error("network error between daemons")]
    NetworkError,
    #[error("no targeted store")]
    NoStore,
    #[error("cluster driver error")]
    ClusterError,
    #[error("target not found")]
    NotFound,
}

impl FlockError {
    /// Convert from a raw protocol error code. `0x00` is success and maps
    /// to `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None,
            0x03 => Some(Self::Eio),
            0x05 => Some(Self::InvalidParms),
            0x06 => Some(Self::SystemError),
            0x11 => Some(Self::Shutdown),
            0x14 => Some(Self::VerMismatch),
            0x16 => Some(Self::WaitForFormat),
            0x17 => Some(Self::WaitForJoin),
            0x18 => Some(Self::JoinFailed),
            0x19 => Some(Self::Halt),
            0x81 => Some(Self::OldNodeVer),
            0x82 => Some(Self::NewNodeVer),
            0x83 => Some(Self::NotFormatted),
            0x84 => Some(Self::InvalidCtime),
            0x85 => Some(Self::InvalidEpoch),
            0x86 => Some(Self::NetworkError),
            0x8A => Some(Self::NoStore),
            0x91 => Some(Self::ClusterError),
            0x93 => Some(Self::NotFound),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to the raw protocol error code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::Eio => 0x03,
            Self::InvalidParms => 0x05,
            Self::SystemError => 0x06,
            Self::Shutdown => 0x11,
            Self::VerMismatch => 0x14,
            Self::WaitForFormat => 0x16,
            Self::WaitForJoin => 0x17,
            Self::JoinFailed => 0x18,
            Self::Halt => 0x19,
            Self::OldNodeVer => 0x81,
            Self::NewNodeVer => 0x82,
            Self::NotFormatted => 0x83,
            Self::InvalidCtime => 0x84,
            Self::InvalidEpoch => 0x85,
            Self::NetworkError => 0x86,
            Self::NoStore => 0x8A,
            Self::ClusterError => 0x91,
            Self::NotFound => 0x93,
        }
    }

    /// Wire code for a successful result.
    pub const SUCCESS: u32 = 0x00;
}

/// Result type alias for flock operations.
pub type FlockResult<T> = Result<T, FlockError>;

impl From<std::io::Error> for FlockError {
    fn from(_: std::io::Error) -> Self {
        FlockError::Eio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        let all = [
            FlockError::Unknown,
            FlockError::Eio,
            FlockError::InvalidParms,
            FlockError::SystemError,
            FlockError::Shutdown,
            FlockError::VerMismatch,
            FlockError::WaitForFormat,
            FlockError::WaitForJoin,
            FlockError::JoinFailed,
            FlockError::Halt,
            FlockError::OldNodeVer,
            FlockError::NewNodeVer,
            FlockError::NotFormatted,
            FlockError::InvalidCtime,
            FlockError::InvalidEpoch,
            FlockError::NetworkError,
            FlockError::NoStore,
            FlockError::ClusterError,
            FlockError::NotFound,
        ];
        for e in all {
            assert_eq!(FlockError::from_code(e.to_code()), Some(e));
        }
    }

    #[test]
    fn test_success_is_not_an_error() {
        assert_eq!(FlockError::from_code(FlockError::SUCCESS), None);
    }

    #[test]
    fn test_admission_codes_are_internal() {
        // Admission rejections live in the internal code range.
        assert_eq!(FlockError::OldNodeVer.to_code(), 0x81);
        assert_eq!(FlockError::NewNodeVer.to_code(), 0x82);
        assert_eq!(FlockError::NotFormatted.to_code(), 0x83);
        assert_eq!(FlockError::InvalidCtime.to_code(), 0x84);
        assert_eq!(FlockError::InvalidEpoch.to_code(), 0x85);
    }
}
