//! Errors surfaced to callers of the engine and the driver

use crate::target::TargetId;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    #[error("invalid target {spec:?}: {reason}")]
    InvalidTarget { spec: String, reason: String },
    #[error("no address found for {0}")]
    Unresolved(String),
    #[error("{0} is already being queried")]
    DuplicateTarget(SocketAddr),
    #[error("no active target {0}")]
    UnknownTarget(TargetId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            EngineError::UnknownProtocol("doom3".into()).to_string(),
            "unknown protocol \"doom3\""
        );
        let addr: SocketAddr = "10.0.0.1:27015".parse().unwrap();
        assert_eq!(
            EngineError::DuplicateTarget(addr).to_string(),
            "10.0.0.1:27015 is already being queried"
        );
        assert_eq!(EngineError::UnknownTarget(TargetId(7)).to_string(), "no active target #7");
    }
}
