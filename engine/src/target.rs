//! One server being queried, and how targets are named on the command line

use crate::config::QueryConfig;
use crate::error::EngineError;
use crate::state::QueryStateMachine;
use protocol::{
    codecs, FragmentReassembler, ProtocolCodec, QueryErrorKind, RequestParams, ServerResult,
    SessionState,
};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Engine-assigned handle for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TargetId(pub u32);

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    /// Replies come from the queried address only.
    Unicast,
    /// Replies from any address on the target's port spawn child targets.
    Broadcast,
}

/// Terminal state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Ok,
    /// The host refused the connection.
    Down,
    /// No usable reply before the budget ran out.
    Timeout,
    Error(QueryErrorKind),
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetStatus::Ok => write!(f, "ok"),
            TargetStatus::Down => write!(f, "down"),
            TargetStatus::Timeout => write!(f, "timeout"),
            TargetStatus::Error(kind) => write!(f, "error: {}", kind),
        }
    }
}

/// A target as written on the command line: `PROTOCOL:HOST[:PORT]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub protocol: &'static str,
    pub host: String,
    pub port: u16,
}

impl TargetSpec {
    /// Parses a spec, filling in the protocol's default port. IPv6 hosts
    /// need brackets when a port is given.
    pub fn parse(spec: &str) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidTarget {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (protocol, address) = spec
            .split_once(':')
            .ok_or_else(|| invalid("expected PROTOCOL:HOST[:PORT]"))?;
        let codec =
            codecs::lookup(protocol).ok_or_else(|| EngineError::UnknownProtocol(protocol.into()))?;

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '[' in host"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid("unexpected text after ']'")),
            }
        } else {
            match address.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (address, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid("bad port"))?,
            None => codec.default_port(),
        };

        Ok(Self {
            protocol: codec.id(),
            host: host.to_string(),
            port,
        })
    }
}

/// Everything the engine tracks for one server.
pub struct Target {
    pub id: TargetId,
    pub addr: SocketAddr,
    pub mode: TargetMode,
    /// Broadcast target this one was spawned from.
    pub parent: Option<TargetId>,
    pub(crate) codec: &'static dyn ProtocolCodec,
    pub(crate) config: QueryConfig,
    pub(crate) params: RequestParams,
    pub(crate) session: SessionState,
    pub(crate) fragments: FragmentReassembler,
    pub(crate) machine: QueryStateMachine,
    pub(crate) result: ServerResult,
    /// Addresses that already produced a child, for broadcast targets.
    pub(crate) responders: HashSet<SocketAddr>,
    pub(crate) last_error: Option<String>,
    pub(crate) send_errors: u32,
}

impl Target {
    pub(crate) fn new(
        id: TargetId,
        addr: SocketAddr,
        mode: TargetMode,
        codec: &'static dyn ProtocolCodec,
        config: &QueryConfig,
    ) -> Self {
        let mut session = SessionState::default();
        codec.init_session(&mut session);

        Self {
            id,
            addr,
            mode,
            parent: None,
            codec,
            config: config.clone(),
            params: config.request_params(),
            session,
            fragments: FragmentReassembler::new(),
            machine: QueryStateMachine::new(codec.capabilities(), config),
            result: ServerResult::new(),
            responders: HashSet::new(),
            last_error: None,
            send_errors: 0,
        }
    }

    /// Child for a host that answered a broadcast. It continues from the
    /// parent's protocol state, so its round trip is measured from the
    /// broadcast send.
    pub(crate) fn spawn_child(&self, id: TargetId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            mode: TargetMode::Unicast,
            parent: Some(self.id),
            codec: self.codec,
            config: self.config.clone(),
            params: self.params.clone(),
            session: self.session.clone(),
            fragments: FragmentReassembler::new(),
            machine: self.machine.clone(),
            result: ServerResult::new(),
            responders: HashSet::new(),
            last_error: None,
            send_errors: 0,
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.codec.id()
    }

    pub fn machine(&self) -> &QueryStateMachine {
        &self.machine
    }

    pub fn result(&self) -> &ServerResult {
        &self.result
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn send_errors(&self) -> u32 {
        self.send_errors
    }

    /// The server answered some phase beyond the challenge, or a codec
    /// recorded a fact about it.
    pub fn has_received(&self) -> bool {
        self.machine.answered_any() || !self.result.is_empty()
    }
}
