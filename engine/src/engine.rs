//! Registry of in-flight targets and the sans-IO query loop
//!
//! The engine never touches a socket. A driver feeds it three kinds of
//! events and carries out what it asks for:
//! - [`QueryEngine::on_datagram`] when bytes arrive from some address
//! - [`QueryEngine::on_tick`] whenever [`QueryEngine::next_deadline`] passes
//! - [`QueryEngine::record_send_error`] when a queued datagram failed to go out
//!
//! Outbound datagrams are collected with [`QueryEngine::poll_transmit`] and
//! finished targets with [`QueryEngine::take_completed`]. Every entry point
//! takes the current instant explicitly so tests can drive time by hand.
//!
//! Payloads reassembled from fragments go through the same queue as
//! datagrams from the network and are parsed on a later turn of the drain
//! loop, so a chain of completions never grows the call stack.

use crate::config::QueryConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink, LogSink};
use crate::error::EngineError;
use crate::state::SendDecision;
use crate::target::{Target, TargetId, TargetMode, TargetStatus};
use log::{debug, info, warn};
use protocol::{codecs, ParseContext, Phase, PhaseSet, QueryErrorKind, QueryOutcome, ServerResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// A datagram the driver should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub target: TargetId,
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

/// Final report for one target, handed to formatters.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub id: TargetId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<TargetId>,
    pub protocol: &'static str,
    pub address: SocketAddr,
    pub status: TargetStatus,
    /// Mean round trip in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_ms: Option<f64>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub server: ServerResult,
}

pub struct QueryEngine {
    /// Active targets indexed by their id
    targets: HashMap<TargetId, Target>,
    /// Unicast targets indexed by the address replies come from
    by_addr: HashMap<SocketAddr, TargetId>,
    next_id: u32,
    outbox: VecDeque<Transmit>,
    pending: VecDeque<(TargetId, Vec<u8>)>,
    completed: Vec<QueryReport>,
    sink: Box<dyn DiagnosticSink>,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::with_sink(Box::new(LogSink))
    }

    pub fn with_sink(sink: Box<dyn DiagnosticSink>) -> Self {
        Self {
            targets: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
            outbox: VecDeque::new(),
            pending: VecDeque::new(),
            completed: Vec::new(),
            sink,
        }
    }

    /// Starts querying `addr` with the codec registered as `protocol`. The
    /// first request is queued immediately.
    pub fn add_target(
        &mut self,
        protocol: &str,
        addr: SocketAddr,
        config: &QueryConfig,
        now: Instant,
    ) -> Result<TargetId, EngineError> {
        self.insert_target(protocol, addr, TargetMode::Unicast, config, now)
    }

    /// Like [`QueryEngine::add_target`], but any host answering on the same
    /// port becomes a target of its own. The broadcast target itself never
    /// produces a report.
    pub fn add_broadcast(
        &mut self,
        protocol: &str,
        addr: SocketAddr,
        config: &QueryConfig,
        now: Instant,
    ) -> Result<TargetId, EngineError> {
        self.insert_target(protocol, addr, TargetMode::Broadcast, config, now)
    }

    fn insert_target(
        &mut self,
        protocol: &str,
        addr: SocketAddr,
        mode: TargetMode,
        config: &QueryConfig,
        now: Instant,
    ) -> Result<TargetId, EngineError> {
        let codec =
            codecs::lookup(protocol).ok_or_else(|| EngineError::UnknownProtocol(protocol.into()))?;
        if mode == TargetMode::Unicast && self.by_addr.contains_key(&addr) {
            return Err(EngineError::DuplicateTarget(addr));
        }

        let id = self.allocate_id();
        let target = Target::new(id, addr, mode, codec, config);
        info!("Target {} added: {} {} ({:?})", id, codec.id(), addr, mode);

        if mode == TargetMode::Unicast {
            self.by_addr.insert(addr, id);
        }
        self.targets.insert(id, target);
        self.send_current(id, now);

        Ok(id)
    }

    fn allocate_id(&mut self) -> TargetId {
        let id = TargetId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Next datagram to send, if any.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    /// Routes a received datagram to its target and processes it along with
    /// anything it completes.
    pub fn on_datagram(&mut self, from: SocketAddr, payload: &[u8], now: Instant) {
        let Some(id) = self.route(from) else {
            debug!("Dropping {} bytes from unknown address {}", payload.len(), from);
            return;
        };
        self.pending.push_back((id, payload.to_vec()));
        self.drain(now);
    }

    /// Processes bytes known to belong to `target`, for transports where the
    /// sender address does not identify the target.
    pub fn deliver(
        &mut self,
        target: TargetId,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), EngineError> {
        if !self.targets.contains_key(&target) {
            return Err(EngineError::UnknownTarget(target));
        }
        self.pending.push_back((target, payload.to_vec()));
        self.drain(now);
        Ok(())
    }

    fn route(&mut self, from: SocketAddr) -> Option<TargetId> {
        if let Some(&id) = self.by_addr.get(&from) {
            return Some(id);
        }

        let parent = self
            .targets
            .values()
            .filter(|t| t.mode == TargetMode::Broadcast && t.addr.port() == from.port())
            .map(|t| t.id)
            .min()?;

        let target = self.targets.get_mut(&parent)?;
        if !target.responders.insert(from) {
            debug!("Already reported {} for broadcast {}", from, parent);
            return None;
        }

        let child_id = self.allocate_id();
        let child = self.targets.get(&parent)?.spawn_child(child_id, from);
        info!("Target {} spawned from broadcast {} for {}", child_id, parent, from);
        self.by_addr.insert(from, child_id);
        self.targets.insert(child_id, child);
        Some(child_id)
    }

    /// Drains the pending queue until it is empty.
    fn drain(&mut self, now: Instant) {
        while let Some((id, payload)) = self.pending.pop_front() {
            self.process(id, &payload, now);
        }
    }

    fn process(&mut self, id: TargetId, payload: &[u8], now: Instant) {
        let Some(target) = self.targets.get_mut(&id) else {
            debug!("Target {} already finished, dropping {} bytes", id, payload.len());
            return;
        };

        let current = target.machine.current_phase();
        let sealed = target.machine.sealed();
        let mut completed = Vec::new();

        let mut ctx = ParseContext::new(
            &mut target.result,
            &mut target.session,
            &target.params,
            &mut target.fragments,
            &mut completed,
            current,
            sealed,
        );
        let outcome = target.codec.parse_response(payload, &mut ctx);
        let answered = ctx.answered();
        let resend = ctx.resend_requested();
        let message = ctx.error().map(str::to_owned);

        for buf in completed {
            self.pending.push_back((id, buf));
        }

        debug!("Target {} parsed {} bytes: {:?}", id, payload.len(), outcome);

        match outcome {
            QueryOutcome::InProgress => {
                if resend {
                    self.resend_current(id, now);
                }
            }
            QueryOutcome::DoneAuto | QueryOutcome::DoneForce => {
                let force = outcome == QueryOutcome::DoneForce;
                let Some(target) = self.targets.get_mut(&id) else {
                    return;
                };
                let answered = match (answered.is_empty(), current) {
                    (true, Some(phase)) => PhaseSet::EMPTY.with(phase),
                    _ => answered,
                };
                target.machine.complete(answered, force, now);
                let next = target.machine.current_phase();

                if target.machine.is_finished() {
                    self.finalize(id, None);
                } else if next.is_some() && next != current {
                    self.send_current(id, now);
                }
            }
            QueryOutcome::Error(kind) => {
                let message = message.unwrap_or_else(|| kind.to_string());
                self.report(id, kind, &message);

                if kind.is_fatal() {
                    if let Some(target) = self.targets.get_mut(&id) {
                        target.last_error = Some(message);
                    }
                    self.finalize(id, Some(TargetStatus::Error(kind)));
                }
            }
        }
    }

    /// Sends the current phase, timing out phases whose budget is spent.
    fn send_current(&mut self, id: TargetId, now: Instant) {
        loop {
            let Some(target) = self.targets.get_mut(&id) else {
                return;
            };

            let phase = match target.machine.next_send() {
                SendDecision::Send(phase) => phase,
                SendDecision::Exhausted(phase) => {
                    debug!("Target {} timed out in {}", id, phase);
                    continue;
                }
                SendDecision::Finished => {
                    self.finalize(id, None);
                    return;
                }
            };

            match target
                .codec
                .build_request(phase, &target.params, &target.session)
            {
                Ok(payload) => {
                    target.machine.record_send(now);
                    debug!("Target {} sending {} ({} bytes)", id, phase, payload.len());
                    self.outbox.push_back(Transmit {
                        target: id,
                        addr: target.addr,
                        payload,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    self.report(id, err.kind(), &message);
                    if let Some(target) = self.targets.get_mut(&id) {
                        target.last_error = Some(message);
                    }
                    self.finalize(id, Some(TargetStatus::Error(err.kind())));
                }
            }
            return;
        }
    }

    /// Re-sends the current phase. The first resend of a phase is free; a
    /// server that keeps asking is charged like a timer retry.
    fn resend_current(&mut self, id: TargetId, now: Instant) {
        let Some(target) = self.targets.get_mut(&id) else {
            return;
        };
        let Some(phase) = target.machine.current_phase() else {
            return;
        };
        if !target.machine.free_resend_available() {
            debug!("Target {} already had a free resend of {}, charging budget", id, phase);
            self.send_current(id, now);
            return;
        }

        match target
            .codec
            .build_request(phase, &target.params, &target.session)
        {
            Ok(payload) => {
                target.machine.record_free_resend(now);
                debug!("Target {} re-sending {} with fresh challenge", id, phase);
                self.outbox.push_back(Transmit {
                    target: id,
                    addr: target.addr,
                    payload,
                });
            }
            Err(err) => warn!("Target {} could not rebuild {}: {}", id, phase, err),
        }
    }

    /// Retries overdue phases and finishes targets whose budget is spent.
    pub fn on_tick(&mut self, now: Instant) {
        let mut ids: Vec<TargetId> = self.targets.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let Some(target) = self.targets.get(&id) else {
                continue;
            };

            if target.machine.is_lingering() {
                if target.machine.linger_expired(now) {
                    if let Some(target) = self.targets.get_mut(&id) {
                        target.machine.stop_lingering();
                    }
                    self.finalize(id, None);
                }
            } else if target.machine.is_due(now) {
                self.send_current(id, now);
            }
        }
    }

    /// A queued datagram could not be sent. A refused connection marks the
    /// target down; anything else is left to the retry timer.
    pub fn record_send_error(&mut self, id: TargetId, err: &io::Error) {
        let Some(target) = self.targets.get_mut(&id) else {
            return;
        };

        target.send_errors += 1;
        warn!("Target {} send to {} failed: {}", id, target.addr, err);

        if err.kind() == io::ErrorKind::ConnectionRefused {
            target.last_error = Some(err.to_string());
            // A host that already answered is reported with what it gave
            let status = if target.has_received() {
                None
            } else {
                Some(TargetStatus::Down)
            };
            self.finalize(id, status);
        }
    }

    /// Earliest instant at which [`QueryEngine::on_tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.targets
            .values()
            .filter_map(|t| t.machine.next_deadline())
            .min()
    }

    /// No target is active and nothing is left to send.
    pub fn is_finished(&self) -> bool {
        self.targets.is_empty() && self.outbox.is_empty()
    }

    pub fn active_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(&id)
    }

    /// Reports of every target finished since the last call, in id order.
    pub fn take_completed(&mut self) -> Vec<QueryReport> {
        let mut reports = std::mem::take(&mut self.completed);
        reports.sort_by_key(|r| r.id);
        reports
    }

    fn report(&mut self, id: TargetId, kind: QueryErrorKind, message: &str) {
        let Some(target) = self.targets.get(&id) else {
            return;
        };

        if !target.config.show_errors {
            debug!("Target {}: {}: {}", id, kind, message);
            return;
        }

        self.sink.report(&Diagnostic {
            target: id,
            address: target.addr,
            protocol: target.protocol(),
            kind,
            message: message.to_string(),
        });
    }

    /// Removes a target and records its report. Without an explicit status
    /// the outcome follows from what arrived: any answered phase or recorded
    /// fact is `Ok` with the unanswered phases flagged missing, nothing at all
    /// is `Timeout`.
    fn finalize(&mut self, id: TargetId, status: Option<TargetStatus>) {
        let Some(mut target) = self.targets.remove(&id) else {
            return;
        };
        if self.by_addr.get(&target.addr) == Some(&id) {
            self.by_addr.remove(&target.addr);
        }
        self.pending.retain(|(pending, _)| *pending != id);
        target.fragments.clear();

        if target.mode == TargetMode::Broadcast && status.is_none() {
            info!(
                "Broadcast {} finished, {} hosts answered",
                id,
                target.responders.len()
            );
            return;
        }

        let status = status.unwrap_or(if target.has_received() {
            TargetStatus::Ok
        } else {
            TargetStatus::Timeout
        });

        let missing = target.machine.missing();
        target.result.missing_status = missing.contains(Phase::Status);
        target.result.missing_rules = missing.contains(Phase::Rules);
        target.result.missing_players = missing.contains(Phase::Players);

        info!("Target {} {} finished: {}", id, target.addr, status);

        self.completed.push(QueryReport {
            id,
            parent: target.parent,
            protocol: target.protocol(),
            address: target.addr,
            status,
            ping_ms: target.machine.ping().map(|p| p.as_secs_f64() * 1000.0),
            retries: target.machine.retry_count(),
            error: target.last_error.take(),
            server: target.result,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn server_addr() -> SocketAddr {
        "10.1.1.1:27015".parse().unwrap()
    }

    fn canonical_info() -> Vec<u8> {
        [
            &[0xFF, 0xFF, 0xFF, 0xFF, 0x49, 0x00][..],
            b"MyServer\0",
            b"de_dust\0",
            &[10, 16, 0x01, 0x64, 0x00],
        ]
        .concat()
    }

    fn drain_outbox(engine: &mut QueryEngine) -> Vec<Transmit> {
        std::iter::from_fn(|| engine.poll_transmit()).collect()
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<Diagnostic>>>);

    impl DiagnosticSink for SharedSink {
        fn report(&mut self, diagnostic: &Diagnostic) {
            self.0.lock().unwrap().push(diagnostic.clone());
        }
    }

    #[test]
    fn test_add_target_queues_first_request() {
        let mut engine = QueryEngine::new();
        let id = engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), Instant::now())
            .unwrap();

        let sent = drain_outbox(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, id);
        assert_eq!(sent[0].addr, server_addr());
        assert_eq!(&sent[0].payload[..5], &[0xFF, 0xFF, 0xFF, 0xFF, 0x54]);
        assert_eq!(engine.active_targets(), 1);
    }

    #[test]
    fn test_unknown_protocol_and_duplicates() {
        let mut engine = QueryEngine::new();
        let now = Instant::now();
        assert!(matches!(
            engine.add_target("doom3", server_addr(), &QueryConfig::new(), now),
            Err(EngineError::UnknownProtocol(_))
        ));

        engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), now)
            .unwrap();
        assert!(matches!(
            engine.add_target("q3", server_addr(), &QueryConfig::new(), now),
            Err(EngineError::DuplicateTarget(_))
        ));
    }

    #[test]
    fn test_status_reply_finishes_target() {
        let mut engine = QueryEngine::new();
        let start = Instant::now();
        engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), start)
            .unwrap();
        drain_outbox(&mut engine);

        engine.on_datagram(server_addr(), &canonical_info(), start + Duration::from_millis(25));

        assert!(engine.is_finished());
        let reports = engine.take_completed();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TargetStatus::Ok);
        assert_eq!(reports[0].server.name.as_deref(), Some("MyServer"));
        assert_approx_eq!(reports[0].ping_ms.unwrap(), 25.0, 0.001);
        assert_eq!(reports[0].retries, 0);
    }

    #[test]
    fn test_timeout_after_all_sends() {
        let mut engine = QueryEngine::new();
        let config = QueryConfig::new()
            .with_retries(2)
            .with_retry_interval(Duration::from_millis(100));
        let start = Instant::now();
        engine.add_target("q3", server_addr(), &config, start).unwrap();

        let mut sends = drain_outbox(&mut engine).len();
        let mut now = start;
        while !engine.is_finished() {
            now = engine.next_deadline().unwrap();
            engine.on_tick(now);
            sends += drain_outbox(&mut engine).len();
        }

        assert_eq!(sends, 3);
        assert_eq!(now, start + Duration::from_millis(300));
        let reports = engine.take_completed();
        assert_eq!(reports[0].status, TargetStatus::Timeout);
        assert_eq!(reports[0].ping_ms, None);
        assert!(reports[0].server.is_empty());
    }

    #[test]
    fn test_tick_before_deadline_does_nothing() {
        let mut engine = QueryEngine::new();
        let start = Instant::now();
        engine
            .add_target("q3", server_addr(), &QueryConfig::new(), start)
            .unwrap();
        drain_outbox(&mut engine);

        engine.on_tick(start + Duration::from_millis(499));
        assert!(engine.poll_transmit().is_none());
        engine.on_tick(start + Duration::from_millis(500));
        assert!(engine.poll_transmit().is_some());
    }

    #[test]
    fn test_malformed_reply_is_error_with_partial_result() {
        let sink = SharedSink::default();
        let mut engine = QueryEngine::with_sink(Box::new(sink.clone()));
        let config = QueryConfig::new().with_show_errors(true);
        engine.add_target("a2s", server_addr(), &config, Instant::now()).unwrap();

        let truncated = canonical_info();
        engine.on_datagram(server_addr(), &truncated[..12], Instant::now());

        let reports = engine.take_completed();
        assert_eq!(
            reports[0].status,
            TargetStatus::Error(QueryErrorKind::MalformedPacket)
        );
        assert!(reports[0].error.is_some());

        let diagnostics = sink.0.lock().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, QueryErrorKind::MalformedPacket);
    }

    #[test]
    fn test_errors_hidden_without_show_errors() {
        let sink = SharedSink::default();
        let mut engine = QueryEngine::with_sink(Box::new(sink.clone()));
        engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), Instant::now())
            .unwrap();

        engine.on_datagram(server_addr(), &[0xFF, 0xFF, 0xFF, 0xFF, 0x7A], Instant::now());

        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(
            engine.take_completed()[0].status,
            TargetStatus::Error(QueryErrorKind::ProtocolError)
        );
    }

    #[test]
    fn test_late_duplicate_is_ordering_error_and_ignored() {
        let sink = SharedSink::default();
        let mut engine = QueryEngine::with_sink(Box::new(sink.clone()));
        let config = QueryConfig::new().with_players(true).with_show_errors(true);
        let now = Instant::now();
        engine.add_target("a2s", server_addr(), &config, now).unwrap();

        // Challenge, then status
        engine.on_datagram(server_addr(), &[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 5, 0, 0, 0], now);
        engine.on_datagram(server_addr(), &canonical_info(), now);
        engine.on_datagram(server_addr(), &canonical_info(), now);

        assert_eq!(engine.active_targets(), 1);
        let diagnostics = sink.0.lock().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, QueryErrorKind::OrderingError);
    }

    #[test]
    fn test_connection_refused_marks_down() {
        let mut engine = QueryEngine::new();
        let id = engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), Instant::now())
            .unwrap();

        engine.record_send_error(id, &io::Error::new(io::ErrorKind::Other, "no buffer space"));
        assert_eq!(engine.target(id).unwrap().send_errors(), 1);

        engine.record_send_error(id, &io::Error::from(io::ErrorKind::ConnectionRefused));
        let reports = engine.take_completed();
        assert_eq!(reports[0].status, TargetStatus::Down);
    }

    #[test]
    fn test_refused_after_status_keeps_partial_result() {
        let mut engine = QueryEngine::new();
        let config = QueryConfig::new().with_rules(true);
        let now = Instant::now();
        let id = engine.add_target("a2s", server_addr(), &config, now).unwrap();
        engine.on_datagram(server_addr(), &[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 3, 0, 0, 0], now);
        engine.on_datagram(server_addr(), &canonical_info(), now);

        engine.record_send_error(id, &io::Error::from(io::ErrorKind::ConnectionRefused));

        let reports = engine.take_completed();
        assert_eq!(reports[0].status, TargetStatus::Ok);
        assert!(reports[0].server.missing_rules);
        assert!(!reports[0].server.missing_status);
        assert!(reports[0].error.is_some());
        assert_eq!(reports[0].server.name.as_deref(), Some("MyServer"));
    }

    #[test]
    fn test_deliver_by_id() {
        let mut engine = QueryEngine::new();
        let now = Instant::now();
        let id = engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), now)
            .unwrap();

        assert!(matches!(
            engine.deliver(TargetId(99), &canonical_info(), now),
            Err(EngineError::UnknownTarget(TargetId(99)))
        ));
        assert_eq!(engine.active_targets(), 1);

        drain_outbox(&mut engine);
        engine.deliver(id, &canonical_info(), now).unwrap();
        assert!(engine.is_finished());
        assert_eq!(engine.take_completed()[0].status, TargetStatus::Ok);
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let mut engine = QueryEngine::new();
        engine
            .add_target("a2s", server_addr(), &QueryConfig::new(), Instant::now())
            .unwrap();

        engine.on_datagram("10.9.9.9:27015".parse().unwrap(), &canonical_info(), Instant::now());
        assert_eq!(engine.active_targets(), 1);
        assert!(engine.take_completed().is_empty());
    }
}
