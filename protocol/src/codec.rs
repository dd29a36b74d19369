//! Contract every wire protocol implements
//!
//! A codec is a stateless pair of request builder and response parser. Anything
//! a codec learns about a particular server (challenge tokens, the split-packet
//! header layout, which datagrams of a multi-packet reply have arrived) lives in
//! that target's [`SessionState`], so one codec instance serves every target.
//!
//! Parsing never recurses into the engine. When a codec recognises a fragment
//! it hands it to [`ParseContext::ingest_fragment`]; a completed payload is
//! queued and fed back to the codec by the engine on its next turn.

use crate::model::{DedupPolicy, RuleInsert, ServerResult};
use crate::outcome::{CodecError, QueryOutcome};
use crate::reassembly::FragmentReassembler;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

/// One stage of a protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Challenge,
    Status,
    Rules,
    Players,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Challenge, Phase::Status, Phase::Rules, Phase::Players];

    const fn bit(self) -> u8 {
        match self {
            Phase::Challenge => 0b0001,
            Phase::Status => 0b0010,
            Phase::Rules => 0b0100,
            Phase::Players => 0b1000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Challenge => "challenge",
            Phase::Status => "status",
            Phase::Rules => "rules",
            Phase::Players => "players",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Small set of phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub const EMPTY: PhaseSet = PhaseSet(0);

    pub fn of(phases: &[Phase]) -> Self {
        phases.iter().fold(Self::EMPTY, |set, &p| set.with(p))
    }

    pub const fn with(self, phase: Phase) -> Self {
        PhaseSet(self.0 | phase.bit())
    }

    pub fn insert(&mut self, phase: Phase) {
        self.0 |= phase.bit();
    }

    pub fn remove(&mut self, phase: Phase) {
        self.0 &= !phase.bit();
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: PhaseSet) -> Self {
        PhaseSet(self.0 | other.0)
    }

    pub fn intersects(&self, other: PhaseSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Phase> {
        Phase::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

/// What a protocol can do and in which order it must be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Phases that may only be requested once a challenge round completed.
    pub challenge_gates: PhaseSet,
    /// Phases answered by the status exchange itself.
    pub status_includes: PhaseSet,
}

/// Caller-selected options a request is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub want_rules: bool,
    pub want_players: bool,
    pub rule_policy: DedupPolicy,
    /// Protocol-specific parameters such as `password`.
    pub extra: BTreeMap<String, String>,
}

impl RequestParams {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

/// Per-target protocol state learned during the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Token obtained in the challenge phase, echoed in later requests.
    pub challenge: Option<i32>,
    /// Client-chosen id some protocols echo back in every reply.
    pub session_id: u32,
    /// Protocol sub-version learned from the status reply.
    pub revision: Option<u8>,
    /// Bit `n` set when datagram `n` of a numbered multi-packet reply arrived.
    pub received_mask: u64,
    /// Number of the datagram flagged as the last one.
    pub final_index: Option<u8>,
    /// Next ordinal for players the server does not number itself.
    pub next_player: i32,
}

/// Mutable view of one target handed to a codec's parser.
pub struct ParseContext<'a> {
    pub result: &'a mut ServerResult,
    pub session: &'a mut SessionState,
    pub params: &'a RequestParams,
    fragments: &'a mut FragmentReassembler,
    completed: &'a mut Vec<Vec<u8>>,
    current: Option<Phase>,
    sealed: PhaseSet,
    answered: PhaseSet,
    resend: bool,
    error: Option<String>,
}

impl<'a> ParseContext<'a> {
    pub fn new(
        result: &'a mut ServerResult,
        session: &'a mut SessionState,
        params: &'a RequestParams,
        fragments: &'a mut FragmentReassembler,
        completed: &'a mut Vec<Vec<u8>>,
        current: Option<Phase>,
        sealed: PhaseSet,
    ) -> Self {
        Self {
            result,
            session,
            params,
            fragments,
            completed,
            current,
            sealed,
            answered: PhaseSet::EMPTY,
            resend: false,
            error: None,
        }
    }

    /// Phase whose request is currently outstanding.
    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    /// Checks that a reply for `phase` is still welcome.
    pub fn accept(&self, phase: Phase) -> Result<(), CodecError> {
        if self.sealed.contains(phase) {
            return Err(CodecError::Unexpected(phase.name()));
        }
        Ok(())
    }

    /// Records that this payload answered `phase`.
    pub fn answer(&mut self, phase: Phase) {
        self.answered.insert(phase);
    }

    pub fn answered(&self) -> PhaseSet {
        self.answered
    }

    /// Buffers a fragment. A completed payload is queued for a later parse,
    /// so this always reports [`QueryOutcome::InProgress`].
    pub fn ingest_fragment(
        &mut self,
        series_id: u32,
        index: usize,
        count: usize,
        payload: &[u8],
    ) -> QueryOutcome {
        if let Some(buf) = self.fragments.ingest(series_id, index, count, payload) {
            debug!("Series {:#010x} complete, {} bytes", series_id, buf.len());
            self.completed.push(buf);
        }
        QueryOutcome::InProgress
    }

    /// Asks for the current phase to be sent again right away, without
    /// spending retry budget.
    pub fn request_resend(&mut self) {
        self.resend = true;
    }

    pub fn resend_requested(&self) -> bool {
        self.resend
    }

    /// Adds a rule using the caller's dedup policy.
    pub fn add_rule(&mut self, name: &str, value: &str) -> Result<RuleInsert, CodecError> {
        self.result.add_rule(name, value, self.params.rule_policy)
    }

    /// Converts a codec error into its outcome, keeping the message for
    /// diagnostics.
    pub fn fail(&mut self, err: CodecError) -> QueryOutcome {
        let outcome = QueryOutcome::from(&err);
        self.error = Some(err.to_string());
        outcome
    }

    /// Message of the last error passed to [`ParseContext::fail`].
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// A pluggable wire protocol.
pub trait ProtocolCodec: Send + Sync {
    /// Registry key, e.g. `a2s`.
    fn id(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn default_port(&self) -> u16;

    fn capabilities(&self) -> Capabilities;

    /// Prepares per-target state before the first request is built.
    fn init_session(&self, _session: &mut SessionState) {}

    /// Builds the outbound datagram for `phase`. Never performs I/O.
    fn build_request(
        &self,
        phase: Phase,
        params: &RequestParams,
        session: &SessionState,
    ) -> Result<Vec<u8>, CodecError>;

    /// Parses one payload into the target's result. Must not panic on any
    /// input.
    fn parse_response(&self, raw: &[u8], ctx: &mut ParseContext<'_>) -> QueryOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_set_operations() {
        let mut set = PhaseSet::of(&[Phase::Status, Phase::Players]);
        assert!(set.contains(Phase::Status));
        assert!(!set.contains(Phase::Rules));

        set.insert(Phase::Rules);
        set.remove(Phase::Status);
        let phases: Vec<Phase> = set.iter().collect();
        assert_eq!(phases, vec![Phase::Rules, Phase::Players]);

        assert!(set.intersects(PhaseSet::EMPTY.with(Phase::Players)));
        assert!(!set.intersects(PhaseSet::EMPTY.with(Phase::Challenge)));
        assert!(PhaseSet::EMPTY.is_empty());
    }

    #[test]
    fn test_context_rejects_sealed_phase() {
        let mut result = ServerResult::new();
        let mut session = SessionState::default();
        let params = RequestParams::default();
        let mut fragments = FragmentReassembler::new();
        let mut completed = Vec::new();
        let sealed = PhaseSet::EMPTY.with(Phase::Status);

        let ctx = ParseContext::new(
            &mut result,
            &mut session,
            &params,
            &mut fragments,
            &mut completed,
            Some(Phase::Rules),
            sealed,
        );

        assert!(ctx.accept(Phase::Rules).is_ok());
        assert!(matches!(
            ctx.accept(Phase::Status),
            Err(CodecError::Unexpected("status"))
        ));
    }

    #[test]
    fn test_context_queues_completed_fragments() {
        let mut result = ServerResult::new();
        let mut session = SessionState::default();
        let params = RequestParams::default();
        let mut fragments = FragmentReassembler::new();
        let mut completed = Vec::new();

        {
            let mut ctx = ParseContext::new(
                &mut result,
                &mut session,
                &params,
                &mut fragments,
                &mut completed,
                None,
                PhaseSet::EMPTY,
            );
            assert_eq!(ctx.ingest_fragment(1, 1, 2, b"lo"), QueryOutcome::InProgress);
            assert_eq!(ctx.ingest_fragment(1, 0, 2, b"hel"), QueryOutcome::InProgress);
        }

        assert_eq!(completed, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_context_fail_keeps_message() {
        let mut result = ServerResult::new();
        let mut session = SessionState::default();
        let params = RequestParams::default();
        let mut fragments = FragmentReassembler::new();
        let mut completed = Vec::new();
        let mut ctx = ParseContext::new(
            &mut result,
            &mut session,
            &params,
            &mut fragments,
            &mut completed,
            None,
            PhaseSet::EMPTY,
        );

        let outcome = ctx.fail(CodecError::UnknownType(0x99));
        assert_eq!(
            outcome,
            QueryOutcome::Error(crate::outcome::QueryErrorKind::ProtocolError)
        );
        assert_eq!(ctx.error(), Some("unknown packet type 0x99"));
    }
}
