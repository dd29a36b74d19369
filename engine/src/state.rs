//! Per-target phase sequencing, retry budgets and round-trip accounting
//!
//! The phase plan is fixed when the target is created, from what the caller
//! asked for and what the codec can do:
//!
//! - a challenge phase is planned only if a phase it gates is planned
//! - status is always planned
//! - rules and players get their own phase unless the status reply carries them
//!
//! Each planned phase owns a send budget of `retries + 1`. A send spends one
//! unit; asking to send with nothing left times the phase out instead. The
//! first resend requested by the codec itself (a fresh challenge token
//! arriving in the middle of a phase) is free; any further one is charged.

use crate::config::QueryConfig;
use log::debug;
use protocol::{Capabilities, Phase, PhaseSet};
use std::time::{Duration, Instant};

/// Where a single phase stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Not sent yet.
    Idle,
    /// Request sent, waiting for the reply.
    Waiting,
    /// Answered; further replies are still parsed.
    DoneAuto,
    /// Answered; further replies are ignored.
    DoneForce,
    /// Budget ran out without an answer.
    TimedOut,
    /// Never sent because the challenge it depends on timed out.
    Skipped,
}

impl PhaseStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, PhaseStatus::DoneAuto | PhaseStatus::DoneForce)
    }

    /// No further sends will happen for this phase.
    pub fn is_settled(&self) -> bool {
        !matches!(self, PhaseStatus::Idle | PhaseStatus::Waiting)
    }
}

/// Bookkeeping for one planned phase.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    pub phase: Phase,
    budget: u32,
    attempts: u32,
    first_sent: Option<Instant>,
    last_sent: Option<Instant>,
    free_resend_used: bool,
    status: PhaseStatus,
}

impl PhaseTracker {
    fn new(phase: Phase, budget: u32) -> Self {
        Self {
            phase,
            budget,
            attempts: 0,
            first_sent: None,
            last_sent: None,
            free_resend_used: false,
            status: PhaseStatus::Idle,
        }
    }

    /// Sends still allowed.
    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    pub fn first_sent(&self) -> Option<Instant> {
        self.first_sent
    }
}

/// What the caller should do for the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Build and transmit a request for this phase.
    Send(Phase),
    /// The phase just timed out; see [`QueryStateMachine::current_phase`]
    /// for what comes next.
    Exhausted(Phase),
    /// Every phase is settled.
    Finished,
}

#[derive(Debug, Clone)]
pub struct QueryStateMachine {
    plan: Vec<PhaseTracker>,
    current: usize,
    gated: PhaseSet,
    retry_interval: Duration,
    ping_total: Duration,
    ping_count: u32,
    linger_until: Option<Instant>,
}

impl QueryStateMachine {
    pub fn new(capabilities: Capabilities, config: &QueryConfig) -> Self {
        let mut wanted = PhaseSet::EMPTY;
        if config.want_rules {
            wanted.insert(Phase::Rules);
        }
        if config.want_players {
            wanted.insert(Phase::Players);
        }

        let mut separate = PhaseSet::EMPTY.with(Phase::Status);
        for phase in wanted.iter() {
            if !capabilities.status_includes.contains(phase) {
                separate.insert(phase);
            }
        }

        let mut phases = PhaseSet::EMPTY;
        if capabilities.challenge_gates.intersects(separate) {
            phases.insert(Phase::Challenge);
        }
        let phases = phases.union(separate);

        let budget = config.sends_per_phase();
        let plan = phases.iter().map(|p| PhaseTracker::new(p, budget)).collect();

        Self {
            plan,
            current: 0,
            gated: capabilities.challenge_gates,
            retry_interval: config.retry_interval,
            ping_total: Duration::ZERO,
            ping_count: 0,
            linger_until: None,
        }
    }

    pub fn phases(&self) -> &[PhaseTracker] {
        &self.plan
    }

    pub fn tracker(&self, phase: Phase) -> Option<&PhaseTracker> {
        self.plan.iter().find(|t| t.phase == phase)
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.plan.get(self.current).map(|t| t.phase)
    }

    /// Phases whose replies are no longer accepted.
    pub fn sealed(&self) -> PhaseSet {
        self.plan
            .iter()
            .filter(|t| t.status == PhaseStatus::DoneForce)
            .fold(PhaseSet::EMPTY, |set, t| set.with(t.phase))
    }

    /// Decides the next send for the current phase. With the budget spent the
    /// phase times out, and with it any phase a timed-out challenge gates.
    pub fn next_send(&mut self) -> SendDecision {
        let Some(tracker) = self.plan.get_mut(self.current) else {
            return SendDecision::Finished;
        };
        let phase = tracker.phase;

        if tracker.budget > 0 {
            return SendDecision::Send(phase);
        }

        debug!("Phase {} exhausted after {} attempts", phase, tracker.attempts);
        tracker.status = PhaseStatus::TimedOut;

        if phase == Phase::Challenge {
            for tracker in self.plan.iter_mut() {
                if self.gated.contains(tracker.phase) && !tracker.status.is_settled() {
                    tracker.status = PhaseStatus::Skipped;
                }
            }
        }

        self.advance();
        SendDecision::Exhausted(phase)
    }

    /// Records a transmitted request for the current phase.
    pub fn record_send(&mut self, now: Instant) {
        if let Some(tracker) = self.plan.get_mut(self.current) {
            tracker.budget = tracker.budget.saturating_sub(1);
            tracker.attempts += 1;
            tracker.first_sent.get_or_insert(now);
            tracker.last_sent = Some(now);
            tracker.status = PhaseStatus::Waiting;
        }
    }

    /// Whether the current phase still has its one budget-free resend.
    pub fn free_resend_available(&self) -> bool {
        self.plan
            .get(self.current)
            .is_some_and(|t| !t.free_resend_used)
    }

    /// Records a codec-requested resend. The budget is untouched and the
    /// original send time is kept for the round-trip figure. Only one such
    /// resend is allowed per phase.
    pub fn record_free_resend(&mut self, now: Instant) {
        if let Some(tracker) = self.plan.get_mut(self.current) {
            tracker.last_sent = Some(now);
            tracker.free_resend_used = true;
            tracker.status = PhaseStatus::Waiting;
        }
    }

    /// Marks `answered` phases complete, folds their round-trip time once,
    /// and moves to the first phase still open.
    pub fn complete(&mut self, answered: PhaseSet, force: bool, now: Instant) {
        let status = if force {
            PhaseStatus::DoneForce
        } else {
            PhaseStatus::DoneAuto
        };

        for tracker in self.plan.iter_mut() {
            if !answered.contains(tracker.phase) || tracker.status.is_done() {
                continue;
            }
            tracker.status = status;
            if let Some(sent) = tracker.first_sent {
                self.ping_total += now.saturating_duration_since(sent);
                self.ping_count += 1;
            }
        }

        self.advance();

        if self.current >= self.plan.len() {
            self.linger_until = if force {
                None
            } else {
                // Armed once; late packets never extend the window
                self.linger_until.or(Some(now + self.retry_interval))
            };
        }
    }

    fn advance(&mut self) {
        while self
            .plan
            .get(self.current)
            .is_some_and(|t| t.status.is_settled())
        {
            self.current += 1;
        }
    }

    /// The current phase has waited a full interval since its last send.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.plan.get(self.current) {
            Some(t) => match (t.status, t.last_sent) {
                (PhaseStatus::Waiting, Some(sent)) => now >= sent + self.retry_interval,
                (PhaseStatus::Idle, _) => true,
                _ => false,
            },
            None => false,
        }
    }

    /// Every phase is settled but late replies are still being collected.
    pub fn is_lingering(&self) -> bool {
        self.current >= self.plan.len() && self.linger_until.is_some()
    }

    pub fn linger_expired(&self, now: Instant) -> bool {
        self.linger_until.is_some_and(|until| now >= until)
    }

    pub fn stop_lingering(&mut self) {
        self.linger_until = None;
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.plan.len() && self.linger_until.is_none()
    }

    /// Earliest instant at which [`QueryStateMachine::is_due`] or the linger
    /// window needs attention.
    pub fn next_deadline(&self) -> Option<Instant> {
        if let Some(until) = self.linger_until {
            return Some(until);
        }
        let tracker = self.plan.get(self.current)?;
        match tracker.status {
            PhaseStatus::Waiting => tracker.last_sent.map(|sent| sent + self.retry_interval),
            _ => None,
        }
    }

    pub fn status_done(&self) -> bool {
        self.tracker(Phase::Status)
            .is_some_and(|t| t.status.is_done())
    }

    /// Some phase other than the challenge was answered.
    pub fn answered_any(&self) -> bool {
        self.plan
            .iter()
            .any(|t| t.phase != Phase::Challenge && t.status.is_done())
    }

    /// Planned phases that have not been answered, whether they timed out,
    /// were skipped or were cut short by the target finishing early.
    pub fn missing(&self) -> PhaseSet {
        self.plan
            .iter()
            .filter(|t| !t.status.is_done())
            .fold(PhaseSet::EMPTY, |set, t| set.with(t.phase))
    }

    /// Mean round trip over the phases that completed after a send of their own.
    pub fn ping(&self) -> Option<Duration> {
        if self.ping_count == 0 {
            return None;
        }
        Some(self.ping_total / self.ping_count)
    }

    /// Re-sends made across all phases.
    pub fn retry_count(&self) -> u32 {
        self.plan
            .iter()
            .map(|t| t.attempts.saturating_sub(1))
            .sum()
    }
}
