//! Ballot protocol: federated voting over `(counter, value)` ballots.
//!
//! Once nomination produces a composite value, the ballot protocol
//! carries it to finality through three phases:
//!
//! 1. **PREPARE**: establish that a ballot is safe to commit, meaning
//!    no lower incompatible ballot can ever be committed.
//! 2. **CONFIRM**: a commit range has been accepted; the slot's
//!    value can no longer change, only its counters.
//! 3. **EXTERNALIZE**: a quorum ratified the commit; the decision is
//!    final and frozen forever.
//!
//! State follows the usual federated-agreement notation: `b` (current
//! ballot), `p` / `p'` (highest and second-highest accepted-prepared,
//! always incompatible with each other), `h` (highest confirmed
//! prepared), `c` (lowest commit). Counters only move forward;
//! adversarial or replayed envelopes that fail a federated predicate
//! simply do not fire a transition.

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::{Driver, TimerKind, ValidationLevel};
use crate::types::{
    Ballot, Confirm, Envelope, Externalize, NodeId, Pledges, Prepare, Statement, Value,
};
use crate::{for_latest_envelopes, EnvelopeState, SlotContext};

mod envelope;
mod state_machine;
mod statements;

#[cfg(test)]
mod tests;

pub use statements::working_ballot;

/// Deepest self-processing cascade allowed inside one envelope
/// delivery. The protocol converges in a handful of steps; hitting
/// this bound means the state machine is broken.
const MAX_ADVANCE_DEPTH: u32 = 50;

/// Phase of the ballot protocol; strictly forward-moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotPhase {
    /// Voting to prepare ballots.
    Prepare,
    /// A commit range is accepted; counters may still move.
    Confirm,
    /// Decision is final.
    Externalize,
}

/// Per-slot ballot state machine.
#[derive(Debug)]
pub struct BallotProtocol {
    /// `b`: the ballot we are working on. None until the first bump.
    current_ballot: Option<Ballot>,

    /// `p`: highest ballot accepted as prepared.
    prepared: Option<Ballot>,

    /// `p'`: second-highest accepted-prepared, incompatible with `p`.
    prepared_prime: Option<Ballot>,

    /// `h`: highest ballot confirmed prepared.
    high_ballot: Option<Ballot>,

    /// `c`: lowest ballot we vote or accept to commit.
    commit: Option<Ballot>,

    phase: BallotPhase,

    /// Latest ballot envelope per peer (and self).
    latest_envelopes: HashMap<NodeId, Envelope>,

    /// Value of the current/committed ballot.
    value: Option<Value>,

    /// Value locked in by confirm-prepared / accept-commit; bumps must
    /// stick to it.
    value_override: Option<Value>,

    /// Latest composite from nomination, synced in by the slot so the
    /// timeout path can prefer it.
    composite_candidate: Option<Value>,

    /// Whether a quorum reached the current counter.
    heard_from_quorum: bool,

    /// Self-processing recursion depth.
    advance_depth: u32,

    /// Last envelope constructed locally.
    last_envelope: Option<Envelope>,

    /// Last envelope actually broadcast.
    last_emitted: Option<Envelope>,

    /// Emission gate; false while the slot carries MaybeValid values.
    fully_validated: bool,

    /// Set when confirm-commit fires; the slot stops nomination.
    stop_nomination_requested: bool,
}

impl Default for BallotProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl BallotProtocol {
    pub fn new() -> Self {
        Self {
            current_ballot: None,
            prepared: None,
            prepared_prime: None,
            high_ballot: None,
            commit: None,
            phase: BallotPhase::Prepare,
            latest_envelopes: HashMap::new(),
            value: None,
            value_override: None,
            composite_candidate: None,
            heard_from_quorum: false,
            advance_depth: 0,
            last_envelope: None,
            last_emitted: None,
            fully_validated: true,
            stop_nomination_requested: false,
        }
    }

    pub fn phase(&self) -> BallotPhase {
        self.phase
    }

    pub fn current_ballot(&self) -> Option<&Ballot> {
        self.current_ballot.as_ref()
    }

    pub fn current_counter(&self) -> Option<u32> {
        self.current_ballot.as_ref().map(|b| b.counter)
    }

    pub fn prepared(&self) -> Option<&Ballot> {
        self.prepared.as_ref()
    }

    pub fn prepared_prime(&self) -> Option<&Ballot> {
        self.prepared_prime.as_ref()
    }

    pub fn high_ballot(&self) -> Option<&Ballot> {
        self.high_ballot.as_ref()
    }

    pub fn commit(&self) -> Option<&Ballot> {
        self.commit.as_ref()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_externalized(&self) -> bool {
        self.phase == BallotPhase::Externalize
    }

    pub fn get_externalized_value(&self) -> Option<&Value> {
        if self.phase == BallotPhase::Externalize {
            self.value.as_ref()
        } else {
            None
        }
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    pub fn latest_envelopes(&self) -> &HashMap<NodeId, Envelope> {
        &self.latest_envelopes
    }

    pub fn latest_envelope(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.latest_envelopes.get(node_id)
    }

    /// Last envelope this node constructed (emitted or not).
    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    pub(crate) fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
    }

    /// Sync the nomination composite before operations that may bump.
    pub(crate) fn set_composite_candidate(&mut self, value: Option<Value>) {
        self.composite_candidate = value;
    }

    /// Consume the stop-nomination signal raised by confirm-commit.
    pub(crate) fn take_stop_nomination_request(&mut self) -> bool {
        std::mem::take(&mut self.stop_nomination_requested)
    }

    /// Visit the latest envelopes in node order.
    pub fn process_current_state<F>(
        &self,
        f: F,
        local_node_id: &NodeId,
        fully_validated: bool,
        force_self: bool,
    ) -> bool
    where
        F: FnMut(&Envelope) -> bool,
    {
        for_latest_envelopes(
            &self.latest_envelopes,
            f,
            local_node_id,
            fully_validated,
            force_self,
        )
    }

    /// Envelopes that witnessed the externalized decision: peers whose
    /// working ballot is compatible with the commit, plus self when
    /// fully validated.
    pub fn get_externalizing_state(
        &self,
        local_node_id: &NodeId,
        fully_validated: bool,
    ) -> Vec<Envelope> {
        let mut result = Vec::new();
        if self.phase != BallotPhase::Externalize {
            return result;
        }
        let Some(commit) = &self.commit else {
            return result;
        };

        for (node_id, envelope) in &self.latest_envelopes {
            if node_id != local_node_id {
                if let Some(working) = working_ballot(&envelope.statement) {
                    if working.compatible(commit) {
                        result.push(envelope.clone());
                    }
                }
            } else if fully_validated {
                result.push(envelope.clone());
            }
        }
        result
    }

    /// Start (or force-restart) the ballot with a value, counter
    /// `current + 1`.
    pub(crate) fn bump<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        force: bool,
    ) -> bool {
        if !force && self.current_ballot.is_some() {
            return false;
        }
        let counter = self
            .current_ballot
            .as_ref()
            .map(|b| b.counter + 1)
            .unwrap_or(1);
        self.bump_state(ctx, value, counter)
    }

    /// Entry point for host-driven abandons; the heavy lifting lives
    /// in the state machine.
    pub(crate) fn abandon_ballot_entry<D: Driver>(
        &mut self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        self.abandon_ballot(counter, ctx)
    }

    /// Ballot timer expired: abandon the current counter.
    pub(crate) fn bump_timeout<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        composite_candidate: Option<&Value>,
    ) -> bool {
        self.composite_candidate = composite_candidate.cloned();
        self.abandon_ballot(0, ctx)
    }

    /// Advance `b` to `(counter, value)`, emitting the updated state.
    ///
    /// In PREPARE the value may switch (unless locked by an override);
    /// in CONFIRM only the counter can move; in EXTERNALIZE this is a
    /// no-op.
    pub(crate) fn bump_state<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        counter: u32,
    ) -> bool {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return false;
        }

        let effective = match &self.value_override {
            // Stay on the value we saw confirmed prepared or voted to
            // commit.
            Some(locked) => locked.clone(),
            None => value,
        };

        let ballot = Ballot::new(counter, effective);
        let updated = self.update_current_value(&ballot);
        if updated {
            self.emit_current_state(ctx);
            self.check_heard_from_quorum(ctx);
        }
        updated
    }

    /// Process a ballot envelope (PREPARE / CONFIRM / EXTERNALIZE).
    pub(crate) fn process_envelope<D: Driver>(
        &mut self,
        envelope: &Envelope,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        let node_id = envelope.statement.node_id;

        match &envelope.statement.pledges {
            Pledges::Prepare(_) | Pledges::Confirm(_) | Pledges::Externalize(_) => {}
            Pledges::Nominate(_) => return EnvelopeState::Invalid,
        }

        if !self.is_newer_statement(&node_id, &envelope.statement) {
            return EnvelopeState::Invalid;
        }

        if self.phase == BallotPhase::Externalize {
            // The decision is frozen; only compatible replays are kept
            // for the externalizing state.
            if self.statement_matches_commit_value(&envelope.statement) {
                self.latest_envelopes.insert(node_id, envelope.clone());
                return EnvelopeState::Valid;
            }
            tracing::trace!(?node_id, "dropping ballot statement for foreign value after externalize");
            return EnvelopeState::Invalid;
        }

        self.latest_envelopes.insert(node_id, envelope.clone());
        self.advance_slot(&envelope.statement, ctx)
    }

    fn statement_matches_commit_value(&self, statement: &Statement) -> bool {
        let Some(commit) = self.commit.as_ref() else {
            return false;
        };
        match &statement.pledges {
            Pledges::Prepare(prep) => commit.value == prep.ballot.value,
            Pledges::Confirm(conf) => commit.value == conf.ballot.value,
            Pledges::Externalize(ext) => commit.value == ext.commit.value,
            Pledges::Nominate(_) => false,
        }
    }

    /// Restore state from a persisted self-envelope.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> bool {
        let node_id = envelope.statement.node_id;
        match &envelope.statement.pledges {
            Pledges::Prepare(prep) => {
                self.current_ballot = Some(prep.ballot.clone());
                self.prepared = prep.prepared.clone();
                self.prepared_prime = prep.prepared_prime.clone();
                if prep.n_c != 0 {
                    self.commit = Some(Ballot::new(prep.n_c, prep.ballot.value.clone()));
                }
                if prep.n_h != 0 {
                    self.high_ballot = Some(Ballot::new(prep.n_h, prep.ballot.value.clone()));
                }
                self.value = Some(prep.ballot.value.clone());
                self.phase = BallotPhase::Prepare;
            }
            Pledges::Confirm(conf) => {
                self.current_ballot = Some(conf.ballot.clone());
                self.prepared = Some(Ballot::new(conf.n_prepared, conf.ballot.value.clone()));
                self.prepared_prime = None;
                self.commit = Some(Ballot::new(conf.n_commit, conf.ballot.value.clone()));
                self.high_ballot = Some(Ballot::new(conf.n_h, conf.ballot.value.clone()));
                self.value = Some(conf.ballot.value.clone());
                self.phase = BallotPhase::Confirm;
            }
            Pledges::Externalize(ext) => {
                self.commit = Some(ext.commit.clone());
                self.high_ballot = Some(Ballot::new(ext.n_h, ext.commit.value.clone()));
                self.current_ballot = Some(Ballot::new(u32::MAX, ext.commit.value.clone()));
                self.prepared = Some(Ballot::new(u32::MAX, ext.commit.value.clone()));
                self.value = Some(ext.commit.value.clone());
                self.phase = BallotPhase::Externalize;
            }
            Pledges::Nominate(_) => return false,
        }
        self.latest_envelopes.insert(node_id, envelope.clone());
        self.last_envelope = Some(envelope.clone());
        true
    }

    /// Verify the state invariants; used by tests and debug assertions.
    pub fn check_invariants(&self) -> crate::Result<()> {
        if let (Some(prepared), Some(prepared_prime)) = (&self.prepared, &self.prepared_prime) {
            if prepared_prime >= prepared {
                return Err(crate::Error::InvariantViolation(
                    "prepared_prime not below prepared".into(),
                ));
            }
            if prepared_prime.compatible(prepared) {
                return Err(crate::Error::InvariantViolation(
                    "prepared_prime compatible with prepared".into(),
                ));
            }
        }

        if self.phase == BallotPhase::Prepare && self.commit.is_some() && self.high_ballot.is_none()
        {
            return Err(crate::Error::InvariantViolation(
                "commit without high ballot in prepare phase".into(),
            ));
        }

        if let (Some(commit), Some(high)) = (&self.commit, &self.high_ballot) {
            if commit.counter > high.counter {
                return Err(crate::Error::InvariantViolation(
                    "commit counter above high counter".into(),
                ));
            }
            if commit.value != high.value {
                return Err(crate::Error::InvariantViolation(
                    "commit and high ballot values differ".into(),
                ));
            }
        }

        if self.phase == BallotPhase::Externalize
            && (self.commit.is_none() || self.high_ballot.is_none())
        {
            return Err(crate::Error::InvariantViolation(
                "externalize without commit range".into(),
            ));
        }

        Ok(())
    }

    /// Observability snapshot.
    pub fn get_info(&self) -> crate::info::BallotInfo {
        let snapshot = |b: &Ballot| crate::info::BallotSnapshot {
            counter: b.counter,
            value: crate::format::value_to_str(&b.value),
        };

        crate::info::BallotInfo {
            phase: format!("{:?}", self.phase),
            ballot_counter: self.current_counter().unwrap_or(0),
            ballot_value: self
                .current_ballot
                .as_ref()
                .map(|b| crate::format::value_to_str(&b.value)),
            prepared: self.prepared.as_ref().map(snapshot),
            prepared_prime: self.prepared_prime.as_ref().map(snapshot),
            commit: self.commit.as_ref().map(|c| crate::info::CommitBounds {
                low: c.counter,
                high: self
                    .high_ballot
                    .as_ref()
                    .map(|h| h.counter)
                    .unwrap_or(c.counter),
            }),
            high: self.high_ballot.as_ref().map(|h| h.counter).unwrap_or(0),
            node_count: self.latest_envelopes.len(),
            heard_from_quorum: self.heard_from_quorum,
        }
    }
}
