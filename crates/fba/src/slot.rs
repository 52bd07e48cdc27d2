//! Per-slot consensus state.
//!
//! A [`Slot`] owns one nomination protocol and one ballot protocol
//! instance plus the bookkeeping between them: routing inbound
//! envelopes by statement type, handing the nomination composite to
//! the ballot protocol, and recording the externalized value once the
//! ballot protocol freezes.
//!
//! A slot is created when the host first nominates or when the first
//! envelope for its index arrives, and lives until the host discards
//! it after externalization.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ballot::{BallotPhase, BallotProtocol};
use crate::driver::{Driver, TimerKind, ValidationLevel};
use crate::nomination::NominationProtocol;
use crate::types::{Envelope, NodeId, Pledges, QuorumSet, Value};
use crate::{EnvelopeState, SlotContext};

/// Build a [`SlotContext`] from disjoint field borrows, so the
/// protocol objects can still be borrowed mutably alongside it.
macro_rules! slot_ctx {
    ($slot:ident, $driver:ident) => {
        SlotContext {
            local_node_id: &$slot.local_node_id,
            local_quorum_set: &$slot.local_quorum_set,
            driver: $driver,
            slot_index: $slot.slot_index,
        }
    };
}

/// One consensus instance: nomination plus ballot for a single index.
#[derive(Debug)]
pub struct Slot {
    slot_index: u64,
    local_node_id: NodeId,
    local_quorum_set: QuorumSet,

    /// Watchers track consensus without voting.
    is_validator: bool,

    nomination: NominationProtocol,
    ballot: BallotProtocol,

    /// Every valid envelope seen, per sender, in arrival order.
    envelopes: HashMap<NodeId, Vec<Envelope>>,

    /// Final value once the ballot protocol externalizes.
    externalized_value: Option<Value>,

    /// Emission gate: false while any statement carried a MaybeValid
    /// value.
    fully_validated: bool,

    /// Latched once a v-blocking set of peers has spoken.
    got_v_blocking: bool,
}

impl Slot {
    pub fn new(
        slot_index: u64,
        local_node_id: NodeId,
        local_quorum_set: QuorumSet,
        is_validator: bool,
    ) -> Self {
        let mut nomination = NominationProtocol::new();
        nomination.set_fully_validated(is_validator);
        let mut ballot = BallotProtocol::new();
        ballot.set_fully_validated(is_validator);

        Self {
            slot_index,
            local_node_id,
            local_quorum_set,
            is_validator,
            nomination,
            ballot,
            envelopes: HashMap::new(),
            externalized_value: None,
            fully_validated: is_validator,
            got_v_blocking: false,
        }
    }

    pub fn slot_index(&self) -> u64 {
        self.slot_index
    }

    pub fn nomination(&self) -> &NominationProtocol {
        &self.nomination
    }

    pub fn ballot(&self) -> &BallotProtocol {
        &self.ballot
    }

    pub fn get_externalized_value(&self) -> Option<&Value> {
        self.externalized_value.as_ref()
    }

    pub fn is_externalized(&self) -> bool {
        self.externalized_value.is_some()
    }

    pub fn is_fully_validated(&self) -> bool {
        self.fully_validated
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.ballot.heard_from_quorum()
    }

    pub fn got_v_blocking(&self) -> bool {
        self.got_v_blocking
    }

    pub fn ballot_phase(&self) -> BallotPhase {
        self.ballot.phase()
    }

    pub fn ballot_counter(&self) -> Option<u32> {
        self.ballot.current_counter()
    }

    pub fn is_nominating(&self) -> bool {
        self.nomination.is_started() && !self.nomination.is_stopped()
    }

    /// Latest composite candidate from nomination.
    pub fn get_latest_composite_candidate(&self) -> Option<Value> {
        self.nomination.latest_composite().cloned()
    }

    /// Process an inbound envelope, routing by statement type.
    pub fn process_envelope<D: Driver>(
        &mut self,
        envelope: Envelope,
        driver: &Arc<D>,
    ) -> EnvelopeState {
        let node_id = envelope.statement.node_id;
        let heard_before = self.heard_from(&node_id);

        let result = match &envelope.statement.pledges {
            Pledges::Nominate(_) => self.process_nomination_envelope(&envelope, driver),
            Pledges::Prepare(_) | Pledges::Confirm(_) | Pledges::Externalize(_) => {
                self.process_ballot_envelope(&envelope, driver)
            }
        };

        if result.is_valid() {
            self.envelopes.entry(node_id).or_default().push(envelope);
            if !heard_before {
                self.maybe_set_got_v_blocking();
            }
        }

        self.maybe_start_ballot_protocol(driver);
        self.maybe_record_externalized(driver);

        result
    }

    /// Nominate a value; see [`NominationProtocol::nominate`].
    pub fn nominate<D: Driver>(
        &mut self,
        value: Value,
        prev_value: &Value,
        timed_out: bool,
        driver: &Arc<D>,
    ) -> bool {
        if !self.is_validator || self.is_externalized() {
            return false;
        }

        let ctx = slot_ctx!(self, driver);
        let result = self
            .nomination
            .nominate(&ctx, value, prev_value, timed_out);

        // The round timer is re-armed whenever nomination is live and
        // still hunting for candidates, whether or not this call
        // changed anything.
        if self.nomination.is_started()
            && !self.nomination.is_stopped()
            && self.nomination.candidates().is_empty()
        {
            let timeout = driver.compute_timeout(self.nomination.round(), true);
            driver.setup_timer(self.slot_index, TimerKind::Nomination, timeout);
        }

        self.maybe_start_ballot_protocol(driver);
        self.maybe_record_externalized(driver);

        result
    }

    /// Stop emitting nominations; any composite already handed off
    /// stands.
    pub fn stop_nomination<D: Driver>(&mut self, driver: &Arc<D>) {
        self.nomination.stop();
        driver.stop_timer(self.slot_index, TimerKind::Nomination);
    }

    /// Ballot timer expired: bump the counter.
    pub fn bump_ballot_on_timeout<D: Driver>(&mut self, driver: &Arc<D>) -> bool {
        if !self.is_validator {
            return false;
        }
        driver.timer_expired(self.slot_index, TimerKind::Ballot);

        let composite = self.nomination.latest_composite().cloned();
        let ctx = slot_ctx!(self, driver);
        let result = self.ballot.bump_timeout(&ctx, composite.as_ref());
        self.maybe_record_externalized(driver);
        result
    }

    /// Move the ballot to `(counter, value)` (ops/test backdoor).
    pub fn bump_state<D: Driver>(&mut self, driver: &Arc<D>, value: Value, counter: u32) -> bool {
        let ctx = slot_ctx!(self, driver);
        let result = self.ballot.bump_state(&ctx, value, counter);
        self.maybe_record_externalized(driver);
        result
    }

    /// Bump with an auto-computed counter (`current + 1`).
    pub fn force_bump_state<D: Driver>(&mut self, driver: &Arc<D>, value: Value) -> bool {
        let ctx = slot_ctx!(self, driver);
        let result = self.ballot.bump(&ctx, value, true);
        self.maybe_record_externalized(driver);
        result
    }

    /// Abandon the current ballot (0 auto-increments the counter).
    pub fn abandon_ballot<D: Driver>(&mut self, driver: &Arc<D>, counter: u32) -> bool {
        self.sync_composite_candidate();
        let ctx = slot_ctx!(self, driver);
        let result = self.ballot.abandon_ballot_entry(counter, &ctx);
        self.maybe_record_externalized(driver);
        result
    }

    /// All envelopes recorded for this slot.
    pub fn get_envelopes(&self) -> &HashMap<NodeId, Vec<Envelope>> {
        &self.envelopes
    }

    pub fn get_statement_count(&self) -> usize {
        self.envelopes.values().map(|v| v.len()).sum()
    }

    pub fn get_nodes_heard_from(&self) -> HashSet<NodeId> {
        self.envelopes.keys().copied().collect()
    }

    /// Latest envelope from a node; ballot statements shadow
    /// nominations.
    pub fn get_latest_envelope(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.ballot
            .latest_envelope(node_id)
            .or_else(|| self.nomination.latest_nomination(node_id))
    }

    /// Latest self-envelopes safe to hand to peers.
    pub fn get_latest_messages_send(&self) -> Vec<Envelope> {
        let mut messages = Vec::new();
        if !self.fully_validated {
            return messages;
        }
        if let Some(envelope) = self.nomination.last_envelope() {
            messages.push(envelope.clone());
        }
        if let Some(envelope) = self.ballot.last_envelope() {
            messages.push(envelope.clone());
        }
        messages
    }

    /// Visit the latest envelope of every node, nomination first.
    pub fn process_current_state<F>(&self, mut f: F, force_self: bool) -> bool
    where
        F: FnMut(&Envelope) -> bool,
    {
        self.nomination.process_current_state(
            |env| f(env),
            &self.local_node_id,
            self.fully_validated,
            force_self,
        ) && self.ballot.process_current_state(
            |env| f(env),
            &self.local_node_id,
            self.fully_validated,
            force_self,
        )
    }

    /// Envelopes witnessing the externalized decision.
    pub fn get_externalizing_state(&self) -> Vec<Envelope> {
        self.ballot
            .get_externalizing_state(&self.local_node_id, self.fully_validated)
    }

    pub fn get_nomination_leaders(&self) -> HashSet<NodeId> {
        self.nomination.round_leaders().clone()
    }

    /// Restore from a persisted self-envelope.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> bool {
        if envelope.statement.node_id != self.local_node_id
            || envelope.statement.slot_index != self.slot_index
        {
            tracing::trace!(
                slot = self.slot_index,
                "rejecting state restore from foreign envelope"
            );
            return false;
        }

        let heard_before = self.heard_from(&envelope.statement.node_id);

        let result = match &envelope.statement.pledges {
            Pledges::Nominate(_) => self.nomination.set_state_from_envelope(envelope),
            Pledges::Prepare(_) | Pledges::Confirm(_) | Pledges::Externalize(_) => {
                let restored = self.ballot.set_state_from_envelope(envelope);
                if restored && self.ballot.is_externalized() {
                    if let Some(value) = self.ballot.get_externalized_value() {
                        self.externalized_value = Some(value.clone());
                        self.fully_validated = true;
                    }
                }
                restored
            }
        };

        if result && !heard_before {
            self.maybe_set_got_v_blocking();
        }
        result
    }

    fn heard_from(&self, node_id: &NodeId) -> bool {
        self.ballot.latest_envelope(node_id).is_some()
            || self.nomination.latest_nomination(node_id).is_some()
    }

    fn maybe_set_got_v_blocking(&mut self) {
        if self.got_v_blocking {
            return;
        }

        let mut heard = HashSet::new();
        for node_id in crate::quorum::get_all_nodes(&self.local_quorum_set) {
            if self.heard_from(&node_id) {
                heard.insert(node_id);
            }
        }
        self.got_v_blocking = crate::quorum::is_v_blocking(&self.local_quorum_set, &heard);
    }

    fn process_nomination_envelope<D: Driver>(
        &mut self,
        envelope: &Envelope,
        driver: &Arc<D>,
    ) -> EnvelopeState {
        let ctx = slot_ctx!(self, driver);
        self.nomination.process_envelope(envelope, &ctx)
    }

    fn process_ballot_envelope<D: Driver>(
        &mut self,
        envelope: &Envelope,
        driver: &Arc<D>,
    ) -> EnvelopeState {
        {
            let ctx = slot_ctx!(self, driver);
            if !self.ballot.is_statement_sane(&envelope.statement, &ctx) {
                tracing::trace!(
                    slot = self.slot_index,
                    node_id = ?envelope.statement.node_id,
                    "dropping insane ballot statement"
                );
                return EnvelopeState::Invalid;
            }

            match self.ballot.validate_statement_values(&envelope.statement, &ctx) {
                ValidationLevel::Invalid => {
                    tracing::trace!(
                        slot = self.slot_index,
                        node_id = ?envelope.statement.node_id,
                        "dropping ballot statement with invalid values"
                    );
                    return EnvelopeState::Invalid;
                }
                ValidationLevel::MaybeValid => {
                    self.fully_validated = false;
                    self.nomination.set_fully_validated(false);
                    self.ballot.set_fully_validated(false);
                }
                ValidationLevel::FullyValidated => {}
            }
        }

        self.sync_composite_candidate();
        let ctx = slot_ctx!(self, driver);
        let result = self.ballot.process_envelope(envelope, &ctx);

        if self.ballot.take_stop_nomination_request() {
            self.nomination.stop();
            driver.stop_timer(self.slot_index, TimerKind::Nomination);
        }

        result
    }

    /// The ballot protocol needs the composite for its timeout path.
    fn sync_composite_candidate(&mut self) {
        self.ballot
            .set_composite_candidate(self.nomination.latest_composite().cloned());
    }

    /// Hand the first composite to the ballot protocol.
    ///
    /// Nomination keeps running alongside the ballot protocol; it only
    /// stops when the slot externalizes.
    fn maybe_start_ballot_protocol<D: Driver>(&mut self, driver: &Arc<D>) {
        if self.ballot.current_ballot().is_some() {
            return;
        }
        let Some(composite) = self.nomination.latest_composite().cloned() else {
            return;
        };

        driver.stop_timer(self.slot_index, TimerKind::Nomination);
        driver.started_ballot_protocol(self.slot_index, &composite);

        let ctx = slot_ctx!(self, driver);
        self.ballot.bump(&ctx, composite, false);
    }

    /// Record the decision exactly once and quiesce the timers.
    fn maybe_record_externalized<D: Driver>(&mut self, driver: &Arc<D>) {
        if !self.ballot.is_externalized() || self.externalized_value.is_some() {
            return;
        }
        if let Some(value) = self.ballot.get_externalized_value() {
            tracing::debug!(slot = self.slot_index, "slot externalized");
            self.externalized_value = Some(value.clone());
            self.fully_validated = true;
            self.nomination.set_fully_validated(true);
            self.ballot.set_fully_validated(true);

            driver.stop_timer(self.slot_index, TimerKind::Nomination);
            driver.stop_timer(self.slot_index, TimerKind::Ballot);
        }
    }

    /// Observability snapshot.
    pub fn get_info(&self) -> crate::info::SlotInfo {
        let phase = if self.externalized_value.is_some() {
            "EXTERNALIZED"
        } else if self.ballot.phase() != BallotPhase::Prepare
            || self.ballot.current_ballot().is_some()
        {
            "BALLOT"
        } else if self.nomination.is_started() {
            "NOMINATION"
        } else {
            "IDLE"
        };

        crate::info::SlotInfo {
            slot_index: self.slot_index,
            phase: phase.to_string(),
            fully_validated: self.fully_validated,
            nomination: self
                .nomination
                .is_started()
                .then(|| self.nomination.get_info()),
            ballot: (self.ballot.current_ballot().is_some() || self.externalized_value.is_some())
                .then(|| self.ballot.get_info()),
        }
    }

    /// Per-node participation summary for this slot.
    pub fn get_quorum_info(&self) -> crate::info::QuorumInfo {
        use crate::info::PeerState;

        let mut nodes = HashMap::new();
        let mut responding = HashSet::new();

        for node_id in crate::quorum::get_all_nodes(&self.local_quorum_set) {
            let state = self.node_state(&node_id);
            if state != PeerState::Missing {
                responding.insert(node_id);
            }

            let ballot_counter = self.ballot.latest_envelope(&node_id).and_then(|envelope| {
                match &envelope.statement.pledges {
                    Pledges::Prepare(p) => Some(p.ballot.counter),
                    Pledges::Confirm(c) => Some(c.ballot.counter),
                    Pledges::Externalize(e) => Some(e.commit.counter),
                    Pledges::Nominate(_) => None,
                }
            });

            nodes.insert(
                crate::format::node_id_to_str(&node_id),
                crate::info::NodeInfo {
                    state: state.as_str().to_string(),
                    ballot_counter,
                },
            );
        }

        crate::info::QuorumInfo {
            slot_index: self.slot_index,
            local_node: crate::format::node_id_to_str(&self.local_node_id),
            quorum_set_hash: hex::encode(
                &crate::quorum::hash_quorum_set(&self.local_quorum_set).0[..8],
            ),
            nodes,
            quorum_reached: crate::quorum::is_quorum_slice(&self.local_quorum_set, &responding),
            v_blocking: crate::quorum::is_v_blocking(&self.local_quorum_set, &responding),
        }
    }

    /// A node's most advanced state for this slot.
    pub fn node_state(&self, node_id: &NodeId) -> crate::info::PeerState {
        if let Some(envelope) = self.ballot.latest_envelope(node_id) {
            return crate::info::PeerState::from_pledges(&envelope.statement.pledges);
        }
        if self.nomination.latest_nomination(node_id).is_some() {
            return crate::info::PeerState::Nominating;
        }
        crate::info::PeerState::Missing
    }
}

#[cfg(test)]
mod tests;
