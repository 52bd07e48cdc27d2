//! Nomination protocol: the first phase of a slot.
//!
//! Nodes vote for values, accept them once a v-blocking set has
//! accepted them or a quorum has voted-or-accepted them, and confirm
//! them as *candidates* once a quorum has accepted them. Confirmed
//! candidates are combined by the host arbiter into a single composite
//! value, which seeds the ballot protocol.
//!
//! Each round elects a set of *leaders* from a deterministic priority
//! function; only leader values are adopted, which keeps the candidate
//! set from diverging. The leader set grows round over round, so a
//! silent leader cannot stall the slot forever.
//!
//! Nomination statements are monotone: a newer statement must extend
//! the previous votes and accepted sets. Anything else is a regression
//! and is dropped.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::driver::{Driver, TimerKind, ValidationLevel};
use crate::quorum::{count_nodes, for_each_node, is_blocking_set, is_quorum};
use crate::types::{Envelope, NodeId, Nominate, Pledges, Statement, Value};
use crate::{for_latest_envelopes, EnvelopeState, SlotContext};

/// Per-slot nomination state machine.
#[derive(Debug, Default)]
pub struct NominationProtocol {
    /// Current round; bumped on every (re-)nomination.
    round: u32,

    /// Values this node votes for.
    votes: BTreeSet<Value>,

    /// Values accepted through federated voting.
    accepted: BTreeSet<Value>,

    /// Values confirmed by a quorum; input to the composite.
    candidates: BTreeSet<Value>,

    started: bool,
    stopped: bool,

    /// Latest composite produced from `candidates`.
    latest_composite: Option<Value>,

    /// Previous slot's value, seeds the priority hashes.
    previous_value: Option<Value>,

    /// How many nomination timeouts have fired.
    timeouts: u32,

    /// Latest nomination envelope per peer (and self).
    latest_nominations: HashMap<NodeId, Envelope>,

    /// Leaders accumulated over all rounds so far.
    round_leaders: HashSet<NodeId>,

    /// Last envelope constructed locally.
    last_envelope: Option<Envelope>,

    /// Last envelope actually broadcast.
    last_emitted: Option<Envelope>,

    /// Emission gate; false while the slot carries MaybeValid values.
    fully_validated: bool,
}

impl NominationProtocol {
    pub fn new() -> Self {
        Self {
            fully_validated: true,
            ..Default::default()
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn votes(&self) -> &BTreeSet<Value> {
        &self.votes
    }

    pub fn accepted(&self) -> &BTreeSet<Value> {
        &self.accepted
    }

    pub fn candidates(&self) -> &BTreeSet<Value> {
        &self.candidates
    }

    pub fn latest_composite(&self) -> Option<&Value> {
        self.latest_composite.as_ref()
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn round_leaders(&self) -> &HashSet<NodeId> {
        &self.round_leaders
    }

    pub fn latest_nomination(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.latest_nominations.get(node_id)
    }

    /// Last envelope this node constructed (emitted or not).
    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    /// Last envelope actually handed to the network.
    pub fn last_emitted_envelope(&self) -> Option<&Envelope> {
        self.last_emitted.as_ref()
    }

    pub(crate) fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
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
            &self.latest_nominations,
            f,
            local_node_id,
            fully_validated,
            force_self,
        )
    }

    /// Observability snapshot.
    pub fn get_info(&self) -> crate::info::NominationInfo {
        crate::info::NominationInfo {
            running: self.started && !self.stopped,
            round: self.round,
            votes: self.votes.iter().map(crate::format::value_to_str).collect(),
            accepted: self
                .accepted
                .iter()
                .map(crate::format::value_to_str)
                .collect(),
            candidates: self
                .candidates
                .iter()
                .map(crate::format::value_to_str)
                .collect(),
            node_count: self.latest_nominations.len(),
        }
    }

    /// Drive nomination for this slot.
    ///
    /// On the first call, starts round 1. On a timeout call, advances
    /// to the next round. Recomputes the leader set, votes for `value`
    /// when the local node leads, adopts leader values otherwise, and
    /// emits a NOMINATE envelope iff local state changed.
    ///
    /// Returns true iff an envelope was produced.
    pub(crate) fn nominate<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        prev_value: &Value,
        timed_out: bool,
    ) -> bool {
        if self.stopped {
            return false;
        }
        // A confirmed candidate set means nomination already served
        // its purpose for this slot.
        if !self.candidates.is_empty() {
            return false;
        }

        if timed_out {
            self.timeouts = self.timeouts.saturating_add(1);
            if !self.started {
                return false;
            }
        }

        self.started = true;
        self.previous_value = Some(prev_value.clone());
        self.round = self.round.saturating_add(1);

        self.update_round_leaders(ctx, prev_value);

        let mut updated = self.adopt_from_leaders(ctx);
        updated = self.vote_own_value(ctx, &value) || updated;

        if updated {
            self.emit_nomination(ctx);
        }

        updated
    }

    /// End nomination; no further envelopes, composite handoff stands.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.started = false;
    }

    /// Process a NOMINATE envelope from the network (or self).
    pub(crate) fn process_envelope<D: Driver>(
        &mut self,
        envelope: &Envelope,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        let node_id = envelope.statement.node_id;

        let Pledges::Nominate(nomination) = &envelope.statement.pledges else {
            return EnvelopeState::Invalid;
        };

        if !self.is_newer_for_node(&node_id, nomination) {
            return EnvelopeState::Invalid;
        }
        if !Self::is_sane(nomination) {
            return EnvelopeState::Invalid;
        }

        self.latest_nominations.insert(node_id, envelope.clone());

        if !self.started {
            return EnvelopeState::Valid;
        }

        let votes_to_check: Vec<Value> = nomination.votes.clone();
        let (mut modified, new_candidates) = self.attempt_promote(&votes_to_check, ctx);

        // Leader values are only adopted while we still hunt for
        // candidates.
        if self.candidates.is_empty() && self.round_leaders.contains(&node_id) {
            if let Some(new_vote) = self.best_value_from(nomination, ctx) {
                if self.votes.insert(new_vote.clone()) {
                    modified = true;
                    ctx.driver.nominating_value(ctx.slot_index, &new_vote);
                }
            }
        }

        let mut state_changed = false;
        if modified {
            self.emit_nomination(ctx);
            state_changed = true;
        }
        if new_candidates {
            self.update_composite(ctx);
            state_changed = true;
        }

        if state_changed {
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    /// Restore state from a persisted self-envelope. Only allowed
    /// before nomination starts.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> bool {
        if self.started {
            return false;
        }
        let Pledges::Nominate(nomination) = &envelope.statement.pledges else {
            return false;
        };

        self.votes = nomination.votes.iter().cloned().collect();
        self.accepted = nomination.accepted.iter().cloned().collect();
        self.latest_nominations
            .insert(envelope.statement.node_id, envelope.clone());
        self.last_envelope = Some(envelope.clone());
        true
    }

    /// Whether `statement` would replace the stored one for its node.
    pub fn is_newer_statement(&self, node_id: &NodeId, statement: &Statement) -> bool {
        match &statement.pledges {
            Pledges::Nominate(nomination) => self.is_newer_for_node(node_id, nomination),
            _ => false,
        }
    }

    fn adopt_from_leaders<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> bool {
        let mut updated = false;
        for leader in self.round_leaders.clone() {
            let nomination = match self.latest_nominations.get(&leader) {
                Some(envelope) => match &envelope.statement.pledges {
                    Pledges::Nominate(nomination) => nomination.clone(),
                    _ => continue,
                },
                None => continue,
            };
            if let Some(new_vote) = self.best_value_from(&nomination, ctx) {
                if self.votes.insert(new_vote.clone()) {
                    updated = true;
                    ctx.driver.nominating_value(ctx.slot_index, &new_vote);
                }
            }
        }
        updated
    }

    fn vote_own_value<D: Driver>(&mut self, ctx: &SlotContext<'_, D>, value: &Value) -> bool {
        if !self.round_leaders.contains(ctx.local_node_id) {
            return false;
        }
        // Only seed our own value once; later rounds keep whatever the
        // protocol has already gathered.
        if !self.votes.is_empty() {
            return false;
        }
        if ctx.driver.validate_value(ctx.slot_index, value, true) == ValidationLevel::Invalid {
            return false;
        }
        if self.votes.insert(value.clone()) {
            ctx.driver.nominating_value(ctx.slot_index, value);
            true
        } else {
            false
        }
    }

    /// Promote votes to accepted and accepted to candidates.
    ///
    /// Returns `(modified, new_candidates)`. Called both on inbound
    /// envelopes (with the sender's votes) and on self-emission (with
    /// our own), matching the cascade of the federated voting rules.
    fn attempt_promote<D: Driver>(
        &mut self,
        votes_to_check: &[Value],
        ctx: &SlotContext<'_, D>,
    ) -> (bool, bool) {
        let mut modified = false;
        let mut new_candidates = false;

        for value in votes_to_check {
            if self.accepted.contains(value) {
                continue;
            }
            if !self.can_accept(value, ctx) {
                continue;
            }
            match ctx.driver.validate_value(ctx.slot_index, value, true) {
                ValidationLevel::FullyValidated => {
                    if self.accepted.insert(value.clone()) {
                        self.votes.insert(value.clone());
                        modified = true;
                    }
                }
                ValidationLevel::MaybeValid => {
                    // Not safe to accept as-is; vote for the valid core
                    // so the network can converge on it.
                    if let Some(extracted) = ctx.driver.extract_valid_value(ctx.slot_index, value) {
                        if self.votes.insert(extracted) {
                            modified = true;
                        }
                    }
                }
                ValidationLevel::Invalid => {}
            }
        }

        for value in self.accepted.clone() {
            if self.candidates.contains(&value) {
                continue;
            }
            if self.can_ratify(&value, ctx) && self.candidates.insert(value.clone()) {
                new_candidates = true;
                // Candidates confirmed: the round timer has done its job.
                ctx.driver
                    .stop_timer(ctx.slot_index, TimerKind::Nomination);
            }
        }

        (modified, new_candidates)
    }

    fn can_accept<D: Driver>(&self, value: &Value, ctx: &SlotContext<'_, D>) -> bool {
        let voters = self.nodes_with_value(value, |nom| &nom.votes);
        let acceptors = self.nodes_with_value(value, |nom| &nom.accepted);
        let supporters: HashSet<_> = voters.union(&acceptors).copied().collect();

        is_blocking_set(ctx.local_quorum_set, &acceptors)
            || is_quorum(ctx.local_quorum_set, &supporters, |node| {
                ctx.driver.get_quorum_set(node)
            })
    }

    fn can_ratify<D: Driver>(&self, value: &Value, ctx: &SlotContext<'_, D>) -> bool {
        let acceptors = self.nodes_with_value(value, |nom| &nom.accepted);
        is_quorum(ctx.local_quorum_set, &acceptors, |node| {
            ctx.driver.get_quorum_set(node)
        })
    }

    fn nodes_with_value(
        &self,
        value: &Value,
        field: fn(&Nominate) -> &Vec<Value>,
    ) -> HashSet<NodeId> {
        let mut nodes = HashSet::new();
        for (node_id, envelope) in &self.latest_nominations {
            if let Pledges::Nominate(nomination) = &envelope.statement.pledges {
                if field(nomination).contains(value) {
                    nodes.insert(*node_id);
                }
            }
        }
        nodes
    }

    fn update_composite<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) {
        if self.candidates.is_empty() {
            return;
        }
        let candidates: Vec<Value> = self.candidates.iter().cloned().collect();
        if let Some(composite) = ctx.driver.combine_candidates(ctx.slot_index, &candidates) {
            if self.latest_composite.as_ref() != Some(&composite) {
                ctx.driver
                    .updated_candidate_value(ctx.slot_index, &composite);
                self.latest_composite = Some(composite);
            }
        }
    }

    /// Build, self-process, and possibly broadcast our nomination.
    ///
    /// Self-processing can accept values and cascade into another
    /// emission; the newer-statement check breaks the recursion once
    /// the statement stops growing.
    fn emit_nomination<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) {
        let votes: Vec<Value> = self.votes.iter().cloned().collect();
        let nomination = Nominate {
            quorum_set_hash: ctx.driver.hash_quorum_set(ctx.local_quorum_set),
            votes: votes.clone(),
            accepted: self.accepted.iter().cloned().collect(),
        };
        let statement = Statement {
            node_id: *ctx.local_node_id,
            slot_index: ctx.slot_index,
            pledges: Pledges::Nominate(nomination.clone()),
        };
        let mut envelope = Envelope::unsigned(statement);
        ctx.driver.sign_envelope(&mut envelope);

        if !self.is_newer_for_node(ctx.local_node_id, &nomination) {
            return;
        }
        self.latest_nominations
            .insert(*ctx.local_node_id, envelope.clone());

        if self.started {
            let (modified, new_candidates) = self.attempt_promote(&votes, ctx);
            if modified {
                self.emit_nomination(ctx);
            }
            if new_candidates {
                self.update_composite(ctx);
            }
        }

        // A recursive emission may already have published a bigger
        // statement; only keep ours if it is still the newest.
        let still_newest = match &self.last_envelope {
            None => true,
            Some(last) => match &last.statement.pledges {
                Pledges::Nominate(last_nom) => Self::is_newer_nomination(last_nom, &nomination),
                _ => true,
            },
        };

        if still_newest {
            self.last_envelope = Some(envelope.clone());
            if self.fully_validated && self.last_emitted.as_ref() != Some(&envelope) {
                self.last_emitted = Some(envelope.clone());
                ctx.driver.emit_envelope(&envelope);
            }
        }
    }

    fn is_newer_for_node(&self, node_id: &NodeId, nomination: &Nominate) -> bool {
        match self.latest_nominations.get(node_id) {
            None => true,
            Some(existing) => match &existing.statement.pledges {
                Pledges::Nominate(old) => Self::is_newer_nomination(old, nomination),
                _ => true,
            },
        }
    }

    /// `new` must extend `old` in both sets and strictly grow one.
    fn is_newer_nomination(old: &Nominate, new: &Nominate) -> bool {
        let old_votes: BTreeSet<&Value> = old.votes.iter().collect();
        let old_accepted: BTreeSet<&Value> = old.accepted.iter().collect();
        let new_votes: BTreeSet<&Value> = new.votes.iter().collect();
        let new_accepted: BTreeSet<&Value> = new.accepted.iter().collect();

        old_votes.is_subset(&new_votes)
            && old_accepted.is_subset(&new_accepted)
            && (old_votes.len() < new_votes.len() || old_accepted.len() < new_accepted.len())
    }

    fn is_sane(nomination: &Nominate) -> bool {
        if nomination.votes.is_empty() && nomination.accepted.is_empty() {
            return false;
        }
        is_strictly_sorted(&nomination.votes) && is_strictly_sorted(&nomination.accepted)
    }

    /// Pick the best not-yet-voted value from a leader's nomination.
    ///
    /// Accepted values take precedence over plain votes; ties are
    /// broken by the driver's value hash. MaybeValid values contribute
    /// their extracted core.
    fn best_value_from<D: Driver>(
        &self,
        nomination: &Nominate,
        ctx: &SlotContext<'_, D>,
    ) -> Option<Value> {
        let mut best: Option<(u64, Value)> = None;
        let mut found_valid = false;

        let mut consider = |value: &Value, best: &mut Option<(u64, Value)>, found: &mut bool| {
            let candidate = match ctx.driver.validate_value(ctx.slot_index, value, true) {
                ValidationLevel::FullyValidated => Some(value.clone()),
                ValidationLevel::MaybeValid => {
                    ctx.driver.extract_valid_value(ctx.slot_index, value)
                }
                ValidationLevel::Invalid => None,
            };
            let Some(candidate) = candidate else {
                return;
            };
            *found = true;
            if self.votes.contains(&candidate) {
                return;
            }
            let prev = self.previous_value.as_ref().unwrap_or(&candidate);
            let hash =
                ctx.driver
                    .compute_value_hash(ctx.slot_index, prev, self.round, &candidate);
            match best {
                Some((top, _)) if hash < *top => {}
                _ => *best = Some((hash, candidate)),
            }
        };

        for value in &nomination.accepted {
            consider(value, &mut best, &mut found_valid);
        }
        if !found_valid {
            for value in &nomination.votes {
                consider(value, &mut best, &mut found_valid);
            }
        }

        best.map(|(_, value)| value)
    }

    /// Recompute the leader set for the current round.
    ///
    /// Works over the local quorum set normalized with self removed;
    /// keeps advancing rounds until at least one new leader joins, so
    /// the set grows monotonically.
    fn update_round_leaders<D: Driver>(&mut self, ctx: &SlotContext<'_, D>, prev_value: &Value) {
        let mut normalized = ctx.local_quorum_set.clone();
        crate::quorum::normalize_quorum_set_removing(&mut normalized, Some(ctx.local_node_id));

        let max_leaders = 1 + count_nodes(&normalized);

        while self.round_leaders.len() < max_leaders {
            let mut new_leaders = HashSet::new();
            let mut top_priority =
                self.node_priority(ctx, &normalized, prev_value, ctx.local_node_id);
            new_leaders.insert(*ctx.local_node_id);

            for_each_node(&normalized, &mut |node| {
                let priority = self.node_priority(ctx, &normalized, prev_value, node);
                if priority > top_priority {
                    top_priority = priority;
                    new_leaders.clear();
                }
                if priority == top_priority && priority > 0 {
                    new_leaders.insert(*node);
                }
            });

            if top_priority == 0 {
                new_leaders.clear();
            }

            let before = self.round_leaders.len();
            self.round_leaders.extend(new_leaders);
            if self.round_leaders.len() != before {
                return;
            }
            self.round = self.round.saturating_add(1);
        }
    }

    fn node_priority<D: Driver>(
        &self,
        ctx: &SlotContext<'_, D>,
        quorum_set: &crate::types::QuorumSet,
        prev_value: &Value,
        node_id: &NodeId,
    ) -> u64 {
        let weight =
            ctx.driver
                .get_node_weight(node_id, quorum_set, node_id == ctx.local_node_id);
        if weight == 0 {
            return 0;
        }

        // In the neighbor set iff the N-hash clears the weight; the
        // P-hash then ranks neighbors.
        let neighbor =
            ctx.driver
                .compute_hash_node(ctx.slot_index, prev_value, false, self.round, node_id);
        if neighbor <= weight {
            ctx.driver
                .compute_hash_node(ctx.slot_index, prev_value, true, self.round, node_id)
        } else {
            0
        }
    }
}

fn is_strictly_sorted(values: &[Value]) -> bool {
    values.windows(2).all(|pair| pair[0] < pair[1])
}
