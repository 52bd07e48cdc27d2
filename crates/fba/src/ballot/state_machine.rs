//! The advance loop: federated transitions tried in protocol order
//! until none fires. Every transition is guarded by a quorum predicate
//! plus a never-regress rule, which is what makes replayed and
//! adversarial envelopes harmless.

use std::collections::BTreeSet;

use super::statements::{less_and_compatible, less_and_incompatible};
use super::*;
use crate::quorum::is_quorum;

impl BallotProtocol {
    /// Run the transition cascade triggered by `hint`.
    ///
    /// At the top level, also tries counter bumps (when a v-blocking
    /// set is ahead) and refreshes heard-from-quorum, then flushes the
    /// latest envelope.
    pub(super) fn advance_slot<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        self.advance_depth = self.advance_depth.saturating_add(1);
        if self.advance_depth >= MAX_ADVANCE_DEPTH {
            // A bounded protocol must converge long before this; only
            // a state machine bug can get here.
            panic!("ballot advance cascade exceeded {MAX_ADVANCE_DEPTH} transitions");
        }

        let mut did_work = false;
        did_work = self.attempt_accept_prepared(hint, ctx) || did_work;
        did_work = self.attempt_confirm_prepared(hint, ctx) || did_work;
        did_work = self.attempt_accept_commit(hint, ctx) || did_work;
        did_work = self.attempt_confirm_commit(hint, ctx) || did_work;

        if self.advance_depth == 1 {
            loop {
                let bumped = self.attempt_bump(ctx);
                did_work = bumped || did_work;
                if !bumped {
                    break;
                }
            }
            self.check_heard_from_quorum(ctx);
        }

        self.advance_depth -= 1;
        if did_work {
            self.send_latest_envelope(ctx.driver);
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    /// Step 1: accept a ballot as prepared when a v-blocking set has
    /// accepted it or a quorum votes-or-accepts it.
    fn attempt_accept_prepared<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let candidates = self.prepare_candidates(hint);

        for ballot in candidates.iter().rev() {
            if self.phase == BallotPhase::Confirm {
                // Only extensions of the committed value matter now.
                if let Some(prepared) = &self.prepared {
                    if !less_and_compatible(prepared, ballot) {
                        continue;
                    }
                }
                if let Some(commit) = &self.commit {
                    if !commit.compatible(ballot) {
                        continue;
                    }
                }
            }

            // Nothing at or below p' can improve the state.
            if let Some(prepared_prime) = &self.prepared_prime {
                if ballot <= prepared_prime {
                    continue;
                }
            }
            // A compatible ballot at or below p is already covered.
            if let Some(prepared) = &self.prepared {
                if less_and_compatible(ballot, prepared) {
                    continue;
                }
            }

            let accepted = self.federated_accept(
                |st| self.votes_to_prepare(ballot, st),
                |st| self.accepts_prepared(ballot, st),
                ctx,
            );
            if accepted && self.set_accept_prepared(ballot.clone(), ctx) {
                return true;
            }
        }

        false
    }

    fn set_accept_prepared<D: Driver>(&mut self, ballot: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        let mut did_work = self.set_prepared(ballot, ctx);

        // An accepted-prepared ballot above h that conflicts with it
        // invalidates any pending commit vote.
        if self.commit.is_some() && self.high_ballot.is_some() {
            let high = self.high_ballot.as_ref().unwrap();
            let conflict = self
                .prepared
                .as_ref()
                .map(|p| less_and_incompatible(high, p))
                .unwrap_or(false)
                || self
                    .prepared_prime
                    .as_ref()
                    .map(|p| less_and_incompatible(high, p))
                    .unwrap_or(false);
            if conflict {
                self.commit = None;
                did_work = true;
            }
        }

        if did_work {
            self.emit_current_state(ctx);
        }
        did_work
    }

    /// Step 2: confirm a ballot prepared when a quorum accepts it;
    /// raises `h` and possibly seeds `c`.
    fn attempt_confirm_prepared<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if self.phase != BallotPhase::Prepare || self.prepared.is_none() {
            return false;
        }

        let candidates = self.prepare_candidates(hint);
        let Some((new_h, h_index)) = self.highest_confirmed_prepared(&candidates, ctx) else {
            return false;
        };

        let new_c = self.lowest_commit_vote(&candidates[..=h_index], &new_h, ctx);
        self.set_confirm_prepared(new_c, new_h, ctx)
    }

    fn highest_confirmed_prepared<D: Driver>(
        &self,
        candidates: &[Ballot],
        ctx: &SlotContext<'_, D>,
    ) -> Option<(Ballot, usize)> {
        for (index, ballot) in candidates.iter().enumerate().rev() {
            // Candidates are ascending: once we reach h, nothing left
            // can raise it.
            if let Some(high) = &self.high_ballot {
                if high >= ballot {
                    break;
                }
            }
            if self.federated_ratify(|st| self.accepts_prepared(ballot, st), ctx) {
                return Some((ballot.clone(), index));
            }
        }
        None
    }

    /// Walk down from `new_h` while a quorum still confirms each step
    /// prepared; the lowest such ballot is the commit vote.
    fn lowest_commit_vote<D: Driver>(
        &self,
        candidates: &[Ballot],
        new_h: &Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> Ballot {
        let mut new_c = Ballot::new(0, new_h.value.clone());

        let blocked_by_prepared = self
            .prepared
            .as_ref()
            .map(|p| less_and_incompatible(new_h, p))
            .unwrap_or(false)
            || self
                .prepared_prime
                .as_ref()
                .map(|p| less_and_incompatible(new_h, p))
                .unwrap_or(false);

        if self.commit.is_none() && !blocked_by_prepared {
            let current = self
                .current_ballot
                .clone()
                .unwrap_or_else(|| Ballot::new(0, new_h.value.clone()));

            for ballot in candidates.iter().rev() {
                if *ballot < current {
                    break;
                }
                if !less_and_compatible(ballot, new_h) {
                    continue;
                }
                if self.federated_ratify(|st| self.accepts_prepared(ballot, st), ctx) {
                    new_c = ballot.clone();
                } else {
                    break;
                }
            }
        }

        new_c
    }

    fn set_confirm_prepared<D: Driver>(
        &mut self,
        new_c: Ballot,
        new_h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = false;
        // From here on, bumps stay on this value.
        self.value_override = Some(new_h.value.clone());

        let compatible_with_current = self
            .current_ballot
            .as_ref()
            .map(|b| b.compatible(&new_h))
            .unwrap_or(true);

        if compatible_with_current {
            if self
                .high_ballot
                .as_ref()
                .map(|high| new_h > *high)
                .unwrap_or(true)
            {
                self.high_ballot = Some(new_h.clone());
                did_work = true;
            }
            if new_c.counter != 0 && self.commit.is_none() {
                self.commit = Some(new_c);
                did_work = true;
            }
            if did_work {
                ctx.driver.confirmed_ballot_prepared(ctx.slot_index, &new_h);
            }
        }

        did_work = self.raise_current_to(&new_h) || did_work;
        if did_work {
            self.emit_current_state(ctx);
        }
        did_work
    }

    /// Step 3: accept a commit range when a v-blocking set accepted it
    /// or a quorum votes-or-accepts it. Moves to CONFIRM.
    fn attempt_accept_commit<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let Some(ballot) = commit_hint_ballot(hint) else {
            return false;
        };
        if self.phase == BallotPhase::Confirm {
            if let Some(high) = &self.high_ballot {
                if !ballot.compatible(high) {
                    return false;
                }
            }
        }

        let boundaries = self.commit_boundaries(&ballot);
        if boundaries.is_empty() {
            return false;
        }

        let mut candidate = (0u32, 0u32);
        self.extend_interval(&mut candidate, &boundaries, |interval| {
            self.federated_accept(
                |st| self.votes_to_commit(&ballot, interval, st),
                |st| self.accepts_commit(&ballot, interval, st),
                ctx,
            )
        });

        if candidate.0 == 0 {
            return false;
        }

        if self.phase != BallotPhase::Confirm
            || candidate.1 > self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0)
        {
            let c = Ballot::new(candidate.0, ballot.value.clone());
            let h = Ballot::new(candidate.1, ballot.value.clone());
            return self.set_accept_commit(c, h, ctx);
        }

        false
    }

    fn set_accept_commit<D: Driver>(
        &mut self,
        c: Ballot,
        h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(h.value.clone());

        if self.high_ballot.as_ref() != Some(&h) || self.commit.as_ref() != Some(&c) {
            self.commit = Some(c);
            self.high_ballot = Some(h.clone());
            did_work = true;
        }

        if self.phase == BallotPhase::Prepare {
            self.phase = BallotPhase::Confirm;
            if let Some(current) = &self.current_ballot {
                if !less_and_compatible(&h, current) {
                    self.bump_to_ballot(&h, false);
                }
            }
            self.prepared_prime = None;
            did_work = true;
        }

        if did_work {
            self.raise_current_to(&h);
            ctx.driver.accepted_commit(ctx.slot_index, &h);
            self.emit_current_state(ctx);
        }
        did_work
    }

    /// Step 4: confirm the commit when a quorum accepts it; the slot
    /// externalizes.
    fn attempt_confirm_commit<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if self.phase != BallotPhase::Confirm
            || self.high_ballot.is_none()
            || self.commit.is_none()
        {
            return false;
        }

        let Some(ballot) = commit_hint_ballot(hint) else {
            return false;
        };
        if !ballot.compatible(self.commit.as_ref().unwrap()) {
            return false;
        }

        let boundaries = self.commit_boundaries(&ballot);
        let mut candidate = (0u32, 0u32);
        self.extend_interval(&mut candidate, &boundaries, |interval| {
            self.federated_ratify(|st| self.accepts_commit(&ballot, interval, st), ctx)
        });

        if candidate.0 == 0 {
            return false;
        }

        let c = Ballot::new(candidate.0, ballot.value.clone());
        let h = Ballot::new(candidate.1, ballot.value.clone());
        self.set_confirm_commit(c, h, ctx)
    }

    pub(super) fn set_confirm_commit<D: Driver>(
        &mut self,
        c: Ballot,
        h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        self.commit = Some(c.clone());
        self.high_ballot = Some(h.clone());
        self.raise_current_to(&h);
        self.value = Some(c.value.clone());
        self.phase = BallotPhase::Externalize;

        tracing::debug!(slot = ctx.slot_index, "ballot protocol externalized");
        self.emit_current_state(ctx);

        self.stop_nomination_requested = true;
        ctx.driver.value_externalized(ctx.slot_index, &c.value);
        true
    }

    /// If a v-blocking set is working above our counter, jump to the
    /// lowest counter that closes the gap.
    ///
    /// Only while still preparing: once a commit range is accepted the
    /// ballot timer is the sole driver of counter bumps, so statements
    /// for foreign values cannot drag the counter around.
    fn attempt_bump<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> bool {
        if self.phase != BallotPhase::Prepare {
            return false;
        }

        let local_counter = self.current_counter().unwrap_or(0);
        if !self.v_blocking_ahead_of(local_counter, ctx) {
            return false;
        }

        let mut counters = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            let counter = self.statement_counter(&envelope.statement);
            if counter > local_counter {
                counters.insert(counter);
            }
        }

        for counter in counters {
            if !self.v_blocking_ahead_of(counter, ctx) {
                return self.abandon_ballot(counter, ctx);
            }
        }

        false
    }

    /// Give up on the current counter and bump (to `counter`, or the
    /// next one when 0). Prefers the nomination composite as the value.
    pub(super) fn abandon_ballot<D: Driver>(
        &mut self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let value = self
            .composite_candidate
            .as_ref()
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| self.current_ballot.as_ref().map(|b| b.value.clone()));

        let Some(value) = value else {
            return false;
        };

        if counter == 0 {
            let next = self
                .current_ballot
                .as_ref()
                .map(|b| b.counter + 1)
                .unwrap_or(1);
            self.bump_state(ctx, value, next)
        } else {
            self.bump_state(ctx, value, counter)
        }
    }

    /// Raise `b` to `ballot` if it is ahead of the current one.
    fn raise_current_to(&mut self, ballot: &Ballot) -> bool {
        let behind = self
            .current_ballot
            .as_ref()
            .map(|current| current < ballot)
            .unwrap_or(true);
        if behind {
            return self.bump_to_ballot(ballot, true);
        }
        false
    }

    /// `bumpState` inner step: phase and commit-compatibility checks,
    /// then the actual move.
    pub(super) fn update_current_value(&mut self, ballot: &Ballot) -> bool {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return false;
        }

        let Some(current) = &self.current_ballot else {
            self.bump_to_ballot(ballot, true);
            return true;
        };

        if let Some(commit) = &self.commit {
            if !commit.compatible(ballot) {
                return false;
            }
        }

        if current < ballot {
            self.bump_to_ballot(ballot, true);
            true
        } else {
            false
        }
    }

    /// Move `b` to `ballot`. Clears `h`/`c` when the value switches
    /// and resets heard-from-quorum when the counter moves.
    pub(super) fn bump_to_ballot(&mut self, ballot: &Ballot, check: bool) -> bool {
        if check {
            if let Some(current) = &self.current_ballot {
                if ballot <= current {
                    return false;
                }
            }
        }

        let counter_moved = match &self.current_ballot {
            None => true,
            Some(current) => current.counter != ballot.counter,
        };

        self.current_ballot = Some(ballot.clone());
        self.value = Some(ballot.value.clone());

        // invariant: h (and therefore c) stays compatible with b
        if let Some(high) = &self.high_ballot {
            if !ballot.compatible(high) {
                self.high_ballot = None;
                self.commit = None;
            }
        }

        if counter_moved {
            self.heard_from_quorum = false;
        }
        true
    }

    /// Union of commit counters named by compatible statements; the
    /// search space for commit intervals.
    fn commit_boundaries(&self, ballot: &Ballot) -> BTreeSet<u32> {
        let mut boundaries = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            match &envelope.statement.pledges {
                Pledges::Prepare(prep) => {
                    if ballot.compatible(&prep.ballot) && prep.n_c != 0 {
                        boundaries.insert(prep.n_c);
                        boundaries.insert(prep.n_h);
                    }
                }
                Pledges::Confirm(conf) => {
                    if ballot.compatible(&conf.ballot) {
                        boundaries.insert(conf.n_commit);
                        boundaries.insert(conf.n_h);
                    }
                }
                Pledges::Externalize(ext) => {
                    if ballot.compatible(&ext.commit) {
                        boundaries.insert(ext.commit.counter);
                        boundaries.insert(ext.n_h);
                        boundaries.insert(u32::MAX);
                    }
                }
                Pledges::Nominate(_) => {}
            }
        }
        boundaries
    }

    /// Grow `[low, high]` downward over the boundary set while `pred`
    /// holds; the widest passing interval wins.
    fn extend_interval<F>(&self, candidate: &mut (u32, u32), boundaries: &BTreeSet<u32>, pred: F)
    where
        F: Fn((u32, u32)) -> bool,
    {
        for boundary in boundaries.iter().rev() {
            let probe = if candidate.0 == 0 {
                (*boundary, *boundary)
            } else if *boundary > candidate.1 {
                continue;
            } else {
                (*boundary, candidate.1)
            };

            if pred(probe) {
                *candidate = probe;
            } else if candidate.0 != 0 {
                break;
            }
        }
    }

    /// Record p := max(p, ballot), pushing the displaced prepared into
    /// p' when incompatible.
    fn set_prepared<D: Driver>(&mut self, ballot: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        let mut did_work = false;

        match &self.prepared {
            Some(current) => match (*current).cmp(&ballot) {
                std::cmp::Ordering::Less => {
                    if !current.compatible(&ballot) {
                        self.prepared_prime = Some(current.clone());
                    }
                    self.prepared = Some(ballot.clone());
                    did_work = true;
                }
                std::cmp::Ordering::Greater => {
                    // An older incompatible ballot can still improve p'.
                    let improves_prime = match &self.prepared_prime {
                        None => !current.compatible(&ballot),
                        Some(prime) => *prime < ballot && !current.compatible(&ballot),
                    };
                    if improves_prime {
                        self.prepared_prime = Some(ballot.clone());
                        did_work = true;
                    }
                }
                std::cmp::Ordering::Equal => {}
            },
            None => {
                self.prepared = Some(ballot.clone());
                did_work = true;
            }
        }

        if did_work {
            ctx.driver.accepted_ballot_prepared(ctx.slot_index, &ballot);
        }
        did_work
    }

    /// Recompute heard-from-quorum for the current counter and drive
    /// the host's ballot timer accordingly.
    pub(super) fn check_heard_from_quorum<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) {
        let Some(current) = self.current_ballot.clone() else {
            return;
        };

        let mut nodes = std::collections::HashSet::new();
        for (node_id, envelope) in &self.latest_envelopes {
            let at_or_above = match &envelope.statement.pledges {
                Pledges::Prepare(prep) => current.counter <= prep.ballot.counter,
                Pledges::Confirm(_) | Pledges::Externalize(_) => true,
                Pledges::Nominate(_) => false,
            };
            if at_or_above {
                nodes.insert(*node_id);
            }
        }

        let qsets = self.statement_quorum_sets(ctx);
        if is_quorum(ctx.local_quorum_set, &nodes, |node| qsets.get(node).cloned()) {
            let newly_heard = !self.heard_from_quorum;
            self.heard_from_quorum = true;
            if newly_heard {
                ctx.driver
                    .ballot_did_hear_from_quorum(ctx.slot_index, &current);
                if self.phase != BallotPhase::Externalize {
                    let timeout = ctx.driver.compute_timeout(current.counter, false);
                    ctx.driver
                        .setup_timer(ctx.slot_index, TimerKind::Ballot, timeout);
                }
            }
            if self.phase == BallotPhase::Externalize {
                ctx.driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
            }
        } else {
            self.heard_from_quorum = false;
            ctx.driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
        }
    }
}

/// The commit-range hint a statement carries, if any.
fn commit_hint_ballot(hint: &Statement) -> Option<Ballot> {
    match &hint.pledges {
        Pledges::Prepare(prep) => {
            if prep.n_c != 0 {
                Some(Ballot::new(prep.n_h, prep.ballot.value.clone()))
            } else {
                None
            }
        }
        Pledges::Confirm(conf) => Some(Ballot::new(conf.n_h, conf.ballot.value.clone())),
        Pledges::Externalize(ext) => Some(Ballot::new(ext.n_h, ext.commit.value.clone())),
        Pledges::Nominate(_) => None,
    }
}
