//! What each statement shape implies: which ballots a peer votes to
//! prepare or commit, which it has accepted, and how statements from
//! one node are ordered. This table is the heart of the protocol and
//! follows the federated voting rules exactly.

use super::*;
use crate::quorum::{check_sanity, is_blocking_set, is_quorum, singleton_quorum_set};
use crate::types::QuorumSet;
use pact_common::Hash256;

impl BallotProtocol {
    /// Whether `statement` strictly dominates the stored statement for
    /// its node. Statements never regress: EXTERNALIZE > CONFIRM >
    /// PREPARE, then each type's own field order.
    pub fn is_newer_statement(&self, node_id: &NodeId, statement: &Statement) -> bool {
        match self.latest_envelopes.get(node_id) {
            None => true,
            Some(existing) => is_newer_ballot_statement(&existing.statement, statement),
        }
    }

    /// Structural sanity of a ballot statement, including quorum set
    /// resolution. Anything failing here is dropped without touching
    /// state.
    pub(crate) fn is_statement_sane<D: Driver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let Some(quorum_set) = self.statement_quorum_set(statement, ctx) else {
            tracing::trace!(node_id = ?statement.node_id, "unresolvable quorum set hash");
            return false;
        };
        if check_sanity(&quorum_set, false).is_err() {
            return false;
        }

        match &statement.pledges {
            Pledges::Prepare(prep) => {
                let is_self = statement.node_id == *ctx.local_node_id;
                // Peers never send the null working ballot.
                if !is_self && prep.ballot.counter == 0 {
                    return false;
                }

                if let (Some(prepared), Some(prepared_prime)) =
                    (&prep.prepared, &prep.prepared_prime)
                {
                    if prepared_prime >= prepared || prepared_prime.compatible(prepared) {
                        return false;
                    }
                }

                if prep.n_h != 0 {
                    match &prep.prepared {
                        Some(prepared) => {
                            if prep.n_h > prepared.counter {
                                return false;
                            }
                        }
                        None => return false,
                    }
                }

                // c != 0 requires 0 < c <= h <= b
                if prep.n_c != 0
                    && (prep.n_h == 0 || prep.ballot.counter < prep.n_h || prep.n_h < prep.n_c)
                {
                    return false;
                }

                true
            }
            Pledges::Confirm(conf) => {
                conf.ballot.counter > 0
                    && conf.n_h <= conf.ballot.counter
                    && conf.n_commit <= conf.n_h
            }
            Pledges::Externalize(ext) => ext.commit.counter > 0 && ext.n_h >= ext.commit.counter,
            Pledges::Nominate(_) => false,
        }
    }

    /// Validate every value carried by the statement through the host.
    pub(crate) fn validate_statement_values<D: Driver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> ValidationLevel {
        let values = statement.values();
        if values.is_empty() {
            return ValidationLevel::Invalid;
        }

        let mut level = ValidationLevel::FullyValidated;
        for value in values {
            match ctx.driver.validate_value(ctx.slot_index, &value, false) {
                ValidationLevel::Invalid => return ValidationLevel::Invalid,
                ValidationLevel::MaybeValid => level = ValidationLevel::MaybeValid,
                ValidationLevel::FullyValidated => {}
            }
        }
        level
    }

    /// Resolve the quorum set a statement pledges against.
    ///
    /// An externalizing node is its own singleton: its decision no
    /// longer depends on anyone. Other statements resolve their hash
    /// through the local set or the driver.
    pub(super) fn statement_quorum_set<D: Driver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> Option<QuorumSet> {
        match &statement.pledges {
            Pledges::Externalize(_) => Some(singleton_quorum_set(statement.node_id)),
            Pledges::Prepare(_) | Pledges::Confirm(_) => {
                let provided = statement.pledges.quorum_set_hash();
                self.resolve_quorum_set(&provided, &statement.node_id, ctx)
            }
            Pledges::Nominate(_) => None,
        }
    }

    fn resolve_quorum_set<D: Driver>(
        &self,
        provided: &Hash256,
        node_id: &NodeId,
        ctx: &SlotContext<'_, D>,
    ) -> Option<QuorumSet> {
        if node_id == ctx.local_node_id
            && ctx.driver.hash_quorum_set(ctx.local_quorum_set) == *provided
        {
            return Some(ctx.local_quorum_set.clone());
        }
        if let Some(qset) = ctx.driver.get_quorum_set_by_hash(provided) {
            return Some(qset);
        }
        ctx.driver.get_quorum_set(node_id).and_then(|qset| {
            if ctx.driver.hash_quorum_set(&qset) == *provided {
                Some(qset)
            } else {
                None
            }
        })
    }

    /// Quorum sets of every node we have a statement from, plus self.
    pub(super) fn statement_quorum_sets<D: Driver>(
        &self,
        ctx: &SlotContext<'_, D>,
    ) -> HashMap<NodeId, QuorumSet> {
        let mut map = HashMap::new();
        for (node_id, envelope) in &self.latest_envelopes {
            if let Some(qset) = self.statement_quorum_set(&envelope.statement, ctx) {
                map.insert(*node_id, qset);
            }
        }
        map.entry(*ctx.local_node_id)
            .or_insert_with(|| ctx.local_quorum_set.clone());
        map
    }

    /// Ballots worth testing for accept-prepared, extracted from the
    /// hint statement and every stored statement, ascending.
    pub(super) fn prepare_candidates(&self, hint: &Statement) -> Vec<Ballot> {
        let mut top_votes: Vec<Ballot> = hint_ballots(hint);
        top_votes.sort();

        let mut candidates = std::collections::BTreeSet::new();
        for top in top_votes.iter().rev() {
            for envelope in self.latest_envelopes.values() {
                match &envelope.statement.pledges {
                    Pledges::Prepare(prep) => {
                        if less_and_compatible(&prep.ballot, top) {
                            candidates.insert(prep.ballot.clone());
                        }
                        for prepared in [&prep.prepared, &prep.prepared_prime].into_iter().flatten()
                        {
                            if less_and_compatible(prepared, top) {
                                candidates.insert(prepared.clone());
                            }
                        }
                    }
                    Pledges::Confirm(conf) => {
                        if top.compatible(&conf.ballot) {
                            candidates.insert(top.clone());
                            if conf.n_prepared < top.counter {
                                candidates
                                    .insert(Ballot::new(conf.n_prepared, top.value.clone()));
                            }
                        }
                    }
                    Pledges::Externalize(ext) => {
                        if top.compatible(&ext.commit) {
                            candidates.insert(top.clone());
                        }
                    }
                    Pledges::Nominate(_) => {}
                }
            }
        }

        candidates.into_iter().collect()
    }

    /// Does `statement` vote to prepare `ballot` (or a compatible
    /// extension of it)?
    pub(super) fn votes_to_prepare(&self, ballot: &Ballot, statement: &Statement) -> bool {
        match &statement.pledges {
            Pledges::Prepare(prep) => less_and_compatible(ballot, &prep.ballot),
            Pledges::Confirm(conf) => ballot.compatible(&conf.ballot),
            Pledges::Externalize(ext) => ballot.compatible(&ext.commit),
            Pledges::Nominate(_) => false,
        }
    }

    /// Has `statement` accepted `ballot` as prepared?
    pub(super) fn accepts_prepared(&self, ballot: &Ballot, statement: &Statement) -> bool {
        match &statement.pledges {
            Pledges::Prepare(prep) => {
                prep.prepared
                    .as_ref()
                    .map(|p| less_and_compatible(ballot, p))
                    .unwrap_or(false)
                    || prep
                        .prepared_prime
                        .as_ref()
                        .map(|p| less_and_compatible(ballot, p))
                        .unwrap_or(false)
            }
            Pledges::Confirm(conf) => {
                let prepared = Ballot::new(conf.n_prepared, conf.ballot.value.clone());
                less_and_compatible(ballot, &prepared)
            }
            Pledges::Externalize(ext) => ballot.compatible(&ext.commit),
            Pledges::Nominate(_) => false,
        }
    }

    /// Does `statement` vote to commit `ballot` over `interval`?
    pub(super) fn votes_to_commit(
        &self,
        ballot: &Ballot,
        interval: (u32, u32),
        statement: &Statement,
    ) -> bool {
        match &statement.pledges {
            Pledges::Prepare(prep) => {
                ballot.compatible(&prep.ballot)
                    && prep.n_c != 0
                    && prep.n_c <= interval.0
                    && interval.1 <= prep.n_h
            }
            Pledges::Confirm(conf) => {
                ballot.compatible(&conf.ballot) && conf.n_commit <= interval.0
            }
            Pledges::Externalize(ext) => {
                ballot.compatible(&ext.commit) && ext.commit.counter <= interval.0
            }
            Pledges::Nominate(_) => false,
        }
    }

    /// Has `statement` accepted `ballot` committed over `interval`?
    pub(super) fn accepts_commit(
        &self,
        ballot: &Ballot,
        interval: (u32, u32),
        statement: &Statement,
    ) -> bool {
        match &statement.pledges {
            Pledges::Confirm(conf) => {
                ballot.compatible(&conf.ballot)
                    && conf.n_commit <= interval.0
                    && interval.1 <= conf.n_h
            }
            Pledges::Externalize(ext) => {
                ballot.compatible(&ext.commit) && ext.commit.counter <= interval.0
            }
            Pledges::Prepare(_) | Pledges::Nominate(_) => false,
        }
    }

    /// The counter a statement is working at; externalizers sit at the
    /// infinite counter.
    pub(super) fn statement_counter(&self, statement: &Statement) -> u32 {
        match &statement.pledges {
            Pledges::Prepare(prep) => prep.ballot.counter,
            Pledges::Confirm(conf) => conf.ballot.counter,
            Pledges::Externalize(_) => u32::MAX,
            Pledges::Nominate(_) => 0,
        }
    }

    /// Is a v-blocking set of peers working strictly above `counter`?
    pub(super) fn v_blocking_ahead_of<D: Driver>(
        &self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let mut ahead = std::collections::HashSet::new();
        for (node_id, envelope) in &self.latest_envelopes {
            if self.statement_counter(&envelope.statement) > counter {
                ahead.insert(*node_id);
            }
        }
        is_blocking_set(ctx.local_quorum_set, &ahead)
    }

    /// Federated accept: a v-blocking set accepted, or a quorum voted
    /// or accepted.
    pub(super) fn federated_accept<D: Driver, V, A>(
        &self,
        voted: V,
        accepted: A,
        ctx: &SlotContext<'_, D>,
    ) -> bool
    where
        V: Fn(&Statement) -> bool,
        A: Fn(&Statement) -> bool,
    {
        let mut accepting = std::collections::HashSet::new();
        let mut supporting = std::collections::HashSet::new();
        for (node_id, envelope) in &self.latest_envelopes {
            if accepted(&envelope.statement) {
                accepting.insert(*node_id);
                supporting.insert(*node_id);
            } else if voted(&envelope.statement) {
                supporting.insert(*node_id);
            }
        }

        if is_blocking_set(ctx.local_quorum_set, &accepting) {
            return true;
        }

        let qsets = self.statement_quorum_sets(ctx);
        is_quorum(ctx.local_quorum_set, &supporting, |node| {
            qsets.get(node).cloned()
        })
    }

    /// Federated ratify: a quorum satisfies the predicate.
    pub(super) fn federated_ratify<D: Driver, V>(&self, voted: V, ctx: &SlotContext<'_, D>) -> bool
    where
        V: Fn(&Statement) -> bool,
    {
        let mut supporting = std::collections::HashSet::new();
        for (node_id, envelope) in &self.latest_envelopes {
            if voted(&envelope.statement) {
                supporting.insert(*node_id);
            }
        }

        let qsets = self.statement_quorum_sets(ctx);
        is_quorum(ctx.local_quorum_set, &supporting, |node| {
            qsets.get(node).cloned()
        })
    }
}

/// Ballots named by a statement, used to seed prepare-candidate
/// collection.
pub(super) fn hint_ballots(hint: &Statement) -> Vec<Ballot> {
    let mut ballots = Vec::new();
    match &hint.pledges {
        Pledges::Prepare(prep) => {
            ballots.push(prep.ballot.clone());
            if let Some(prepared) = &prep.prepared {
                ballots.push(prepared.clone());
            }
            if let Some(prepared_prime) = &prep.prepared_prime {
                ballots.push(prepared_prime.clone());
            }
        }
        Pledges::Confirm(conf) => {
            ballots.push(Ballot::new(conf.n_prepared, conf.ballot.value.clone()));
            ballots.push(Ballot::new(u32::MAX, conf.ballot.value.clone()));
        }
        Pledges::Externalize(ext) => {
            ballots.push(Ballot::new(u32::MAX, ext.commit.value.clone()));
        }
        Pledges::Nominate(_) => {}
    }
    ballots
}

/// The ballot a statement is actively working on: PREPARE's working
/// ballot, CONFIRM's commit-low, EXTERNALIZE at the infinite counter.
pub fn working_ballot(statement: &Statement) -> Option<Ballot> {
    match &statement.pledges {
        Pledges::Prepare(prep) => Some(prep.ballot.clone()),
        Pledges::Confirm(conf) => Some(Ballot::new(conf.n_commit, conf.ballot.value.clone())),
        Pledges::Externalize(ext) => Some(Ballot::new(u32::MAX, ext.commit.value.clone())),
        Pledges::Nominate(_) => None,
    }
}

/// `a <= b` and same value.
pub(super) fn less_and_compatible(a: &Ballot, b: &Ballot) -> bool {
    a <= b && a.compatible(b)
}

/// `a <= b` and different values.
pub(super) fn less_and_incompatible(a: &Ballot, b: &Ballot) -> bool {
    a <= b && !a.compatible(b)
}

/// Ordering on statements from one node: type rank first, then the
/// type's natural field order.
pub(super) fn is_newer_ballot_statement(old: &Statement, new: &Statement) -> bool {
    let rank = |pledges: &Pledges| -> u8 {
        match pledges {
            Pledges::Nominate(_) => 0,
            Pledges::Prepare(_) => 1,
            Pledges::Confirm(_) => 2,
            Pledges::Externalize(_) => 3,
        }
    };

    let old_rank = rank(&old.pledges);
    let new_rank = rank(&new.pledges);
    if old_rank != new_rank {
        return new_rank > old_rank;
    }

    match (&old.pledges, &new.pledges) {
        (Pledges::Externalize(_), Pledges::Externalize(_)) => false,
        (Pledges::Confirm(old_c), Pledges::Confirm(new_c)) => {
            match old_c.ballot.cmp(&new_c.ballot) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => {
                    if old_c.n_prepared == new_c.n_prepared {
                        old_c.n_h < new_c.n_h
                    } else {
                        old_c.n_prepared < new_c.n_prepared
                    }
                }
            }
        }
        (Pledges::Prepare(old_p), Pledges::Prepare(new_p)) => {
            match old_p.ballot.cmp(&new_p.ballot) {
                std::cmp::Ordering::Less => return true,
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal => {}
            }
            match old_p.prepared.cmp(&new_p.prepared) {
                std::cmp::Ordering::Less => return true,
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal => {}
            }
            match old_p.prepared_prime.cmp(&new_p.prepared_prime) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => old_p.n_h < new_p.n_h,
            }
        }
        _ => false,
    }
}
