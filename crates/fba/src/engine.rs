//! Multi-slot consensus coordinator.
//!
//! [`Fba`] owns the slot map and is the host-facing surface of the
//! engine: nominate values, feed envelopes in, read decisions out.
//! Slots are created lazily on the first nomination or envelope for
//! their index and retained until purged (or evicted by the bounded
//! retention cap).
//!
//! The slot map sits behind a `RwLock` so hosts can share the engine
//! across threads, but the engine itself never spawns threads, never
//! blocks, and drives every callback inline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::Driver;
use crate::slot::Slot;
use crate::types::{Ballot, Envelope, NodeId, Pledges, QuorumSet, Statement, Value};
use crate::EnvelopeState;

/// Slots retained before the oldest are evicted.
const DEFAULT_MAX_SLOTS: usize = 100;

/// The consensus engine: a slot map plus the local identity.
///
/// * **Validators** (`is_validator = true`) vote and emit envelopes.
/// * **Watchers** only track the network's progress.
pub struct Fba<D: Driver> {
    local_node_id: NodeId,
    is_validator: bool,
    local_quorum_set: QuorumSet,
    slots: RwLock<HashMap<u64, Slot>>,
    driver: Arc<D>,
    max_slots: usize,
}

impl<D: Driver> Fba<D> {
    pub fn new(
        local_node_id: NodeId,
        is_validator: bool,
        local_quorum_set: QuorumSet,
        driver: Arc<D>,
    ) -> Self {
        Self {
            local_node_id,
            is_validator,
            local_quorum_set,
            slots: RwLock::new(HashMap::new()),
            driver,
            max_slots: DEFAULT_MAX_SLOTS,
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn is_validator(&self) -> bool {
        self.is_validator
    }

    pub fn local_quorum_set(&self) -> &QuorumSet {
        &self.local_quorum_set
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn active_slots(&self) -> Vec<u64> {
        self.slots.read().keys().copied().collect()
    }

    pub fn get_highest_known_slot(&self) -> Option<u64> {
        self.slots.read().keys().copied().max()
    }

    pub fn highest_externalized_slot(&self) -> Option<u64> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.is_externalized())
            .map(|(&index, _)| index)
            .max()
    }

    /// Feed an envelope from the network into the addressed slot.
    ///
    /// The signature is verified first; everything else is the slot's
    /// business.
    pub fn receive_envelope(&self, envelope: Envelope) -> EnvelopeState {
        if !self.driver.verify_envelope(&envelope) {
            tracing::warn!(
                node_id = ?envelope.statement.node_id,
                slot = envelope.statement.slot_index,
                "envelope signature verification failed"
            );
            return EnvelopeState::Invalid;
        }

        let slot_index = envelope.statement.slot_index;
        let mut slots = self.slots.write();
        let slot = self.slot_entry(&mut slots, slot_index);
        let result = slot.process_envelope(envelope, &self.driver);

        if slots.len() > self.max_slots {
            Self::evict_oldest(&mut slots, self.max_slots);
        }

        result
    }

    /// Start nominating `value` for a slot.
    ///
    /// `prev_value` seeds the leader election hashes; it is the value
    /// externalized by the previous slot.
    pub fn nominate(&self, slot_index: u64, value: Value, prev_value: &Value) -> bool {
        if !self.is_validator {
            return false;
        }
        let mut slots = self.slots.write();
        let slot = self.slot_entry(&mut slots, slot_index);
        slot.nominate(value, prev_value, false, &self.driver)
    }

    /// Nomination round timer expired: escalate to the next round.
    pub fn nominate_timeout(&self, slot_index: u64, value: Value, prev_value: &Value) -> bool {
        if !self.is_validator {
            return false;
        }
        match self.slots.write().get_mut(&slot_index) {
            Some(slot) => slot.nominate(value, prev_value, true, &self.driver),
            None => false,
        }
    }

    /// Stop nominating for a slot.
    pub fn stop_nomination(&self, slot_index: u64) {
        if let Some(slot) = self.slots.write().get_mut(&slot_index) {
            slot.stop_nomination(&self.driver);
        }
    }

    /// Ballot timer expired: bump the counter to regain liveness.
    pub fn ballot_timer_expired(&self, slot_index: u64) -> bool {
        match self.slots.write().get_mut(&slot_index) {
            Some(slot) => slot.bump_ballot_on_timeout(&self.driver),
            None => false,
        }
    }

    /// Move a slot's ballot to `(counter, value)` (ops/test backdoor).
    pub fn bump_state(&self, slot_index: u64, value: Value, counter: u32) -> bool {
        let mut slots = self.slots.write();
        let slot = self.slot_entry(&mut slots, slot_index);
        slot.bump_state(&self.driver, value, counter)
    }

    /// Bump with an auto-computed counter.
    pub fn force_bump_state(&self, slot_index: u64, value: Value) -> bool {
        let mut slots = self.slots.write();
        let slot = self.slot_entry(&mut slots, slot_index);
        slot.force_bump_state(&self.driver, value)
    }

    /// Abandon a slot's current ballot (0 auto-increments).
    pub fn abandon_ballot(&self, slot_index: u64, counter: u32) -> bool {
        match self.slots.write().get_mut(&slot_index) {
            Some(slot) => slot.abandon_ballot(&self.driver, counter),
            None => false,
        }
    }

    pub fn get_externalized_value(&self, slot_index: u64) -> Option<Value> {
        self.slots
            .read()
            .get(&slot_index)
            .and_then(|slot| slot.get_externalized_value().cloned())
    }

    pub fn is_slot_externalized(&self, slot_index: u64) -> bool {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.is_externalized())
            .unwrap_or(false)
    }

    pub fn is_slot_fully_validated(&self, slot_index: u64) -> bool {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.is_fully_validated())
            .unwrap_or(false)
    }

    /// Current working ballot of a slot, if any.
    pub fn get_current_ballot(&self, slot_index: u64) -> Option<Ballot> {
        self.slots
            .read()
            .get(&slot_index)
            .and_then(|slot| slot.ballot().current_ballot().cloned())
    }

    /// Latest composite candidate produced by a slot's nomination.
    pub fn get_latest_composite_candidate(&self, slot_index: u64) -> Option<Value> {
        self.slots
            .read()
            .get(&slot_index)
            .and_then(|slot| slot.get_latest_composite_candidate())
    }

    pub fn get_nomination_leaders(&self, slot_index: u64) -> HashSet<NodeId> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_nomination_leaders())
            .unwrap_or_default()
    }

    /// Whether a v-blocking set of peers has spoken for a slot.
    pub fn got_v_blocking(&self, slot_index: u64) -> bool {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.got_v_blocking())
            .unwrap_or(false)
    }

    /// Whether `statement` would advance our view of its sender.
    pub fn is_newer_statement(&self, slot_index: u64, statement: &Statement) -> bool {
        match self.slots.read().get(&slot_index) {
            None => true,
            Some(slot) => match &statement.pledges {
                Pledges::Nominate(_) => slot
                    .nomination()
                    .is_newer_statement(&statement.node_id, statement),
                _ => slot
                    .ballot()
                    .is_newer_statement(&statement.node_id, statement),
            },
        }
    }

    /// Latest self-envelopes safe to hand to peers for one slot.
    pub fn get_latest_messages_send(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_latest_messages_send())
            .unwrap_or_default()
    }

    /// Latest envelopes for every slot at or above `from_slot`, in
    /// slot then node order. Used to answer peer state requests.
    pub fn get_state_from(&self, from_slot: u64) -> Vec<Envelope> {
        let slots = self.slots.read();
        let mut indices: Vec<_> = slots.keys().copied().filter(|s| *s >= from_slot).collect();
        indices.sort_unstable();

        let mut envelopes = Vec::new();
        for slot_index in indices {
            if let Some(slot) = slots.get(&slot_index) {
                slot.process_current_state(
                    |envelope| {
                        envelopes.push(envelope.clone());
                        true
                    },
                    false,
                );
            }
        }
        envelopes
    }

    /// Every latest envelope for a slot, self included even when not
    /// fully validated.
    pub fn get_entire_current_state(&self, slot_index: u64) -> Vec<Envelope> {
        let slots = self.slots.read();
        let mut envelopes = Vec::new();
        if let Some(slot) = slots.get(&slot_index) {
            slot.process_current_state(
                |envelope| {
                    envelopes.push(envelope.clone());
                    true
                },
                true,
            );
        }
        envelopes
    }

    /// Envelopes witnessing an externalized slot's decision.
    pub fn get_externalizing_state(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_externalizing_state())
            .unwrap_or_default()
    }

    pub fn get_slot_envelopes(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| {
                slot.get_envelopes()
                    .values()
                    .flat_map(|envs| envs.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_cumulative_statement_count(&self) -> usize {
        self.slots
            .read()
            .values()
            .map(|slot| slot.get_statement_count())
            .sum()
    }

    /// Restore a slot from a persisted self-envelope.
    pub fn set_state_from_envelope(&self, envelope: &Envelope) -> bool {
        let slot_index = envelope.statement.slot_index;
        let mut slots = self.slots.write();
        let slot = self.slot_entry(&mut slots, slot_index);
        slot.set_state_from_envelope(envelope)
    }

    /// Drop slots below `below_index`, keeping `keep` if named.
    pub fn purge_slots(&self, below_index: u64, keep: Option<u64>) {
        self.slots
            .write()
            .retain(|&index, _| index >= below_index || keep == Some(index));
    }

    /// Summary of one slot's progress.
    pub fn get_slot_summary(&self, slot_index: u64) -> Option<SlotSummary> {
        self.slots.read().get(&slot_index).map(|slot| SlotSummary {
            slot_index,
            is_externalized: slot.is_externalized(),
            is_nominating: slot.is_nominating(),
            heard_from_quorum: slot.heard_from_quorum(),
            ballot_phase: slot.ballot_phase(),
            nomination_round: slot.nomination().round(),
            ballot_counter: slot.ballot_counter(),
        })
    }

    /// Observability snapshot of one slot.
    pub fn get_info(&self, slot_index: u64) -> Option<crate::info::SlotInfo> {
        self.slots.read().get(&slot_index).map(|slot| slot.get_info())
    }

    /// Per-node quorum participation for one slot.
    pub fn get_quorum_info(&self, slot_index: u64) -> Option<crate::info::QuorumInfo> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_quorum_info())
    }

    /// Snapshots of every tracked slot, ascending.
    pub fn get_all_slot_info(&self) -> Vec<crate::info::SlotInfo> {
        let slots = self.slots.read();
        let mut infos: Vec<_> = slots.values().map(|slot| slot.get_info()).collect();
        infos.sort_by_key(|info| info.slot_index);
        infos
    }

    fn slot_entry<'a>(&self, slots: &'a mut HashMap<u64, Slot>, slot_index: u64) -> &'a mut Slot {
        slots.entry(slot_index).or_insert_with(|| {
            Slot::new(
                slot_index,
                self.local_node_id,
                self.local_quorum_set.clone(),
                self.is_validator,
            )
        })
    }

    fn evict_oldest(slots: &mut HashMap<u64, Slot>, max_slots: usize) {
        if slots.len() <= max_slots {
            return;
        }
        let mut indices: Vec<_> = slots.keys().copied().collect();
        indices.sort_unstable();
        let excess = indices.len() - max_slots;
        for index in indices.into_iter().take(excess) {
            slots.remove(&index);
        }
    }
}

/// Snapshot of a slot's key progress indicators.
#[derive(Debug, Clone)]
pub struct SlotSummary {
    pub slot_index: u64,
    pub is_externalized: bool,
    pub is_nominating: bool,
    pub heard_from_quorum: bool,
    pub ballot_phase: crate::ballot::BallotPhase,
    pub nomination_round: u32,
    pub ballot_counter: Option<u32>,
}
