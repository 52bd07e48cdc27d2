use super::*;
use crate::driver::ValidationLevel;
use crate::info::PeerState;
use crate::quorum::{hash_quorum_set, simple_quorum_set};
use crate::types::{Ballot, Confirm, Nominate, Prepare, Statement};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

struct TestDriver {
    quorum_set: QuorumSet,
    validation: ValidationLevel,
    emit_count: AtomicU32,
    externalized: Mutex<Vec<(u64, Value)>>,
    timers_set: AtomicU32,
    timers_stopped: AtomicU32,
}

impl TestDriver {
    fn new(quorum_set: QuorumSet) -> Self {
        Self::with_validation(quorum_set, ValidationLevel::FullyValidated)
    }

    fn with_validation(quorum_set: QuorumSet, validation: ValidationLevel) -> Self {
        Self {
            quorum_set,
            validation,
            emit_count: AtomicU32::new(0),
            externalized: Mutex::new(Vec::new()),
            timers_set: AtomicU32::new(0),
            timers_stopped: AtomicU32::new(0),
        }
    }

    fn externalized(&self) -> Vec<(u64, Value)> {
        self.externalized.lock().unwrap().clone()
    }
}

impl Driver for TestDriver {
    fn validate_value(&self, _slot: u64, _value: &Value, _nomination: bool) -> ValidationLevel {
        self.validation
    }

    fn combine_candidates(&self, _slot: u64, candidates: &[Value]) -> Option<Value> {
        candidates.first().cloned()
    }

    fn extract_valid_value(&self, _slot: u64, value: &Value) -> Option<Value> {
        Some(value.clone())
    }

    fn emit_envelope(&self, _envelope: &Envelope) {
        self.emit_count.fetch_add(1, Ordering::SeqCst);
    }

    fn get_quorum_set(&self, _node_id: &NodeId) -> Option<QuorumSet> {
        Some(self.quorum_set.clone())
    }

    fn sign_envelope(&self, _envelope: &mut Envelope) {}

    fn verify_envelope(&self, _envelope: &Envelope) -> bool {
        true
    }

    fn value_externalized(&self, slot: u64, value: &Value) {
        self.externalized.lock().unwrap().push((slot, value.clone()));
    }

    fn setup_timer(&self, _slot: u64, _kind: TimerKind, _timeout: std::time::Duration) {
        self.timers_set.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_timer(&self, _slot: u64, _kind: TimerKind) {
        self.timers_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

fn node(seed: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    NodeId(bytes)
}

fn value(byte: u8) -> Value {
    Value::new(vec![byte])
}

fn make_nomination(node_id: NodeId, slot: u64, qset: &QuorumSet, votes: &[Value]) -> Envelope {
    Envelope::unsigned(Statement {
        node_id,
        slot_index: slot,
        pledges: Pledges::Nominate(Nominate {
            quorum_set_hash: hash_quorum_set(qset),
            votes: votes.to_vec(),
            accepted: vec![],
        }),
    })
}

fn make_prepare(node_id: NodeId, slot: u64, qset: &QuorumSet, ballot: Ballot) -> Envelope {
    Envelope::unsigned(Statement {
        node_id,
        slot_index: slot,
        pledges: Pledges::Prepare(Prepare {
            quorum_set_hash: hash_quorum_set(qset),
            ballot,
            prepared: None,
            prepared_prime: None,
            n_c: 0,
            n_h: 0,
        }),
    })
}

fn make_confirm(node_id: NodeId, slot: u64, qset: &QuorumSet, ballot: Ballot) -> Envelope {
    let counter = ballot.counter;
    Envelope::unsigned(Statement {
        node_id,
        slot_index: slot,
        pledges: Pledges::Confirm(Confirm {
            ballot,
            n_prepared: counter,
            n_commit: counter,
            n_h: counter,
            quorum_set_hash: hash_quorum_set(qset),
        }),
    })
}

#[test]
fn new_slot_is_idle() {
    let v0 = node(0);
    let qset = simple_quorum_set(1, vec![v0]);
    let slot = Slot::new(7, v0, qset, true);

    assert_eq!(slot.slot_index(), 7);
    assert!(!slot.is_externalized());
    assert!(!slot.is_nominating());
    assert!(slot.is_fully_validated());
    assert!(slot.get_latest_composite_candidate().is_none());
}

#[test]
fn single_validator_externalizes_its_own_nomination() {
    // a 1-of-1 network is its own quorum: nomination confirms the
    // candidate, hands off to ballot, and the cascade runs straight
    // through to EXTERNALIZE
    let v0 = node(0);
    let qset = simple_quorum_set(1, vec![v0]);
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, v0, qset, true);

    assert!(slot.nominate(value(1), &value(0), false, &driver));

    assert_eq!(slot.get_latest_composite_candidate(), Some(value(1)));
    assert!(slot.is_externalized());
    assert_eq!(slot.get_externalized_value(), Some(&value(1)));
    assert_eq!(driver.externalized(), vec![(0, value(1))]);
    assert_eq!(slot.ballot_phase(), crate::ballot::BallotPhase::Externalize);

    // once decided, further nominations are refused
    assert!(!slot.nominate(value(2), &value(0), false, &driver));
    assert_eq!(driver.externalized().len(), 1);
}

#[test]
fn watcher_does_not_nominate() {
    let v0 = node(0);
    let v1 = node(1);
    let qset = simple_quorum_set(2, vec![v0, v1]);
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, v0, qset, false);

    assert!(!slot.nominate(value(1), &value(0), false, &driver));
    assert_eq!(driver.emit_count.load(Ordering::SeqCst), 0);
}

#[test]
fn envelopes_route_by_statement_type() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    let nom = make_nomination(nodes[1], 0, &qset, &[value(1)]);
    assert!(slot.process_envelope(nom, &driver).is_valid());
    assert!(slot.nomination().latest_nomination(&nodes[1]).is_some());
    assert!(slot.ballot().latest_envelope(&nodes[1]).is_none());
    assert_eq!(slot.node_state(&nodes[1]), PeerState::Nominating);

    let prep = make_prepare(nodes[2], 0, &qset, Ballot::new(1, value(1)));
    assert!(slot.process_envelope(prep, &driver).is_valid());
    assert!(slot.ballot().latest_envelope(&nodes[2]).is_some());
    assert_eq!(slot.node_state(&nodes[2]), PeerState::Preparing);

    // ballot statements shadow nominations for the same node
    let prep1 = make_prepare(nodes[1], 0, &qset, Ballot::new(1, value(1)));
    assert!(slot.process_envelope(prep1, &driver).is_valid());
    assert_eq!(slot.node_state(&nodes[1]), PeerState::Preparing);

    assert_eq!(slot.get_statement_count(), 3);
    assert_eq!(slot.get_nodes_heard_from().len(), 2);
}

#[test]
fn v_blocking_participation_is_latched() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    assert!(!slot.got_v_blocking());

    // blocking size for 3-of-4 is 2
    let env = make_nomination(nodes[1], 0, &qset, &[value(1)]);
    slot.process_envelope(env, &driver);
    assert!(!slot.got_v_blocking());

    let env = make_nomination(nodes[2], 0, &qset, &[value(1)]);
    slot.process_envelope(env, &driver);
    assert!(slot.got_v_blocking());
}

#[test]
fn maybe_valid_values_suppress_emission() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::with_validation(
        qset.clone(),
        ValidationLevel::MaybeValid,
    ));
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    let prep = make_prepare(nodes[1], 0, &qset, Ballot::new(1, value(1)));
    assert!(slot.process_envelope(prep, &driver).is_valid());
    assert!(!slot.is_fully_validated());

    slot.nominate(value(1), &value(0), false, &driver);
    assert_eq!(driver.emit_count.load(Ordering::SeqCst), 0);
    assert!(slot.get_latest_messages_send().is_empty());
}

#[test]
fn insane_ballot_statement_is_dropped() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    // peers may not use the null ballot counter
    let insane = make_prepare(nodes[1], 0, &qset, Ballot::new(0, value(1)));
    assert_eq!(
        slot.process_envelope(insane, &driver),
        EnvelopeState::Invalid
    );
    assert_eq!(slot.get_statement_count(), 0);
    assert!(slot.ballot().latest_envelope(&nodes[1]).is_none());
}

#[test]
fn nomination_timer_armed_while_hunting_candidates() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset, true);

    slot.nominate(value(1), &value(0), false, &driver);
    assert!(slot.is_nominating());
    assert!(driver.timers_set.load(Ordering::SeqCst) >= 1);
}

#[test]
fn bump_state_drives_ballot_directly() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset, true);

    assert!(slot.bump_state(&driver, value(1), 3));
    assert_eq!(slot.ballot_counter(), Some(3));

    assert!(slot.force_bump_state(&driver, value(1)));
    assert_eq!(slot.ballot_counter(), Some(4));

    assert!(slot.abandon_ballot(&driver, 0));
    assert_eq!(slot.ballot_counter(), Some(5));

    assert!(slot.abandon_ballot(&driver, 9));
    assert_eq!(slot.ballot_counter(), Some(9));
}

#[test]
fn externalize_notifies_once_and_stops_timers() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    let ballot = Ballot::new(1, value(1));
    assert!(slot.bump_state(&driver, value(1), 1));

    // 3-of-4: two confirming peers plus self ratify the commit
    let env = make_confirm(nodes[1], 0, &qset, ballot.clone());
    slot.process_envelope(env, &driver);
    let env = make_confirm(nodes[2], 0, &qset, ballot.clone());
    slot.process_envelope(env, &driver);

    assert!(slot.is_externalized());
    assert_eq!(driver.externalized(), vec![(0, value(1))]);
    assert!(driver.timers_stopped.load(Ordering::SeqCst) >= 2);
    assert!(!slot.is_nominating());

    // replays do not re-notify
    let env = make_confirm(nodes[3], 0, &qset, ballot);
    slot.process_envelope(env, &driver);
    assert_eq!(driver.externalized().len(), 1);
}

#[test]
fn restore_rejects_foreign_envelopes() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    // wrong node
    let foreign = make_nomination(nodes[1], 0, &qset, &[value(1)]);
    assert!(!slot.set_state_from_envelope(&foreign));

    // wrong slot
    let wrong_slot = make_nomination(nodes[0], 3, &qset, &[value(1)]);
    assert!(!slot.set_state_from_envelope(&wrong_slot));

    // matching self-envelope restores
    let own = make_nomination(nodes[0], 0, &qset, &[value(1)]);
    assert!(slot.set_state_from_envelope(&own));
    assert_eq!(slot.nomination().votes().len(), 1);
}

#[test]
fn restore_of_externalize_marks_slot_decided() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    let envelope = Envelope::unsigned(Statement {
        node_id: nodes[0],
        slot_index: 0,
        pledges: Pledges::Externalize(crate::types::Externalize {
            commit: Ballot::new(2, value(1)),
            n_h: 2,
            commit_quorum_set_hash: hash_quorum_set(&qset),
        }),
    });

    assert!(slot.set_state_from_envelope(&envelope));
    assert!(slot.is_externalized());
    assert_eq!(slot.get_externalized_value(), Some(&value(1)));
}

#[test]
fn slot_info_tracks_phase() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset, true);

    assert_eq!(slot.get_info().phase, "IDLE");

    slot.nominate(value(1), &value(0), false, &driver);
    assert_eq!(slot.get_info().phase, "NOMINATION");

    slot.bump_state(&driver, value(1), 1);
    assert_eq!(slot.get_info().phase, "BALLOT");
}

#[test]
fn quorum_info_reports_participation() {
    let nodes: Vec<NodeId> = (0..4).map(node).collect();
    let qset = simple_quorum_set(3, nodes.clone());
    let driver = Arc::new(TestDriver::new(qset.clone()));
    let mut slot = Slot::new(0, nodes[0], qset.clone(), true);

    let env = make_prepare(nodes[1], 0, &qset, Ballot::new(2, value(1)));
    slot.process_envelope(env, &driver);

    let info = slot.get_quorum_info();
    assert_eq!(info.nodes.len(), 4);
    assert!(!info.quorum_reached);
    let row = &info.nodes[&crate::format::node_id_to_str(&nodes[1])];
    assert_eq!(row.state, "PREPARING");
    assert_eq!(row.ballot_counter, Some(2));
}
