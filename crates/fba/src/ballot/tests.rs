use super::*;
use crate::driver::Driver;
use crate::quorum::{hash_quorum_set, simple_quorum_set};
use crate::types::{Nominate, QuorumSet};
use crate::SlotContext;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

macro_rules! ctx {
    ($node:expr, $qs:expr, $driver:expr, $slot:expr) => {
        SlotContext {
            local_node_id: $node,
            local_quorum_set: $qs,
            driver: $driver,
            slot_index: $slot,
        }
    };
}

struct MockDriver {
    quorum_set: QuorumSet,
    emit_count: AtomicU32,
    emitted: Mutex<Vec<Envelope>>,
    externalized: Mutex<Vec<(u64, Value)>>,
    heard_from_quorum: AtomicU32,
}

impl MockDriver {
    fn new(quorum_set: QuorumSet) -> Self {
        Self {
            quorum_set,
            emit_count: AtomicU32::new(0),
            emitted: Mutex::new(Vec::new()),
            externalized: Mutex::new(Vec::new()),
            heard_from_quorum: AtomicU32::new(0),
        }
    }

    fn emits(&self) -> u32 {
        self.emit_count.load(Ordering::SeqCst)
    }

    fn externalized(&self) -> Vec<(u64, Value)> {
        self.externalized.lock().unwrap().clone()
    }
}

impl Driver for MockDriver {
    fn validate_value(&self, _slot: u64, _value: &Value, _nomination: bool) -> ValidationLevel {
        ValidationLevel::FullyValidated
    }

    fn combine_candidates(&self, _slot: u64, candidates: &[Value]) -> Option<Value> {
        candidates.first().cloned()
    }

    fn extract_valid_value(&self, _slot: u64, value: &Value) -> Option<Value> {
        Some(value.clone())
    }

    fn emit_envelope(&self, envelope: &Envelope) {
        self.emit_count.fetch_add(1, Ordering::SeqCst);
        self.emitted.lock().unwrap().push(envelope.clone());
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

    fn ballot_did_hear_from_quorum(&self, _slot: u64, _ballot: &Ballot) {
        self.heard_from_quorum.fetch_add(1, Ordering::SeqCst);
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

fn qset5() -> (Vec<NodeId>, QuorumSet) {
    let nodes: Vec<NodeId> = (0..5).map(node).collect();
    let qset = simple_quorum_set(4, nodes.clone());
    (nodes, qset)
}

fn make_prepare(
    node_id: NodeId,
    slot: u64,
    qset: &QuorumSet,
    ballot: Ballot,
    prepared: Option<Ballot>,
    prepared_prime: Option<Ballot>,
    n_c: u32,
    n_h: u32,
) -> Envelope {
    Envelope::unsigned(Statement {
        node_id,
        slot_index: slot,
        pledges: Pledges::Prepare(Prepare {
            quorum_set_hash: hash_quorum_set(qset),
            ballot,
            prepared,
            prepared_prime,
            n_c,
            n_h,
        }),
    })
}

fn make_confirm(
    node_id: NodeId,
    slot: u64,
    qset: &QuorumSet,
    ballot: Ballot,
    n_prepared: u32,
    n_commit: u32,
    n_h: u32,
) -> Envelope {
    Envelope::unsigned(Statement {
        node_id,
        slot_index: slot,
        pledges: Pledges::Confirm(Confirm {
            ballot,
            n_prepared,
            n_commit,
            n_h,
            quorum_set_hash: hash_quorum_set(qset),
        }),
    })
}

fn make_externalize(
    node_id: NodeId,
    slot: u64,
    qset: &QuorumSet,
    commit: Ballot,
    n_h: u32,
) -> Envelope {
    Envelope::unsigned(Statement {
        node_id,
        slot_index: slot,
        pledges: Pledges::Externalize(Externalize {
            commit,
            n_h,
            commit_quorum_set_hash: hash_quorum_set(qset),
        }),
    })
}

#[test]
fn new_protocol_is_pristine() {
    let bp = BallotProtocol::new();
    assert_eq!(bp.phase(), BallotPhase::Prepare);
    assert!(bp.current_ballot().is_none());
    assert!(bp.prepared().is_none());
    assert!(!bp.is_externalized());
    assert!(bp.check_invariants().is_ok());
}

#[test]
fn rejects_nomination_pledges() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();

    let env = Envelope::unsigned(Statement {
        node_id: nodes[1],
        slot_index: 1,
        pledges: Pledges::Nominate(Nominate {
            quorum_set_hash: hash_quorum_set(&qset),
            votes: vec![value(1)],
            accepted: vec![],
        }),
    });
    assert_eq!(
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 1)),
        EnvelopeState::Invalid
    );
}

#[test]
fn normal_round_externalizes() {
    // S1: the full happy path on a 4-of-5 quorum, one transition per
    // delivered quorum.
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let x = value(1);
    let b1 = Ballot::new(1, x.clone());

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), x.clone(), false));
    assert_eq!(driver.emits(), 1);
    assert_eq!(bp.current_ballot(), Some(&b1));

    // PREPARE(1,x) from v1..v3: quorum on the 4th voter (v0 included)
    for (i, peer) in nodes[1..4].iter().enumerate() {
        let env = make_prepare(*peer, 0, &qset, b1.clone(), None, None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
        if i < 2 {
            assert_eq!(bp.prepared(), None);
        }
    }
    assert_eq!(bp.prepared(), Some(&b1));
    assert_eq!(driver.emits(), 2);
    assert!(driver.heard_from_quorum.load(Ordering::SeqCst) >= 1);

    // accepted-prepared from v2..v4: confirm prepared, c and h move
    for peer in &nodes[2..5] {
        let env = make_prepare(*peer, 0, &qset, b1.clone(), Some(b1.clone()), None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert_eq!(bp.high_ballot(), Some(&b1));
    assert_eq!(bp.commit(), Some(&b1));
    assert_eq!(driver.emits(), 3);
    assert_eq!(bp.phase(), BallotPhase::Prepare);

    // commit votes from v1..v3: accept commit, move to CONFIRM
    for peer in &nodes[1..4] {
        let env = make_prepare(*peer, 0, &qset, b1.clone(), Some(b1.clone()), None, 1, 1);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert_eq!(bp.phase(), BallotPhase::Confirm);
    assert_eq!(driver.emits(), 4);
    assert!(driver.externalized().is_empty());

    // CONFIRMs from v1..v3: quorum ratifies the commit, EXTERNALIZE
    for peer in &nodes[1..4] {
        let env = make_confirm(*peer, 0, &qset, b1.clone(), 1, 1, 1);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert_eq!(bp.phase(), BallotPhase::Externalize);
    assert_eq!(driver.emits(), 5);
    assert_eq!(driver.externalized(), vec![(0, x.clone())]);
    assert_eq!(bp.get_externalized_value(), Some(&x));
    assert!(bp.check_invariants().is_ok());
}

#[test]
fn v_blocking_switches_prepared() {
    // S2: two peers (v-blocking in 4-of-5) carrying prepared=(1,y)
    // force v0 to accept (1,y) prepared while it works on (1,x).
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));
    let by = Ballot::new(1, value(2));

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));
    assert_eq!(driver.emits(), 1);

    let env = make_prepare(nodes[1], 0, &qset, by.clone(), Some(by.clone()), None, 0, 0);
    bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    assert_eq!(bp.prepared(), None);

    let env = make_prepare(nodes[2], 0, &qset, by.clone(), Some(by.clone()), None, 0, 0);
    bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));

    assert_eq!(bp.prepared(), Some(&by));
    // the working ballot does not move
    assert_eq!(bp.current_ballot(), Some(&bx));
    assert_eq!(driver.emits(), 2);
}

#[test]
fn prepared_prime_tracks_displaced_prepared() {
    // S3: prepared (1,x), then a v-blocking set prepares (2,y):
    // p = (2,y), p' = (1,x).
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));
    let by = Ballot::new(2, value(2));

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));

    for peer in &nodes[1..3] {
        let env = make_prepare(*peer, 0, &qset, bx.clone(), Some(bx.clone()), None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert_eq!(bp.prepared(), Some(&bx));

    for peer in &nodes[1..3] {
        let env = make_prepare(*peer, 0, &qset, by.clone(), Some(by.clone()), None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert_eq!(bp.prepared(), Some(&by));
    assert_eq!(bp.prepared_prime(), Some(&bx));
    assert!(bp.check_invariants().is_ok());
}

/// Drive a fresh protocol to the CONFIRM phase on `(1, x)`.
fn confirm_phase_fixture(
    nodes: &[NodeId],
    qset: &QuorumSet,
    driver: &Arc<MockDriver>,
) -> BallotProtocol {
    let mut bp = BallotProtocol::new();
    let b1 = Ballot::new(1, value(1));

    assert!(bp.bump(&ctx!(&nodes[0], qset, driver, 0), value(1), false));
    for peer in &nodes[1..4] {
        let env = make_prepare(*peer, 0, qset, b1.clone(), None, None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], qset, driver, 0));
    }
    for peer in &nodes[1..4] {
        let env = make_prepare(*peer, 0, qset, b1.clone(), Some(b1.clone()), None, 1, 1);
        bp.process_envelope(&env, &ctx!(&nodes[0], qset, driver, 0));
    }
    assert_eq!(bp.phase(), BallotPhase::Confirm);
    bp
}

#[test]
fn foreign_externalize_after_confirm_changes_nothing() {
    // S4: after CONFIRM on (1,x), EXTERNALIZE messages for (2,y) from
    // every peer neither emit nor externalize anything.
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = confirm_phase_fixture(&nodes, &qset, &driver);

    let emits_before = driver.emits();
    let commit_before = bp.commit().cloned();
    let by = Ballot::new(2, value(2));

    for peer in &nodes[1..5] {
        let env = make_externalize(*peer, 0, &qset, by.clone(), by.counter);
        let state = bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
        assert_eq!(state, EnvelopeState::Valid);
    }

    assert_eq!(driver.emits(), emits_before);
    assert!(driver.externalized().is_empty());
    assert_eq!(bp.phase(), BallotPhase::Confirm);
    assert_eq!(bp.commit().cloned(), commit_before);
}

#[test]
fn pristine_slot_ignores_singletons() {
    // S7: a lone prepared or CONFIRM statement moves nothing on a
    // fresh slot.
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let by = Ballot::new(1, value(2));

    let mut bp = BallotProtocol::new();
    let env = make_prepare(nodes[1], 0, &qset, by.clone(), Some(by.clone()), None, 0, 0);
    assert_eq!(
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0)),
        EnvelopeState::Valid
    );
    assert_eq!(driver.emits(), 0);
    assert!(bp.current_ballot().is_none());

    let mut bp = BallotProtocol::new();
    let env = make_confirm(nodes[1], 0, &qset, by.clone(), by.counter, by.counter, by.counter);
    assert_eq!(
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0)),
        EnvelopeState::Valid
    );
    assert_eq!(driver.emits(), 0);
    assert!(bp.current_ballot().is_none());
}

#[test]
fn frozen_after_externalize() {
    // once externalized, statements for other values are invalid and
    // the decision never changes
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));
    for peer in &nodes[2..5] {
        let env = make_confirm(*peer, 0, &qset, bx.clone(), 1, 1, 1);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert!(bp.is_externalized());
    assert_eq!(driver.externalized().len(), 1);

    let by = Ballot::new(2, value(2));
    for peer in &nodes[2..5] {
        let env = make_confirm(*peer, 0, &qset, by.clone(), 2, 2, 2);
        assert_eq!(
            bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0)),
            EnvelopeState::Invalid
        );
    }
    assert_eq!(driver.externalized().len(), 1);
    assert_eq!(bp.get_externalized_value(), Some(&value(1)));

    // compatible replays are retained for the externalizing state
    let replay = make_externalize(nodes[1], 0, &qset, bx.clone(), 1);
    assert_eq!(
        bp.process_envelope(&replay, &ctx!(&nodes[0], &qset, &driver, 0)),
        EnvelopeState::Valid
    );
    let witnesses = bp.get_externalizing_state(&nodes[0], true);
    assert!(witnesses
        .iter()
        .any(|env| env.statement.node_id == nodes[1]));
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));

    let env = make_prepare(nodes[1], 0, &qset, bx.clone(), Some(bx.clone()), None, 0, 0);
    let first = bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    assert!(first.is_valid());

    let emits = driver.emits();
    let prepared = bp.prepared().cloned();

    // replaying the identical statement is not newer, and changes
    // neither state nor output
    let replay = bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    assert_eq!(replay, EnvelopeState::Invalid);
    assert_eq!(driver.emits(), emits);
    assert_eq!(bp.prepared().cloned(), prepared);
}

#[test]
fn statement_ordering_by_type_then_fields() {
    let (nodes, qset) = qset5();
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));

    let prepare = make_prepare(nodes[1], 0, &qset, bx.clone(), None, None, 0, 0);
    let prepared = make_prepare(nodes[1], 0, &qset, bx.clone(), Some(bx.clone()), None, 0, 0);
    let confirm = make_confirm(nodes[1], 0, &qset, bx.clone(), 1, 1, 1);
    let confirm_higher = make_confirm(nodes[1], 0, &qset, bx.clone(), 1, 1, 2);
    let externalize = make_externalize(nodes[1], 0, &qset, bx.clone(), 1);

    // prepare < prepare-with-prepared < confirm < externalize
    assert!(bp.is_newer_statement(&nodes[1], &prepare.statement));
    bp.latest_envelopes.insert(nodes[1], prepare.clone());

    assert!(bp.is_newer_statement(&nodes[1], &prepared.statement));
    assert!(!bp.is_newer_statement(&nodes[1], &prepare.statement));
    bp.latest_envelopes.insert(nodes[1], prepared.clone());

    assert!(bp.is_newer_statement(&nodes[1], &confirm.statement));
    bp.latest_envelopes.insert(nodes[1], confirm.clone());

    assert!(!bp.is_newer_statement(&nodes[1], &prepared.statement));
    assert!(bp.is_newer_statement(&nodes[1], &confirm_higher.statement));
    assert!(bp.is_newer_statement(&nodes[1], &externalize.statement));
    bp.latest_envelopes.insert(nodes[1], externalize.clone());

    // nothing beats an externalize, not even another one
    assert!(!bp.is_newer_statement(&nodes[1], &externalize.statement));
    assert!(!bp.is_newer_statement(&nodes[1], &confirm_higher.statement));
}

#[test]
fn prepare_sanity_constraints() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let bp = BallotProtocol::new();
    let ctx = ctx!(&nodes[0], &qset, &driver, 0);
    let bx = Ballot::new(2, value(1));
    let by = Ballot::new(1, value(2));

    // well-formed
    let ok = make_prepare(nodes[1], 0, &qset, bx.clone(), Some(bx.clone()), Some(by.clone()), 0, 2);
    assert!(bp.is_statement_sane(&ok.statement, &ctx));

    // peers may not use the null working ballot
    let null_ballot = make_prepare(nodes[1], 0, &qset, Ballot::new(0, value(1)), None, None, 0, 0);
    assert!(!bp.is_statement_sane(&null_ballot.statement, &ctx));

    // p' must be below and incompatible with p
    let bad_prime = make_prepare(
        nodes[1],
        0,
        &qset,
        bx.clone(),
        Some(by.clone()),
        Some(bx.clone()),
        0,
        0,
    );
    assert!(!bp.is_statement_sane(&bad_prime.statement, &ctx));

    let compatible_prime = make_prepare(
        nodes[1],
        0,
        &qset,
        bx.clone(),
        Some(bx.clone()),
        Some(Ballot::new(1, value(1))),
        0,
        0,
    );
    assert!(!bp.is_statement_sane(&compatible_prime.statement, &ctx));

    // n_h needs a prepared ballot at or above it
    let orphan_h = make_prepare(nodes[1], 0, &qset, bx.clone(), None, None, 0, 1);
    assert!(!bp.is_statement_sane(&orphan_h.statement, &ctx));

    let high_h = make_prepare(nodes[1], 0, &qset, bx.clone(), Some(by.clone()), None, 0, 2);
    assert!(!bp.is_statement_sane(&high_h.statement, &ctx));

    // c <= h <= b when c is set
    let bad_c = make_prepare(nodes[1], 0, &qset, bx.clone(), Some(bx.clone()), None, 2, 1);
    assert!(!bp.is_statement_sane(&bad_c.statement, &ctx));
}

#[test]
fn confirm_and_externalize_sanity_constraints() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let bp = BallotProtocol::new();
    let ctx = ctx!(&nodes[0], &qset, &driver, 0);
    let bx = Ballot::new(2, value(1));

    let ok = make_confirm(nodes[1], 0, &qset, bx.clone(), 2, 1, 2);
    assert!(bp.is_statement_sane(&ok.statement, &ctx));

    let zero_counter = make_confirm(nodes[1], 0, &qset, Ballot::new(0, value(1)), 0, 0, 0);
    assert!(!bp.is_statement_sane(&zero_counter.statement, &ctx));

    let h_above_b = make_confirm(nodes[1], 0, &qset, bx.clone(), 2, 1, 3);
    assert!(!bp.is_statement_sane(&h_above_b.statement, &ctx));

    let c_above_h = make_confirm(nodes[1], 0, &qset, bx.clone(), 2, 2, 1);
    assert!(!bp.is_statement_sane(&c_above_h.statement, &ctx));

    let ok_ext = make_externalize(nodes[1], 0, &qset, bx.clone(), 2);
    assert!(bp.is_statement_sane(&ok_ext.statement, &ctx));

    let zero_commit = make_externalize(nodes[1], 0, &qset, Ballot::new(0, value(1)), 1);
    assert!(!bp.is_statement_sane(&zero_commit.statement, &ctx));

    let h_below_commit = make_externalize(nodes[1], 0, &qset, bx.clone(), 1);
    assert!(!bp.is_statement_sane(&h_below_commit.statement, &ctx));
}

#[test]
fn unresolvable_quorum_set_hash_is_insane() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let bp = BallotProtocol::new();
    let ctx = ctx!(&nodes[0], &qset, &driver, 0);

    let other = simple_quorum_set(1, vec![nodes[1]]);
    let env = make_prepare(nodes[1], 0, &other, Ballot::new(1, value(1)), None, None, 0, 0);
    // the driver only knows `qset`, whose hash differs
    assert!(!bp.is_statement_sane(&env.statement, &ctx));

    // externalize statements carry their own singleton quorum set and
    // always resolve
    let ext = make_externalize(nodes[1], 0, &other, Ballot::new(1, value(1)), 1);
    assert!(bp.is_statement_sane(&ext.statement, &ctx));
}

#[test]
fn bump_state_locks_to_confirmed_value() {
    // after confirming (1,x) prepared, a timeout bump with y stays on x
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));
    for peer in &nodes[1..4] {
        let env = make_prepare(*peer, 0, &qset, bx.clone(), Some(bx.clone()), None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert_eq!(bp.high_ballot(), Some(&bx));

    assert!(bp.bump_state(&ctx!(&nodes[0], &qset, &driver, 0), value(2), 2));
    let current = bp.current_ballot().unwrap();
    assert_eq!(current.counter, 2);
    assert_eq!(current.value, value(1));
    assert_eq!(bp.prepared(), Some(&bx));
}

#[test]
fn bump_is_noop_once_externalized() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let bx = Ballot::new(1, value(1));

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));
    for peer in &nodes[2..5] {
        let env = make_confirm(*peer, 0, &qset, bx.clone(), 1, 1, 1);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }
    assert!(bp.is_externalized());

    let emits = driver.emits();
    assert!(!bp.bump_state(&ctx!(&nodes[0], &qset, &driver, 0), value(2), 5));
    assert!(!bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(2), true));
    assert_eq!(driver.emits(), emits);
}

#[test]
fn bump_respects_commit_compatibility() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = confirm_phase_fixture(&nodes, &qset, &driver);

    // in CONFIRM, only the counter may advance; the value override
    // keeps the committed value even if the caller asks for another
    assert!(bp.bump_state(&ctx!(&nodes[0], &qset, &driver, 0), value(2), 4));
    let current = bp.current_ballot().unwrap();
    assert_eq!(current.counter, 4);
    assert_eq!(current.value, value(1));
}

#[test]
fn timeout_prefers_composite_candidate() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));

    let composite = value(9);
    assert!(bp.bump_timeout(&ctx!(&nodes[0], &qset, &driver, 0), Some(&composite)));
    let current = bp.current_ballot().unwrap();
    assert_eq!(current.counter, 2);
    assert_eq!(current.value, composite);
}

#[test]
fn timeout_falls_back_to_current_value() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));
    assert!(bp.bump_timeout(&ctx!(&nodes[0], &qset, &driver, 0), None));
    let current = bp.current_ballot().unwrap();
    assert_eq!(current.counter, 2);
    assert_eq!(current.value, value(1));

    // nothing to abandon on a pristine protocol
    let mut fresh = BallotProtocol::new();
    assert!(!fresh.bump_timeout(&ctx!(&nodes[0], &qset, &driver, 0), None));
}

#[test]
fn v_blocking_ahead_bumps_counter() {
    // peers at counter 3 form a v-blocking set: the local node jumps
    // to 3 to close the gap
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();
    let x = value(1);

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), x.clone(), false));

    let b3 = Ballot::new(3, x.clone());
    for peer in &nodes[1..3] {
        let env = make_prepare(*peer, 0, &qset, b3.clone(), None, None, 0, 0);
        bp.process_envelope(&env, &ctx!(&nodes[0], &qset, &driver, 0));
    }

    assert_eq!(bp.current_ballot().map(|b| b.counter), Some(3));
}

#[test]
fn restore_from_envelope_round_trips() {
    let (nodes, qset) = qset5();
    let bx = Ballot::new(2, value(1));
    let by = Ballot::new(1, value(2));

    let mut bp = BallotProtocol::new();
    let prep = make_prepare(nodes[0], 0, &qset, bx.clone(), Some(bx.clone()), Some(by.clone()), 0, 2);
    assert!(bp.set_state_from_envelope(&prep));
    assert_eq!(bp.phase(), BallotPhase::Prepare);
    assert_eq!(bp.current_ballot(), Some(&bx));
    assert_eq!(bp.prepared(), Some(&bx));
    assert_eq!(bp.prepared_prime(), Some(&by));
    assert_eq!(bp.high_ballot().map(|b| b.counter), Some(2));
    assert!(bp.commit().is_none());

    let mut bp = BallotProtocol::new();
    let conf = make_confirm(nodes[0], 0, &qset, bx.clone(), 2, 1, 2);
    assert!(bp.set_state_from_envelope(&conf));
    assert_eq!(bp.phase(), BallotPhase::Confirm);
    assert_eq!(bp.commit().map(|b| b.counter), Some(1));
    assert_eq!(bp.high_ballot().map(|b| b.counter), Some(2));

    let mut bp = BallotProtocol::new();
    let ext = make_externalize(nodes[0], 0, &qset, bx.clone(), 2);
    assert!(bp.set_state_from_envelope(&ext));
    assert_eq!(bp.phase(), BallotPhase::Externalize);
    assert_eq!(bp.get_externalized_value(), Some(&value(1)));
    assert_eq!(bp.current_ballot().map(|b| b.counter), Some(u32::MAX));

    let mut bp = BallotProtocol::new();
    let nom = Envelope::unsigned(Statement {
        node_id: nodes[0],
        slot_index: 0,
        pledges: Pledges::Nominate(Nominate {
            quorum_set_hash: hash_quorum_set(&qset),
            votes: vec![value(1)],
            accepted: vec![],
        }),
    });
    assert!(!bp.set_state_from_envelope(&nom));
}

#[test]
fn working_ballot_per_statement_type() {
    let (nodes, qset) = qset5();
    let bx = Ballot::new(2, value(1));

    let prep = make_prepare(nodes[0], 0, &qset, bx.clone(), None, None, 0, 0);
    assert_eq!(working_ballot(&prep.statement), Some(bx.clone()));

    let conf = make_confirm(nodes[0], 0, &qset, bx.clone(), 2, 1, 2);
    assert_eq!(
        working_ballot(&conf.statement),
        Some(Ballot::new(1, value(1)))
    );

    let ext = make_externalize(nodes[0], 0, &qset, bx.clone(), 2);
    assert_eq!(
        working_ballot(&ext.statement),
        Some(Ballot::new(u32::MAX, value(1)))
    );

    let nom = Envelope::unsigned(Statement {
        node_id: nodes[0],
        slot_index: 0,
        pledges: Pledges::Nominate(Nominate {
            quorum_set_hash: hash_quorum_set(&qset),
            votes: vec![],
            accepted: vec![],
        }),
    });
    assert_eq!(working_ballot(&nom.statement), None);
}

#[test]
fn invariant_checker_flags_bad_states() {
    let mut bp = BallotProtocol::new();
    bp.prepared = Some(Ballot::new(1, value(1)));
    bp.prepared_prime = Some(Ballot::new(2, value(2)));
    assert!(bp.check_invariants().is_err());

    let mut bp = BallotProtocol::new();
    bp.prepared = Some(Ballot::new(2, value(1)));
    bp.prepared_prime = Some(Ballot::new(1, value(1)));
    assert!(bp.check_invariants().is_err());

    let mut bp = BallotProtocol::new();
    bp.commit = Some(Ballot::new(3, value(1)));
    bp.high_ballot = Some(Ballot::new(2, value(1)));
    assert!(bp.check_invariants().is_err());

    let mut bp = BallotProtocol::new();
    bp.phase = BallotPhase::Externalize;
    assert!(bp.check_invariants().is_err());
}

#[test]
fn ballot_info_snapshot() {
    let (nodes, qset) = qset5();
    let driver = Arc::new(MockDriver::new(qset.clone()));
    let mut bp = BallotProtocol::new();

    assert!(bp.bump(&ctx!(&nodes[0], &qset, &driver, 0), value(1), false));
    let info = bp.get_info();
    assert_eq!(info.phase, "Prepare");
    assert_eq!(info.ballot_counter, 1);
    assert!(info.commit.is_none());
    assert!(!info.heard_from_quorum);
}
