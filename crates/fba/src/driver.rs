//! Host capability surface.
//!
//! The engine is a pure consensus algorithm: it does not know how to
//! validate values, sign bytes, talk to peers, or schedule timers.
//! Everything application-specific is delegated through [`Driver`],
//! implemented once by the embedding host.
//!
//! Callbacks are invoked inline from engine entry points. They must be
//! synchronous, non-blocking, and must never re-enter the engine;
//! re-entrant calls yield undefined behavior. Hosts that need
//! asynchronous validation queue the envelope externally and deliver
//! it again later, since re-delivery is idempotent.

use std::time::Duration;

use pact_common::xdr;
use pact_common::Hash256;

use crate::types::{Ballot, Envelope, NodeId, QuorumSet, Value};

/// Ballot timers never stretch past this many seconds per round.
const MAX_TIMEOUT_SECONDS: u32 = 30 * 60;

/// Domain tags for the nomination hash function.
const HASH_N: u32 = 1;
const HASH_P: u32 = 2;
const HASH_K: u32 = 3;

/// Which host-armed timer a hook refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Nomination round escalation.
    Nomination,
    /// Per-counter ballot timeout.
    Ballot,
}

/// How far the host was able to validate a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Rejected; the value must not be voted for or accepted.
    Invalid,
    /// Possibly valid but not fully checked yet. Such values may
    /// participate in nomination but block full validation of the
    /// slot until resolved.
    MaybeValid,
    /// Known valid; only fully validated values may externalize.
    FullyValidated,
}

/// Callback interface between the engine and its host.
pub trait Driver: Send + Sync {
    /// Validate a value for a slot. `nomination` is true during the
    /// nomination phase, where cheaper checks may be acceptable.
    ///
    /// Must be deterministic across all honest nodes.
    fn validate_value(&self, slot_index: u64, value: &Value, nomination: bool) -> ValidationLevel;

    /// Deterministically combine confirmed candidates into the single
    /// composite value handed to the ballot protocol.
    fn combine_candidates(&self, slot_index: u64, candidates: &[Value]) -> Option<Value>;

    /// Extract the valid portion of a `MaybeValid` value, if any.
    fn extract_valid_value(&self, slot_index: u64, value: &Value) -> Option<Value>;

    /// Broadcast an envelope to peers.
    fn emit_envelope(&self, envelope: &Envelope);

    /// Look up the quorum set a node pledges, if known.
    fn get_quorum_set(&self, node_id: &NodeId) -> Option<QuorumSet>;

    /// Look up a quorum set by its hash, if known.
    fn get_quorum_set_by_hash(&self, _hash: &Hash256) -> Option<QuorumSet> {
        None
    }

    /// Fill in the signature over the envelope's encoded statement.
    fn sign_envelope(&self, envelope: &mut Envelope);

    /// Verify an envelope's signature.
    fn verify_envelope(&self, envelope: &Envelope) -> bool;

    /// Consensus was reached: `value` is final for `slot_index`.
    fn value_externalized(&self, slot_index: u64, value: &Value);

    /// The local node started voting for `value` during nomination.
    fn nominating_value(&self, _slot_index: u64, _value: &Value) {}

    /// Nomination handed its first composite value to the ballot
    /// protocol.
    fn started_ballot_protocol(&self, _slot_index: u64, _value: &Value) {}

    /// The composite candidate changed while nomination keeps running.
    fn updated_candidate_value(&self, _slot_index: u64, _value: &Value) {}

    /// A ballot was accepted as prepared.
    fn accepted_ballot_prepared(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// A ballot was confirmed prepared.
    fn confirmed_ballot_prepared(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// A commit was accepted for a ballot range.
    fn accepted_commit(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// A quorum of peers reached the current ballot counter. Hosts
    /// typically arm the ballot timer off this hook.
    fn ballot_did_hear_from_quorum(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// Priority hash for leader election: 64-bit digest of
    /// `(slot, prev_value, N|P tag, round, node)`.
    ///
    /// The default is the truncated SHA-256 over the canonical
    /// encoding of the inputs; override only to rig priorities in
    /// tests or to domain-separate per network.
    fn compute_hash_node(
        &self,
        slot_index: u64,
        prev_value: &Value,
        is_priority: bool,
        round: u32,
        node_id: &NodeId,
    ) -> u64 {
        let tag = if is_priority { HASH_P } else { HASH_N };
        nomination_hash(slot_index, prev_value, tag, round, |out| {
            use pact_common::WireEncode;
            node_id.encode(out)
        })
    }

    /// Tie-break hash used when adopting one of a leader's values.
    fn compute_value_hash(
        &self,
        slot_index: u64,
        prev_value: &Value,
        round: u32,
        value: &Value,
    ) -> u64 {
        nomination_hash(slot_index, prev_value, HASH_K, round, |out| {
            use pact_common::WireEncode;
            value.encode(out)
        })
    }

    /// Timeout for a nomination or ballot round. Grows linearly with
    /// the round so a lagging network can still converge.
    fn compute_timeout(&self, round: u32, _is_nomination: bool) -> Duration {
        Duration::from_secs(u64::from(round.min(MAX_TIMEOUT_SECONDS)))
    }

    /// Ask the host to arm a timer; on expiry the host calls back into
    /// the matching timeout entry point.
    fn setup_timer(&self, _slot_index: u64, _kind: TimerKind, _timeout: Duration) {}

    /// Ask the host to cancel a previously armed timer.
    fn stop_timer(&self, _slot_index: u64, _kind: TimerKind) {}

    /// Informational: a timer expiry was handled by the engine.
    fn timer_expired(&self, _slot_index: u64, _kind: TimerKind) {}

    /// Hash of a quorum set, as referenced in statements.
    fn hash_quorum_set(&self, quorum_set: &QuorumSet) -> Hash256 {
        Hash256::of_xdr(quorum_set)
    }

    /// Weight of a node within a quorum set, in `[0, u64::MAX]`.
    fn get_node_weight(&self, node_id: &NodeId, quorum_set: &QuorumSet, is_local: bool) -> u64 {
        node_weight(node_id, quorum_set, is_local)
    }
}

fn nomination_hash<F>(slot_index: u64, prev_value: &Value, tag: u32, round: u32, extra: F) -> u64
where
    F: FnOnce(&mut Vec<u8>),
{
    use pact_common::WireEncode;

    let mut buf = Vec::new();
    xdr::put_u64(&mut buf, slot_index);
    prev_value.encode(&mut buf);
    xdr::put_u32(&mut buf, tag);
    xdr::put_u32(&mut buf, round);
    extra(&mut buf);
    Hash256::hash(&buf).truncated_u64()
}

/// `ceil(m * threshold / total)` without overflow.
pub fn compute_weight(m: u64, total: u64, threshold: u64) -> u64 {
    if threshold == 0 || total == 0 {
        return 0;
    }
    debug_assert!(threshold <= total);
    let numerator = u128::from(m) * u128::from(threshold);
    numerator.div_ceil(u128::from(total)) as u64
}

/// Weight of `node_id` inside `quorum_set`: the product of
/// `threshold / entry_count` along the path from the root to the node,
/// scaled into `u64`. The local node always weighs `u64::MAX`;
/// unknown nodes weigh 0.
pub fn node_weight(node_id: &NodeId, quorum_set: &QuorumSet, is_local: bool) -> u64 {
    if is_local {
        return u64::MAX;
    }

    let total = quorum_set.entry_count() as u64;
    let threshold = u64::from(quorum_set.threshold);
    if threshold == 0 || total == 0 {
        return 0;
    }

    if quorum_set.validators.contains(node_id) {
        return compute_weight(u64::MAX, total, threshold);
    }

    for inner in &quorum_set.inner_sets {
        let leaf = node_weight(node_id, inner, false);
        if leaf > 0 {
            return compute_weight(leaf, total, threshold);
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::simple_quorum_set;

    fn node(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(bytes)
    }

    fn near(weight: u64, target: f64) -> bool {
        let ratio = weight as f64 / u64::MAX as f64;
        (ratio - target).abs() < 0.01
    }

    #[test]
    fn weight_is_threshold_over_total() {
        assert!(near(compute_weight(u64::MAX, 4, 3), 0.75));
        assert_eq!(compute_weight(u64::MAX, 3, 3), u64::MAX);
        assert_eq!(compute_weight(u64::MAX, 0, 0), 0);
        assert_eq!(compute_weight(u64::MAX, 4, 0), 0);
        // 10 * 3 / 4 = 7.5 rounds up
        assert_eq!(compute_weight(10, 4, 3), 8);
    }

    #[test]
    fn node_weight_flat_set() {
        let nodes: Vec<_> = (0..4).map(node).collect();
        let qset = simple_quorum_set(3, nodes.clone());

        assert_eq!(node_weight(&nodes[0], &qset, true), u64::MAX);
        assert!(near(node_weight(&nodes[2], &qset, false), 0.75));
        assert_eq!(node_weight(&node(9), &qset, false), 0);
    }

    #[test]
    fn node_weight_scales_through_inner_sets() {
        let inner = simple_quorum_set(1, vec![node(4), node(5)]);
        let qset = QuorumSet::new(3, (0..4).map(node).collect(), vec![inner]);

        // inner: 1/2, outer: 3/5
        assert!(near(node_weight(&node(4), &qset, false), 0.5 * 0.6));
    }

    #[test]
    fn nomination_hash_is_stable_and_tagged() {
        let prev = Value::new(vec![1, 2, 3]);
        let h1 = nomination_hash(1, &prev, HASH_P, 1, |_| {});
        let h2 = nomination_hash(1, &prev, HASH_P, 1, |_| {});
        let h3 = nomination_hash(1, &prev, HASH_N, 1, |_| {});
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }
}
