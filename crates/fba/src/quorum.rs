//! Predicates over recursive quorum sets.
//!
//! A quorum set declares, per node, which combinations of peers it
//! trusts: at least `threshold` of its entries (validators or nested
//! sets) must be satisfied. Three predicates drive the whole protocol:
//!
//! - **quorum slice**: a node set satisfies one node's quorum set;
//! - **quorum**: a node set in which every member's own quorum set is
//!   satisfied by the set (transitive closure), and which contains a
//!   slice of the local node;
//! - **v-blocking**: a node set that intersects every slice of the
//!   local node, so nothing can be ratified without it.
//!
//! All three are monotone in their node-set argument.

use std::cmp::Ordering;
use std::collections::HashSet;

use pact_common::Hash256;

use crate::error::Error;
use crate::types::{NodeId, QuorumSet};

/// Deepest allowed nesting of inner sets.
pub const QUORUM_SET_MAX_DEPTH: u32 = 4;

/// Most nodes a quorum set may reference across all levels.
pub const QUORUM_SET_MAX_NODES: usize = 1000;

/// True iff `nodes` contains a slice satisfying `quorum_set`.
pub fn is_quorum_slice(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return true;
    }

    let mut count = 0;
    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }
    for inner in &quorum_set.inner_sets {
        if is_quorum_slice(inner, nodes) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }

    false
}

/// True iff a subset of `nodes` forms a quorum containing a slice of
/// the local `quorum_set`.
///
/// Nodes whose own quorum set (via `get_quorum_set`) is not satisfied
/// by the surviving set are pruned until a fixed point; the fixed
/// point is reached in at most `|nodes|` rounds.
pub fn is_quorum<F>(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>, get_quorum_set: F) -> bool
where
    F: Fn(&NodeId) -> Option<QuorumSet>,
{
    let mut remaining: HashSet<NodeId> = nodes.clone();

    loop {
        let before = remaining.len();
        let snapshot = remaining.clone();
        remaining.retain(|node_id| match get_quorum_set(node_id) {
            Some(qs) => is_quorum_slice(&qs, &snapshot),
            None => false,
        });
        if remaining.len() == before {
            break;
        }
    }

    is_quorum_slice(quorum_set, &remaining)
}

/// True iff `nodes` intersects every slice of `quorum_set`.
///
/// Equivalently: blocking `entry_count - threshold + 1` entries leaves
/// fewer than `threshold` satisfiable.
pub fn is_blocking_set(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    // The empty quorum set has no v-blocking sets.
    if threshold == 0 {
        return false;
    }

    let needed = quorum_set.entry_count().saturating_sub(threshold) + 1;

    let mut count = 0;
    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            count += 1;
        }
    }
    for inner in &quorum_set.inner_sets {
        if is_blocking_set(inner, nodes) {
            count += 1;
        }
    }

    count >= needed
}

/// Alias of [`is_blocking_set`] under its protocol name.
pub fn is_v_blocking(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    is_blocking_set(quorum_set, nodes)
}

/// Structural validation, fatal at load time.
///
/// Checks threshold range at every level, nesting depth, duplicate
/// validators, and the total node count. With `extra_checks`, also
/// requires every threshold to clear the v-blocking size (a >50%
/// safety margin).
pub fn check_sanity(quorum_set: &QuorumSet, extra_checks: bool) -> Result<(), Error> {
    let mut seen = HashSet::new();
    let count = check_sanity_inner(quorum_set, extra_checks, &mut seen, 0)?;

    if count < 1 || count > QUORUM_SET_MAX_NODES {
        return Err(Error::InvalidQuorumSet(format!(
            "total node count {count} outside [1, {QUORUM_SET_MAX_NODES}]"
        )));
    }

    Ok(())
}

fn check_sanity_inner(
    quorum_set: &QuorumSet,
    extra_checks: bool,
    seen: &mut HashSet<NodeId>,
    depth: u32,
) -> Result<usize, Error> {
    if depth > QUORUM_SET_MAX_DEPTH {
        return Err(Error::InvalidQuorumSet(format!(
            "nesting deeper than {QUORUM_SET_MAX_DEPTH} levels"
        )));
    }

    let total = quorum_set.entry_count();
    let threshold = quorum_set.threshold as usize;
    if threshold < 1 {
        return Err(Error::InvalidQuorumSet("threshold is zero".into()));
    }
    if threshold > total {
        return Err(Error::InvalidQuorumSet(format!(
            "threshold {threshold} exceeds entry count {total}"
        )));
    }

    let v_blocking_size = total - threshold + 1;
    if extra_checks && threshold < v_blocking_size {
        return Err(Error::InvalidQuorumSet(
            "threshold below v-blocking size (under 51%)".into(),
        ));
    }

    let mut count = quorum_set.validators.len();
    for validator in &quorum_set.validators {
        if !seen.insert(*validator) {
            return Err(Error::InvalidQuorumSet(format!(
                "duplicate validator {:?}",
                validator
            )));
        }
    }

    for inner in &quorum_set.inner_sets {
        count += check_sanity_inner(inner, extra_checks, seen, depth + 1)?;
    }

    Ok(count)
}

/// SHA-256 of the canonical encoding; how statements reference sets.
pub fn hash_quorum_set(quorum_set: &QuorumSet) -> Hash256 {
    Hash256::of_xdr(quorum_set)
}

/// Canonicalize: sort validators and inner sets at every level and
/// collapse trivial singleton wrappers, so equal trust graphs hash
/// equal.
pub fn normalize_quorum_set(quorum_set: &mut QuorumSet) {
    normalize_quorum_set_removing(quorum_set, None);
}

/// [`normalize_quorum_set`], additionally removing `id_to_remove` at
/// every level with matching threshold adjustment. Leader election
/// uses this to take the local node out of its own set.
pub fn normalize_quorum_set_removing(quorum_set: &mut QuorumSet, id_to_remove: Option<&NodeId>) {
    simplify(quorum_set, id_to_remove);
    reorder(quorum_set);
}

fn simplify(quorum_set: &mut QuorumSet, id_to_remove: Option<&NodeId>) {
    if let Some(id) = id_to_remove {
        let before = quorum_set.validators.len();
        quorum_set.validators.retain(|n| n != id);
        let removed = before - quorum_set.validators.len();
        quorum_set.threshold = quorum_set.threshold.saturating_sub(removed as u32);
    }

    let mut idx = 0;
    while idx < quorum_set.inner_sets.len() {
        simplify(&mut quorum_set.inner_sets[idx], id_to_remove);

        let inner = &quorum_set.inner_sets[idx];
        if inner.threshold == 1 && inner.validators.len() == 1 && inner.inner_sets.is_empty() {
            let lone = inner.validators[0];
            quorum_set.validators.push(lone);
            quorum_set.inner_sets.remove(idx);
        } else {
            idx += 1;
        }
    }

    // {threshold: 1, [], [inner]} is just inner.
    if quorum_set.threshold == 1
        && quorum_set.validators.is_empty()
        && quorum_set.inner_sets.len() == 1
    {
        *quorum_set = quorum_set.inner_sets.remove(0);
    }
}

fn reorder(quorum_set: &mut QuorumSet) {
    quorum_set.validators.sort();
    for inner in &mut quorum_set.inner_sets {
        reorder(inner);
    }
    quorum_set.inner_sets.sort_by(quorum_set_cmp);
}

fn quorum_set_cmp(a: &QuorumSet, b: &QuorumSet) -> Ordering {
    a.validators
        .cmp(&b.validators)
        .then_with(|| {
            for (x, y) in a.inner_sets.iter().zip(&b.inner_sets) {
                let ord = quorum_set_cmp(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.inner_sets.len().cmp(&b.inner_sets.len())
        })
        .then_with(|| a.threshold.cmp(&b.threshold))
}

/// Every node referenced anywhere in the set.
pub fn get_all_nodes(quorum_set: &QuorumSet) -> HashSet<NodeId> {
    let mut nodes = HashSet::new();
    for_each_node(quorum_set, &mut |node| {
        nodes.insert(*node);
    });
    nodes
}

/// Visit every validator at every level.
pub(crate) fn for_each_node<F>(quorum_set: &QuorumSet, f: &mut F)
where
    F: FnMut(&NodeId),
{
    for validator in &quorum_set.validators {
        f(validator);
    }
    for inner in &quorum_set.inner_sets {
        for_each_node(inner, f);
    }
}

/// Count of validators at every level.
pub(crate) fn count_nodes(quorum_set: &QuorumSet) -> usize {
    let mut count = 0;
    for_each_node(quorum_set, &mut |_| count += 1);
    count
}

/// Flat quorum set over the given validators.
pub fn simple_quorum_set(threshold: u32, validators: Vec<NodeId>) -> QuorumSet {
    QuorumSet::new(threshold, validators, Vec::new())
}

/// `{threshold: 1, [node]}`: how an externalizing node is modeled.
pub fn singleton_quorum_set(node_id: NodeId) -> QuorumSet {
    simple_quorum_set(1, vec![node_id])
}
