//! Short display helpers for log lines.

use crate::types::{Ballot, Envelope, NodeId, Pledges, Value};

/// First 4 bytes of the key as hex.
pub fn node_id_to_str(node_id: &NodeId) -> String {
    hex::encode(&node_id.0[..4])
}

/// `(counter, value-prefix)`.
pub fn ballot_to_str(ballot: &Ballot) -> String {
    format!("({},{})", ballot.counter, value_to_str(&ballot.value))
}

/// Hex prefix of a value.
pub fn value_to_str(value: &Value) -> String {
    hex::encode(&value.as_slice()[..8.min(value.len())])
}

/// One-line rendering of an envelope.
pub fn envelope_to_str(envelope: &Envelope) -> String {
    let node = node_id_to_str(&envelope.statement.node_id);
    let slot = envelope.statement.slot_index;

    match &envelope.statement.pledges {
        Pledges::Nominate(nom) => {
            let votes: Vec<_> = nom.votes.iter().map(value_to_str).collect();
            let accepted: Vec<_> = nom.accepted.iter().map(value_to_str).collect();
            format!("NOMINATE<{node}, slot={slot}, votes={votes:?}, accepted={accepted:?}>")
        }
        Pledges::Prepare(prep) => format!(
            "PREPARE<{node}, slot={slot}, b={}, p={:?}, p'={:?}, c={}, h={}>",
            ballot_to_str(&prep.ballot),
            prep.prepared.as_ref().map(ballot_to_str),
            prep.prepared_prime.as_ref().map(ballot_to_str),
            prep.n_c,
            prep.n_h
        ),
        Pledges::Confirm(conf) => format!(
            "CONFIRM<{node}, slot={slot}, b={}, p_n={}, c={}, h={}>",
            ballot_to_str(&conf.ballot),
            conf.n_prepared,
            conf.n_commit,
            conf.n_h
        ),
        Pledges::Externalize(ext) => format!(
            "EXTERNALIZE<{node}, slot={slot}, c={}, h={}>",
            ballot_to_str(&ext.commit),
            ext.n_h
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Nominate, Statement};
    use pact_common::Hash256;

    fn node(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(bytes)
    }

    #[test]
    fn short_node_id() {
        let s = node_id_to_str(&node(0xab));
        assert_eq!(s.len(), 8);
        assert!(s.starts_with("ab"));
    }

    #[test]
    fn ballot_rendering() {
        let ballot = Ballot::new(5, Value::new(vec![0xde, 0xad, 0xbe, 0xef]));
        let s = ballot_to_str(&ballot);
        assert!(s.contains('5'));
        assert!(s.contains("dead"));
    }

    #[test]
    fn value_prefix_is_bounded() {
        let value = Value::new((0u8..32).collect::<Vec<_>>());
        assert_eq!(value_to_str(&value).len(), 16);
        assert_eq!(value_to_str(&Value::empty()), "");
    }

    #[test]
    fn envelope_rendering_names_the_type() {
        let statement = Statement {
            node_id: node(1),
            slot_index: 42,
            pledges: Pledges::Nominate(Nominate {
                quorum_set_hash: Hash256::ZERO,
                votes: vec![Value::new(vec![1, 2, 3, 4])],
                accepted: vec![],
            }),
        };
        let s = envelope_to_str(&crate::types::Envelope::unsigned(statement));
        assert!(s.contains("NOMINATE"));
        assert!(s.contains("slot=42"));
    }
}
