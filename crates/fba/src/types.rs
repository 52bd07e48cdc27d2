//! Wire-shaped data model for consensus messages.
//!
//! The engine treats these types as its native vocabulary; the host
//! codec converts between them and whatever framing the network layer
//! speaks. Every type carries a canonical XDR encoding (big-endian
//! scalars, padded opaques, fixed union discriminants) so that hashes
//! and signatures are identical on all nodes.
//!
//! Union discriminants are part of the wire contract and must not
//! change: `Prepare = 0`, `Confirm = 1`, `Externalize = 2`,
//! `Nominate = 3`; `PublicKey::Ed25519 = 0`.

use std::fmt;

use pact_common::xdr::{self, WireEncode};
use pact_common::Hash256;

/// Ed25519 public key identifying a validator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

impl WireEncode for NodeId {
    fn encode(&self, out: &mut Vec<u8>) {
        // PublicKey union, arm PUBLIC_KEY_TYPE_ED25519 = 0.
        xdr::put_u32(out, 0);
        xdr::put_opaque_fixed(out, &self.0);
    }
}

/// Opaque consensus value.
///
/// The engine only relies on equality and the total (lexicographic)
/// order; interpretation is the host arbiter's business.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Value(pub Vec<u8>);

impl Value {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", hex::encode(&self.0[..8.min(self.0.len())]))
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl WireEncode for Value {
    fn encode(&self, out: &mut Vec<u8>) {
        xdr::put_opaque_var(out, &self.0);
    }
}

/// A ballot `(counter, value)`.
///
/// The derived order is lexicographic on `(counter, value)`, which is
/// exactly the protocol order. Two ballots are *compatible* when they
/// carry the same value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Ballot {
    pub counter: u32,
    pub value: Value,
}

impl Ballot {
    pub fn new(counter: u32, value: Value) -> Self {
        Self { counter, value }
    }

    /// The `(0, empty)` sentinel.
    pub fn null() -> Self {
        Self {
            counter: 0,
            value: Value::empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.counter == 0 && self.value.is_empty()
    }

    /// Same value, any counter.
    pub fn compatible(&self, other: &Ballot) -> bool {
        self.value == other.value
    }
}

impl WireEncode for Ballot {
    fn encode(&self, out: &mut Vec<u8>) {
        xdr::put_u32(out, self.counter);
        self.value.encode(out);
    }
}

/// Recursive quorum set: a threshold over validators and nested sets.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct QuorumSet {
    pub threshold: u32,
    pub validators: Vec<NodeId>,
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    pub fn new(threshold: u32, validators: Vec<NodeId>, inner_sets: Vec<QuorumSet>) -> Self {
        Self {
            threshold,
            validators,
            inner_sets,
        }
    }

    /// Number of direct children (validators plus inner sets).
    pub fn entry_count(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }
}

impl WireEncode for QuorumSet {
    fn encode(&self, out: &mut Vec<u8>) {
        xdr::put_u32(out, self.threshold);
        xdr::put_vec(out, &self.validators);
        xdr::put_vec(out, &self.inner_sets);
    }
}

/// NOMINATE pledge: values voted for and accepted so far.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Nominate {
    pub quorum_set_hash: Hash256,
    /// Strictly sorted, no duplicates.
    pub votes: Vec<Value>,
    /// Strictly sorted, no duplicates.
    pub accepted: Vec<Value>,
}

impl WireEncode for Nominate {
    fn encode(&self, out: &mut Vec<u8>) {
        self.quorum_set_hash.encode(out);
        xdr::put_vec(out, &self.votes);
        xdr::put_vec(out, &self.accepted);
    }
}

/// PREPARE pledge: working ballot plus the two prepared slots and the
/// commit range counters.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Prepare {
    pub quorum_set_hash: Hash256,
    pub ballot: Ballot,
    pub prepared: Option<Ballot>,
    pub prepared_prime: Option<Ballot>,
    pub n_c: u32,
    pub n_h: u32,
}

impl WireEncode for Prepare {
    fn encode(&self, out: &mut Vec<u8>) {
        self.quorum_set_hash.encode(out);
        self.ballot.encode(out);
        xdr::put_option(out, &self.prepared);
        xdr::put_option(out, &self.prepared_prime);
        xdr::put_u32(out, self.n_c);
        xdr::put_u32(out, self.n_h);
    }
}

/// CONFIRM pledge.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Confirm {
    pub ballot: Ballot,
    pub n_prepared: u32,
    pub n_commit: u32,
    pub n_h: u32,
    pub quorum_set_hash: Hash256,
}

impl WireEncode for Confirm {
    fn encode(&self, out: &mut Vec<u8>) {
        self.ballot.encode(out);
        xdr::put_u32(out, self.n_prepared);
        xdr::put_u32(out, self.n_commit);
        xdr::put_u32(out, self.n_h);
        self.quorum_set_hash.encode(out);
    }
}

/// EXTERNALIZE pledge: the decided commit ballot.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Externalize {
    pub commit: Ballot,
    pub n_h: u32,
    pub commit_quorum_set_hash: Hash256,
}

impl WireEncode for Externalize {
    fn encode(&self, out: &mut Vec<u8>) {
        self.commit.encode(out);
        xdr::put_u32(out, self.n_h);
        self.commit_quorum_set_hash.encode(out);
    }
}

/// The statement union.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Pledges {
    Prepare(Prepare),
    Confirm(Confirm),
    Externalize(Externalize),
    Nominate(Nominate),
}

impl Pledges {
    /// Wire discriminant. Fixed by the network protocol.
    pub fn discriminant(&self) -> u32 {
        match self {
            Pledges::Prepare(_) => 0,
            Pledges::Confirm(_) => 1,
            Pledges::Externalize(_) => 2,
            Pledges::Nominate(_) => 3,
        }
    }

    /// The quorum set hash the statement pledges against.
    ///
    /// EXTERNALIZE carries the hash of the quorum set that confirmed
    /// the commit; the sender itself acts as a singleton thereafter.
    pub fn quorum_set_hash(&self) -> Hash256 {
        match self {
            Pledges::Prepare(p) => p.quorum_set_hash,
            Pledges::Confirm(c) => c.quorum_set_hash,
            Pledges::Externalize(e) => e.commit_quorum_set_hash,
            Pledges::Nominate(n) => n.quorum_set_hash,
        }
    }
}

impl WireEncode for Pledges {
    fn encode(&self, out: &mut Vec<u8>) {
        xdr::put_u32(out, self.discriminant());
        match self {
            Pledges::Prepare(p) => p.encode(out),
            Pledges::Confirm(c) => c.encode(out),
            Pledges::Externalize(e) => e.encode(out),
            Pledges::Nominate(n) => n.encode(out),
        }
    }
}

/// A statement: who said what about which slot.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Statement {
    pub node_id: NodeId,
    pub slot_index: u64,
    pub pledges: Pledges,
}

impl Statement {
    /// All values referenced by the statement, for host validation.
    pub fn values(&self) -> Vec<Value> {
        let mut values = Vec::new();
        match &self.pledges {
            Pledges::Nominate(nom) => {
                values.extend(nom.votes.iter().cloned());
                values.extend(nom.accepted.iter().cloned());
            }
            Pledges::Prepare(prep) => {
                if prep.ballot.counter != 0 {
                    values.push(prep.ballot.value.clone());
                }
                if let Some(p) = &prep.prepared {
                    values.push(p.value.clone());
                }
                if let Some(pp) = &prep.prepared_prime {
                    values.push(pp.value.clone());
                }
            }
            Pledges::Confirm(conf) => values.push(conf.ballot.value.clone()),
            Pledges::Externalize(ext) => values.push(ext.commit.value.clone()),
        }
        values
    }
}

impl WireEncode for Statement {
    fn encode(&self, out: &mut Vec<u8>) {
        self.node_id.encode(out);
        xdr::put_u64(out, self.slot_index);
        self.pledges.encode(out);
    }
}

/// Ed25519 signature over the encoded statement.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn empty() -> Self {
        Self([0u8; 64])
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

impl WireEncode for Signature {
    fn encode(&self, out: &mut Vec<u8>) {
        xdr::put_opaque_var(out, &self.0);
    }
}

/// A signed statement, as carried on the wire.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Envelope {
    pub statement: Statement,
    pub signature: Signature,
}

impl Envelope {
    /// Unsigned envelope; the driver fills the signature in.
    pub fn unsigned(statement: Statement) -> Self {
        Self {
            statement,
            signature: Signature::empty(),
        }
    }
}

impl WireEncode for Envelope {
    fn encode(&self, out: &mut Vec<u8>) {
        self.statement.encode(out);
        self.signature.encode(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(bytes)
    }

    #[test]
    fn ballot_order_is_counter_then_value() {
        let a = Ballot::new(1, Value::new(vec![1]));
        let b = Ballot::new(2, Value::new(vec![1]));
        let c = Ballot::new(1, Value::new(vec![2]));

        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert!(a.compatible(&b));
        assert!(!a.compatible(&c));
    }

    #[test]
    fn null_ballot_sentinel() {
        assert!(Ballot::null().is_null());
        assert!(!Ballot::new(1, Value::empty()).is_null());
        assert!(!Ballot::new(0, Value::new(vec![1])).is_null());
    }

    #[test]
    fn node_id_encoding_carries_key_type() {
        let bytes = node(7).to_bytes();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(bytes[4], 7);
    }

    #[test]
    fn pledge_discriminants_are_fixed() {
        let qset_hash = Hash256::ZERO;
        let ballot = Ballot::new(1, Value::new(vec![1]));

        let prep = Pledges::Prepare(Prepare {
            quorum_set_hash: qset_hash,
            ballot: ballot.clone(),
            prepared: None,
            prepared_prime: None,
            n_c: 0,
            n_h: 0,
        });
        let conf = Pledges::Confirm(Confirm {
            ballot: ballot.clone(),
            n_prepared: 1,
            n_commit: 1,
            n_h: 1,
            quorum_set_hash: qset_hash,
        });
        let ext = Pledges::Externalize(Externalize {
            commit: ballot.clone(),
            n_h: 1,
            commit_quorum_set_hash: qset_hash,
        });
        let nom = Pledges::Nominate(Nominate {
            quorum_set_hash: qset_hash,
            votes: vec![],
            accepted: vec![],
        });

        assert_eq!(prep.discriminant(), 0);
        assert_eq!(conf.discriminant(), 1);
        assert_eq!(ext.discriminant(), 2);
        assert_eq!(nom.discriminant(), 3);
        // The discriminant leads the encoding.
        assert_eq!(&nom.to_bytes()[..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn statement_values_skips_null_prepare_ballot() {
        let st = Statement {
            node_id: node(1),
            slot_index: 3,
            pledges: Pledges::Prepare(Prepare {
                quorum_set_hash: Hash256::ZERO,
                ballot: Ballot::null(),
                prepared: Some(Ballot::new(1, Value::new(vec![9]))),
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        };
        assert_eq!(st.values(), vec![Value::new(vec![9])]);
    }

    #[test]
    fn statement_encoding_is_stable() {
        let st = Statement {
            node_id: node(1),
            slot_index: 7,
            pledges: Pledges::Nominate(Nominate {
                quorum_set_hash: Hash256::ZERO,
                votes: vec![Value::new(vec![1, 2, 3])],
                accepted: vec![],
            }),
        };
        let bytes = st.to_bytes();
        assert_eq!(bytes, st.to_bytes());
        // node id union (36) + slot (8) + discriminant (4) + hash (32)
        // + votes count (4) + one padded 3-byte value (8) + accepted (4)
        assert_eq!(bytes.len(), 36 + 8 + 4 + 32 + 4 + 8 + 4);
    }

    #[test]
    fn value_order_is_lexicographic() {
        let a = Value::new(vec![1]);
        let b = Value::new(vec![1, 0]);
        let c = Value::new(vec![2]);
        assert!(a < b && b < c);
    }
}
