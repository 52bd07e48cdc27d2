//! Federated Byzantine Agreement consensus engine.
//!
//! This crate drives a single decision slot from "no value chosen" to
//! "value externalized" using the two sub-protocols of federated
//! voting:
//!
//! 1. **Nomination**: nodes propose and vote on candidate values
//!    until a quorum confirms a non-empty candidate set, which is
//!    combined into one composite value.
//! 2. **Ballot**: nodes run federated voting over ballots
//!    `(counter, value)` through PREPARE, CONFIRM, and EXTERNALIZE
//!    phases until the composite value is final.
//!
//! Trust is declared locally: every node carries a recursive
//! [`QuorumSet`], and agreement is defined by the *quorum* and
//! *v-blocking* predicates over those sets ([`quorum`]).
//!
//! The engine is deliberately inert about everything that is not
//! consensus: signing, transport, timers, and value semantics are host
//! capabilities supplied through the [`Driver`] trait. All entry
//! points are synchronous; hosts must serialize them and must not
//! re-enter the engine from inside a callback.
//!
//! ```ignore
//! let engine = Fba::new(local_node, true, quorum_set, driver);
//!
//! engine.nominate(slot, value, &prev_value);
//! let state = engine.receive_envelope(envelope);
//! if let Some(value) = engine.get_externalized_value(slot) {
//!     // decision is final
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

mod ballot;
pub mod config;
mod driver;
mod engine;
mod error;
mod format;
mod info;
mod nomination;
pub mod quorum;
mod slot;
mod types;

pub use ballot::{working_ballot, BallotPhase, BallotProtocol};
pub use driver::{compute_weight, node_weight, Driver, TimerKind, ValidationLevel};
pub use engine::{Fba, SlotSummary};
pub use error::Error;
pub use format::{ballot_to_str, envelope_to_str, node_id_to_str, value_to_str};
pub use info::{
    BallotInfo, BallotSnapshot, CommitBounds, NodeInfo, NominationInfo, PeerState, QuorumInfo,
    SlotInfo,
};
pub use nomination::NominationProtocol;
pub use slot::Slot;
pub use types::{
    Ballot, Confirm, Envelope, Externalize, NodeId, Nominate, Pledges, Prepare, QuorumSet,
    Signature, Statement, Value,
};

pub use pact_common::{Hash256, WireEncode};

/// Slot index; typically a ledger or log sequence number.
pub type SlotIndex = u64;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of feeding an envelope to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Rejected: bad signature, malformed, stale, or failed validation.
    Invalid,
    /// Accepted but caused no state change (duplicate or known state).
    Valid,
    /// Accepted and advanced the slot's state.
    ValidNew,
}

impl EnvelopeState {
    pub fn is_valid(&self) -> bool {
        matches!(self, EnvelopeState::Valid | EnvelopeState::ValidNew)
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnvelopeState::ValidNew)
    }
}

/// Parameters threaded through every protocol step: the local
/// identity, its quorum set, the host driver, and the slot index.
pub(crate) struct SlotContext<'a, D: Driver> {
    pub local_node_id: &'a NodeId,
    pub local_quorum_set: &'a QuorumSet,
    pub driver: &'a Arc<D>,
    pub slot_index: u64,
}

/// Iterate latest envelopes in node order, optionally skipping the
/// local node when its statements are not yet safe to share.
///
/// Shared by the nomination and ballot `process_current_state`
/// implementations. The callback returns `false` to stop early.
pub(crate) fn for_latest_envelopes<F>(
    envelopes: &HashMap<NodeId, Envelope>,
    mut f: F,
    local_node_id: &NodeId,
    fully_validated: bool,
    force_self: bool,
) -> bool
where
    F: FnMut(&Envelope) -> bool,
{
    let mut nodes: Vec<_> = envelopes.keys().copied().collect();
    nodes.sort();

    for node_id in nodes {
        if !force_self && node_id == *local_node_id && !fully_validated {
            continue;
        }
        if let Some(envelope) = envelopes.get(&node_id) {
            if !f(envelope) {
                return false;
            }
        }
    }

    true
}
