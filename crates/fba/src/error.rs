//! Error types for the consensus engine.
//!
//! Protocol-level rejections (bad signatures, stale statements, failed
//! federated predicates) are reported through
//! [`EnvelopeState`](crate::EnvelopeState) and never abort processing.
//! The errors here cover the remaining failure modes: configuration
//! problems surfaced at load time and internal invariant violations.

use thiserror::Error;

/// Errors that can occur during consensus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A statement is structurally malformed (bad counters, unsorted
    /// value lists, inconsistent prepared ballots).
    #[error("malformed statement: {0}")]
    MalformedStatement(String),

    /// The quorum set violates a structural constraint: threshold out
    /// of range, nesting too deep, duplicate validators, or too many
    /// nodes. Fatal at load time.
    #[error("invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    /// An envelope signature did not verify against its statement.
    #[error("signature verification failed")]
    BadSignature,

    /// The host arbiter rejected a value carried by a statement.
    #[error("value validation failed: {0}")]
    InvalidValue(String),

    /// A statement referenced a quorum set hash the host cannot
    /// resolve. The statement is dropped; re-delivery after the host
    /// learns the quorum set is idempotent.
    #[error("unknown quorum set hash: {0}")]
    UnknownQuorumSet(String),

    /// The addressed slot does not exist (never created or purged).
    #[error("slot not found: {0}")]
    SlotNotFound(u64),

    /// An internal invariant was violated. Indicates a bug; the slot
    /// should be considered unusable.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}
