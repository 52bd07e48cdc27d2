//! JSON-serializable state snapshots for host debugging endpoints.

use serde::{Deserialize, Serialize};

use crate::types::Pledges;

/// Where a peer stands in a slot's consensus, at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No message received.
    Missing,
    Nominating,
    Preparing,
    Confirming,
    Externalized,
}

impl PeerState {
    pub fn from_pledges(pledges: &Pledges) -> Self {
        match pledges {
            Pledges::Nominate(_) => PeerState::Nominating,
            Pledges::Prepare(_) => PeerState::Preparing,
            Pledges::Confirm(_) => PeerState::Confirming,
            Pledges::Externalize(_) => PeerState::Externalized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Missing => "MISSING",
            PeerState::Nominating => "NOMINATING",
            PeerState::Preparing => "PREPARING",
            PeerState::Confirming => "CONFIRMING",
            PeerState::Externalized => "EXTERNALIZED",
        }
    }

    pub fn is_in_ballot(&self) -> bool {
        matches!(
            self,
            PeerState::Preparing | PeerState::Confirming | PeerState::Externalized
        )
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_index: u64,
    pub phase: String,
    pub fully_validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nomination: Option<NominationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballot: Option<BallotInfo>,
}

/// Snapshot of the nomination protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NominationInfo {
    pub running: bool,
    pub round: u32,
    /// Hex prefixes of voted values.
    pub votes: Vec<String>,
    pub accepted: Vec<String>,
    pub candidates: Vec<String>,
    pub node_count: usize,
}

/// Snapshot of the ballot protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotInfo {
    pub phase: String,
    pub ballot_counter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballot_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared: Option<BallotSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared_prime: Option<BallotSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitBounds>,
    pub high: u32,
    pub node_count: usize,
    pub heard_from_quorum: bool,
}

/// A ballot as rendered into snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotSnapshot {
    pub counter: u32,
    pub value: String,
}

/// The `[c, h]` commit range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitBounds {
    pub low: u32,
    pub high: u32,
}

/// Per-node participation for one slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumInfo {
    pub slot_index: u64,
    pub local_node: String,
    pub quorum_set_hash: String,
    pub nodes: std::collections::HashMap<String, NodeInfo>,
    pub quorum_reached: bool,
    pub v_blocking: bool,
}

/// One node's row in [`QuorumInfo`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballot_counter: Option<u32>,
}
