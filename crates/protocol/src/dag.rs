//! Shared DAG-related structures.
//!
//! These helper types describe metadata that multiple crates need to
//! understand, such as the known-index map used by sync and statistics
//! produced by DAG storage implementations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::PeerId;

/// Highest known event index per creator, -1 when nothing is known.
pub type KnownIndexes = BTreeMap<PeerId, i64>;

/// DAG statistics for monitoring and observability.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DagStats {
    /// Total number of events in the DAG
    pub total_events: usize,
    /// Events not yet assigned a round received
    pub undetermined_events: usize,
    /// Events in the consensus order
    pub consensus_events: usize,
    /// Transactions in the consensus order
    pub consensus_transactions: u64,
    /// Last round processed by consensus
    pub last_consensus_round: Option<i64>,
    /// Highest round assigned so far
    pub last_round: i64,
    /// Number of creators seen
    pub creator_count: usize,
    /// Creators caught equivocating
    pub faulty_creators: usize,
}
