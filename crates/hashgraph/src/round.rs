//! Per-round bookkeeping: witnesses, their fame and the events received.

use hashweave_protocol::EventHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fame of a witness as decided by virtual voting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fame {
    Undecided,
    Famous,
    NotFamous,
}

impl Fame {
    pub fn from_vote(famous: bool) -> Self {
        if famous {
            Fame::Famous
        } else {
            Fame::NotFamous
        }
    }
}

/// State of a single round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    /// Witnesses of the round and their fame
    pub witnesses: BTreeMap<EventHash, Fame>,
    /// Every witness fame is decided
    pub decided: bool,
    /// Events received in this round have been ordered
    pub processed: bool,
    /// Events received in this round, in consensus order
    pub received_events: Vec<EventHash>,
}

impl RoundInfo {
    pub fn add_witness(&mut self, hash: EventHash, fame: Fame) {
        self.witnesses.entry(hash).or_insert(fame);
    }

    pub fn set_fame(&mut self, hash: EventHash, famous: bool) {
        if let Some(fame) = self.witnesses.get_mut(&hash) {
            *fame = Fame::from_vote(famous);
        }
    }

    pub fn fame_of(&self, hash: &EventHash) -> Option<Fame> {
        self.witnesses.get(hash).copied()
    }

    /// Witness hashes in ascending order.
    pub fn witnesses(&self) -> Vec<EventHash> {
        self.witnesses.keys().copied().collect()
    }

    pub fn famous_witnesses(&self) -> Vec<EventHash> {
        self.witnesses
            .iter()
            .filter(|(_, fame)| **fame == Fame::Famous)
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn undecided_witnesses(&self) -> Vec<EventHash> {
        self.witnesses
            .iter()
            .filter(|(_, fame)| **fame == Fame::Undecided)
            .map(|(hash, _)| *hash)
            .collect()
    }

    /// True once the round has witnesses and none of them is undecided.
    pub fn witnesses_decided(&self) -> bool {
        !self.witnesses.is_empty() && self.witnesses.values().all(|f| *f != Fame::Undecided)
    }
}
