//! Catching up from a peer's anchor block instead of replaying history.

use hashweave_hashgraph::HashgraphError;
use hashweave_protocol::{
    Block, Command, CommandResponse, FastForwardRequest, FastForwardResponse, Peer, PeerId, PeerSet,
};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::errors::SyncError;
use crate::proxy::AppProxy;
use crate::transport::Transport;

fn mismatch(reason: impl Into<String>) -> SyncError {
    SyncError::Consensus {
        source: HashgraphError::SnapshotMismatch { reason: reason.into() },
    }
}

/// Check that a fast-forward response is internally consistent, extends the
/// peer-set history in `trusted` and is vouched for by the newest set this
/// node already trusts.
pub fn validate_response(
    response: &FastForwardResponse,
    trusted: &BTreeMap<i64, PeerSet>,
) -> Result<(), SyncError> {
    let block = &response.block;
    let frame = &response.frame;

    if block.round_received() != frame.round {
        return Err(mismatch(format!(
            "block round {} does not match frame round {}",
            block.round_received(),
            frame.round
        )));
    }
    if frame.hash()? != block.body.frame_hash {
        return Err(mismatch("frame hash does not match the block"));
    }
    if frame.peers.hash()? != block.body.peers_hash {
        return Err(mismatch("frame peers do not match the block"));
    }

    let in_force = frame.peer_sets.range(..=frame.round).next_back().map(|(_, peers)| peers);
    if in_force != Some(&frame.peers) {
        return Err(mismatch(format!(
            "frame peers are not the set in force at round {}",
            frame.round
        )));
    }
    for (round, peers) in trusted.range(..=frame.round) {
        if frame.peer_sets.get(round) != Some(peers) {
            return Err(mismatch(format!(
                "frame history disagrees with our peer set at round {}",
                round
            )));
        }
    }

    if block.body.state_hash.is_empty() {
        return Err(mismatch("block was never committed"));
    }

    let signed = block.signed_stake(&frame.peers);
    if signed < frame.peers.trust_count() {
        return Err(mismatch(format!(
            "block {} signed by {} of stake, {} needed",
            block.index(),
            signed,
            frame.peers.trust_count()
        )));
    }
    let Some(vouching) = trusted.values().next_back() else {
        return Err(mismatch("no trusted peer set to check the block against"));
    };
    let vouched = block.signed_stake(vouching);
    if vouched < vouching.trust_count() {
        return Err(mismatch(format!(
            "block {} signed by {} of our known validators' stake, {} needed",
            block.index(),
            vouched,
            vouching.trust_count()
        )));
    }
    Ok(())
}

pub struct FastForwardManager {
    id: PeerId,
    core: Arc<Mutex<Core>>,
    transport: Arc<dyn Transport>,
    proxy: Arc<dyn AppProxy>,
}

impl FastForwardManager {
    pub fn new(id: PeerId, core: Arc<Mutex<Core>>, transport: Arc<dyn Transport>, proxy: Arc<dyn AppProxy>) -> Self {
        Self {
            id,
            core,
            transport,
            proxy,
        }
    }

    /// Serve our anchor block, its frame and the matching application
    /// snapshot.
    pub async fn handle_request(&self, request: FastForwardRequest) -> CommandResponse {
        let anchor = self.core.lock().await.anchor();
        let Some((block, frame)) = anchor else {
            debug!("No anchor block to serve {}", request.from_id);
            return CommandResponse::Error("no anchor block yet".to_string());
        };
        match self.proxy.get_snapshot(block.index()) {
            Ok(snapshot) => {
                info!("📤 Serving fast-forward to {} at block {}", request.from_id, block.index());
                CommandResponse::FastForward(Box::new(FastForwardResponse {
                    from_id: self.id,
                    block,
                    frame,
                    snapshot,
                }))
            }
            Err(e) => CommandResponse::Error(e.to_string()),
        }
    }

    /// Try `peers` in random order until one yields a valid snapshot, then
    /// restore the application and reset the hashgraph from it.
    pub async fn fast_forward(&self, peers: &PeerSet) -> Result<Block, SyncError> {
        let mut candidates: Vec<(PeerId, Peer)> = peers
            .peers()
            .filter(|(id, _)| **id != self.id)
            .map(|(id, peer)| (*id, peer.clone()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        if candidates.is_empty() {
            return Err(SyncError::NoPeers);
        }

        let trusted = self.core.lock().await.peer_sets();
        let mut last_error = SyncError::NoPeers;
        for (peer_id, peer) in candidates {
            match self.try_peer(peer_id, &peer, &trusted).await {
                Ok(block) => return Ok(block),
                Err(e) => {
                    warn!("⚠️ Fast-forward from {} failed: {}", peer.moniker, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn try_peer(
        &self,
        peer_id: PeerId,
        peer: &Peer,
        trusted: &BTreeMap<i64, PeerSet>,
    ) -> Result<Block, SyncError> {
        let command = Command::FastForward(FastForwardRequest { from_id: self.id });
        let response = match self.transport.request(&peer.net_addr, command).await? {
            CommandResponse::FastForward(response) => *response,
            CommandResponse::Error(reason) => return Err(SyncError::Refused { peer: peer_id, reason }),
            _ => {
                return Err(SyncError::UnexpectedResponse {
                    command: "fast_forward".to_string(),
                    peer: peer_id,
                })
            }
        };
        validate_response(&response, trusted)?;

        let state_hash = self.proxy.restore(&response.snapshot)?;
        if state_hash != response.block.body.state_hash {
            return Err(mismatch("restored application state does not match the block"));
        }

        let block = response.block.clone();
        self.core
            .lock()
            .await
            .fast_forward(response.block, response.frame)?;
        info!(
            "⏩ Fast-forwarded to block {} (round {}) from {}",
            block.index(),
            block.round_received(),
            peer.moniker
        );
        Ok(block)
    }
}
