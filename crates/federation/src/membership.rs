//! Joining and leaving the validator set.
//!
//! A membership change is an internal transaction signed by the peer it
//! concerns. Whoever receives it only checks that it is well formed and pools
//! it for its next event; the change is applied by consensus when that event
//! is received, so every validator applies it at the same round.

use hashweave_protocol::{
    Command, CommandResponse, InternalTransaction, JoinRequest, JoinResponse, Peer, PeerId,
    PeerSet, TransactionKind,
};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::errors::SyncError;
use crate::transport::Transport;

/// Interval between peer set checks while waiting for a change to land
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct MembershipManager {
    id: PeerId,
    core: Arc<Mutex<Core>>,
    transport: Arc<dyn Transport>,
    /// How this node describes itself to the network
    local_peer: Peer,
    timeout: Duration,
}

impl MembershipManager {
    pub fn new(
        id: PeerId,
        core: Arc<Mutex<Core>>,
        transport: Arc<dyn Transport>,
        local_peer: Peer,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            core,
            transport,
            local_peer,
            timeout,
        }
    }

    /// Check a proposal against the current peer set.
    fn check(itx: &InternalTransaction, peers: &PeerSet) -> Result<(), String> {
        match itx.verify() {
            Ok(true) => {}
            Ok(false) => return Err("bad signature".to_string()),
            Err(e) => return Err(e.to_string()),
        }
        let id = itx.body.peer.id().map_err(|e| e.to_string())?;
        match itx.body.kind {
            TransactionKind::PeerAdd if peers.contains(id) => Err(format!("{} is already a validator", id)),
            TransactionKind::PeerRemove if !peers.contains(id) => Err(format!("{} is not a validator", id)),
            TransactionKind::PeerRemove if peers.len() == 1 => Err("cannot remove the last validator".to_string()),
            _ => Ok(()),
        }
    }

    /// Serve a join (or leave) proposal: validate it and pool it for our
    /// next event. Acceptance here is not a consensus decision.
    pub async fn handle_join(&self, request: JoinRequest) -> CommandResponse {
        let mut core = self.core.lock().await;
        let peers = core.peers();
        let itx = request.internal_transaction;
        let accepted = match Self::check(&itx, &peers) {
            Ok(()) => {
                info!(
                    "🤝 Queued {:?} for {} ({})",
                    itx.body.kind, itx.body.peer.moniker, itx.body.peer.net_addr
                );
                core.add_internal_transaction(itx);
                true
            }
            Err(reason) => {
                warn!("⚠️ Refused membership proposal: {}", reason);
                false
            }
        };
        CommandResponse::Join(JoinResponse {
            from_id: self.id,
            accepted,
            accepted_round: core.hashgraph().last_round(),
            peers: peers.to_vec(),
        })
    }

    fn signed_proposal(&self, kind: TransactionKind, core: &Core) -> Result<InternalTransaction, SyncError> {
        let mut itx = InternalTransaction::new(kind, self.local_peer.clone());
        itx.sign(core.signer().as_ref())?;
        Ok(itx)
    }

    /// Ask a random current validator to propose our addition.
    pub async fn join(&self) -> Result<JoinResponse, SyncError> {
        let (itx, peers) = {
            let core = self.core.lock().await;
            (self.signed_proposal(TransactionKind::PeerAdd, &core)?, core.peers())
        };
        let mut candidates: Vec<(PeerId, Peer)> = peers
            .peers()
            .filter(|(id, _)| **id != self.id)
            .map(|(id, peer)| (*id, peer.clone()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        let (target_id, target) = candidates.first().ok_or(SyncError::NoPeers)?;

        info!("🚪 Requesting to join through {} ({})", target.moniker, target.net_addr);
        let command = Command::Join(JoinRequest { internal_transaction: itx });
        match self.transport.request(&target.net_addr, command).await? {
            CommandResponse::Join(response) if response.accepted => {
                info!(
                    "✅ Join request accepted by {} at round {}",
                    response.from_id, response.accepted_round
                );
                Ok(response)
            }
            CommandResponse::Join(response) => Err(SyncError::MembershipRejected {
                reason: format!("refused by {}", response.from_id),
            }),
            CommandResponse::Error(reason) => Err(SyncError::MembershipRejected { reason }),
            _ => Err(SyncError::UnexpectedResponse {
                command: "join".to_string(),
                peer: *target_id,
            }),
        }
    }

    /// Propose our own removal; it rides on our next event.
    pub async fn submit_leave(&self) -> Result<(), SyncError> {
        let mut core = self.core.lock().await;
        let peers = core.peers();
        let itx = self.signed_proposal(TransactionKind::PeerRemove, &core)?;
        Self::check(&itx, &peers).map_err(|reason| SyncError::MembershipRejected { reason })?;
        core.add_internal_transaction(itx);
        info!("👋 Submitted leave request");
        Ok(())
    }

    /// Wait until our removal is accepted and in force at our newest round.
    /// Returns whether that happened before the timeout.
    pub async fn wait_for_removal(&self) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let core = self.core.lock().await;
                let hashgraph = core.hashgraph();
                if !core.peers().contains(self.id)
                    && !hashgraph.peer_set_at(hashgraph.last_round()).contains(self.id)
                {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                debug!("Timed out waiting for removal of {}", self.id);
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
