//! Gossip sync between validators.
//!
//! One gossip step with a peer is a pull followed by a push:
//!
//! 1. send our known map in a `SyncRequest` and insert the events the peer
//!    returns, creating a self-event on top of them;
//! 2. send the peer an `EagerSyncRequest` with whatever its known map (carried
//!    in the `SyncResponse`) says it lacks.
//!
//! A failed push falls back to another pull. A truncated pull is reported to
//! the caller so the node can decide between pulling again and catching up
//! from a snapshot.

use hashweave_protocol::{
    Command, CommandResponse, EagerSyncRequest, EagerSyncResponse, KnownIndexes, Peer, PeerId,
    SyncRequest, SyncResponse,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{Core, SyncReport};
use crate::errors::SyncError;
use crate::peer_selector::PeerSelector;
use crate::transport::Transport;

/// Statistics for monitoring sync performance
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Total sync attempts
    pub sync_attempts: u64,
    /// Successful syncs
    pub sync_successes: u64,
    /// Failed syncs
    pub sync_failures: u64,
    /// Responses cut short by the sync limit
    pub truncated_syncs: u64,
    /// Total events sent
    pub events_sent: u64,
    /// Total events received and inserted
    pub events_received: u64,
    /// Duplicate events received
    pub duplicate_events: u64,
    /// Events that failed validation
    pub rejected_events: u64,
    /// Average sync latency (milliseconds)
    pub avg_sync_latency_ms: f64,
}

impl SyncStats {
    fn record_report(&mut self, report: &SyncReport) {
        self.events_received += report.inserted as u64;
        self.duplicate_events += report.duplicates as u64;
        self.rejected_events += report.rejected as u64;
    }

    fn record_latency(&mut self, millis: f64) {
        let n = self.sync_successes as f64;
        self.avg_sync_latency_ms = if n <= 1.0 {
            millis
        } else {
            (self.avg_sync_latency_ms * (n - 1.0) + millis) / n
        };
    }
}

/// Result of one gossip step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nobody to sync with
    Idle,
    Synced { peer: PeerId },
    /// The peer had more events than one response carries
    Truncated { peer: PeerId },
}

pub struct SyncController {
    id: PeerId,
    core: Arc<Mutex<Core>>,
    transport: Arc<dyn Transport>,
    selector: Mutex<PeerSelector>,
    stats: Mutex<SyncStats>,
    consensus: Arc<Notify>,
    sync_limit: usize,
}

impl SyncController {
    pub fn new(
        id: PeerId,
        core: Arc<Mutex<Core>>,
        transport: Arc<dyn Transport>,
        consensus: Arc<Notify>,
        sync_limit: usize,
    ) -> Self {
        Self {
            id,
            core,
            transport,
            selector: Mutex::new(PeerSelector::new(id)),
            stats: Mutex::new(SyncStats::default()),
            consensus,
            sync_limit: sync_limit.max(1),
        }
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }

    /// Run one gossip step with a randomly chosen peer.
    pub async fn gossip_once(&self) -> Result<SyncOutcome, SyncError> {
        let peers = self.core.lock().await.peers();
        let selected = self.selector.lock().await.next(&peers);
        let Some((peer_id, peer)) = selected else {
            // a lone validator still has to turn its pool into events
            if peers.len() == 1 && peers.contains(self.id) {
                let mut core = self.core.lock().await;
                if core.busy() {
                    core.add_self_event(None)?;
                    self.consensus.notify_one();
                }
            }
            return Ok(SyncOutcome::Idle);
        };

        self.stats.lock().await.sync_attempts += 1;
        let started = Instant::now();
        let result = self.sync_with(peer_id, &peer).await;
        self.selector.lock().await.finish(peer_id);

        let mut stats = self.stats.lock().await;
        match &result {
            Ok(SyncOutcome::Truncated { .. }) => {
                stats.truncated_syncs += 1;
            }
            Ok(_) => {
                stats.sync_successes += 1;
                stats.record_latency(started.elapsed().as_secs_f64() * 1000.0);
            }
            Err(e) => {
                stats.sync_failures += 1;
                debug!("Sync with {} ({}) failed: {}", peer.moniker, peer_id, e);
            }
        }
        result
    }

    async fn sync_with(&self, peer_id: PeerId, peer: &Peer) -> Result<SyncOutcome, SyncError> {
        let response = match self.pull(peer_id, peer).await {
            Err(e) if e.is_out_of_order() => {
                debug!("Out-of-order events from {}, pulling again", peer_id);
                self.pull(peer_id, peer).await?
            }
            other => other?,
        };
        if response.sync_limit {
            return Ok(SyncOutcome::Truncated { peer: peer_id });
        }
        self.push(peer_id, peer, &response.known).await?;
        Ok(SyncOutcome::Synced { peer: peer_id })
    }

    /// Ask `peer` for the events we lack and insert them.
    pub async fn pull(&self, peer_id: PeerId, peer: &Peer) -> Result<SyncResponse, SyncError> {
        let known = self.core.lock().await.known_events();
        let command = Command::Sync(SyncRequest { from_id: self.id, known });
        let mut response = match self.transport.request(&peer.net_addr, command).await? {
            CommandResponse::Sync(response) => response,
            CommandResponse::Error(reason) => return Err(SyncError::Refused { peer: peer_id, reason }),
            _ => {
                return Err(SyncError::UnexpectedResponse {
                    command: "sync".to_string(),
                    peer: peer_id,
                })
            }
        };

        let events = std::mem::take(&mut response.events);
        let result = self.core.lock().await.sync(response.from_id, events);
        self.consensus.notify_one();
        let report = result?;
        self.stats.lock().await.record_report(&report);
        if report.inserted > 0 {
            debug!("⬇️ Pulled {} events from {}", report.inserted, peer_id);
        }
        Ok(response)
    }

    /// Send `peer` the events its known map is missing.
    async fn push(&self, peer_id: PeerId, peer: &Peer, their_known: &KnownIndexes) -> Result<(), SyncError> {
        let (events, _) = self.core.lock().await.event_diff(their_known, self.sync_limit)?;
        if events.is_empty() {
            return Ok(());
        }
        let count = events.len() as u64;
        let command = Command::EagerSync(EagerSyncRequest { from_id: self.id, events });
        match self.transport.request(&peer.net_addr, command).await? {
            CommandResponse::EagerSync(EagerSyncResponse { success: true, .. }) => {
                self.stats.lock().await.events_sent += count;
                debug!("⬆️ Pushed {} events to {}", count, peer_id);
                Ok(())
            }
            CommandResponse::EagerSync(_) => {
                debug!("Eager sync rejected by {}, pulling instead", peer_id);
                self.pull(peer_id, peer).await.map(|_| ())
            }
            CommandResponse::Error(reason) => Err(SyncError::Refused { peer: peer_id, reason }),
            _ => Err(SyncError::UnexpectedResponse {
                command: "eager_sync".to_string(),
                peer: peer_id,
            }),
        }
    }

    /// Serve a pull: the events the requester lacks, up to the sync limit.
    pub async fn handle_sync(&self, request: SyncRequest) -> CommandResponse {
        let (diff, known) = {
            let core = self.core.lock().await;
            (core.event_diff(&request.known, self.sync_limit), core.known_events())
        };
        match diff {
            Ok((events, truncated)) => {
                if truncated {
                    info!("✂️ Sync response to {} truncated at {} events", request.from_id, events.len());
                }
                self.stats.lock().await.events_sent += events.len() as u64;
                CommandResponse::Sync(SyncResponse {
                    from_id: self.id,
                    sync_limit: truncated,
                    events,
                    known,
                })
            }
            Err(e) => {
                warn!("⚠️ Cannot serve sync for {}: {}", request.from_id, e);
                CommandResponse::Error(e.to_string())
            }
        }
    }

    /// Serve a push: insert what the sender thinks we lack.
    pub async fn handle_eager_sync(&self, request: EagerSyncRequest) -> CommandResponse {
        let result = self.core.lock().await.sync(request.from_id, request.events);
        self.consensus.notify_one();
        let success = match result {
            Ok(report) => {
                self.stats.lock().await.record_report(&report);
                true
            }
            Err(e) => {
                debug!("Eager sync from {} failed: {}", request.from_id, e);
                false
            }
        };
        CommandResponse::EagerSync(EagerSyncResponse {
            from_id: self.id,
            success,
        })
    }
}
