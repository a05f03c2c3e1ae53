//! Node Management Module
//!
//! A [`Node`] runs the local validator: it serves inbound requests, gossips
//! with peers, runs consensus when new events arrive and hands the resulting
//! blocks to the application. Each of those is a worker task sharing the
//! [`Core`] behind one async mutex; no worker holds it across network I/O.
//!
//! The node moves between the states of [`NodeState`]:
//!
//! - `Joining` until a validator accepts its join request,
//! - `CatchingUp` while fast-forwarding from a peer's snapshot,
//! - `Babbling` during normal gossip,
//! - `Leaving` while its removal makes its way through consensus,
//! - `Suspended` when too many events are waiting for consensus,
//! - `Shutdown` once stopped.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use hashweave_hashgraph::{Hashgraph, InmemStore, SledStore};
use hashweave_protocol::{Block, Command, CommandResponse, EventHash, KeyPair, Peer, PeerId, PeerSet, Signer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::core::Core;
use crate::fast_forward::FastForwardManager;
use crate::membership::MembershipManager;
use crate::proxy::AppProxy;
use crate::sync::{SyncController, SyncOutcome, SyncStats};
use crate::transport::{Rpc, Transport};

/// Blocks waiting for the application
const COMMIT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Babbling,
    CatchingUp,
    Joining,
    Leaving,
    Suspended,
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Babbling => "Babbling",
            NodeState::CatchingUp => "CatchingUp",
            NodeState::Joining => "Joining",
            NodeState::Leaving => "Leaving",
            NodeState::Suspended => "Suspended",
            NodeState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Snapshot of a node's progress, served by the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: PeerId,
    pub moniker: String,
    pub state: NodeState,
    pub last_consensus_round: Option<i64>,
    pub last_round: i64,
    pub last_block_index: Option<u64>,
    pub consensus_events: usize,
    pub consensus_transactions: u64,
    pub undetermined_events: usize,
    pub total_events: usize,
    pub transaction_pool: usize,
    pub num_peers: usize,
    pub faulty_creators: usize,
    pub sync: SyncStats,
    pub uptime_secs: i64,
}

/// A Hashweave validator node
pub struct Node {
    id: PeerId,
    config: NodeConfig,
    local_peer: Peer,
    state: RwLock<NodeState>,
    core: Arc<Mutex<Core>>,
    transport: Arc<dyn Transport>,
    proxy: Arc<dyn AppProxy>,
    sync: SyncController,
    fast_forward: FastForwardManager,
    membership: MembershipManager,
    /// Wakes the consensus worker
    consensus: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    start_time: DateTime<Utc>,
}

impl Node {
    /// Create a node. Its storage comes from `config.data_dir`: a sled
    /// database when set, memory otherwise. A sled database that already
    /// holds events is bootstrapped.
    pub fn new(
        config: NodeConfig,
        key: KeyPair,
        genesis: PeerSet,
        transport: Arc<dyn Transport>,
        proxy: Arc<dyn AppProxy>,
    ) -> Result<Arc<Self>> {
        let hashgraph = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let store = SledStore::open(dir.join("hashgraph"), genesis.clone())?;
                if store.needs_bootstrap() {
                    Hashgraph::bootstrap(Box::new(store), config.consensus.clone())?
                } else {
                    Hashgraph::new(Box::new(store), config.consensus.clone())
                }
            }
            None => Hashgraph::new(
                Box::new(InmemStore::with_genesis(genesis)),
                config.consensus.clone(),
            ),
        };

        let local_peer = Peer::new(key.public_key_hex(), transport.local_addr(), config.moniker.clone());
        let signer: Arc<dyn Signer> = Arc::new(key);
        let mut core = Core::new(signer, hashgraph)?;
        let id = core.id();

        let peers = core.peers();
        let state = if !peers.contains(id) {
            NodeState::Joining
        } else if config.enable_fast_sync && peers.len() > 1 {
            NodeState::CatchingUp
        } else {
            NodeState::Babbling
        };
        // a catching-up node creates its first event after the snapshot
        if state == NodeState::Babbling {
            core.init()?;
        }

        let core = Arc::new(Mutex::new(core));
        let consensus = Arc::new(Notify::new());
        let sync = SyncController::new(id, core.clone(), transport.clone(), consensus.clone(), config.sync_limit);
        let fast_forward = FastForwardManager::new(id, core.clone(), transport.clone(), proxy.clone());
        let membership = MembershipManager::new(
            id,
            core.clone(),
            transport.clone(),
            local_peer.clone(),
            config.join_timeout(),
        );
        let (shutdown, _) = watch::channel(false);

        info!("🆔 Node {} ({}) created in state {}", config.moniker, id, state);
        Ok(Arc::new(Self {
            id,
            config,
            local_peer,
            state: RwLock::new(state),
            core,
            transport,
            proxy,
            sync,
            fast_forward,
            membership,
            consensus,
            shutdown,
            workers: Mutex::new(Vec::new()),
            start_time: Utc::now(),
        }))
    }

    /// Start the worker tasks. Returns once they are spawned.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let inbound = self
            .transport
            .take_consumer()
            .ok_or_else(|| anyhow!("transport consumer already taken"))?;
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_QUEUE);

        let mut workers = self.workers.lock().await;
        workers.push(tokio::spawn(self.clone().serve(inbound)));
        workers.push(tokio::spawn(self.clone().gossip_loop()));
        workers.push(tokio::spawn(self.clone().consensus_loop(commit_tx)));
        workers.push(tokio::spawn(self.clone().commit_loop(commit_rx)));
        if let Some(submissions) = self.proxy.submit_channel() {
            workers.push(tokio::spawn(self.clone().submit_loop(submissions)));
        }

        // consensus may already be pending after a bootstrap
        self.consensus.notify_one();
        info!(
            "🚀 Node {} running on {} as {}",
            self.config.moniker,
            self.local_peer.net_addr,
            self.state().await
        );
        Ok(())
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn local_peer(&self) -> &Peer {
        &self.local_peer
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    async fn set_state(&self, state: NodeState) {
        let mut current = self.state.write().await;
        if *current != state {
            info!("🔄 {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Queue a transaction for the next self-event. The bytes are copied.
    pub async fn submit_tx(&self, tx: &[u8]) {
        self.core.lock().await.add_transactions(vec![tx.to_vec()]);
    }

    /// Newest accepted peer set.
    pub async fn get_peers(&self) -> Vec<Peer> {
        self.core.lock().await.peers().to_vec()
    }

    pub async fn get_genesis_peers(&self) -> Vec<Peer> {
        self.core.lock().await.genesis_peers().to_vec()
    }

    pub async fn get_block(&self, index: u64) -> Option<Block> {
        self.core.lock().await.hashgraph().get_block(index)
    }

    pub async fn last_block_index(&self) -> Option<u64> {
        self.core.lock().await.hashgraph().last_block_index()
    }

    /// Event hashes in consensus order.
    pub async fn consensus_events(&self) -> Vec<EventHash> {
        self.core.lock().await.hashgraph().consensus_events()
    }

    pub async fn get_stats(&self) -> NodeStats {
        let sync = self.sync.stats().await;
        let state = self.state().await;
        let core = self.core.lock().await;
        let dag = core.hashgraph().stats();
        NodeStats {
            id: self.id,
            moniker: self.config.moniker.clone(),
            state,
            last_consensus_round: dag.last_consensus_round,
            last_round: dag.last_round,
            last_block_index: core.hashgraph().last_block_index(),
            consensus_events: dag.consensus_events,
            consensus_transactions: dag.consensus_transactions,
            undetermined_events: dag.undetermined_events,
            total_events: dag.total_events,
            transaction_pool: core.transaction_pool_len(),
            num_peers: core.peers().len(),
            faulty_creators: dag.faulty_creators,
            sync,
            uptime_secs: (Utc::now() - self.start_time).num_seconds(),
        }
    }

    /// Propose our removal, wait for it to take effect, then stop.
    pub async fn leave(&self) -> Result<()> {
        self.set_state(NodeState::Leaving).await;
        match self.membership.submit_leave().await {
            Ok(()) => {
                if !self.membership.wait_for_removal().await {
                    warn!("⚠️ Leaving without confirmation of removal");
                }
            }
            Err(e) => warn!("⚠️ Leave request refused: {}", e),
        }
        self.shutdown().await
    }

    /// Stop every worker and close transport and storage.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state().await == NodeState::Shutdown {
            return Ok(());
        }
        self.set_state(NodeState::Shutdown).await;
        let _ = self.shutdown.send(true);

        self.transport.close().await?;
        for handle in self.workers.lock().await.drain(..) {
            handle.abort();
        }
        self.core.lock().await.close()?;
        info!("🛑 Node {} shut down", self.config.moniker);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workers

    async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<Rpc>) {
        let permits = Arc::new(Semaphore::new(self.config.max_pool.max(1)));
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let rpc = tokio::select! {
                _ = shutdown.changed() => break,
                rpc = inbound.recv() => rpc,
            };
            let Some(rpc) = rpc else { break };
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let node = self.clone();
            tokio::spawn(async move {
                let (command, respond_to) = rpc.into_parts();
                let response = node.handle_command(command).await;
                let _ = respond_to.send(response);
                drop(permit);
            });
        }
        debug!("Request worker stopped");
    }

    async fn handle_command(&self, command: Command) -> CommandResponse {
        if self.state().await == NodeState::Shutdown {
            return CommandResponse::Error("node is shutting down".to_string());
        }
        match command {
            Command::Sync(request) => self.sync.handle_sync(request).await,
            Command::EagerSync(request) => self.sync.handle_eager_sync(request).await,
            Command::FastForward(request) => self.fast_forward.handle_request(request).await,
            Command::Join(request) => self.membership.handle_join(request).await,
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let pause = if self.core.lock().await.busy() {
                self.config.heartbeat()
            } else {
                self.config.slow_heartbeat()
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }

            match self.state().await {
                NodeState::Babbling | NodeState::Leaving => self.babble().await,
                NodeState::CatchingUp => self.catch_up().await,
                NodeState::Joining => self.join().await,
                NodeState::Suspended => {}
                NodeState::Shutdown => break,
            }
        }
        debug!("Gossip worker stopped");
    }

    async fn babble(&self) {
        match self.sync.gossip_once().await {
            Ok(SyncOutcome::Truncated { peer }) if self.config.enable_fast_sync => {
                info!("📉 Too far behind {}, catching up from a snapshot", peer);
                self.set_state(NodeState::CatchingUp).await;
            }
            Ok(_) => {}
            Err(e) => debug!("Gossip step failed: {}", e),
        }

        let (undetermined, peers) = {
            let core = self.core.lock().await;
            (core.hashgraph().undetermined_count(), core.peers().len())
        };
        if self.config.suspend_limit > 0 && undetermined > self.config.suspend_limit * peers.max(1) {
            warn!(
                "⏸️ {} undetermined events with {} peers, suspending",
                undetermined, peers
            );
            self.proxy.on_exception("node suspended: too many undetermined events");
            self.set_state(NodeState::Suspended).await;
        }
    }

    async fn catch_up(&self) {
        let peers = self.core.lock().await.peers();
        match self.fast_forward.fast_forward(&peers).await {
            Ok(block) => {
                info!("✅ Caught up to block {}", block.index());
                self.consensus.notify_one();
            }
            Err(e) => warn!("⚠️ Fast-forward failed, syncing from history instead: {}", e),
        }
        if let Err(e) = self.core.lock().await.init() {
            warn!("⚠️ Could not create the first event: {}", e);
        }
        self.set_state(NodeState::Babbling).await;
    }

    async fn join(&self) {
        match self.membership.join().await {
            Ok(_) => {
                let next = if self.config.enable_fast_sync {
                    NodeState::CatchingUp
                } else {
                    NodeState::Babbling
                };
                self.set_state(next).await;
            }
            Err(e) => {
                warn!("⚠️ Join attempt failed: {}", e);
                tokio::time::sleep(self.config.slow_heartbeat()).await;
            }
        }
    }

    async fn consensus_loop(self: Arc<Self>, blocks: mpsc::Sender<Block>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.consensus.notified() => {}
            }
            let result = self.core.lock().await.run_consensus();
            match result {
                Ok(produced) => {
                    for block in produced {
                        if blocks.send(block).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.is_recoverable() => warn!("⚠️ Consensus step failed: {}", e),
                Err(e) => {
                    error!("💥 Consensus storage failure, stopping: {}", e);
                    self.proxy.on_exception(&e.to_string());
                    // shutdown aborts this worker, so it runs on its own task
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.shutdown().await {
                            error!("Shutdown after storage failure failed: {}", e);
                        }
                    });
                    break;
                }
            }
        }
        debug!("Consensus worker stopped");
    }

    async fn commit_loop(self: Arc<Self>, mut blocks: mpsc::Receiver<Block>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let block = tokio::select! {
                _ = shutdown.changed() => break,
                block = blocks.recv() => block,
            };
            let Some(block) = block else { break };
            if !self.core.lock().await.needs_commit(block.index()) {
                debug!("Skipping block {} below the fast-forward point", block.index());
                continue;
            }
            match self.proxy.commit_block(&block) {
                Ok(state_hash) => {
                    if let Err(e) = self.core.lock().await.commit(block.index(), state_hash) {
                        warn!("⚠️ Could not sign block {}: {}", block.index(), e);
                    }
                }
                Err(e) => {
                    error!("💥 Application rejected block {}: {}", block.index(), e);
                    self.proxy.on_exception(&e.to_string());
                }
            }
        }
        debug!("Commit worker stopped");
    }

    async fn submit_loop(self: Arc<Self>, mut submissions: mpsc::Receiver<Vec<u8>>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let tx = tokio::select! {
                _ = shutdown.changed() => break,
                tx = submissions.recv() => tx,
            };
            let Some(tx) = tx else { break };
            self.core.lock().await.add_transactions(vec![tx]);
        }
    }
}
