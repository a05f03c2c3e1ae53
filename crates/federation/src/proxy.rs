//! Boundary between the consensus node and the application.
//!
//! The node hands committed blocks to an [`AppProxy`] and receives the
//! application's state hash in return. Transactions flow the other way through
//! the proxy's submit channel. [`InmemProxy`] wires the proxy to in-process
//! handlers; [`DummyApp`] is a small state machine used by the simulator and
//! the tests.

use hashweave_protocol::Block;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::errors::ProxyError;

/// Capacity of the transaction submit queue
const SUBMIT_QUEUE: usize = 1024;

pub trait AppProxy: Send + Sync {
    /// Apply a committed block and return the resulting state hash, which must
    /// not be empty.
    fn commit_block(&self, block: &Block) -> Result<Vec<u8>, ProxyError>;

    /// Application snapshot taken right after `block_index` was committed.
    fn get_snapshot(&self, block_index: u64) -> Result<Vec<u8>, ProxyError>;

    /// Replace the application state with a snapshot and return its state hash.
    fn restore(&self, snapshot: &[u8]) -> Result<Vec<u8>, ProxyError>;

    /// Report an unrecoverable node error to the application.
    fn on_exception(&self, message: &str);

    /// Transactions submitted by the application. Only the first call gets it.
    fn submit_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
}

/// In-process block handling
pub trait CommitHandler: Send + Sync {
    fn commit(&self, block: &Block) -> Result<Vec<u8>, ProxyError>;
    fn snapshot(&self, block_index: u64) -> Result<Vec<u8>, ProxyError>;
    fn restore(&self, snapshot: &[u8]) -> Result<Vec<u8>, ProxyError>;
}

pub trait ExceptionHandler: Send + Sync {
    fn on_exception(&self, message: &str);
}

/// Exception handler that only logs
#[derive(Debug, Default)]
pub struct LogExceptions;

impl ExceptionHandler for LogExceptions {
    fn on_exception(&self, message: &str) {
        error!("💥 Node exception: {}", message);
    }
}

/// Proxy calling straight into in-process handlers
pub struct InmemProxy {
    commit: Arc<dyn CommitHandler>,
    exceptions: Arc<dyn ExceptionHandler>,
    submit_tx: mpsc::Sender<Vec<u8>>,
    submit_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl InmemProxy {
    pub fn new(commit: Arc<dyn CommitHandler>, exceptions: Arc<dyn ExceptionHandler>) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE);
        Self {
            commit,
            exceptions,
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
        }
    }

    /// Queue a transaction for inclusion in a future event. The bytes are
    /// copied.
    pub fn submit_tx(&self, tx: &[u8]) -> Result<(), ProxyError> {
        self.submit_tx
            .try_send(tx.to_vec())
            .map_err(|_| ProxyError::SubmitUnavailable)
    }
}

impl AppProxy for InmemProxy {
    fn commit_block(&self, block: &Block) -> Result<Vec<u8>, ProxyError> {
        self.commit.commit(block)
    }

    fn get_snapshot(&self, block_index: u64) -> Result<Vec<u8>, ProxyError> {
        self.commit.snapshot(block_index)
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.commit.restore(snapshot)
    }

    fn on_exception(&self, message: &str) {
        self.exceptions.on_exception(message)
    }

    fn submit_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.submit_rx.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[derive(Debug, Default)]
struct DummyState {
    state_hash: [u8; 32],
    committed: Vec<Vec<u8>>,
    snapshots: BTreeMap<u64, [u8; 32]>,
}

/// Application that chains a hash over every committed transaction.
#[derive(Debug, Default)]
pub struct DummyApp {
    state: Mutex<DummyState>,
}

impl DummyApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions committed since start or the last restore.
    pub fn committed(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|s| s.committed.clone())
            .unwrap_or_default()
    }

    pub fn state_hash(&self) -> [u8; 32] {
        self.state.lock().map(|s| s.state_hash).unwrap_or_default()
    }
}

impl CommitHandler for DummyApp {
    fn commit(&self, block: &Block) -> Result<Vec<u8>, ProxyError> {
        let mut state = self.state.lock().map_err(|_| ProxyError::Commit {
            index: block.index(),
            reason: "state lock poisoned".to_string(),
        })?;
        for tx in block.transactions() {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&state.state_hash);
            hasher.update(tx);
            state.state_hash = *hasher.finalize().as_bytes();
            state.committed.push(tx.clone());
        }
        let hash = state.state_hash;
        state.snapshots.insert(block.index(), hash);
        debug!(
            "Committed block {} ({} txs), state {}",
            block.index(),
            block.transactions().len(),
            hex::encode(&hash[..8])
        );
        Ok(hash.to_vec())
    }

    fn snapshot(&self, block_index: u64) -> Result<Vec<u8>, ProxyError> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.snapshots.get(&block_index).map(|h| h.to_vec()))
            .ok_or(ProxyError::SnapshotNotFound { index: block_index })
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let hash: [u8; 32] = snapshot.try_into().map_err(|_| ProxyError::Restore {
            reason: format!("snapshot must be 32 bytes, got {}", snapshot.len()),
        })?;
        let mut state = self.state.lock().map_err(|_| ProxyError::Restore {
            reason: "state lock poisoned".to_string(),
        })?;
        state.state_hash = hash;
        state.committed.clear();
        Ok(hash.to_vec())
    }
}
