//! Hashweave hashgraph
//!
//! The consensus core: a validated event DAG ([`EventStore`]) on a pluggable
//! [`Store`], virtual voting over it ([`Hashgraph`]) and block production
//! ([`BlockManager`]).

pub mod block_manager;
pub mod errors;
pub mod event_store;
pub mod hashgraph;
pub mod round;
pub mod sled_store;
pub mod store;

pub use block_manager::BlockManager;
pub use errors::{HashgraphError, StoreError};
pub use event_store::{see, strongly_see, EventStore, InsertOutcome};
pub use hashgraph::{ConsensusConfig, Hashgraph};
pub use round::{Fame, RoundInfo};
pub use sled_store::SledStore;
pub use store::{InmemStore, Store, StoreResult};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, HashgraphError>;
