//! Hashweave node
//!
//! Everything around the consensus core that a running validator needs:
//! gossip sync, fast-forward from snapshots, membership changes, the
//! application proxy and the transports that carry requests between nodes.

pub mod config;
pub mod core;
pub mod errors;
pub mod fast_forward;
pub mod inmem_transport;
pub mod membership;
pub mod node;
pub mod peer_selector;
pub mod proxy;
pub mod sync;
pub mod tcp_transport;
pub mod transport;

pub use config::NodeConfig;
pub use self::core::{Core, SyncReport};
pub use errors::{ProxyError, SyncError, TransportError};
pub use fast_forward::{validate_response, FastForwardManager};
pub use inmem_transport::{InmemNetwork, InmemTransport};
pub use membership::MembershipManager;
pub use node::{Node, NodeState, NodeStats};
pub use peer_selector::PeerSelector;
pub use proxy::{AppProxy, CommitHandler, DummyApp, ExceptionHandler, InmemProxy, LogExceptions};
pub use sync::{SyncController, SyncOutcome, SyncStats};
pub use tcp_transport::TcpTransport;
pub use transport::{Rpc, Transport};
