//! In-process transport for tests and local simulations.

use async_trait::async_trait;
use hashweave_protocol::{Command, CommandResponse};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::TransportError;
use crate::transport::{Rpc, Transport};

#[derive(Default)]
struct Routes {
    nodes: HashMap<String, mpsc::Sender<Rpc>>,
    disconnected: HashSet<String>,
}

/// Shared switchboard connecting in-memory transports by address
#[derive(Clone, Default)]
pub struct InmemNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl InmemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport listening on `addr`.
    pub fn transport(&self, addr: impl Into<String>, max_pool: usize, timeout: Duration) -> InmemTransport {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(max_pool.max(1));
        if let Ok(mut routes) = self.routes.write() {
            routes.nodes.insert(addr.clone(), tx);
            routes.disconnected.remove(&addr);
        }
        InmemTransport {
            addr,
            network: self.clone(),
            consumer: Mutex::new(Some(rx)),
            timeout,
        }
    }

    /// Cut `addr` off: its requests fail and requests to it fail.
    pub fn disconnect(&self, addr: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.disconnected.insert(addr.to_string());
        }
    }

    pub fn reconnect(&self, addr: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.disconnected.remove(addr);
        }
    }

    fn route(&self, from: &str, to: &str) -> Option<mpsc::Sender<Rpc>> {
        let routes = self.routes.read().ok()?;
        if routes.disconnected.contains(from) || routes.disconnected.contains(to) {
            return None;
        }
        routes.nodes.get(to).cloned()
    }

    fn remove(&self, addr: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.nodes.remove(addr);
        }
    }
}

/// Transport endpoint registered on an [`InmemNetwork`]
pub struct InmemTransport {
    addr: String,
    network: InmemNetwork,
    consumer: Mutex<Option<mpsc::Receiver<Rpc>>>,
    timeout: Duration,
}

#[async_trait]
impl Transport for InmemTransport {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn request(&self, target: &str, command: Command) -> Result<CommandResponse, TransportError> {
        let sender = self
            .network
            .route(&self.addr, target)
            .ok_or_else(|| TransportError::Unreachable { addr: target.to_string() })?;

        let (rpc, reply) = Rpc::new(command);
        sender
            .send(rpc)
            .await
            .map_err(|_| TransportError::Unreachable { addr: target.to_string() })?;

        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Unreachable { addr: target.to_string() }),
            Err(_) => {
                debug!("In-memory request from {} to {} timed out", self.addr, target);
                Err(TransportError::Timeout { addr: target.to_string() })
            }
        }
    }

    fn take_consumer(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.consumer.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.network.remove(&self.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashweave_protocol::{FastForwardRequest, SyncRequest};

    #[tokio::test]
    async fn test_request_reaches_consumer() {
        let network = InmemNetwork::new();
        let a = network.transport("a", 2, Duration::from_millis(500));
        let b = network.transport("b", 2, Duration::from_millis(500));

        let mut inbound = b.take_consumer().unwrap();
        assert!(b.take_consumer().is_none());
        tokio::spawn(async move {
            while let Some(rpc) = inbound.recv().await {
                let name = rpc.command.name().to_string();
                rpc.respond(CommandResponse::Error(name));
            }
        });

        let response = a
            .request("b", Command::FastForward(FastForwardRequest { from_id: 1 }))
            .await
            .unwrap();
        assert_eq!(response, CommandResponse::Error("fast_forward".to_string()));
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_unreachable() {
        let network = InmemNetwork::new();
        let a = network.transport("a", 2, Duration::from_millis(100));
        let _b = network.transport("b", 2, Duration::from_millis(100));
        network.disconnect("b");

        let command = Command::Sync(SyncRequest { from_id: 1, known: Default::default() });
        let err = a.request("b", command.clone()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));

        // nobody consumes b's queue, so the request times out after reconnecting
        network.reconnect("b");
        let err = a.request("b", command).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }
}
