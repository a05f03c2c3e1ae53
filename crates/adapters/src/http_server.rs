//! HTTP service for a running node.
//!
//! | Route             | Method | Response                           |
//! |-------------------|--------|------------------------------------|
//! | `/peers`          | GET    | newest accepted peer set           |
//! | `/genesispeers`   | GET    | genesis peer set                   |
//! | `/stats`          | GET    | node statistics                    |
//! | `/blocks/:index`  | GET    | block by index, 404 when unknown   |
//! | `/tx`             | POST   | raw body queued as a transaction   |

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use hashweave_federation::{Node, NodeStats};
use hashweave_protocol::{Block, Peer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for the HTTP service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Clone)]
struct ApiState {
    node: Arc<Node>,
}

/// Build the router over `node`.
pub fn create_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/peers", get(peers_handler))
        .route("/genesispeers", get(genesis_peers_handler))
        .route("/stats", get(stats_handler))
        .route("/blocks/:index", get(block_handler))
        .route("/tx", post(submit_tx_handler))
        .with_state(ApiState { node })
}

async fn peers_handler(State(state): State<ApiState>) -> Json<Vec<Peer>> {
    Json(state.node.get_peers().await)
}

async fn genesis_peers_handler(State(state): State<ApiState>) -> Json<Vec<Peer>> {
    Json(state.node.get_genesis_peers().await)
}

async fn stats_handler(State(state): State<ApiState>) -> Json<NodeStats> {
    Json(state.node.get_stats().await)
}

async fn block_handler(
    State(state): State<ApiState>,
    Path(index): Path<u64>,
) -> Result<Json<Block>, StatusCode> {
    state
        .node
        .get_block(index)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn submit_tx_handler(State(state): State<ApiState>, body: Bytes) -> StatusCode {
    if body.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    debug!("Accepted {}-byte transaction over HTTP", body.len());
    state.node.submit_tx(&body).await;
    StatusCode::ACCEPTED
}

/// HTTP service bound to one node
pub struct HttpServer {
    config: ServerConfig,
    node: Arc<Node>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, node: Arc<Node>) -> Self {
        Self { config, node }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until the listener fails.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        info!("🌍 HTTP service listening on {}", listener.local_addr()?);
        axum::serve(listener, create_router(self.node.clone())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use hashweave_federation::{DummyApp, InmemNetwork, InmemProxy, LogExceptions, NodeConfig, Transport};
    use hashweave_protocol::{KeyPair, PeerSet, Signer};
    use std::time::Duration;
    use tower::ServiceExt;

    /// A single validator on its own in-memory network.
    async fn lone_node() -> Arc<Node> {
        let key = KeyPair::generate();
        let genesis = PeerSet::new(vec![Peer::new(key.public_key_hex(), "solo", "solo")]).unwrap();
        let network = InmemNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.transport("solo", 2, Duration::from_millis(200)));
        let proxy = Arc::new(InmemProxy::new(Arc::new(DummyApp::new()), Arc::new(LogExceptions)));
        let config = NodeConfig {
            moniker: "solo".to_string(),
            heartbeat_ms: 5,
            slow_heartbeat_ms: 20,
            ..NodeConfig::default()
        };
        let node = Node::new(config, key, genesis, transport, proxy).unwrap();
        node.run().await.unwrap();
        node
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_peers_and_stats() {
        let node = lone_node().await;
        let app = create_router(node.clone());

        let (status, peers) = get(app.clone(), "/peers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(peers.as_array().unwrap().len(), 1);
        assert_eq!(peers[0]["moniker"], "solo");

        let (status, genesis) = get(app.clone(), "/genesispeers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(genesis, peers);

        let (status, stats) = get(app, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["moniker"], "solo");
        assert_eq!(stats["state"], "Babbling");
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_block_is_not_found() {
        let node = lone_node().await;
        let (status, _) = get(create_router(node.clone()), "/blocks/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        node.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submitted_transaction_lands_in_a_block() {
        let node = lone_node().await;
        let app = create_router(node.clone());

        let empty = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/tx").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tx")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let started = tokio::time::Instant::now();
        loop {
            let (status, block) = get(app.clone(), "/blocks/0").await;
            if status == StatusCode::OK {
                assert_eq!(block["body"]["index"], 0);
                break;
            }
            assert!(started.elapsed() < Duration::from_secs(30), "no block produced");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        node.shutdown().await.unwrap();
    }
}
