//! End-to-end tests over the in-memory transport.

use hashweave_federation::{
    DummyApp, InmemNetwork, InmemProxy, LogExceptions, Node, NodeConfig, NodeState, Transport,
};
use hashweave_protocol::{KeyPair, Peer, PeerSet, Signer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(60);

struct Member {
    node: Arc<Node>,
    app: Arc<DummyApp>,
}

fn config(moniker: &str) -> NodeConfig {
    NodeConfig {
        moniker: moniker.to_string(),
        heartbeat_ms: 5,
        slow_heartbeat_ms: 25,
        tcp_timeout_ms: 500,
        join_timeout_ms: 30_000,
        ..NodeConfig::default()
    }
}

fn genesis(keys: &[KeyPair]) -> PeerSet {
    PeerSet::new(
        keys.iter()
            .enumerate()
            .map(|(i, k)| Peer::new(k.public_key_hex(), format!("node{}", i), format!("node{}", i)))
            .collect(),
    )
    .unwrap()
}

async fn start(network: &InmemNetwork, key: KeyPair, addr: &str, genesis: PeerSet, config: NodeConfig) -> Member {
    let transport: Arc<dyn Transport> = Arc::new(network.transport(addr, 4, Duration::from_millis(500)));
    let app = Arc::new(DummyApp::new());
    let proxy = Arc::new(InmemProxy::new(app.clone(), Arc::new(LogExceptions)));
    let node = Node::new(config, key, genesis, transport, proxy).unwrap();
    node.run().await.unwrap();
    Member { node, app }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while !check().await {
        assert!(started.elapsed() < DEADLINE, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn shutdown(members: &[Member]) {
    for member in members {
        member.node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_validators_commit_identical_blocks() {
    let network = InmemNetwork::new();
    let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
    let set = genesis(&keys);

    let mut members = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let name = format!("node{}", i);
        members.push(start(&network, key, &name, set.clone(), config(&name)).await);
    }
    for (i, member) in members.iter().enumerate() {
        member.node.submit_tx(format!("tx-{}-a", i).as_bytes()).await;
        member.node.submit_tx(format!("tx-{}-b", i).as_bytes()).await;
    }

    eventually("every transaction committed everywhere", || async {
        members.iter().all(|m| m.app.committed().len() == 8)
    })
    .await;

    let reference = members[0].app.committed();
    for member in &members[1..] {
        assert_eq!(member.app.committed(), reference);
        assert_eq!(member.app.state_hash(), members[0].app.state_hash());
    }

    let block = members[0].node.get_block(0).await.unwrap();
    for member in &members[1..] {
        let other = member.node.get_block(0).await.unwrap();
        assert_eq!(other.body.transactions, block.body.transactions);
        assert_eq!(other.body.frame_hash, block.body.frame_hash);
    }

    let stats = members[0].node.get_stats().await;
    assert_eq!(stats.state, NodeState::Babbling);
    assert_eq!(stats.num_peers, 4);
    assert!(stats.consensus_transactions >= 8);
    shutdown(&members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_validator_joins() {
    let network = InmemNetwork::new();
    let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
    let set = genesis(&keys);

    let mut members = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let name = format!("node{}", i);
        members.push(start(&network, key, &name, set.clone(), config(&name)).await);
    }

    let joiner_key = KeyPair::generate();
    let joiner_id = joiner_key.peer_id();
    let joiner = start(&network, joiner_key, "node3", set.clone(), config("node3")).await;
    assert_eq!(joiner.node.get_genesis_peers().await.len(), 3);

    eventually("every node sees the joiner", || async {
        for member in members.iter().chain(std::iter::once(&joiner)) {
            let peers = member.node.get_peers().await;
            if peers.len() != 4 || !peers.iter().any(|p| p.id().unwrap() == joiner_id) {
                return false;
            }
        }
        true
    })
    .await;
    // genesis is unaffected by the change
    assert_eq!(members[0].node.get_genesis_peers().await.len(), 3);

    joiner.node.submit_tx(b"from the joiner").await;
    eventually("joiner's transaction committed", || async {
        members
            .iter()
            .all(|m| m.app.committed().contains(&b"from the joiner".to_vec()))
    })
    .await;

    members.push(joiner);
    shutdown(&members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_validator_fast_forwards() {
    let network = InmemNetwork::new();
    let mut keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
    let set = genesis(&keys);
    let late_key = keys.pop().unwrap();

    let mut members = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let name = format!("node{}", i);
        members.push(start(&network, key, &name, set.clone(), config(&name)).await);
    }
    for i in 0..6 {
        members[i % 3].node.submit_tx(format!("early-{}", i).as_bytes()).await;
    }

    // every early transaction committed, and the newest block signed by
    // enough validators to serve as an anchor
    eventually("an anchor covering the early transactions", || async {
        for member in &members {
            if member.app.committed().len() != 6 {
                return false;
            }
            let Some(last) = member.node.last_block_index().await else {
                return false;
            };
            match member.node.get_block(last).await {
                Some(block) if block.signatures.len() >= 2 => {}
                _ => return false,
            }
        }
        true
    })
    .await;

    let late_config = NodeConfig {
        enable_fast_sync: true,
        ..config("node3")
    };
    let late = start(&network, late_key, "node3", set.clone(), late_config).await;

    eventually("late node back to gossip", || async {
        late.node.state().await == NodeState::Babbling && late.node.last_block_index().await.is_some()
    })
    .await;
    // the snapshot replaced history, so the early transactions were never replayed
    assert!(late.app.committed().iter().all(|tx| !tx.starts_with(b"early")));

    members[0].node.submit_tx(b"after the snapshot").await;
    eventually("late node commits new transactions", || async {
        late.app.committed().contains(&b"after the snapshot".to_vec())
    })
    .await;

    let index = late.node.last_block_index().await.unwrap();
    eventually("block agreed by the reference node", || async {
        members[0].node.get_block(index).await.is_some()
    })
    .await;
    let ours = late.node.get_block(index).await.unwrap();
    let theirs = members[0].node.get_block(index).await.unwrap();
    assert_eq!(ours.body.transactions, theirs.body.transactions);
    eventually("matching state hashes", || async {
        let ours = late.node.get_block(index).await.unwrap();
        let theirs = members[0].node.get_block(index).await.unwrap();
        !ours.body.state_hash.is_empty() && ours.body.state_hash == theirs.body.state_hash
    })
    .await;

    members.push(late);
    shutdown(&members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_validator_leaves() {
    let network = InmemNetwork::new();
    let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
    let set = genesis(&keys);
    let leaver_id = keys[3].peer_id();

    let mut members = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let name = format!("node{}", i);
        members.push(start(&network, key, &name, set.clone(), config(&name)).await);
    }

    let leaver = members.pop().unwrap();
    let leaving = {
        let node = leaver.node.clone();
        tokio::spawn(async move { node.leave().await })
    };

    eventually("remaining nodes drop the leaver", || async {
        for member in &members {
            let peers = member.node.get_peers().await;
            if peers.len() != 3 || peers.iter().any(|p| p.id().unwrap() == leaver_id) {
                return false;
            }
        }
        true
    })
    .await;

    leaving.await.unwrap().unwrap();
    assert_eq!(leaver.node.state().await, NodeState::Shutdown);

    // the remaining three keep making progress
    members[1].node.submit_tx(b"after the leave").await;
    eventually("progress without the leaver", || async {
        members
            .iter()
            .all(|m| m.app.committed().contains(&b"after the leave".to_vec()))
    })
    .await;
    shutdown(&members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitioned_node_catches_up_by_sync() {
    let network = InmemNetwork::new();
    let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
    let set = genesis(&keys);

    let mut members = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let name = format!("node{}", i);
        members.push(start(&network, key, &name, set.clone(), config(&name)).await);
    }

    network.disconnect("node3");
    for i in 0..3 {
        members[i].node.submit_tx(format!("while-away-{}", i).as_bytes()).await;
    }
    eventually("majority commits without node3", || async {
        members[..3].iter().all(|m| m.app.committed().len() == 3)
    })
    .await;
    assert!(members[3].app.committed().is_empty());

    network.reconnect("node3");
    eventually("node3 catches up", || async { members[3].app.committed().len() == 3 }).await;
    assert_eq!(members[3].app.committed(), members[0].app.committed());
    shutdown(&members).await;
}
