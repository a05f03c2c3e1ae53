//! Simulate command implementation
//!
//! Runs a whole validator network inside one process over the in-memory
//! transport, feeds it transactions and checks that every node commits them
//! in the same order.

use anyhow::Result;
use clap::Args;
use hashweave_federation::{DummyApp, InmemNetwork, InmemProxy, LogExceptions, Node, NodeConfig, Transport};
use hashweave_protocol::{KeyPair, Peer, PeerSet, Signer};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of validators
    #[arg(short, long, default_value = "4")]
    pub nodes: usize,
    /// Number of transactions to submit
    #[arg(short, long, default_value = "20")]
    pub txs: usize,
    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    pub timeout: u64,
    /// Gossip interval in milliseconds
    #[arg(long, default_value = "10")]
    pub heartbeat: u64,
}

struct SimNode {
    node: Arc<Node>,
    app: Arc<DummyApp>,
}

/// Execute the simulate command
pub async fn execute_simulate_command(args: SimulateArgs) -> Result<()> {
    if args.nodes == 0 {
        anyhow::bail!("need at least one node");
    }
    println!("🧪 Simulating {} validators with {} transactions", args.nodes, args.txs);

    let network = InmemNetwork::new();
    let keys: Vec<KeyPair> = (0..args.nodes).map(|_| KeyPair::generate()).collect();
    let genesis = PeerSet::new(
        keys.iter()
            .enumerate()
            .map(|(i, k)| Peer::new(k.public_key_hex(), format!("sim{}", i), format!("sim{}", i)))
            .collect(),
    )?;

    let mut nodes = Vec::with_capacity(args.nodes);
    for (i, key) in keys.into_iter().enumerate() {
        let config = NodeConfig {
            moniker: format!("sim{}", i),
            heartbeat_ms: args.heartbeat,
            slow_heartbeat_ms: args.heartbeat * 5,
            ..NodeConfig::default()
        };
        let transport: Arc<dyn Transport> =
            Arc::new(network.transport(format!("sim{}", i), config.max_pool, config.tcp_timeout()));
        let app = Arc::new(DummyApp::new());
        let proxy = Arc::new(InmemProxy::new(app.clone(), Arc::new(LogExceptions)));
        let node = Node::new(config, key, genesis.clone(), transport, proxy)?;
        node.run().await?;
        nodes.push(SimNode { node, app });
    }

    let started = Instant::now();
    for n in 0..args.txs {
        let target = rand::thread_rng().gen_range(0..nodes.len());
        nodes[target].node.submit_tx(format!("tx-{}", n).as_bytes()).await;
    }

    let deadline = Duration::from_secs(args.timeout);
    while !nodes.iter().all(|n| n.app.committed().len() >= args.txs) {
        if started.elapsed() > deadline {
            print_report(&nodes).await?;
            shutdown(&nodes).await?;
            anyhow::bail!("timed out after {}s before every node committed every transaction", args.timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("All transactions committed in {:?}", started.elapsed());

    print_report(&nodes).await?;
    let reference = nodes[0].app.committed();
    let agreed = nodes.iter().all(|n| n.app.committed() == reference);
    shutdown(&nodes).await?;

    if !agreed {
        anyhow::bail!("nodes committed transactions in different orders");
    }
    println!(
        "✅ {} nodes agreed on {} transactions in {:.2}s",
        nodes.len(),
        reference.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn print_report(nodes: &[SimNode]) -> Result<()> {
    for sim in nodes {
        let stats = sim.node.get_stats().await;
        println!("{}", serde_json::to_string(&stats)?);
        println!("   state hash: {}", hex::encode(sim.app.state_hash()));
    }
    Ok(())
}

async fn shutdown(nodes: &[SimNode]) -> Result<()> {
    for sim in nodes {
        sim.node.shutdown().await?;
    }
    Ok(())
}
