use clap::Parser;
use cosmos_core::{Chain, Mempool};
use cosmos_node::node::{Announcement, NodeState, SharedState};
use cosmos_node::{Gossip, MiningEngine, Node, Payload, SnapshotStore};
use shared::KeyPair;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "cosmos-node")]
#[command(about = "Proof-of-work blockchain node with UTXO accounting and peer gossip")]
#[command(version)]
struct Cli {
    /// Port reserved for the external API layer
    #[arg(long, env = "LISTEN_PORT", default_value_t = 1317)]
    listen_port: u16,

    /// Gossip port peers connect to
    #[arg(long, env = "P2P_PORT", default_value_t = 6001)]
    p2p_port: u16,

    /// Comma-separated peer URIs to dial on startup (ws://host:port)
    #[arg(long, env = "PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Snapshot file holding the chain and the miner key
    #[arg(long, default_value = "cosmos-chain.json")]
    snapshot: PathBuf,

    /// Initial proof-of-work difficulty for a fresh chain
    #[arg(long, default_value_t = 2)]
    difficulty: u32,

    /// Base mining reward for a fresh chain
    #[arg(long, default_value_t = 50)]
    reward: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> shared::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("starting cosmos-node");
    let store = SnapshotStore::new(&cli.snapshot);
    let state = match store.load() {
        Some(snapshot) => {
            let keys = KeyPair::from_secret_hex(&snapshot.miner_key)?;
            let chain = Chain::from_blocks(snapshot.chain, cli.difficulty, snapshot.difficulty)?;
            info!(
                "restored chain at height {} for miner {}",
                chain.height(),
                keys.address()
            );
            NodeState {
                chain,
                mempool: Mempool::new(),
                mining_reward: snapshot.mining_reward,
                keys,
            }
        }
        None => {
            let keys = KeyPair::generate();
            let chain = Chain::with_genesis(keys.address(), cli.reward, cli.difficulty)?;
            info!("created a fresh chain, genesis credits {}", keys.address());
            let state = NodeState {
                chain,
                mempool: Mempool::new(),
                mining_reward: cli.reward,
                keys,
            };
            // Persist immediately so the miner identity survives a crash
            // before the first block.
            store.save(&state)?;
            state
        }
    };
    let state: SharedState = Arc::new(RwLock::new(state));

    let gossip = Arc::new(Gossip::new(
        Arc::clone(&state),
        store.clone(),
        format!("cosmos-node/{}", env!("CARGO_PKG_VERSION")),
    ));
    Arc::clone(&gossip).listen(cli.p2p_port).await?;
    info!("API port {} reserved for the request surface", cli.listen_port);

    for peer in cli.peers.iter().filter(|p| !p.is_empty()) {
        if let Err(e) = Arc::clone(&gossip).connect(peer).await {
            warn!("could not reach bootstrap peer {peer}: {e}");
        }
    }
    // Give the bootstrap handshakes a moment to land before picking the
    // tallest peer.
    tokio::time::sleep(Duration::from_secs(1)).await;
    gossip.synchronize().await;

    let (announce_tx, mut announce_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(MiningEngine::new(
        Arc::clone(&state),
        store.clone(),
        announce_tx.clone(),
    ));
    let node = Node::new(
        Arc::clone(&state),
        announce_tx,
        Arc::clone(&engine),
        Arc::clone(&gossip),
    );

    // Pump announcements from the state writers out to the peers.
    {
        let gossip = Arc::clone(&gossip);
        tokio::spawn(async move {
            while let Some(announcement) = announce_rx.recv().await {
                match announcement {
                    Announcement::Block(block) => {
                        gossip.broadcast(Payload::NewBlock(Box::new(block)), None);
                    }
                    Announcement::Transaction(tx) => {
                        gossip.broadcast(Payload::NewTransaction(Box::new(tx)), None);
                    }
                }
            }
        });
    }

    // Periodic status line, same cadence the rest of the logs run at.
    {
        let gossip = Arc::clone(&gossip);
        let state = Arc::clone(&state);
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.tick().await;
            loop {
                tick.tick().await;
                let (height, pending) = {
                    let state = state.read().await;
                    (state.chain.height(), state.mempool.len())
                };
                let stats = engine.statistics();
                info!(
                    "height {height}, {} peers, {pending} pending, {} blocks mined, {:.0} H/s",
                    gossip.peer_count(),
                    stats.blocks_mined,
                    stats.hash_rate
                );
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| shared::BlockchainError::IoError(e.to_string()))?;
    info!("shutdown requested");
    node.stop_mining();
    store.save(&*state.read().await)?;
    info!("node stopped");
    Ok(())
}
