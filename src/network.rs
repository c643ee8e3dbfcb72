//! Peer gossip over WebSockets.
//!
//! Every peer connection is a duplex JSON message stream. Frames carry a
//! `type` tag, a `data` payload and a `timestamp`. Messages from one peer
//! are handled in arrival order; ordering across peers is undefined.

use crate::node::SharedState;
use crate::snapshot::SnapshotStore;
use cosmos_core::{Block, Transaction};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

/// How often a PING goes out on each connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A peer that has not answered with a PONG within this window is
/// terminated.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(60);

pub type PeerId = u64;

/// One gossip frame: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    pub timestamp: i64,
}

impl Envelope {
    fn now(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Message kinds of the peer protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Handshake {
        chain_height: u64,
        node_info: String,
    },
    RequestChain {},
    ReceiveChain(Vec<Block>),
    RequestLatest {},
    ReceiveLatest(Box<Block>),
    NewTransaction(Box<Transaction>),
    NewBlock(Box<Block>),
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

struct PeerHandle {
    address: String,
    sender: mpsc::UnboundedSender<Envelope>,
    chain_height: u64,
}

/// A connected peer as reported to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: String,
    pub chain_height: u64,
}

/// The peer table and the message routing around it.
pub struct Gossip {
    state: SharedState,
    store: SnapshotStore,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    next_peer_id: AtomicU64,
    node_info: String,
}

impl Gossip {
    #[must_use]
    pub fn new(state: SharedState, store: SnapshotStore, node_info: String) -> Self {
        Self {
            state,
            store,
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(0),
            node_info,
        }
    }

    /// Binds the gossip port and keeps accepting peers in the background.
    ///
    /// # Errors
    ///
    /// Returns a network error when the port cannot be bound.
    pub async fn listen(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| BlockchainError::NetworkError(format!("bind port {port}: {e}")))?;
        info!("gossip listening on port {port}");

        let gossip = self;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let gossip = Arc::clone(&gossip);
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => gossip.run_peer(ws, remote.to_string()).await,
                                Err(e) => {
                                    warn!("websocket handshake with {remote} failed: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        });
        Ok(())
    }

    /// Dials a peer. A failed attempt surfaces the error to the caller and
    /// is not retried.
    ///
    /// # Errors
    ///
    /// Returns a network error when the dial or websocket upgrade fails.
    pub async fn connect(self: Arc<Self>, uri: &str) -> Result<()> {
        let (ws, _) = connect_async(uri)
            .await
            .map_err(|e| BlockchainError::NetworkError(format!("dial {uri}: {e}")))?;
        let gossip = self;
        let address = uri.to_string();
        tokio::spawn(async move {
            gossip.run_peer(ws, address).await;
        });
        Ok(())
    }

    /// The per-connection task: registers the peer, sends our HANDSHAKE,
    /// then multiplexes outbound frames, inbound frames and the heartbeat
    /// until the stream closes or the peer goes silent.
    async fn run_peer<S>(self: Arc<Self>, ws: WebSocketStream<S>, address: String)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut outbound) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().insert(
            peer_id,
            PeerHandle {
                address: address.clone(),
                sender: sender.clone(),
                chain_height: 0,
            },
        );
        info!("peer {peer_id} connected ({address})");

        let chain_height = self.state.read().await.chain.height();
        let _ = sender.send(Envelope::now(Payload::Handshake {
            chain_height,
            node_info: self.node_info.clone(),
        }));

        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > PEER_TIMEOUT {
                        warn!("peer {peer_id} missed its heartbeat, terminating");
                        break;
                    }
                    let _ = sender.send(Envelope::now(Payload::Ping {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    }));
                }
                frame = outbound.recv() => {
                    let Some(envelope) = frame else { break };
                    match serde_json::to_string(&envelope) {
                        Ok(text) => {
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("failed to encode frame for peer {peer_id}: {e}"),
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => match envelope.payload {
                                    Payload::Ping { timestamp } => {
                                        let _ = sender.send(Envelope::now(Payload::Pong {
                                            timestamp,
                                        }));
                                    }
                                    Payload::Pong { .. } => {
                                        last_pong = Instant::now();
                                    }
                                    payload => self.handle(peer_id, payload).await,
                                },
                                Err(e) => {
                                    warn!("malformed frame from peer {peer_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("peer {peer_id} stream error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        self.peers.lock().unwrap().remove(&peer_id);
        info!("peer {peer_id} disconnected");
    }

    /// Routes one inbound message. Every branch either applies a state
    /// change or logs the rejection; nothing propagates past the loop.
    pub async fn handle(&self, from: PeerId, payload: Payload) {
        match payload {
            Payload::Handshake {
                chain_height,
                node_info,
            } => {
                debug!("peer {from} is {node_info} at height {chain_height}");
                if let Some(peer) = self.peers.lock().unwrap().get_mut(&from) {
                    peer.chain_height = chain_height;
                }
                let ours = self.state.read().await.chain.height();
                if chain_height > ours {
                    self.send_to(from, Payload::RequestChain {});
                }
            }
            Payload::RequestChain {} => {
                let blocks = self.state.read().await.chain.blocks().to_vec();
                self.send_to(from, Payload::ReceiveChain(blocks));
            }
            Payload::ReceiveChain(blocks) => {
                let mut guard = self.state.write().await;
                let state = &mut *guard;
                match state.chain.replace(blocks) {
                    Ok(true) => {
                        info!(
                            "adopted a longer chain from peer {from}, height {}",
                            state.chain.height()
                        );
                        // Adopted blocks count as appends: anything they
                        // confirmed leaves the pool. Other survivors stay
                        // and are re-checked on the next admission pass.
                        let confirmed: Vec<_> = state
                            .mempool
                            .transactions()
                            .map(|tx| tx.tx_id().clone())
                            .filter(|id| state.chain.contains_transaction(id))
                            .collect();
                        for id in &confirmed {
                            state.mempool.remove(id);
                        }
                        if let Err(e) = self.store.save(state) {
                            warn!("snapshot write failed: {e}");
                        }
                    }
                    Ok(false) => debug!("chain from peer {from} does not beat ours"),
                    Err(e) => warn!("rejected chain from peer {from}: {e}"),
                }
            }
            Payload::RequestLatest {} => {
                let tip = self.state.read().await.chain.latest().clone();
                self.send_to(from, Payload::ReceiveLatest(Box::new(tip)));
            }
            Payload::ReceiveLatest(block) | Payload::NewBlock(block) => {
                self.handle_block(from, *block).await;
            }
            Payload::NewTransaction(tx) => {
                self.handle_transaction(from, *tx).await;
            }
            // Liveness frames are answered in the connection task.
            Payload::Ping { .. } | Payload::Pong { .. } => {}
        }
    }

    /// Sync policy for an offered tip: a valid direct successor is appended
    /// and re-gossiped; a tip we already hold is dropped silently; a tip
    /// ahead of us means we are behind by more than one or forked, so the
    /// full chain is requested from everyone.
    async fn handle_block(&self, from: PeerId, block: Block) {
        let mut state = self.state.write().await;
        let tip_index = state.chain.latest().index;
        let tip_hash = state.chain.latest().hash.clone();

        if state.chain.block_by_hash(&block.hash).is_some() {
            debug!("block {} already known, dropping", block.hash);
            return;
        }
        if block.index == tip_index + 1 && block.previous_hash == tip_hash {
            match state.chain.try_append(block.clone()) {
                Ok(()) => {
                    state.mempool.remove_included(&block);
                    if let Err(e) = self.store.save(&state) {
                        warn!("snapshot write failed: {e}");
                    }
                    drop(state);
                    info!("appended block {} from peer {from}", block.index);
                    self.broadcast(Payload::NewBlock(Box::new(block)), Some(from));
                }
                Err(e) => warn!("invalid block from peer {from}: {e}"),
            }
        } else if block.index > tip_index {
            debug!(
                "tip {} from peer {from} does not link to ours at {tip_index}, requesting chains",
                block.index
            );
            drop(state);
            self.broadcast(Payload::RequestChain {}, None);
        } else {
            debug!("stale block {} from peer {from} ignored", block.index);
        }
    }

    /// Gossiped transactions: duplicates are dropped silently, admission
    /// failures are only logged, fresh admissions are relayed onwards to
    /// every peer except the sender.
    async fn handle_transaction(&self, from: PeerId, tx: Transaction) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.mempool.contains(tx.tx_id()) || state.chain.contains_transaction(tx.tx_id()) {
            debug!("transaction {} already known, dropping", tx.tx_id());
            return;
        }
        match state.mempool.add(tx.clone(), state.chain.utxo()) {
            Ok(()) => {
                drop(guard);
                debug!("pooled transaction {} from peer {from}", tx.tx_id());
                self.broadcast(Payload::NewTransaction(Box::new(tx)), Some(from));
            }
            Err(e) => debug!("rejected transaction from peer {from}: {e}"),
        }
    }

    /// Sends a frame to every connected peer, optionally excluding the one
    /// it came from.
    pub fn broadcast(&self, payload: Payload, except: Option<PeerId>) {
        let peers = self.peers.lock().unwrap();
        for (id, peer) in peers.iter() {
            if Some(*id) == except {
                continue;
            }
            let _ = peer.sender.send(Envelope::now(payload.clone()));
        }
    }

    fn send_to(&self, peer_id: PeerId, payload: Payload) {
        if let Some(peer) = self.peers.lock().unwrap().get(&peer_id) {
            let _ = peer.sender.send(Envelope::now(payload));
        }
    }

    /// Initial sync: ask the peer reporting the greatest height for its
    /// full chain.
    pub async fn synchronize(&self) {
        let ours = self.state.read().await.chain.height();
        let best = self
            .peers
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|(_, peer)| peer.chain_height)
            .map(|(id, peer)| (*id, peer.chain_height));
        match best {
            Some((peer_id, height)) if height > ours => {
                info!("syncing from peer {peer_id} at height {height}");
                self.send_to(peer_id, Payload::RequestChain {});
            }
            _ => debug!("no peer is ahead of us, nothing to sync"),
        }
    }

    #[must_use]
    pub fn peer_list(&self) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, peer)| PeerInfo {
                id: *id,
                address: peer.address.clone(),
                chain_height: peer.chain_height,
            })
            .collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeState, SharedState};
    use cosmos_core::{Chain, Mempool};
    use shared::KeyPair;
    use tokio::sync::RwLock;

    fn temp_store(tag: &str) -> SnapshotStore {
        SnapshotStore::new(std::env::temp_dir().join(format!(
            "cosmos-gossip-{tag}-{}.json",
            std::process::id()
        )))
    }

    fn build_gossip(tag: &str) -> (Arc<Gossip>, KeyPair, SharedState) {
        let keys = KeyPair::generate();
        let chain = Chain::with_genesis(keys.address(), 50, 1).unwrap();
        let state: SharedState = Arc::new(RwLock::new(NodeState {
            chain,
            mempool: Mempool::new(),
            mining_reward: 50,
            keys: keys.clone(),
        }));
        let gossip = Arc::new(Gossip::new(
            Arc::clone(&state),
            temp_store(tag),
            "cosmos-node/test".to_string(),
        ));
        (gossip, keys, state)
    }

    async fn mined_successor(state: &SharedState, miner: &KeyPair) -> Block {
        let guard = state.read().await;
        let tip = guard.chain.latest();
        let coinbase = Transaction::coinbase(miner.address(), 50).unwrap();
        let mut block = Block::new(
            tip.index + 1,
            tip.hash.clone(),
            tip.timestamp + 1_000,
            vec![coinbase],
        )
        .unwrap();
        block.mine(guard.chain.difficulty()).unwrap();
        block
    }

    #[test]
    fn frames_carry_type_data_and_timestamp() {
        let envelope = Envelope::now(Payload::Ping { timestamp: 42 });
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(json["type"], "PING");
        assert_eq!(json["data"]["timestamp"], 42);
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn message_kinds_use_the_wire_names() {
        let kinds = [
            (Payload::RequestChain {}, "REQUEST_CHAIN"),
            (Payload::RequestLatest {}, "REQUEST_LATEST"),
            (
                Payload::Handshake {
                    chain_height: 0,
                    node_info: String::new(),
                },
                "HANDSHAKE",
            ),
            (Payload::Ping { timestamp: 0 }, "PING"),
            (Payload::Pong { timestamp: 0 }, "PONG"),
        ];
        for (payload, expected) in kinds {
            let json: serde_json::Value =
                serde_json::from_str(&serde_json::to_string(&Envelope::now(payload)).unwrap())
                    .unwrap();
            assert_eq!(json["type"], expected);
        }
    }

    #[tokio::test]
    async fn envelope_round_trips_blocks_and_transactions() {
        let (_, keys, state) = build_gossip("roundtrip");
        let block = mined_successor(&state, &keys).await;

        let envelope = Envelope::now(Payload::NewBlock(Box::new(block.clone())));
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        match back.payload {
            Payload::NewBlock(b) => assert_eq!(*b, block),
            other => panic!("wrong payload kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_successor_is_appended() {
        let (gossip, keys, state) = build_gossip("append");
        let block = mined_successor(&state, &keys).await;

        gossip.handle(0, Payload::NewBlock(Box::new(block))).await;

        assert_eq!(state.read().await.chain.height(), 1);
    }

    #[tokio::test]
    async fn known_tip_is_dropped_silently() {
        let (gossip, keys, state) = build_gossip("dedup");
        let block = mined_successor(&state, &keys).await;
        gossip
            .handle(0, Payload::NewBlock(Box::new(block.clone())))
            .await;

        // The same block echoed back from another peer changes nothing.
        gossip.handle(1, Payload::NewBlock(Box::new(block))).await;

        assert_eq!(state.read().await.chain.height(), 1);
    }

    #[tokio::test]
    async fn stale_block_is_ignored() {
        let (gossip, keys, state) = build_gossip("stale");
        let genesis = state.read().await.chain.latest().clone();
        let successor = mined_successor(&state, &keys).await;
        gossip
            .handle(0, Payload::NewBlock(Box::new(successor)))
            .await;

        gossip.handle(1, Payload::NewBlock(Box::new(genesis))).await;

        assert_eq!(state.read().await.chain.height(), 1);
    }

    #[tokio::test]
    async fn longer_chain_offer_replaces_ours() {
        let (gossip, _, state) = build_gossip("replace");

        let rival = KeyPair::generate();
        let mut rival_chain = Chain::with_genesis(rival.address(), 50, 1).unwrap();
        for _ in 0..2 {
            let tip = rival_chain.latest();
            let coinbase = Transaction::coinbase(rival.address(), 50).unwrap();
            let mut block = Block::new(
                tip.index + 1,
                tip.hash.clone(),
                tip.timestamp + 1_000,
                vec![coinbase],
            )
            .unwrap();
            block.mine(rival_chain.difficulty()).unwrap();
            rival_chain.try_append(block).unwrap();
        }

        gossip
            .handle(0, Payload::ReceiveChain(rival_chain.blocks().to_vec()))
            .await;

        let state = state.read().await;
        assert_eq!(state.chain.height(), 2);
        assert_eq!(state.chain.utxo().balance(&rival.address()), 600);
    }

    #[tokio::test]
    async fn shorter_chain_offer_is_refused() {
        let (gossip, keys, state) = build_gossip("refuse");
        let successor = mined_successor(&state, &keys).await;
        gossip
            .handle(0, Payload::NewBlock(Box::new(successor)))
            .await;

        let rival = KeyPair::generate();
        let rival_chain = Chain::with_genesis(rival.address(), 50, 1).unwrap();
        gossip
            .handle(1, Payload::ReceiveChain(rival_chain.blocks().to_vec()))
            .await;

        let state = state.read().await;
        assert_eq!(state.chain.height(), 1);
        assert_eq!(state.chain.utxo().balance(&rival.address()), 0);
    }

    #[tokio::test]
    async fn gossiped_transaction_lands_in_the_mempool() {
        let (gossip, keys, state) = build_gossip("tx");
        let recipient = KeyPair::generate();
        let mut tx =
            Transaction::transfer(keys.address(), recipient.address(), 100, 1).unwrap();
        tx.sign(&keys).unwrap();

        gossip
            .handle(0, Payload::NewTransaction(Box::new(tx.clone())))
            .await;
        assert!(state.read().await.mempool.contains(tx.tx_id()));

        // A duplicate arrival leaves the pool unchanged.
        gossip.handle(1, Payload::NewTransaction(Box::new(tx))).await;
        assert_eq!(state.read().await.mempool.len(), 1);
    }

    #[tokio::test]
    async fn unfunded_gossiped_transaction_is_logged_not_pooled() {
        let (gossip, _, state) = build_gossip("unfunded");
        let stranger = KeyPair::generate();
        let recipient = KeyPair::generate();
        let mut tx =
            Transaction::transfer(stranger.address(), recipient.address(), 100, 1).unwrap();
        tx.sign(&stranger).unwrap();

        gossip.handle(0, Payload::NewTransaction(Box::new(tx))).await;

        assert!(state.read().await.mempool.is_empty());
    }
}
