//! The owning node structure: one authoritative writer over the chain,
//! mempool and miner identity, plus the operations the external API layer
//! drives.

use crate::miner::MiningEngine;
use crate::network::{Gossip, PeerInfo};
use cosmos_core::{Block, Chain, Mempool, RawTransaction, Transaction};
use serde::Serialize;
use shared::{Address, BlockchainError, Hash, KeyPair, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Everything gossip handlers, the mining engine and API calls serialize
/// their writes through.
pub struct NodeState {
    pub chain: Chain,
    pub mempool: Mempool,
    pub mining_reward: u64,
    pub keys: KeyPair,
}

pub type SharedState = Arc<RwLock<NodeState>>;

/// Outbound gossip events, carried over an explicit channel from the state
/// writers to the network task.
#[derive(Debug, Clone)]
pub enum Announcement {
    Block(Block),
    Transaction(Transaction),
}

pub type AnnouncementSender = mpsc::UnboundedSender<Announcement>;

/// Result of a successful transaction submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub tx_id: Hash,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

/// A transaction located by id, with its confirmation depth.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub transaction: Transaction,
    pub status: TxStatus,
    pub confirmations: u64,
}

/// Mining engine status as surfaced to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct MiningStatus {
    pub is_active: bool,
    pub current_difficulty: u32,
    pub hash_rate: f64,
    pub blocks_mined: u64,
    pub average_block_time_ms: u64,
    pub uptime_ms: u64,
    pub pending_tx_count: usize,
}

/// The assembled node, handed to the request surface.
pub struct Node {
    state: SharedState,
    announce: AnnouncementSender,
    engine: Arc<MiningEngine>,
    gossip: Arc<Gossip>,
}

impl Node {
    #[must_use]
    pub fn new(
        state: SharedState,
        announce: AnnouncementSender,
        engine: Arc<MiningEngine>,
        gossip: Arc<Gossip>,
    ) -> Self {
        Self {
            state,
            announce,
            engine,
            gossip,
        }
    }

    /// Admits an externally signed transaction into the mempool and gossips
    /// it to the peers.
    ///
    /// # Errors
    ///
    /// Surfaces the admission failure: Malformed, InvalidSignature,
    /// InsufficientFunds or Duplicate.
    pub async fn submit_transaction(&self, raw: RawTransaction) -> Result<SubmitReceipt> {
        let tx = Transaction::try_from(raw)?;
        let mut guard = self.state.write().await;
        if guard.chain.contains_transaction(tx.tx_id()) {
            return Err(BlockchainError::DuplicateTransaction(tx.tx_id().to_string()));
        }
        let state = &mut *guard;
        state.mempool.add(tx.clone(), state.chain.utxo())?;
        drop(guard);

        let tx_id = tx.tx_id().clone();
        let _ = self.announce.send(Announcement::Transaction(tx));
        Ok(SubmitReceipt {
            tx_id,
            status: "pending",
        })
    }

    /// Starts the mining engine.
    ///
    /// # Errors
    ///
    /// Refuses with `EmptyMempool` when nothing is pending, or
    /// `AlreadyMining` when the engine already runs.
    pub async fn start_mining(&self) -> Result<()> {
        self.engine.start().await
    }

    /// Flags the mining loop to stop at its next yield point.
    pub fn stop_mining(&self) {
        self.engine.stop();
    }

    pub fn reset_statistics(&self) {
        self.engine.reset_statistics();
    }

    /// Overrides the difficulty used for the next candidate block.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] outside `1..=10`.
    pub async fn set_difficulty(&self, difficulty: u32) -> Result<()> {
        if !(1..=10).contains(&difficulty) {
            return Err(BlockchainError::Malformed(format!(
                "difficulty must be within 1..=10, got {difficulty}"
            )));
        }
        self.state.write().await.chain.set_difficulty(difficulty);
        Ok(())
    }

    /// Sets the base reward paid by the next coinbase.
    pub async fn set_reward(&self, reward: u64) {
        self.state.write().await.mining_reward = reward;
    }

    pub async fn mining_status(&self) -> MiningStatus {
        let state = self.state.read().await;
        let stats = self.engine.statistics();
        MiningStatus {
            is_active: self.engine.is_active(),
            current_difficulty: state.chain.difficulty(),
            hash_rate: stats.hash_rate,
            blocks_mined: stats.blocks_mined,
            average_block_time_ms: stats.average_block_time_ms,
            uptime_ms: stats.uptime_ms,
            pending_tx_count: state.mempool.len(),
        }
    }

    pub async fn latest_block(&self) -> Block {
        self.state.read().await.chain.latest().clone()
    }

    pub async fn block_by_height(&self, height: u64) -> Option<Block> {
        self.state.read().await.chain.block_by_height(height).cloned()
    }

    pub async fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.state.read().await.chain.block_by_hash(hash).cloned()
    }

    /// A page of blocks starting at `offset`.
    pub async fn block_range(&self, offset: usize, limit: usize) -> Vec<Block> {
        self.state.read().await.chain.block_range(offset, limit).to_vec()
    }

    /// Looks a transaction up by id, searching the mempool before the
    /// chain. Confirmations count the blocks from the containing block to
    /// the tip.
    pub async fn transaction_report(&self, tx_id: &Hash) -> Option<TransactionReport> {
        let state = self.state.read().await;
        if let Some(tx) = state.mempool.get(tx_id) {
            return Some(TransactionReport {
                transaction: tx.clone(),
                status: TxStatus::Pending,
                confirmations: 0,
            });
        }
        state.chain.find_transaction(tx_id).map(|(block, tx)| {
            TransactionReport {
                transaction: tx.clone(),
                status: TxStatus::Confirmed,
                confirmations: state.chain.height() - block.index,
            }
        })
    }

    /// Spendable balance of an address under the current ledger.
    pub async fn balance(&self, address: &Address) -> u64 {
        self.state.read().await.chain.utxo().balance(address)
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.gossip.peer_list()
    }

    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.state
    }
}
