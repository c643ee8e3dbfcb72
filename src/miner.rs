//! The mining engine: builds candidate blocks over the mempool, runs the
//! proof-of-work search cooperatively, and commits solved blocks through
//! the shared writer lock.

use crate::node::{Announcement, AnnouncementSender, SharedState};
use crate::snapshot::SnapshotStore;
use cosmos_core::{Block, Transaction, MAX_BLOCK_TRANSACTIONS, POW_ROUND_ATTEMPTS};
use shared::{BlockchainError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Span over which the rolling hash rate is measured.
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Engine lifecycle. `stop()` flips Mining into Stopping; the loop observes
/// the flag at its next yield and lands back in Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningState {
    Stopped,
    Starting,
    Mining,
    Stopping,
}

/// Point-in-time counters surfaced through the status call.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatistics {
    pub total_hashes: u64,
    pub blocks_mined: u64,
    pub hash_rate: f64,
    pub average_block_time_ms: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_hashes: u64,
    blocks_mined: u64,
    started_at: Option<Instant>,
    window: VecDeque<(Instant, u64)>,
    block_time_sum_ms: u64,
    last_block_at: Option<Instant>,
}

pub struct MiningEngine {
    state: SharedState,
    store: SnapshotStore,
    announce: AnnouncementSender,
    phase: Mutex<MiningState>,
    cancel: AtomicBool,
    stats: Mutex<StatsInner>,
}

impl MiningEngine {
    #[must_use]
    pub fn new(state: SharedState, store: SnapshotStore, announce: AnnouncementSender) -> Self {
        Self {
            state,
            store,
            announce,
            phase: Mutex::new(MiningState::Stopped),
            cancel: AtomicBool::new(false),
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Spawns the mining loop.
    ///
    /// # Errors
    ///
    /// Refuses with [`BlockchainError::AlreadyMining`] when a loop already
    /// runs, or [`BlockchainError::EmptyMempool`] when nothing is pending.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase != MiningState::Stopped {
                return Err(BlockchainError::AlreadyMining);
            }
            *phase = MiningState::Starting;
        }
        if self.state.read().await.mempool.is_empty() {
            *self.phase.lock().unwrap() = MiningState::Stopped;
            return Err(BlockchainError::EmptyMempool);
        }

        self.cancel.store(false, Ordering::SeqCst);
        {
            let mut stats = self.stats.lock().unwrap();
            if stats.started_at.is_none() {
                stats.started_at = Some(Instant::now());
            }
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            *engine.phase.lock().unwrap() = MiningState::Mining;
            info!("mining started");
            if let Err(e) = engine.run().await {
                warn!("mining loop aborted: {e}");
            }
            *engine.phase.lock().unwrap() = MiningState::Stopped;
            info!("mining stopped");
        });
        Ok(())
    }

    /// Requests a stop. The flag is observed at the loop's next yield; the
    /// in-flight proof-of-work round is abandoned, not completed.
    pub fn stop(&self) {
        let mut phase = self.phase.lock().unwrap();
        if matches!(*phase, MiningState::Starting | MiningState::Mining) {
            *phase = MiningState::Stopping;
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            *self.phase.lock().unwrap(),
            MiningState::Starting | MiningState::Mining
        )
    }

    #[must_use]
    pub fn phase(&self) -> MiningState {
        *self.phase.lock().unwrap()
    }

    /// Zeroes the counters without interrupting a running loop.
    pub fn reset_statistics(&self) {
        *self.stats.lock().unwrap() = StatsInner {
            started_at: Some(Instant::now()),
            ..StatsInner::default()
        };
    }

    #[must_use]
    pub fn statistics(&self) -> EngineStatistics {
        let stats = self.stats.lock().unwrap();
        let hash_rate = match (stats.window.front(), stats.window.len()) {
            (Some((oldest, _)), n) if n > 0 => {
                let span = oldest.elapsed().as_secs_f64().max(0.001);
                #[allow(clippy::cast_precision_loss)]
                let hashes: f64 = stats.window.iter().map(|(_, n)| *n as f64).sum();
                hashes / span
            }
            _ => 0.0,
        };
        let average_block_time_ms = if stats.blocks_mined > 0 {
            stats.block_time_sum_ms / stats.blocks_mined
        } else {
            0
        };
        EngineStatistics {
            total_hashes: stats.total_hashes,
            blocks_mined: stats.blocks_mined,
            hash_rate,
            average_block_time_ms,
            uptime_ms: stats
                .started_at
                .map_or(0, |t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    async fn run(&self) -> Result<()> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            let Some((mut candidate, difficulty)) = self.assemble_candidate().await? else {
                info!("mempool drained, mining stops");
                break;
            };
            if self.search(&mut candidate, difficulty).await? {
                self.commit(candidate).await;
            }
        }
        Ok(())
    }

    /// Builds the next candidate under a read lock: the coinbase paying the
    /// miner `base_reward + fees`, followed by the fee-sorted admissible
    /// selection.
    async fn assemble_candidate(&self) -> Result<Option<(Block, u32)>> {
        let state = self.state.read().await;
        if state.mempool.is_empty() {
            return Ok(None);
        }
        let selected = state
            .mempool
            .select_for_block(MAX_BLOCK_TRANSACTIONS, state.chain.utxo());
        if selected.is_empty() {
            return Ok(None);
        }
        let fees: u64 = selected.iter().map(Transaction::fee).sum();
        let coinbase = Transaction::coinbase(state.keys.address(), state.mining_reward + fees)?;
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected);

        let tip = state.chain.latest();
        let block = Block::new(
            tip.index + 1,
            tip.hash.clone(),
            chrono::Utc::now().timestamp_millis(),
            transactions,
        )?;
        Ok(Some((block, state.chain.difficulty())))
    }

    /// Runs bounded proof-of-work rounds, yielding between them so
    /// cancellation and inbound gossip stay responsive. No lock is held
    /// during a round. Returns false when cancelled or when the tip
    /// advanced under the candidate.
    async fn search(&self, block: &mut Block, difficulty: u32) -> Result<bool> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let nonce_before = block.nonce;
            let solved = block.pow_round(difficulty, POW_ROUND_ATTEMPTS)?;
            self.record_hashes(block.nonce - nonce_before);
            if solved {
                return Ok(true);
            }
            if let Ok(state) = self.state.try_read() {
                if state.chain.latest().hash != block.previous_hash {
                    debug!("tip advanced during the search, abandoning candidate");
                    return Ok(false);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Re-validates against the current tip and commits: append, mempool
    /// cleanup, snapshot, announcement. Failures are logged, never fatal to
    /// the loop.
    async fn commit(&self, block: Block) {
        let mut state = self.state.write().await;
        if state.chain.latest().hash != block.previous_hash {
            debug!("tip advanced before commit, discarding solved block");
            return;
        }
        if let Err(e) = state.chain.try_append(block.clone()) {
            warn!("solved block no longer validates: {e}");
            return;
        }
        state.mempool.remove_included(&block);
        if let Err(e) = self.store.save(&state) {
            warn!("snapshot write failed: {e}");
        }
        drop(state);

        self.record_block();
        info!("mined block {} ({})", block.index, block.hash);
        let _ = self.announce.send(Announcement::Block(block));
    }

    fn record_hashes(&self, hashes: u64) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_hashes += hashes;
        let now = Instant::now();
        stats.window.push_back((now, hashes));
        while let Some((at, _)) = stats.window.front() {
            if now.duration_since(*at) > RATE_WINDOW {
                stats.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_block(&self) {
        let mut stats = self.stats.lock().unwrap();
        let now = Instant::now();
        let since = stats.last_block_at.or(stats.started_at);
        if let Some(at) = since {
            stats.block_time_sum_ms +=
                u64::try_from(now.duration_since(at).as_millis()).unwrap_or(u64::MAX);
        }
        stats.last_block_at = Some(now);
        stats.blocks_mined += 1;
    }
}
