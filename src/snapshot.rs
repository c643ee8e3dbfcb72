//! Snapshot persistence: the chain, its tuning knobs and the miner key in
//! one JSON document. The UTXO ledger is never persisted; it is re-folded
//! from the chain on load.

use crate::node::NodeState;
use cosmos_core::Block;
use serde::{Deserialize, Serialize};
use shared::Result;
use std::path::PathBuf;
use tracing::warn;

/// On-disk layout of the snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub chain: Vec<Block>,
    pub difficulty: u32,
    pub mining_reward: u64,
    pub miner_key: String,
    pub timestamp: i64,
}

/// Reads and atomically rewrites the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads the snapshot. An absent or malformed file yields `None`; the
    /// caller starts a fresh chain in that case.
    #[must_use]
    pub fn load(&self) -> Option<Snapshot> {
        let bytes = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(
                    "snapshot at {} is malformed, starting fresh: {e}",
                    self.path.display()
                );
                None
            }
        }
    }

    /// Persists the node state. The document is written to a temp file and
    /// renamed into place, so a crash mid-write never corrupts the previous
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error; the in-memory state is
    /// unaffected either way.
    pub fn save(&self, state: &NodeState) -> Result<()> {
        let snapshot = Snapshot {
            chain: state.chain.blocks().to_vec(),
            difficulty: state.chain.difficulty(),
            mining_reward: state.mining_reward,
            miner_key: state.keys.secret_hex(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
