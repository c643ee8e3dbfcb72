pub mod miner;
pub mod network;
pub mod node;
pub mod snapshot;

pub use miner::{EngineStatistics, MiningEngine, MiningState};
pub use network::{Envelope, Gossip, Payload, PeerInfo};
pub use node::{
    Announcement, MiningStatus, Node, NodeState, SharedState, SubmitReceipt, TransactionReport,
    TxStatus,
};
pub use snapshot::{Snapshot, SnapshotStore};
