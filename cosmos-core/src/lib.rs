pub mod block;
pub mod chain;
pub mod mempool;
pub mod transaction;
pub mod utxo;

pub use block::{merkle_root, Block, GENESIS_PREMINE_FACTOR, POW_ROUND_ATTEMPTS};
pub use chain::{Chain, RETARGET_INTERVAL, TARGET_BLOCK_TIME_MS};
pub use mempool::{Mempool, MAX_BLOCK_TRANSACTIONS};
pub use transaction::{RawTransaction, Transaction};
pub use utxo::{UtxoEntry, UtxoLedger};

pub use shared::{Address, BlockchainError, Hash, KeyPair, Result, Signature};
