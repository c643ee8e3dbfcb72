use thiserror::Error;

/// Error taxonomy shared by the chain core and the node.
#[derive(Error, Debug)]
pub enum BlockchainError {
    /// A field is missing, has the wrong type, or the wrong shape.
    /// Rejected at the boundary before it touches any state.
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("duplicate transaction {0}")]
    DuplicateTransaction(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// A received tip neither extends our chain nor links to our tip.
    /// Triggers a full chain request rather than a user-visible failure.
    #[error("chain mismatch: {0}")]
    ChainMismatch(String),

    #[error("cryptographic error: {0}")]
    CryptographicError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("empty mempool")]
    EmptyMempool,

    #[error("mining is already running")]
    AlreadyMining,
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
