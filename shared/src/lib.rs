pub mod crypto;
pub mod error;
pub mod hash;
pub mod keys;

pub use crypto::{recover, ripemd160, sha256, sign, verify, Signature};
pub use error::BlockchainError;
pub use hash::Hash;
pub use keys::{Address, KeyPair, ADDRESS_LEN, ADDRESS_PREFIX};

pub type Result<T> = std::result::Result<T, BlockchainError>;
