use crate::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 256-bit SHA-256 digest carried as a lowercase hex string of length 64.
///
/// The gossip protocol and the snapshot file both express digests as hex
/// strings, and the genesis block links backwards to the literal marker
/// `"0"`, so the hex form is the canonical representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
    /// Length of a well-formed digest in hex characters.
    pub const HEX_LEN: usize = 64;

    /// The `previous_hash` marker carried by the genesis block.
    #[must_use]
    pub fn genesis_marker() -> Self {
        Self("0".to_string())
    }

    /// Computes the SHA-256 digest of the provided data.
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parses a digest from hex, normalizing to lowercase.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] unless the input is exactly
    /// 64 hex characters.
    pub fn from_hex(input: &str) -> Result<Self> {
        let normalized = input.to_ascii_lowercase();
        if normalized.len() != Self::HEX_LEN
            || !normalized.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(BlockchainError::Malformed(format!(
                "expected a {}-character hex digest, got {input:?}",
                Self::HEX_LEN
            )));
        }
        Ok(Self(normalized))
    }

    /// Returns the hex form of the digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the digest back into its 32 raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] for the genesis marker or any
    /// other value that is not a full digest.
    pub fn to_bytes(&self) -> Result<[u8; 32]> {
        let decoded = hex::decode(&self.0)
            .map_err(|e| BlockchainError::Malformed(format!("invalid hex digest: {e}")))?;
        decoded
            .try_into()
            .map_err(|_| BlockchainError::Malformed("digest is not 32 bytes".to_string()))
    }

    /// True when the value is a full 64-character lowercase hex digest.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == Self::HEX_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Checks whether the digest satisfies the proof-of-work target
    /// (number of leading hex `'0'` characters).
    #[must_use]
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_hex_zeros() >= difficulty
    }

    /// Counts the leading hex `'0'` characters of the digest.
    #[must_use]
    pub fn leading_hex_zeros(&self) -> u32 {
        let mut zeros = 0;
        for b in self.0.bytes() {
            if b == b'0' {
                zeros += 1;
            } else {
                break;
            }
        }
        zeros
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
