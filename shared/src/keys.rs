//! Node identity: secp256k1 keypairs and the derived account addresses.

use crate::crypto::{self, ripemd160, sha256, Signature};
use crate::{BlockchainError, Hash, Result};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Human-readable prefix of every account address.
pub const ADDRESS_PREFIX: &str = "cosmos";

/// Total address length: the prefix plus 40 hex characters.
pub const ADDRESS_LEN: usize = 46;

/// Account address: `cosmos` followed by the first 40 hex characters of
/// `RIPEMD160(SHA256(pubkey))`.
///
/// The hex tail compares case-insensitively, which is implemented by
/// normalizing to lowercase on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parses and validates an address, lowercasing the hex tail.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] unless the input matches
    /// `^cosmos[0-9a-f]{40}$` after normalization.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.to_ascii_lowercase();
        let valid = normalized.len() == ADDRESS_LEN
            && normalized.starts_with(ADDRESS_PREFIX)
            && normalized.as_bytes()[ADDRESS_PREFIX.len()..]
                .iter()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
        if !valid {
            return Err(BlockchainError::Malformed(format!(
                "invalid address {input:?}"
            )));
        }
        Ok(Self(normalized))
    }

    /// Derives the address of an uncompressed secp256k1 public key.
    #[must_use]
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = ripemd160(&sha256(&public.serialize_uncompressed()));
        // The full RIPEMD-160 digest is 40 hex characters, which is exactly
        // the on-the-wire tail length.
        Self(format!("{ADDRESS_PREFIX}{}", hex::encode(digest)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = BlockchainError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// The node's signing identity.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh keypair from the system CSPRNG. The private scalar
    /// is uniform in `[1, n)` by construction.
    #[must_use]
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Self { secret, public }
    }

    /// Restores a keypair from the 64-char hex form of its private scalar,
    /// as stored in the snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] for bad hex or a scalar
    /// outside the curve order.
    pub fn from_secret_hex(input: &str) -> Result<Self> {
        let mut bytes = hex::decode(input)
            .map_err(|e| BlockchainError::Malformed(format!("private key hex: {e}")))?;
        let parsed = SecretKey::from_slice(&bytes)
            .map_err(|e| BlockchainError::Malformed(format!("private key: {e}")));
        bytes.zeroize();
        let secret = parsed?;
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self { secret, public })
    }

    /// Hex form of the private scalar, for the snapshot file only.
    #[must_use]
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The account address derived from the public key.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public)
    }

    /// Signs a digest with the private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is not a full 32-byte hash.
    pub fn sign(&self, msg_hash: &Hash) -> Result<Signature> {
        crypto::sign(&self.secret, msg_hash)
    }
}
