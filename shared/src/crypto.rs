//! Digest and recoverable-signature primitives.
//!
//! Signing uses secp256k1 ECDSA with a recovery id, so a signature plus the
//! signed digest always recovers a unique public key. The wire form keeps
//! `r`, `s` and the recovery id as separate fields.

use crate::{BlockchainError, Hash, Result};
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Recoverable ECDSA signature in its wire form: `r` and `s` as 64-char hex
/// scalars plus the recovery id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub recovery_id: u8,
}

impl Signature {
    fn to_recoverable(&self) -> Result<RecoverableSignature> {
        let r = hex::decode(&self.r)
            .map_err(|e| BlockchainError::Malformed(format!("signature r: {e}")))?;
        let s = hex::decode(&self.s)
            .map_err(|e| BlockchainError::Malformed(format!("signature s: {e}")))?;
        if r.len() != 32 || s.len() != 32 {
            return Err(BlockchainError::Malformed(
                "signature scalars must be 32 bytes".to_string(),
            ));
        }
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&r);
        compact[32..].copy_from_slice(&s);
        let id = RecoveryId::from_i32(i32::from(self.recovery_id))
            .map_err(|e| BlockchainError::Malformed(format!("recovery id: {e}")))?;
        RecoverableSignature::from_compact(&compact, id)
            .map_err(|e| BlockchainError::CryptographicError(e.to_string()))
    }

    fn from_recoverable(sig: &RecoverableSignature) -> Self {
        let (id, compact) = sig.serialize_compact();
        // Recovery ids only take the values 0 through 3.
        let recovery_id = u8::try_from(id.to_i32()).unwrap_or(0);
        Self {
            r: hex::encode(&compact[..32]),
            s: hex::encode(&compact[32..]),
            recovery_id,
        }
    }
}

/// Computes the SHA-256 digest of the input.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes the RIPEMD-160 digest of the input.
#[must_use]
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn digest_message(msg_hash: &Hash) -> Result<Message> {
    Ok(Message::from_digest(msg_hash.to_bytes()?))
}

/// Signs a 32-byte digest, producing a recoverable signature.
///
/// # Errors
///
/// Returns an error if the digest is not a full 32-byte hash.
pub fn sign(secret: &SecretKey, msg_hash: &Hash) -> Result<Signature> {
    let secp = Secp256k1::new();
    let message = digest_message(msg_hash)?;
    let recoverable = secp.sign_ecdsa_recoverable(&message, secret);
    Ok(Signature::from_recoverable(&recoverable))
}

/// Recovers the public key that produced `signature` over `msg_hash`.
///
/// # Errors
///
/// Returns [`BlockchainError::InvalidSignature`] when no key recovers.
pub fn recover(signature: &Signature, msg_hash: &Hash) -> Result<PublicKey> {
    let secp = Secp256k1::new();
    let message = digest_message(msg_hash)?;
    let recoverable = signature.to_recoverable()?;
    secp.recover_ecdsa(&message, &recoverable)
        .map_err(|_| BlockchainError::InvalidSignature)
}

/// Verifies `signature` over `msg_hash` against a known public key.
#[must_use]
pub fn verify(public: &PublicKey, signature: &Signature, msg_hash: &Hash) -> bool {
    let secp = Secp256k1::new();
    let Ok(message) = digest_message(msg_hash) else {
        return false;
    };
    let Ok(recoverable) = signature.to_recoverable() else {
        return false;
    };
    secp.verify_ecdsa(&message, &recoverable.to_standard(), public)
        .is_ok()
}
