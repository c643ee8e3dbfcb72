use serde::{Deserialize, Serialize};
use shared::{recover, Address, BlockchainError, Hash, KeyPair, Result, Signature};

/// A transfer record on the chain.
///
/// The two kinds are separate variants so validation can never forget the
/// coinbase case: a coinbase has no sender and no signature by construction,
/// a transfer always has both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTransaction", into = "RawTransaction")]
pub enum Transaction {
    /// The block reward paid to the miner. Always the first transaction of
    /// a block, never relayed on its own.
    Coinbase {
        to: Address,
        amount: u64,
        timestamp: i64,
        tx_id: Hash,
    },
    /// A signed transfer between two distinct addresses.
    Transfer {
        from: Address,
        to: Address,
        amount: u64,
        fee: u64,
        timestamp: i64,
        signature: Option<Signature>,
        tx_id: Hash,
    },
}

/// Flat wire form shared by gossip frames, API submissions and the
/// snapshot file. A missing `from_address` marks a coinbase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub from_address: Option<Address>,
    pub to_address: Address,
    pub amount: u64,
    pub fee: u64,
    pub timestamp: i64,
    pub signature: Option<Signature>,
    pub tx_id: Hash,
}

impl Transaction {
    /// Creates the reward transaction for a freshly assembled block.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidTransaction`] for a zero amount.
    pub fn coinbase(to: Address, amount: u64) -> Result<Self> {
        if amount == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "coinbase amount must be positive".to_string(),
            ));
        }
        let timestamp = now_ms();
        let tx_id = Self::compute_id(None, &to, amount, 0, timestamp);
        Ok(Self::Coinbase {
            to,
            amount,
            timestamp,
            tx_id,
        })
    }

    /// Creates an unsigned transfer.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidTransaction`] for a zero amount or
    /// a self-transfer.
    pub fn transfer(from: Address, to: Address, amount: u64, fee: u64) -> Result<Self> {
        if amount == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "amount must be positive".to_string(),
            ));
        }
        if from == to {
            return Err(BlockchainError::InvalidTransaction(
                "sender and recipient must differ".to_string(),
            ));
        }
        let timestamp = now_ms();
        let tx_id = Self::compute_id(Some(&from), &to, amount, fee, timestamp);
        Ok(Self::Transfer {
            from,
            to,
            amount,
            fee,
            timestamp,
            signature: None,
            tx_id,
        })
    }

    /// The id preimage covers the five non-signature fields, so signing
    /// never changes the id.
    fn compute_id(from: Option<&Address>, to: &Address, amount: u64, fee: u64, timestamp: i64) -> Hash {
        let preimage = format!(
            "{}{}{}{}{}",
            from.map_or("", Address::as_str),
            to.as_str(),
            amount,
            fee,
            timestamp
        );
        Hash::digest(preimage.as_bytes())
    }

    /// Signs the transfer with the sender's key.
    ///
    /// # Errors
    ///
    /// Coinbase transactions are never signed; signing with a key that does
    /// not own the sender address fails with
    /// [`BlockchainError::InvalidSignature`].
    pub fn sign(&mut self, keys: &KeyPair) -> Result<()> {
        match self {
            Self::Coinbase { .. } => Err(BlockchainError::InvalidTransaction(
                "coinbase transactions are not signed".to_string(),
            )),
            Self::Transfer {
                from,
                signature,
                tx_id,
                ..
            } => {
                if keys.address() != *from {
                    return Err(BlockchainError::InvalidSignature);
                }
                *signature = Some(keys.sign(tx_id)?);
                Ok(())
            }
        }
    }

    /// Full validity check: shape, id re-derivation, and for transfers the
    /// recovery of the signer back to the sender address.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidTransaction`] for shape violations
    /// and [`BlockchainError::InvalidSignature`] when the signature is
    /// missing or recovers to another address.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Coinbase {
                to,
                amount,
                timestamp,
                tx_id,
            } => {
                if *amount == 0 {
                    return Err(BlockchainError::InvalidTransaction(
                        "coinbase amount must be positive".to_string(),
                    ));
                }
                if *tx_id != Self::compute_id(None, to, *amount, 0, *timestamp) {
                    return Err(BlockchainError::InvalidTransaction(
                        "tx id does not match contents".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Transfer {
                from,
                to,
                amount,
                fee,
                timestamp,
                signature,
                tx_id,
            } => {
                if *amount == 0 {
                    return Err(BlockchainError::InvalidTransaction(
                        "amount must be positive".to_string(),
                    ));
                }
                if from == to {
                    return Err(BlockchainError::InvalidTransaction(
                        "sender and recipient must differ".to_string(),
                    ));
                }
                if *tx_id != Self::compute_id(Some(from), to, *amount, *fee, *timestamp) {
                    return Err(BlockchainError::InvalidTransaction(
                        "tx id does not match contents".to_string(),
                    ));
                }
                let signature = signature
                    .as_ref()
                    .ok_or(BlockchainError::InvalidSignature)?;
                let public = recover(signature, tx_id)?;
                if Address::from_public_key(&public) != *from {
                    return Err(BlockchainError::InvalidSignature);
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub const fn is_coinbase(&self) -> bool {
        matches!(self, Self::Coinbase { .. })
    }

    #[must_use]
    pub const fn tx_id(&self) -> &Hash {
        match self {
            Self::Coinbase { tx_id, .. } | Self::Transfer { tx_id, .. } => tx_id,
        }
    }

    #[must_use]
    pub const fn from(&self) -> Option<&Address> {
        match self {
            Self::Coinbase { .. } => None,
            Self::Transfer { from, .. } => Some(from),
        }
    }

    #[must_use]
    pub const fn to(&self) -> &Address {
        match self {
            Self::Coinbase { to, .. } | Self::Transfer { to, .. } => to,
        }
    }

    #[must_use]
    pub const fn amount(&self) -> u64 {
        match self {
            Self::Coinbase { amount, .. } | Self::Transfer { amount, .. } => *amount,
        }
    }

    #[must_use]
    pub const fn fee(&self) -> u64 {
        match self {
            Self::Coinbase { .. } => 0,
            Self::Transfer { fee, .. } => *fee,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        match self {
            Self::Coinbase { timestamp, .. } | Self::Transfer { timestamp, .. } => *timestamp,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = BlockchainError;

    fn try_from(raw: RawTransaction) -> Result<Self> {
        match raw.from_address {
            None => {
                if raw.signature.is_some() {
                    return Err(BlockchainError::Malformed(
                        "coinbase carries no signature".to_string(),
                    ));
                }
                if raw.fee != 0 {
                    return Err(BlockchainError::Malformed(
                        "coinbase carries no fee".to_string(),
                    ));
                }
                Ok(Self::Coinbase {
                    to: raw.to_address,
                    amount: raw.amount,
                    timestamp: raw.timestamp,
                    tx_id: raw.tx_id,
                })
            }
            Some(from) => Ok(Self::Transfer {
                from,
                to: raw.to_address,
                amount: raw.amount,
                fee: raw.fee,
                timestamp: raw.timestamp,
                signature: raw.signature,
                tx_id: raw.tx_id,
            }),
        }
    }
}

impl From<Transaction> for RawTransaction {
    fn from(tx: Transaction) -> Self {
        match tx {
            Transaction::Coinbase {
                to,
                amount,
                timestamp,
                tx_id,
            } => Self {
                from_address: None,
                to_address: to,
                amount,
                fee: 0,
                timestamp,
                signature: None,
                tx_id,
            },
            Transaction::Transfer {
                from,
                to,
                amount,
                fee,
                timestamp,
                signature,
                tx_id,
            } => Self {
                from_address: Some(from),
                to_address: to,
                amount,
                fee,
                timestamp,
                signature,
                tx_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_parties() -> (KeyPair, Address, Address) {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let from = sender.address();
        let to = recipient.address();
        (sender, from, to)
    }

    #[test]
    fn transfer_rejects_bad_shapes() {
        let (_, from, to) = two_parties();
        assert!(Transaction::transfer(from.clone(), to.clone(), 0, 1).is_err());
        assert!(Transaction::transfer(from.clone(), from, 10, 1).is_err());
        assert!(Transaction::transfer(to.clone(), to, 10, 1).is_err());
    }

    #[test]
    fn coinbase_rejects_zero_amount() {
        let (_, _, to) = two_parties();
        assert!(Transaction::coinbase(to.clone(), 0).is_err());
        assert!(Transaction::coinbase(to, 50).is_ok());
    }

    #[test]
    fn tx_id_is_stable_under_signing() {
        let (sender, from, to) = two_parties();
        let mut tx = Transaction::transfer(from, to, 100, 1).unwrap();
        let before = tx.tx_id().clone();

        tx.sign(&sender).unwrap();

        assert_eq!(*tx.tx_id(), before);
        tx.validate().unwrap();
    }

    #[test]
    fn unsigned_transfer_does_not_validate() {
        let (_, from, to) = two_parties();
        let tx = Transaction::transfer(from, to, 100, 1).unwrap();
        assert!(matches!(
            tx.validate(),
            Err(BlockchainError::InvalidSignature)
        ));
    }

    #[test]
    fn signing_with_foreign_key_is_rejected() {
        let (_, from, to) = two_parties();
        let stranger = KeyPair::generate();
        let mut tx = Transaction::transfer(from, to, 100, 1).unwrap();
        assert!(matches!(
            tx.sign(&stranger),
            Err(BlockchainError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_amount_invalidates_id() {
        let (sender, from, to) = two_parties();
        let mut tx = Transaction::transfer(from, to, 100, 1).unwrap();
        tx.sign(&sender).unwrap();

        if let Transaction::Transfer { amount, .. } = &mut tx {
            *amount = 1_000;
        }
        assert!(tx.validate().is_err());
    }

    #[test]
    fn coinbase_is_never_signed() {
        let sender = KeyPair::generate();
        let mut tx = Transaction::coinbase(sender.address(), 50).unwrap();
        assert!(tx.sign(&sender).is_err());
        tx.validate().unwrap();
    }

    #[test]
    fn wire_round_trip_is_bit_preserving() {
        let (sender, from, to) = two_parties();
        let mut tx = Transaction::transfer(from, to, 42, 3).unwrap();
        tx.sign(&sender).unwrap();

        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);

        let coinbase = Transaction::coinbase(sender.address(), 50).unwrap();
        let json = serde_json::to_string(&coinbase).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, coinbase);
    }

    #[test]
    fn wire_form_rejects_signed_coinbase() {
        let (sender, from, to) = two_parties();
        let mut tx = Transaction::transfer(from, to, 42, 3).unwrap();
        tx.sign(&sender).unwrap();

        let mut raw = RawTransaction::from(tx);
        raw.from_address = None;
        assert!(Transaction::try_from(raw).is_err());
    }
}
