use crate::block::Block;
use crate::transaction::Transaction;
use crate::utxo::UtxoLedger;
use shared::{BlockchainError, Hash, Result};
use std::collections::HashMap;

/// Upper bound on transactions per block, coinbase included.
pub const MAX_BLOCK_TRANSACTIONS: usize = 100;

/// Unconfirmed transactions keyed by id.
///
/// Admission checks each transaction against the ledger as it stands at
/// that moment; survivors of a chain replacement are not eagerly
/// re-validated, the next admission or selection pass re-checks them.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    pending: HashMap<Hash, Transaction>,
}

impl Mempool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a transaction.
    ///
    /// # Errors
    ///
    /// - [`BlockchainError::InvalidTransaction`] for a coinbase or a
    ///   transaction whose shape does not validate,
    /// - [`BlockchainError::InvalidSignature`] when the signature does not
    ///   recover to the sender,
    /// - [`BlockchainError::DuplicateTransaction`] for an id already
    ///   pooled,
    /// - [`BlockchainError::InsufficientFunds`] when the sender's spendable
    ///   balance does not cover `amount + fee`.
    pub fn add(&mut self, tx: Transaction, ledger: &UtxoLedger) -> Result<()> {
        if tx.is_coinbase() {
            return Err(BlockchainError::InvalidTransaction(
                "coinbase transactions are not relayed".to_string(),
            ));
        }
        if self.pending.contains_key(tx.tx_id()) {
            return Err(BlockchainError::DuplicateTransaction(
                tx.tx_id().to_string(),
            ));
        }
        tx.validate()?;
        if !ledger.can_process(&tx) {
            return Err(BlockchainError::InsufficientFunds);
        }
        self.pending.insert(tx.tx_id().clone(), tx);
        Ok(())
    }

    /// Picks the transactions for the next candidate block: admissible
    /// members sorted by descending fee, capped at `max_count − 1` to leave
    /// room for the coinbase.
    ///
    /// Candidates are simulated against a scratch copy of the ledger, so a
    /// sender whose pending transfers individually fit but together
    /// overspend only gets the ones that still apply.
    #[must_use]
    pub fn select_for_block(&self, max_count: usize, ledger: &UtxoLedger) -> Vec<Transaction> {
        let mut candidates: Vec<&Transaction> = self.pending.values().collect();
        candidates.sort_by(|a, b| {
            b.fee()
                .cmp(&a.fee())
                .then_with(|| a.timestamp().cmp(&b.timestamp()))
                .then_with(|| a.tx_id().as_str().cmp(b.tx_id().as_str()))
        });

        let cap = max_count.saturating_sub(1);
        let mut scratch = ledger.clone();
        let mut selected = Vec::new();
        for tx in candidates {
            if selected.len() >= cap {
                break;
            }
            if scratch.process(tx).is_ok() {
                selected.push(tx.clone());
            }
        }
        selected
    }

    /// Drops every transaction that the block confirmed.
    pub fn remove_included(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.pending.remove(tx.tx_id());
        }
    }

    pub fn remove(&mut self, tx_id: &Hash) -> Option<Transaction> {
        self.pending.remove(tx_id)
    }

    #[must_use]
    pub fn contains(&self, tx_id: &Hash) -> bool {
        self.pending.contains_key(tx_id)
    }

    #[must_use]
    pub fn get(&self, tx_id: &Hash) -> Option<&Transaction> {
        self.pending.get(tx_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.pending.values()
    }
}
