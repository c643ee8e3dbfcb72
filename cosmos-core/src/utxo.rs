use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use shared::{Address, BlockchainError, Hash, Result};
use std::collections::HashMap;

/// One spendable output credited to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub tx_id: Hash,
    pub output_index: u32,
    pub amount: u64,
    pub timestamp: i64,
}

/// Per-address spendable outputs plus a balance cache.
///
/// The ledger is never persisted; it is a deterministic fold of the chain's
/// transactions, so clearing and re-folding any prefix reproduces it
/// exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoLedger {
    outputs: HashMap<Address, Vec<UtxoEntry>>,
    balances: HashMap<Address, u64>,
}

impl UtxoLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits an output to an address.
    pub fn add(
        &mut self,
        address: &Address,
        tx_id: Hash,
        amount: u64,
        output_index: u32,
        timestamp: i64,
    ) {
        self.outputs.entry(address.clone()).or_default().push(UtxoEntry {
            tx_id,
            output_index,
            amount,
            timestamp,
        });
        *self.balances.entry(address.clone()).or_insert(0) += amount;
    }

    /// Consumes `amount` from an address, selecting outputs greedily
    /// largest-first. The remainder of the last consumed output is minted
    /// back to the spender as a change output at index 1, under a synthetic
    /// id derived from the spending transaction so re-folding the chain
    /// reproduces the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InsufficientFunds`] when the balance does
    /// not cover `amount`.
    pub fn spend(
        &mut self,
        address: &Address,
        amount: u64,
        origin: &Hash,
        timestamp: i64,
    ) -> Result<()> {
        if self.balance(address) < amount {
            return Err(BlockchainError::InsufficientFunds);
        }
        let entries = self
            .outputs
            .get_mut(address)
            .ok_or(BlockchainError::InsufficientFunds)?;
        entries.sort_by(|a, b| b.amount.cmp(&a.amount));

        let mut gathered = 0u64;
        let mut consumed = 0usize;
        for entry in entries.iter() {
            gathered += entry.amount;
            consumed += 1;
            if gathered >= amount {
                break;
            }
        }
        entries.drain(..consumed);

        let change = gathered - amount;
        if change > 0 {
            entries.push(UtxoEntry {
                tx_id: change_id(origin),
                output_index: 1,
                amount: change,
                timestamp,
            });
        }
        if entries.is_empty() {
            self.outputs.remove(address);
        }

        let balance = self
            .balances
            .get_mut(address)
            .ok_or(BlockchainError::InsufficientFunds)?;
        *balance -= amount;
        if *balance == 0 {
            self.balances.remove(address);
        }
        Ok(())
    }

    /// Spendable balance of an address.
    #[must_use]
    pub fn balance(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    /// Whether the ledger can absorb the transaction: coinbases always
    /// apply, transfers need `amount + fee` spendable.
    #[must_use]
    pub fn can_process(&self, tx: &Transaction) -> bool {
        match tx.from() {
            None => true,
            Some(from) => tx
                .amount()
                .checked_add(tx.fee())
                .is_some_and(|needed| self.balance(from) >= needed),
        }
    }

    /// Applies one transaction: a coinbase only credits, a transfer spends
    /// `amount + fee` from the sender and credits the recipient at output
    /// index 0.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InsufficientFunds`] when the sender
    /// cannot cover the transfer, or [`BlockchainError::Malformed`] on
    /// amount overflow.
    pub fn process(&mut self, tx: &Transaction) -> Result<()> {
        match tx.from() {
            None => {
                self.add(tx.to(), tx.tx_id().clone(), tx.amount(), 0, tx.timestamp());
                Ok(())
            }
            Some(from) => {
                let needed = tx.amount().checked_add(tx.fee()).ok_or_else(|| {
                    BlockchainError::Malformed("amount + fee overflows".to_string())
                })?;
                self.spend(from, needed, tx.tx_id(), tx.timestamp())?;
                self.add(tx.to(), tx.tx_id().clone(), tx.amount(), 0, tx.timestamp());
                Ok(())
            }
        }
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.balances.clear();
    }

    /// Outputs currently credited to an address, in ledger order.
    #[must_use]
    pub fn outputs_for(&self, address: &Address) -> &[UtxoEntry] {
        self.outputs.get(address).map_or(&[], Vec::as_slice)
    }

    /// Sum of all cached balances; equals the circulating supply.
    #[must_use]
    pub fn total_balance(&self) -> u64 {
        self.balances.values().sum()
    }
}

fn change_id(origin: &Hash) -> Hash {
    Hash::digest(format!("change:{origin}").as_bytes())
}
