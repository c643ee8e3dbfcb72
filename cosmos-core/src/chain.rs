use crate::block::Block;
use crate::transaction::Transaction;
use crate::utxo::UtxoLedger;
use shared::{Address, BlockchainError, Hash, Result};
use std::collections::HashMap;

/// Blocks between difficulty adjustments.
pub const RETARGET_INTERVAL: u64 = 10;

/// Target spacing between blocks, in milliseconds.
pub const TARGET_BLOCK_TIME_MS: i64 = 10_000;

/// The ordered block sequence, its derived UTXO ledger, and the current
/// proof-of-work difficulty.
#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,
    block_index: HashMap<Hash, usize>,
    utxo: UtxoLedger,
    difficulty: u32,
    initial_difficulty: u32,
}

impl Chain {
    /// Creates a fresh chain whose genesis block credits the miner with the
    /// premine.
    ///
    /// # Errors
    ///
    /// Returns an error if the genesis block cannot be constructed.
    pub fn with_genesis(miner: Address, base_reward: u64, initial_difficulty: u32) -> Result<Self> {
        let genesis = Block::genesis(miner, base_reward)?;
        let mut utxo = UtxoLedger::new();
        for tx in &genesis.transactions {
            utxo.process(tx)?;
        }
        let mut block_index = HashMap::new();
        block_index.insert(genesis.hash.clone(), 0);
        Ok(Self {
            blocks: vec![genesis],
            block_index,
            utxo,
            difficulty: initial_difficulty,
            initial_difficulty,
        })
    }

    /// Restores a chain from previously persisted blocks, re-validating the
    /// sequence and re-folding the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error when the sequence does not validate or a
    /// transaction cannot be applied.
    pub fn from_blocks(
        blocks: Vec<Block>,
        initial_difficulty: u32,
        difficulty: u32,
    ) -> Result<Self> {
        Self::is_valid_chain(&blocks, initial_difficulty)?;
        let utxo = Self::fold_ledger(&blocks)?;
        let block_index = index_of(&blocks);
        Ok(Self {
            blocks,
            block_index,
            utxo,
            difficulty,
            initial_difficulty,
        })
    }

    /// Validates a block against its predecessor: index continuity, hash
    /// linkage, header re-derivation, proof-of-work at `difficulty`, and
    /// every member transaction.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidBlock`] (or a transaction-level
    /// error) naming the first violated rule.
    pub fn is_valid_new_block(new: &Block, prev: &Block, difficulty: u32) -> Result<()> {
        if new.index != prev.index + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "expected index {}, got {}",
                prev.index + 1,
                new.index
            )));
        }
        if new.previous_hash != prev.hash {
            return Err(BlockchainError::InvalidBlock(
                "previous hash does not match tip".to_string(),
            ));
        }
        new.verify_integrity()?;
        if !new.hash.meets_difficulty(difficulty) {
            return Err(BlockchainError::InvalidBlock(format!(
                "hash does not meet difficulty {difficulty}"
            )));
        }
        new.has_valid_transactions()
    }

    /// Validates a full sequence, folding pairwise from index 1. Genesis is
    /// checked for shape and integrity but never for proof-of-work. The
    /// difficulty of each retarget window is replayed from
    /// `initial_difficulty`; the replayed final difficulty is returned.
    ///
    /// # Errors
    ///
    /// Returns the first pairwise violation.
    pub fn is_valid_chain(blocks: &[Block], initial_difficulty: u32) -> Result<u32> {
        let genesis = blocks.first().ok_or_else(|| {
            BlockchainError::InvalidBlock("chain has no genesis".to_string())
        })?;
        if !genesis.is_genesis() {
            return Err(BlockchainError::InvalidBlock(
                "first block is not a genesis block".to_string(),
            ));
        }
        genesis.verify_integrity()?;
        genesis.has_valid_transactions()?;

        let mut difficulty = initial_difficulty;
        for i in 1..blocks.len() {
            Self::is_valid_new_block(&blocks[i], &blocks[i - 1], difficulty)?;
            if at_retarget_boundary(blocks[i].index) {
                difficulty = retargeted(difficulty, &blocks[..=i]);
            }
        }
        Ok(difficulty)
    }

    /// Validates and appends a block, applies its transactions to the
    /// ledger, and fires the difficulty retarget when the new height is a
    /// nonzero multiple of [`RETARGET_INTERVAL`].
    ///
    /// # Errors
    ///
    /// Returns an error and leaves the chain untouched when the block or
    /// its cumulative spending does not validate.
    pub fn try_append(&mut self, block: Block) -> Result<()> {
        Self::is_valid_new_block(&block, self.latest(), self.difficulty)?;

        let mut scratch = self.utxo.clone();
        for tx in &block.transactions {
            scratch.process(tx)?;
        }

        self.block_index
            .insert(block.hash.clone(), self.blocks.len());
        self.blocks.push(block);
        self.utxo = scratch;

        let tip_index = self.latest().index;
        if at_retarget_boundary(tip_index) {
            self.difficulty = retargeted(self.difficulty, &self.blocks);
        }
        Ok(())
    }

    /// Adopts a strictly longer valid chain, rebuilding the ledger by
    /// clearing and re-folding every transaction in order. Returns whether
    /// the replacement happened; an equal-length candidate never wins.
    ///
    /// # Errors
    ///
    /// Returns an error and leaves the local chain untouched when the
    /// candidate does not validate.
    pub fn replace(&mut self, candidate: Vec<Block>) -> Result<bool> {
        if candidate.len() <= self.blocks.len() {
            return Ok(false);
        }
        let difficulty = Self::is_valid_chain(&candidate, self.initial_difficulty)?;
        let utxo = Self::fold_ledger(&candidate)?;

        self.block_index = index_of(&candidate);
        self.blocks = candidate;
        self.utxo = utxo;
        self.difficulty = difficulty;
        Ok(true)
    }

    /// Folds a block sequence into a fresh ledger.
    ///
    /// # Errors
    ///
    /// Returns an error when any transaction cannot be applied in order.
    pub fn fold_ledger(blocks: &[Block]) -> Result<UtxoLedger> {
        let mut ledger = UtxoLedger::new();
        for block in blocks {
            for tx in &block.transactions {
                ledger.process(tx)?;
            }
        }
        Ok(ledger)
    }

    /// The tip of the chain. Genesis always exists.
    #[must_use]
    pub fn latest(&self) -> &Block {
        self.blocks.last().expect("chain always has a genesis block")
    }

    /// Height of the tip (genesis is height 0).
    #[must_use]
    pub fn height(&self) -> u64 {
        self.latest().index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[must_use]
    pub const fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Overrides the difficulty used for the next candidate block.
    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = difficulty;
    }

    #[must_use]
    pub const fn utxo(&self) -> &UtxoLedger {
        &self.utxo
    }

    #[must_use]
    pub fn block_by_height(&self, height: u64) -> Option<&Block> {
        usize::try_from(height)
            .ok()
            .and_then(|i| self.blocks.get(i))
    }

    #[must_use]
    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.block_index.get(hash).map(|&i| &self.blocks[i])
    }

    /// A pageable slice of blocks starting at `offset`.
    #[must_use]
    pub fn block_range(&self, offset: usize, limit: usize) -> &[Block] {
        let start = offset.min(self.blocks.len());
        let end = offset.saturating_add(limit).min(self.blocks.len());
        &self.blocks[start..end]
    }

    #[must_use]
    pub fn contains_transaction(&self, tx_id: &Hash) -> bool {
        self.find_transaction(tx_id).is_some()
    }

    /// Locates a confirmed transaction together with its containing block.
    #[must_use]
    pub fn find_transaction(&self, tx_id: &Hash) -> Option<(&Block, &Transaction)> {
        self.blocks.iter().find_map(|block| {
            block
                .transactions
                .iter()
                .find(|tx| tx.tx_id() == tx_id)
                .map(|tx| (block, tx))
        })
    }
}

fn at_retarget_boundary(index: u64) -> bool {
    index > 0 && index % RETARGET_INTERVAL == 0
}

/// Compares the elapsed time of the last retarget window against the target
/// and nudges the difficulty by one step, floored at 1.
fn retargeted(current: u32, blocks: &[Block]) -> u32 {
    let latest = blocks.last().expect("retarget needs a tip");
    let window_start = &blocks[(latest.index - RETARGET_INTERVAL) as usize];
    let actual = latest.timestamp - window_start.timestamp;
    #[allow(clippy::cast_possible_wrap)]
    let expected = RETARGET_INTERVAL as i64 * TARGET_BLOCK_TIME_MS;

    if actual < expected / 2 {
        current + 1
    } else if actual > expected * 2 {
        current.saturating_sub(1).max(1)
    } else {
        current
    }
}

fn index_of(blocks: &[Block]) -> HashMap<Hash, usize> {
    blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.hash.clone(), i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;

    const REWARD: u64 = 50;

    fn new_chain(miner: &KeyPair) -> Chain {
        Chain::with_genesis(miner.address(), REWARD, 1).unwrap()
    }

    fn mined_block(chain: &Chain, transactions: Vec<Transaction>, timestamp: i64) -> Block {
        let tip = chain.latest();
        let mut block =
            Block::new(tip.index + 1, tip.hash.clone(), timestamp, transactions).unwrap();
        block.mine(chain.difficulty()).unwrap();
        block
    }

    fn coinbase_block(chain: &Chain, miner: &KeyPair, timestamp: i64) -> Block {
        let coinbase = Transaction::coinbase(miner.address(), REWARD).unwrap();
        mined_block(chain, vec![coinbase], timestamp)
    }

    #[test]
    fn genesis_chain_credits_the_premine() {
        let miner = KeyPair::generate();
        let chain = new_chain(&miner);

        assert_eq!(chain.height(), 0);
        assert_eq!(chain.utxo().balance(&miner.address()), 500);
    }

    #[test]
    fn single_transfer_settles_balances() {
        let miner = KeyPair::generate();
        let alice = KeyPair::generate();
        let mut chain = new_chain(&miner);

        let mut transfer =
            Transaction::transfer(miner.address(), alice.address(), 100, 1).unwrap();
        transfer.sign(&miner).unwrap();
        let fees = transfer.fee();
        let coinbase = Transaction::coinbase(miner.address(), REWARD + fees).unwrap();

        let block = mined_block(&chain, vec![coinbase, transfer], 1_000);
        chain.try_append(block).unwrap();

        assert_eq!(chain.utxo().balance(&alice.address()), 100);
        assert_eq!(chain.utxo().balance(&miner.address()), 450);
        assert_eq!(chain.utxo().total_balance(), 550);
    }

    #[test]
    fn append_rejects_broken_links() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);

        let mut wrong_index = coinbase_block(&chain, &miner, 1_000);
        wrong_index.index = 5;
        assert!(chain.try_append(wrong_index).is_err());

        let coinbase = Transaction::coinbase(miner.address(), REWARD).unwrap();
        let mut wrong_link =
            Block::new(1, Hash::digest(b"elsewhere"), 1_000, vec![coinbase]).unwrap();
        wrong_link.mine(chain.difficulty()).unwrap();
        assert!(chain.try_append(wrong_link).is_err());

        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn append_rejects_missing_proof_of_work() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);
        chain.set_difficulty(4);

        let coinbase = Transaction::coinbase(miner.address(), REWARD).unwrap();
        let tip = chain.latest();
        let unmined = Block::new(1, tip.hash.clone(), 1_000, vec![coinbase]).unwrap();

        if unmined.hash.meets_difficulty(4) {
            return; // one-in-65536 lucky hash, nothing to assert
        }
        assert!(chain.try_append(unmined).is_err());
    }

    #[test]
    fn append_rejects_cumulative_overspend() {
        let miner = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let mut chain = new_chain(&miner);

        // Each transfer alone fits the premine of 500; together they do not.
        let mut t1 = Transaction::transfer(miner.address(), bob.address(), 400, 0).unwrap();
        t1.sign(&miner).unwrap();
        let mut t2 = Transaction::transfer(miner.address(), carol.address(), 400, 0).unwrap();
        t2.sign(&miner).unwrap();
        let coinbase = Transaction::coinbase(miner.address(), REWARD).unwrap();

        let block = mined_block(&chain, vec![coinbase, t1, t2], 1_000);
        assert!(chain.try_append(block).is_err());
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.utxo().balance(&miner.address()), 500);
    }

    #[test]
    fn replace_adopts_strictly_longer_chains_only() {
        let miner = KeyPair::generate();
        let rival = KeyPair::generate();
        let mut local = new_chain(&miner);
        let block = coinbase_block(&local, &miner, 1_000);
        local.try_append(block).unwrap();

        // A same-length rival chain never wins.
        let mut same_len = new_chain(&rival);
        let block = coinbase_block(&same_len, &rival, 1_000);
        same_len.try_append(block).unwrap();
        assert!(!local.replace(same_len.blocks().to_vec()).unwrap());

        // A strictly longer valid chain wins and the ledger is rebuilt.
        let mut longer = new_chain(&rival);
        for i in 0..3 {
            let block = coinbase_block(&longer, &rival, 1_000 * (i + 1));
            longer.try_append(block).unwrap();
        }
        assert!(local.replace(longer.blocks().to_vec()).unwrap());
        assert_eq!(local.height(), 3);
        assert_eq!(local.utxo().balance(&rival.address()), 500 + 3 * REWARD);
        assert_eq!(local.utxo().balance(&miner.address()), 0);
    }

    #[test]
    fn replace_rejects_longer_invalid_chains() {
        let miner = KeyPair::generate();
        let rival = KeyPair::generate();
        let mut local = new_chain(&miner);

        let mut rival_chain = new_chain(&rival);
        for i in 0..2 {
            let block = coinbase_block(&rival_chain, &rival, 1_000 * (i + 1));
            rival_chain.try_append(block).unwrap();
        }
        let mut forged = rival_chain.blocks().to_vec();
        forged[1].timestamp += 1; // breaks hash re-derivation

        assert!(local.replace(forged).is_err());
        assert_eq!(local.height(), 0);
        assert_eq!(local.utxo().balance(&miner.address()), 500);
    }

    #[test]
    fn replacing_with_own_blocks_is_a_no_op() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);
        let block = coinbase_block(&chain, &miner, 1_000);
        chain.try_append(block).unwrap();

        let own = chain.blocks().to_vec();
        assert!(!chain.replace(own).unwrap());
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn fast_window_raises_difficulty_at_the_boundary() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);
        let genesis_ts = chain.latest().timestamp;

        // Ten blocks one second apart: far below the 100 s expectation.
        for i in 1..=10u64 {
            assert_eq!(chain.difficulty(), 1, "retarget must not fire before 10");
            #[allow(clippy::cast_possible_wrap)]
            let block = coinbase_block(&chain, &miner, genesis_ts + i as i64 * 1_000);
            chain.try_append(block).unwrap();
        }
        assert_eq!(chain.difficulty(), 2);

        // The next block must now satisfy the raised target.
        let block = coinbase_block(&chain, &miner, genesis_ts + 11_000);
        assert!(block.hash.meets_difficulty(2));
        chain.try_append(block).unwrap();
        assert_eq!(chain.difficulty(), 2, "retarget only fires at multiples of 10");
    }

    #[test]
    fn slow_window_lowers_difficulty_with_a_floor() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);
        let genesis_ts = chain.latest().timestamp;

        // Ten blocks 25 s apart: well above twice the expectation, but the
        // floor keeps difficulty at 1.
        for i in 1..=10u64 {
            #[allow(clippy::cast_possible_wrap)]
            let block = coinbase_block(&chain, &miner, genesis_ts + i as i64 * 25_000);
            chain.try_append(block).unwrap();
        }
        assert_eq!(chain.difficulty(), 1);
    }

    #[test]
    fn on_pace_window_keeps_difficulty() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);
        let genesis_ts = chain.latest().timestamp;

        for i in 1..=10u64 {
            #[allow(clippy::cast_possible_wrap)]
            let block = coinbase_block(&chain, &miner, genesis_ts + i as i64 * 10_000);
            chain.try_append(block).unwrap();
        }
        assert_eq!(chain.difficulty(), 1);
    }

    #[test]
    fn refolding_the_chain_reproduces_the_ledger() {
        let miner = KeyPair::generate();
        let alice = KeyPair::generate();
        let mut chain = new_chain(&miner);

        let mut transfer =
            Transaction::transfer(miner.address(), alice.address(), 120, 2).unwrap();
        transfer.sign(&miner).unwrap();
        let coinbase = Transaction::coinbase(miner.address(), REWARD + 2).unwrap();
        let block = mined_block(&chain, vec![coinbase, transfer], 1_000);
        chain.try_append(block).unwrap();

        let refolded = Chain::fold_ledger(chain.blocks()).unwrap();
        assert_eq!(refolded, *chain.utxo());
    }

    #[test]
    fn lookups_find_blocks_and_transactions() {
        let miner = KeyPair::generate();
        let mut chain = new_chain(&miner);
        let block = coinbase_block(&chain, &miner, 1_000);
        let block_hash = block.hash.clone();
        let tx_id = block.transactions[0].tx_id().clone();
        chain.try_append(block).unwrap();

        assert_eq!(chain.block_by_height(1).unwrap().hash, block_hash);
        assert_eq!(chain.block_by_hash(&block_hash).unwrap().index, 1);
        assert!(chain.block_by_height(2).is_none());

        let (containing, tx) = chain.find_transaction(&tx_id).unwrap();
        assert_eq!(containing.index, 1);
        assert_eq!(tx.tx_id(), &tx_id);
        assert!(chain.contains_transaction(&tx_id));

        assert_eq!(chain.block_range(0, 10).len(), 2);
        assert_eq!(chain.block_range(1, 10).len(), 1);
        assert_eq!(chain.block_range(5, 10).len(), 0);
    }
}
