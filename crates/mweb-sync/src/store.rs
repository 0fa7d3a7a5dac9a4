//! Storage abstractions for the persisted mweb coin set and the
//! base-chain header index.

use bitcoin::block::Header as BlockHeader;
use mweb_primitives::{Leafset, Utxo};

/// Storage failure.
///
/// Failures in the sync path indicate local corruption and are treated
/// as unrecoverable by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("corrupted store: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persisted set of unspent mweb outputs keyed by leaf index.
///
/// Implementations must serialize [`leaf_set`](Self::leaf_set),
/// [`put_coins`](Self::put_coins) and
/// [`put_leaf_set_and_purge`](Self::put_leaf_set_and_purge) with
/// respect to one another; the coordinator relies on the store for
/// read-modify-write atomicity.
pub trait CoinStore: Send + Sync {
    /// Returns the most recently committed leafset and its leaf count.
    fn leaf_set(&self) -> Result<(Leafset, u64), StoreError>;

    /// Persists a batch of verified utxos.
    fn put_coins(&self, utxos: &[Utxo]) -> Result<(), StoreError>;

    /// Atomically installs the new leafset and deletes the records of
    /// the removed leaves.
    fn put_leaf_set_and_purge(
        &self,
        leafset: &Leafset,
        num_leaves: u64,
        removed: &[u64],
    ) -> Result<(), StoreError>;

    /// Loads the utxos stored at the given leaf indices.
    fn fetch_leaves(&self, indices: &[u64]) -> Result<Vec<Utxo>, StoreError>;
}

/// Validated base-chain block headers.
pub trait HeaderStore: Send + Sync {
    /// Returns the best known header and its height.
    fn chain_tip(&self) -> Result<(BlockHeader, u32), StoreError>;
}
