//! # MWEB Light-Client Synchronization
//!
//! This crate tracks the evolving set of unspent Mimblewimble Extension
//! Block outputs committed to by the base chain. Untrusted peers serve
//! extension-block headers, a leaf-membership bitmap and batched utxo
//! responses with Merkle Mountain Range proofs; everything is verified
//! locally before it is persisted or surfaced to subscribers, and any
//! peer caught serving bad data is banned.
//!
//! ## Synchronization flow
//!
//! - [`verify_mweb_header`] binds an mweb header and leafset pair to a
//!   base-chain block through a merkleblock inclusion proof and the
//!   HogEx marker transaction.
//! - [`MwebSyncManager::sync_utxos`] diffs the incoming leafset against
//!   the persisted one, shards the added leaves into `getmwebutxos`
//!   queries and hands them to the external query dispatcher.
//! - Each response is checked by [`verify_mweb_utxos`] under the
//!   dispatcher's per-response callback, then reassembled in ascending
//!   start-index order, persisted and announced to the registered
//!   callbacks. Spent leaves are purged once every batch is committed.

mod banman;
mod diff;
mod dispatcher;
mod header_verifier;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod utxo_verifier;

pub use crate::banman::{BanManager, Reason};
pub use crate::diff::{diff_leafsets, AddedSpan, LeafsetDiff};
pub use crate::dispatcher::{Progress, QueryDispatcher, QueryError, Request, ResponseHandler};
pub use crate::header_verifier::verify_mweb_header;
pub use crate::store::{CoinStore, HeaderStore, StoreError};
pub use crate::sync::{MwebSyncManager, UtxosCallback};
pub use crate::utxo_verifier::verify_mweb_utxos;

/// Identifies a peer.
pub type PeerId = std::net::SocketAddr;
