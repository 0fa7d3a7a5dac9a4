//! Merkle Mountain Range index arithmetic and node hashing.
//!
//! An MMR over `n` leaves is a forest of perfect binary trees whose
//! sizes correspond to the set bits of `n`, laid out left to right in
//! post-order: each peak's nodes come before the next peak's. The total
//! node count for `n` leaves is `2n - popcount(n)`.

use crate::MwebHash;
use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::Encodable;

/// Identifies a leaf by insertion order. Monotonic; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafIdx(pub u64);

/// Identifies a node in the post-order MMR layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdx(pub u64);

impl LeafIdx {
    /// Position of the leaf in the post-order node layout.
    pub fn node_idx(self) -> NodeIdx {
        NodeIdx(2 * self.0 - u64::from(self.0.count_ones()))
    }
}

/// Size `2^h - 1` of the largest perfect subtree fitting into `nodes`
/// nodes.
fn max_peak_size(nodes: u64) -> u64 {
    if nodes == 0 {
        return 0;
    }
    u64::MAX >> nodes.leading_zeros()
}

impl NodeIdx {
    /// Height of the node within its peak; leaves are at height 0.
    pub fn height(self) -> u64 {
        let mut height = self.0;
        let mut peak_size = max_peak_size(self.0);
        while peak_size > 0 {
            if height >= peak_size {
                height -= peak_size;
            }
            peak_size >>= 1;
        }
        height
    }

    /// Inverse of [`LeafIdx::node_idx`]. Only meaningful for height-0
    /// nodes.
    pub fn leaf_idx(self) -> LeafIdx {
        let mut leaf_index = 0u64;
        let mut num_left = self.0;
        let mut peak_size = max_peak_size(self.0);
        while peak_size > 0 {
            if num_left >= peak_size {
                leaf_index += (peak_size + 1) / 2;
                num_left -= peak_size;
            }
            peak_size >>= 1;
        }
        LeafIdx(leaf_index)
    }

    /// Left child of an internal node at the given height.
    pub fn left_child(self, height: u64) -> NodeIdx {
        NodeIdx(self.0 - (1u64 << height))
    }

    /// Right child of an internal node.
    pub fn right_child(self) -> NodeIdx {
        NodeIdx(self.0 - 1)
    }

    /// Digest of a leaf payload at this node position:
    /// `blake3(le64(node) || compact_size(len) || payload)`.
    pub fn hash(self, data: &[u8]) -> MwebHash {
        let mut prefixed = Vec::with_capacity(data.len() + 9);
        VarInt::from(data.len() as u64)
            .consensus_encode(&mut prefixed)
            .expect("writing to a vec never fails; qed");
        prefixed.extend_from_slice(data);

        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0.to_le_bytes());
        hasher.update(&prefixed);
        MwebHash::new(*hasher.finalize().as_bytes())
    }

    /// Digest of two child digests at this node position:
    /// `blake3(le64(node) || left || right)`.
    pub fn parent_hash(self, left: &MwebHash, right: &MwebHash) -> MwebHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0.to_le_bytes());
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        MwebHash::new(*hasher.finalize().as_bytes())
    }
}

/// Peak node positions of an MMR with `nodes` nodes, leftmost first.
pub fn calc_peaks(nodes: u64) -> Vec<NodeIdx> {
    let mut peaks = Vec::new();
    let mut sum_prev_peaks = 0u64;
    let mut remaining = nodes;
    let mut peak_size = max_peak_size(nodes);
    while peak_size > 0 {
        if remaining >= peak_size {
            peaks.push(NodeIdx(sum_prev_peaks + peak_size - 1));
            sum_prev_peaks += peak_size;
            remaining -= peak_size;
        }
        peak_size >>= 1;
    }
    peaks
}
