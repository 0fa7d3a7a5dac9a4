//! Test fixtures: a reference MMR accumulator able to produce the
//! proof material a remote node would serve, plus in-memory stores.

use crate::banman::{BanManager, Reason};
use crate::store::{CoinStore, HeaderStore, StoreError};
use crate::PeerId;
use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use mweb_primitives::mmr::{calc_peaks, LeafIdx, NodeIdx};
use mweb_primitives::{Leafset, MsgMwebUtxos, MwebHash, MwebHeader, OutputFormat, Utxo};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

/// Deterministic output id for leaf `i`.
pub(crate) fn test_output_id(i: u64) -> MwebHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&i.to_le_bytes());
    bytes[31] = 0x5A;
    MwebHash::new(bytes)
}

/// Header committing to the accumulator's output root and the given
/// leafset.
pub(crate) fn test_mweb_header(acc: &MmrAccumulator, leafset: &Leafset) -> MwebHeader {
    MwebHeader {
        height: 0,
        output_root: acc.root(),
        kernel_root: MwebHash::all_zeros(),
        leafset_root: leafset.root(),
        kernel_offset: [0; 32],
        stealth_offset: [0; 32],
        output_mmr_size: acc.num_leaves(),
        kernel_mmr_size: 0,
    }
}

/// Base-chain header stand-in for coordinator tests.
pub(crate) fn test_block_header() -> BlockHeader {
    BlockHeader {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_700_000_000,
        bits: CompactTarget::from_consensus(0x1d00_ffff),
        nonce: 0,
    }
}

/// In-memory MMR over every inserted output id.
pub(crate) struct MmrAccumulator {
    /// Node digests in post-order layout.
    nodes: Vec<MwebHash>,
    /// Output ids by leaf index.
    leaf_ids: Vec<MwebHash>,
}

struct ProofWalk<'a> {
    leafset: &'a Leafset,
    first_node: NodeIdx,
    last_node: NodeIdx,
    /// Positions served as proof hashes; kept across the two passes so
    /// the second pass emits hashes in the order the verifier consumes
    /// them.
    marked: HashSet<NodeIdx>,
    proof: Vec<MwebHash>,
}

impl MmrAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            leaf_ids: Vec::new(),
        }
    }

    /// Appends a leaf and folds up every completed subtree.
    pub(crate) fn push_leaf(&mut self, output_id: &MwebHash) {
        let node_idx = LeafIdx(self.leaf_ids.len() as u64).node_idx();
        self.nodes.push(node_idx.hash(output_id.as_bytes()));
        self.leaf_ids.push(*output_id);

        loop {
            let next = NodeIdx(self.nodes.len() as u64);
            let height = next.height();
            if height == 0 {
                break;
            }
            let left = self.nodes[next.left_child(height).0 as usize];
            let right = self.nodes[next.right_child().0 as usize];
            self.nodes.push(next.parent_hash(&left, &right));
        }
    }

    pub(crate) fn num_leaves(&self) -> u64 {
        self.leaf_ids.len() as u64
    }

    pub(crate) fn node_hash(&self, idx: NodeIdx) -> MwebHash {
        self.nodes[idx.0 as usize]
    }

    fn mmr_size(&self) -> NodeIdx {
        NodeIdx(self.nodes.len() as u64)
    }

    /// Root commitment: the peaks bagged right to left.
    pub(crate) fn root(&self) -> MwebHash {
        if self.nodes.is_empty() {
            return MwebHash::all_zeros();
        }
        let peaks = calc_peaks(self.mmr_size().0);
        self.bag_peaks(&peaks, 0)
    }

    /// Bags `peaks[from..]` right to left.
    fn bag_peaks(&self, peaks: &[NodeIdx], from: usize) -> MwebHash {
        let mut bagged = self.node_hash(peaks[peaks.len() - 1]);
        for &peak in peaks[from..peaks.len() - 1].iter().rev() {
            bagged = self.mmr_size().parent_hash(&self.node_hash(peak), &bagged);
        }
        bagged
    }

    /// Builds the response a peer would serve for the run of unspent
    /// leaves starting at `start_index`, limited to `max_count` utxos.
    pub(crate) fn build_response(
        &self,
        leafset: &Leafset,
        block_hash: BlockHash,
        start_index: u64,
        max_count: usize,
    ) -> MsgMwebUtxos {
        assert!(
            leafset.contains(LeafIdx(start_index)),
            "start index must be unspent"
        );

        let mut utxos = Vec::new();
        let mut leaf = LeafIdx(start_index);
        loop {
            utxos.push(Utxo {
                height: 0,
                leaf_index: leaf.0,
                output_id: self.leaf_ids[leaf.0 as usize],
                output: Vec::new(),
            });
            if utxos.len() == max_count {
                break;
            }
            let next = leafset.next_unspent(leaf);
            if next.0 >= self.num_leaves() {
                break;
            }
            leaf = next;
        }

        let peaks = calc_peaks(self.mmr_size().0);
        let mut walk = ProofWalk {
            leafset,
            first_node: LeafIdx(start_index).node_idx(),
            last_node: leaf.node_idx(),
            marked: HashSet::new(),
            proof: Vec::new(),
        };

        // Mirror the verifier's two passes: the first discovers which
        // positions must be served as proof hashes, the second emits
        // them in consumption order.
        for _pass in 0..2 {
            walk.proof.clear();
            for (pos, &peak) in peaks.iter().enumerate() {
                if self.walk_node(peak, peak.height(), &mut walk).is_none() {
                    walk.marked.insert(peak);
                    walk.proof.push(self.node_hash(peak));
                }
                if walk.last_node <= peak {
                    if pos != peaks.len() - 1 {
                        let bagged = self.bag_peaks(&peaks, pos + 1);
                        walk.proof.push(bagged);
                    }
                    break;
                }
            }
        }

        MsgMwebUtxos {
            block_hash,
            start_index,
            output_format: OutputFormat::Compact,
            utxos,
            proof_hashes: walk.proof,
        }
    }

    fn walk_node(&self, node: NodeIdx, height: u64, walk: &mut ProofWalk<'_>) -> Option<MwebHash> {
        if node < walk.first_node || walk.marked.contains(&node) {
            walk.marked.insert(node);
            walk.proof.push(self.node_hash(node));
            return Some(self.node_hash(node));
        }

        if height == 0 {
            if !walk.leafset.contains(node.leaf_idx()) {
                return None;
            }
            return Some(self.node_hash(node));
        }

        let left_child = node.left_child(height);
        let left = self.walk_node(left_child, height - 1, walk);
        let right_child = node.right_child();
        let right = if walk.last_node <= left_child {
            walk.marked.insert(right_child);
            walk.proof.push(self.node_hash(right_child));
            Some(self.node_hash(right_child))
        } else {
            self.walk_node(right_child, height - 1, walk)
        };

        let (left, right) = match (left, right) {
            (None, None) => return None,
            (None, Some(right)) => {
                walk.marked.insert(left_child);
                walk.proof.push(self.node_hash(left_child));
                (self.node_hash(left_child), right)
            }
            (Some(left), None) => {
                walk.marked.insert(right_child);
                walk.proof.push(self.node_hash(right_child));
                (left, self.node_hash(right_child))
            }
            (Some(left), Some(right)) => (left, right),
        };
        Some(node.parent_hash(&left, &right))
    }
}

#[derive(Default)]
struct CoinStoreInner {
    leafset: Leafset,
    num_leaves: u64,
    coins: HashMap<u64, Utxo>,
    purges: u32,
}

/// In-memory [`CoinStore`].
#[derive(Default)]
pub(crate) struct MemoryCoinStore {
    inner: RwLock<CoinStoreInner>,
}

impl MemoryCoinStore {
    pub(crate) fn new(leafset: Leafset, num_leaves: u64) -> Self {
        Self {
            inner: RwLock::new(CoinStoreInner {
                leafset,
                num_leaves,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn leafset(&self) -> (Leafset, u64) {
        let inner = self.inner.read();
        (inner.leafset.clone(), inner.num_leaves)
    }

    pub(crate) fn coin_count(&self) -> usize {
        self.inner.read().coins.len()
    }

    pub(crate) fn purge_count(&self) -> u32 {
        self.inner.read().purges
    }
}

impl CoinStore for MemoryCoinStore {
    fn leaf_set(&self) -> Result<(Leafset, u64), StoreError> {
        Ok(self.leafset())
    }

    fn put_coins(&self, utxos: &[Utxo]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for utxo in utxos {
            inner.coins.insert(utxo.leaf_index, utxo.clone());
        }
        Ok(())
    }

    fn put_leaf_set_and_purge(
        &self,
        leafset: &Leafset,
        num_leaves: u64,
        removed: &[u64],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.leafset = leafset.clone();
        inner.num_leaves = num_leaves;
        for leaf in removed {
            inner.coins.remove(leaf);
        }
        inner.purges += 1;
        Ok(())
    }

    fn fetch_leaves(&self, indices: &[u64]) -> Result<Vec<Utxo>, StoreError> {
        let inner = self.inner.read();
        Ok(indices
            .iter()
            .filter_map(|leaf| inner.coins.get(leaf).cloned())
            .collect())
    }
}

/// In-memory [`HeaderStore`] pinned to a single tip.
pub(crate) struct MemoryHeaderStore {
    header: BlockHeader,
    height: u32,
}

impl MemoryHeaderStore {
    pub(crate) fn new(header: BlockHeader, height: u32) -> Self {
        Self { header, height }
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn chain_tip(&self) -> Result<(BlockHeader, u32), StoreError> {
        Ok((self.header, self.height))
    }
}

/// [`BanManager`] recording every ban it is asked for.
#[derive(Default)]
pub(crate) struct RecordingBanManager {
    bans: Mutex<Vec<(PeerId, Reason)>>,
}

impl RecordingBanManager {
    pub(crate) fn bans(&self) -> Vec<(PeerId, Reason)> {
        self.bans.lock().clone()
    }
}

impl BanManager for RecordingBanManager {
    fn ban_peer(&self, peer: PeerId, reason: Reason) -> std::io::Result<()> {
        self.bans.lock().push((peer, reason));
        Ok(())
    }
}
