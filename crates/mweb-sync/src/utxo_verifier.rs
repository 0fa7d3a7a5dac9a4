//! Verification of batched utxo responses against the output MMR root.

use mweb_primitives::mmr::{calc_peaks, LeafIdx, NodeIdx};
use mweb_primitives::{Leafset, MsgMwebUtxos, MwebHash, MwebHeader};
use std::collections::HashSet;

/// Cursor state shared by the two verification passes.
struct VerifyVars<'a> {
    msg: &'a MsgMwebUtxos,
    leafset: &'a Leafset,
    first_leaf_idx: LeafIdx,
    last_leaf_idx: LeafIdx,
    leaves_used: usize,
    hashes_used: usize,
    /// Node positions learned to be proof hashes during the first pass.
    is_proof_hash: HashSet<NodeIdx>,
}

impl VerifyVars<'_> {
    fn next_leaf(&mut self) -> Option<(LeafIdx, MwebHash)> {
        let utxo = self.msg.utxos.get(self.leaves_used)?;
        self.leaves_used += 1;
        Some((LeafIdx(utxo.leaf_index), utxo.output_id))
    }

    fn next_hash(&mut self, node_idx: NodeIdx) -> Option<MwebHash> {
        let hash = self.msg.proof_hashes.get(self.hashes_used).copied()?;
        self.hashes_used += 1;
        self.is_proof_hash.insert(node_idx);
        Some(hash)
    }

    /// Recomputes the digest of `node_idx`, consuming utxos and proof
    /// hashes as the subtree demands. `None` marks a subtree consisting
    /// entirely of spent leaves; the caller covers it with a proof hash.
    fn calc_node_hash(&mut self, node_idx: NodeIdx, height: u64) -> Option<MwebHash> {
        if node_idx < self.first_leaf_idx.node_idx() || self.is_proof_hash.contains(&node_idx) {
            return self.next_hash(node_idx);
        }

        if height == 0 {
            let leaf_idx = node_idx.leaf_idx();
            if !self.leafset.contains(leaf_idx) {
                return None;
            }
            let (batch_leaf_idx, output_id) = self.next_leaf()?;
            if leaf_idx != batch_leaf_idx {
                return None;
            }
            return Some(node_idx.hash(output_id.as_bytes()));
        }

        let left_child = node_idx.left_child(height);
        let left = self.calc_node_hash(left_child, height - 1);
        let right = if self.last_leaf_idx.node_idx() <= left_child {
            // The right subtree lies entirely beyond the covered range.
            self.next_hash(node_idx.right_child())
        } else {
            self.calc_node_hash(node_idx.right_child(), height - 1)
        };

        let (left, right) = match (left, right) {
            (None, None) => return None,
            (None, Some(right)) => (self.next_hash(left_child)?, right),
            (Some(left), None) => (left, self.next_hash(node_idx.right_child())?),
            (Some(left), Some(right)) => (left, right),
        };
        Some(node_idx.parent_hash(&left, &right))
    }
}

/// Verifies a batched utxo response against the output root of a
/// verified mweb header.
///
/// The peak walk runs twice: the first pass learns which node positions
/// are proof hashes, the second treats them uniformly. After the second
/// pass both cursors must land exactly on the message's lengths, and
/// the peaks bagged right to left must reproduce the output root. Pure;
/// any failure yields `false`.
pub fn verify_mweb_utxos(mweb_header: &MwebHeader, leafset: &Leafset, msg: &MsgMwebUtxos) -> bool {
    if msg.start_index == 0
        && msg.utxos.is_empty()
        && msg.proof_hashes.is_empty()
        && mweb_header.output_root == MwebHash::all_zeros()
        && mweb_header.output_mmr_size == 0
    {
        return true;
    } else if msg.utxos.is_empty() || mweb_header.output_mmr_size == 0 {
        return false;
    }

    let mut v = VerifyVars {
        msg,
        leafset,
        first_leaf_idx: LeafIdx(msg.start_index),
        last_leaf_idx: LeafIdx(msg.start_index),
        leaves_used: 0,
        hashes_used: 0,
        is_proof_hash: HashSet::new(),
    };

    // The batch must cover exactly the unspent range starting at the
    // first leaf.
    for i in 0.. {
        if !v.leafset.contains(v.last_leaf_idx) {
            return false;
        }
        if LeafIdx(msg.utxos[i].leaf_index) != v.last_leaf_idx {
            return false;
        }
        if i == msg.utxos.len() - 1 {
            break;
        }
        v.last_leaf_idx = v.leafset.next_unspent(v.last_leaf_idx);
    }

    let mmr_size = LeafIdx(mweb_header.output_mmr_size).node_idx();
    let peaks = calc_peaks(mmr_size.0);
    let mut peak_hashes = Vec::new();

    for _pass in 0..2 {
        peak_hashes.clear();
        v.leaves_used = 0;
        v.hashes_used = 0;

        for (pos, &peak_node_idx) in peaks.iter().enumerate() {
            let peak_hash = match v.calc_node_hash(peak_node_idx, peak_node_idx.height()) {
                Some(hash) => hash,
                // The peak's covered leaves are all spent; its digest
                // must be supplied directly.
                None => match v.next_hash(peak_node_idx) {
                    Some(hash) => hash,
                    None => return false,
                },
            };
            peak_hashes.push(peak_hash);

            if v.last_leaf_idx.node_idx() <= peak_node_idx {
                if pos != peaks.len() - 1 {
                    // The peaks to the right arrive pre-bagged as a
                    // single proof hash.
                    match v.next_hash(mmr_size) {
                        Some(bagged_peak) => peak_hashes.push(bagged_peak),
                        None => return false,
                    }
                }
                break;
            }
        }

        if v.leaves_used != msg.utxos.len() || v.hashes_used != msg.proof_hashes.len() {
            return false;
        }
    }

    // Bag the peaks right to left into the root commitment.
    let mut bagged_peak = *peak_hashes
        .last()
        .expect("the peak walk pushes at least one hash; qed");
    for peak_hash in peak_hashes.iter().rev().skip(1) {
        bagged_peak = mmr_size.parent_hash(peak_hash, &bagged_peak);
    }
    bagged_peak == mweb_header.output_root
}
