//! Verification of an mweb header and leafset pair against the base
//! chain.

use bitcoin::BlockHash;
use mweb_primitives::{Leafset, MsgMwebHeader, MsgMwebLeafset};

/// `OP_8` followed by a 32-byte push; the HogAddr script prefix.
const HOG_ADDR_PREFIX: [u8; 2] = [0x58, 0x20];

/// Checks that an mweb header and leafset pair is committed to by the
/// base-chain block at `last_hash`.
///
/// The merkleblock must bind the HogEx as the final transaction of the
/// block, the first HogEx output must commit to the serialized mweb
/// header, and the leafset bitmap must hash to the header's leafset
/// root. Pure; any failing check yields `false`.
pub fn verify_mweb_header(
    mweb_header: &MsgMwebHeader,
    mweb_leafset: &MsgMwebLeafset,
    last_height: u32,
    last_hash: BlockHash,
) -> bool {
    tracing::info!(
        block_height = last_height,
        block_hash = %last_hash,
        "Got mwebheader and mwebleafset",
    );

    if mweb_header.merkle.header.block_hash() != last_hash {
        tracing::info!(
            merkle_header_hash = %mweb_header.merkle.header.block_hash(),
            block_hash = %last_hash,
            "Block hash mismatch",
        );
        return false;
    }

    // Extraction recomputes the partial tree's root and compares it
    // against the merkle root in the block header.
    let mut matches = Vec::new();
    let mut indexes = Vec::new();
    if let Err(err) = mweb_header.merkle.extract_matches(&mut matches, &mut indexes) {
        tracing::info!(?err, "mwebheader merkle block is bad");
        return false;
    }

    if !mweb_header.is_hog_ex {
        tracing::info!("mwebheader hogex is not hogex");
        return false;
    }

    // The hash of the HogEx transaction must match the last transaction
    // committed to by the merkle root of the block, at the final
    // position.
    let Some((final_txid, final_tx_pos)) = matches.last().zip(indexes.last()) else {
        tracing::info!("mwebheader merkle block matched no transactions");
        return false;
    };
    if mweb_header.hogex.compute_txid() != *final_txid {
        tracing::info!(
            hogex = %mweb_header.hogex.compute_txid(),
            last_merkle_tx = %final_txid,
            "Tx hash mismatch",
        );
        return false;
    }
    let num_transactions = mweb_header.merkle.txn.num_transactions();
    if *final_tx_pos != num_transactions - 1 {
        tracing::info!(
            got = final_tx_pos,
            expected = num_transactions - 1,
            "Tx index mismatch",
        );
        return false;
    }

    // The pubkey script of the first output must contain the HogAddr:
    // <OP_8><0x20> followed by the 32-byte hash of the mweb header.
    let mweb_header_hash = mweb_header.mweb.hash();
    let mut script = Vec::with_capacity(34);
    script.extend_from_slice(&HOG_ADDR_PREFIX);
    script.extend_from_slice(mweb_header_hash.as_bytes());
    let Some(first_output) = mweb_header.hogex.output.first() else {
        tracing::info!("mwebheader hogex has no outputs");
        return false;
    };
    if first_output.script_pubkey.as_bytes() != script.as_slice() {
        tracing::info!(
            hogex_script = ?first_output.script_pubkey,
            "HogAddr mismatch",
        );
        return false;
    }

    // The hash of the leafset bitmap must match the leafset_root value
    // in the mweb header.
    let leafset_root = Leafset::from(mweb_leafset.leafset.as_slice()).root();
    if leafset_root != mweb_header.mweb.leafset_root {
        tracing::info!(
            leafset = %leafset_root,
            in_header = %mweb_header.mweb.leafset_root,
            "Leafset root mismatch",
        );
        return false;
    }

    tracing::info!(
        block_height = last_height,
        block_hash = %last_hash,
        "Verified mwebheader and mwebleafset",
    );
    true
}
