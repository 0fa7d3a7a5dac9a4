//! Shared primitives for the MWEB (Mimblewimble Extension Block) light
//! client: Merkle Mountain Range index arithmetic, the unspent-leafset
//! bitmap, and the MWEB p2p message types.

mod leafset;
mod messages;
pub mod mmr;

pub use crate::leafset::Leafset;
pub use crate::messages::{
    BlockMeta, Message, MsgGetMwebUtxos, MsgMwebHeader, MsgMwebLeafset, MsgMwebUtxos, MwebHash,
    MwebHeader, OutputFormat, Utxo, MAX_UTXOS_PER_QUERY,
};
