//! MWEB p2p message types and their consensus encoding.

use bitcoin::consensus::encode::{self, VarInt};
use bitcoin::consensus::{Decodable, Encodable};
use bitcoin::io::{Read, Write};
use bitcoin::{BlockHash, MerkleBlock, Transaction};
use std::fmt;

/// Maximum number of utxos served by a single `getmwebutxos` query.
pub const MAX_UTXOS_PER_QUERY: u16 = 4096;

/// A proof never carries more than two hashes per requested utxo plus
/// one per tree level.
const MAX_PROOF_HASHES: u64 = 2 * MAX_UTXOS_PER_QUERY as u64 + 64;

/// 32-byte hash on the extension-block side (blake3 digests).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MwebHash([u8; 32]);

impl MwebHash {
    /// Wraps raw digest bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zero hash, used as the root of an empty MMR.
    pub const fn all_zeros() -> Self {
        Self([0u8; 32])
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for MwebHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MwebHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Encodable for MwebHash {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for MwebHash {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Self(<[u8; 32]>::consensus_decode(r)?))
    }
}

/// Extension-block header, committed to by the HogEx output script of
/// the base-chain block.
///
/// Immutable once verified. Only `output_root`, `output_mmr_size` and
/// `leafset_root` participate in utxo verification; the remaining
/// fields are carried so that [`MwebHeader::hash`] commits to the full
/// serialized header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MwebHeader {
    /// Extension-block height.
    pub height: i32,
    /// Root commitment of the output MMR.
    pub output_root: MwebHash,
    /// Root commitment of the kernel MMR.
    pub kernel_root: MwebHash,
    /// Root commitment of the unspent-leafset bitmap.
    pub leafset_root: MwebHash,
    /// Total kernel excess blinding offset.
    pub kernel_offset: [u8; 32],
    /// Total stealth excess blinding offset.
    pub stealth_offset: [u8; 32],
    /// Number of leaves in the output MMR.
    pub output_mmr_size: u64,
    /// Number of leaves in the kernel MMR.
    pub kernel_mmr_size: u64,
}

impl MwebHeader {
    /// Hash committing to the serialized header.
    pub fn hash(&self) -> MwebHash {
        let mut data = Vec::new();
        self.consensus_encode(&mut data)
            .expect("writing to a vec never fails; qed");
        MwebHash::new(*blake3::hash(&data).as_bytes())
    }
}

impl Encodable for MwebHeader {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.height.consensus_encode(w)?;
        len += self.output_root.consensus_encode(w)?;
        len += self.kernel_root.consensus_encode(w)?;
        len += self.leafset_root.consensus_encode(w)?;
        len += self.kernel_offset.consensus_encode(w)?;
        len += self.stealth_offset.consensus_encode(w)?;
        len += VarInt(self.output_mmr_size).consensus_encode(w)?;
        len += VarInt(self.kernel_mmr_size).consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for MwebHeader {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(MwebHeader {
            height: Decodable::consensus_decode(r)?,
            output_root: Decodable::consensus_decode(r)?,
            kernel_root: Decodable::consensus_decode(r)?,
            leafset_root: Decodable::consensus_decode(r)?,
            kernel_offset: Decodable::consensus_decode(r)?,
            stealth_offset: Decodable::consensus_decode(r)?,
            output_mmr_size: VarInt::consensus_decode(r)?.0,
            kernel_mmr_size: VarInt::consensus_decode(r)?.0,
        })
    }
}

/// Requested encoding of utxos on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputFormat {
    /// Complete output, including rangeproof and signature.
    Full = 0,
    /// Output hash only.
    HashOnly = 1,
    /// Output stripped of its rangeproof.
    Compact = 2,
}

impl Encodable for OutputFormat {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        (*self as u8).consensus_encode(w)
    }
}

impl Decodable for OutputFormat {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        match u8::consensus_decode(r)? {
            0 => Ok(Self::Full),
            1 => Ok(Self::HashOnly),
            2 => Ok(Self::Compact),
            _ => Err(encode::Error::ParseFailed("unknown mweb utxo output format")),
        }
    }
}

/// A confidential output together with its position in the output MMR.
///
/// Only `leaf_index` and `output_id` participate in proof verification;
/// the raw output payload is carried for the wallet layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Height of the block that confirmed this output.
    pub height: i32,
    /// Position of the output's leaf in the output MMR.
    pub leaf_index: u64,
    /// Identifier the leaf digest is computed from.
    pub output_id: MwebHash,
    /// Raw output payload in the format negotiated by the query.
    pub output: Vec<u8>,
}

impl Encodable for Utxo {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.height.consensus_encode(w)?;
        len += VarInt(self.leaf_index).consensus_encode(w)?;
        len += self.output_id.consensus_encode(w)?;
        len += self.output.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for Utxo {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Utxo {
            height: Decodable::consensus_decode(r)?,
            leaf_index: VarInt::consensus_decode(r)?.0,
            output_id: Decodable::consensus_decode(r)?,
            output: Decodable::consensus_decode(r)?,
        })
    }
}

/// Reply to `getmwebheader`: the merkleblock binding, the HogEx marker
/// transaction and the extension header itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMwebHeader {
    /// Merkleblock proving the HogEx is committed to by the block.
    pub merkle: MerkleBlock,
    /// The designated final transaction of the block.
    pub hogex: Transaction,
    /// Whether the transaction carried the extension-flag marker on the
    /// wire.
    pub is_hog_ex: bool,
    /// The extension-block header.
    pub mweb: MwebHeader,
}

impl Encodable for MsgMwebHeader {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.merkle.consensus_encode(w)?;
        len += self.hogex.consensus_encode(w)?;
        len += self.is_hog_ex.consensus_encode(w)?;
        len += self.mweb.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for MsgMwebHeader {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(MsgMwebHeader {
            merkle: Decodable::consensus_decode(r)?,
            hogex: Decodable::consensus_decode(r)?,
            is_hog_ex: Decodable::consensus_decode(r)?,
            mweb: Decodable::consensus_decode(r)?,
        })
    }
}

/// Reply to `getmwebleafset`: the raw unspent-leafset bitmap for a
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMwebLeafset {
    /// Hash of the base-chain block the bitmap belongs to.
    pub block_hash: BlockHash,
    /// Raw bitmap bytes, MSB-first within each byte.
    pub leafset: Vec<u8>,
}

impl Encodable for MsgMwebLeafset {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.block_hash.consensus_encode(w)?;
        len += self.leafset.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for MsgMwebLeafset {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(MsgMwebLeafset {
            block_hash: Decodable::consensus_decode(r)?,
            leafset: Decodable::consensus_decode(r)?,
        })
    }
}

/// Requests a batch of utxos with their MMR proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgGetMwebUtxos {
    /// Hash of the base-chain block whose utxo set is queried.
    pub block_hash: BlockHash,
    /// First leaf index of the requested range.
    pub start_index: u64,
    /// Number of utxos requested, at most [`MAX_UTXOS_PER_QUERY`].
    pub num_requested: u16,
    /// Requested utxo encoding.
    pub output_format: OutputFormat,
}

impl Encodable for MsgGetMwebUtxos {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.block_hash.consensus_encode(w)?;
        len += VarInt(self.start_index).consensus_encode(w)?;
        len += self.num_requested.consensus_encode(w)?;
        len += self.output_format.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for MsgGetMwebUtxos {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let block_hash = Decodable::consensus_decode(r)?;
        let start_index = VarInt::consensus_decode(r)?.0;
        let num_requested = u16::consensus_decode(r)?;
        if num_requested > MAX_UTXOS_PER_QUERY {
            return Err(encode::Error::ParseFailed(
                "too many utxos requested in getmwebutxos message",
            ));
        }
        Ok(MsgGetMwebUtxos {
            block_hash,
            start_index,
            num_requested,
            output_format: Decodable::consensus_decode(r)?,
        })
    }
}

/// A batch of utxos together with the proof hashes binding them to the
/// output root declared in the mweb header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMwebUtxos {
    /// Hash of the base-chain block the batch belongs to.
    pub block_hash: BlockHash,
    /// Leaf index the batch starts at.
    pub start_index: u64,
    /// Encoding of the utxo payloads.
    pub output_format: OutputFormat,
    /// Served utxos, strictly ascending by leaf index.
    pub utxos: Vec<Utxo>,
    /// Sibling and bagged-peak hashes, in verification order.
    pub proof_hashes: Vec<MwebHash>,
}

impl Encodable for MsgMwebUtxos {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.block_hash.consensus_encode(w)?;
        len += VarInt(self.start_index).consensus_encode(w)?;
        len += self.output_format.consensus_encode(w)?;
        len += VarInt(self.utxos.len() as u64).consensus_encode(w)?;
        for utxo in &self.utxos {
            len += utxo.consensus_encode(w)?;
        }
        len += VarInt(self.proof_hashes.len() as u64).consensus_encode(w)?;
        for hash in &self.proof_hashes {
            len += hash.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for MsgMwebUtxos {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let block_hash = Decodable::consensus_decode(r)?;
        let start_index = VarInt::consensus_decode(r)?.0;
        let output_format = Decodable::consensus_decode(r)?;

        let utxo_count = VarInt::consensus_decode(r)?.0;
        if utxo_count > u64::from(MAX_UTXOS_PER_QUERY) {
            return Err(encode::Error::ParseFailed(
                "too many utxos in mwebutxos message",
            ));
        }
        let mut utxos = Vec::with_capacity(utxo_count as usize);
        for _ in 0..utxo_count {
            utxos.push(Utxo::consensus_decode(r)?);
        }

        let hash_count = VarInt::consensus_decode(r)?.0;
        if hash_count > MAX_PROOF_HASHES {
            return Err(encode::Error::ParseFailed(
                "too many proof hashes in mwebutxos message",
            ));
        }
        let mut proof_hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            proof_hashes.push(MwebHash::consensus_decode(r)?);
        }

        Ok(MsgMwebUtxos {
            block_hash,
            start_index,
            output_format,
            utxos,
            proof_hashes,
        })
    }
}

/// MWEB protocol messages exchanged with peers.
///
/// The query dispatcher moves requests and responses around as opaque
/// [`Message`] values; handlers match on the variant they expect.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `getmwebutxos` request.
    GetMwebUtxos(MsgGetMwebUtxos),
    /// `mwebutxos` response.
    MwebUtxos(MsgMwebUtxos),
    /// `mwebheader` response.
    MwebHeader(MsgMwebHeader),
    /// `mwebleafset` response.
    MwebLeafset(MsgMwebLeafset),
}

impl Message {
    /// Wire command string of the message.
    pub fn cmd(&self) -> &'static str {
        match self {
            Self::GetMwebUtxos(_) => "getmwebutxos",
            Self::MwebUtxos(_) => "mwebutxos",
            Self::MwebHeader(_) => "mwebheader",
            Self::MwebLeafset(_) => "mwebleafset",
        }
    }
}

/// Base-chain block a batch of utxos was confirmed in, as passed to
/// subscriber callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Block hash.
    pub hash: BlockHash,
    /// Block height.
    pub height: u32,
    /// Header timestamp.
    pub time: u32,
}
