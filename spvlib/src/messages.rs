// Copyright (C) 2013-2020 Blockstack PBC, a public benefit corporation
// Copyright (C) 2020 Stacks Open Internet Foundation
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Protocol messages
//!
//! The subset of the peer-to-peer protocol an SPV peer session observes.
//! Framing and serialization belong to the transport; these are the decoded
//! payloads it hands us.

use spv_common::consts::PROTOCOL_VERSION;
use spv_common::util::hash::Sha256dHash;

use crate::Error;

/// Upper bound on the transaction count a merkle block may claim: the
/// maximum block weight divided by the minimum transaction weight.
pub const MAX_MERKLE_BLOCK_TXS: u32 = 4_000_000 / 240;

/// Objects with a stable identifying hash
pub trait BitcoinHash {
    fn bitcoin_hash(&self) -> Sha256dHash;
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
/// The type of an inventory object
pub enum InvType {
    /// Error --- these inventories can be ignored
    Error,
    /// Transaction
    Transaction,
    /// Block
    Block,
    /// Block filtered through the peer's bloom filter, answered with `merkleblock`
    FilteredBlock,
}

/// An inventory object --- a reference to a block or transaction
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Inventory {
    /// The type of object that is referenced
    pub inv_type: InvType,
    /// The object's hash
    pub hash: Sha256dHash,
}

impl Inventory {
    pub fn new(inv_type: InvType, hash: Sha256dHash) -> Inventory {
        Inventory { inv_type, hash }
    }
}

/// The `getblocks` message
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct GetBlocksMessage {
    /// The protocol version
    pub version: u32,
    /// Locator hashes --- ordered newest to oldest. The remote peer will
    /// reply with its longest known chain, starting from a locator hash
    /// if possible and block 1 otherwise.
    pub locator_hashes: Vec<Sha256dHash>,
    /// References the block to stop at, or zero to just fetch the maximum 500 blocks
    pub stop_hash: Sha256dHash,
}

impl GetBlocksMessage {
    /// Construct a new `getblocks` message
    pub fn new(locator_hashes: Vec<Sha256dHash>, stop_hash: Sha256dHash) -> GetBlocksMessage {
        GetBlocksMessage {
            version: PROTOCOL_VERSION,
            locator_hashes,
            stop_hash,
        }
    }
}

/// The `version` message, as far as this layer cares about it
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

/// A block header
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct BlockHeader {
    /// The protocol version. Should always be 1.
    pub version: u32,
    /// Reference to the previous block in the chain
    pub prev_blockhash: Sha256dHash,
    /// The root hash of the merkle tree of transactions in the block
    pub merkle_root: Sha256dHash,
    /// The timestamp of the block, as claimed by the miner
    pub time: u32,
    /// The target value below which the blockhash must lie, encoded as a
    /// a float (with well-defined rounding, of course)
    pub bits: u32,
    /// The nonce, selected to obtain a low enough blockhash
    pub nonce: u32,
}

impl BlockHeader {
    /// The 80-byte wire serialization of the header
    pub fn serialize(&self) -> [u8; 80] {
        let mut buf = [0u8; 80];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.prev_blockhash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.time.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }
}

impl BitcoinHash for BlockHeader {
    fn bitcoin_hash(&self) -> Sha256dHash {
        Sha256dHash::from_data(&self.serialize())
    }
}

/// A transaction, kept in its serialized form.  Parsing inputs and outputs
/// is up to the wallet layer; all we need here is its txid.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Transaction {
    pub raw: Vec<u8>,
}

impl Transaction {
    pub fn new(raw: Vec<u8>) -> Transaction {
        Transaction { raw }
    }

    pub fn txid(&self) -> Sha256dHash {
        self.bitcoin_hash()
    }
}

impl BitcoinHash for Transaction {
    fn bitcoin_hash(&self) -> Sha256dHash {
        Sha256dHash::from_data(&self.raw)
    }
}

/// The `merkleblock` message: a block header plus a partial merkle tree
/// proving inclusion of the transactions that matched our bloom filter
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    /// Number of transactions in the full block
    pub total_transactions: u32,
    /// Node hashes of the partial merkle tree, in depth-first order
    pub hashes: Vec<Sha256dHash>,
    /// Traversal flag bits, packed least-significant bit first
    pub flags: Vec<u8>,
}

/// Cursor over a partial merkle tree while it is being walked
struct PartialTreeWalk<'a> {
    total_transactions: u32,
    hashes: &'a [Sha256dHash],
    bits: Vec<bool>,
    bits_used: usize,
    hashes_used: usize,
    matches: Vec<Sha256dHash>,
}

impl<'a> PartialTreeWalk<'a> {
    fn tree_width(&self, height: u32) -> u32 {
        ((self.total_transactions as u64 + (1u64 << height) - 1) >> height) as u32
    }

    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        height
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<Sha256dHash, Error> {
        let parent_of_match = *self.bits.get(self.bits_used).ok_or_else(|| {
            Error::InvalidMerkleBlock("overflowed the flag bits".to_string())
        })?;
        self.bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self.hashes.get(self.hashes_used).ok_or_else(|| {
                Error::InvalidMerkleBlock("overflowed the hash array".to_string())
            })?;
            self.hashes_used += 1;
            if height == 0 && parent_of_match {
                self.matches.push(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            if right == left {
                // identical siblings would let a peer forge duplicate-tx merkle roots
                return Err(Error::InvalidMerkleBlock(
                    "duplicate sibling hashes".to_string(),
                ));
            }
            right
        } else {
            left
        };
        Ok(Sha256dHash::from_node_hashes(&left, &right))
    }
}

impl MerkleBlockMessage {
    fn flag_bits(&self) -> Vec<bool> {
        let mut bits = Vec::with_capacity(self.flags.len() * 8);
        for byte in self.flags.iter() {
            for i in 0..8 {
                bits.push((byte >> i) & 1 == 1);
            }
        }
        bits
    }

    /// Walk the partial merkle tree.  Returns the computed merkle root and the
    /// txids of the matched transactions, in block order.  Does not compare
    /// the root against the header.
    pub fn extract_matches(&self) -> Result<(Sha256dHash, Vec<Sha256dHash>), Error> {
        if self.total_transactions == 0 {
            return Err(Error::InvalidMerkleBlock("no transactions".to_string()));
        }
        if self.total_transactions > MAX_MERKLE_BLOCK_TXS {
            return Err(Error::InvalidMerkleBlock(format!(
                "too many transactions ({})",
                self.total_transactions
            )));
        }
        if self.hashes.len() > self.total_transactions as usize {
            return Err(Error::InvalidMerkleBlock(
                "more hashes than transactions".to_string(),
            ));
        }
        let bits = self.flag_bits();
        if bits.len() < self.hashes.len() {
            return Err(Error::InvalidMerkleBlock(
                "fewer flag bits than hashes".to_string(),
            ));
        }

        let mut walk = PartialTreeWalk {
            total_transactions: self.total_transactions,
            hashes: &self.hashes,
            bits,
            bits_used: 0,
            hashes_used: 0,
            matches: vec![],
        };
        let height = walk.tree_height();
        let root = walk.traverse(height, 0)?;

        // every flag byte and every hash must have been consumed
        if (walk.bits_used + 7) / 8 != self.flags.len() {
            return Err(Error::InvalidMerkleBlock(
                "not all flag bits were consumed".to_string(),
            ));
        }
        if walk.hashes_used != self.hashes.len() {
            return Err(Error::InvalidMerkleBlock(
                "not all hashes were consumed".to_string(),
            ));
        }
        Ok((root, walk.matches))
    }

    /// Walk the partial merkle tree and check it against the header's merkle root.
    /// Returns the matched txids.
    pub fn validated_matches(&self) -> Result<Vec<Sha256dHash>, Error> {
        let (root, matches) = self.extract_matches()?;
        if root != self.header.merkle_root {
            return Err(Error::InvalidMerkleBlock(format!(
                "merkle root mismatch: computed {}, header has {}",
                root, self.header.merkle_root
            )));
        }
        Ok(matches)
    }
}

/// The `reject` message
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct RejectMessage {
    /// Command of the message that was rejected
    pub message: String,
    /// Reject code
    pub ccode: u8,
    /// Human-readable reason
    pub reason: String,
    /// Hash of the rejected block or transaction, if any
    pub hash: Option<Sha256dHash>,
}

/// The `filterload` message.  The filter itself is built by the bloom module.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// A decoded peer-to-peer message payload
pub enum PeerMessage {
    /// `version`
    Version(VersionMessage),
    /// `verack`
    Verack,
    /// `ping`
    Ping(u64),
    /// `pong`
    Pong(u64),
    /// `inv`
    Inv(Vec<Inventory>),
    /// `getdata`
    GetData(Vec<Inventory>),
    /// `notfound`
    NotFound(Vec<Inventory>),
    /// `getblocks`
    GetBlocks(GetBlocksMessage),
    /// `merkleblock`
    MerkleBlock(MerkleBlockMessage),
    /// `tx`
    Tx(Transaction),
    /// `reject`
    Reject(RejectMessage),
    /// `filterload`
    FilterLoad(FilterLoadMessage),
    /// `mempool`
    MemPool,
}

impl PeerMessage {
    /// Return the message command. This is useful for debug outputs.
    pub fn command(&self) -> &'static str {
        match *self {
            PeerMessage::Version(_) => "version",
            PeerMessage::Verack => "verack",
            PeerMessage::Ping(_) => "ping",
            PeerMessage::Pong(_) => "pong",
            PeerMessage::Inv(_) => "inv",
            PeerMessage::GetData(_) => "getdata",
            PeerMessage::NotFound(_) => "notfound",
            PeerMessage::GetBlocks(_) => "getblocks",
            PeerMessage::MerkleBlock(_) => "merkleblock",
            PeerMessage::Tx(_) => "tx",
            PeerMessage::Reject(_) => "reject",
            PeerMessage::FilterLoad(_) => "filterload",
            PeerMessage::MemPool => "mempool",
        }
    }
}
