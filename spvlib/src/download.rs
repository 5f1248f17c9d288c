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

use std::collections::HashSet;
use std::mem;
use std::sync::{Mutex, MutexGuard};

use spv_common::util::hash::Sha256dHash;

use crate::messages::{BitcoinHash, MerkleBlockMessage, Transaction};
use crate::Error;

/// Transactions we asked the peer for, independent of any block.
#[derive(Debug, Default)]
pub struct DownloadTx {
    queue: Mutex<HashSet<Sha256dHash>>,
}

impl DownloadTx {
    pub fn new() -> DownloadTx {
        DownloadTx::default()
    }

    fn queue(&self) -> MutexGuard<'_, HashSet<Sha256dHash>> {
        self.queue
            .lock()
            .expect("FATAL: download tx queue mutex poisoned")
    }

    /// Mark a txid as expected.  Enqueueing it twice is a no-op.
    pub fn enqueue(&self, txid: Sha256dHash) {
        self.queue().insert(txid);
    }

    /// Stop expecting a txid.  Returns false if it wasn't expected.
    pub fn dequeue(&self, txid: &Sha256dHash) -> bool {
        self.queue().remove(txid)
    }

    pub fn contains(&self, txid: &Sha256dHash) -> bool {
        self.queue().contains(txid)
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

#[derive(Debug, Default)]
struct DownloadBlockState {
    merkle_block: Option<MerkleBlockMessage>,
    tx_queue: HashSet<Sha256dHash>,
    txs: Vec<Transaction>,
}

/// The merkle block currently being downloaded, plus the matched
/// transactions we still need before it can be handed to the wallet.
/// All state sits behind one lock so `finished()` never sees a torn update.
#[derive(Debug, Default)]
pub struct DownloadBlock {
    state: Mutex<DownloadBlockState>,
}

impl DownloadBlock {
    /// An empty tracker with no merkle block attached
    pub fn new() -> DownloadBlock {
        DownloadBlock::default()
    }

    /// Start tracking a merkle block.  The partial merkle tree is checked
    /// against the header, and every matched txid becomes an expected
    /// transaction.
    pub fn from_merkle_block(merkle_block: MerkleBlockMessage) -> Result<DownloadBlock, Error> {
        let matches = merkle_block.validated_matches()?;
        let state = DownloadBlockState {
            merkle_block: Some(merkle_block),
            tx_queue: matches.into_iter().collect(),
            txs: vec![],
        };
        Ok(DownloadBlock {
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, DownloadBlockState> {
        self.state
            .lock()
            .expect("FATAL: download block mutex poisoned")
    }

    pub fn enqueue_tx(&self, txid: Sha256dHash) {
        self.state().tx_queue.insert(txid);
    }

    /// Returns false if the txid was not expected for this block.
    pub fn dequeue_tx(&self, txid: &Sha256dHash) -> bool {
        self.state().tx_queue.remove(txid)
    }

    /// True once no more transactions are expected
    pub fn finished(&self) -> bool {
        self.state().tx_queue.is_empty()
    }

    pub fn pending_txs(&self) -> usize {
        self.state().tx_queue.len()
    }

    /// Record a transaction that resolved one of this block's matches
    pub fn push_tx(&self, tx: Transaction) {
        self.state().txs.push(tx);
    }

    pub fn block_hash(&self) -> Option<Sha256dHash> {
        self.state()
            .merkle_block
            .as_ref()
            .map(|mb| mb.header.bitcoin_hash())
    }

    pub fn merkle_block(&self) -> Option<MerkleBlockMessage> {
        self.state().merkle_block.clone()
    }

    /// Hand over the block and its transactions, in arrival order, once every
    /// expected transaction has arrived.  Returns None if the block isn't
    /// finished or was already taken.
    pub fn take_block(&self) -> Option<(MerkleBlockMessage, Vec<Transaction>)> {
        let mut state = self.state();
        if !state.tx_queue.is_empty() {
            return None;
        }
        let merkle_block = state.merkle_block.take()?;
        let txs = mem::take(&mut state.txs);
        Some((merkle_block, txs))
    }
}
