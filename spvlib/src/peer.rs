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

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, RwLock};

use spv_common::util::hash::Sha256dHash;

use crate::config::SpvConfig;
use crate::download::{DownloadBlock, DownloadTx};
use crate::messages::{
    FilterLoadMessage, GetBlocksMessage, InvType, Inventory, MerkleBlockMessage, PeerMessage,
    RejectMessage, Transaction,
};
use crate::stall::StallDetector;
use crate::Error;

/// A connection to a remote peer, owned by the transport.  The transport
/// frames and flushes messages, does the version handshake, and feeds every
/// decoded inbound message to `SpvPeer::handle_message`, one at a time.
pub trait PeerConnection: Send + Sync {
    /// Queue a message for sending.  If `done` is given, the transport
    /// signals it once the message has been flushed.
    fn queue_message(
        &self,
        message: PeerMessage,
        done: Option<SyncSender<()>>,
    ) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Drop the connection.  Must be idempotent.
    fn disconnect(&self);

    fn addr(&self) -> SocketAddr;
}

/// Callbacks an SPV client registers with each peer session.  Handlers run on
/// the transport's receive thread, one message at a time per session.  An
/// error is logged and handed back to the transport; it never stops the
/// session.
pub trait SpvMessageHandler: Send + Sync {
    /// Our own chain height, advertised in ping and pong nonces
    fn local_height(&self) -> u32;

    /// Block hashes announced in reply to a `getblocks`
    fn on_inventory(&self, _peer: &SpvPeer, _invs: &[Inventory]) -> Result<(), Error> {
        Ok(())
    }

    /// A filtered block, in reply to a `getdata` for a filtered block.  Use
    /// its matched txids to request the transactions themselves.
    fn on_merkle_block(
        &self,
        _peer: &SpvPeer,
        _merkle_block: &MerkleBlockMessage,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A transaction that matched our bloom filter
    fn on_tx(&self, _peer: &SpvPeer, _tx: &Transaction) -> Result<(), Error> {
        Ok(())
    }

    /// The peer doesn't have something we asked for
    fn on_not_found(&self, _peer: &SpvPeer, _invs: &[Inventory]) -> Result<(), Error> {
        Ok(())
    }

    /// The peer rejected something we sent it
    fn on_reject(&self, _peer: &SpvPeer, _reject: &RejectMessage) -> Result<(), Error> {
        Ok(())
    }
}

impl<T: SpvMessageHandler + ?Sized> SpvMessageHandler for Arc<T> {
    fn local_height(&self) -> u32 {
        (**self).local_height()
    }

    fn on_inventory(&self, peer: &SpvPeer, invs: &[Inventory]) -> Result<(), Error> {
        (**self).on_inventory(peer, invs)
    }

    fn on_merkle_block(
        &self,
        peer: &SpvPeer,
        merkle_block: &MerkleBlockMessage,
    ) -> Result<(), Error> {
        (**self).on_merkle_block(peer, merkle_block)
    }

    fn on_tx(&self, peer: &SpvPeer, tx: &Transaction) -> Result<(), Error> {
        (**self).on_tx(peer, tx)
    }

    fn on_not_found(&self, peer: &SpvPeer, invs: &[Inventory]) -> Result<(), Error> {
        (**self).on_not_found(peer, invs)
    }

    fn on_reject(&self, peer: &SpvPeer, reject: &RejectMessage) -> Result<(), Error> {
        (**self).on_reject(peer, reject)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FalsePositiveStats {
    received_txs: u32,
    false_positives: u32,
}

/// One SPV sync session with a full node.
pub struct SpvPeer {
    conn: Arc<dyn PeerConnection>,
    handler: Box<dyn SpvMessageHandler>,

    downloading: RwLock<Arc<DownloadBlock>>,
    download_tx: DownloadTx,
    fp_stats: Mutex<FalsePositiveStats>,

    block_queue: Mutex<VecDeque<Sha256dHash>>,
    block_queue_size: usize,

    /// the remote peer's chain height, as told by its pings and pongs
    height: AtomicU32,

    /// single-slot handoff to the stall detector
    stall_control: SyncSender<PeerMessage>,
}

impl SpvPeer {
    /// Wrap a connection in a new session and start its stall detector.
    pub fn new(
        conn: Arc<dyn PeerConnection>,
        handler: Box<dyn SpvMessageHandler>,
        config: &SpvConfig,
    ) -> Result<Arc<SpvPeer>, Error> {
        let (stall_control, stall_recv) = StallDetector::control_channel();
        let detector = StallDetector::new(
            conn.clone(),
            stall_recv,
            config.stall_tick_interval,
            config.stall_response_timeout,
        );

        let peer = SpvPeer {
            conn,
            handler,
            downloading: RwLock::new(Arc::new(DownloadBlock::new())),
            download_tx: DownloadTx::new(),
            fp_stats: Mutex::new(FalsePositiveStats::default()),
            block_queue: Mutex::new(VecDeque::with_capacity(config.block_queue_size)),
            block_queue_size: config.block_queue_size,
            height: AtomicU32::new(0),
            stall_control,
        };

        detector.spawn().map_err(Error::Io)?;
        debug!(
            "Started SPV session with {} ({})",
            peer.addr(),
            config.config_to_log_string()
        );
        Ok(Arc::new(peer))
    }

    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn disconnect(&self) {
        self.conn.disconnect()
    }

    /// Hand a message to the stall detector.  Blocks while the detector
    /// is still busy with the previous one.
    pub fn stall_message(&self, message: PeerMessage) -> Result<(), Error> {
        self.stall_control
            .send(message)
            .map_err(|_e| Error::StallDetectorClosed)
    }

    /// Send a message to the peer.  Requests that expect a reply are
    /// registered with the stall detector first.
    pub fn queue_message(
        &self,
        message: PeerMessage,
        done: Option<SyncSender<()>>,
    ) -> Result<(), Error> {
        match message {
            PeerMessage::GetBlocks(_) | PeerMessage::GetData(_) => {
                self.stall_message(message.clone())?;
            }
            _ => {}
        }
        trace!("Send {} to {}", message.command(), self.addr());
        self.conn.queue_message(message, done)
    }

    /// Ask for the block hashes following our locator
    pub fn send_getblocks(
        &self,
        locator_hashes: Vec<Sha256dHash>,
        stop_hash: Sha256dHash,
    ) -> Result<(), Error> {
        debug!(
            "Send GetBlocks with {} locator hashes to {}",
            locator_hashes.len(),
            self.addr()
        );
        let getblocks = GetBlocksMessage::new(locator_hashes, stop_hash);
        self.queue_message(PeerMessage::GetBlocks(getblocks), None)
    }

    /// Ask for filtered blocks; the peer answers with `merkleblock` messages
    pub fn send_getdata_blocks(&self, block_hashes: &[Sha256dHash]) -> Result<(), Error> {
        if block_hashes.is_empty() {
            return Ok(());
        }
        let invs = block_hashes
            .iter()
            .map(|h| Inventory::new(InvType::FilteredBlock, *h))
            .collect();
        debug!(
            "Send GetData {}-{} to {}",
            block_hashes[0],
            block_hashes[block_hashes.len() - 1],
            self.addr()
        );
        self.queue_message(PeerMessage::GetData(invs), None)
    }

    /// Ask for transactions, remembering each one in the download queue
    pub fn send_getdata_txs(&self, txids: &[Sha256dHash]) -> Result<(), Error> {
        if txids.is_empty() {
            return Ok(());
        }
        for txid in txids.iter() {
            self.download_tx.enqueue(*txid);
        }
        let invs = txids
            .iter()
            .map(|h| Inventory::new(InvType::Transaction, *h))
            .collect();
        self.queue_message(PeerMessage::GetData(invs), None)
    }

    /// Load a new bloom filter on the peer.  Any merkle block in progress was
    /// filtered with the old one, so downloading starts over.
    pub fn send_filterload(&self, filterload: FilterLoadMessage) -> Result<(), Error> {
        self.reset_downloading();
        self.queue_message(PeerMessage::FilterLoad(filterload), None)
    }

    pub fn send_ping(&self) -> Result<(), Error> {
        let nonce = u64::from(self.handler.local_height());
        self.queue_message(PeerMessage::Ping(nonce), None)
    }

    /// Route one inbound message.  Ping and pong only update the peer's
    /// height; everything else is shown to the stall detector and then
    /// passed to exactly one handler, if any handles its kind.
    pub fn handle_message(&self, message: PeerMessage) -> Result<(), Error> {
        match message {
            PeerMessage::Ping(nonce) => {
                self.height_from_nonce(nonce);
                let pong = PeerMessage::Pong(u64::from(self.handler.local_height()));
                return self.queue_message(pong, None);
            }
            PeerMessage::Pong(nonce) => {
                self.height_from_nonce(nonce);
                return Ok(());
            }
            _ => {}
        }

        if let Err(e) = self.stall_message(message.clone()) {
            debug!(
                "Could not notify stall handler for {} of {}: {}",
                self.addr(),
                message.command(),
                e
            );
        }

        let result = match message {
            PeerMessage::Inv(ref invs) => self.handler.on_inventory(self, invs),
            PeerMessage::MerkleBlock(ref merkle_block) => {
                self.handler.on_merkle_block(self, merkle_block)
            }
            PeerMessage::Tx(ref tx) => self.handler.on_tx(self, tx),
            PeerMessage::NotFound(ref invs) => self.handler.on_not_found(self, invs),
            PeerMessage::Reject(ref reject) => self.handler.on_reject(self, reject),
            PeerMessage::Version(_)
            | PeerMessage::Verack
            | PeerMessage::Ping(_)
            | PeerMessage::Pong(_)
            | PeerMessage::GetData(_)
            | PeerMessage::GetBlocks(_)
            | PeerMessage::FilterLoad(_)
            | PeerMessage::MemPool => {
                trace!("Ignore {} from {}", message.command(), self.addr());
                Ok(())
            }
        };

        if let Err(ref e) = result {
            warn!(
                "Failed to handle {} from {}: {}",
                message.command(),
                self.addr(),
                e
            );
        }
        result
    }

    /// The merkle block being downloaded right now
    pub fn downloading(&self) -> Arc<DownloadBlock> {
        self.downloading
            .read()
            .expect("FATAL: downloading lock poisoned")
            .clone()
    }

    /// Start tracking a newly-received merkle block, replacing the current one
    pub fn set_downloading(&self, block: DownloadBlock) -> Arc<DownloadBlock> {
        let block = Arc::new(block);
        *self
            .downloading
            .write()
            .expect("FATAL: downloading lock poisoned") = block.clone();
        block
    }

    /// Throw away the merkle block in progress
    pub fn reset_downloading(&self) {
        self.set_downloading(DownloadBlock::new());
    }

    pub fn download_tx(&self) -> &DownloadTx {
        &self.download_tx
    }

    /// Count a received filtered transaction, and whether it turned out not
    /// to be ours.
    pub fn record_tx(&self, false_positive: bool) {
        let mut stats = self.fp_stats.lock().expect("FATAL: fp stats mutex poisoned");
        stats.received_txs = stats.received_txs.saturating_add(1);
        if false_positive {
            stats.false_positives = stats.false_positives.saturating_add(1);
        }
    }

    /// Fraction of received transactions that were bloom filter false
    /// positives, or None if nothing was received yet.
    pub fn false_positive_rate(&self) -> Option<f32> {
        let stats = self.fp_stats.lock().expect("FATAL: fp stats mutex poisoned");
        if stats.received_txs == 0 {
            return None;
        }
        Some(stats.false_positives as f32 / stats.received_txs as f32)
    }

    /// (received, false positives)
    pub fn false_positive_counts(&self) -> (u32, u32) {
        let stats = self.fp_stats.lock().expect("FATAL: fp stats mutex poisoned");
        (stats.received_txs, stats.false_positives)
    }

    pub fn reset_false_positives(&self) {
        let mut stats = self.fp_stats.lock().expect("FATAL: fp stats mutex poisoned");
        *stats = FalsePositiveStats::default();
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Ping and pong nonces carry a height.  Anything wider than a height is
    /// some other client's random nonce, and is ignored.
    fn height_from_nonce(&self, nonce: u64) {
        match u32::try_from(nonce) {
            Ok(height) => self.set_height(height),
            Err(_) => debug!("Ignore non-height nonce {} from {}", nonce, self.addr()),
        }
    }

    /// Remember an announced block hash until we request it
    pub fn queue_block(&self, block_hash: Sha256dHash) -> Result<(), Error> {
        let mut queue = self
            .block_queue
            .lock()
            .expect("FATAL: block queue mutex poisoned");
        if queue.len() >= self.block_queue_size {
            return Err(Error::BlockQueueFull);
        }
        queue.push_back(block_hash);
        Ok(())
    }

    pub fn next_queued_block(&self) -> Option<Sha256dHash> {
        self.block_queue
            .lock()
            .expect("FATAL: block queue mutex poisoned")
            .pop_front()
    }

    pub fn queued_blocks(&self) -> usize {
        self.block_queue
            .lock()
            .expect("FATAL: block queue mutex poisoned")
            .len()
    }
}
