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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spv_common::util::hash::Sha256dHash;
use spvlib::config::SpvConfig;
use spvlib::download::DownloadBlock;
use spvlib::messages::{
    BitcoinHash, BlockHeader, InvType, Inventory, MerkleBlockMessage, PeerMessage,
    RejectMessage, Transaction,
};
use spvlib::peer::{PeerConnection, SpvMessageHandler, SpvPeer};
use spvlib::Error;

struct TestConnection {
    connected: AtomicBool,
    disconnects: AtomicUsize,
    sent: Mutex<Vec<PeerMessage>>,
}

impl TestConnection {
    fn new() -> Arc<TestConnection> {
        Arc::new(TestConnection {
            connected: AtomicBool::new(true),
            disconnects: AtomicUsize::new(0),
            sent: Mutex::new(vec![]),
        })
    }

    fn sent(&self) -> Vec<PeerMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl PeerConnection for TestConnection {
    fn queue_message(
        &self,
        message: PeerMessage,
        done: Option<SyncSender<()>>,
    ) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::ConnectionBroken);
        }
        self.sent.lock().unwrap().push(message);
        if let Some(done) = done {
            let _ = done.send(());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn addr(&self) -> SocketAddr {
        "127.0.0.1:20866".parse().unwrap()
    }
}

/// Records every callback, and does what a wallet's sync logic would do with
/// merkle blocks and their transactions.
#[derive(Default)]
struct SyncHandler {
    calls: Mutex<Vec<&'static str>>,
    completed: Mutex<Vec<(Sha256dHash, usize)>>,
}

impl SyncHandler {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn completed(&self) -> Vec<(Sha256dHash, usize)> {
        self.completed.lock().unwrap().clone()
    }
}

impl SpvMessageHandler for SyncHandler {
    fn local_height(&self) -> u32 {
        77
    }

    fn on_inventory(&self, _peer: &SpvPeer, _invs: &[Inventory]) -> Result<(), Error> {
        self.calls.lock().unwrap().push("inv");
        Ok(())
    }

    fn on_merkle_block(
        &self,
        peer: &SpvPeer,
        merkle_block: &MerkleBlockMessage,
    ) -> Result<(), Error> {
        self.calls.lock().unwrap().push("merkleblock");
        let block = peer.set_downloading(DownloadBlock::from_merkle_block(merkle_block.clone())?);
        let txids = merkle_block.validated_matches()?;
        peer.send_getdata_txs(&txids)?;
        if let Some((mb, txs)) = block.take_block() {
            self.completed
                .lock()
                .unwrap()
                .push((mb.header.bitcoin_hash(), txs.len()));
        }
        Ok(())
    }

    fn on_tx(&self, peer: &SpvPeer, tx: &Transaction) -> Result<(), Error> {
        self.calls.lock().unwrap().push("tx");
        let txid = tx.txid();
        if !peer.download_tx().dequeue(&txid) {
            peer.record_tx(true);
            return Ok(());
        }
        peer.record_tx(false);
        let block = peer.downloading();
        if block.dequeue_tx(&txid) {
            block.push_tx(tx.clone());
        }
        if let Some((mb, txs)) = block.take_block() {
            self.completed
                .lock()
                .unwrap()
                .push((mb.header.bitcoin_hash(), txs.len()));
        }
        Ok(())
    }

    fn on_not_found(&self, _peer: &SpvPeer, _invs: &[Inventory]) -> Result<(), Error> {
        self.calls.lock().unwrap().push("notfound");
        Ok(())
    }

    fn on_reject(&self, _peer: &SpvPeer, reject: &RejectMessage) -> Result<(), Error> {
        self.calls.lock().unwrap().push("reject");
        Err(Error::Handler(format!("rejected: {}", reject.reason)))
    }
}

fn fast_config() -> SpvConfig {
    SpvConfig {
        stall_tick_interval: Duration::from_millis(20),
        stall_response_timeout: Duration::from_millis(100),
        ..SpvConfig::default()
    }
}

fn make_session(config: &SpvConfig) -> (Arc<TestConnection>, Arc<SyncHandler>, Arc<SpvPeer>) {
    let conn = TestConnection::new();
    let handler = Arc::new(SyncHandler::default());
    let peer = SpvPeer::new(conn.clone(), Box::new(handler.clone()), config).unwrap();
    (conn, handler, peer)
}

fn wait_for_disconnect(conn: &TestConnection, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !conn.is_connected() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    !conn.is_connected()
}

/// A merkle block over a single transaction that matched our filter
fn single_tx_block(tx: &Transaction, nonce: u32) -> MerkleBlockMessage {
    let txid = tx.txid();
    MerkleBlockMessage {
        header: BlockHeader {
            version: 1,
            prev_blockhash: Sha256dHash([0u8; 32]),
            merkle_root: txid,
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce,
        },
        total_transactions: 1,
        hashes: vec![txid],
        flags: vec![0x01],
    }
}

#[test]
fn test_dispatch_fires_exactly_one_handler() {
    let (conn, handler, peer) = make_session(&SpvConfig::default());

    peer.handle_message(PeerMessage::Inv(vec![])).unwrap();
    peer.handle_message(PeerMessage::Verack).unwrap();
    peer.handle_message(PeerMessage::MemPool).unwrap();
    peer.handle_message(PeerMessage::Tx(Transaction::new(vec![1])))
        .unwrap();
    assert_eq!(handler.calls(), vec!["inv", "tx"]);

    // a failing handler hands its error back, and the session keeps going
    let reject = RejectMessage {
        message: "tx".to_string(),
        ccode: 0x10,
        reason: "bad-txns".to_string(),
        hash: None,
    };
    match peer.handle_message(PeerMessage::Reject(reject)) {
        Err(Error::Handler(msg)) => assert!(msg.contains("bad-txns")),
        x => panic!("expected handler error, got {:?}", x),
    }
    peer.handle_message(PeerMessage::Inv(vec![])).unwrap();
    assert_eq!(handler.calls(), vec!["inv", "tx", "reject", "inv"]);

    // unsolicited tx counted as a false positive
    assert_eq!(peer.false_positive_counts(), (1, 1));
    assert!(conn.is_connected());
    peer.disconnect();
}

#[test]
fn test_ping_pong_track_height() {
    let (conn, handler, peer) = make_session(&SpvConfig::default());

    peer.handle_message(PeerMessage::Ping(1234)).unwrap();
    assert_eq!(peer.height(), 1234);
    assert_eq!(conn.sent(), vec![PeerMessage::Pong(77)]);

    peer.handle_message(PeerMessage::Pong(1300)).unwrap();
    assert_eq!(peer.height(), 1300);

    // a nonce too wide to be a height leaves the height alone, but is answered
    peer.handle_message(PeerMessage::Ping(u64::from(u32::MAX) + 1))
        .unwrap();
    assert_eq!(peer.height(), 1300);
    assert_eq!(conn.sent().last(), Some(&PeerMessage::Pong(77)));

    peer.send_ping().unwrap();
    assert_eq!(conn.sent().last(), Some(&PeerMessage::Ping(77)));
    assert!(handler.calls().is_empty());
    peer.disconnect();
}

#[test]
fn test_done_signal_is_forwarded() {
    let (conn, _handler, peer) = make_session(&SpvConfig::default());
    let (done_tx, done_rx) = sync_channel(1);
    peer.queue_message(PeerMessage::MemPool, Some(done_tx))
        .unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(conn.sent(), vec![PeerMessage::MemPool]);
    peer.disconnect();
}

#[test]
fn test_unanswered_getblocks_stalls() {
    let (conn, _handler, peer) = make_session(&fast_config());
    peer.send_getblocks(vec![Sha256dHash([1u8; 32])], Sha256dHash([0u8; 32]))
        .unwrap();
    assert!(wait_for_disconnect(&conn, Duration::from_secs(5)));
    assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_answered_getblocks_does_not_stall() {
    let (conn, handler, peer) = make_session(&fast_config());
    peer.send_getblocks(vec![Sha256dHash([1u8; 32])], Sha256dHash([0u8; 32]))
        .unwrap();
    peer.handle_message(PeerMessage::Inv(vec![])).unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(conn.is_connected());
    assert_eq!(handler.calls(), vec!["inv"]);
    peer.disconnect();
}

#[test]
fn test_notfound_disconnects_sync_peer() {
    let (conn, handler, peer) = make_session(&SpvConfig::default());
    let inv = Inventory::new(InvType::FilteredBlock, Sha256dHash([9u8; 32]));
    peer.handle_message(PeerMessage::NotFound(vec![inv])).unwrap();
    assert_eq!(handler.calls(), vec!["notfound"]);

    // no tick needed: the default tick is 15 seconds
    assert!(wait_for_disconnect(&conn, Duration::from_secs(5)));
}

#[test]
fn test_missing_merkle_block_stalls() {
    let (conn, handler, peer) = make_session(&fast_config());

    peer.send_getblocks(vec![Sha256dHash([1u8; 32])], Sha256dHash([0u8; 32]))
        .unwrap();
    let txs: Vec<Transaction> = (0..3u8).map(|i| Transaction::new(vec![i; 16])).collect();
    let blocks: Vec<MerkleBlockMessage> = txs
        .iter()
        .enumerate()
        .map(|(i, tx)| single_tx_block(tx, i as u32))
        .collect();
    let hashes: Vec<Sha256dHash> = blocks.iter().map(|b| b.header.bitcoin_hash()).collect();
    let invs = hashes
        .iter()
        .map(|h| Inventory::new(InvType::Block, *h))
        .collect();
    peer.handle_message(PeerMessage::Inv(invs)).unwrap();

    peer.send_getdata_blocks(&hashes).unwrap();
    // blocks 1 and 3 arrive along with their transactions; block 2 never does
    for i in [0usize, 2] {
        peer.handle_message(PeerMessage::MerkleBlock(blocks[i].clone()))
            .unwrap();
        peer.handle_message(PeerMessage::Tx(txs[i].clone())).unwrap();
    }
    assert_eq!(
        handler.completed(),
        vec![(hashes[0], 1), (hashes[2], 1)]
    );

    assert!(wait_for_disconnect(&conn, Duration::from_secs(5)));
}

#[test]
fn test_full_block_download() {
    let (conn, handler, peer) = make_session(&fast_config());

    let ours = Transaction::new(vec![0x42; 32]);
    let block = single_tx_block(&ours, 5);
    let block_hash = block.header.bitcoin_hash();

    peer.send_getdata_blocks(&[block_hash]).unwrap();
    peer.handle_message(PeerMessage::MerkleBlock(block)).unwrap();
    assert_eq!(peer.downloading().block_hash(), Some(block_hash));
    assert!(!peer.downloading().finished());
    assert!(peer.download_tx().contains(&ours.txid()));

    peer.handle_message(PeerMessage::Tx(ours.clone())).unwrap();
    assert!(peer.downloading().finished());
    assert!(peer.download_tx().is_empty());
    assert_eq!(handler.completed(), vec![(block_hash, 1)]);
    assert_eq!(peer.false_positive_rate(), Some(0.0));

    // a new bloom filter restarts the download
    peer.send_filterload(spvlib::messages::FilterLoadMessage {
        filter: vec![0xff; 8],
        hash_funcs: 3,
        tweak: 0,
        flags: 0,
    })
    .unwrap();
    assert_eq!(peer.downloading().block_hash(), None);

    // everything requested was answered
    thread::sleep(Duration::from_millis(400));
    assert!(conn.is_connected());
    peer.disconnect();
}
