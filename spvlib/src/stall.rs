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

//! Stall detection
//!
//! Every request that expects a reply is recorded as a pending response, and
//! every reply clears its entry.  A periodic tick disconnects the peer if
//! anything is still pending and no traffic at all has been seen for the
//! response timeout.  The clock is activity-based: any traffic refreshes the
//! deadline of every pending response.

use std::collections::HashSet;
use std::io;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spv_common::util::hash::Sha256dHash;

use crate::messages::{BitcoinHash, PeerMessage};
use crate::peer::PeerConnection;

/// Interval between checks for stalled peers
pub const STALL_TICK_INTERVAL: Duration = Duration::from_secs(15);

/// How long we wait, after the last observed traffic, for outstanding
/// responses before disconnecting the peer.  Only checked on each tick.
pub const STALL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A response we are waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedResponse {
    /// An `inv` reply to a `getblocks`
    Inventory,
    /// A `merkleblock` or `tx` with this hash
    Data(Sha256dHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    Continue,
    Disconnect,
}

/// The detector's bookkeeping.  Time is passed in so the decisions can be
/// exercised without a running thread.
#[derive(Debug)]
pub struct StallState {
    pending_responses: HashSet<ExpectedResponse>,
    last_active: Option<Instant>,
    response_timeout: Duration,
}

impl StallState {
    pub fn new(response_timeout: Duration) -> StallState {
        StallState {
            pending_responses: HashSet::new(),
            last_active: None,
            response_timeout,
        }
    }

    /// Account for one message we sent or received at `now`.
    pub fn observe(&mut self, message: &PeerMessage, now: Instant) -> StallAction {
        self.last_active = Some(now);

        match message {
            PeerMessage::GetBlocks(_) => {
                self.pending_responses.insert(ExpectedResponse::Inventory);
            }
            PeerMessage::Inv(_) => {
                self.pending_responses.remove(&ExpectedResponse::Inventory);
            }
            PeerMessage::GetData(invs) => {
                for inv in invs.iter() {
                    self.pending_responses
                        .insert(ExpectedResponse::Data(inv.hash));
                }
            }
            PeerMessage::MerkleBlock(merkle_block) => {
                // keyed on what arrived, not on what was asked for
                self.pending_responses
                    .remove(&ExpectedResponse::Data(merkle_block.header.bitcoin_hash()));
            }
            PeerMessage::Tx(tx) => {
                self.pending_responses
                    .remove(&ExpectedResponse::Data(tx.bitcoin_hash()));
            }
            PeerMessage::NotFound(_) => {
                // a sync peer must have everything it announced
                return StallAction::Disconnect;
            }
            _ => {}
        }
        StallAction::Continue
    }

    /// Periodic check
    pub fn check(&self, now: Instant) -> StallAction {
        if self.pending_responses.is_empty() {
            return StallAction::Continue;
        }
        let last_active = match self.last_active {
            Some(t) => t,
            None => return StallAction::Continue,
        };
        if now < last_active + self.response_timeout {
            return StallAction::Continue;
        }
        StallAction::Disconnect
    }

    pub fn is_pending(&self, expected: &ExpectedResponse) -> bool {
        self.pending_responses.contains(expected)
    }

    pub fn num_pending(&self) -> usize {
        self.pending_responses.len()
    }

    pub fn last_active(&self) -> Option<Instant> {
        self.last_active
    }
}

/// Background watchdog for one peer session.  Runs until the connection
/// reports it is no longer connected, or until the session goes away.
pub struct StallDetector {
    state: StallState,
    tick_interval: Duration,
    control: Receiver<PeerMessage>,
    conn: Arc<dyn PeerConnection>,
}

impl StallDetector {
    pub fn new(
        conn: Arc<dyn PeerConnection>,
        control: Receiver<PeerMessage>,
        tick_interval: Duration,
        response_timeout: Duration,
    ) -> StallDetector {
        StallDetector {
            state: StallState::new(response_timeout),
            tick_interval,
            control,
            conn,
        }
    }

    /// The session's single-slot handoff to its detector.  A send blocks
    /// until the previous message has been taken off the channel.
    pub fn control_channel() -> (SyncSender<PeerMessage>, Receiver<PeerMessage>) {
        sync_channel(1)
    }

    pub fn spawn(self) -> Result<thread::JoinHandle<()>, io::Error> {
        thread::Builder::new()
            .name(format!("stall-handler:{}", self.conn.addr()))
            .spawn(move || self.run())
    }

    fn disconnect(&self, reason: &str) {
        warn!(
            "Peer {} appears to be stalled or misbehaving, {} -- disconnecting",
            self.conn.addr(),
            reason;
            "pending_responses" => self.state.num_pending()
        );
        self.conn.disconnect();
    }

    pub fn run(mut self) {
        let mut next_tick = Instant::now() + self.tick_interval;

        while self.conn.is_connected() {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.control.recv_timeout(wait) {
                Ok(message) => {
                    trace!(
                        "Stall handler for {} saw {}",
                        self.conn.addr(),
                        message.command()
                    );
                    if self.state.observe(&message, Instant::now()) == StallAction::Disconnect {
                        self.disconnect("unexpected notfound from sync peer");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    next_tick = next_tick.max(now) + self.tick_interval;
                    if self.state.check(now) == StallAction::Disconnect {
                        self.disconnect("response timeout");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Peer session for {} went away", self.conn.addr());
                    break;
                }
            }
        }

        // Drain anything still queued so no sender is left waiting on us.
        while self.control.try_recv().is_ok() {}
        trace!("Peer stall handler done for {}", self.conn.addr());
    }
}
