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

//! Peer-level synchronization engine for an SPV client.
//!
//! A [`peer::SpvPeer`] wraps one connection to a full node. It forwards
//! block and transaction requests, routes inbound protocol messages to a
//! caller-supplied [`peer::SpvMessageHandler`], tracks which merkle block
//! transactions are still outstanding, and runs a stall detector thread that
//! disconnects a peer which stops answering.

#![cfg_attr(test, allow(unused_variables, unused_assignments))]

#[allow(unused_imports)]
#[macro_use(o, slog_log, slog_trace, slog_debug, slog_info, slog_warn, slog_error)]
extern crate slog;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate spv_common;

use std::{error, fmt, io};

pub mod config;
pub mod download;
pub mod messages;
pub mod peer;
pub mod stall;

pub use crate::config::ConfigError;

#[derive(Debug)]
pub enum Error {
    /// The connection to the remote peer is gone
    ConnectionBroken,
    /// The stall detector thread has exited, so traffic can't be reported to it
    StallDetectorClosed,
    /// The queue of block hashes waiting to be requested is full
    BlockQueueFull,
    /// A merkle block's partial merkle tree is malformed or doesn't match its header
    InvalidMerkleBlock(String),
    /// A registered message handler failed
    Handler(String),
    /// Configuration error
    Config(ConfigError),
    /// I/O error, e.g. while spawning the stall detector thread
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ConnectionBroken => write!(f, "Connection to peer is broken"),
            Error::StallDetectorClosed => write!(f, "Stall detector has shut down"),
            Error::BlockQueueFull => write!(f, "Block download queue is full"),
            Error::InvalidMerkleBlock(ref s) => write!(f, "Invalid merkle block: {}", s),
            Error::Handler(ref s) => write!(f, "Message handler failed: {}", s),
            Error::Config(ref e) => fmt::Display::fmt(e, f),
            Error::Io(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Config(ref e) => Some(e),
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}
