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

use std::fmt;
use std::fmt::Write;

use sha2::{Digest, Sha256};

use crate::util::HexError;

/// A Bitcoin hash, 32-bytes, computed from x as SHA256(SHA256(x))
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha256dHash(pub [u8; 32]);
impl_byte_array_newtype!(Sha256dHash, u8, 32);
impl_array_hexstring_fmt!(Sha256dHash);

impl Sha256dHash {
    /// Create a hash by hashing some data
    pub fn from_data(data: &[u8]) -> Sha256dHash {
        let mut ret = [0u8; 32];
        let mut sha2 = Sha256::new();
        let mut sha2_2 = Sha256::new();
        sha2.update(data);
        ret.copy_from_slice(sha2.finalize().as_slice());
        sha2_2.update(ret);
        ret.copy_from_slice(sha2_2.finalize().as_slice());
        Sha256dHash(ret)
    }

    /// Hash two child nodes of a merkle tree into their parent
    pub fn from_node_hashes(left: &Sha256dHash, right: &Sha256dHash) -> Sha256dHash {
        let mut buf = [0u8; 64];
        buf[0..32].copy_from_slice(&left.0);
        buf[32..64].copy_from_slice(&right.0);
        Sha256dHash::from_data(&buf)
    }

    /// Human-readable hex output, in the byte order block explorers use
    pub fn be_hex_string(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        to_hex(&bytes)
    }

    /// Parse a hash printed by `be_hex_string`
    pub fn from_be_hex(hex_str: &str) -> Result<Sha256dHash, HexError> {
        let mut ret = Sha256dHash::from_hex(hex_str)?;
        ret.0.reverse();
        Ok(ret)
    }
}

impl fmt::Display for Sha256dHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.be_hex_string())
    }
}

/// Decode a hex string into bytes.
pub fn hex_bytes(s: &str) -> Result<Vec<u8>, HexError> {
    if s.len() % 2 != 0 {
        return Err(HexError::BadLength(s.len()));
    }
    let mut v = Vec::with_capacity(s.len() / 2);
    let chars: Vec<char> = s.chars().collect();
    for pair in chars.chunks(2) {
        match (pair[0].to_digit(16), pair[1].to_digit(16)) {
            (None, _) => return Err(HexError::BadCharacter(pair[0])),
            (_, None) => return Err(HexError::BadCharacter(pair[1])),
            (Some(hi), Some(lo)) => v.push((hi * 0x10 + lo) as u8),
        }
    }
    Ok(v)
}

/// Convert a slice of u8 to a hex string
pub fn to_hex(s: &[u8]) -> String {
    let mut r = String::with_capacity(s.len() * 2);
    for b in s.iter() {
        write!(r, "{:02x}", b).unwrap();
    }
    r
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_roundtrip_rejects_garbage() {
        assert_eq!(hex_bytes("00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert_eq!(hex_bytes("0"), Err(HexError::BadLength(1)));
        assert_eq!(hex_bytes("0g"), Err(HexError::BadCharacter('g')));
        assert_eq!(to_hex(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn test_sha256d_empty_string() {
        // sha256d("") is a well-known constant
        let h = Sha256dHash::from_data(&[]);
        assert_eq!(
            h.to_hex(),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_be_hex_is_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        let h = Sha256dHash(bytes);
        let be = h.be_hex_string();
        assert!(be.ends_with("01"));
        assert!(be.starts_with("00"));
        assert_eq!(Sha256dHash::from_be_hex(&be).unwrap(), h);
        assert_eq!(format!("{}", h), be);
    }

    #[test]
    fn test_from_bytes_length() {
        assert!(Sha256dHash::from_bytes(&[0u8; 31]).is_none());
        assert_eq!(
            Sha256dHash::from_bytes(&[7u8; 32]).unwrap(),
            Sha256dHash([7u8; 32])
        );
    }
}
