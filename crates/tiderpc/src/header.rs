//! # Message Headers
//!
//! Every transactional message starts with a 16-byte header:
//!
//! ```text
//! 0      4        7       8          16
//! | txid | flags  | magic | ordinal  |
//! | u32  | [u8;3] | u8    | u64      |
//! ```
//!
//! A txid of zero marks a message that expects no reply (one-way requests and
//! events). The reserved ordinal `EPITAPH_ORDINAL` marks an epitaph.
//!
//! Persistent data uses a header of the same size that keeps only the flags
//! and magic number; every other byte is zero.

use crate::error::Error;
use crate::error::Result;

pub const HEADER_SIZE: usize = 16;

/// The only wire format revision this library reads or writes.
pub const MAGIC_NUMBER_INITIAL: u8 = 1;

/// Ordinal reserved for epitaph messages.
pub const EPITAPH_ORDINAL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    pub txid: u32,
    pub flags: [u8; 3],
    pub magic_number: u8,
    pub ordinal: u64,
}

impl TransactionHeader {
    pub fn new(txid: u32, ordinal: u64) -> Self {
        Self { txid, flags: [0; 3], magic_number: MAGIC_NUMBER_INITIAL, ordinal }
    }

    pub fn epitaph() -> Self {
        Self::new(0, EPITAPH_ORDINAL)
    }

    pub fn is_epitaph(&self) -> bool {
        self.ordinal == EPITAPH_ORDINAL
    }

    pub fn is_compatible(&self) -> bool {
        self.magic_number == MAGIC_NUMBER_INITIAL
    }

    /// Checks the magic number, returning `IncompatibleMagic` otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.is_compatible() {
            Ok(())
        } else {
            Err(Error::IncompatibleMagic(self.magic_number))
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.txid.to_le_bytes());
        out[4..7].copy_from_slice(&self.flags);
        out[7] = self.magic_number;
        out[8..16].copy_from_slice(&self.ordinal.to_le_bytes());
        out
    }

    /// Splits `bytes` into a header and the body that follows it.
    /// The magic number is not checked; see `validate`.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TooShort(bytes.len()));
        }
        let (head, body) = bytes.split_at(HEADER_SIZE);
        let mut txid = [0u8; 4];
        txid.copy_from_slice(&head[0..4]);
        let mut flags = [0u8; 3];
        flags.copy_from_slice(&head[4..7]);
        let mut ordinal = [0u8; 8];
        ordinal.copy_from_slice(&head[8..16]);

        let header = Self {
            txid: u32::from_le_bytes(txid),
            flags,
            magic_number: head[7],
            ordinal: u64::from_le_bytes(ordinal),
        };
        Ok((header, body))
    }
}

/// Header for data encoded at rest, outside any transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentHeader {
    pub flags: [u8; 3],
    pub magic_number: u8,
}

impl PersistentHeader {
    pub fn new() -> Self {
        Self { flags: [0; 3], magic_number: MAGIC_NUMBER_INITIAL }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[4..7].copy_from_slice(&self.flags);
        out[7] = self.magic_number;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TooShort(bytes.len()));
        }
        let (head, body) = bytes.split_at(HEADER_SIZE);
        if head[0..4].iter().chain(&head[8..16]).any(|b| *b != 0) {
            return Err(Error::InvalidPersistentHeader);
        }
        if head[7] != MAGIC_NUMBER_INITIAL {
            return Err(Error::IncompatibleMagic(head[7]));
        }
        let mut flags = [0u8; 3];
        flags.copy_from_slice(&head[4..7]);
        Ok((Self { flags, magic_number: head[7] }, body))
    }
}

impl Default for PersistentHeader {
    fn default() -> Self {
        Self::new()
    }
}
