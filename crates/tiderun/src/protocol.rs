//! # Protocol Descriptions
//!
//! The runtime is schema-driven: a protocol is a set of `Method`s and
//! `Event`s, each naming its ordinal and the struct types of its payloads.
//!
//! Ordinals are derived from a method's fully qualified selector,
//! `library/Protocol.Method`, unless one is given explicitly.

use std::sync::Arc;

use sha2::Digest;
use sha2::Sha256;
use tidepack::StructType;
use tiderpc::EPITAPH_ORDINAL;

use crate::error::UsageError;

const ORDINAL_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Derives a method ordinal from its selector: the first eight bytes of the
/// selector's SHA-256, read little-endian, with the top bit cleared.
pub fn ordinal_of(selector: &str) -> u64 {
    let digest = Sha256::digest(selector.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head) & ORDINAL_MASK
}

/// Fails for the ordinal epitaphs use, which no method or event may take.
pub(crate) fn check_ordinal(ordinal: u64) -> Result<(), UsageError> {
    if ordinal == EPITAPH_ORDINAL {
        return Err(UsageError::ReservedOrdinal(ordinal));
    }
    Ok(())
}

/// A request a client can send. Two-way methods carry a response type.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub ordinal: u64,
    pub request: Arc<StructType>,
    pub response: Option<Arc<StructType>>,
}

impl Method {
    pub fn two_way(
        selector: &str,
        request: impl Into<Arc<StructType>>,
        response: impl Into<Arc<StructType>>,
    ) -> Self {
        Self {
            name: selector.to_string(),
            ordinal: ordinal_of(selector),
            request: request.into(),
            response: Some(response.into()),
        }
    }

    pub fn one_way(selector: &str, request: impl Into<Arc<StructType>>) -> Self {
        Self {
            name: selector.to_string(),
            ordinal: ordinal_of(selector),
            request: request.into(),
            response: None,
        }
    }

    /// Overrides the derived ordinal. `EPITAPH_ORDINAL` is reserved, and
    /// bindings refuse methods that carry it.
    pub fn with_ordinal(mut self, ordinal: u64) -> Self {
        debug_assert_ne!(ordinal, EPITAPH_ORDINAL, "method ordinal collides with epitaphs");
        self.ordinal = ordinal;
        self
    }

    pub fn is_two_way(&self) -> bool {
        self.response.is_some()
    }
}

/// A message a server sends unprompted, with txid 0.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub ordinal: u64,
    pub payload: Arc<StructType>,
}

impl Event {
    pub fn new(selector: &str, payload: impl Into<Arc<StructType>>) -> Self {
        Self {
            name: selector.to_string(),
            ordinal: ordinal_of(selector),
            payload: payload.into(),
        }
    }

    pub fn with_ordinal(mut self, ordinal: u64) -> Self {
        debug_assert_ne!(ordinal, EPITAPH_ORDINAL, "event ordinal collides with epitaphs");
        self.ordinal = ordinal;
        self
    }
}
