//! # Transaction Table
//!
//! The client's record of two-way calls awaiting a reply.
//!
//! ## Invariants
//!
//! - Txids are nonzero and unique among pending transactions and among
//!   cancelled transactions whose reply has not arrived yet.
//! - Each entry's responder runs exactly once: on reply, on cancellation, or
//!   when the table closes. Responders always run after the table lock is
//!   released.
//! - Once closed, the table accepts no new entries.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tidepack::StructType;
use tidepack::Value;

use crate::error::Result;
use crate::error::UsageError;

/// A transaction id, unique among the calls outstanding on one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Txid(pub u32);

impl std::fmt::Display for Txid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Responder = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// A call awaiting its reply.
pub struct Pending {
    pub ordinal: u64,
    pub response: Arc<StructType>,
    responder: Responder,
}

impl Pending {
    pub fn new(ordinal: u64, response: Arc<StructType>, responder: Responder) -> Self {
        Self { ordinal, response, responder }
    }

    pub fn complete(self, result: Result<Value>) {
        (self.responder)(result)
    }
}

/// Outcome of matching an incoming reply against the table.
pub enum Lookup {
    Pending(Pending),
    /// The call was cancelled; its late reply is dropped.
    Cancelled,
    Unknown,
}

pub struct TransactionTable {
    open: bool,
    next_txid: u32,
    max_pending: Option<usize>,
    pending: HashMap<u32, Pending>,
    cancelled: HashSet<u32>,
}

impl TransactionTable {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            open: true,
            next_txid: 1,
            max_pending,
            pending: HashMap::new(),
            cancelled: HashSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, txid: Txid) -> bool {
        self.pending.contains_key(&txid.0)
    }

    /// Picks the txid the next `insert` should use. Nothing is recorded
    /// until `insert`, so a failed encode in between leaves no trace.
    pub fn reserve(&mut self) -> std::result::Result<Txid, UsageError> {
        if !self.open {
            return Err(UsageError::Closed);
        }
        if let Some(limit) = self.max_pending {
            if self.pending.len() >= limit {
                return Err(UsageError::TooManyPending(limit));
            }
        }
        let in_use = self.pending.len() + self.cancelled.len();
        if in_use >= u32::MAX as usize - 1 {
            return Err(UsageError::TooManyPending(in_use));
        }
        loop {
            let candidate = self.next_txid;
            self.next_txid = match self.next_txid.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.pending.contains_key(&candidate) && !self.cancelled.contains(&candidate) {
                return Ok(Txid(candidate));
            }
        }
    }

    pub fn insert(&mut self, txid: Txid, pending: Pending) {
        debug_assert!(self.open);
        self.pending.insert(txid.0, pending);
    }

    /// Removes the transaction a reply with `txid` belongs to.
    pub fn take(&mut self, txid: u32) -> Lookup {
        if let Some(pending) = self.pending.remove(&txid) {
            return Lookup::Pending(pending);
        }
        if self.cancelled.remove(&txid) {
            return Lookup::Cancelled;
        }
        Lookup::Unknown
    }

    /// Removes a pending transaction without recording it as cancelled.
    pub fn remove(&mut self, txid: Txid) -> Option<Pending> {
        self.pending.remove(&txid.0)
    }

    /// Cancels a pending transaction. Its txid stays reserved until the
    /// late reply arrives or the table closes.
    pub fn cancel(&mut self, txid: Txid) -> Option<Pending> {
        let pending = self.pending.remove(&txid.0)?;
        self.cancelled.insert(txid.0);
        Some(pending)
    }

    /// Closes the table and hands back every pending transaction.
    pub fn close(&mut self) -> Vec<Pending> {
        self.open = false;
        self.cancelled.clear();
        self.pending.drain().map(|(_, pending)| pending).collect()
    }
}
