//! # Error Definitions
//!
//! Failures a binding reports to its caller. Encode and usage errors are
//! local and leave the binding untouched; the rest describe why a
//! transaction or a whole channel ended.

use tiderpc::Status;

use crate::channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The outgoing value did not match its schema. Nothing was sent.
    Encode(tiderpc::Error),
    /// An incoming message failed to decode.
    Decode(tiderpc::Error),
    Channel(channel::Error),
    /// The peer closed the channel without an epitaph.
    PeerClosed,
    /// The peer closed the channel with this epitaph.
    ClientChannelClosed { status: Status },
    /// The transaction was cancelled locally, or the binding closed under it.
    Canceled,
    TimedOut,
    /// A reply arrived for a transaction that was never issued.
    UnexpectedTransactionId(u32),
    /// A request named an ordinal the server has no handler for.
    UnknownOrdinal(u64),
    Usage(UsageError),
}

/// Misuse of the binding API. Reported immediately; no state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    AlreadyCompleted,
    ReplyOnOneWay,
    /// `call` on a one-way method.
    NotTwoWay,
    /// `send_one_way` on a two-way method.
    NotOneWay,
    TooManyPending(usize),
    /// The ordinal is the one epitaphs use.
    ReservedOrdinal(u64),
    /// The binding was closed locally.
    Closed,
    /// The binding gave its channel back with `unbind`.
    Unbound,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {}", e),
            Self::Decode(e) => write!(f, "Decode error: {}", e),
            Self::Channel(e) => write!(f, "Channel error: {}", e),
            Self::PeerClosed => write!(f, "Peer closed the channel"),
            Self::ClientChannelClosed { status } => write!(f, "Channel closed with epitaph {}", status),
            Self::Canceled => write!(f, "Transaction canceled"),
            Self::TimedOut => write!(f, "Transaction timed out"),
            Self::UnexpectedTransactionId(txid) => write!(f, "Unexpected transaction id {}", txid),
            Self::UnknownOrdinal(ordinal) => write!(f, "Unknown ordinal {:#x}", ordinal),
            Self::Usage(e) => write!(f, "Usage error: {}", e),
        }
    }
}

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyCompleted => write!(f, "completer already used"),
            Self::ReplyOnOneWay => write!(f, "reply on a one-way method"),
            Self::NotTwoWay => write!(f, "method has no response"),
            Self::NotOneWay => write!(f, "method expects a response"),
            Self::TooManyPending(limit) => write!(f, "more than {} calls outstanding", limit),
            Self::ReservedOrdinal(ordinal) => write!(f, "ordinal {:#x} is reserved for epitaphs", ordinal),
            Self::Closed => write!(f, "binding is closed"),
            Self::Unbound => write!(f, "binding was unbound"),
        }
    }
}

impl std::error::Error for Error {}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

impl From<UsageError> for Error {
    fn from(e: UsageError) -> Self {
        Self::Usage(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
