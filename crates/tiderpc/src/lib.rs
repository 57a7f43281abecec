//! # tiderpc
//!
//! Transactional message framing on top of `tidepack`.
//!
//! A message is a fixed 16-byte header (transaction id, flags, magic number,
//! method ordinal) followed by a payload struct and its handles. This crate
//! builds and parses those messages, including epitaphs (the final message
//! sent before a channel closes) and persistent data stored at rest.
//!
//! It knows nothing about channels or dispatch; see `tiderun` for that.

pub mod error;
pub mod header;
pub mod message;
pub mod status;

pub use error::Error;
pub use error::Result;

pub use header::EPITAPH_ORDINAL;
pub use header::HEADER_SIZE;
pub use header::MAGIC_NUMBER_INITIAL;
pub use header::PersistentHeader;
pub use header::TransactionHeader;

pub use message::MessageBuf;
pub use message::decode_body;
pub use message::decode_epitaph_body;
pub use message::decode_message;
pub use message::decode_persistent;
pub use message::encode_epitaph;
pub use message::encode_message;
pub use message::encode_with_header;
pub use message::encode_persistent;

pub use status::Status;
