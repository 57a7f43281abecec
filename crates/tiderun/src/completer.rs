//! # Completer
//!
//! The move-only token a handler receives with each request. For a two-way
//! method it carries the txid the reply must echo.
//!
//! ## Invariants
//!
//! - A completer is used at most once: one `reply`, or one `close`.
//! - Use after the binding has closed reports the closure and sends nothing.
//! - Dropping an unused two-way completer while the binding is open is a
//!   bug in the handler. It is logged and, by default, closes the binding so
//!   the caller is not left waiting.

use std::sync::Arc;

use tidepack::StructType;
use tidepack::Value;
use tiderpc::Status;

use crate::config::LeakedCompleter;
use crate::epitaph::CloseCause;
use crate::error::Error;
use crate::error::Result;
use crate::error::UsageError;
use crate::server::ServerShared;

pub struct Completer {
    shared: Arc<ServerShared>,
    txid: u32,
    ordinal: u64,
    response: Option<Arc<StructType>>,
    done: bool,
}

impl Completer {
    pub(crate) fn new(shared: Arc<ServerShared>, txid: u32, ordinal: u64, response: Option<Arc<StructType>>) -> Self {
        Self { shared, txid, ordinal, response, done: false }
    }

    pub fn txid(&self) -> u32 {
        self.txid
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn is_two_way(&self) -> bool {
        self.response.is_some()
    }

    /// Sends the reply. An encode error leaves the completer unused, so the
    /// handler can retry with a corrected value.
    pub fn reply(&mut self, response: Value) -> Result<()> {
        let Some(decl) = self.response.clone() else {
            return Err(UsageError::ReplyOnOneWay.into());
        };
        if self.done {
            return Err(UsageError::AlreadyCompleted.into());
        }
        if !self.shared.lifecycle.is_open() {
            return Err(self.shared.lifecycle.closed_error());
        }

        let message = tiderpc::encode_message(self.txid, self.ordinal, response, &decl).map_err(Error::Encode)?;
        self.finish();
        tracing::trace!(server = %self.shared.name, txid = self.txid, "sending reply");
        self.shared.channel.write(message)?;
        Ok(())
    }

    /// Sends an epitaph carrying `status` and closes the binding.
    pub fn close(&mut self, status: Status) -> Result<()> {
        if self.done {
            return Err(UsageError::AlreadyCompleted.into());
        }
        self.finish();
        self.shared.close_with_epitaph(status, CloseCause::Local(Some(status)))
    }

    /// Gives up on replying without closing the binding. The caller of a
    /// two-way method is left waiting until it cancels or the channel closes.
    pub fn drop_without_shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.done = true;
        if self.response.is_some() {
            self.shared.in_flight.remove(&self.txid);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if self.done || self.response.is_none() {
            return;
        }
        self.finish();
        if !self.shared.lifecycle.is_open() {
            return;
        }
        tracing::warn!(
            server = %self.shared.name,
            txid = self.txid,
            ordinal = self.ordinal,
            "completer dropped without a reply"
        );
        if self.shared.config.leaked_completer == LeakedCompleter::Shutdown && self.shared.lifecycle.begin_close() {
            self.shared.shutdown(CloseCause::Local(None), true);
        }
    }
}
