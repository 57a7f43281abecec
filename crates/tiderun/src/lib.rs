//! # tiderun
//!
//! Client and server bindings that run `tiderpc` transactions over a
//! message channel.
//!
//! ## Philosophy
//!
//! - **Schema-Driven**: protocols are described at runtime with `Method` and
//!   `Event` values; requests and replies are `tidepack::Value`s checked
//!   against those schemas on both ends.
//! - **One Pump Per Channel**: each binding reads its channel from a single
//!   task, so messages are handled in order. Bindings on different channels
//!   share nothing.
//! - **Explicit Executors**: `bind` takes the `tokio::runtime::Handle` the
//!   pump runs on.
//! - **Exactly Once**: every two-way call resolves once, and every completer
//!   is used at most once.

pub mod channel;
pub mod client;
pub mod completer;
pub mod config;
pub mod epitaph;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transactions;

pub use channel::Channel;
pub use channel::MemoryChannel;

pub use client::Client;

pub use completer::Completer;

pub use config::ClientConfig;
pub use config::LeakedCompleter;
pub use config::ServerConfig;

pub use epitaph::ChannelState;
pub use epitaph::CloseCause;

pub use error::Error;
pub use error::Result;
pub use error::UsageError;

pub use protocol::Event;
pub use protocol::Method;
pub use protocol::ordinal_of;

pub use server::Dispatcher;
pub use server::HandlerTable;
pub use server::ServerHandle;
pub use server::bind;

pub use transactions::Txid;

pub use tiderpc::Status;

#[cfg(test)]
mod tests;
