//! # Server Binding
//!
//! Dispatches incoming requests to handlers by ordinal.
//!
//! ## Architecture
//!
//! - **HandlerTable**: ordinal to `(Method, handler)`, built once before `bind`.
//! - **Dispatcher**: validates and decodes one message, then calls its
//!   handler with the request and a `Completer`. Anything the dispatcher
//!   cannot accept closes the binding with an epitaph.
//! - **ServerHandle**: the owner's view of a running binding, used to send
//!   events, close, or unbind.
//!
//! Handlers run on the pump task and must not block it. Work that takes
//! time moves the `Completer` to another task and replies from there.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tidepack::Value;
use tiderpc::HEADER_SIZE;
use tiderpc::MessageBuf;
use tiderpc::Status;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::channel;
use crate::channel::Channel;
use crate::completer::Completer;
use crate::config::ServerConfig;
use crate::epitaph::ChannelState;
use crate::epitaph::CloseCause;
use crate::epitaph::ErrorHooks;
use crate::epitaph::Lifecycle;
use crate::epitaph::write_epitaph;
use crate::error::Error;
use crate::error::Result;
use crate::protocol::Event;
use crate::protocol::Method;
use crate::protocol::check_ordinal;

pub type Handler = Box<dyn Fn(Value, Completer) + Send + Sync + 'static>;

struct Route {
    method: Method,
    handler: Handler,
}

/// Handlers for the methods a server implements, keyed by ordinal.
#[derive(Default)]
pub struct HandlerTable {
    routes: HashMap<u64, Route>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler. A later handler for the same ordinal replaces an earlier one.
    pub fn method<F>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(Value, Completer) + Send + Sync + 'static,
    {
        if let Err(e) = check_ordinal(method.ordinal) {
            tracing::warn!(method = %method.name, error = %e, "not registering method");
            return self;
        }
        self.routes.insert(method.ordinal, Route { method, handler: Box::new(handler) });
        self
    }

    pub fn contains(&self, ordinal: u64) -> bool {
        self.routes.contains_key(&ordinal)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// State shared by a server binding and its outstanding completers.
pub(crate) struct ServerShared {
    pub(crate) name: String,
    pub(crate) config: ServerConfig,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) lifecycle: Lifecycle,
    /// Two-way requests awaiting a reply: txid to ordinal.
    pub(crate) in_flight: DashMap<u32, u64>,
    hooks: ErrorHooks,
    stop: Notify,
}

impl ServerShared {
    fn new(channel: Arc<dyn Channel>, config: ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            channel,
            lifecycle: Lifecycle::new(),
            in_flight: DashMap::new(),
            hooks: ErrorHooks::default(),
            stop: Notify::new(),
        }
    }

    /// Moves to `Closed`. Outstanding completers see the cause on their next use.
    pub(crate) fn shutdown(&self, cause: CloseCause, close_channel: bool) -> bool {
        if !self.lifecycle.finish_close(cause.clone()) {
            return false;
        }
        tracing::debug!(server = %self.name, ?cause, "binding closed");
        self.in_flight.clear();
        if close_channel {
            self.channel.close();
        }
        self.stop.notify_one();
        self.hooks.fire(&cause);
        true
    }

    /// Writes an epitaph and closes. Fails if the binding was already closing.
    pub(crate) fn close_with_epitaph(&self, status: Status, cause: CloseCause) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Err(self.lifecycle.closed_error());
        }
        if let Err(e) = write_epitaph(&*self.channel, status) {
            tracing::debug!(server = %self.name, error = %e, "epitaph not delivered");
        }
        self.shutdown(cause, true);
        Ok(())
    }
}

/// Reads nothing itself: feed it messages with `dispatch_one`.
pub struct Dispatcher {
    shared: Arc<ServerShared>,
    handlers: HandlerTable,
}

impl Dispatcher {
    pub fn new(handlers: HandlerTable, channel: Arc<dyn Channel>, config: ServerConfig) -> Self {
        Self { shared: Arc::new(ServerShared::new(channel, config)), handlers }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lifecycle.state()
    }

    /// Validates, decodes, and dispatches one incoming message. Returns
    /// whether the binding is still open afterwards.
    pub fn dispatch_one(&self, message: MessageBuf) -> bool {
        let shared = &self.shared;
        if !shared.lifecycle.is_open() {
            return false;
        }

        let header = match message.header() {
            Ok(header) => header,
            Err(e) => return self.reject(shared.config.invalid_request_status, Error::Decode(e)),
        };
        if let Err(e) = header.validate() {
            return self.reject(Status::PROTOCOL_NOT_SUPPORTED, Error::Decode(e));
        }

        let MessageBuf { bytes, handles } = message;
        let body = bytes.get(HEADER_SIZE..).unwrap_or(&[]);

        if header.is_epitaph() {
            let cause = match tiderpc::decode_epitaph_body(body, handles) {
                Ok(status) => CloseCause::Epitaph(status),
                Err(e) => CloseCause::Protocol(Error::Decode(e).to_string()),
            };
            shared.shutdown(cause, true);
            return false;
        }

        let Some(route) = self.handlers.routes.get(&header.ordinal) else {
            return self.reject(shared.config.unknown_method_status, Error::UnknownOrdinal(header.ordinal));
        };

        let two_way = route.method.is_two_way();
        if two_way != (header.txid != 0) || (two_way && shared.in_flight.contains_key(&header.txid)) {
            return self.reject(shared.config.invalid_request_status, Error::UnexpectedTransactionId(header.txid));
        }

        let request = match tiderpc::decode_body(body, handles, &route.method.request) {
            Ok(request) => request,
            Err(e) => return self.reject(shared.config.invalid_request_status, Error::Decode(e)),
        };

        tracing::trace!(server = %shared.name, txid = header.txid, method = %route.method.name, "dispatching request");
        if two_way {
            shared.in_flight.insert(header.txid, header.ordinal);
        }
        let completer = Completer::new(
            Arc::clone(shared),
            header.txid,
            header.ordinal,
            route.method.response.clone(),
        );
        (route.handler)(request, completer);
        shared.lifecycle.is_open()
    }

    fn reject(&self, status: Status, error: Error) -> bool {
        tracing::warn!(server = %self.shared.name, %error, %status, "rejecting request");
        let _ = self.shared.close_with_epitaph(status, CloseCause::Protocol(error.to_string()));
        false
    }
}

async fn serve(dispatcher: Dispatcher) {
    let shared = Arc::clone(&dispatcher.shared);
    loop {
        let message = tokio::select! {
            biased;
            _ = shared.stop.notified() => return,
            message = shared.channel.read() => message,
        };
        let cause = match message {
            Ok(message) => {
                if dispatcher.dispatch_one(message) {
                    continue;
                }
                return;
            }
            Err(channel::Error::PeerClosed) => CloseCause::PeerClosed,
            Err(channel::Error::Closed) => CloseCause::Local(None),
            Err(e) => CloseCause::Transport(e),
        };
        shared.shutdown(cause, true);
        return;
    }
}

/// Binds `handlers` to `channel` and spawns the dispatch loop on `runtime`.
pub fn bind(
    handlers: HandlerTable,
    channel: Arc<dyn Channel>,
    runtime: &tokio::runtime::Handle,
    config: ServerConfig,
) -> ServerHandle {
    let dispatcher = Dispatcher::new(handlers, channel, config);
    let shared = Arc::clone(&dispatcher.shared);
    tracing::debug!(server = %shared.name, methods = dispatcher.handlers.len(), "binding server");
    let pump = runtime.spawn(serve(dispatcher));
    ServerHandle { shared, pump: Some(pump) }
}

/// Owner's handle on a running server binding.
///
/// Dropping it leaves the binding serving until the channel closes.
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    pump: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Sends an event with txid 0.
    pub fn send_event(&self, event: &Event, payload: Value) -> Result<()> {
        if !self.shared.lifecycle.is_open() {
            return Err(self.shared.lifecycle.closed_error());
        }
        check_ordinal(event.ordinal)?;
        let message = tiderpc::encode_message(0, event.ordinal, payload, &event.payload).map_err(Error::Encode)?;
        tracing::trace!(server = %self.shared.name, event = %event.name, "sending event");
        self.shared.channel.write(message)?;
        Ok(())
    }

    /// Sends an epitaph and closes. Outstanding completers are invalidated.
    pub fn close_with_epitaph(&self, status: Status) -> Result<()> {
        self.shared.close_with_epitaph(status, CloseCause::Local(Some(status)))
    }

    /// Closes without an epitaph.
    pub fn shutdown(&self) {
        if self.shared.lifecycle.begin_close() {
            self.shared.shutdown(CloseCause::Local(None), true);
        }
    }

    /// Stops dispatching and hands the channel back, still open.
    pub async fn unbind(mut self) -> Result<Arc<dyn Channel>> {
        if !self.shared.lifecycle.begin_close() {
            return Err(self.shared.lifecycle.closed_error());
        }
        self.shared.shutdown(CloseCause::Unbound, false);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        Ok(Arc::clone(&self.shared.channel))
    }

    /// Registers a hook run when the binding closes for a reason other than
    /// the owner closing or unbinding it.
    pub fn on_channel_error<F>(&self, hook: F)
    where
        F: Fn(&CloseCause) + Send + Sync + 'static,
    {
        self.shared.hooks.push(Arc::new(hook));
    }

    /// Number of two-way requests awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lifecycle.state()
    }

    pub async fn closed(&self) -> CloseCause {
        self.shared.lifecycle.closed().await
    }
}
