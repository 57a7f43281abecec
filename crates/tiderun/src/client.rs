//! # Client Binding
//!
//! A `Client` owns one end of a channel and issues requests over it. A pump
//! task, spawned on the runtime handed to `bind`, reads every incoming
//! message in order and routes it:
//!
//! - **Epitaph**: the binding closes and every pending call resolves with
//!   `ClientChannelClosed` carrying the peer's status.
//! - **txid 0**: an event, decoded and passed to each listener registered for
//!   its ordinal.
//! - **Known txid**: the reply to a pending call. A reply that fails to
//!   decode fails only that call.
//! - **Cancelled txid**: a late reply, dropped.
//! - **Anything else**: a protocol violation. The binding closes with an
//!   `INVALID_ARGS` epitaph.
//!
//! ## Invariants
//!
//! - Every accepted two-way call resolves exactly once.
//! - Callbacks never run with the transaction table locked.
//! - Once closed, the table is empty and stays empty.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use dashmap::DashMap;
use tidepack::StructType;
use tidepack::Value;
use tiderpc::HEADER_SIZE;
use tiderpc::MessageBuf;
use tiderpc::Status;
use tiderpc::TransactionHeader;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel;
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::epitaph::ChannelState;
use crate::epitaph::CloseCause;
use crate::epitaph::ErrorHooks;
use crate::epitaph::Lifecycle;
use crate::epitaph::write_epitaph;
use crate::error::Error;
use crate::error::Result;
use crate::error::UsageError;
use crate::protocol::Event;
use crate::protocol::Method;
use crate::protocol::check_ordinal;
use crate::transactions::Lookup;
use crate::transactions::Pending;
use crate::transactions::TransactionTable;
use crate::transactions::Txid;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

struct EventSlot {
    payload: Arc<StructType>,
    handlers: Vec<EventHandler>,
}

struct ClientInner {
    name: String,
    channel: Arc<dyn Channel>,
    lifecycle: Lifecycle,
    table: Mutex<TransactionTable>,
    listeners: DashMap<u64, EventSlot>,
    hooks: ErrorHooks,
    stop: Notify,
}

impl ClientInner {
    fn table(&self) -> MutexGuard<'_, TransactionTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `Closed`, then resolves every pending call. Runs once.
    fn shutdown(&self, cause: CloseCause, close_channel: bool) -> bool {
        if !self.lifecycle.finish_close(cause.clone()) {
            return false;
        }
        tracing::debug!(client = %self.name, ?cause, "binding closed");

        let drained = self.table().close();
        for pending in drained {
            pending.complete(Err(cause.pending_error()));
        }
        if close_channel {
            self.channel.close();
        }
        self.stop.notify_one();
        self.hooks.fire(&cause);
        true
    }

    /// Tells the peer the binding is closing over something it sent.
    fn reject(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        if let Err(e) = write_epitaph(&*self.channel, Status::INVALID_ARGS) {
            tracing::debug!(client = %self.name, error = %e, "epitaph not delivered");
        }
    }

    /// Handles one incoming message. Returns a cause if the binding must close.
    fn handle_message(&self, message: MessageBuf) -> Option<CloseCause> {
        let header = match message.header().and_then(|header| header.validate().map(|_| header)) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(client = %self.name, error = %e, "malformed message header");
                return Some(CloseCause::Protocol(Error::Decode(e).to_string()));
            }
        };

        if header.is_epitaph() {
            let MessageBuf { bytes, handles } = message;
            let body = bytes.get(HEADER_SIZE..).unwrap_or(&[]);
            return Some(match tiderpc::decode_epitaph_body(body, handles) {
                Ok(status) => {
                    tracing::debug!(client = %self.name, %status, "received epitaph");
                    CloseCause::Epitaph(status)
                }
                Err(e) => CloseCause::Protocol(Error::Decode(e).to_string()),
            });
        }

        if header.txid == 0 {
            return self.dispatch_event(header, message);
        }

        let lookup = self.table().take(header.txid);
        match lookup {
            Lookup::Pending(pending) => {
                let result = tiderpc::decode_message(message, pending.ordinal, &pending.response)
                    .map(|(_, value)| value)
                    .map_err(Error::Decode);
                if let Err(e) = &result {
                    tracing::debug!(client = %self.name, txid = header.txid, error = %e, "reply failed to decode");
                }
                pending.complete(result);
                None
            }
            Lookup::Cancelled => {
                tracing::trace!(client = %self.name, txid = header.txid, "dropping reply to cancelled call");
                None
            }
            Lookup::Unknown => {
                let error = Error::UnexpectedTransactionId(header.txid);
                tracing::warn!(client = %self.name, %error, "protocol violation");
                Some(CloseCause::Protocol(error.to_string()))
            }
        }
    }

    fn dispatch_event(&self, header: TransactionHeader, message: MessageBuf) -> Option<CloseCause> {
        let slot = self
            .listeners
            .get(&header.ordinal)
            .map(|slot| (Arc::clone(&slot.payload), slot.handlers.clone()));
        let Some((payload, handlers)) = slot else {
            tracing::debug!(client = %self.name, ordinal = header.ordinal, "dropping event with no listener");
            return None;
        };

        let MessageBuf { bytes, handles } = message;
        let body = bytes.get(HEADER_SIZE..).unwrap_or(&[]);
        match tiderpc::decode_body(body, handles, &payload) {
            Ok(value) => {
                for handler in &handlers {
                    handler(&value);
                }
                None
            }
            Err(e) => {
                tracing::warn!(client = %self.name, ordinal = header.ordinal, error = %e, "event failed to decode");
                Some(CloseCause::Protocol(Error::Decode(e).to_string()))
            }
        }
    }

    fn cancel(&self, txid: Txid) -> bool {
        let cancelled = self.table().cancel(txid);
        match cancelled {
            Some(pending) => {
                pending.complete(Err(Error::Canceled));
                true
            }
            None => false,
        }
    }
}

async fn pump(inner: Arc<ClientInner>) {
    let cause = loop {
        let message = tokio::select! {
            biased;
            _ = inner.stop.notified() => return,
            message = inner.channel.read() => message,
        };
        match message {
            Ok(message) => {
                if let Some(cause) = inner.handle_message(message) {
                    if matches!(cause, CloseCause::Protocol(_)) {
                        inner.reject();
                    }
                    break cause;
                }
            }
            Err(channel::Error::PeerClosed) => break CloseCause::PeerClosed,
            Err(channel::Error::Closed) => break CloseCause::Local(None),
            Err(e) => break CloseCause::Transport(e),
        }
    };
    inner.shutdown(cause, true);
}

/// Cancels the call it guards unless disarmed first.
struct CancelOnDrop<'a> {
    inner: &'a ClientInner,
    txid: Option<Txid>,
}

impl CancelOnDrop<'_> {
    fn disarm(mut self) {
        self.txid = None;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(txid) = self.txid.take() {
            tracing::trace!(client = %self.inner.name, %txid, "call dropped before its reply");
            self.inner.cancel(txid);
        }
    }
}

/// The client end of a bound channel.
///
/// Dropping a `Client` closes it, cancelling whatever is still pending.
pub struct Client {
    inner: Arc<ClientInner>,
    pump: Option<JoinHandle<()>>,
}

impl Client {
    /// Binds `channel` and spawns its pump on `runtime`.
    pub fn bind(channel: Arc<dyn Channel>, runtime: &tokio::runtime::Handle, config: ClientConfig) -> Self {
        let inner = Arc::new(ClientInner {
            name: config.name,
            channel,
            lifecycle: Lifecycle::new(),
            table: Mutex::new(TransactionTable::new(config.max_pending)),
            listeners: DashMap::new(),
            hooks: ErrorHooks::default(),
            stop: Notify::new(),
        });
        tracing::debug!(client = %inner.name, "binding client");
        let pump = runtime.spawn(pump(Arc::clone(&inner)));
        Self { inner, pump: Some(pump) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Sends a two-way request. `on_reply` runs exactly once, on the pump
    /// task or the closing thread, with the reply or the reason there is none.
    ///
    /// Errors returned here (encoding, usage, closed binding) mean nothing was
    /// sent and `on_reply` will never run.
    pub fn call_async<F>(&self, method: &Method, request: Value, on_reply: F) -> Result<Txid>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let Some(response) = method.response.clone() else {
            return Err(UsageError::NotTwoWay.into());
        };
        check_ordinal(method.ordinal)?;

        let (txid, message) = {
            let mut table = self.inner.table();
            let txid = match table.reserve() {
                Ok(txid) => txid,
                Err(UsageError::Closed) => return Err(self.inner.lifecycle.closed_error()),
                Err(e) => return Err(e.into()),
            };
            let message = tiderpc::encode_message(txid.0, method.ordinal, request, &method.request)
                .map_err(Error::Encode)?;
            table.insert(txid, Pending::new(method.ordinal, response, Box::new(on_reply)));
            (txid, message)
        };

        tracing::trace!(client = %self.inner.name, %txid, method = %method.name, "sending request");
        match self.inner.channel.write(message) {
            Ok(()) => {}
            // The pump sees the closure, and any epitaph before it, and resolves the call.
            Err(channel::Error::PeerClosed) => {}
            Err(e) => {
                let removed = self.inner.table().remove(txid);
                if let Some(pending) = removed {
                    pending.complete(Err(Error::Channel(e)));
                }
            }
        }
        Ok(txid)
    }

    /// Sends a two-way request and waits for its reply.
    ///
    /// Dropping the returned future cancels the call.
    pub async fn call(&self, method: &Method, request: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let txid = self.call_async(method, request, move |result| {
            let _ = tx.send(result);
        })?;
        let guard = CancelOnDrop { inner: &self.inner, txid: Some(txid) };
        let result = rx.await.unwrap_or(Err(Error::Canceled));
        guard.disarm();
        result
    }

    /// Like `call`, for synchronous callers. Must not be called from within
    /// an async context.
    pub fn call_blocking(&self, method: &Method, request: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.call_async(method, request, move |result| {
            let _ = tx.send(result);
        })?;
        rx.blocking_recv().unwrap_or(Err(Error::Canceled))
    }

    /// Like `call`, but gives up after `timeout`. The call is cancelled and
    /// a late reply is dropped.
    pub async fn call_with_timeout(&self, method: &Method, request: Value, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.call(method, request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Sends a one-way request with txid 0.
    pub fn send_one_way(&self, method: &Method, request: Value) -> Result<()> {
        if method.is_two_way() {
            return Err(UsageError::NotOneWay.into());
        }
        check_ordinal(method.ordinal)?;
        if !self.inner.lifecycle.is_open() {
            return Err(self.inner.lifecycle.closed_error());
        }
        let message = tiderpc::encode_message(0, method.ordinal, request, &method.request).map_err(Error::Encode)?;
        tracing::trace!(client = %self.inner.name, method = %method.name, "sending one-way request");
        self.inner.channel.write(message)?;
        Ok(())
    }

    /// Registers a listener for `event`. Listeners run on the pump task, in
    /// registration order.
    pub fn on_event<F>(&self, event: &Event, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut slot = self.inner.listeners.entry(event.ordinal).or_insert_with(|| EventSlot {
            payload: Arc::clone(&event.payload),
            handlers: Vec::new(),
        });
        slot.handlers.push(Arc::new(handler));
    }

    /// Registers a hook run when the binding closes for a reason other than
    /// `close` or `unbind`.
    pub fn on_channel_error<F>(&self, hook: F)
    where
        F: Fn(&CloseCause) + Send + Sync + 'static,
    {
        self.inner.hooks.push(Arc::new(hook));
    }

    /// Cancels a pending call. Its callback receives `Canceled` and a late
    /// reply is dropped. Returns false if the call was not pending.
    pub fn cancel(&self, txid: Txid) -> bool {
        self.inner.cancel(txid)
    }

    pub fn is_pending(&self, txid: Txid) -> bool {
        self.inner.table().contains(txid)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table().len()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lifecycle.state()
    }

    pub async fn closed(&self) -> CloseCause {
        self.inner.lifecycle.closed().await
    }

    /// Closes the binding without an epitaph. Pending calls resolve with `Canceled`.
    pub fn close(&self) {
        if self.inner.lifecycle.begin_close() {
            self.inner.shutdown(CloseCause::Local(None), true);
        }
    }

    /// Sends an epitaph, then closes the binding.
    pub fn close_with_epitaph(&self, status: Status) -> Result<()> {
        if !self.inner.lifecycle.begin_close() {
            return Err(self.inner.lifecycle.closed_error());
        }
        let written = write_epitaph(&*self.inner.channel, status);
        self.inner.shutdown(CloseCause::Local(Some(status)), true);
        written.map_err(Error::from)
    }

    /// Stops the binding and hands its channel back, still open. Pending
    /// calls resolve with `Canceled`; queued messages stay on the channel.
    pub async fn unbind(mut self) -> Result<Arc<dyn Channel>> {
        if !self.inner.lifecycle.begin_close() {
            return Err(self.inner.lifecycle.closed_error());
        }
        self.inner.shutdown(CloseCause::Unbound, false);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        Ok(Arc::clone(&self.inner.channel))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
