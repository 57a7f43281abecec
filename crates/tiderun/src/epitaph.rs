//! # Channel Lifecycle
//!
//! Every binding moves through `Open → Closing → Closed`. The side that
//! closes first sends at most one epitaph, then closes its endpoint. The
//! other side either reads that epitaph, or notices the closure without one
//! (an abrupt close).
//!
//! ## Invariants
//!
//! - The state only moves forward; `Closed` is final.
//! - Exactly one caller wins each transition, so teardown (draining pending
//!   transactions, closing the endpoint) runs once.

use std::sync::Arc;
use std::sync::Mutex;

use tiderpc::Status;
use tokio::sync::watch;

use crate::channel;
use crate::channel::Channel;
use crate::error::Error;
use crate::error::UsageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer sent an epitaph.
    Epitaph(Status),
    /// The peer closed without an epitaph.
    PeerClosed,
    /// Closed locally, with the epitaph that was sent, if any.
    Local(Option<Status>),
    /// Closed locally after the peer broke the protocol.
    Protocol(String),
    /// The channel failed underneath the binding.
    Transport(channel::Error),
    /// The channel was handed back with `unbind`.
    Unbound,
}

impl CloseCause {
    /// Whether the closure was caused by something other than the local owner.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Local(_) | Self::Unbound)
    }

    /// What a transaction still pending at closure resolves to.
    pub fn pending_error(&self) -> Error {
        match self {
            Self::Epitaph(status) => Error::ClientChannelClosed { status: *status },
            Self::PeerClosed => Error::PeerClosed,
            Self::Local(_) | Self::Protocol(_) | Self::Unbound => Error::Canceled,
            Self::Transport(e) => Error::Channel(e.clone()),
        }
    }

    /// What an operation started after closure fails with.
    pub fn closed_error(&self) -> Error {
        match self {
            Self::Local(_) => Error::Usage(UsageError::Closed),
            Self::Unbound => Error::Usage(UsageError::Unbound),
            other => other.pending_error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed(CloseCause),
}

/// Shared, observable lifecycle state of one binding.
pub struct Lifecycle {
    state: watch::Sender<ChannelState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Open);
        Self { state }
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), ChannelState::Open)
    }

    pub fn cause(&self) -> Option<CloseCause> {
        match &*self.state.borrow() {
            ChannelState::Closed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Error for an operation attempted while not open.
    pub fn closed_error(&self) -> Error {
        self.cause().map(|cause| cause.closed_error()).unwrap_or(Error::Usage(UsageError::Closed))
    }

    /// `Open → Closing`. Returns whether this call made the transition.
    pub fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, ChannelState::Open) {
                *state = ChannelState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// `Open | Closing → Closed`. Returns whether this call made the transition.
    pub fn finish_close(&self, cause: CloseCause) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, ChannelState::Closed(_)) {
                false
            } else {
                *state = ChannelState::Closed(cause);
                true
            }
        })
    }

    /// Waits until the binding is closed and returns why.
    pub async fn closed(&self) -> CloseCause {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| matches!(state, ChannelState::Closed(_))).await {
            Ok(state) => state.clone(),
            Err(_) => return CloseCause::Local(None),
        };
        match state {
            ChannelState::Closed(cause) => cause,
            _ => CloseCause::Local(None),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback run when a binding closes for a reason other than its owner.
pub type ErrorHook = Arc<dyn Fn(&CloseCause) + Send + Sync + 'static>;

/// Hooks registered with `on_channel_error`.
#[derive(Default)]
pub struct ErrorHooks {
    hooks: Mutex<Vec<ErrorHook>>,
}

impl ErrorHooks {
    pub fn push(&self, hook: ErrorHook) {
        self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(hook);
    }

    /// Runs every hook if `cause` is an error. Hooks run without the lock held.
    pub fn fire(&self, cause: &CloseCause) {
        if !cause.is_error() {
            return;
        }
        let hooks = self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        for hook in hooks {
            hook(cause);
        }
    }
}

/// Writes an epitaph carrying `status`. The caller closes the endpoint after.
pub fn write_epitaph(channel: &dyn Channel, status: Status) -> channel::Result<()> {
    tracing::debug!(%status, "writing epitaph");
    channel.write(tiderpc::encode_epitaph(status))
}
