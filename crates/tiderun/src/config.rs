//! Binding configuration.

use tiderpc::Status;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Label recorded on every log line for this binding.
    pub name: String,
    /// Cap on outstanding two-way calls. `None` means unbounded.
    pub max_pending: Option<usize>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self { name: "client".to_string(), max_pending: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What a server does when a two-way completer is dropped without replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakedCompleter {
    /// Close the channel without an epitaph, so the caller is not left waiting.
    Shutdown,
    /// Log and keep serving.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    /// Epitaph sent when a request names an ordinal with no handler.
    pub unknown_method_status: Status,
    /// Epitaph sent when a request fails to decode or breaks the protocol.
    pub invalid_request_status: Status,
    pub leaked_completer: LeakedCompleter,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            name: "server".to_string(),
            unknown_method_status: Status::NOT_SUPPORTED,
            invalid_request_status: Status::INVALID_ARGS,
            leaked_completer: LeakedCompleter::Shutdown,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_unknown_method_status(mut self, status: Status) -> Self {
        self.unknown_method_status = status;
        self
    }

    pub fn with_invalid_request_status(mut self, status: Status) -> Self {
        self.invalid_request_status = status;
        self
    }

    pub fn with_leaked_completer(mut self, policy: LeakedCompleter) -> Self {
        self.leaked_completer = policy;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
