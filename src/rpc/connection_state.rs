//! Lifecycle states of the RPC client connection.

/// State of the client's single logical connection.
///
/// Transitions:
/// - Disconnected -> Connecting (reconnect started)
/// - Connecting -> Connected (socket established, queue flushed)
/// - Connecting -> Exhausted (every attempt failed)
/// - Connected -> Disconnected (peer closed or read error)
/// - Exhausted is terminal: requests fail immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; requests are queued
    Disconnected,
    /// A reconnect attempt is in progress; requests are queued
    Connecting,
    /// Requests are written straight to the socket
    Connected,
    /// Reconnection gave up (terminal state)
    Exhausted,
}

impl ConnectionState {
    /// Whether new requests are still accepted (sent or queued).
    pub fn accepts_requests(self) -> bool {
        !matches!(self, ConnectionState::Exhausted)
    }
}

/// Result of a reconnect cycle. The caller decides whether `Exhausted`
/// is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    Exhausted { attempts: u32 },
}
