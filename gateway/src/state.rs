//! Service lifecycle states.

/// Service operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Engines wired, sweeps not yet running.
    Starting,
    /// Accepting requests.
    Running,
    /// Refusing new requests while sweeps wind down.
    ShuttingDown,
    Stopped,
}

impl ServiceState {
    /// Check if the service is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check if the service is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped)
    }
}
