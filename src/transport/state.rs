use crate::error::RpcError;

/// Lifecycle of a transport's underlying connection
///
/// ```text
/// Disconnected --connect--> Connected --close--> Closed
///       └──────────────────close─────────────────┘
/// ```
///
/// Requests may only be sent while [`Connected`](ConnectionState::Connected). Once closed, a
/// transport can not be reconnected.
#[derive(Debug)]
pub enum ConnectionState<C> {
    /// No connection has been established yet
    Disconnected,
    /// Connection is established and owned by the transport
    Connected(C),
    /// Transport has been closed and released its connection
    Closed,
}

impl<C> Default for ConnectionState<C> {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl<C> ConnectionState<C> {
    /// Borrows the connection or fails with [`RpcError::NotConnected`]
    pub fn connection(&self) -> Result<&C, RpcError> {
        match self {
            Self::Connected(connection) => Ok(connection),
            _ => Err(RpcError::NotConnected),
        }
    }

    /// Whether a connection is currently established
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// Whether the transport has been closed
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Verifies that a new connection may be established
    ///
    /// Returns `Ok(false)` if a connection already exists and `Err(_)` once closed.
    pub fn needs_connection(&self) -> Result<bool, RpcError> {
        match self {
            Self::Disconnected => Ok(true),
            Self::Connected(_) => Ok(false),
            Self::Closed => Err(RpcError::Closed),
        }
    }

    /// Transitions into [`Closed`](ConnectionState::Closed), handing out the connection if there was one
    ///
    /// The connection is handed out at most once, subsequent calls return `None`.
    pub fn close(&mut self) -> Option<C> {
        match std::mem::replace(self, Self::Closed) {
            Self::Connected(connection) => Some(connection),
            _ => None,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn reject_usage_before_connecting() {
        let state = ConnectionState::<()>::default();

        assert!(matches!(state.connection(), Err(RpcError::NotConnected)));
        assert!(matches!(state.needs_connection(), Ok(true)));
    }

    #[test]
    fn hand_out_connection_once() {
        let mut state = ConnectionState::Connected(42);

        assert!(matches!(state.needs_connection(), Ok(false)));
        assert_eq!(state.close(), Some(42));
        assert_eq!(state.close(), None);
        assert!(state.is_closed());
    }

    #[test]
    fn refuse_reconnecting_after_close() {
        let mut state = ConnectionState::<()>::Disconnected;
        state.close();

        assert!(matches!(state.needs_connection(), Err(RpcError::Closed)));
        assert!(matches!(state.connection(), Err(RpcError::NotConnected)));
    }
}
