//! Explicit per-session state machine.
//!
//! negotiating -> open (channel bound) -> active (traffic seen)
//!   -> terminating (watchdog fired | connection failed | closed) -> closed
//!
//! There is no way back from terminating or closed.

use std::fmt;
use thiserror::Error;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Transport connection state as reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// No keepalive within the idle timeout
    IdleTimeout,
    /// Connection entered the failed state
    TransportFailed,
    /// Connection was closed
    PeerClosed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IdleTimeout => "idle timeout",
            Self::TransportFailed => "transport failed",
            Self::PeerClosed => "peer connection closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Negotiating,
    Open,
    Active,
    Terminating(TerminationReason),
    Closed(TerminationReason),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot {event} while {from:?}")]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub event: &'static str,
}

#[derive(Debug)]
pub struct SessionState {
    phase: SessionPhase,
    connection: ConnectionState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Negotiating,
            connection: ConnectionState::New,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Terminating(_) | SessionPhase::Closed(_)
        )
    }

    /// The first data channel binds the session. Later ones are refused.
    pub fn bind_channel(&mut self) -> Result<(), InvalidTransition> {
        match self.phase {
            SessionPhase::Negotiating => {
                self.phase = SessionPhase::Open;
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                event: "bind a data channel",
            }),
        }
    }

    /// Marks the session active on its first inbound message.
    pub fn record_traffic(&mut self) {
        if self.phase == SessionPhase::Open {
            self.phase = SessionPhase::Active;
        }
    }

    /// Applies a connection state change and returns the termination it causes, if any.
    pub fn connection_changed(&mut self, state: ConnectionState) -> Option<TerminationReason> {
        if self.phase_is_closed() {
            return None;
        }
        self.connection = state;
        let reason = match state {
            ConnectionState::Failed => TerminationReason::TransportFailed,
            ConnectionState::Closed => TerminationReason::PeerClosed,
            // disconnected may recover; the watchdog covers it if it doesn't
            _ => return None,
        };
        self.begin_termination(reason).then_some(reason)
    }

    /// Enters `terminating`. Returns false if the session was already ending.
    pub fn begin_termination(&mut self, reason: TerminationReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = SessionPhase::Terminating(reason);
        true
    }

    /// Completes teardown once resources are released.
    pub fn finish(&mut self) -> Result<TerminationReason, InvalidTransition> {
        match self.phase {
            SessionPhase::Terminating(reason) => {
                self.phase = SessionPhase::Closed(reason);
                Ok(reason)
            }
            from => Err(InvalidTransition {
                from,
                event: "finish",
            }),
        }
    }

    fn phase_is_closed(&self) -> bool {
        matches!(self.phase, SessionPhase::Closed(_))
    }
}
