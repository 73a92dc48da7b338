pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod state;
pub mod types;
pub mod watchdog;

pub use connection::{PeerLink, PeerSession, SessionEvent};
pub use data_channel::{BoundChannel, ChannelSink, InboundMessage, OutboundMessage};
pub use state::{ConnectionState, SessionPhase, SessionState, TerminationReason};
pub use types::{IceServerConfig, IceUrls, SdpKind, SessionAnswer, SessionOffer};
pub use watchdog::{KeepaliveWatchdog, WatchdogState};
