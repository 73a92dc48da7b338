//! Error types for the session layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Offer could not be parsed or is not an offer
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// ICE server list could not be parsed
    #[error("invalid ICE configuration: {0}")]
    IceConfig(String),

    /// Offer was valid but the local answer could not be produced
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sending on the data channel failed
    #[error("channel error: {0}")]
    Channel(String),

    /// Inference collaborator failed
    #[error("generation failed: {0}")]
    Generation(String),

    /// Image codec failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Encoded result does not fit in one channel message
    #[error("result is {size} bytes, channel limit is {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

impl Error {
    pub fn invalid_offer(msg: impl std::fmt::Display) -> Self {
        Self::InvalidOffer(msg.to_string())
    }

    pub fn ice_config(msg: impl std::fmt::Display) -> Self {
        Self::IceConfig(msg.to_string())
    }

    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    pub fn channel(msg: impl std::fmt::Display) -> Self {
        Self::Channel(msg.to_string())
    }

    /// Negotiation errors are the caller's fault and are never retried.
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::InvalidOffer(_) | Self::IceConfig(_))
    }
}
