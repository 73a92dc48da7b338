use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Error, Result};

/// Description type as browsers spell it on the wire
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Offer posted by the browser, consumed once per session
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionOffer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

/// Answer returned to the browser, produced once per session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SessionOffer {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(Error::invalid_offer)
    }

    /// Validates the offer and parses its SDP.
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        if self.kind != SdpKind::Offer {
            return Err(Error::invalid_offer(format!(
                "expected type \"offer\", got {:?}",
                self.kind
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(Error::invalid_offer("empty sdp"));
        }
        RTCSessionDescription::offer(self.sdp.clone()).map_err(Error::invalid_offer)
    }
}

impl TryFrom<RTCSessionDescription> for SessionAnswer {
    type Error = Error;

    fn try_from(desc: RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            other => {
                return Err(Error::negotiation(format!(
                    "local description is {other}, not an answer"
                )))
            }
        };
        Ok(Self {
            sdp: desc.sdp,
            kind,
        })
    }
}

/// `urls` may be a single string or a list, as in `RTCIceServer` on the web
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// One entry of the ICE server list supplied per session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.credential.is_some()
    }
}
