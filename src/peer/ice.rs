use crate::error::{Error, Result};
use crate::peer::types::IceServerConfig;
use crate::utils::add_ice_url_scheme;
use once_cell::sync::Lazy;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// ICE list used when the caller does not supply one
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServerConfig>> =
    Lazy::new(|| vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]);

/// Parses a JSON ICE server list (`[{"urls": ..., "username"?: ..., "credential"?: ...}]`).
pub fn parse_ice_servers(raw: &str) -> Result<Vec<IceServerConfig>> {
    let servers: Vec<IceServerConfig> = serde_json::from_str(raw).map_err(Error::ice_config)?;
    validate_ice_servers(&servers)?;
    Ok(servers)
}

pub fn validate_ice_servers(servers: &[IceServerConfig]) -> Result<()> {
    for server in servers {
        let urls = server.urls.to_vec();
        if urls.is_empty() || urls.iter().any(|u| u.trim().is_empty()) {
            return Err(Error::ice_config("server URL cannot be empty"));
        }

        let is_relay = urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
        if is_relay && (server.username.is_none() || server.credential.is_none()) {
            return Err(Error::ice_config(
                "TURN servers require username and credential",
            ));
        }
    }
    Ok(())
}

pub fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| {
            let has_credentials = config.has_credentials();
            RTCIceServer {
                urls: config
                    .urls
                    .to_vec()
                    .iter()
                    .map(|u| add_ice_url_scheme(u, has_credentials))
                    .collect(),
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

/// Builds the peer connection configuration for one session
pub fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Waits for local candidate gathering so the answer carries every candidate.
/// The browser side does not trickle, so an answer without candidates is useless.
/// `done` must come from `gathering_complete_promise` taken before the local
/// description was set. Returns false when gathering did not finish within `limit`.
pub async fn wait_for_gathering(mut done: mpsc::Receiver<()>, limit: Duration) -> bool {
    match timeout(limit, done.recv()).await {
        Ok(_) => {
            debug!("ICE gathering complete");
            true
        }
        Err(_) => {
            warn!(
                timeout_secs = limit.as_secs(),
                "ICE gathering timed out, answering with partial candidates"
            );
            false
        }
    }
}

/// Candidate counts by type, taken from the `a=candidate` lines of a description
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(sdp: &str) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for line in sdp.lines().filter(|l| l.starts_with("a=candidate:")) {
        if line.contains("typ host") {
            summary.host += 1;
        } else if line.contains("typ srflx") {
            summary.srflx += 1;
        } else if line.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );
    if summary.srflx == 0 && summary.relay == 0 {
        warn!("no server-reflexive or relay candidates; peers behind NAT may fail to connect");
    }
    summary
}
