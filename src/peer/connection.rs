use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_dc, BoundChannel};
use crate::peer::ice::{analyze_candidates, rtc_config, validate_ice_servers, wait_for_gathering};
use crate::peer::state::ConnectionState;
use crate::peer::types::{IceServerConfig, SessionAnswer, SessionOffer};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

/// Everything the transport tells the supervisor, in arrival order
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ChannelOpened(BoundChannel),
    /// First keepalive or job seen on the bound channel
    Traffic,
}

/// What the supervisor needs from a negotiated connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> &str;

    /// Closes the connection and releases its transport resources.
    async fn close(&self);
}

/// One negotiated peer connection.
pub struct PeerSession {
    id: String,
    pc: Arc<RTCPeerConnection>,
}

impl PeerSession {
    /// Builds the connection for `offer`, applies it and produces the local answer.
    ///
    /// The ICE list and offer are validated before anything is constructed, and a
    /// connection that fails halfway is closed before the error is returned.
    /// State changes and opened channels are reported on `events` from then on.
    pub async fn negotiate(
        id: String,
        offer: &SessionOffer,
        ice_servers: &[IceServerConfig],
        gather_timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(Self, SessionAnswer)> {
        validate_ice_servers(ice_servers)?;
        let remote = offer.to_rtc()?;

        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);
        register_handlers(&id, &pc, events);

        let session = Self { id, pc };
        match session.answer(remote, gather_timeout).await {
            Ok(answer) => Ok((session, answer)),
            Err(e) => {
                warn!(session = %session.id, error = %e, "negotiation failed, closing connection");
                session.close().await;
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        remote: webrtc::peer_connection::sdp::session_description::RTCSessionDescription,
        gather_timeout: Duration,
    ) -> Result<SessionAnswer> {
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(Error::invalid_offer)?;
        debug!(session = %self.id, "set remote description");

        let answer = self.pc.create_answer(None).await?;
        let gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;
        debug!(session = %self.id, "set local description");

        wait_for_gathering(gathered, gather_timeout).await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::negotiation("no local description after answering"))?;
        analyze_candidates(&local.sdp);
        SessionAnswer::try_from(local)
    }
}

#[async_trait]
impl PeerLink for PeerSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(session = %self.id, error = %e, "error closing peer connection");
        } else {
            info!(session = %self.id, "peer connection closed");
        }
    }
}

fn register_handlers(
    id: &str,
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        Box::pin(async move {
            if let Some(c) = cand {
                dump_candidate("LOCAL", &c).await;
            }
        })
    }));

    // weak: the connection owns this handler
    let pc_stats: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let state_events = events.clone();
    let session = id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!(session = %session, state = %st, "peer connection state changed");

        if st == RTCPeerConnectionState::Failed {
            if let Some(pc) = pc_stats.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }

        let _ = state_events.send(SessionEvent::StateChanged(st.into()));
        Box::pin(async {})
    }));

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        attach_dc(&dc, events.clone());
        Box::pin(async {})
    }));
}
