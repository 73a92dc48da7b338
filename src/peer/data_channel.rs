use crate::error::{Error, Result};
use crate::peer::connection::SessionEvent;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Largest message the SCTP association will send. webrtc-rs does not
/// negotiate a larger size, so anything above this fails on write.
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// One message received on the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub data: Bytes,
    pub is_text: bool,
}

impl InboundMessage {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(s.into()),
            is_text: true,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_text: false,
        }
    }
}

impl From<DataChannelMessage> for InboundMessage {
    fn from(msg: DataChannelMessage) -> Self {
        Self {
            data: msg.data,
            is_text: msg.is_string,
        }
    }
}

/// One message to send back to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Bytes),
}

impl OutboundMessage {
    /// Size on the wire in bytes
    pub fn size(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }
}

/// Sending half of a bound data channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_SIZE
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<()> {
        match msg {
            OutboundMessage::Text(text) => self.send_text(text).await,
            OutboundMessage::Binary(data) => self.send_binary(data).await,
        }
    }
}

pub struct DataChannelSink {
    dc: Arc<RTCDataChannel>,
}

impl DataChannelSink {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

#[async_trait]
impl ChannelSink for DataChannelSink {
    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::channel(format!("send on '{}' failed: {e}", self.dc.label())))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::channel(format!("send on '{}' failed: {e}", self.dc.label())))
    }
}

/// An open channel handed to the dispatcher: where to send, and what was received.
pub struct BoundChannel {
    pub label: String,
    pub sink: Arc<dyn ChannelSink>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Wires a peer-created data channel into the session's event queue.
///
/// The message handler is installed immediately so nothing received between
/// creation and open is lost; the channel is announced to the supervisor once open.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<SessionEvent>) {
    let label = dc.label().to_string();
    debug!(label = %label, id = dc.id(), "attaching data channel");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(Mutex::new(Some(BoundChannel {
        label: label.clone(),
        sink: Arc::new(DataChannelSink::new(dc.clone())),
        inbound: inbound_rx,
    })));

    dc.on_open(Box::new({
        let label = label.clone();
        move || {
            info!(label = %label, "data channel opened");
            let bound = pending.lock().ok().and_then(|mut slot| slot.take());
            if let Some(bound) = bound {
                let _ = events.send(SessionEvent::ChannelOpened(bound));
            }
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let label = label.clone();
        move |msg: DataChannelMessage| {
            if inbound_tx.send(InboundMessage::from(msg)).is_err() {
                debug!(label = %label, "message after session teardown dropped");
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        warn!(label = %label, "data channel closed");
        Box::pin(async {})
    }));
}
