//! Routing of inbound channel messages.
//!
//! Every message is classified as a keepalive, a job, or invalid. Keepalives are
//! answered inline; jobs go to a separate worker so a long inference never
//! delays a pong.

use crate::job::request::{JobRequest, RequestError};
use crate::job::runner::{spawn_job_worker, JobRunner};
use crate::peer::connection::SessionEvent;
use crate::peer::data_channel::{BoundChannel, ChannelSink, InboundMessage};
use crate::peer::watchdog::KeepaliveWatchdog;
use crate::session::Termination;
use crate::utils::pong_timestamp;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

pub const KEEPALIVE_PREFIX: &str = "ping";

#[derive(Debug)]
pub enum Inbound {
    /// `ping<token>`; the token is echoed back verbatim
    Keepalive { token: String },
    Job(JobRequest),
    Invalid(InvalidMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidMessage {
    #[error("text message is not valid UTF-8")]
    NotUtf8,
    #[error(transparent)]
    Request(#[from] RequestError),
}

pub fn classify(msg: &InboundMessage) -> Inbound {
    if msg.is_text {
        let text = match std::str::from_utf8(&msg.data) {
            Ok(text) => text,
            Err(_) => return Inbound::Invalid(InvalidMessage::NotUtf8),
        };
        if let Some(token) = text.strip_prefix(KEEPALIVE_PREFIX) {
            return Inbound::Keepalive {
                token: token.to_string(),
            };
        }
    }

    match JobRequest::parse(&msg.data) {
        Ok(job) => Inbound::Job(job),
        Err(e) => Inbound::Invalid(e.into()),
    }
}

pub fn pong(token: &str) -> String {
    format!("pong{} {}", token, pong_timestamp(Utc::now()))
}

/// Owns one bound channel for its whole lifetime.
pub struct ChannelDispatcher {
    label: String,
    sink: Arc<dyn ChannelSink>,
    watchdog: KeepaliveWatchdog,
    jobs: mpsc::UnboundedSender<JobRequest>,
    events: mpsc::UnboundedSender<SessionEvent>,
    seen_traffic: bool,
}

impl ChannelDispatcher {
    /// Binds `channel` and starts its job worker and message loop.
    /// Aborting the returned handle stops both.
    pub fn spawn(
        channel: BoundChannel,
        watchdog: KeepaliveWatchdog,
        runner: Arc<JobRunner>,
        termination: Termination,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> JoinHandle<()> {
        let BoundChannel {
            label,
            sink,
            mut inbound,
        } = channel;
        let (jobs, worker) = spawn_job_worker(runner, sink.clone(), termination);

        let mut dispatcher = Self {
            label,
            sink,
            watchdog,
            jobs,
            events,
            seen_traffic: false,
        };
        info!(label = %dispatcher.label, "dispatcher bound to data channel");

        tokio::spawn(
            async move {
                // aborting this task drops the guard, which stops the worker too
                let _worker = AbortOnDrop(worker);
                while let Some(msg) = inbound.recv().await {
                    dispatcher.handle(msg).await;
                }
                debug!(label = %dispatcher.label, "inbound stream ended");
            }
            .in_current_span(),
        )
    }

    async fn handle(&mut self, msg: InboundMessage) {
        match classify(&msg) {
            Inbound::Keepalive { token } => {
                self.note_traffic();
                self.watchdog.reset();
                if let Err(e) = self.sink.send_text(pong(&token)).await {
                    warn!(error = %e, "failed to send pong");
                }
            }
            Inbound::Job(job) => {
                self.note_traffic();
                debug!(id = %job.id, "job queued");
                if self.jobs.send(job).is_err() {
                    warn!("job worker gone, dropping job");
                }
            }
            Inbound::Invalid(reason) => {
                warn!(
                    label = %self.label,
                    len = msg.data.len(),
                    error = %reason,
                    "received invalid message"
                );
            }
        }
    }

    fn note_traffic(&mut self) {
        if !self.seen_traffic {
            self.seen_traffic = true;
            let _ = self.events.send(SessionEvent::Traffic);
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::codec::{FormatEncoder, Image, ImageFormat, OutputMode};
    use crate::job::pipeline::{Generator, Pipelines};
    use crate::job::request::GenerationParams;
    use crate::peer::data_channel::testing::RecordingSink;
    use crate::peer::data_channel::OutboundMessage;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    struct Harness {
        inbound: mpsc::UnboundedSender<InboundMessage>,
        sink: Arc<RecordingSink>,
        watchdog: KeepaliveWatchdog,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _termination: crate::session::TerminationTrigger,
        _task: JoinHandle<()>,
    }

    fn harness(generator: Arc<dyn Generator>) -> Harness {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink::default());
        let watchdog = KeepaliveWatchdog::new(Duration::from_secs(30));
        let (trigger, termination) = Termination::channel();
        let runner = Arc::new(JobRunner::new(
            Pipelines::uniform(generator),
            Arc::new(FormatEncoder::new(ImageFormat::Webp)),
            OutputMode::DataUri,
        ));
        let task = ChannelDispatcher::spawn(
            BoundChannel {
                label: "chat".into(),
                sink: sink.clone(),
                inbound: inbound_rx,
            },
            watchdog.clone(),
            runner,
            termination,
            events_tx,
        );
        Harness {
            inbound,
            sink,
            watchdog,
            events,
            _termination: trigger,
            _task: task,
        }
    }

    fn counting(n: usize, calls: Arc<AtomicUsize>) -> Arc<dyn Generator> {
        Arc::new(move |params: &GenerationParams| {
            calls.fetch_add(1, Ordering::SeqCst);
            let tag = params.seed.unwrap_or_default() as u8;
            (0..n)
                .map(|_| Image::new(1, 1, vec![tag; 3]))
                .collect::<anyhow::Result<Vec<_>>>()
        })
    }

    fn json(msg: &OutboundMessage) -> Value {
        match msg {
            OutboundMessage::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(&InboundMessage::text("ping 42")),
            Inbound::Keepalive { token } if token == " 42"
        ));
        assert!(matches!(
            classify(&InboundMessage::text("ping")),
            Inbound::Keepalive { token } if token.is_empty()
        ));
        assert!(matches!(
            classify(&InboundMessage::text(r#"{"id":7,"prompt":"cat"}"#)),
            Inbound::Job(_)
        ));
        assert!(matches!(
            classify(&InboundMessage::binary(&br#"{"prompt":"cat"}"#[..])),
            Inbound::Job(_)
        ));
        // binary messages are never keepalives
        assert!(matches!(
            classify(&InboundMessage::binary(&b"ping 1"[..])),
            Inbound::Invalid(_)
        ));
        assert!(matches!(
            classify(&InboundMessage::text("hello")),
            Inbound::Invalid(_)
        ));
        assert!(matches!(
            classify(&InboundMessage {
                data: bytes::Bytes::from_static(&[0xff, 0xfe]),
                is_text: true
            }),
            Inbound::Invalid(InvalidMessage::NotUtf8)
        ));
    }

    #[test]
    fn test_pong_format() {
        let reply = pong(" 42");
        let rest = reply.strip_prefix("pong 42 ").unwrap();
        assert!(rest.parse::<f64>().unwrap() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_replies_and_resets_watchdog() {
        let mut h = harness(counting(1, Arc::default()));
        let start = Instant::now();

        sleep(Duration::from_secs(10)).await;
        h.inbound.send(InboundMessage::text("ping 42")).unwrap();

        let sent = h.sink.wait_for(1).await;
        let OutboundMessage::Text(reply) = &sent[0] else {
            panic!("expected text pong");
        };
        assert!(reply.starts_with("pong 42 "));
        assert_eq!(h.watchdog.deadline(), start + Duration::from_secs(40));
        assert!(matches!(h.events.recv().await, Some(SessionEvent::Traffic)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_message_is_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = harness(counting(1, calls.clone()));
        let deadline = h.watchdog.deadline();

        sleep(Duration::from_secs(5)).await;
        h.inbound.send(InboundMessage::text("hello there")).unwrap();
        h.inbound.send(InboundMessage::text("[1,2,3]")).unwrap();
        h.inbound.send(InboundMessage::text("ping")).unwrap();

        // the pong proves the earlier messages were processed
        let sent = h.sink.wait_for(1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(h.watchdog.deadline() > deadline);
        assert!(matches!(h.events.recv().await, Some(SessionEvent::Traffic)));
    }

    #[tokio::test]
    async fn test_invalid_message_does_not_reset() {
        let h = harness(counting(1, Arc::default()));
        let deadline = h.watchdog.deadline();
        h.inbound.send(InboundMessage::text("nope")).unwrap();
        h.inbound.send(InboundMessage::text(r#"{"num_images":0}"#)).unwrap();
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(h.watchdog.deadline(), deadline);
        assert!(h.sink.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_job_results_stream_in_order() {
        let h = harness(counting(2, Arc::default()));

        h.inbound
            .send(InboundMessage::text(r#"{"id":7,"prompt":"cat","seed":1}"#))
            .unwrap();
        h.inbound
            .send(InboundMessage::text(r#"{"id":8,"prompt":"dog","seed":2}"#))
            .unwrap();

        let sent = h.sink.wait_for(4).await;
        let ids: Vec<Value> = sent.iter().map(|m| json(m)["id"].clone()).collect();
        assert_eq!(ids, vec![7, 7, 8, 8]);
        for msg in &sent {
            let body = json(msg);
            assert!(body["image"]
                .as_str()
                .unwrap()
                .starts_with("data:image/webp;base64,"));
            assert!(body["end"].as_i64().unwrap() >= body["start"].as_i64().unwrap());
        }
    }

    #[tokio::test]
    async fn test_ping_answered_while_job_runs() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let slow: Arc<dyn Generator> = Arc::new(move |_: &GenerationParams| {
            // blocks until the test has seen the pong
            let _ = release_rx.lock().unwrap().recv();
            Image::new(1, 1, vec![0; 3]).map(|i| vec![i])
        });
        let h = harness(slow);

        h.inbound
            .send(InboundMessage::text(r#"{"id":1,"prompt":"cat"}"#))
            .unwrap();
        h.inbound.send(InboundMessage::text("ping 5")).unwrap();

        let sent = h.sink.wait_for(1).await;
        assert!(matches!(&sent[0], OutboundMessage::Text(t) if t.starts_with("pong 5 ")));

        release_tx.send(()).unwrap();
        let sent = h.sink.wait_for(2).await;
        assert_eq!(json(&sent[1])["id"], 1);
    }
}
