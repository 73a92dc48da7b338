//! Session supervision: one control loop per accepted offer.
//!
//! The loop owns the session state machine and is the only place a session is
//! torn down, whichever of the watchdog or the transport gets there first.

use crate::dispatch::ChannelDispatcher;
use crate::error::Result;
use crate::job::runner::JobRunner;
use crate::peer::connection::{PeerLink, PeerSession, SessionEvent};
use crate::peer::state::{SessionState, TerminationReason};
use crate::peer::types::{IceServerConfig, SessionAnswer, SessionOffer};
use crate::peer::watchdog::KeepaliveWatchdog;
use crate::utils::random_id;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Observes how a session ended. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Termination {
    rx: watch::Receiver<Option<TerminationReason>>,
}

/// Owning half of [`Termination`]; records the reason exactly once.
#[derive(Debug)]
pub struct TerminationTrigger {
    tx: watch::Sender<Option<TerminationReason>>,
}

impl TerminationTrigger {
    /// Returns false if a reason was already recorded.
    pub fn fire(&self, reason: TerminationReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }
}

impl Termination {
    pub fn channel() -> (TerminationTrigger, Termination) {
        let (tx, rx) = watch::channel(None);
        (TerminationTrigger { tx }, Termination { rx })
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        *self.rx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the session has ended. A control loop that vanished
    /// without recording a reason counts as the peer going away.
    pub async fn wait(&self) -> TerminationReason {
        let mut rx = self.rx.clone();
        let reason = rx.wait_for(Option::is_some).await.map(|r| *r);
        match reason {
            Ok(Some(reason)) => reason,
            _ => TerminationReason::PeerClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Silence allowed between keepalives before the session is closed
    pub idle_timeout: Duration,
    /// Upper bound on ICE gathering before the answer is returned anyway
    pub gather_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }
}

/// Result of a successful [`SessionSupervisor::accept`]
#[derive(Debug)]
pub struct AcceptedSession {
    pub id: String,
    pub answer: SessionAnswer,
    pub termination: Termination,
}

/// Accepts offers and keeps every resulting session until it ends.
pub struct SessionSupervisor {
    config: SessionConfig,
    runner: Arc<JobRunner>,
}

impl SessionSupervisor {
    pub fn new(config: SessionConfig, runner: Arc<JobRunner>) -> Self {
        Self { config, runner }
    }

    /// Negotiates one session and returns its answer. The session then lives on
    /// in its own task until it times out, fails, or is closed.
    pub async fn accept(
        &self,
        offer: &SessionOffer,
        ice_servers: &[IceServerConfig],
    ) -> Result<AcceptedSession> {
        let id = random_id();
        let span = info_span!("session", id = %id);

        async move {
            // armed before negotiation so a peer that never opens a channel is still reaped
            let watchdog = KeepaliveWatchdog::new(self.config.idle_timeout);
            let (events_tx, events_rx) = mpsc::unbounded_channel();

            let negotiated = PeerSession::negotiate(
                id.clone(),
                offer,
                ice_servers,
                self.config.gather_timeout,
                events_tx.clone(),
            )
            .await;
            let (peer, answer) = match negotiated {
                Ok(ok) => ok,
                Err(e) => {
                    watchdog.disarm();
                    return Err(e);
                }
            };

            let (termination, _) = spawn_control_loop(
                Arc::new(peer),
                watchdog,
                events_rx,
                events_tx,
                self.runner.clone(),
            );
            info!("session accepted");

            Ok(AcceptedSession {
                id,
                answer,
                termination,
            })
        }
        .instrument(span)
        .await
    }
}

/// Starts the control loop for an already negotiated link.
pub fn spawn_control_loop(
    link: Arc<dyn PeerLink>,
    watchdog: KeepaliveWatchdog,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    runner: Arc<JobRunner>,
) -> (Termination, JoinHandle<TerminationReason>) {
    let (trigger, termination) = Termination::channel();
    let control = ControlLoop {
        link,
        state: SessionState::new(),
        watchdog,
        events,
        events_tx,
        runner,
        trigger,
        termination: termination.clone(),
        dispatcher: None,
    };
    let handle = tokio::spawn(control.run().in_current_span());
    (termination, handle)
}

struct ControlLoop {
    link: Arc<dyn PeerLink>,
    state: SessionState,
    watchdog: KeepaliveWatchdog,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    runner: Arc<JobRunner>,
    trigger: TerminationTrigger,
    termination: Termination,
    dispatcher: Option<JoinHandle<()>>,
}

impl ControlLoop {
    async fn run(mut self) -> TerminationReason {
        let reason = loop {
            tokio::select! {
                _ = self.watchdog.expired() => {
                    self.state.begin_termination(TerminationReason::IdleTimeout);
                    break TerminationReason::IdleTimeout;
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        self.state.begin_termination(TerminationReason::PeerClosed);
                        break TerminationReason::PeerClosed;
                    };
                    if let Some(reason) = self.handle(event) {
                        break reason;
                    }
                }
            }
        };
        self.terminate(reason).await;
        reason
    }

    fn handle(&mut self, event: SessionEvent) -> Option<TerminationReason> {
        match event {
            SessionEvent::StateChanged(state) => {
                debug!(state = ?state, phase = ?self.state.phase(), "connection state event");
                self.state.connection_changed(state)
            }
            SessionEvent::ChannelOpened(channel) => {
                match self.state.bind_channel() {
                    Ok(()) => {
                        self.dispatcher = Some(ChannelDispatcher::spawn(
                            channel,
                            self.watchdog.clone(),
                            self.runner.clone(),
                            self.termination.clone(),
                            self.events_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(label = %channel.label, error = %e, "ignoring extra data channel");
                    }
                }
                None
            }
            SessionEvent::Traffic => {
                self.state.record_traffic();
                None
            }
        }
    }

    async fn terminate(&mut self, reason: TerminationReason) {
        match reason {
            TerminationReason::IdleTimeout => info!(
                timeout_secs = self.watchdog.timeout().as_secs(),
                "no keepalive in time, closing session"
            ),
            TerminationReason::TransportFailed => {
                warn!("transport failed, closing session")
            }
            TerminationReason::PeerClosed => info!("peer connection closed"),
        }

        self.watchdog.disarm();
        self.trigger.fire(reason);
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.link.close().await;

        match self.state.finish() {
            Ok(reason) => info!(session = %self.link.id(), reason = %reason, "session closed"),
            Err(e) => warn!(error = %e, "unexpected state at teardown"),
        }
    }
}
