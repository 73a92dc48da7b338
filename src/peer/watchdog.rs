//! Idle-timeout watchdog for one session.
//!
//! The deadline lives on the watchdog itself as an offset from its creation
//! instant. `reset` only ever moves it forward, and the waiter re-checks it
//! after every sleep instead of being cancelled and restarted, so a reset that
//! races the waiter waking up is never lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Armed,
    /// Deadline passed without a reset. Terminal.
    Fired,
    /// Session ended for another reason. Terminal.
    Disarmed,
}

struct Inner {
    timeout: Duration,
    origin: Instant,
    deadline_nanos: AtomicU64,
    state: watch::Sender<WatchdogState>,
}

impl Inner {
    fn deadline(&self) -> Instant {
        self.origin + Duration::from_nanos(self.deadline_nanos.load(Ordering::Acquire))
    }

    fn offset_from_now(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin) + self.timeout;
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }

    fn leave_armed(&self, next: WatchdogState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == WatchdogState::Armed {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

/// Cloneable handle; all clones share one deadline and one waiter.
#[derive(Clone)]
pub struct KeepaliveWatchdog {
    inner: Arc<Inner>,
}

impl KeepaliveWatchdog {
    /// Arms the watchdog with `deadline = now + timeout` and starts the waiter.
    /// Must be called from within a tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(WatchdogState::Armed);
        let inner = Arc::new(Inner {
            timeout,
            origin: Instant::now(),
            deadline_nanos: AtomicU64::new(0),
            state,
        });
        inner
            .deadline_nanos
            .store(inner.offset_from_now(), Ordering::Release);

        tokio::spawn(run_waiter(inner.clone()));
        Self { inner }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline()
    }

    pub fn state(&self) -> WatchdogState {
        *self.inner.state.borrow()
    }

    /// Pushes the deadline to `now + timeout`. No effect once fired or disarmed.
    pub fn reset(&self) {
        if self.state() != WatchdogState::Armed {
            return;
        }
        let next = self.inner.offset_from_now();
        self.inner.deadline_nanos.fetch_max(next, Ordering::AcqRel);
    }

    /// Stops the waiter without firing. Returns false if it had already fired.
    pub fn disarm(&self) -> bool {
        self.inner.leave_armed(WatchdogState::Disarmed)
    }

    /// Resolves once the deadline passes without a reset.
    /// Never resolves if the watchdog is disarmed first.
    pub async fn expired(&self) {
        let mut rx = self.inner.state.subscribe();
        let fired = rx.wait_for(|s| *s == WatchdogState::Fired).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_waiter(inner: Arc<Inner>) {
    let mut state = inner.state.subscribe();
    loop {
        let deadline = inner.deadline();
        tokio::select! {
            _ = sleep_until(deadline) => {
                if Instant::now() >= inner.deadline() {
                    if inner.leave_armed(WatchdogState::Fired) {
                        debug!(timeout_secs = inner.timeout.as_secs(), "keepalive deadline exceeded");
                    }
                    return;
                }
                // pushed forward while we slept
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() != WatchdogState::Armed {
                    return;
                }
            }
        }
    }
}
