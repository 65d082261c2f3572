//! Background sweep that closes sessions idle past a threshold.
//!
//! This is the only idle detector. The server touches a session on every
//! inbound message, so "idle" here means no message received. A closed
//! session is marked with [`Session::close_idle`](crate::session::Session::close_idle)
//! so its read loop reports a timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

/// Line sent to a session right before the monitor closes it.
pub const KEEPALIVE_TIMEOUT_NOTICE: &str = "KEEPALIVE_TIMEOUT";

/// Default idle threshold.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic sweep over a [`SessionRegistry`] that sends
/// [`KEEPALIVE_TIMEOUT_NOTICE`] to idle sessions and closes them.
pub struct KeepAliveMonitor {
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    interval: Duration,
    notice_timeout: Duration,
    stop: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveMonitor {
    /// Monitor `registry`, sweeping every `interval`. Call [`start`](Self::start) to begin.
    pub fn new(registry: Arc<SessionRegistry>, idle_timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
            interval,
            notice_timeout: DEFAULT_NOTICE_TIMEOUT,
            stop: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Upper bound on how long a single timeout notice may take to write.
    pub fn with_notice_timeout(mut self, notice_timeout: Duration) -> Self {
        self.notice_timeout = notice_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Close every live session idle for longer than the threshold.
    ///
    /// Notices go out concurrently, so one peer that stops reading delays
    /// the sweep by at most `notice_timeout`. Returns the number of
    /// sessions closed.
    pub async fn sweep(&self) -> usize {
        let idle: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| session.is_alive() && session.idle_for() > self.idle_timeout)
            .collect();
        let closed = futures::future::join_all(idle.iter().map(|session| async move {
            tracing::info!(
                session_id = %session.id(),
                idle_ms = session.idle_for().as_millis() as u64,
                "closing idle session"
            );
            match timeout(self.notice_timeout, session.send(KEEPALIVE_TIMEOUT_NOTICE)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(
                        session_id = %session.id(),
                        error = %e,
                        "timeout notice not delivered"
                    )
                }
                Err(_) => {
                    tracing::debug!(session_id = %session.id(), "timeout notice write timed out")
                }
            }
            session.close_idle()
        }))
        .await;
        closed.into_iter().filter(|closed| *closed).count()
    }

    /// Spawn the periodic sweep. Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let first = tokio::time::Instant::now() + monitor.interval;
            let mut ticker = interval_at(first, monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = monitor.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = monitor.sweep().await;
                        if closed > 0 {
                            tracing::debug!(closed, "keep-alive sweep finished");
                        }
                    }
                }
            }
        }));
        tracing::debug!(
            idle_timeout_ms = self.idle_timeout.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            "keep-alive monitor started"
        );
    }

    /// Stop the periodic sweep. A sweep in progress is abandoned.
    pub fn stop(&self) {
        self.stop.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for KeepAliveMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for KeepAliveMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveMonitor")
            .field("idle_timeout", &self.idle_timeout)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{FramingStrategy, LineFraming, read_messages};
    use crate::session::{Session, SessionId};
    use futures::StreamExt;
    use tokio::io::{DuplexStream, duplex};
    use tokio::time::Instant;

    fn add_session(registry: &Arc<SessionRegistry>) -> (Arc<Session>, DuplexStream) {
        let framing: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let (local, peer) = duplex(1024);
        let session = Session::new(SessionId::random(), None, local, framing, registry);
        registry.insert(Arc::clone(&session));
        (session, peer)
    }

    fn backdate(session: &Session, by: Duration) {
        if let Some(at) = Instant::now().checked_sub(by) {
            session.set_last_activity(at);
        }
    }

    #[tokio::test]
    async fn test_idle_session_gets_notice_then_closed() {
        let registry = Arc::new(SessionRegistry::new());
        let (idle, idle_peer) = add_session(&registry);
        let (fresh, _fresh_peer) = add_session(&registry);
        backdate(&idle, Duration::from_secs(45));
        fresh.touch();

        let monitor =
            KeepAliveMonitor::new(
                Arc::clone(&registry),
                DEFAULT_IDLE_TIMEOUT,
                DEFAULT_SWEEP_INTERVAL,
            );
        assert_eq!(monitor.sweep().await, 1);

        assert!(!idle.is_alive());
        assert!(idle.closed_for_idle());
        assert!(fresh.is_alive(), "recently touched session stays open");

        let mut frames = read_messages(idle_peer, Arc::new(LineFraming::default()));
        let notice = frames.next().await.unwrap().unwrap();
        assert_eq!(&notice[..], KEEPALIVE_TIMEOUT_NOTICE.as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peers_do_not_serialize_the_sweep() {
        let registry = Arc::new(SessionRegistry::new());
        let framing: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let mut stalled = Vec::new();
        for _ in 0..3 {
            // The notice does not fit and nobody reads the other end.
            let (local, peer) = duplex(4);
            let session =
                Session::new(SessionId::random(), None, local, Arc::clone(&framing), &registry);
            registry.insert(Arc::clone(&session));
            backdate(&session, Duration::from_secs(60));
            stalled.push((session, peer));
        }
        let (reading, reading_peer) = add_session(&registry);
        backdate(&reading, Duration::from_secs(60));

        let notice_timeout = Duration::from_secs(1);
        let monitor =
            KeepAliveMonitor::new(
                Arc::clone(&registry),
                Duration::from_secs(30),
                Duration::from_secs(10),
            )
                .with_notice_timeout(notice_timeout);

        let started = Instant::now();
        assert_eq!(monitor.sweep().await, 4);
        assert!(started.elapsed() < notice_timeout * 2, "sweep took {:?}", started.elapsed());

        for (session, _peer) in &stalled {
            assert!(!session.is_alive());
        }
        let mut frames = read_messages(reading_peer, Arc::new(LineFraming::default()));
        let notice = frames.next().await.unwrap().unwrap();
        assert_eq!(&notice[..], KEEPALIVE_TIMEOUT_NOTICE.as_bytes());
    }

    #[tokio::test]
    async fn test_already_closed_session_is_skipped() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, _peer) = add_session(&registry);
        backdate(&session, Duration::from_secs(120));
        session.close();

        let monitor =
            KeepAliveMonitor::new(registry, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(monitor.sweep().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_closes_idle_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, _peer) = add_session(&registry);

        let monitor = Arc::new(KeepAliveMonitor::new(
            Arc::clone(&registry),
            Duration::from_millis(300),
            Duration::from_millis(100),
        ));
        monitor.start();
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(session.is_alive(), "not idle long enough yet");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!session.is_alive());

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_session_open() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, _peer) = add_session(&registry);

        let monitor = Arc::new(KeepAliveMonitor::new(
            Arc::clone(&registry),
            Duration::from_millis(300),
            Duration::from_millis(100),
        ));
        monitor.start();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            session.touch();
        }
        assert!(session.is_alive());
        monitor.stop();
    }
}
