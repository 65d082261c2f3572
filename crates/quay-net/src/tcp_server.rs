//! TCP server: accepts connections and drives each one through framing,
//! dispatch and the close sequence.
//!
//! Per connection, a reader task decodes frames into a small broadcast
//! channel. When the consumer falls behind the channel drops the oldest
//! frames instead of growing or blocking the reader. The consumer handles
//! one message at a time, in arrival order, and writes any response before
//! pulling the next one.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBus, EventKind, EventSource};
use crate::framing::{FrameError, FramingStrategy, LineFraming, read_messages};
use crate::keepalive::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL, KeepAliveMonitor};
use crate::middleware::{Middleware, MiddlewareChain, panic_message};
use crate::platform::{SocketOptions, bind_listener, resolve_bind_addr, tune_stream};
use crate::request::{Request, RequestHandler};
use crate::session::{Session, SessionError, SessionId, SessionRegistry};

/// Notice written to every open session during [`TcpServer::stop`].
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down. Goodbye!";

/// Runtime configuration for [`TcpServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host or IP to bind. Default: `0.0.0.0`.
    pub host: String,
    /// Keep-alive threshold: a session with no inbound message for this
    /// long is sent `KEEPALIVE_TIMEOUT` and closed. Default: 30s.
    pub idle_timeout: Duration,
    /// Keep-alive sweep period. Default: 10s.
    pub sweep_interval: Duration,
    /// Maximum concurrent sessions. Default: 1024.
    pub max_connections: usize,
    /// Frames buffered per connection before the oldest is dropped. Default: 1.
    pub backpressure_capacity: usize,
    /// Pause after each handled message before reading the next. Default: 0.
    pub dispatch_delay: Duration,
    /// Upper bound on a single response or notice write. Default: 5s.
    pub write_timeout: Duration,
    /// How long `stop` waits for connection tasks before aborting them. Default: 5s.
    pub shutdown_grace: Duration,
    /// Line written to every session during `stop`.
    pub shutdown_notice: String,
    pub socket: SocketOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_connections: 1024,
            backpressure_capacity: 1,
            dispatch_delay: Duration::ZERO,
            write_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            shutdown_notice: SHUTDOWN_NOTICE.to_owned(),
            socket: SocketOptions::default(),
        }
    }
}

/// Listener-level failures. These are fatal to [`TcpServer::start`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed on {address}: {source}")]
    Accept {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,
}

/// Why a session's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side cleanly.
    Complete,
    /// The keep-alive monitor closed the session for inactivity.
    Timeout,
    /// Transport or framing failure.
    Error,
    /// Closed locally by shutdown or application code.
    Cancel,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Complete => "complete",
            CloseReason::Timeout => "timeout",
            CloseReason::Error => "error",
            CloseReason::Cancel => "cancel",
        }
    }
}

struct Shared {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    framing: Arc<dyn FramingStrategy>,
    middleware: MiddlewareChain,
    events: Arc<EventBus>,
    registry: Arc<SessionRegistry>,
}

fn server_event(kind: EventKind, address: &str, port: u16) -> Event {
    Event::new(kind, EventSource::Server)
        .with("address", address)
        .with("port", port)
}

fn session_event(kind: EventKind, id: &SessionId) -> Event {
    Event::new(kind, EventSource::Session(id.clone())).with("session_id", id.as_str())
}

// Per-connection errors from accept() that leave the listener usable.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// TCP server that accepts connections and manages their lifecycle.
pub struct TcpServer {
    shared: Arc<Shared>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    connections: tokio::sync::Mutex<JoinSet<()>>,
    monitor: parking_lot::Mutex<Option<Arc<KeepAliveMonitor>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    /// Start building a server that hands every message to `handler`.
    pub fn builder(handler: impl RequestHandler + 'static) -> TcpServerBuilder {
        TcpServerBuilder::new(Arc::new(handler))
    }

    /// Sessions currently open on this server.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Address of the listener while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind `host:port` from the configuration and serve until [`stop`](Self::stop).
    ///
    /// A bind failure emits a server-error event and is returned.
    pub async fn start(&self, port: u16) -> Result<(), ServerError> {
        let host = self.shared.config.host.clone();
        let bound = match resolve_bind_addr(&host, port).await {
            Ok(addr) => bind_listener(addr, &self.shared.config.socket),
            Err(e) => Err(e),
        };
        match bound {
            Ok(listener) => self.serve(listener).await,
            Err(source) => {
                tracing::error!(host = %host, port, error = %source, "failed to bind listener");
                self.shared.events.emit(
                    server_event(EventKind::ServerError, &host, port)
                        .with("error", source.to_string()),
                );
                Err(ServerError::Bind {
                    address: format!("{host}:{port}"),
                    source,
                })
            }
        }
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.running.store(false, Ordering::Release);
                return Err(ServerError::Bind {
                    address: "<unknown>".to_owned(),
                    source,
                });
            }
        };
        *self.local_addr.lock() = Some(addr);

        let monitor = Arc::new(
            KeepAliveMonitor::new(
                Arc::clone(&self.shared.registry),
                self.shared.config.idle_timeout,
                self.shared.config.sweep_interval,
            )
            .with_notice_timeout(self.shared.config.write_timeout),
        );
        monitor.start();
        *self.monitor.lock() = Some(monitor);

        tracing::info!(address = %addr, framing = self.shared.framing.name(), "server listening");
        self.shared
            .events
            .emit(server_event(EventKind::ServerStart, &addr.ip().to_string(), addr.port()));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => self.admit(stream, peer).await,
                    Err(e) if is_transient_accept_error(&e) => {
                        tracing::debug!(error = %e, "transient accept error");
                    }
                    Err(source) => {
                        tracing::error!(address = %addr, error = %source, "accept loop failed");
                        self.running.store(false, Ordering::Release);
                        if let Some(monitor) = self.monitor.lock().take() {
                            monitor.stop();
                        }
                        self.shared.events.emit(
                            server_event(
                                EventKind::ServerError,
                                &addr.ip().to_string(),
                                addr.port(),
                            )
                                .with("error", source.to_string()),
                        );
                        return Err(ServerError::Accept { address: addr, source });
                    }
                },
            }
        }

        tracing::info!(address = %addr, "accept loop stopped");
        Ok(())
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let mut connections = self.connections.lock().await;
        // Checked under the lock so stop() never misses a spawned task.
        if !self.is_running() {
            tracing::debug!(peer = %peer, "dropping connection accepted during shutdown");
            return;
        }
        while connections.try_join_next().is_some() {}

        let shared = &self.shared;
        if shared.registry.len() >= shared.config.max_connections {
            tracing::warn!(
                peer = %peer,
                max = shared.config.max_connections,
                "connection limit reached, rejecting"
            );
            return;
        }
        if let Err(e) = tune_stream(&stream, &shared.config.socket) {
            tracing::debug!(peer = %peer, error = %e, "failed to apply socket options");
        }

        let (reader, writer) = stream.into_split();
        let session = Session::new(
            SessionId::random(),
            Some(peer),
            writer,
            Arc::clone(&shared.framing),
            &shared.registry,
        );
        shared.registry.insert(Arc::clone(&session));
        tracing::debug!(session_id = %session.id(), peer = %peer, "accepted connection");

        connections.spawn(run_connection(Arc::clone(shared), session, reader));
    }

    /// Stop accepting, notify and close every session, then wait for the
    /// connection tasks. Safe to call more than once.
    pub async fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.shutdown_tx.send_replace(true);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }

        let shared = &self.shared;
        let sessions = shared.registry.snapshot();
        if !sessions.is_empty() {
            tracing::info!(sessions = sessions.len(), "closing sessions for shutdown");
        }
        let notice = shared.config.shutdown_notice.as_bytes();
        let write_timeout = shared.config.write_timeout;
        futures::future::join_all(sessions.iter().map(|session| async move {
            match timeout(write_timeout, session.send(notice)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(
                        session_id = %session.id(),
                        error = %e,
                        "shutdown notice not delivered"
                    )
                }
                Err(_) => {
                    tracing::debug!(session_id = %session.id(), "shutdown notice write timed out")
                }
            }
            session.close();
        }))
        .await;

        let mut connections = self.connections.lock().await;
        let drained = timeout(shared.config.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "aborting connection tasks after grace period"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        drop(connections);

        // Sessions whose task was aborted never ran their close sequence.
        for session in shared.registry.snapshot() {
            session.close_async().await;
        }
        shared.registry.clear();
        *self.local_addr.lock() = None;

        if was_running {
            tracing::info!("server stopped");
            shared.events.emit(Event::new(EventKind::ServerStop, EventSource::Server));
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("config", &self.shared.config)
            .field("framing", &self.shared.framing.name())
            .field("sessions", &self.shared.registry.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Per-connection pipeline
// ---------------------------------------------------------------------------

async fn run_connection(shared: Arc<Shared>, session: Arc<Session>, reader: OwnedReadHalf) {
    shared.middleware.on_connect(&session).await;
    let remote = session.remote_addr().map(|a| a.to_string()).unwrap_or_default();
    shared
        .events
        .emit(session_event(EventKind::SessionOpen, session.id()).with("remote_address", remote));

    let (tx, rx) = broadcast::channel(shared.config.backpressure_capacity.max(1));
    let pump = tokio::spawn(pump_frames(
        reader,
        Arc::clone(&shared.framing),
        tx,
        session.cancel_token().clone(),
    ));

    let reason = consume(&shared, &session, rx, pump).await;

    shared.registry.remove(session.id());
    shared.middleware.on_disconnect(&session).await;
    shared
        .events
        .emit(session_event(EventKind::SessionClose, session.id()).with("reason", reason.as_str()));
    session.close_async().await;
    tracing::debug!(session_id = %session.id(), reason = reason.as_str(), "session closed");
}

/// Decode frames into `tx` until EOF, a framing error, or cancellation.
async fn pump_frames(
    reader: OwnedReadHalf,
    framing: Arc<dyn FramingStrategy>,
    tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<(), FrameError> {
    let mut frames = read_messages(reader, framing);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    // Only fails once the consumer is gone.
                    if tx.send(frame).is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

async fn consume(
    shared: &Shared,
    session: &Arc<Session>,
    mut rx: broadcast::Receiver<Bytes>,
    pump: tokio::task::JoinHandle<Result<(), FrameError>>,
) -> CloseReason {
    let cancel = session.cancel_token().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pump.abort();
                return cancelled(shared, session).await;
            }
            next = rx.recv() => next,
        };
        match next {
            Ok(frame) => {
                if let Some(reason) = process(shared, session, frame).await {
                    pump.abort();
                    return reason;
                }
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                tracing::debug!(
                    session_id = %session.id(),
                    dropped,
                    "consumer behind, dropped oldest messages"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    match pump.await {
        Ok(Ok(())) if cancel.is_cancelled() => cancelled(shared, session).await,
        Ok(Ok(())) => CloseReason::Complete,
        Ok(Err(e)) => {
            tracing::debug!(session_id = %session.id(), error = %e, "protocol error");
            shared.middleware.on_protocol_error(&e, session).await;
            shared.events.emit(
                session_event(EventKind::SessionError, session.id())
                    .with("error", e.to_string()),
            );
            CloseReason::Error
        }
        Err(e) => {
            tracing::error!(session_id = %session.id(), error = %e, "frame reader task failed");
            CloseReason::Error
        }
    }
}

// A keep-alive close is an idle timeout. Anything else closed the session locally.
async fn cancelled(shared: &Shared, session: &Arc<Session>) -> CloseReason {
    if !session.closed_for_idle() {
        return CloseReason::Cancel;
    }
    tracing::debug!(session_id = %session.id(), "idle timeout");
    shared.middleware.on_timeout(session).await;
    CloseReason::Timeout
}

/// Handle one message. Returns a close reason when the session must end.
async fn process(shared: &Shared, session: &Arc<Session>, frame: Bytes) -> Option<CloseReason> {
    session.touch();
    shared.events.emit(
        session_event(EventKind::MessageReceived, session.id())
            .with("message", String::from_utf8_lossy(&frame).into_owned())
            .with("length", frame.len()),
    );

    let request = Request::new(frame, Arc::clone(session));
    let response = AssertUnwindSafe(shared.handler.handle(request))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            tracing::error!(
                session_id = %session.id(),
                panic = %panic_message(panic.as_ref()),
                "request handler panicked"
            );
            None
        });

    if let Some(response) = response {
        match timeout(shared.config.write_timeout, session.send(response.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(SessionError::Closed)) => return Some(CloseReason::Cancel),
            Ok(Err(SessionError::Frame(FrameError::Io(e)))) => {
                tracing::debug!(session_id = %session.id(), error = %e, "response write failed");
                shared.events.emit(
                    session_event(EventKind::SessionError, session.id())
                        .with("error", e.to_string()),
                );
                return Some(CloseReason::Error);
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %session.id(), error = %e, "response dropped")
            }
            Err(_) => {
                tracing::debug!(session_id = %session.id(), "response write timed out");
                shared.events.emit(
                    session_event(EventKind::SessionError, session.id())
                        .with("error", "write timed out"),
                );
                return Some(CloseReason::Error);
            }
        }
    }

    if !shared.config.dispatch_delay.is_zero() {
        tokio::time::sleep(shared.config.dispatch_delay).await;
    }
    None
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`TcpServer`].
pub struct TcpServerBuilder {
    handler: Arc<dyn RequestHandler>,
    framing: Option<Arc<dyn FramingStrategy>>,
    middleware: Vec<Arc<dyn Middleware>>,
    events: Option<Arc<EventBus>>,
    config: ServerConfig,
}

impl TcpServerBuilder {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            handler,
            framing: None,
            middleware: Vec::new(),
            events: None,
            config: ServerConfig::default(),
        }
    }

    /// Framing for every connection. Default: line framing.
    pub fn framing(mut self, framing: Arc<dyn FramingStrategy>) -> Self {
        self.framing = Some(framing);
        self
    }

    /// Add middleware for the connect / disconnect / timeout / protocol-error hooks.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Share an event bus with the rest of the application.
    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TcpServer {
        let (shutdown_tx, _) = watch::channel(false);
        TcpServer {
            shared: Arc::new(Shared {
                handler: self.handler,
                framing: self.framing.unwrap_or_else(|| Arc::new(LineFraming::default())),
                middleware: MiddlewareChain::new(self.middleware),
                events: self.events.unwrap_or_default(),
                registry: Arc::new(SessionRegistry::new()),
                config: self.config,
            }),
            running: AtomicBool::new(false),
            shutdown_tx,
            connections: tokio::sync::Mutex::new(JoinSet::new()),
            monitor: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }
}
