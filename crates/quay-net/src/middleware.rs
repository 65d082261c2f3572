//! Ordered hooks around dispatch and connection lifecycle transitions.
//!
//! Every hook defaults to a no-op, so a [`Middleware`] implements only what
//! it cares about. [`MiddlewareChain`] runs each hook on every middleware in
//! registration order. A hook that fails or panics is reported to that same
//! middleware's `on_exception` and the chain carries on.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::framing::FrameError;
use crate::session::Session;

/// Hooks observing dispatch and connection lifecycle. All default to no-ops.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs after a handler is found, before arguments are resolved.
    async fn before_dispatch(
        &self,
        _payload: &Value,
        _session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the handler returned successfully.
    async fn after_dispatch(
        &self,
        _payload: &Value,
        _session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe a failure. `payload` is the request being dispatched, when
    /// there is one.
    async fn on_exception(
        &self,
        _error: &anyhow::Error,
        _payload: Option<&Value>,
        _session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A connection was accepted and its session registered.
    async fn on_connect(&self, _session: &Arc<Session>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disconnect(&self, _session: &Arc<Session>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The session was closed for inactivity.
    async fn on_timeout(&self, _session: &Arc<Session>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The inbound byte stream could not be framed.
    async fn on_protocol_error(
        &self,
        _error: &FrameError,
        _session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Middleware that does nothing. Used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMiddleware;

#[async_trait]
impl Middleware for NoopMiddleware {
    fn name(&self) -> &str {
        "noop"
    }
}

#[derive(Clone, Copy)]
enum Hook<'a> {
    BeforeDispatch(&'a Value),
    AfterDispatch(&'a Value),
    Connect,
    Disconnect,
    Timeout,
    ProtocolError(&'a FrameError),
}

impl<'a> Hook<'a> {
    fn name(self) -> &'static str {
        match self {
            Hook::BeforeDispatch(_) => "before_dispatch",
            Hook::AfterDispatch(_) => "after_dispatch",
            Hook::Connect => "on_connect",
            Hook::Disconnect => "on_disconnect",
            Hook::Timeout => "on_timeout",
            Hook::ProtocolError(_) => "on_protocol_error",
        }
    }

    fn payload(self) -> Option<&'a Value> {
        match self {
            Hook::BeforeDispatch(p) | Hook::AfterDispatch(p) => Some(p),
            _ => None,
        }
    }
}

async fn call_hook(
    mw: &dyn Middleware,
    hook: Hook<'_>,
    session: &Arc<Session>,
) -> anyhow::Result<()> {
    match hook {
        Hook::BeforeDispatch(p) => mw.before_dispatch(p, session).await,
        Hook::AfterDispatch(p) => mw.after_dispatch(p, session).await,
        Hook::Connect => mw.on_connect(session).await,
        Hook::Disconnect => mw.on_disconnect(session).await,
        Hook::Timeout => mw.on_timeout(session).await,
        Hook::ProtocolError(e) => mw.on_protocol_error(e, session).await,
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// An ordered, never-empty list of middleware.
#[derive(Clone)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Build a chain. An empty list becomes a single [`NoopMiddleware`].
    pub fn new(middleware: Vec<Arc<dyn Middleware>>) -> Self {
        if middleware.is_empty() {
            return Self::default();
        }
        Self { middleware }
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    pub async fn before_dispatch(&self, payload: &Value, session: &Arc<Session>) {
        self.run(Hook::BeforeDispatch(payload), session).await;
    }

    pub async fn after_dispatch(&self, payload: &Value, session: &Arc<Session>) {
        self.run(Hook::AfterDispatch(payload), session).await;
    }

    pub async fn on_connect(&self, session: &Arc<Session>) {
        self.run(Hook::Connect, session).await;
    }

    pub async fn on_disconnect(&self, session: &Arc<Session>) {
        self.run(Hook::Disconnect, session).await;
    }

    pub async fn on_timeout(&self, session: &Arc<Session>) {
        self.run(Hook::Timeout, session).await;
    }

    pub async fn on_protocol_error(&self, error: &FrameError, session: &Arc<Session>) {
        self.run(Hook::ProtocolError(error), session).await;
    }

    /// Report `error` to every middleware.
    pub async fn on_exception(
        &self,
        error: &anyhow::Error,
        payload: Option<&Value>,
        session: &Arc<Session>,
    ) {
        for mw in &self.middleware {
            Self::report(mw.as_ref(), error, payload, session).await;
        }
    }

    async fn run(&self, hook: Hook<'_>, session: &Arc<Session>) {
        for mw in &self.middleware {
            let outcome = AssertUnwindSafe(call_hook(mw.as_ref(), hook, session))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => {
                    anyhow::anyhow!("{} panicked: {}", hook.name(), panic_message(panic.as_ref()))
                }
            };
            tracing::debug!(
                middleware = mw.name(),
                hook = hook.name(),
                session_id = %session.id(),
                error = %error,
                "middleware hook failed"
            );
            Self::report(mw.as_ref(), &error, hook.payload(), session).await;
        }
    }

    // Failures inside on_exception are logged once and dropped.
    async fn report(
        mw: &dyn Middleware,
        error: &anyhow::Error,
        payload: Option<&Value>,
        session: &Arc<Session>,
    ) {
        let outcome = AssertUnwindSafe(mw.on_exception(error, payload, session))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    middleware = mw.name(),
                    session_id = %session.id(),
                    error = %e,
                    "on_exception hook failed"
                );
            }
            Err(panic) => {
                tracing::warn!(
                    middleware = mw.name(),
                    session_id = %session.id(),
                    panic = %panic_message(panic.as_ref()),
                    "on_exception hook panicked"
                );
            }
        }
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self {
            middleware: vec![Arc::new(NoopMiddleware)],
        }
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
