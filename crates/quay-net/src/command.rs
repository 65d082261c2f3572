//! Command-mode dispatch: `NAME arg1 arg2 ...` text lines.
//!
//! The first whitespace-separated token selects a handler by name
//! (case-insensitive); the rest are passed through as positional string
//! arguments. Handlers reply through the session themselves, so this
//! dispatcher never produces a response.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;

use crate::middleware::{MiddlewareChain, panic_message};
use crate::request::{Request, RequestHandler, Response};
use crate::session::Session;

/// Handler for one command-mode verb. Receives the whitespace-split arguments.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, session: Arc<Session>, args: Vec<String>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Arc<Session>, Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, session: Arc<Session>, args: Vec<String>) -> anyhow::Result<()> {
        (self)(session, args).await
    }
}

/// Command name to handler table. Names are stored upper-cased.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, handler: impl CommandHandler + 'static) -> &mut Self {
        let key = name.to_uppercase();
        if self.handlers.insert(key.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(command = %key, "command handler replaced");
        }
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&name.to_uppercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Split a command line into its name and positional arguments.
///
/// Returns `None` for a blank line.
pub fn parse_command(line: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next()?.to_owned();
    Some((name, tokens.map(str::to_owned).collect()))
}

/// [`RequestHandler`] for command mode.
#[derive(Clone)]
pub struct CommandDispatcher {
    commands: Arc<CommandRegistry>,
    middleware: MiddlewareChain,
}

impl CommandDispatcher {
    pub fn new(commands: CommandRegistry, middleware: MiddlewareChain) -> Self {
        Self {
            commands: Arc::new(commands),
            middleware,
        }
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Run one command line for `session`.
    pub async fn dispatch(&self, line: &str, session: &Arc<Session>) {
        let Some((name, args)) = parse_command(line) else {
            tracing::debug!(session_id = %session.id(), "ignoring blank command line");
            return;
        };

        let Some(handler) = self.commands.get(&name) else {
            tracing::warn!(
                session_id = %session.id(),
                command = %name,
                "no handler registered for command"
            );
            return;
        };

        let payload = json!({ "command": name, "args": args });
        self.middleware.before_dispatch(&payload, session).await;

        let outcome = AssertUnwindSafe(handler.call(Arc::clone(session), args))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
            });

        match outcome {
            Ok(()) => self.middleware.after_dispatch(&payload, session).await,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id(),
                    command = %name,
                    error = ?e,
                    "command handler failed"
                );
                self.middleware.on_exception(&e, Some(&payload), session).await;
            }
        }
    }
}

#[async_trait]
impl RequestHandler for CommandDispatcher {
    async fn handle(&self, request: Request) -> Option<Response> {
        let line = request.text();
        self.dispatch(&line, request.session()).await;
        None
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("commands", &self.commands.names())
            .field("middleware", &self.middleware)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Middleware;
    use crate::session::test_session;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::Value;

    type Calls = Arc<Mutex<Vec<(String, Vec<String>)>>>;

    fn recording(calls: &Calls, name: &'static str) -> impl CommandHandler + 'static {
        let calls = Arc::clone(calls);
        move |_session: Arc<Session>, args: Vec<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push((name.to_owned(), args));
                Ok::<_, anyhow::Error>(())
            }
        }
    }

    fn request(text: &'static str, session: &Arc<Session>) -> Request {
        Request::new(Bytes::from_static(text.as_bytes()), Arc::clone(session))
    }

    #[tokio::test]
    async fn test_ping_gets_empty_args() {
        let calls: Calls = Arc::default();
        let mut commands = CommandRegistry::new();
        commands.register("PING", recording(&calls, "PING"));
        let dispatcher = CommandDispatcher::new(commands, MiddlewareChain::default());
        let (session, _registry, _peer) = test_session();

        let response = dispatcher.handle(request("PING", &session)).await;

        assert!(response.is_none());
        assert_eq!(*calls.lock(), vec![("PING".to_owned(), Vec::<String>::new())]);
    }

    #[tokio::test]
    async fn test_arguments_are_split_on_whitespace() {
        let calls: Calls = Arc::default();
        let mut commands = CommandRegistry::new();
        commands.register("BROADCAST", recording(&calls, "BROADCAST"));
        let dispatcher = CommandDispatcher::new(commands, MiddlewareChain::default());
        let (session, _registry, _peer) = test_session();

        dispatcher.handle(request("  broadcast   hello\tworld ", &session)).await;

        assert_eq!(
            *calls.lock(),
            vec![("BROADCAST".to_owned(), vec!["hello".to_owned(), "world".to_owned()])]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let dispatcher = CommandDispatcher::new(CommandRegistry::new(), MiddlewareChain::default());
        let (session, _registry, _peer) = test_session();

        assert!(dispatcher.handle(request("NOPE 1 2", &session)).await.is_none());
        assert!(dispatcher.handle(request("   ", &session)).await.is_none());
    }

    struct Observer(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Observer {
        async fn before_dispatch(
            &self,
            payload: &Value,
            _session: &Arc<Session>,
        ) -> anyhow::Result<()> {
            self.0.lock().push(format!("before {}", payload["command"]));
            Ok(())
        }

        async fn after_dispatch(
            &self,
            _payload: &Value,
            _session: &Arc<Session>,
        ) -> anyhow::Result<()> {
            self.0.lock().push("after".into());
            Ok(())
        }

        async fn on_exception(
            &self,
            error: &anyhow::Error,
            _payload: Option<&Value>,
            _session: &Arc<Session>,
        ) -> anyhow::Result<()> {
            self.0.lock().push(format!("exception {error}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_failure_reaches_middleware() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut commands = CommandRegistry::new();
        commands.register("fail", |_s: Arc<Session>, _a: Vec<String>| async {
            Err::<(), _>(anyhow::anyhow!("disk on fire"))
        });
        commands.register("ok", |_s: Arc<Session>, _a: Vec<String>| async {
            Ok::<_, anyhow::Error>(())
        });
        let chain = MiddlewareChain::new(vec![Arc::new(Observer(Arc::clone(&seen)))]);
        let dispatcher = CommandDispatcher::new(commands, chain);
        let (session, _registry, _peer) = test_session();

        assert!(dispatcher.handle(request("FAIL", &session)).await.is_none());
        dispatcher.handle(request("ok", &session)).await;

        assert_eq!(
            *seen.lock(),
            vec!["before \"FAIL\"", "exception disk on fire", "before \"ok\"", "after"]
        );
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let mut commands = CommandRegistry::new();
        commands.register("CRASH", |_s: Arc<Session>, _a: Vec<String>| async {
            if true {
                panic!("bad handler");
            }
            Ok::<_, anyhow::Error>(())
        });
        let dispatcher = CommandDispatcher::new(commands, MiddlewareChain::default());
        let (session, _registry, _peer) = test_session();

        assert!(dispatcher.handle(request("crash", &session)).await.is_none());
    }

    #[test]
    fn test_registry_is_case_insensitive() {
        let mut commands = CommandRegistry::new();
        commands.register("Ping", |_s: Arc<Session>, _a: Vec<String>| async {
            Ok::<_, anyhow::Error>(())
        });
        assert!(commands.get("PING").is_some());
        assert!(commands.get("ping").is_some());
        assert_eq!(commands.names(), vec!["PING"]);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("SAY hi there"),
            Some(("SAY".to_owned(), vec!["hi".to_owned(), "there".to_owned()]))
        );
        assert_eq!(parse_command(""), None);
    }
}
