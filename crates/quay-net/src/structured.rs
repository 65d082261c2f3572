//! Structured-mode dispatch: JSON objects routed by `type` and `command`.
//!
//! ```text
//! {"type": "chat", "command": "say", "text": "hi"}
//!          |                 |
//!          handler group     handler within the group
//! ```
//!
//! Once a handler is found its parameters are resolved, validated and the
//! handler is invoked. Every failure along the way becomes an
//! [`ErrorResponse`] for the peer; the connection stays open.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::middleware::{Middleware, MiddlewareChain, panic_message};
use crate::request::{Request, RequestHandler, Response};
use crate::resolver::{ArgumentResolver, Args, ParamSpec, ResolveContext, ResolverRegistry};
use crate::session::Session;
use crate::validation::{ConstraintValidator, ParameterValidator};

/// Value of the `type` field in every error response.
pub const VALIDATION_ERROR: &str = "validation_error";

/// Error reply sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_errors(message, Vec::new())
    }

    pub fn with_errors(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            kind: VALIDATION_ERROR.to_owned(),
            message: message.into(),
            errors,
        }
    }

    pub fn to_response(&self) -> Response {
        match serde_json::to_vec(self) {
            Ok(bytes) => Response::from(bytes),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode error response");
                Response::from(r#"{"type":"validation_error","message":"Dispatcher error"}"#)
            }
        }
    }
}

/// Handler for one (type, command) pair, called with resolved and validated arguments.
#[async_trait]
pub trait StructuredHandler: Send + Sync {
    async fn invoke(&self, args: Args) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> StructuredHandler for F
where
    F: Fn(Args) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn invoke(&self, args: Args) -> anyhow::Result<()> {
        (self)(args).await
    }
}

/// A registered (type, command) handler and its parameter list.
pub struct HandlerDescriptor {
    type_name: String,
    command: String,
    params: Vec<ParamSpec>,
    handler: Arc<dyn StructuredHandler>,
}

impl HandlerDescriptor {
    pub fn new(
        type_name: impl Into<String>,
        command: impl Into<String>,
        params: Vec<ParamSpec>,
        handler: impl StructuredHandler + 'static,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            command: command.into(),
            params,
            handler: Arc::new(handler),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("type_name", &self.type_name)
            .field("command", &self.command)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Handlers grouped by lower-cased type, then lower-cased command.
#[derive(Debug, Default)]
struct HandlerTable {
    groups: HashMap<String, HashMap<String, Arc<HandlerDescriptor>>>,
}

impl HandlerTable {
    fn insert(&mut self, descriptor: HandlerDescriptor) {
        let group = descriptor.type_name.to_lowercase();
        let command = descriptor.command.to_lowercase();
        let previous = self
            .groups
            .entry(group)
            .or_default()
            .insert(command, Arc::new(descriptor));
        if let Some(previous) = previous {
            tracing::warn!(
                kind = previous.type_name.as_str(),
                command = previous.command.as_str(),
                "structured handler replaced"
            );
        }
    }

    fn find(&self, type_name: &str, command: &str) -> Option<Arc<HandlerDescriptor>> {
        self.groups
            .get(&type_name.to_lowercase())?
            .get(&command.to_lowercase())
            .cloned()
    }

    fn len(&self) -> usize {
        self.groups.values().map(HashMap::len).sum()
    }
}

/// Read a routing key. Non-string values use their JSON text; `null`
/// counts as missing.
fn routing_key(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// [`RequestHandler`] for structured mode.
#[derive(Clone)]
pub struct StructuredDispatcher {
    handlers: Arc<HandlerTable>,
    resolvers: Arc<ResolverRegistry>,
    validator: Arc<dyn ParameterValidator>,
    middleware: MiddlewareChain,
}

impl StructuredDispatcher {
    /// Start registering handlers.
    pub fn builder() -> StructuredDispatcherBuilder {
        StructuredDispatcherBuilder::default()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    /// Route one raw message. Returns an error reply, or `None` when the
    /// handler ran successfully.
    pub async fn dispatch(&self, message: &[u8], session: &Arc<Session>) -> Option<Response> {
        let payload = match serde_json::from_slice::<Value>(message) {
            Ok(payload @ Value::Object(_)) => payload,
            Ok(_) => {
                let error = ErrorResponse::new("Malformed payload: expected a JSON object");
                return Some(error.to_response());
            }
            Err(e) => {
                return Some(ErrorResponse::new(format!("Malformed payload: {e}")).to_response());
            }
        };

        let Some(type_name) = routing_key(&payload, "type") else {
            return Some(ErrorResponse::new("Missing 'type' field").to_response());
        };
        let Some(command) = routing_key(&payload, "command") else {
            return Some(ErrorResponse::new("Missing 'command' field").to_response());
        };

        let Some(descriptor) = self.handlers.find(&type_name, &command) else {
            let error = anyhow::anyhow!("No handler found for command: {command}");
            tracing::debug!(
                session_id = %session.id(),
                kind = %type_name,
                command = %command,
                "no structured handler"
            );
            self.middleware.on_exception(&error, Some(&payload), session).await;
            return Some(ErrorResponse::new(error.to_string()).to_response());
        };

        self.middleware.before_dispatch(&payload, session).await;

        let ctx = ResolveContext {
            payload: &payload,
            session,
        };
        let resolved = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.resolvers.resolve_all(descriptor.params(), &ctx)
        }))
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("resolver panicked: {}", panic_message(panic.as_ref())))
        });
        let args = match resolved {
            Ok(args) => args,
            Err(e) => return Some(self.invocation_failed(e, &payload, session).await),
        };

        let violations = self.validator.validate_parameters(descriptor.params(), &args);
        if !violations.is_empty() {
            tracing::debug!(
                session_id = %session.id(),
                command = %command,
                ?violations,
                "validation failed"
            );
            return Some(ErrorResponse::with_errors("Validation failed", violations).to_response());
        }

        let outcome = AssertUnwindSafe(descriptor.handler.invoke(args))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
            });

        match outcome {
            Ok(()) => {
                self.middleware.after_dispatch(&payload, session).await;
                None
            }
            Err(e) => Some(self.invocation_failed(e, &payload, session).await),
        }
    }

    async fn invocation_failed(
        &self,
        error: anyhow::Error,
        payload: &Value,
        session: &Arc<Session>,
    ) -> Response {
        tracing::error!(session_id = %session.id(), error = ?error, "structured handler failed");
        self.middleware.on_exception(&error, Some(payload), session).await;
        ErrorResponse::new(format!("Invocation failed: {error:?}")).to_response()
    }
}

#[async_trait]
impl RequestHandler for StructuredDispatcher {
    async fn handle(&self, request: Request) -> Option<Response> {
        self.dispatch(request.bytes(), request.session()).await
    }
}

impl std::fmt::Debug for StructuredDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredDispatcher")
            .field("handlers", &self.handlers.len())
            .field("resolvers", &self.resolvers)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

/// Builder for [`StructuredDispatcher`].
pub struct StructuredDispatcherBuilder {
    handlers: HandlerTable,
    resolvers: ResolverRegistry,
    validator: Arc<dyn ParameterValidator>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Default for StructuredDispatcherBuilder {
    fn default() -> Self {
        Self {
            handlers: HandlerTable::default(),
            resolvers: ResolverRegistry::default(),
            validator: Arc::new(ConstraintValidator),
            middleware: Vec::new(),
        }
    }
}

impl StructuredDispatcherBuilder {
    /// Register a handler for (`type_name`, `command`).
    pub fn handler(
        mut self,
        type_name: &str,
        command: &str,
        params: Vec<ParamSpec>,
        handler: impl StructuredHandler + 'static,
    ) -> Self {
        self.handlers
            .insert(HandlerDescriptor::new(type_name, command, params, handler));
        self
    }

    pub fn descriptor(mut self, descriptor: HandlerDescriptor) -> Self {
        self.handlers.insert(descriptor);
        self
    }

    /// Add a resolver after the built-ins. Duplicate names are ignored.
    pub fn resolver(mut self, resolver: Arc<dyn ArgumentResolver>) -> Self {
        self.resolvers.register(resolver);
        self
    }

    /// Replace the resolver list entirely.
    pub fn resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ParameterValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> StructuredDispatcher {
        StructuredDispatcher {
            handlers: Arc::new(self.handlers),
            resolvers: Arc::new(self.resolvers),
            validator: self.validator,
            middleware: MiddlewareChain::new(self.middleware),
        }
    }
}
