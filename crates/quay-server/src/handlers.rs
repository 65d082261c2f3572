//! Built-in `PING` and `BROADCAST` handlers for both dispatch modes.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use quay_config::DispatchMode;
use quay_net::{
    Args, CommandDispatcher, CommandRegistry, FrameError, Middleware, MiddlewareChain, ParamSpec,
    RequestHandler, Session, StructuredDispatcher, Validate,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Command-mode reply to `PING`.
pub const PONG: &str = "PONG";

/// Structured-mode reply to `PING`.
pub fn keep_alive_reply() -> String {
    json!({ "type": "keep-alive" }).to_string()
}

/// Chat message carried in the `message` field of a structured `BROADCAST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type", default = "BroadcastMessage::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub sender: String,
    pub content: String,
}

impl BroadcastMessage {
    fn default_kind() -> String {
        "message".to_owned()
    }
}

impl Validate for BroadcastMessage {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.content.trim().is_empty() {
            errors.push("content must not be blank".to_owned());
        }
        if self.sender.len() > 64 {
            errors.push("sender must be at most 64 characters".to_owned());
        }
        errors
    }
}

/// Request handler for the configured dispatch mode.
pub fn request_handler(
    mode: DispatchMode,
    middleware: &[Arc<dyn Middleware>],
) -> Arc<dyn RequestHandler> {
    match mode {
        DispatchMode::Command => {
            Arc::new(command_dispatcher(MiddlewareChain::new(middleware.to_vec())))
        }
        DispatchMode::Structured => Arc::new(structured_dispatcher(middleware)),
    }
}

pub fn command_dispatcher(middleware: MiddlewareChain) -> CommandDispatcher {
    let mut commands = CommandRegistry::new();
    commands
        .register("PING", |session: Arc<Session>, _args: Vec<String>| async move {
            session.send(PONG).await?;
            Ok::<_, anyhow::Error>(())
        })
        .register("BROADCAST", |session: Arc<Session>, args: Vec<String>| async move {
            anyhow::ensure!(!args.is_empty(), "BROADCAST needs a message");
            let delivered = session.broadcast(args.join(" ")).await;
            tracing::debug!(session_id = %session.id(), delivered, "broadcast sent");
            Ok::<_, anyhow::Error>(())
        });
    CommandDispatcher::new(commands, middleware)
}

pub fn structured_dispatcher(middleware: &[Arc<dyn Middleware>]) -> StructuredDispatcher {
    let builder = StructuredDispatcher::builder()
        .handler("command", "PING", vec![ParamSpec::session()], |args: Args| async move {
            let session = args.session(0).context("PING needs a session")?;
            session.send(keep_alive_reply()).await?;
            Ok::<_, anyhow::Error>(())
        })
        .handler(
            "command",
            "BROADCAST",
            vec![
                ParamSpec::field::<BroadcastMessage>("message")
                    .required()
                    .validated::<BroadcastMessage>(),
                ParamSpec::session(),
            ],
            |mut args: Args| async move {
                let message = args
                    .take::<BroadcastMessage>(0)
                    .context("BROADCAST needs a message")?;
                let session = args.session(1).context("BROADCAST needs a session")?;
                let delivered = session.broadcast(serde_json::to_vec(&message)?).await;
                tracing::debug!(
                    session_id = %session.id(),
                    sender = %message.sender,
                    delivered,
                    "broadcast sent"
                );
                Ok::<_, anyhow::Error>(())
            },
        );
    middleware
        .iter()
        .fold(builder, |builder, m| builder.middleware(Arc::clone(m)))
        .build()
}

/// Logs connection lifecycle and dispatch failures.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_connect(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        tracing::info!(
            session_id = %session.id(),
            peer = ?session.remote_addr(),
            "client connected"
        );
        Ok(())
    }

    async fn on_disconnect(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        tracing::info!(session_id = %session.id(), "client disconnected");
        Ok(())
    }

    async fn on_timeout(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        tracing::info!(session_id = %session.id(), "client idle, closing");
        Ok(())
    }

    async fn on_protocol_error(
        &self,
        error: &FrameError,
        session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        tracing::warn!(session_id = %session.id(), error = %error, "protocol error");
        Ok(())
    }

    async fn on_exception(
        &self,
        error: &anyhow::Error,
        payload: Option<&Value>,
        session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        tracing::warn!(session_id = %session.id(), error = %error, ?payload, "dispatch failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use quay_net::{FramingStrategy, LineFraming, SessionId, SessionRegistry, read_messages};
    use tokio::io::{DuplexStream, duplex};

    fn connect(registry: &Arc<SessionRegistry>) -> (Arc<Session>, DuplexStream) {
        let framing: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let (local, peer) = duplex(4096);
        let session = Session::new(SessionId::random(), None, local, framing, registry);
        registry.insert(Arc::clone(&session));
        (session, peer)
    }

    async fn next_line(peer: DuplexStream) -> String {
        let mut frames = read_messages(peer, Arc::new(LineFraming::default()));
        String::from_utf8(frames.next().await.unwrap().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_command_ping_replies_pong() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, peer) = connect(&registry);
        command_dispatcher(MiddlewareChain::default()).dispatch("ping", &session).await;
        assert_eq!(next_line(peer).await, PONG);
    }

    #[tokio::test]
    async fn test_command_broadcast_reaches_everyone() {
        let registry = Arc::new(SessionRegistry::new());
        let (alice, alice_peer) = connect(&registry);
        let (_bob, bob_peer) = connect(&registry);
        command_dispatcher(MiddlewareChain::default())
            .dispatch("BROADCAST hello world", &alice)
            .await;
        assert_eq!(next_line(alice_peer).await, "hello world");
        assert_eq!(next_line(bob_peer).await, "hello world");
    }

    #[tokio::test]
    async fn test_structured_ping_and_broadcast() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, peer) = connect(&registry);
        let (_other, other_peer) = connect(&registry);
        let dispatcher = structured_dispatcher(&[]);

        let reply = dispatcher
            .dispatch(br#"{"type":"command","command":"PING","args":[]}"#, &session)
            .await;
        assert!(reply.is_none());

        let payload = json!({
            "type": "command",
            "command": "broadcast",
            "message": { "type": "message", "sender": "py", "content": "hi all" }
        });
        let reply = dispatcher.dispatch(payload.to_string().as_bytes(), &session).await;
        assert!(reply.is_none());

        let mut frames = read_messages(peer, Arc::new(LineFraming::default()));
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(String::from_utf8_lossy(&first), keep_alive_reply());

        let received: BroadcastMessage =
            serde_json::from_str(&next_line(other_peer).await).unwrap();
        assert_eq!(received.content, "hi all");
        assert_eq!(received.sender, "py");
    }

    #[tokio::test]
    async fn test_structured_broadcast_validates_message() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, _peer) = connect(&registry);
        let payload = json!({
            "type": "command",
            "command": "BROADCAST",
            "message": { "content": "  " }
        });

        let reply = structured_dispatcher(&[])
            .dispatch(payload.to_string().as_bytes(), &session)
            .await
            .unwrap();
        let reply: Value = serde_json::from_slice(reply.as_bytes()).unwrap();
        assert_eq!(reply["message"], "Validation failed");
        assert_eq!(reply["errors"], json!(["message: content must not be blank"]));
    }
}
