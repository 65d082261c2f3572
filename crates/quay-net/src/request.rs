//! Request/response records and the handler seam between the server and
//! a dispatch engine.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::session::Session;

/// One inbound message together with the session it arrived on.
#[derive(Debug, Clone)]
pub struct Request {
    bytes: Bytes,
    session: Arc<Session>,
}

impl Request {
    pub fn new(bytes: Bytes, session: Arc<Session>) -> Self {
        Self { bytes, session }
    }

    /// The raw message payload, without framing.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The message decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// An outbound message the server writes back to the requesting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response(Bytes);

impl Response {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<String> for Response {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&'static str> for Response {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Vec<u8>> for Response {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

/// Turns a request into an optional response.
///
/// The server calls `handle` once per message and waits for it before
/// pulling the next message off the same connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one message. `None` means nothing is written back.
    async fn handle(&self, request: Request) -> Option<Response>;
}

/// Adapter returned by [`handler_fn`].
#[derive(Debug, Clone)]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Option<Response> {
        (self.0)(request).await
    }
}

/// Use an async closure as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    FnHandler(f)
}
