//! TCP application server: message framing, sessions, lifecycle events,
//! idle detection, and command or structured-JSON dispatch.

pub mod command;
pub mod events;
pub mod framing;
pub mod keepalive;
pub mod middleware;
pub mod platform;
pub mod request;
pub mod resolver;
pub mod session;
pub mod structured;
pub mod tcp_server;
pub mod validation;

pub use command::{CommandDispatcher, CommandHandler, CommandRegistry, parse_command};
pub use events::{Event, EventBus, EventKind, EventSource, EventSubscription};
pub use framing::{
    DecodeState, DelimiterFraming, FrameConfig, FrameError, FramingKind, FramingStrategy,
    LengthPrefixedFraming, LineFraming, read_messages, write_message,
};
pub use keepalive::{KEEPALIVE_TIMEOUT_NOTICE, KeepAliveMonitor};
pub use middleware::{Middleware, MiddlewareChain, NoopMiddleware};
pub use platform::SocketOptions;
pub use request::{Request, RequestHandler, Response, handler_fn};
pub use resolver::{
    ArgValue, Args, ArgumentResolver, ParamKind, ParamSpec, ResolveContext, ResolverRegistry,
};
pub use session::{Session, SessionError, SessionId, SessionRegistry};
pub use structured::{ErrorResponse, HandlerDescriptor, StructuredDispatcher, StructuredHandler};
pub use tcp_server::{CloseReason, ServerConfig, ServerError, TcpServer, TcpServerBuilder};
pub use validation::{ConstraintValidator, ParameterValidator, Validate};
