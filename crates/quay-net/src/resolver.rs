//! Argument resolution for structured handlers.
//!
//! A handler declares its parameters as a list of [`ParamSpec`]s. For each
//! parameter the [`ResolverRegistry`] asks its resolvers, in registration
//! order, whether they [`supports`](ArgumentResolver::supports) it and uses
//! the first one that does. Parameters nobody supports resolve to
//! [`ArgValue::Absent`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::session::{Session, SessionId};
use crate::validation::Validate;

type Converter =
    Arc<dyn Fn(Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> + Send + Sync>;
type Checker = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Vec<String> + Send + Sync>;

/// Where a parameter's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// The session the request arrived on.
    Session,
    /// The id of that session.
    SessionId,
    /// A named top-level field of the payload.
    Field(String),
    /// The whole payload.
    Body,
    /// Left to an application-registered resolver.
    Custom(String),
}

/// Declared shape of one handler parameter.
#[derive(Clone)]
pub struct ParamSpec {
    name: String,
    kind: ParamKind,
    convert: Option<Converter>,
    check: Option<Checker>,
    required: bool,
}

fn converter<T: DeserializeOwned + Send + Sync + 'static>() -> Converter {
    Arc::new(|value: Value| -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> {
        let typed: T = serde_json::from_value(value)?;
        Ok(Box::new(typed) as Box<dyn Any + Send + Sync>)
    })
}

impl ParamSpec {
    fn new(name: impl Into<String>, kind: ParamKind, convert: Option<Converter>) -> Self {
        Self {
            name: name.into(),
            kind,
            convert,
            check: None,
            required: false,
        }
    }

    pub fn session() -> Self {
        Self::new("session", ParamKind::Session, None)
    }

    pub fn session_id() -> Self {
        Self::new("session_id", ParamKind::SessionId, None)
    }

    /// The payload field `name`, deserialized as `T`.
    pub fn field<T: DeserializeOwned + Send + Sync + 'static>(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), ParamKind::Field(name), Some(converter::<T>()))
    }

    /// The whole payload, deserialized as `T`.
    pub fn body<T: DeserializeOwned + Send + Sync + 'static>() -> Self {
        Self::new("body", ParamKind::Body, Some(converter::<T>()))
    }

    /// A parameter only a custom resolver knows how to produce.
    pub fn custom(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self::new(tag.clone(), ParamKind::Custom(tag), None)
    }

    /// Reject the request when this parameter resolves to nothing.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Run `T`'s [`Validate`] constraints on the resolved value.
    ///
    /// `T` must be the type the parameter resolves to.
    pub fn validated<T: Validate + Send + Sync + 'static>(mut self) -> Self {
        self.check = Some(Arc::new(|value: &(dyn Any + Send + Sync)| {
            match value.downcast_ref::<T>() {
                Some(v) => v.validate(),
                None => vec!["has an unexpected type".to_owned()],
            }
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParamKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Deserialize `value` into the declared type.
    ///
    /// Parameters declared without a type keep the raw JSON value.
    pub fn convert(&self, value: Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> {
        match &self.convert {
            Some(convert) => convert(value),
            None => Ok(Box::new(value)),
        }
    }

    /// Constraint violations for a resolved value.
    pub fn check(&self, value: &(dyn Any + Send + Sync)) -> Vec<String> {
        self.check.as_ref().map(|check| check(value)).unwrap_or_default()
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("validated", &self.check.is_some())
            .finish()
    }
}

/// A resolved parameter value.
pub enum ArgValue {
    Session(Arc<Session>),
    SessionId(SessionId),
    Value(Box<dyn Any + Send + Sync>),
    Absent,
}

impl ArgValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, ArgValue::Absent)
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Session(s) => f.debug_tuple("Session").field(s.id()).finish(),
            ArgValue::SessionId(id) => f.debug_tuple("SessionId").field(id).finish(),
            ArgValue::Value(_) => f.write_str("Value(..)"),
            ArgValue::Absent => f.write_str("Absent"),
        }
    }
}

/// What a resolver gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub payload: &'a Value,
    pub session: &'a Arc<Session>,
}

pub trait ArgumentResolver: Send + Sync {
    /// Unique name; the registry keeps one resolver per name.
    fn name(&self) -> &str;

    fn supports(&self, param: &ParamSpec) -> bool;

    fn resolve(&self, param: &ParamSpec, ctx: &ResolveContext<'_>) -> anyhow::Result<ArgValue>;
}

/// Injects the session.
#[derive(Debug, Default)]
pub struct SessionResolver;

impl ArgumentResolver for SessionResolver {
    fn name(&self) -> &str {
        "session"
    }

    fn supports(&self, param: &ParamSpec) -> bool {
        matches!(param.kind, ParamKind::Session)
    }

    fn resolve(&self, _param: &ParamSpec, ctx: &ResolveContext<'_>) -> anyhow::Result<ArgValue> {
        Ok(ArgValue::Session(Arc::clone(ctx.session)))
    }
}

/// Extracts a named payload field. Missing and `null` fields are absent.
#[derive(Debug, Default)]
pub struct FieldResolver;

impl ArgumentResolver for FieldResolver {
    fn name(&self) -> &str {
        "field"
    }

    fn supports(&self, param: &ParamSpec) -> bool {
        matches!(param.kind, ParamKind::Field(_))
    }

    fn resolve(&self, param: &ParamSpec, ctx: &ResolveContext<'_>) -> anyhow::Result<ArgValue> {
        let ParamKind::Field(key) = &param.kind else {
            return Ok(ArgValue::Absent);
        };
        match ctx.payload.get(key) {
            None | Some(Value::Null) => Ok(ArgValue::Absent),
            Some(value) => {
                let typed = param
                    .convert(value.clone())
                    .with_context(|| format!("field '{key}' has the wrong shape"))?;
                Ok(ArgValue::Value(typed))
            }
        }
    }
}

/// Converts the whole payload.
#[derive(Debug, Default)]
pub struct BodyResolver;

impl ArgumentResolver for BodyResolver {
    fn name(&self) -> &str {
        "body"
    }

    fn supports(&self, param: &ParamSpec) -> bool {
        matches!(param.kind, ParamKind::Body)
    }

    fn resolve(&self, param: &ParamSpec, ctx: &ResolveContext<'_>) -> anyhow::Result<ArgValue> {
        let typed = param
            .convert(ctx.payload.clone())
            .context("payload does not match the handler's body type")?;
        Ok(ArgValue::Value(typed))
    }
}

/// Injects the session id.
#[derive(Debug, Default)]
pub struct SessionIdResolver;

impl ArgumentResolver for SessionIdResolver {
    fn name(&self) -> &str {
        "session_id"
    }

    fn supports(&self, param: &ParamSpec) -> bool {
        matches!(param.kind, ParamKind::SessionId)
    }

    fn resolve(&self, _param: &ParamSpec, ctx: &ResolveContext<'_>) -> anyhow::Result<ArgValue> {
        Ok(ArgValue::SessionId(ctx.session.id().clone()))
    }
}

/// Ordered, name-deduplicated list of resolvers.
#[derive(Clone)]
pub struct ResolverRegistry {
    resolvers: Vec<Arc<dyn ArgumentResolver>>,
}

impl ResolverRegistry {
    /// A registry with no resolvers at all.
    pub fn empty() -> Self {
        Self { resolvers: Vec::new() }
    }

    /// Append a resolver. Returns `false` (and keeps the existing one) if a
    /// resolver with the same name is already registered.
    pub fn register(&mut self, resolver: Arc<dyn ArgumentResolver>) -> bool {
        if self.resolvers.iter().any(|r| r.name() == resolver.name()) {
            tracing::debug!(resolver = resolver.name(), "duplicate resolver ignored");
            return false;
        }
        self.resolvers.push(resolver);
        true
    }

    pub fn names(&self) -> Vec<&str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// Resolve one parameter with the first resolver that supports it.
    pub fn resolve(&self, param: &ParamSpec, ctx: &ResolveContext<'_>) -> anyhow::Result<ArgValue> {
        match self.resolvers.iter().find(|r| r.supports(param)) {
            Some(resolver) => resolver
                .resolve(param, ctx)
                .with_context(|| {
                    let (resolver, param) = (resolver.name(), param.name());
                    format!("resolver '{resolver}' failed for parameter '{param}'")
                }),
            None => Ok(ArgValue::Absent),
        }
    }

    /// Resolve every parameter, stopping at the first failure.
    pub fn resolve_all(
        &self,
        params: &[ParamSpec],
        ctx: &ResolveContext<'_>,
    ) -> anyhow::Result<Args> {
        let values = params
            .iter()
            .map(|p| self.resolve(p, ctx))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Args { values })
    }
}

impl Default for ResolverRegistry {
    /// The built-in resolvers: session, field, body, session id.
    fn default() -> Self {
        Self {
            resolvers: vec![
                Arc::new(SessionResolver),
                Arc::new(FieldResolver),
                Arc::new(BodyResolver),
                Arc::new(SessionIdResolver),
            ],
        }
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Resolved arguments, positionally matching the handler's parameters.
#[derive(Debug, Default)]
pub struct Args {
    values: Vec<ArgValue>,
}

impl Args {
    pub fn new(values: Vec<ArgValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn raw(&self, index: usize) -> Option<&ArgValue> {
        self.values.get(index)
    }

    pub fn session(&self, index: usize) -> Option<Arc<Session>> {
        match self.values.get(index) {
            Some(ArgValue::Session(s)) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    pub fn session_id(&self, index: usize) -> Option<&SessionId> {
        match self.values.get(index) {
            Some(ArgValue::SessionId(id)) => Some(id),
            _ => None,
        }
    }

    /// Borrow a typed value. `None` if absent or of another type.
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        match self.values.get(index) {
            Some(ArgValue::Value(v)) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Move a typed value out, leaving the slot absent.
    pub fn take<T: Any>(&mut self, index: usize) -> Option<T> {
        let slot = self.values.get_mut(index)?;
        match std::mem::replace(slot, ArgValue::Absent) {
            ArgValue::Value(v) => match v.downcast::<T>() {
                Ok(v) => Some(*v),
                Err(v) => {
                    *slot = ArgValue::Value(v);
                    None
                }
            },
            other => {
                *slot = other;
                None
            }
        }
    }
}
