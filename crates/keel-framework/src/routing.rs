//! Route registration and matching.
//!
//! The [`Router`] keeps two ordered tables: HTTP routes (verb + path
//! pattern) and event consumers (event name). Matching is a linear scan in
//! registration order and the first full match wins.
//!
//! # Path patterns
//!
//! A pattern is a `/`-separated list of literal segments and named
//! segments prefixed with `:`:
//!
//! ```text
//! /users/:id/posts/:post
//! ```
//!
//! Literal segments must match exactly. Named segments bind the concrete
//! segment in declared left-to-right order; that order is what positional
//! [`PathValue`](crate::extract::PathValue) binding follows.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use keel_core::{ExecutionContext, Input, PathParams, TypeKey, Verb};
use tracing::{debug, warn};

use crate::error::{RegistryError, RegistryResult, RouteError};
use crate::handler::HandlerMeta;
use crate::interceptor::InterceptorRef;

// =============================================================================
// PathPattern
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parses `pattern`, rejecting empty or duplicate segment names.
    pub fn parse(pattern: &str) -> RegistryResult<Self> {
        let invalid = |reason| RegistryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut seen = HashSet::new();
        let mut segments = Vec::new();
        for segment in split_path(pattern) {
            match segment.strip_prefix(':') {
                Some("") => return Err(invalid("empty parameter name")),
                Some(name) => {
                    if !seen.insert(name) {
                        return Err(invalid("duplicate parameter name"));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(segment.to_string())),
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Named segments in declared order.
    pub fn keys(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Param(name) => Some(name.clone()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Matches a concrete path segment by segment.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let mut concrete = split_path(path);
        let mut params = PathParams::new();
        for segment in &self.segments {
            let value = concrete.next()?;
            match segment {
                Segment::Literal(literal) if literal == value => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => params.push(name.as_str(), value),
            }
        }
        concrete.next().is_none().then_some(params)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

// =============================================================================
// Entries
// =============================================================================

/// Identifies a registered route or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteId {
    Http(usize),
    Event(usize),
}

/// One HTTP route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub verb: Verb,
    pub pattern: PathPattern,
    pub meta: Arc<HandlerMeta>,
    /// Interceptors that apply to this route in addition to the global ones.
    pub interceptors: Vec<InterceptorRef>,
}

/// One event consumer.
#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub event: String,
    pub meta: Arc<HandlerMeta>,
    pub interceptors: Vec<InterceptorRef>,
}

/// A successful match.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub id: RouteId,
    pub meta: &'a Arc<HandlerMeta>,
    /// Bound path values (empty for events).
    pub params: PathParams,
    /// The pattern's named segments in declared order (empty for events).
    pub path_keys: Vec<String>,
}

// =============================================================================
// Router
// =============================================================================

/// Ordered route and consumer tables.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<RouteEntry>,
    consumers: Vec<ConsumerEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an HTTP route.
    pub fn register(
        &mut self,
        verb: Verb,
        pattern: &str,
        meta: HandlerMeta,
    ) -> RegistryResult<RouteId> {
        self.register_with(verb, pattern, meta, Vec::new())
    }

    /// Appends an HTTP route with its own interceptors.
    pub fn register_with(
        &mut self,
        verb: Verb,
        pattern: &str,
        meta: HandlerMeta,
        interceptors: Vec<InterceptorRef>,
    ) -> RegistryResult<RouteId> {
        let pattern = PathPattern::parse(pattern)?;
        check_path_arity(&meta, pattern.as_str(), pattern.keys().len())?;

        if self
            .routes
            .iter()
            .any(|route| route.verb == verb && route.pattern == pattern)
        {
            warn!(
                %verb,
                pattern = %pattern,
                "Duplicate route registered, first registration wins"
            );
        }

        debug!(%verb, pattern = %pattern, handler = %meta.method(), "Route registered");
        self.routes.push(RouteEntry {
            verb,
            pattern,
            meta: Arc::new(meta),
            interceptors,
        });
        Ok(RouteId::Http(self.routes.len() - 1))
    }

    /// Appends an event consumer.
    pub fn consume(&mut self, event: &str, meta: HandlerMeta) -> RegistryResult<RouteId> {
        self.consume_with(event, meta, Vec::new())
    }

    /// Appends an event consumer with its own interceptors.
    pub fn consume_with(
        &mut self,
        event: &str,
        meta: HandlerMeta,
        interceptors: Vec<InterceptorRef>,
    ) -> RegistryResult<RouteId> {
        check_path_arity(&meta, event, 0)?;

        if self.consumers.iter().any(|consumer| consumer.event == event) {
            warn!(event, "Duplicate consumer registered, first registration wins");
        }

        debug!(event, handler = %meta.method(), "Consumer registered");
        self.consumers.push(ConsumerEntry {
            event: event.to_string(),
            meta: Arc::new(meta),
            interceptors,
        });
        Ok(RouteId::Event(self.consumers.len() - 1))
    }

    /// Finds the first route matching `verb` and `path`.
    pub fn match_route(&self, verb: &Verb, path: &str) -> Result<RouteMatch<'_>, RouteError> {
        self.routes
            .iter()
            .enumerate()
            .filter(|(_, route)| route.verb == *verb)
            .find_map(|(index, route)| {
                route.pattern.matches(path).map(|params| RouteMatch {
                    id: RouteId::Http(index),
                    meta: &route.meta,
                    params,
                    path_keys: route.pattern.keys(),
                })
            })
            .ok_or_else(|| RouteError::NotFound {
                verb: verb.clone(),
                path: path.to_string(),
            })
    }

    /// Finds the first consumer for `event`.
    pub fn match_event(&self, event: &str) -> Result<RouteMatch<'_>, RouteError> {
        self.consumers
            .iter()
            .position(|consumer| consumer.event == event)
            .map(|index| RouteMatch {
                id: RouteId::Event(index),
                meta: &self.consumers[index].meta,
                params: PathParams::new(),
                path_keys: Vec::new(),
            })
            .ok_or_else(|| RouteError::EventNotFound {
                name: event.to_string(),
            })
    }

    /// Matches by the context's input kind.
    pub fn match_context(&self, ctx: &ExecutionContext) -> Result<RouteMatch<'_>, RouteError> {
        match ctx.input() {
            Input::Http(request) => self.match_route(request.verb(), request.path()),
            Input::Event(event) => self.match_event(event.name()),
        }
    }

    /// The per-route interceptors of `id`.
    pub fn interceptors(&self, id: RouteId) -> &[InterceptorRef] {
        let entry = match id {
            RouteId::Http(index) => self.routes.get(index).map(|r| &r.interceptors),
            RouteId::Event(index) => self.consumers.get(index).map(|c| &c.interceptors),
        };
        entry.map(Vec::as_slice).unwrap_or_default()
    }

    /// De-duplicated receiver types across all routes and consumers, in
    /// first-registration order.
    pub fn controller_types(&self) -> Vec<TypeKey> {
        let mut seen = HashSet::new();
        self.routes
            .iter()
            .map(|route| route.meta.owner())
            .chain(self.consumers.iter().map(|consumer| consumer.meta.owner()))
            .filter(|owner| seen.insert(*owner))
            .collect()
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn consumers(&self) -> &[ConsumerEntry] {
        &self.consumers
    }

    pub fn len(&self) -> usize {
        self.routes.len() + self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.consumers.is_empty()
    }
}

fn check_path_arity(meta: &HandlerMeta, pattern: &str, available: usize) -> RegistryResult<()> {
    let declared = meta.path_value_count();
    if declared > available {
        return Err(RegistryError::PathArity {
            method: meta.method().path(),
            pattern: pattern.to_string(),
            declared,
            available,
        });
    }
    Ok(())
}
