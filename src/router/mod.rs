//! Route policy table
//!
//! Maps a request's method and path to the [`AuthorityRequirement`] that
//! governs it. Rules are evaluated in registration order and the first match
//! wins. Paths that match no rule get `DenyAll`.
//!
//! Patterns are Ant-style:
//!
//! - `/api/users` literal segments
//! - `/api/*/profile` or `/api/{id}/profile` exactly one segment
//! - `/static/**` any number of trailing segments, including none

use crate::authz::AuthorityRequirement;
use crate::config::{AccessKind, RouteConfig};
use hyper::Method;
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Router errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Rest,
}

/// Compiled route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, RouterError> {
        if !pattern.starts_with('/') {
            return Err(RouterError::InvalidPattern(format!(
                "'{}' must start with /",
                pattern
            )));
        }

        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "**" => Ok(Segment::Rest),
                "*" => Ok(Segment::Single),
                s if s.starts_with('{') && s.ends_with('}') && s.len() > 2 => Ok(Segment::Single),
                s if s.contains('*') || s.contains('{') || s.contains('}') => Err(
                    RouterError::InvalidPattern(format!("unsupported segment '{}' in '{}'", s, pattern)),
                ),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match already-normalized path segments
    fn matches(&self, path: &[String]) -> bool {
        match_segments(&self.segments, path)
    }
}

fn match_segments(pattern: &[Segment], path: &[String]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((Segment::Rest, rest)) => {
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((Segment::Single, rest)) => !path.is_empty() && match_segments(rest, &path[1..]),
        Some((Segment::Literal(lit), rest)) => {
            path.first().is_some_and(|seg| seg == lit) && match_segments(rest, &path[1..])
        }
    }
}

/// Split a request path into decoded segments
///
/// Returns `None` for paths that could be interpreted differently by the
/// downstream handler: dot segments, encoded separators, or invalid UTF-8.
/// Such paths match no rule and are therefore denied.
pub fn normalize_path(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for raw in path.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(raw).decode_utf8().ok()?;
        if decoded == "." || decoded == ".." || decoded.contains('/') || decoded.contains('\\') {
            return None;
        }
        segments.push(decoded.into_owned());
    }
    Some(segments)
}

/// One rule in the policy table
#[derive(Debug, Clone)]
pub struct RouteRule {
    pattern: RoutePattern,
    methods: Vec<Method>,
    requirement: AuthorityRequirement,
    anonymous_fallback: bool,
}

impl RouteRule {
    /// Rule applying to every method
    pub fn new(pattern: RoutePattern, requirement: AuthorityRequirement) -> Self {
        Self {
            pattern,
            methods: Vec::new(),
            requirement,
            anonymous_fallback: false,
        }
    }

    /// Restrict the rule to these methods
    #[must_use]
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Let requests with failed credentials continue anonymously
    #[must_use]
    pub fn with_anonymous_fallback(mut self, enabled: bool) -> Self {
        self.anonymous_fallback = enabled;
        self
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn requirement(&self) -> &AuthorityRequirement {
        &self.requirement
    }

    /// Whether a failed authentication may proceed as anonymous
    ///
    /// Public routes always allow it.
    pub fn allows_anonymous_fallback(&self) -> bool {
        self.anonymous_fallback || self.requirement == AuthorityRequirement::Public
    }

    fn applies_to(&self, method: &Method, segments: &[String]) -> bool {
        (self.methods.is_empty() || self.methods.contains(method)) && self.pattern.matches(segments)
    }

    fn from_config(route: &RouteConfig) -> Result<Self, RouterError> {
        let pattern = RoutePattern::parse(&route.pattern)?;
        let methods = route
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .map_err(|_| RouterError::InvalidMethod(m.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let authorities = route.authorities.iter().cloned();
        let requirement = match route.access {
            AccessKind::Public => AuthorityRequirement::Public,
            AccessKind::Authenticated => AuthorityRequirement::Authenticated,
            AccessKind::HasAll => AuthorityRequirement::has_all(authorities),
            AccessKind::HasAny => AuthorityRequirement::has_any(authorities),
            AccessKind::DenyAll => AuthorityRequirement::DenyAll,
        };

        Ok(Self::new(pattern, requirement)
            .with_methods(methods)
            .with_anonymous_fallback(route.anonymous_fallback))
    }
}

/// Static, ordered table of route rules
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: Vec<Arc<RouteRule>>,
    unmatched: Arc<RouteRule>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PolicyTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        let unmatched = RouteRule::new(
            RoutePattern {
                raw: "/**".to_string(),
                segments: vec![Segment::Rest],
            },
            AuthorityRequirement::DenyAll,
        );

        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            unmatched: Arc::new(unmatched),
        }
    }

    /// Build the table from configuration, preserving order
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, RouterError> {
        let rules = routes
            .iter()
            .map(RouteRule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the governing rule for a request
    ///
    /// Never fails: unmatched or unparseable paths get the deny-all rule.
    pub fn resolve(&self, method: &Method, path: &str) -> Arc<RouteRule> {
        let Some(segments) = normalize_path(path) else {
            debug!(path = %path, "Rejected non-canonical path");
            return Arc::clone(&self.unmatched);
        };

        match self.rules.iter().position(|rule| rule.applies_to(method, &segments)) {
            Some(index) => {
                let rule = &self.rules[index];
                debug!(
                    rule.index = index,
                    rule.pattern = %rule.pattern.as_str(),
                    "Matched route rule"
                );
                Arc::clone(rule)
            }
            None => {
                debug!(path = %path, "No route rule matched, denying by default");
                Arc::clone(&self.unmatched)
            }
        }
    }
}
