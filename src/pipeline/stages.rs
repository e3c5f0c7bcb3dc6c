//! The six pipeline stages, in execution order

use super::{Exchange, Flow, Handler, PipelineError};
use crate::auth::AuthenticationCoordinator;
use crate::authz::AccessDecisionEngine;
use crate::router::PolicyTable;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identifies a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    ContextInitialization,
    Authentication,
    AnonymousFallback,
    ExceptionTranslation,
    AuthorizationDecision,
    HandlerDispatch,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ContextInitialization => "context_initialization",
            StageKind::Authentication => "authentication",
            StageKind::AnonymousFallback => "anonymous_fallback",
            StageKind::ExceptionTranslation => "exception_translation",
            StageKind::AuthorizationDecision => "authorization_decision",
            StageKind::HandlerDispatch => "handler_dispatch",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the filter pipeline
#[async_trait]
pub(crate) trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError>;
}

/// Binds the request to its governing route rule
pub(crate) struct ContextInitialization {
    pub(crate) policies: Arc<PolicyTable>,
}

#[async_trait]
impl Stage for ContextInitialization {
    fn kind(&self) -> StageKind {
        StageKind::ContextInitialization
    }

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError> {
        let rule = self
            .policies
            .resolve(&exchange.request.method, &exchange.request.path);
        debug!(
            route.pattern = %rule.pattern().as_str(),
            route.requirement = %rule.requirement(),
            "Route resolved"
        );
        exchange.route = Some(rule);
        Ok(Flow::Continue)
    }
}

/// Runs the authentication coordinator
///
/// The coordinator leaves an already established context untouched, so a
/// second run is a no-op. Failures are parked on the exchange rather than
/// returned, so the anonymous-fallback stage can still waive them.
pub(crate) struct Authentication {
    pub(crate) coordinator: Arc<AuthenticationCoordinator>,
}

#[async_trait]
impl Stage for Authentication {
    fn kind(&self) -> StageKind {
        StageKind::Authentication
    }

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError> {
        if let Err(e) = self
            .coordinator
            .authenticate(&exchange.request, &mut exchange.context)
            .await
        {
            exchange.failure = Some(e);
        }
        Ok(Flow::Continue)
    }
}

/// Waives an authentication failure on routes that tolerate anonymous access
pub(crate) struct AnonymousFallback;

#[async_trait]
impl Stage for AnonymousFallback {
    fn kind(&self) -> StageKind {
        StageKind::AnonymousFallback
    }

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError> {
        let allowed = exchange
            .route
            .as_ref()
            .is_some_and(|rule| rule.allows_anonymous_fallback());

        if allowed {
            if let Some(failure) = exchange.failure.take() {
                debug!(
                    error.kind = failure.kind(),
                    "Continuing anonymously after failed authentication"
                );
                exchange.waived_failure = Some(failure.kind());
            }
        }
        Ok(Flow::Continue)
    }
}

/// Surfaces a remaining authentication failure as a pipeline error
pub(crate) struct ExceptionTranslation;

#[async_trait]
impl Stage for ExceptionTranslation {
    fn kind(&self) -> StageKind {
        StageKind::ExceptionTranslation
    }

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError> {
        match exchange.failure.take() {
            Some(failure) => Err(PipelineError::Authentication(failure)),
            None => Ok(Flow::Continue),
        }
    }
}

/// Applies the route's authority requirement
pub(crate) struct AuthorizationDecision {
    pub(crate) engine: AccessDecisionEngine,
}

#[async_trait]
impl Stage for AuthorizationDecision {
    fn kind(&self) -> StageKind {
        StageKind::AuthorizationDecision
    }

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError> {
        let rule = match exchange.route {
            Some(ref rule) => Arc::clone(rule),
            None => self
                .engine
                .policies()
                .resolve(&exchange.request.method, &exchange.request.path),
        };

        self.engine.decide(&exchange.context, rule.requirement())?;
        Ok(Flow::Continue)
    }
}

/// Hands the request and its context to the application handler
pub(crate) struct HandlerDispatch {
    pub(crate) handler: Arc<dyn Handler>,
}

#[async_trait]
impl Stage for HandlerDispatch {
    fn kind(&self) -> StageKind {
        StageKind::HandlerDispatch
    }

    async fn process(&self, exchange: &mut Exchange) -> Result<Flow, PipelineError> {
        match exchange.context.principal() {
            Some(principal) => info!(
                principal = %principal.id(),
                "Access granted, dispatching to handler"
            ),
            None => info!(
                waived_failure = exchange.waived_failure.unwrap_or("none"),
                "Anonymous access granted, dispatching to handler"
            ),
        }
        let response = self.handler.handle(&exchange.request, &exchange.context).await;
        Ok(Flow::Respond(response))
    }
}
