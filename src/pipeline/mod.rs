//! Security filter pipeline
//!
//! Every request runs through a fixed sequence of stages:
//!
//! ```text
//! context_initialization → authentication → anonymous_fallback →
//! exception_translation → authorization_decision → handler_dispatch
//! ```
//!
//! A stage either continues, responds directly, or returns a
//! [`PipelineError`]. Errors become HTTP responses in exactly one place,
//! [`translate`]. The request's security context lives in a scope guard
//! owned by the per-request exchange, so it is cleared on every exit path, including
//! cancellation of the request future.

mod stages;

pub use stages::StageKind;

use stages::Stage;

use crate::auth::{
    jwt::{SigningKey, TokenValidator},
    principal::resolver_from_config,
    AuthError, AuthenticationCoordinator, CredentialExtractor,
};
use crate::authz::{AccessDecisionEngine, AuthzError};
use crate::config::{Config, ConfigError};
use crate::context::{ContextScope, SecurityContext};
use crate::request::InboundRequest;
use crate::router::{PolicyTable, RouteRule};
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Errors a stage can raise
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("Authorization failed: {0}")]
    Authorization(#[from] AuthzError),
}

impl PipelineError {
    /// Status code this error translates to
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Authentication(_) => StatusCode::UNAUTHORIZED,
            PipelineError::Authorization(AuthzError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            PipelineError::Authorization(AuthzError::AccessDenied) => StatusCode::FORBIDDEN,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Authentication(e) => e.kind(),
            PipelineError::Authorization(e) => e.kind(),
        }
    }
}

/// Result of a stage that did not fail
#[derive(Debug)]
pub enum Flow {
    Continue,
    Respond(Response<String>),
}

/// Per-request state threaded through the stages
pub(crate) struct Exchange {
    pub(crate) request: InboundRequest,
    pub(crate) context: ContextScope,
    pub(crate) route: Option<Arc<RouteRule>>,
    pub(crate) failure: Option<AuthError>,
    /// Kind of the authentication failure waived by anonymous fallback
    pub(crate) waived_failure: Option<&'static str>,
}

impl Exchange {
    pub(crate) fn new(request: InboundRequest, context: ContextScope) -> Self {
        Self {
            request,
            context,
            route: None,
            failure: None,
            waived_failure: None,
        }
    }
}

/// Application logic behind the pipeline
///
/// Only invoked once access has been granted. The context is borrowed for
/// the duration of the call; handlers read the principal through its
/// accessors and cannot modify it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &InboundRequest, context: &SecurityContext)
        -> Response<String>;
}

/// Handler that echoes the caller's identity as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct WhoAmIHandler;

#[async_trait]
impl Handler for WhoAmIHandler {
    async fn handle(
        &self,
        request: &InboundRequest,
        context: &SecurityContext,
    ) -> Response<String> {
        let body = json!({
            "path": request.path,
            "authenticated": context.is_authenticated(),
            "principal": context.principal(),
        });

        let mut response = Response::new(body.to_string());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Turn a pipeline error into its HTTP response
///
/// Bodies are generic; the failure kind only reaches the logs.
pub fn translate(error: &PipelineError) -> Response<String> {
    let status = error.status();
    let body = match status {
        StatusCode::FORBIDDEN => "Forbidden",
        _ => "Unauthorized",
    };

    let mut response = Response::new(body.to_string());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }

    warn!(
        http.status = status.as_u16(),
        error.kind = error.kind(),
        "Request rejected"
    );
    response
}

/// The assembled filter pipeline
pub struct FilterPipeline {
    stages: Vec<Box<dyn Stage>>,
    live_contexts: Arc<AtomicUsize>,
}

impl FilterPipeline {
    pub fn new(
        coordinator: AuthenticationCoordinator,
        policies: Arc<PolicyTable>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(stages::ContextInitialization {
                policies: Arc::clone(&policies),
            }),
            Box::new(stages::Authentication {
                coordinator: Arc::new(coordinator),
            }),
            Box::new(stages::AnonymousFallback),
            Box::new(stages::ExceptionTranslation),
            Box::new(stages::AuthorizationDecision {
                engine: AccessDecisionEngine::new(policies),
            }),
            Box::new(stages::HandlerDispatch { handler }),
        ];

        Self {
            stages,
            live_contexts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Assemble the pipeline described by a validated configuration
    pub fn from_config(config: &Config, handler: Arc<dyn Handler>) -> Result<Self, ConfigError> {
        let security = &config.security;

        let key = SigningKey::from_config(&security.signing_key)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        let validator = TokenValidator::from_config(security, Arc::new(key));

        let mut extractor = CredentialExtractor::new(security.token_sources.clone());
        if let Some(ref form_login) = security.form_login {
            extractor = extractor.with_form_login(form_login.clone());
        }

        let policies = PolicyTable::from_config(&config.routes)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        info!(
            routes = policies.len(),
            algorithm = %security.signing_key.algorithm,
            "Filter pipeline assembled"
        );

        Ok(Self::new(
            AuthenticationCoordinator::new(
                extractor,
                validator,
                resolver_from_config(&config.principals),
            ),
            Arc::new(policies),
            handler,
        ))
    }

    /// Stage kinds in execution order
    pub fn stage_order(&self) -> Vec<StageKind> {
        self.stages.iter().map(|stage| stage.kind()).collect()
    }

    /// Security contexts currently open in this pipeline
    pub fn active_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    /// Run one request through the pipeline
    pub async fn handle(&self, request: InboundRequest) -> Response<String> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "request",
            request.id = %request_id,
            http.method = %request.method,
            http.path = %request.path
        );

        async move {
            let mut exchange =
                Exchange::new(request, ContextScope::open(Arc::clone(&self.live_contexts)));
            let response = self.run(&mut exchange).await;

            #[cfg(feature = "metrics")]
            crate::metrics::record_response(response.status().as_u16());

            response
        }
        .instrument(span)
        .await
    }

    async fn run(&self, exchange: &mut Exchange) -> Response<String> {
        for stage in &self.stages {
            match stage.process(exchange).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Respond(response)) => return response,
                Err(e) => return translate(&e),
            }
        }

        // HandlerDispatch always responds; reaching here means no handler ran.
        warn!("Pipeline finished without a response");
        let mut response = Response::new("Internal Server Error".to_string());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }
}
