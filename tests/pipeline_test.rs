//! Filter pipeline integration tests
//!
//! End-to-end behavior: credentials in, status and principal out.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use gatekeep::auth::jwt::{SigningKey, TokenIssuer, TokenRequest, TokenValidator};
    use gatekeep::auth::{AuthenticationCoordinator, ClaimsPrincipalResolver, CredentialExtractor};
    use gatekeep::authz::AuthorityRequirement;
    use gatekeep::config::ConfigLoader;
    use gatekeep::pipeline::{Handler, StageKind, WhoAmIHandler};
    use gatekeep::request::InboundRequest;
    use gatekeep::router::{PolicyTable, RoutePattern, RouteRule};
    use gatekeep::{FilterPipeline, SecurityContext};
    use hyper::header::WWW_AUTHENTICATE;
    use hyper::{Method, Response, StatusCode};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};

    const SECRET: &str = "pipeline-test-secret";

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Records the principal each dispatched request saw
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(
            &self,
            _request: &InboundRequest,
            context: &SecurityContext,
        ) -> Response<String> {
            let id = context.principal().map(|p| p.id().to_string());
            self.seen.lock().unwrap().push(id.clone());
            Response::new(id.unwrap_or_else(|| "anonymous".into()))
        }
    }

    fn key() -> Arc<SigningKey> {
        Arc::new(SigningKey::hs256(SECRET.as_bytes()))
    }

    fn token_for(subject: &str, authorities: &[&str]) -> String {
        TokenIssuer::new(key())
            .issue(&TokenRequest {
                subject: subject.into(),
                display_name: None,
                authorities: authorities.iter().map(|a| a.to_string()).collect(),
            })
            .unwrap()
    }

    fn rule(pattern: &str, requirement: AuthorityRequirement) -> RouteRule {
        RouteRule::new(RoutePattern::parse(pattern).unwrap(), requirement)
    }

    fn policies() -> PolicyTable {
        PolicyTable::new(vec![
            rule("/public/**", AuthorityRequirement::Public),
            rule("/admin/**", AuthorityRequirement::has_all(["ADMIN"])),
            rule("/reports/**", AuthorityRequirement::has_any(["AUDITOR", "ADMIN"])),
            rule("/catalog/**", AuthorityRequirement::Authenticated).with_anonymous_fallback(true),
            rule("/api/**", AuthorityRequirement::Authenticated),
        ])
    }

    fn pipeline_with(handler: Arc<dyn Handler>) -> FilterPipeline {
        FilterPipeline::new(
            AuthenticationCoordinator::new(
                CredentialExtractor::default(),
                TokenValidator::new(key()),
                Arc::new(ClaimsPrincipalResolver),
            ),
            Arc::new(policies()),
            handler,
        )
    }

    fn get(path: &str) -> InboundRequest {
        InboundRequest::new(Method::GET, path)
    }

    // ========================================================================
    // TEST: Anonymous requests
    // ========================================================================

    #[tokio::test]
    async fn test_missing_header_is_anonymous_not_error() {
        let handler = Arc::new(RecordingHandler::default());
        let pipeline = pipeline_with(handler.clone());

        let response = pipeline.handle(get("/public/index.html")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*handler.seen.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_anonymous_on_protected_route_is_401() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let response = pipeline.handle(get("/api/me")).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
    }

    // ========================================================================
    // TEST: Expired and forged tokens
    // ========================================================================

    #[tokio::test]
    async fn test_expired_token_denied_on_authenticated_route() {
        let now = chrono::Utc::now().timestamp();
        let expired = TokenIssuer::new(key())
            .with_ttl(60)
            .issue_at(
                &TokenRequest {
                    subject: "alice".into(),
                    display_name: None,
                    authorities: vec!["ADMIN".into()],
                },
                now - 120,
            )
            .unwrap();

        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let response = pipeline.handle(get("/api/me").with_bearer(&expired)).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body(), "Unauthorized");
    }

    #[tokio::test]
    async fn test_token_expiring_now_is_denied() {
        let now = chrono::Utc::now().timestamp();
        let token = encode(
            &Header::default(),
            &json!({"sub": "alice", "exp": now, "authorities": ["ADMIN"]}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let response = pipeline.handle(get("/api/me").with_bearer(&token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_signed_with_other_key_is_401() {
        let forged = TokenIssuer::new(Arc::new(SigningKey::hs256(b"attacker-secret")))
            .issue(&TokenRequest {
                subject: "alice".into(),
                display_name: None,
                authorities: vec!["ADMIN".into()],
            })
            .unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let pipeline = pipeline_with(handler.clone());
        let response = pipeline.handle(get("/admin/users").with_bearer(&forged)).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_bearer_is_401() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let response = pipeline.handle(get("/api/me").with_bearer("garbage")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ========================================================================
    // TEST: Public routes and anonymous fallback
    // ========================================================================

    #[tokio::test]
    async fn test_public_route_allows_any_request() {
        let handler = Arc::new(RecordingHandler::default());
        let pipeline = pipeline_with(handler.clone());

        let valid = get("/public/a").with_bearer(&token_for("alice", &[]));
        let invalid = get("/public/b").with_bearer("not-a-token");
        let none = get("/public/c");

        for request in [valid, invalid, none] {
            assert_eq!(pipeline.handle(request).await.status(), StatusCode::OK);
        }
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![Some("alice".to_string()), None, None]
        );
    }

    #[tokio::test]
    async fn test_anonymous_fallback_still_requires_authorization() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let response = pipeline
            .handle(get("/catalog/items").with_bearer("not-a-token"))
            .await;

        // Failure is waived but the route still needs a principal
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ========================================================================
    // TEST: Authorization
    // ========================================================================

    #[tokio::test]
    async fn test_missing_authority_is_403() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let token = token_for("bob", &["READ_USER"]);
        let response = pipeline.handle(get("/admin/users").with_bearer(&token)).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body(), "Forbidden");
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());
    }

    #[tokio::test]
    async fn test_admin_token_reaches_handler_as_alice() {
        let handler = Arc::new(RecordingHandler::default());
        let pipeline = pipeline_with(handler.clone());
        let token = token_for("alice", &["ADMIN"]);

        let response = pipeline.handle(get("/admin/users").with_bearer(&token)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "alice");
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![Some("alice".to_string())]
        );
    }

    #[tokio::test]
    async fn test_has_any_route() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));

        let auditor = token_for("erin", &["AUDITOR"]);
        let reader = token_for("frank", &["READ_USER"]);

        let ok = pipeline.handle(get("/reports/q3").with_bearer(&auditor)).await;
        let denied = pipeline.handle(get("/reports/q3").with_bearer(&reader)).await;

        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unmatched_route_is_denied() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let token = token_for("alice", &["ADMIN"]);

        let authenticated = pipeline.handle(get("/internal").with_bearer(&token)).await;
        let anonymous = pipeline.handle(get("/internal")).await;

        assert_eq!(authenticated.status(), StatusCode::FORBIDDEN);
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_encoded_traversal_is_denied() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let response = pipeline.handle(get("/public/%2e%2e/admin/users")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_whoami_handler_echoes_principal() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let token = token_for("alice", &["ADMIN", "READ_USER"]);
        let response = pipeline.handle(get("/api/me").with_bearer(&token)).await;

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["principal"]["id"], "alice");
        assert_eq!(body["principal"]["authorities"], json!(["ADMIN", "READ_USER"]));
    }

    // ========================================================================
    // TEST: Pipeline structure and context lifetime
    // ========================================================================

    #[tokio::test]
    async fn test_stage_order_is_fixed() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        assert_eq!(
            pipeline.stage_order(),
            vec![
                StageKind::ContextInitialization,
                StageKind::Authentication,
                StageKind::AnonymousFallback,
                StageKind::ExceptionTranslation,
                StageKind::AuthorizationDecision,
                StageKind::HandlerDispatch,
            ]
        );
    }

    #[tokio::test]
    async fn test_context_released_after_every_outcome() {
        let pipeline = pipeline_with(Arc::new(WhoAmIHandler));
        let token = token_for("bob", &["READ_USER"]);

        pipeline.handle(get("/api/me").with_bearer(&token)).await;
        pipeline.handle(get("/admin").with_bearer(&token)).await;
        pipeline.handle(get("/api/me").with_bearer("bad")).await;

        assert_eq!(pipeline.active_contexts(), 0);
    }

    /// Parks inside the handler until the test drops the request
    struct ParkingHandler {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl Handler for ParkingHandler {
        async fn handle(
            &self,
            _request: &InboundRequest,
            _context: &SecurityContext,
        ) -> Response<String> {
            self.entered.notify_one();
            std::future::pending::<()>().await;
            Response::new(String::new())
        }
    }

    #[tokio::test]
    async fn test_context_released_when_request_is_cancelled() {
        let entered = Arc::new(Notify::new());
        let pipeline = Arc::new(pipeline_with(Arc::new(ParkingHandler {
            entered: Arc::clone(&entered),
        })));

        let token = token_for("alice", &[]);
        let task = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.handle(get("/api/me").with_bearer(&token)).await })
        };

        entered.notified().await;
        assert_eq!(pipeline.active_contexts(), 1);

        task.abort();
        let result = task.await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(pipeline.active_contexts(), 0);
    }

    // ========================================================================
    // TEST: Concurrency
    // ========================================================================

    /// Holds both requests inside the handler at the same time
    struct RendezvousHandler {
        barrier: Barrier,
    }

    #[async_trait]
    impl Handler for RendezvousHandler {
        async fn handle(
            &self,
            _request: &InboundRequest,
            context: &SecurityContext,
        ) -> Response<String> {
            let before = context.principal().map(|p| p.id().to_string());
            self.barrier.wait().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            let after = context.principal().map(|p| p.id().to_string());
            assert_eq!(before, after);
            Response::new(after.unwrap_or_default())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_keep_their_own_principal() {
        let pipeline = Arc::new(pipeline_with(Arc::new(RendezvousHandler {
            barrier: Barrier::new(2),
        })));

        let alice = get("/api/me").with_bearer(&token_for("alice", &["ADMIN"]));
        let bob = get("/api/me").with_bearer(&token_for("bob", &["READ_USER"]));

        let (a, b) = tokio::join!(
            tokio::spawn({
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.handle(alice).await }
            }),
            tokio::spawn({
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.handle(bob).await }
            })
        );

        assert_eq!(a.unwrap().body(), "alice");
        assert_eq!(b.unwrap().body(), "bob");
        assert_eq!(pipeline.active_contexts(), 0);
    }

    // ========================================================================
    // TEST: Configuration-built pipeline with form login
    // ========================================================================

    // sha256("hunter2")
    const HUNTER2: &str = "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7";

    fn configured_pipeline() -> FilterPipeline {
        let yaml = format!(
            r#"
security:
  signing_key:
    algorithm: HS256
    secret: "{secret}"
  form_login:
    path: /login
principals:
  resolver: directory
  accounts:
    - id: alice
      display_name: Alice
      authorities: [ADMIN]
      password_sha256: "{digest}"
    - id: mallory
      authorities: [ADMIN]
      password_sha256: "{digest}"
      enabled: false
routes:
  - pattern: /login
    methods: [POST]
    access: authenticated
  - pattern: /admin/**
    access: has_all
    authorities: [ADMIN]
"#,
            secret = SECRET,
            digest = HUNTER2
        );
        let config = ConfigLoader::from_yaml(&yaml).unwrap();
        FilterPipeline::from_config(&config, Arc::new(WhoAmIHandler)).unwrap()
    }

    fn login(username: &str, password: &str) -> InboundRequest {
        InboundRequest::new(Method::POST, "/login")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body(format!("username={}&password={}", username, password))
    }

    #[tokio::test]
    async fn test_form_login_success() {
        let response = configured_pipeline().handle(login("alice", "hunter2")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["principal"]["display_name"], "Alice");
    }

    #[tokio::test]
    async fn test_form_login_failures_are_401() {
        let pipeline = configured_pipeline();
        for (user, pass) in [("alice", "wrong"), ("nobody", "hunter2"), ("mallory", "hunter2")] {
            let response = pipeline.handle(login(user, pass)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", user);
        }
    }

    #[tokio::test]
    async fn test_directory_rejects_unknown_subject() {
        let pipeline = configured_pipeline();
        let token = token_for("eve", &["ADMIN"]);
        let response = pipeline.handle(get("/admin/users").with_bearer(&token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_directory_authorities_apply_to_tokens() {
        let pipeline = configured_pipeline();
        // The token claims nothing, the directory grants ADMIN
        let token = token_for("alice", &[]);
        let response = pipeline.handle(get("/admin/users").with_bearer(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
