//! Route policy table tests

#[cfg(test)]
mod tests {
    use gatekeep::authz::AuthorityRequirement;
    use gatekeep::config::{AccessKind, RouteConfig};
    use gatekeep::router::{normalize_path, PolicyTable, RouterError};
    use hyper::Method;

    fn route(pattern: &str, methods: &[&str], access: AccessKind, authorities: &[&str]) -> RouteConfig {
        RouteConfig {
            pattern: pattern.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            access,
            authorities: authorities.iter().map(|a| a.to_string()).collect(),
            anonymous_fallback: false,
        }
    }

    fn table() -> PolicyTable {
        PolicyTable::from_config(&[
            route("/health", &[], AccessKind::Public, &[]),
            route("/users/{id}", &["get"], AccessKind::HasAny, &["READ_USER", "ADMIN"]),
            route("/users/**", &[], AccessKind::HasAll, &["ADMIN"]),
            route("/static/**", &["GET", "HEAD"], AccessKind::Public, &[]),
            route("/api/**", &[], AccessKind::Authenticated, &[]),
        ])
        .unwrap()
    }

    #[test]
    fn test_registration_order_is_kept() {
        let table = table();
        assert_eq!(table.len(), 5);

        assert_eq!(
            table.resolve(&Method::GET, "/users/42").requirement(),
            &AuthorityRequirement::has_any(["READ_USER", "ADMIN"])
        );
        // Same path, other method falls through to the next rule
        assert_eq!(
            table.resolve(&Method::DELETE, "/users/42").requirement(),
            &AuthorityRequirement::has_all(["ADMIN"])
        );
    }

    #[test]
    fn test_rest_wildcard_matches_base_path() {
        let table = table();
        assert_eq!(
            table.resolve(&Method::GET, "/static").requirement(),
            &AuthorityRequirement::Public
        );
        assert_eq!(
            table.resolve(&Method::HEAD, "/static/js/app.js").requirement(),
            &AuthorityRequirement::Public
        );
        assert_eq!(
            table.resolve(&Method::POST, "/static/js/app.js").requirement(),
            &AuthorityRequirement::DenyAll
        );
    }

    #[test]
    fn test_unmatched_routes_deny() {
        let table = table();
        for path in ["/", "/healthz", "/admin", "/api%2Fsecret"] {
            assert_eq!(
                table.resolve(&Method::GET, path).requirement(),
                &AuthorityRequirement::DenyAll,
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_percent_encoded_segments_are_decoded() {
        let table = table();
        assert_eq!(
            table.resolve(&Method::GET, "/%68ealth").requirement(),
            &AuthorityRequirement::Public
        );
    }

    #[test]
    fn test_dot_segments_never_match() {
        let table = table();
        assert_eq!(
            table.resolve(&Method::GET, "/static/../api/x").requirement(),
            &AuthorityRequirement::DenyAll
        );
        assert_eq!(normalize_path("/static/./x"), None);
    }

    #[test]
    fn test_anonymous_fallback_flag() {
        let mut catalog = route("/catalog/**", &[], AccessKind::Authenticated, &[]);
        catalog.anonymous_fallback = true;

        let table = PolicyTable::from_config(&[
            catalog,
            route("/open", &[], AccessKind::Public, &[]),
            route("/closed", &[], AccessKind::Authenticated, &[]),
        ])
        .unwrap();

        assert!(table.resolve(&Method::GET, "/catalog/1").allows_anonymous_fallback());
        assert!(table.resolve(&Method::GET, "/open").allows_anonymous_fallback());
        assert!(!table.resolve(&Method::GET, "/closed").allows_anonymous_fallback());
    }

    #[test]
    fn test_invalid_config_entries() {
        let bad_pattern = PolicyTable::from_config(&[route("/a/**b", &[], AccessKind::Public, &[])]);
        assert!(matches!(bad_pattern, Err(RouterError::InvalidPattern(_))));

        let bad_method = PolicyTable::from_config(&[route("/a", &["GE T"], AccessKind::Public, &[])]);
        assert!(matches!(bad_method, Err(RouterError::InvalidMethod(_))));
    }
}
