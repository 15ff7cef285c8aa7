//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer token extraction (missing, malformed, valid)
//! - Token validation failures surfacing as 401
//! - Role-based access checks for creator and admin operations

#[cfg(test)]
mod tests {
    use super::super::jwt::test_tokens::*;
    use super::super::jwt::TokenType;
    use super::super::middleware::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use reelhub_shared::Role;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> Router {
        let auth_state = AuthState::new(TEST_SECRET);
        Router::new()
            .route(
                "/whoami",
                get(|Extension(user): Extension<AuthUser>| async move {
                    format!("{}:{}", user.user_id, user.role)
                }),
            )
            .layer(middleware::from_fn_with_state(auth_state, require_auth))
    }

    async fn call(authorization: Option<String>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        let response = app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn user(role: Role) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            email: "someone@example.com".into(),
            role,
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (status, body) = call(None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("\"kind\":\"unauthorized\""));
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_rejected() {
        let (status, _) = call(Some("Basic dXNlcjpwYXNz".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let user_id = Uuid::new_v4();
        let token = access_token(user_id, "creator");
        let (status, body) = call(Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("{}:creator", user_id));
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthorized() {
        let token = token_with(TEST_SECRET, Uuid::new_v4(), Some("admin"), TokenType::Access, -3600);
        let (status, _) = call(Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_creator_may_only_act_on_self() {
        let creator = user(Role::Creator);
        assert!(creator.authorize_creator(creator.user_id).is_ok());
        assert_eq!(
            creator.authorize_creator(Uuid::new_v4()),
            Err(AuthError::InsufficientPermissions)
        );
        assert!(creator.require_admin().is_err());
    }

    #[test]
    fn test_admin_may_act_on_anyone() {
        let admin = user(Role::Admin);
        assert!(admin.authorize_creator(Uuid::new_v4()).is_ok());
        assert!(admin.require_admin().is_ok());
    }

    #[test]
    fn test_subscriber_and_visitor_are_refused() {
        for role in [Role::Subscriber, Role::Visitor] {
            let caller = user(role);
            assert!(caller.authorize_creator(caller.user_id).is_err());
            assert!(caller.require_admin().is_err());
        }
    }
}
