//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use reelhub_shared::Role;
use serde_json::json;
use uuid::Uuid;

use super::jwt::{JwtError, JwtManager};

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

impl AuthUser {
    /// Creators act on their own account; admins act on anyone's
    pub fn authorize_creator(&self, creator_id: Uuid) -> Result<(), AuthError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Creator if self.user_id == creator_id => Ok(()),
            Role::Creator | Role::Subscriber | Role::Visitor => {
                Err(AuthError::InsufficientPermissions)
            }
        }
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Creator | Role::Subscriber | Role::Visitor => {
                Err(AuthError::InsufficientPermissions)
            }
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

impl AuthState {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            jwt_manager: JwtManager::new(jwt_secret),
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = self
            .jwt_manager
            .validate_access_token(token)
            .map_err(|e| match e {
                JwtError::Expired | JwtError::Invalid | JwtError::WrongTokenType => {
                    AuthError::InvalidToken
                }
            })?;

        Ok(AuthUser {
            user_id: claims.sub,
            role: claims.role(),
            email: claims.email,
        })
    }
}

fn extract_bearer_token(request: &Request) -> Result<Option<String>, AuthError> {
    let Some(header) = request.headers().get(AUTHORIZATION) else {
        return Ok(None);
    };
    let header = header.to_str().map_err(|_| AuthError::InvalidAuthFormat)?;
    header
        .strip_prefix("Bearer ")
        .map(|token| Some(token.trim().to_string()))
        .ok_or(AuthError::InvalidAuthFormat)
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Ok(Some(token)) => auth_state.authenticate(&token),
        Ok(None) => Err(AuthError::MissingAuth),
        Err(e) => Err(e),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingAuth | AuthError::InvalidAuthFormat | AuthError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingAuth | AuthError::InvalidAuthFormat | AuthError::InvalidToken => {
                "unauthorized"
            }
            AuthError::InsufficientPermissions => "forbidden",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken => "Invalid or expired token",
            AuthError::InsufficientPermissions => "Insufficient permissions",
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        }));

        (self.status(), body).into_response()
    }
}
