use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;

use crate::api::AppState;

/// Authentication error responses
#[derive(Debug)]
pub enum AuthError {
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Authentication required.").into_response()
            }
        }
    }
}

/// Middleware gating routes behind the configured service token.
///
/// User authentication proper is delegated upstream; this only stops the API
/// from being wide open when a token is configured. Without one (local
/// development), every request passes.
pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = &state.config.service_token else {
        return Ok(next.run(request).await);
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected.expose_secret() => Ok(next.run(request).await),
        _ => Err(AuthError::Unauthorized),
    }
}
