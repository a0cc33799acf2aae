//! Request authentication middleware.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::Claims;
use crate::AppState;

/// Wrapper for verified claims stored in request extensions.
#[derive(Clone, Debug)]
pub struct AuthContext(pub Claims);

/// Middleware authenticating requests via `Authorization: Bearer <token>`.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let claims = state
        .tokens
        .verify(&token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthContext(claims));

    Ok(next.run(req).await)
}
