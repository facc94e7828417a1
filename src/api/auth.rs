use crate::api::ApiContext;
use crate::api::error::ApiError;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use std::sync::PoisonError;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Key presented by the client, from `x-api-key` or `Authorization: Bearer`.
pub fn request_key(headers: &HeaderMap) -> Option<String> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let from_bearer = || {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("Bearer "))
            .map(str::trim)
    };

    from_header
        .or_else(from_bearer)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Let the request through only with one of the current API keys.
pub async fn require_api_key(
    Extension(ctx): Extension<ApiContext>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let valid = request_key(req.headers()).is_some_and(|key| {
        ctx.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_key(&key)
    });

    if !valid {
        debug!(path = %req.uri().path(), "rejected request without a valid api key");
        return ApiError::unauthenticated().into_response();
    }

    next.run(req).await
}

/// Let the request through only with the key-generation secret.
pub async fn require_keygen_secret(
    Extension(ctx): Extension<ApiContext>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected = ctx.keygen_secret.expose_secret().trim();
    let valid = request_key(req.headers()).is_some_and(|key| !expected.is_empty() && key == expected);

    if !valid {
        debug!(path = %req.uri().path(), "rejected request without the keygen secret");
        return ApiError::unauthenticated().into_response();
    }

    next.run(req).await
}
