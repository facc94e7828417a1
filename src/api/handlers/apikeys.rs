use crate::api::ApiContext;
use crate::api::error::ApiError;
use axum::{Json, extract::Extension};
use serde_json::{Value, json};
use std::sync::PoisonError;

pub async fn list(Extension(ctx): Extension<ApiContext>) -> Json<Value> {
    let keys = ctx.keys.read().unwrap_or_else(PoisonError::into_inner);
    Json(json!({ "apikeys": keys.keys() }))
}

pub async fn reset(Extension(ctx): Extension<ApiContext>) -> Result<Json<Value>, ApiError> {
    let mut keys = ctx.keys.write().unwrap_or_else(PoisonError::into_inner);
    let fresh = keys.reset_keys()?;
    Ok(Json(json!({ "result": "ok", "apikeys": fresh })))
}
