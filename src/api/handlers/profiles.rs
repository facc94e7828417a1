use crate::api::ApiContext;
use crate::api::error::ApiError;
use crate::profile::{ProfilePayload, ProfileUpdate, ProfileView};
use axum::{
    Json,
    extract::{Extension, Path, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecryptQuery {
    pub query: String,
}

fn ok() -> Json<Value> {
    Json(json!({ "result": "ok" }))
}

pub async fn welcome() -> Json<Value> {
    Json(json!({
        "postgres-stat-profiler": "welcome",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list(Extension(ctx): Extension<ApiContext>) -> Result<Json<Vec<ProfileView>>, ApiError> {
    Ok(Json(ctx.store.read_all().await?))
}

pub async fn read(
    Extension(ctx): Extension<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<ProfileView>, ApiError> {
    Ok(Json(ctx.store.read(&name).await?))
}

pub async fn create(
    Extension(ctx): Extension<ApiContext>,
    Path(name): Path<String>,
    payload: Result<Json<ProfilePayload>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(payload) = payload?;
    ctx.store.create(&name, payload).await?;
    Ok(ok())
}

pub async fn update(
    Extension(ctx): Extension<ApiContext>,
    Path(name): Path<String>,
    update: Result<Json<ProfileUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(update) = update?;
    ctx.store.update(&name, update).await?;
    Ok(ok())
}

pub async fn delete(
    Extension(ctx): Extension<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.store.delete(&name).await?;
    Ok(ok())
}

pub async fn decrypt_query(
    Extension(ctx): Extension<ApiContext>,
    Path(name): Path<String>,
    body: Result<Json<DecryptQuery>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let query = ctx.store.decrypt_query(&name, &body.query).await?;
    Ok(Json(json!({ "result": "ok", "query": query })))
}
