use crate::api::{ApiContext, GIT_COMMIT_HASH};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    store: String,
    profiles: usize,
}

// The profile store thread answers, or it is gone
async fn check_store_health(ctx: &ApiContext) -> Result<usize, StatusCode> {
    match ctx.store.read_all().await {
        Ok(profiles) => Ok(profiles.len()),
        Err(error) => {
            error!("Profile store unavailable: {}", error);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn create_health_response(store_result: &Result<usize, StatusCode>) -> Health {
    Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: if store_result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
        profiles: *store_result.as_ref().unwrap_or(&0),
    }
}

fn create_response_body(method: &Method, health: &Health) -> Body {
    if method == Method::GET {
        Json(health).into_response().into_body()
    } else {
        Body::empty()
    }
}

// X-App: name:version:short-hash
fn create_app_headers(health: &Health) -> HeaderMap {
    let short_hash = health.commit.get(..7).unwrap_or("");
    let header_value = format!("{}:{}:{}", health.name, health.version, short_hash);

    match header_value.parse::<HeaderValue>() {
        Ok(x_app_header_value) => {
            debug!("X-App header: {:?}", x_app_header_value);
            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app_header_value);
            headers
        }
        Err(err) => {
            debug!("Failed to parse X-App header: {}", err);
            HeaderMap::new()
        }
    }
}

pub async fn health(method: Method, Extension(ctx): Extension<ApiContext>) -> impl IntoResponse {
    let store_result = check_store_health(&ctx).await;
    let health = create_health_response(&store_result);
    let body = create_response_body(&method, &health);
    let headers = create_app_headers(&health);

    match store_result {
        Ok(_) => (StatusCode::OK, headers, body),
        Err(status_code) => (status_code, headers, body),
    }
}
