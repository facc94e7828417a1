use crate::store::{KeyStore, StoreHandle};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::{Next, from_fn},
    response::Response,
    routing::get,
};
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TraceId};
use opentelemetry_http::HeaderExtractor;
use secrecy::SecretString;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use ulid::Ulid;

mod auth;
mod error;
mod handlers;
pub mod shutdown;

pub use auth::API_KEY_HEADER;
pub use error::ApiError;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH {
    hash
} else {
    ":-("
};

/// Everything the handlers need, shared through an `Extension`.
#[derive(Clone)]
pub struct ApiContext {
    pub store: StoreHandle,
    pub keys: Arc<RwLock<KeyStore>>,
    pub keygen_secret: Arc<SecretString>,
}

impl ApiContext {
    pub fn new(store: StoreHandle, keys: KeyStore, keygen_secret: SecretString) -> Self {
        Self {
            store,
            keys: Arc::new(RwLock::new(keys)),
            keygen_secret: Arc::new(keygen_secret),
        }
    }
}

pub fn router(ctx: ApiContext) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(make_span)
        .on_response(on_response);

    let profiles = Router::new()
        .route("/_api/v1.0", get(handlers::profiles::welcome))
        .route("/_api/v1.0/profiles", get(handlers::profiles::list))
        .route(
            "/_api/v1.0/profiles/{name}",
            get(handlers::profiles::read)
                .post(handlers::profiles::create)
                .put(handlers::profiles::update)
                .delete(handlers::profiles::delete),
        )
        .route(
            "/_api/v1.0/profiles/{name}/decryptQuery",
            axum::routing::post(handlers::profiles::decrypt_query),
        )
        .route_layer(from_fn(auth::require_api_key));

    let apikeys = Router::new()
        .route(
            "/_api/v1.0/apikeys",
            get(handlers::apikeys::list).post(handlers::apikeys::reset),
        )
        .route_layer(from_fn(auth::require_keygen_secret));

    Router::new()
        .merge(profiles)
        .merge(apikeys)
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(trace_layer)
                .layer(from_fn(add_trace_headers))
                .layer(Extension(ctx)),
        )
}

/// Bind the API listener. Without `listen`, try IPv6 first and fall back to
/// IPv4. Returns the listener and a printable address.
///
/// # Errors
///
/// Returns an error if `listen` is not an IP address or binding fails.
pub async fn bind(port: u16, listen: Option<String>) -> Result<(TcpListener, String)> {
    match listen {
        Some(addr) => {
            let ip = addr.parse::<std::net::IpAddr>().map_err(|_| {
                anyhow!(
                    "Invalid IP address: '{}'. Expected IPv4 (e.g., 0.0.0.0, 127.0.0.1) or IPv6 (e.g., ::, ::1)",
                    addr
                )
            })?;

            let bind_addr = std::net::SocketAddr::new(ip, port);
            let listener = TcpListener::bind(bind_addr)
                .await
                .with_context(|| format!("Failed to bind to {bind_addr}"))?;

            Ok((listener, bind_addr.to_string()))
        }
        None => match TcpListener::bind(format!("[::]:{port}")).await {
            Ok(l) => Ok((l, format!("[::]:{port}"))),
            Err(_) => Ok((
                TcpListener::bind(format!("0.0.0.0:{port}"))
                    .await
                    .with_context(|| format!("Failed to bind to 0.0.0.0:{port}"))?,
                format!("0.0.0.0:{port}"),
            )),
        },
    }
}

/// Serve the API on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, ctx: ApiContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(ctx).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    info!("api server stopped");

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let parent_cx =
        global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(request.headers())));

    let method = request.method().as_str();
    let path = request.uri().path();

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none");

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let span = info_span!(
        "http.server.request",
        otel.kind = "server",
        http.method = method,
        http.route = path,
        http.user_agent = user_agent,
        request_id = request_id,
        otel.status_code = tracing::field::Empty,
    );

    let _ = span.set_parent(parent_cx);

    span
}

fn on_response<B>(response: &axum::http::Response<B>, latency: Duration, span: &Span) {
    if response.status().is_server_error() {
        span.record("otel.status_code", "ERROR");
    } else {
        span.record("otel.status_code", "OK");
    }

    let elapsed_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    let trace_id = span.context().span().span_context().trace_id();

    if trace_id == TraceId::INVALID {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            "request completed"
        );
    } else {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            trace_id = %trace_id,
            "request completed"
        );
    }
}

async fn add_trace_headers(req: Request<Body>, next: Next) -> Response {
    let mut res = next.run(req).await;

    let span_context = Span::current().context().span().span_context().clone();

    if span_context.is_valid()
        && let Ok(val) = HeaderValue::from_str(&span_context.trace_id().to_string())
    {
        res.headers_mut()
            .insert(HeaderName::from_static("x-trace-id"), val);
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_exists() {
        let is_hex = GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit());
        assert!(is_hex || GIT_COMMIT_HASH == ":-(");
    }

    #[test]
    fn test_make_span_name() {
        let request = Request::builder()
            .method("GET")
            .uri("/_api/v1.0/profiles")
            .header("x-request-id", "01HZX")
            .body(Body::empty())
            .unwrap();

        let span = make_span(&request);
        assert_eq!(span.metadata().map(|m| m.name()), Some("http.server.request"));
    }

    #[tokio::test]
    async fn test_bind_rejects_hostname() {
        let res = bind(0, Some("localhost".to_string())).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_bind_explicit_loopback() -> Result<()> {
        let (listener, addr) = bind(0, Some("127.0.0.1".to_string())).await?;
        assert!(addr.starts_with("127.0.0.1:"));
        assert!(listener.local_addr()?.port() > 0);
        Ok(())
    }
}
