// ===============================
// src/http.rs (REST API + /metrics)
// ===============================
//
// Envelope sukses : { success: true,  data, timestamp }
// Envelope error  : { success: false, error: { id, message }, timestamp }
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::breaker::CircuitBreaker;
use crate::cache::TieredCache;
use crate::domain::now_iso;
use crate::metrics::encode_metrics;
use crate::subscriptions::{Group, SubscriptionRegistry};

const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("route not found: {0}")]
    NotFound(String),
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub struct AppState {
    pub agg: Arc<Aggregator>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<TieredCache>,
    pub registry: Arc<SubscriptionRegistry>,
    pub started: Instant,
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
    resp
}

fn ok<T: Serialize>(data: T) -> Result<Response<Body>, ApiError> {
    let data = serde_json::to_value(data).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "success": true, "data": data, "timestamp": now_iso() }),
    ))
}

fn error_response(e: &ApiError) -> Response<Body> {
    let id = format!("{:08x}", rand::random::<u32>());
    let status = e.status();
    if status.is_server_error() {
        error!(%id, error = %e, "request failed");
    } else {
        warn!(%id, error = %e, "request rejected");
    }
    json_response(
        status,
        &json!({
            "success": false,
            "error": { "id": id, "message": e.to_string() },
            "timestamp": now_iso(),
        }),
    )
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn route(state: &AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let method = req.method().clone();
    let query = req.uri().query().map(str::to_owned);
    let path = req.uri().path().trim_end_matches('/').to_string();
    drop(req);

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => ok(json!({
            "status": "healthy",
            "uptimeSecs": state.started.elapsed().as_secs(),
            "cache": state.cache.health(),
            "clients": state.registry.client_count(),
            "subscribers": {
                "metrics": state.registry.count(Group::Metrics),
                "breakdown": state.registry.count(Group::Breakdown),
            },
        })),

        (&Method::GET, "/api/pnl/current") => ok(state.agg.get_snapshot().await),

        (&Method::GET, "/api/pnl/history") => {
            let limit = match query_param(query.as_deref(), "limit") {
                Some(raw) => raw
                    .parse::<usize>()
                    .map_err(|_| ApiError::BadRequest(format!("invalid limit: {raw}")))?,
                None => DEFAULT_HISTORY_LIMIT,
            };
            ok(state.agg.get_history(limit))
        }

        (&Method::GET, "/api/pnl/breakdown") => ok(state.agg.get_component_breakdown().await),

        (&Method::GET, "/api/circuit-breaker/status") => ok(state.breaker.status()),

        (&Method::POST, "/api/circuit-breaker/reset") => {
            let service = query_param(query.as_deref(), "service");
            let reset = state.breaker.reset(service.as_deref());
            ok(json!({
                "service": service.unwrap_or_else(|| "all".to_string()),
                "reset": reset,
            }))
        }

        (&Method::GET, "/api/cache/stats") => ok(json!({
            "stats": state.cache.stats(),
            "health": state.cache.health(),
        })),

        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Body::from(encode_metrics()));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }

        (
            m,
            "/health"
            | "/api/pnl/current"
            | "/api/pnl/history"
            | "/api/pnl/breakdown"
            | "/api/circuit-breaker/status"
            | "/api/circuit-breaker/reset"
            | "/api/cache/stats"
            | "/metrics",
        ) => Err(ApiError::MethodNotAllowed(m.clone())),

        _ => Err(ApiError::NotFound(path)),
    }
}

pub async fn handle(state: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(match route(&state, req).await {
        Ok(resp) => resp,
        Err(e) => error_response(&e),
    })
}

pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "http api listening");
    server
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    info!("http api stopped");
    Ok(())
}
