//! Admin HTTP surface (spec.md §6, SPEC_FULL.md §4.9): status/ready/start/
//! stop for a single backend, plus `/metrics` and `/healthz`. Routed with
//! `routerify` over `hyper`, mirroring the teacher's `utils::http` +
//! `health_server` split between the proxy listener and a companion
//! mgmt/metrics listener.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Request, Response, Server, StatusCode};
use routerify::prelude::*;
use routerify::{Router, RouterService};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::activity::ActivityTracker;
use crate::config::ConfigHandle;
use crate::driver::registry::DriverRegistry;
use crate::error::{json_response, ApiError};
use crate::metrics;

const READY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AdminState {
    pub config: Arc<ConfigHandle>,
    pub activity: Arc<ActivityTracker>,
    pub drivers: Arc<DriverRegistry>,
    pub http_client: reqwest::Client,
}

fn router(state: Arc<AdminState>) -> Router<Body, Infallible> {
    Router::builder()
        .data(state)
        .get("/healthz", healthz)
        .get("/metrics", metrics_route)
        .get("/api/containers/:name/status", status_route)
        .get("/api/containers/:name/ready", ready_route)
        .post("/api/containers/:name/start", start_route)
        .post("/api/containers/:name/stop", stop_route)
        .build()
        .expect("admin router builds")
}

pub async fn serve(addr: SocketAddr, state: Arc<AdminState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let service = RouterService::new(router(state)).expect("admin router service builds");
    info!(%addr, "admin http surface listening");
    Server::bind(&addr)
        .serve(service)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(Response::new(Body::from("ok")))
}

async fn metrics_route(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::render()))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

fn path_param(req: &Request<Body>, name: &str) -> Option<String> {
    req.param(name).cloned()
}

async fn status_route(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let name = match path_param(&req, "name") {
        Some(n) => n,
        None => return Ok(ApiError::BadRequest("missing name".into()).into_response()),
    };
    let state = req.data::<Arc<AdminState>>().cloned().expect("admin state present");
    let snapshot = state.config.current();
    if !snapshot.backends.contains_key(&name) {
        return Ok(ApiError::NotFound(name).into_response());
    }
    let running = match state.drivers.for_name(&name) {
        Some(d) => d.is_running(&name).await,
        None => false,
    };
    let last_activity = state
        .activity
        .last_activity(&name)
        .map(|i| i.elapsed().as_secs());
    let body = json!({ "name": name, "running": running, "lastActivity": last_activity });
    Ok(json_response(StatusCode::OK, body).unwrap_or_else(|_| ApiError::BadRequest("encode error".into()).into_response()))
}

async fn ready_route(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let name = match path_param(&req, "name") {
        Some(n) => n,
        None => return Ok(ApiError::BadRequest("missing name".into()).into_response()),
    };
    let state = req.data::<Arc<AdminState>>().cloned().expect("admin state present");
    let snapshot = state.config.current();
    let Some(backend) = snapshot.backends.get(&name) else {
        return Ok(ApiError::NotFound(name).into_response());
    };
    let running = match state.drivers.for_name(&name) {
        Some(d) => d.is_running(&name).await,
        None => false,
    };
    let ready = if running {
        match &backend.url {
            Some(url) => tokio::time::timeout(READY_CHECK_TIMEOUT, state.http_client.get(url.as_str()).send())
                .await
                .map(|r| r.map(|resp| resp.status().is_success()).unwrap_or(false))
                .unwrap_or(false),
            None => false,
        }
    } else {
        false
    };
    Ok(json_response(StatusCode::OK, json!({ "ready": ready }))
        .unwrap_or_else(|_| ApiError::BadRequest("encode error".into()).into_response()))
}

async fn start_route(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let name = match path_param(&req, "name") {
        Some(n) => n,
        None => return Ok(ApiError::BadRequest("missing name".into()).into_response()),
    };
    let state = req.data::<Arc<AdminState>>().cloned().expect("admin state present");
    let Some(driver) = state.drivers.for_name(&name) else {
        return Ok(ApiError::NotFound(name).into_response());
    };
    match driver.start(&name).await {
        Ok(()) => Ok(json_response(StatusCode::OK, json!({ "ok": true }))
            .unwrap_or_else(|_| ApiError::BadRequest("encode error".into()).into_response())),
        Err(e) => Ok(ApiError::Internal(e.into()).into_response()),
    }
}

async fn stop_route(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let name = match path_param(&req, "name") {
        Some(n) => n,
        None => return Ok(ApiError::BadRequest("missing name".into()).into_response()),
    };
    let state = req.data::<Arc<AdminState>>().cloned().expect("admin state present");
    let Some(driver) = state.drivers.for_name(&name) else {
        return Ok(ApiError::NotFound(name).into_response());
    };
    match driver.stop(&name).await {
        Ok(()) => Ok(json_response(StatusCode::OK, json!({ "ok": true }))
            .unwrap_or_else(|_| ApiError::BadRequest("encode error".into()).into_response())),
        Err(e) => Ok(ApiError::Internal(e.into()).into_response()),
    }
}
