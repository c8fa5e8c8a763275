//! Request Dispatcher (spec.md §4.2): matches inbound requests to backends,
//! starts them on demand, proxies HTTP/WebSocket traffic once ready.

mod websocket;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::config::{Backend, ConfigHandle, ConfigSnapshot, Group};
use crate::driver::registry::DriverRegistry;
use crate::error::{DispatchError, ReportableError, UserFacingError};
use crate::group;
use crate::holding_page::HoldingPage;
use crate::metrics;

pub struct Dispatcher {
    pub config: Arc<ConfigHandle>,
    pub activity: Arc<ActivityTracker>,
    pub drivers: Arc<DriverRegistry>,
    pub holding_page: HoldingPage,
    pub http_client: Client<hyper::client::HttpConnector>,
}

/// Outcome of resolving an inbound request to a backend (spec.md §4.2
/// Matching): exact host match, path-segment match, or group match (which
/// remembers the group so group-aware start is triggered, per §4.4).
enum Matched<'a> {
    Direct(&'a Backend),
    ViaGroup(&'a Backend, &'a Group),
}

impl<'a> Matched<'a> {
    fn backend(&self) -> &'a Backend {
        match self {
            Matched::Direct(b) => b,
            Matched::ViaGroup(b, _) => b,
        }
    }

    /// `Some` when this request was routed via an active group's path
    /// segment, so a start trigger for it must start every active member
    /// (spec.md §4.2 "group-aware"), not just the one selected backend.
    fn group(&self) -> Option<&'a Group> {
        match self {
            Matched::Direct(_) => None,
            Matched::ViaGroup(_, g) => Some(g),
        }
    }
}

fn first_path_segment(path: &str) -> Option<&str> {
    path.trim_start_matches('/').split('/').next().filter(|s| !s.is_empty())
}

fn match_backend<'a>(snapshot: &'a ConfigSnapshot, host: Option<&str>, path: &str) -> Option<Matched<'a>> {
    if let Some(host) = host {
        if let Some(b) = snapshot.backends.values().find(|b| b.host.as_deref() == Some(host)) {
            return Some(Matched::Direct(b));
        }
    }
    if let Some(segment) = first_path_segment(path) {
        if let Some(b) = snapshot.backends.values().find(|b| b.path.as_deref() == Some(segment)) {
            return Some(Matched::Direct(b));
        }
        if let Some(group) = snapshot.groups.get(segment) {
            if group.active {
                if let Some(member_name) = group.containers.iter().find(|name| {
                    snapshot
                        .backends
                        .get(*name)
                        .map(|b| b.host.is_some() && b.path.is_some())
                        .unwrap_or(false)
                }) {
                    if let Some(b) = snapshot.backends.get(member_name) {
                        return Some(Matched::ViaGroup(b, group));
                    }
                }
            }
        }
    }
    None
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn html_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

impl Dispatcher {
    pub fn new(
        config: Arc<ConfigHandle>,
        activity: Arc<ActivityTracker>,
        drivers: Arc<DriverRegistry>,
        holding_page: HoldingPage,
    ) -> Self {
        Dispatcher {
            config,
            activity,
            drivers,
            holding_page,
            http_client: Client::new(),
        }
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
        let make_svc = make_service_fn(move |_conn| {
            let dispatcher = Arc::clone(&self);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let dispatcher = Arc::clone(&dispatcher);
                    let request_id = Uuid::new_v4();
                    async move {
                        Ok::<_, Infallible>(
                            dispatcher
                                .handle(req)
                                .instrument(tracing::info_span!("request", %request_id))
                                .await,
                        )
                    }
                }))
            }
        });
        info!(%addr, "request dispatcher listening");
        Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string());
        let path = req.uri().path().to_string();

        let snapshot = self.config.current();
        let matched = match match_backend(&snapshot, host.as_deref(), &path) {
            Some(m) => m,
            None => {
                let err = DispatchError::NoMatch;
                metrics::record_request("unknown", err.get_error_kind().to_metric_label());
                return text_response(err.status(), &err.to_string_client());
            }
        };
        let matched_group = matched.group();
        let backend = matched.backend();

        if backend.host.is_none() || backend.path.is_none() {
            let err = DispatchError::Misconfigured(backend.name.clone());
            error!(backend = %backend.name, "{err}");
            metrics::record_request(&backend.name, err.get_error_kind().to_metric_label());
            return text_response(err.status(), &err.to_string_client());
        }
        if !backend.active {
            let err = DispatchError::Inactive(backend.name.clone());
            warn!(backend = %backend.name, "{err}");
            metrics::record_request(&backend.name, err.get_error_kind().to_metric_label());
            return text_response(err.status(), &err.to_string_client());
        }

        self.activity.touch(&backend.name);

        if hyper_tungstenite::is_upgrade_request(&req) {
            return self.handle_websocket_upgrade(req, backend).await;
        }

        let Some(driver) = self.drivers.for_name(&backend.name) else {
            return html_response(
                StatusCode::OK,
                self.holding_page.render(
                    backend.host.as_deref().unwrap_or_default(),
                    backend.path.as_deref().unwrap_or_default(),
                    &backend.name,
                ),
            );
        };

        // Resolved per spec.md §9's open question: holding page iff
        // not-running; proxy iff running. `recentlyStarted` only guards
        // against issuing a second `start`, it never overrides this.
        let running = driver.is_running(&backend.name).await;
        if running {
            metrics::record_request(&backend.name, "proxied");
            return self.proxy_http(req, backend).await;
        }

        if self.activity.mark_started(&backend.name) {
            match matched_group {
                Some(member_group) => {
                    self.trigger_group_start(member_group.clone(), Arc::clone(&snapshot))
                }
                None => self.trigger_start(backend.name.clone()),
            }
        }
        metrics::record_request(&backend.name, "holding");
        html_response(
            StatusCode::OK,
            self.holding_page.render(
                backend.host.as_deref().unwrap_or_default(),
                backend.path.as_deref().unwrap_or_default(),
                &backend.name,
            ),
        )
    }

    fn trigger_start(&self, name: String) {
        let drivers = Arc::clone(&self.drivers);
        tokio::spawn(async move {
            let Some(driver) = drivers.for_name(&name) else {
                return;
            };
            if let Err(e) = driver.start(&name).await {
                warn!(backend = %name, error = %e, "dispatcher-triggered start failed");
            } else {
                info!(backend = %name, "dispatcher-triggered start completed");
            }
        });
    }

    /// Group-aware start trigger for a request routed via a group's path
    /// segment (spec.md §4.2 + §4.4): starts every active, not-yet-running
    /// member in declared order, not just the one member that was selected
    /// to serve this request.
    fn trigger_group_start(&self, group: Group, snapshot: Arc<ConfigSnapshot>) {
        let drivers = Arc::clone(&self.drivers);
        tokio::spawn(async move {
            group::start_group(&group, &snapshot, &drivers).await;
        });
    }

    async fn proxy_http(&self, mut req: Request<Body>, backend: &Backend) -> Response<Body> {
        let Some(base) = backend.url.as_deref() else {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "misconfigured");
        };
        let upstream_uri = match build_upstream_uri(base, &req) {
            Ok(u) => u,
            Err(_) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "misconfigured"),
        };
        *req.uri_mut() = upstream_uri;

        match self.http_client.request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                // Headers not yet sent on a connect/send failure: spec.md
                // §4.2 requires a 502 with the holding page body here.
                let err = DispatchError::Upstream(e.into());
                error!(backend = %backend.name, "{err}");
                metrics::record_request(&backend.name, err.get_error_kind().to_metric_label());
                html_response(
                    err.status(),
                    self.holding_page.render(
                        backend.host.as_deref().unwrap_or_default(),
                        backend.path.as_deref().unwrap_or_default(),
                        &backend.name,
                    ),
                )
            }
        }
    }

    async fn handle_websocket_upgrade(&self, req: Request<Body>, backend: &Backend) -> Response<Body> {
        websocket::bridge(req, backend, &self.drivers, &self.activity, &self.holding_page).await
    }
}

fn build_upstream_uri(base: &str, req: &Request<Body>) -> anyhow::Result<hyper::Uri> {
    let base = url::Url::parse(base)?;
    let mut upstream = format!(
        "{}://{}",
        base.scheme(),
        base.host_str().ok_or_else(|| anyhow::anyhow!("missing host"))?
    );
    if let Some(port) = base.port() {
        upstream.push_str(&format!(":{port}"));
    }
    upstream.push_str(req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"));
    Ok(upstream.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_path_segment_strips_leading_slash() {
        assert_eq!(first_path_segment("/app/sub"), Some("app"));
        assert_eq!(first_path_segment("/"), None);
        assert_eq!(first_path_segment(""), None);
    }
}
