//! WebSocket upgrade bridging (spec.md §4.2, §5): forwards `Upgrade`/
//! `Connection` headers and bridges the bidirectional stream until either
//! peer closes.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::{Body, Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::activity::ActivityTracker;
use crate::config::Backend;
use crate::driver::registry::DriverRegistry;
use crate::holding_page::HoldingPage;

fn to_ws_url(base: &str, path_and_query: &str) -> anyhow::Result<String> {
    let mut url = url::Url::parse(base)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot set scheme"))?;
    Ok(format!(
        "{}://{}{}{}",
        scheme,
        url.host_str().ok_or_else(|| anyhow::anyhow!("missing host"))?,
        url.port().map(|p| format!(":{p}")).unwrap_or_default(),
        path_and_query
    ))
}

pub async fn bridge(
    req: Request<Body>,
    backend: &Backend,
    drivers: &DriverRegistry,
    activity: &Arc<ActivityTracker>,
    holding_page: &HoldingPage,
) -> Response<Body> {
    let Some(driver) = drivers.for_name(&backend.name) else {
        return not_ready(backend, holding_page);
    };
    if !driver.is_running(&backend.name).await {
        if activity.mark_started(&backend.name) {
            let driver = driver.clone();
            let name = backend.name.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.start(&name).await {
                    warn!(backend = %name, error = %e, "websocket-triggered start failed");
                }
            });
        }
        return not_ready(backend, holding_page);
    }

    let Some(base) = backend.url.as_deref() else {
        return not_ready(backend, holding_page);
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let upstream_url = match to_ws_url(base, &path_and_query) {
        Ok(u) => u,
        Err(e) => {
            error!(backend = %backend.name, error = %e, "failed to build upstream ws url");
            return not_ready(backend, holding_page);
        }
    };

    let backend_name = backend.name.clone();
    let activity = Arc::clone(activity);
    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                let client_ws = match websocket.await {
                    Ok(ws) => ws,
                    Err(e) => {
                        error!(backend = %backend_name, error = %e, "client websocket upgrade failed");
                        return;
                    }
                };
                let (upstream_ws, _) = match connect_async(&upstream_url).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(backend = %backend_name, error = %e, "failed to connect upstream websocket");
                        return;
                    }
                };
                info!(backend = %backend_name, "websocket bridge established");
                bridge_streams(client_ws, upstream_ws, &activity, &backend_name).await;
                info!(backend = %backend_name, "websocket bridge closed");
            });
            response
        }
        Err(e) => {
            error!(backend = %backend.name, error = %e, "websocket upgrade negotiation failed");
            not_ready(backend, holding_page)
        }
    }
}

/// Bridges frames in both directions, touching `lastActivity` on every
/// forwarded frame (spec.md §4.3: "Every successful forwarded response
/// (including WebSocket upstream responses) updates `lastActivity`"), so a
/// busy long-lived connection with no new HTTP requests isn't reaped mid-use.
async fn bridge_streams(
    client_ws: hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    upstream_ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    activity: &ActivityTracker,
    backend_name: &str,
) {
    let (mut client_tx, mut client_rx) = client_ws.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            activity.touch(backend_name);
            if forward_client_to_upstream(&mut upstream_tx, msg).await.is_err() {
                break;
            }
        }
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            activity.touch(backend_name);
            if forward_upstream_to_client(&mut client_tx, msg).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

async fn forward_client_to_upstream(
    upstream_tx: &mut futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >,
    msg: Message,
) -> anyhow::Result<()> {
    upstream_tx.send(msg).await?;
    Ok(())
}

async fn forward_upstream_to_client(
    client_tx: &mut futures::stream::SplitSink<
        hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
        Message,
    >,
    msg: Message,
) -> anyhow::Result<()> {
    client_tx.send(msg).await?;
    Ok(())
}

fn not_ready(backend: &Backend, holding_page: &HoldingPage) -> Response<Body> {
    let body = holding_page.render(
        backend.host.as_deref().unwrap_or_default(),
        backend.path.as_deref().unwrap_or_default(),
        &backend.name,
    );
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
