//! End-to-end dispatcher coverage: a real hyper server in front of a
//! `FakeDriver`, hit over loopback TCP, proxying to a second toy hyper
//! server standing in for the backend's upstream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

use idle_proxy::activity::ActivityTracker;
use idle_proxy::config::{Backend, ConfigDocument, ConfigHandle, Group};
use idle_proxy::dispatcher::Dispatcher;
use idle_proxy::driver::fake::FakeDriver;
use idle_proxy::driver::registry::DriverRegistry;
use idle_proxy::driver::WorkloadDriver;
use idle_proxy::holding_page::HoldingPage;

async fn spawn_upstream(addr: SocketAddr, body: &'static str) {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| async move {
            Ok::<_, Infallible>(Response::new(Body::from(body)))
        }))
    });
    tokio::spawn(async move {
        let _ = Server::bind(&addr).serve(make_svc).await;
    });
    // Give the listener a beat to bind before the caller starts hammering it.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

async fn config_handle(suffix: &str, doc: ConfigDocument) -> Arc<ConfigHandle> {
    let path = std::env::temp_dir().join(format!(
        "idle-proxy-dispatcher-test-{}-{suffix}.json",
        std::process::id()
    ));
    tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
        .await
        .unwrap();
    Arc::new(ConfigHandle::load(&path).await.unwrap())
}

fn backend(name: &str, host: &str, path: &str, url: &str) -> Backend {
    Backend {
        name: name.to_string(),
        friendly_name: None,
        host: Some(host.to_string()),
        path: Some(path.to_string()),
        url: Some(url.to_string()),
        idle_timeout: 300,
        active: true,
        activated_at: None,
    }
}

#[tokio::test]
async fn proxies_to_a_running_backend() {
    let upstream_addr: SocketAddr = "127.0.0.1:18091".parse().unwrap();
    spawn_upstream(upstream_addr, "hello from upstream").await;

    let fake = Arc::new(FakeDriver::new());
    fake.set_running_since("app", chrono::Utc::now());
    let drivers = Arc::new(DriverRegistry::new_uniform(
        fake.clone() as Arc<dyn WorkloadDriver>
    ));
    let activity = Arc::new(ActivityTracker::new());

    let mut doc = ConfigDocument::default();
    doc.containers.insert(
        "app".to_string(),
        backend("app", "app.example", "app", "http://127.0.0.1:18091"),
    );
    let config = config_handle("proxies-running", doc).await;

    let dispatcher = Arc::new(Dispatcher::new(
        config,
        activity,
        drivers,
        HoldingPage::default_template(),
    ));
    let dispatcher_addr: SocketAddr = "127.0.0.1:18092".parse().unwrap();
    tokio::spawn(dispatcher.serve(dispatcher_addr, tokio_util::sync::CancellationToken::new()));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let client = hyper::Client::new();
    let req = Request::builder()
        .uri(format!("http://{dispatcher_addr}/app/"))
        .header("host", "app.example")
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::OK);
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"hello from upstream");
}

#[tokio::test]
async fn serves_holding_page_for_a_stopped_backend() {
    let fake = Arc::new(FakeDriver::new());
    let drivers = Arc::new(DriverRegistry::new_uniform(
        fake.clone() as Arc<dyn WorkloadDriver>
    ));
    let activity = Arc::new(ActivityTracker::new());

    let mut doc = ConfigDocument::default();
    doc.containers.insert(
        "sleepy".to_string(),
        backend("sleepy", "sleepy.example", "sleepy", "http://127.0.0.1:18093"),
    );
    let config = config_handle("holding-page", doc).await;

    let dispatcher = Arc::new(Dispatcher::new(
        config,
        activity,
        drivers,
        HoldingPage::default_template(),
    ));
    let dispatcher_addr: SocketAddr = "127.0.0.1:18094".parse().unwrap();
    tokio::spawn(dispatcher.serve(dispatcher_addr, tokio_util::sync::CancellationToken::new()));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let client = hyper::Client::new();
    let req = Request::builder()
        .uri(format!("http://{dispatcher_addr}/sleepy/"))
        .header("host", "sleepy.example")
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::OK);
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("sleepy"));

    // The stopped-backend request should have kicked off a start.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(fake.is_running("sleepy").await);
}

#[tokio::test]
async fn group_path_request_starts_every_active_member() {
    let fake = Arc::new(FakeDriver::new());
    let drivers = Arc::new(DriverRegistry::new_uniform(
        fake.clone() as Arc<dyn WorkloadDriver>
    ));
    let activity = Arc::new(ActivityTracker::new());

    let mut doc = ConfigDocument::default();
    doc.containers.insert(
        "stack-web".to_string(),
        backend("stack-web", "stack-web.example", "stack-web", "http://127.0.0.1:18096"),
    );
    doc.containers.insert(
        "stack-worker".to_string(),
        backend(
            "stack-worker",
            "stack-worker.example",
            "stack-worker",
            "http://127.0.0.1:18097",
        ),
    );
    doc.groups.insert(
        "stack".to_string(),
        Group {
            name: "stack".to_string(),
            active: true,
            idle_timeout: 0,
            containers: vec!["stack-web".to_string(), "stack-worker".to_string()],
        },
    );
    let config = config_handle("group-start", doc).await;

    let dispatcher = Arc::new(Dispatcher::new(
        config,
        activity,
        drivers,
        HoldingPage::default_template(),
    ));
    let dispatcher_addr: SocketAddr = "127.0.0.1:18098".parse().unwrap();
    tokio::spawn(dispatcher.serve(dispatcher_addr, tokio_util::sync::CancellationToken::new()));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // No Host header match; routed by the group's own path segment instead.
    let client = hyper::Client::new();
    let req = Request::builder()
        .uri(format!("http://{dispatcher_addr}/stack/"))
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::OK);

    // Both group members should be started, not just the one the request
    // was routed to.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(fake.is_running("stack-web").await);
    assert!(fake.is_running("stack-worker").await);
}

#[tokio::test]
async fn unmatched_request_is_a_404() {
    let fake = Arc::new(FakeDriver::new());
    let drivers = Arc::new(DriverRegistry::new_uniform(
        fake as Arc<dyn WorkloadDriver>
    ));
    let activity = Arc::new(ActivityTracker::new());
    let config = config_handle("no-match", ConfigDocument::default()).await;

    let dispatcher = Arc::new(Dispatcher::new(
        config,
        activity,
        drivers,
        HoldingPage::default_template(),
    ));
    let dispatcher_addr: SocketAddr = "127.0.0.1:18095".parse().unwrap();
    tokio::spawn(dispatcher.serve(dispatcher_addr, tokio_util::sync::CancellationToken::new()));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let client = hyper::Client::new();
    let req = Request::builder()
        .uri(format!("http://{dispatcher_addr}/nothing-here"))
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::NOT_FOUND);
}
