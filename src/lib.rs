//! On-demand reverse proxy for containerized web services: starts backend
//! workloads (Docker containers or Proxmox LXC instances) on first request,
//! tracks activity, and stops them once idle. See `SPEC_FULL.md` for the
//! full requirements this crate implements.

pub mod activity;
pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod group;
pub mod holding_page;
pub mod metrics;
pub mod reaper;
pub mod scheduler;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use activity::ActivityTracker;
use config::ConfigHandle;
use driver::registry::DriverRegistry;
use driver::runtime::RuntimeDriver;
use holding_page::HoldingPage;

pub struct EngineArgs {
    pub config_path: PathBuf,
    pub proxy_addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    pub docker_proxy_url: Option<String>,
    pub docker_socket_path: Option<String>,
    pub holding_page_path: Option<PathBuf>,
    pub reaper_interval: Duration,
    pub scheduler_interval: Duration,
    pub config_poll_interval: Duration,
}

/// Wires the engine's long-lived tasks together and runs until one exits
/// (mirrors the teacher's `client_tasks`/`maintenance_tasks` `JoinSet`
/// split in `bin/proxy.rs`, simplified to this crate's four tasks).
pub async fn run(args: EngineArgs) -> anyhow::Result<()> {
    let config = Arc::new(ConfigHandle::load(&args.config_path).await?);
    let _watcher = config.watch_with_interval(args.config_poll_interval);

    let activity = Arc::new(ActivityTracker::new());
    {
        let snapshot = config.current();
        let names: std::collections::HashSet<String> = snapshot.backends.keys().cloned().collect();
        activity.sync_with_snapshot(&names);
    }

    let runtime_driver = RuntimeDriver::select(
        args.docker_proxy_url.as_deref(),
        args.docker_socket_path.as_deref(),
    );
    let pve = config.current().pve.clone();
    let drivers = Arc::new(DriverRegistry::new(runtime_driver, pve));

    let holding_page = match &args.holding_page_path {
        Some(path) => HoldingPage::load(path).await,
        None => HoldingPage::default_template(),
    };

    metrics::init();

    let dispatcher = Arc::new(dispatcher::Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&activity),
        Arc::clone(&drivers),
        holding_page,
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            handle_signals(shutdown).await;
            Ok(())
        }
    });

    tasks.spawn({
        let config = Arc::clone(&config);
        let activity = Arc::clone(&activity);
        let shutdown = shutdown.clone();
        async move {
            sync_activity_on_reload(config, activity, shutdown).await;
            Ok(())
        }
    });

    tasks.spawn({
        let dispatcher = Arc::clone(&dispatcher);
        let addr = args.proxy_addr;
        let shutdown = shutdown.clone();
        async move { dispatcher.serve(addr, shutdown).await }
    });

    if let Some(admin_addr) = args.admin_addr {
        let admin_state = Arc::new(admin::AdminState {
            config: Arc::clone(&config),
            activity: Arc::clone(&activity),
            drivers: Arc::clone(&drivers),
            http_client: reqwest::Client::new(),
        });
        let shutdown = shutdown.clone();
        tasks.spawn(async move { admin::serve(admin_addr, admin_state, shutdown).await });
    } else {
        info!("UI_PORT not set, admin http surface disabled");
    }

    tasks.spawn({
        let reaper = reaper::Reaper::new(Arc::clone(&config), Arc::clone(&activity), Arc::clone(&drivers))
            .with_interval(args.reaper_interval);
        let shutdown = shutdown.clone();
        async move {
            reaper.run(shutdown).await;
            Ok(())
        }
    });

    tasks.spawn({
        let scheduler = scheduler::Scheduler::new(Arc::clone(&config), Arc::clone(&activity), Arc::clone(&drivers))
            .with_interval(args.scheduler_interval);
        let shutdown = shutdown.clone();
        async move {
            scheduler.run(shutdown).await;
            Ok(())
        }
    });

    // Any task exiting ends the run: either a listener bind failure, or a
    // clean shutdown once `shutdown` was cancelled by the signal task.
    if let Some(res) = tasks.join_next().await {
        res??;
    }
    shutdown.cancel();
    Ok(())
}

/// Drains `config.subscribe()` and re-syncs the activity tracker on every
/// snapshot swap (spec.md §4.8 / §8 scenario 6): `ConfigHandle::reload`
/// replaces the snapshot but has no reference to the activity maps, so this
/// is the task that actually drops removed backends' `lastActivity`/
/// `stopping`/`recentlyStarted` entries and seeds newly-added ones.
async fn sync_activity_on_reload(
    config: Arc<ConfigHandle>,
    activity: Arc<ActivityTracker>,
    shutdown: CancellationToken,
) {
    let mut changed = config.subscribe();
    loop {
        tokio::select! {
            res = changed.changed() => {
                if res.is_err() {
                    return;
                }
                let snapshot = config.current();
                let names: std::collections::HashSet<String> =
                    snapshot.backends.keys().cloned().collect();
                activity.sync_with_snapshot(&names);
            }
            _ = shutdown.cancelled() => {
                info!("config-sync task shutting down");
                return;
            }
        }
    }
}

/// Waits for Ctrl+C (or SIGTERM on unix) and cancels `shutdown`, letting
/// every long-lived task's graceful-shutdown path unwind, mirroring the
/// teacher's `cancellation_token`-driven `handle_signals` task in
/// `bin/proxy.rs`.
async fn handle_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
