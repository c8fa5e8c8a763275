use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use idle_proxy::EngineArgs;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// On-demand reverse proxy for containerized web services.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// TCP port for the proxy.
    #[arg(long, env = "PORT", default_value_t = 10000)]
    port: u16,

    /// Optional companion admin HTTP server port.
    #[arg(long, env = "UI_PORT")]
    ui_port: Option<u16>,

    /// Remote socket-proxy daemon, e.g. `tcp://host:2375`.
    #[arg(long, env = "DOCKER_PROXY_URL")]
    docker_proxy_url: Option<String>,

    /// Path to the local container-runtime control socket.
    #[arg(long, env = "DOCKER_SOCKET_PATH")]
    docker_socket_path: Option<String>,

    /// Path to the configuration document.
    #[arg(long, env = "CONFIG_PATH", default_value = "./config.json")]
    config_path: PathBuf,

    /// Optional override for the holding-page HTML template.
    #[arg(long, env = "HOLDING_PAGE_PATH")]
    holding_page_path: Option<PathBuf>,

    /// `compact` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    log_format: String,

    /// How often the idle reaper sweeps (spec.md §4.5 default: 10s).
    #[arg(long, env = "REAPER_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    reaper_interval: Duration,

    /// How often the scheduler checks timers (spec.md §4.6 default: 59s).
    #[arg(long, env = "SCHEDULER_INTERVAL", default_value = "59s", value_parser = humantime::parse_duration)]
    scheduler_interval: Duration,

    /// Config-file poll interval, capped at 500ms per spec.md §6.
    #[arg(long, env = "CONFIG_POLL_INTERVAL", default_value = "500ms", value_parser = humantime::parse_duration)]
    config_poll_interval: Duration,
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "starting idle-proxy");

    let proxy_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let admin_addr: Option<SocketAddr> = args.ui_port.map(|p| ([0, 0, 0, 0], p).into());

    idle_proxy::run(EngineArgs {
        config_path: args.config_path,
        proxy_addr,
        admin_addr,
        docker_proxy_url: args.docker_proxy_url,
        docker_socket_path: args.docker_socket_path,
        holding_page_path: args.holding_page_path,
        reaper_interval: args.reaper_interval,
        scheduler_interval: args.scheduler_interval,
        config_poll_interval: args.config_poll_interval,
    })
    .await
}
