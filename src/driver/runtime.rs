//! Container-runtime driver: local CLI subprocess or remote socket-proxy
//! daemon (spec.md §4.1, §6). When both are configured the remote path is
//! preferred, mirroring "Driver selection... When both are available, the
//! remote path is preferred."

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use super::{DriverError, WorkloadDriver, STATUS_DEADLINE, START_STOP_INITIATE_DEADLINE};

const LOCAL_SOCKET_PATH: &str = "/var/run/docker.sock";

pub enum RuntimeMode {
    /// Shell out to the local `docker` CLI.
    LocalCli { binary: String },
    /// Issue HTTP calls to a remote socket-proxy daemon.
    Remote {
        base_url: url::Url,
        client: reqwest::Client,
    },
}

pub struct RuntimeDriver {
    mode: RuntimeMode,
}

/// Detects whether the local control socket exists; callers combine this
/// with an optional `DOCKER_PROXY_URL` to pick a [`RuntimeMode`] (remote
/// preferred when both are present).
pub fn local_socket_available(path: Option<&str>) -> bool {
    let path = path.unwrap_or(LOCAL_SOCKET_PATH);
    PathBuf::from(path).exists()
}

/// `tcp://host:port` → `http://host:port`, per spec.md §6.
pub fn normalize_docker_proxy_url(raw: &str) -> anyhow::Result<url::Url> {
    let http_form = if let Some(rest) = raw.strip_prefix("tcp://") {
        format!("http://{rest}")
    } else {
        raw.to_string()
    };
    Ok(url::Url::parse(&http_form)?)
}

impl RuntimeDriver {
    pub fn local() -> Self {
        RuntimeDriver {
            mode: RuntimeMode::LocalCli {
                binary: "docker".to_string(),
            },
        }
    }

    pub fn remote(base_url: url::Url) -> Self {
        RuntimeDriver {
            mode: RuntimeMode::Remote {
                base_url,
                client: reqwest::Client::new(),
            },
        }
    }

    /// Picks remote over local when both inputs are available, as directed
    /// by spec.md §4.1/§6.
    pub fn select(docker_proxy_url: Option<&str>, socket_path: Option<&str>) -> Self {
        if let Some(raw) = docker_proxy_url {
            match normalize_docker_proxy_url(raw) {
                Ok(url) => return RuntimeDriver::remote(url),
                Err(e) => warn!(error = %e, "invalid DOCKER_PROXY_URL, falling back to local"),
            }
        }
        if local_socket_available(socket_path) {
            RuntimeDriver::local()
        } else {
            warn!("no container runtime socket or remote proxy configured, runtime driver will report all workloads as not running");
            RuntimeDriver::local()
        }
    }

    async fn run_cli(&self, args: &[&str]) -> anyhow::Result<String> {
        let RuntimeMode::LocalCli { binary } = &self.mode else {
            anyhow::bail!("not in local CLI mode");
        };
        let output = tokio::time::timeout(
            START_STOP_INITIATE_DEADLINE,
            Command::new(binary)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await??;
        if !output.status.success() {
            anyhow::bail!(
                "docker {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Deserialize)]
struct ContainerInspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "StartedAt")]
    started_at: Option<String>,
}

#[derive(Deserialize)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerInspectState,
}

#[derive(Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Names")]
    names: Vec<String>,
}

#[async_trait]
impl WorkloadDriver for RuntimeDriver {
    async fn is_running(&self, name: &str) -> bool {
        let result: anyhow::Result<bool> = match &self.mode {
            RuntimeMode::LocalCli { .. } => {
                match tokio::time::timeout(STATUS_DEADLINE, self.run_cli(&[
                    "inspect",
                    "-f",
                    "{{.State.Running}}",
                    name,
                ]))
                .await
                {
                    Ok(Ok(out)) => Ok(out.trim() == "true"),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(anyhow::anyhow!("timed out")),
                }
            }
            RuntimeMode::Remote { base_url, client } => {
                let url = match base_url.join(&format!("containers/{name}/json")) {
                    Ok(u) => u,
                    Err(e) => return { warn!(error = %e, "bad remote url"); false },
                };
                match tokio::time::timeout(STATUS_DEADLINE, client.get(url).send()).await {
                    Ok(Ok(resp)) if resp.status().is_success() => {
                        match resp.json::<ContainerInspect>().await {
                            Ok(body) => Ok(body.state.running),
                            Err(e) => Err(e.into()),
                        }
                    }
                    Ok(Ok(_)) => Ok(false),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(anyhow::anyhow!("timed out")),
                }
            }
        };
        result.unwrap_or(false)
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        match &self.mode {
            RuntimeMode::LocalCli { .. } => {
                tokio::time::timeout(START_STOP_INITIATE_DEADLINE, self.run_cli(&["start", name]))
                    .await
                    .map_err(|_| DriverError::Timeout)?
                    .map(|_| ())
                    .map_err(DriverError::Transport)
            }
            RuntimeMode::Remote { base_url, client } => {
                let url = base_url
                    .join(&format!("containers/{name}/start"))
                    .map_err(|e| DriverError::Transport(e.into()))?;
                tokio::time::timeout(START_STOP_INITIATE_DEADLINE, client.post(url).send())
                    .await
                    .map_err(|_| DriverError::Timeout)?
                    .map(|_| ())
                    .map_err(|e| DriverError::Transport(e.into()))
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        match &self.mode {
            RuntimeMode::LocalCli { .. } => {
                tokio::time::timeout(START_STOP_INITIATE_DEADLINE, self.run_cli(&["stop", name]))
                    .await
                    .map_err(|_| DriverError::Timeout)?
                    .map(|_| ())
                    .map_err(DriverError::Transport)
            }
            RuntimeMode::Remote { base_url, client } => {
                let url = base_url
                    .join(&format!("containers/{name}/stop"))
                    .map_err(|e| DriverError::Transport(e.into()))?;
                tokio::time::timeout(START_STOP_INITIATE_DEADLINE, client.post(url).send())
                    .await
                    .map_err(|_| DriverError::Timeout)?
                    .map(|_| ())
                    .map_err(|e| DriverError::Transport(e.into()))
            }
        }
    }

    async fn list(&self) -> Vec<String> {
        match &self.mode {
            RuntimeMode::LocalCli { .. } => {
                match self.run_cli(&["ps", "-a", "--format", "{{.Names}}"]).await {
                    Ok(out) => out.lines().map(|s| s.to_string()).collect(),
                    Err(e) => {
                        warn!(error = %e, "docker ps failed");
                        Vec::new()
                    }
                }
            }
            RuntimeMode::Remote { base_url, client } => {
                let url = match base_url.join("containers/json?all=true") {
                    Ok(u) => u,
                    Err(_) => return Vec::new(),
                };
                match client.get(url).send().await {
                    Ok(resp) => resp
                        .json::<Vec<ContainerSummary>>()
                        .await
                        .unwrap_or_default()
                        .into_iter()
                        .flat_map(|c| c.names)
                        .map(|n| n.trim_start_matches('/').to_string())
                        .collect(),
                    Err(e) => {
                        warn!(error = %e, "remote container list failed");
                        Vec::new()
                    }
                }
            }
        }
    }

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        match &self.mode {
            RuntimeMode::LocalCli { .. } => {
                let out = self
                    .run_cli(&["inspect", "-f", "{{.State.StartedAt}}", name])
                    .await
                    .ok()?;
                DateTime::parse_from_rfc3339(out.trim())
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }
            RuntimeMode::Remote { base_url, client } => {
                let url = base_url.join(&format!("containers/{name}/json")).ok()?;
                let resp = client.get(url).send().await.ok()?;
                let body: ContainerInspect = resp.json().await.ok()?;
                let raw = body.state.started_at?;
                DateTime::parse_from_rfc3339(&raw)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }
        }
    }
}
