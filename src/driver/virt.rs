//! Virtualization driver: Proxmox-style REST API over TLS, authenticated by
//! a static API-token header (spec.md §4.1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::config::PveConfig;

use super::{poll_until, DriverError, WorkloadDriver, STATUS_DEADLINE, START_STOP_INITIATE_DEADLINE};

pub struct VirtDriver {
    config: PveConfig,
    client: reqwest::Client,
}

/// Parsed `label:vmid@node` composite name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtName {
    pub label: String,
    pub vmid: String,
    pub node: String,
}

impl VirtName {
    pub fn parse(name: &str) -> Option<Self> {
        let (left, node) = name.split_once('@')?;
        let (label, vmid) = left.split_once(':')?;
        Some(VirtName {
            label: label.to_string(),
            vmid: vmid.to_string(),
            node: node.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct StatusResponse {
    data: StatusData,
}

#[derive(Deserialize)]
struct StatusData {
    status: String,
    #[serde(default)]
    uptime: Option<i64>,
}

impl VirtDriver {
    pub fn new(config: PveConfig) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(false)
            .build()
            .unwrap_or_default();
        VirtDriver { config, client }
    }

    fn base(&self, node: &str) -> String {
        format!(
            "https://{}:{}/api2/json/nodes/{}",
            self.config.hostname, self.config.port, node
        )
    }

    fn auth_header(&self) -> String {
        format!(
            "PVEAPIToken={}!{}={}",
            self.config.user, self.config.token_id, self.config.token
        )
    }

    async fn status(&self, v: &VirtName) -> Option<StatusData> {
        let url = format!("{}/lxc/{}/status/current", self.base(&v.node), v.vmid);
        let resp = tokio::time::timeout(
            STATUS_DEADLINE,
            self.client
                .get(url)
                .header("Authorization", self.auth_header())
                .send(),
        )
        .await
        .ok()?
        .ok()?;
        resp.json::<StatusResponse>().await.ok().map(|r| r.data)
    }

    async fn post_action(&self, v: &VirtName, action: &str) -> Result<(), DriverError> {
        let url = format!("{}/lxc/{}/status/{}", self.base(&v.node), v.vmid, action);
        tokio::time::timeout(
            START_STOP_INITIATE_DEADLINE,
            self.client
                .post(url)
                .header("Authorization", self.auth_header())
                .send(),
        )
        .await
        .map_err(|_| DriverError::Timeout)?
        .map(|_| ())
        .map_err(|e| DriverError::Transport(e.into()))
    }
}

#[async_trait]
impl WorkloadDriver for VirtDriver {
    async fn is_running(&self, name: &str) -> bool {
        let Some(v) = VirtName::parse(name) else {
            return false;
        };
        matches!(self.status(&v).await, Some(s) if s.status == "running")
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        let Some(v) = VirtName::parse(name) else {
            return Err(DriverError::Transport(anyhow::anyhow!(
                "not a virtualization name: {name}"
            )));
        };
        if self.is_running(name).await {
            return Ok(());
        }
        self.post_action(&v, "start").await?;
        poll_until(self, name, true).await;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        let Some(v) = VirtName::parse(name) else {
            return Err(DriverError::Transport(anyhow::anyhow!(
                "not a virtualization name: {name}"
            )));
        };
        if !self.is_running(name).await {
            return Ok(());
        }
        self.post_action(&v, "stop").await?;
        poll_until(self, name, false).await;
        Ok(())
    }

    async fn list(&self) -> Vec<String> {
        #[derive(Deserialize)]
        struct LxcEntry {
            vmid: serde_json::Value,
        }
        #[derive(Deserialize)]
        struct LxcList {
            data: Vec<LxcEntry>,
        }
        let url = format!("{}/lxc", self.base(&self.config.node));
        let resp = match self
            .client
            .get(url)
            .header("Authorization", self.auth_header())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "pve lxc list failed");
                return Vec::new();
            }
        };
        let parsed: LxcList = match resp.json().await {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        parsed
            .data
            .into_iter()
            .map(|e| format!("lxc:{}@{}", e.vmid, self.config.node))
            .collect()
    }

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        let v = VirtName::parse(name)?;
        let data = self.status(&v).await?;
        let uptime = data.uptime?;
        Some(Utc::now() - chrono::Duration::seconds(uptime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_name() {
        let v = VirtName::parse("ubuntu:104@pve1").unwrap();
        assert_eq!(v.label, "ubuntu");
        assert_eq!(v.vmid, "104");
        assert_eq!(v.node, "pve1");
    }

    #[test]
    fn rejects_plain_name() {
        assert!(VirtName::parse("plain-container").is_none());
    }
}
