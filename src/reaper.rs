//! Idle Reaper (spec.md §4.5): periodic sweep that stops backends (and
//! groups) that have been idle beyond their configured timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::ActivityTracker;
use crate::config::ConfigHandle;
use crate::driver::registry::DriverRegistry;
use crate::group;

pub const REAPER_INTERVAL: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_STATUS_CALLS: usize = 10;

pub struct Reaper {
    config: Arc<ConfigHandle>,
    activity: Arc<ActivityTracker>,
    drivers: Arc<DriverRegistry>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        config: Arc<ConfigHandle>,
        activity: Arc<ActivityTracker>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        Reaper {
            config,
            activity,
            drivers,
            interval: REAPER_INTERVAL,
        }
    }

    /// Overrides the sweep period (e.g. from a CLI flag); spec.md §4.5's
    /// 10s default still applies when this is never called.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until `shutdown` is cancelled (spec.md §5's long-lived reaper
    /// task), mirroring the teacher's `cancellation_token`-gated
    /// maintenance tasks in `bin/proxy.rs`.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("reaper shutting down");
                    return;
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let snapshot = self.config.current();

        // Batch `is_running` across all known backends, capped at
        // MAX_CONCURRENT_STATUS_CALLS in flight (spec.md §4.5).
        let names: Vec<String> = snapshot.backends.keys().cloned().collect();
        let drivers = &self.drivers;
        let running: std::collections::HashMap<String, bool> = stream::iter(names)
            .map(|name| async move {
                let driver = drivers.for_name(&name);
                let is_running = match driver {
                    Some(d) => d.is_running(&name).await,
                    None => false,
                };
                crate::metrics::record_driver_call("is_running", "ok");
                (name, is_running)
            })
            .buffer_unordered(MAX_CONCURRENT_STATUS_CALLS)
            .collect()
            .await;

        for (name, backend) in &snapshot.backends {
            if !backend.active || backend.idle_timeout == 0 {
                continue;
            }
            if snapshot.is_in_active_group(name) {
                continue;
            }
            if self.activity.init_if_absent(name) {
                // First observation: no immediate stop.
                continue;
            }
            let Some(last) = self.activity.last_activity(name) else {
                continue;
            };
            let timeout = Duration::from_secs(backend.idle_timeout);
            let timeout_reached = last.elapsed() > timeout;
            if !timeout_reached {
                continue;
            }
            let is_running = running.get(name).copied().unwrap_or(false);
            if !is_running {
                continue;
            }
            let Some(driver) = self.drivers.for_name(name) else {
                continue;
            };
            let Some(started_at) = driver.started_at(name).await else {
                continue;
            };
            let started_age = chrono::Utc::now().signed_duration_since(started_at);
            let chrono_timeout =
                chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
            if started_age < chrono_timeout {
                continue;
            }
            let Some(activated_at) = self.activity.activated_at(name) else {
                continue;
            };
            if activated_at.elapsed() <= timeout {
                continue;
            }
            if self.activity.is_stopping(name) {
                continue;
            }
            let Some(_guard) = self.activity.try_acquire_stop(name) else {
                continue;
            };
            match driver.stop(name).await {
                Ok(()) => {
                    crate::metrics::record_driver_call("stop", "ok");
                    crate::metrics::record_stop(name, "idle_timeout");
                    info!(backend = %name, "reaper stopped idle backend");
                }
                Err(e) => {
                    crate::metrics::record_driver_call("stop", "error");
                    warn!(backend = %name, error = %e, "reaper stop failed");
                }
            }
        }

        for g in snapshot.groups.values() {
            if !g.active || g.idle_timeout == 0 {
                continue;
            }
            if group::group_is_idle(g, &snapshot, &self.drivers, &self.activity).await {
                group::stop_group(g, &self.drivers, &self.activity).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, ConfigDocument, Group};
    use crate::driver::fake::FakeDriver;
    use crate::driver::WorkloadDriver;

    async fn config_handle_with(suffix: &str, doc: ConfigDocument) -> Arc<ConfigHandle> {
        let path = std::env::temp_dir().join(format!(
            "idle-proxy-reaper-test-{}-{suffix}.json",
            std::process::id()
        ));
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();
        Arc::new(ConfigHandle::load(&path).await.unwrap())
    }

    fn backend(name: &str, idle_timeout: u64) -> Backend {
        Backend {
            name: name.to_string(),
            friendly_name: None,
            host: Some(format!("{name}.example")),
            path: Some(name.to_string()),
            url: Some(format!("http://{name}:80")),
            idle_timeout,
            active: true,
            activated_at: None,
        }
    }

    #[tokio::test]
    async fn first_observation_never_stops_immediately() {
        let fake = Arc::new(FakeDriver::new());
        fake.set_running_since("a", chrono::Utc::now());
        let drivers = Arc::new(DriverRegistry::new_uniform(
            fake.clone() as Arc<dyn WorkloadDriver>
        ));
        let activity = Arc::new(ActivityTracker::new());

        let mut doc = ConfigDocument::default();
        doc.containers.insert("a".to_string(), backend("a", 0));
        let config = config_handle_with("first-observation", doc).await;

        let reaper = Reaper::new(config, activity.clone(), drivers);
        reaper.tick().await;

        assert!(
            fake.is_running("a").await,
            "first sighting must not stop the backend"
        );
        assert!(activity.last_activity("a").is_some());
    }

    #[tokio::test]
    async fn reaper_stops_backend_past_timeout() {
        let fake = Arc::new(FakeDriver::new());
        let long_ago = chrono::Utc::now() - chrono::Duration::seconds(120);
        fake.set_running_since("a", long_ago);
        let drivers = Arc::new(DriverRegistry::new_uniform(
            fake.clone() as Arc<dyn WorkloadDriver>
        ));
        let activity = Arc::new(ActivityTracker::new());

        let mut doc = ConfigDocument::default();
        doc.containers.insert("a".to_string(), backend("a", 30));
        let config = config_handle_with("past-timeout", doc).await;

        let reaper = Reaper::new(config, activity.clone(), drivers);
        // First tick only seeds last_activity for "a" (first observation).
        reaper.tick().await;
        // Backdate rather than sleep real seconds: last activity and
        // activation both happened well outside the 30s idleTimeout.
        activity.backdate_last_activity("a", Duration::from_secs(120));
        activity.backdate_activated_at("a", Duration::from_secs(120));

        reaper.tick().await;
        assert!(
            !fake.is_running("a").await,
            "idle backend past timeout should be stopped"
        );
    }

    #[tokio::test]
    async fn active_group_member_skips_individual_timeout() {
        let fake = Arc::new(FakeDriver::new());
        let long_ago = chrono::Utc::now() - chrono::Duration::seconds(120);
        fake.set_running_since("a", long_ago);
        let drivers = Arc::new(DriverRegistry::new_uniform(
            fake.clone() as Arc<dyn WorkloadDriver>
        ));
        let activity = Arc::new(ActivityTracker::new());

        let mut doc = ConfigDocument::default();
        doc.containers.insert("a".to_string(), backend("a", 30));
        doc.groups.insert(
            "g".to_string(),
            Group {
                name: "g".to_string(),
                active: true,
                idle_timeout: 3600,
                containers: vec!["a".to_string()],
            },
        );
        let config = config_handle_with("group-member", doc).await;

        let reaper = Reaper::new(config, activity.clone(), drivers);
        reaper.tick().await;
        // Same backdating as the individual-timeout test above: if "a" were
        // not a group member this alone would be enough to stop it.
        activity.backdate_last_activity("a", Duration::from_secs(120));
        activity.backdate_activated_at("a", Duration::from_secs(120));
        reaper.tick().await;

        assert!(
            fake.is_running("a").await,
            "a group member's own idleTimeout must never trigger an individual stop"
        );
    }
}
