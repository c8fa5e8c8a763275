//! Scheduler (spec.md §4.6): wall-clock day-of-week + HH:MM rule engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::ActivityTracker;
use crate::config::{ConfigHandle, TargetType};
use crate::driver::registry::DriverRegistry;
use crate::group;

pub const SCHEDULER_INTERVAL: Duration = Duration::from_secs(59);

pub struct Scheduler {
    config: Arc<ConfigHandle>,
    activity: Arc<ActivityTracker>,
    drivers: Arc<DriverRegistry>,
    interval: Duration,
}

fn hhmm_now() -> (u8, String) {
    let now = Local::now();
    let weekday = now.weekday_index_sunday0();
    (weekday, format!("{:02}:{:02}", now.hour(), now.minute()))
}

/// chrono's `Weekday` numbers Monday = 0; spec.md uses `0 = Sunday`.
trait SundayIndexed {
    fn weekday_index_sunday0(&self) -> u8;
}

impl SundayIndexed for chrono::DateTime<Local> {
    fn weekday_index_sunday0(&self) -> u8 {
        self.weekday().num_days_from_sunday() as u8
    }
}

impl Scheduler {
    pub fn new(
        config: Arc<ConfigHandle>,
        activity: Arc<ActivityTracker>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        Scheduler {
            config,
            activity,
            drivers,
            interval: SCHEDULER_INTERVAL,
        }
    }

    /// Overrides the tick period (e.g. from a CLI flag); spec.md §4.6's 59s
    /// default still applies when this is never called.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until `shutdown` is cancelled; same shape as [`crate::reaper::Reaper::run`].
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let snapshot = self.config.current();
        let (today, now_hhmm) = hhmm_now();

        for rule in &snapshot.schedules {
            let target_active = match rule.target_type {
                TargetType::Container => snapshot
                    .backends
                    .get(&rule.target)
                    .map(|b| b.active)
                    .unwrap_or(false),
                TargetType::Group => snapshot
                    .groups
                    .get(&rule.target)
                    .map(|g| g.active)
                    .unwrap_or(false),
            };
            if !target_active {
                continue;
            }

            for timer in &rule.timers {
                if !timer.active || !timer.days.contains(&today) {
                    continue;
                }
                if timer.start_time == now_hhmm {
                    self.fire_start(rule).await;
                } else if timer.stop_time == now_hhmm {
                    self.fire_stop(rule).await;
                }
            }
        }
    }

    /// Scheduled start is unconditional: it bypasses the start debounce
    /// (spec.md §4.6).
    async fn fire_start(&self, rule: &crate::config::ScheduleRule) {
        let snapshot = self.config.current();
        match rule.target_type {
            TargetType::Container => {
                if let Some(driver) = self.drivers.for_name(&rule.target) {
                    let name = rule.target.clone();
                    tokio::spawn(async move {
                        if let Err(e) = driver.start(&name).await {
                            warn!(backend = %name, error = %e, "scheduled start failed");
                        } else {
                            info!(backend = %name, "scheduled start fired");
                        }
                    });
                }
            }
            TargetType::Group => {
                if let Some(g) = snapshot.groups.get(&rule.target) {
                    group::start_group(g, &snapshot, &self.drivers).await;
                }
            }
        }
    }

    /// A scheduled stop never overrides the reaper's `stopping` guard; it
    /// logs a skip instead (spec.md §4.6 tie-break).
    async fn fire_stop(&self, rule: &crate::config::ScheduleRule) {
        let snapshot = self.config.current();
        match rule.target_type {
            TargetType::Container => {
                if self.activity.is_stopping(&rule.target) {
                    info!(backend = %rule.target, "scheduled stop skipped, reaper holds the guard");
                    return;
                }
                let Some(driver) = self.drivers.for_name(&rule.target) else {
                    return;
                };
                let Some(_guard) = self.activity.try_acquire_stop(&rule.target) else {
                    info!(backend = %rule.target, "scheduled stop skipped, guard taken concurrently");
                    return;
                };
                match driver.stop(&rule.target).await {
                    Ok(()) => {
                        crate::metrics::record_driver_call("stop", "ok");
                        crate::metrics::record_stop(&rule.target, "scheduled");
                        info!(backend = %rule.target, "scheduled stop fired");
                    }
                    Err(e) => {
                        crate::metrics::record_driver_call("stop", "error");
                        warn!(backend = %rule.target, error = %e, "scheduled stop failed");
                    }
                }
            }
            TargetType::Group => {
                if let Some(g) = snapshot.groups.get(&rule.target) {
                    group::stop_group(g, &self.drivers, &self.activity).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigDocument, Group, ScheduleRule, Timer};
    use crate::driver::fake::FakeDriver;
    use crate::driver::WorkloadDriver;

    #[test]
    fn timer_matches_only_its_day_and_minute() {
        let timer = Timer {
            days: vec![1, 3, 5],
            start_time: "09:00".into(),
            stop_time: "18:00".into(),
            active: true,
        };
        assert!(timer.days.contains(&1));
        assert!(!timer.days.contains(&0));
        assert_eq!(timer.start_time, "09:00");
    }

    async fn config_handle_with(suffix: &str, doc: ConfigDocument) -> Arc<ConfigHandle> {
        let path = std::env::temp_dir().join(format!(
            "idle-proxy-scheduler-test-{}-{suffix}.json",
            std::process::id()
        ));
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();
        Arc::new(ConfigHandle::load(&path).await.unwrap())
    }

    #[tokio::test]
    async fn fire_start_bypasses_debounce_and_starts_container() {
        let fake = Arc::new(FakeDriver::new());
        let drivers = Arc::new(DriverRegistry::new_uniform(
            fake.clone() as Arc<dyn WorkloadDriver>
        ));
        let activity = Arc::new(ActivityTracker::new());
        let config = config_handle_with("fire-start", ConfigDocument::default()).await;
        let scheduler = Scheduler::new(config, activity, drivers);

        let rule = ScheduleRule {
            target: "a".to_string(),
            target_type: TargetType::Container,
            timers: vec![],
        };
        scheduler.fire_start(&rule).await;
        // `fire_start` spawns the actual driver call, so give it a beat.
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(fake.is_running("a").await);
    }

    #[tokio::test]
    async fn fire_stop_skips_when_guard_already_held() {
        let fake = Arc::new(FakeDriver::new());
        fake.set_running_since("a", chrono::Utc::now());
        let drivers = Arc::new(DriverRegistry::new_uniform(
            fake.clone() as Arc<dyn WorkloadDriver>
        ));
        let activity = Arc::new(ActivityTracker::new());
        let config = config_handle_with("fire-stop-guarded", ConfigDocument::default()).await;
        let guard = activity.try_acquire_stop("a");
        let scheduler = Scheduler::new(config, activity.clone(), drivers);

        let rule = ScheduleRule {
            target: "a".to_string(),
            target_type: TargetType::Container,
            timers: vec![],
        };
        scheduler.fire_stop(&rule).await;

        assert!(
            fake.is_running("a").await,
            "reaper's in-flight stop guard must not be overridden"
        );
        drop(guard);
    }

    #[tokio::test]
    async fn fire_stop_on_group_stops_every_member() {
        let fake = Arc::new(FakeDriver::new());
        fake.set_running_since("a", chrono::Utc::now());
        fake.set_running_since("b", chrono::Utc::now());
        let drivers = Arc::new(DriverRegistry::new_uniform(
            fake.clone() as Arc<dyn WorkloadDriver>
        ));
        let activity = Arc::new(ActivityTracker::new());
        let mut doc = ConfigDocument::default();
        doc.groups.insert(
            "g".to_string(),
            Group {
                name: "g".to_string(),
                active: true,
                idle_timeout: 0,
                containers: vec!["a".to_string(), "b".to_string()],
            },
        );
        let config = config_handle_with("fire-stop-group", doc).await;
        let scheduler = Scheduler::new(config, activity, drivers);

        let rule = ScheduleRule {
            target: "g".to_string(),
            target_type: TargetType::Group,
            timers: vec![],
        };
        scheduler.fire_stop(&rule).await;

        assert!(!fake.is_running("a").await);
        assert!(!fake.is_running("b").await);
    }
}
