//! Group Lifecycle Manager (spec.md §4.4): resolves membership, starts
//! "active members" together, stops only once the whole group is idle.

use tracing::{info, warn};

use crate::activity::ActivityTracker;
use crate::config::{ConfigSnapshot, Group};
use crate::driver::registry::DriverRegistry;

/// Starts every active, not-already-running member, in declared order.
/// `start` calls are fired in order but do not wait for their predecessor
/// to finish before advancing (spec.md §5 "start proceeds in declared
/// order but does not require predecessor completion").
pub async fn start_group(group: &Group, snapshot: &ConfigSnapshot, drivers: &DriverRegistry) {
    for member in &group.containers {
        let Some(backend) = snapshot.backends.get(member) else {
            continue;
        };
        if !backend.active {
            continue;
        }
        let Some(driver) = drivers.for_name(member) else {
            continue;
        };
        if driver.is_running(member).await {
            continue;
        }
        let driver = driver.clone();
        let member = member.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.start(&member).await {
                warn!(backend = %member, error = %e, "group start failed");
            } else {
                info!(backend = %member, "group member started");
            }
        });
    }
}

/// Stops every member not already in `stopping`, sequentially and
/// synchronously (spec.md §5 "stop is sequential and synchronous per
/// member").
pub async fn stop_group(
    group: &Group,
    drivers: &DriverRegistry,
    activity: &ActivityTracker,
) {
    for member in &group.containers {
        if activity.is_stopping(member) {
            continue;
        }
        let Some(driver) = drivers.for_name(member) else {
            continue;
        };
        let Some(_guard) = activity.try_acquire_stop(member) else {
            continue;
        };
        match driver.stop(member).await {
            Ok(()) => {
                crate::metrics::record_driver_call("stop", "ok");
                crate::metrics::record_stop(member, "group_idle");
                info!(backend = %member, "group member stopped");
            }
            Err(e) => {
                crate::metrics::record_driver_call("stop", "error");
                warn!(backend = %member, error = %e, "group stop failed");
            }
        }
    }
}

/// The group-idle predicate (spec.md §4.4): true only if *every* member is
/// running, backend-active, idle past the group timeout, and was started
/// before the group timeout window.
pub async fn group_is_idle(
    group: &Group,
    snapshot: &ConfigSnapshot,
    drivers: &DriverRegistry,
    activity: &ActivityTracker,
) -> bool {
    if group.containers.is_empty() {
        return false;
    }
    let timeout = std::time::Duration::from_secs(group.idle_timeout);
    for member in &group.containers {
        let Some(backend) = snapshot.backends.get(member) else {
            return false;
        };
        if !backend.active {
            return false;
        }
        let Some(driver) = drivers.for_name(member) else {
            return false;
        };
        if !driver.is_running(member).await {
            return false;
        }
        let last_activity = match activity.last_activity(member) {
            Some(t) => t,
            None => return false,
        };
        if last_activity.elapsed() <= timeout {
            return false;
        }
        let started_at = match driver.started_at(member).await {
            Some(t) => t,
            None => return false,
        };
        let age = chrono::Utc::now().signed_duration_since(started_at);
        if age < chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::driver::fake::FakeDriver;
    use crate::driver::registry::DriverRegistry;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn backend(name: &str) -> Backend {
        Backend {
            name: name.to_string(),
            friendly_name: None,
            host: Some(format!("{name}.example")),
            path: Some(name.to_string()),
            url: Some(format!("http://{name}:80")),
            idle_timeout: 30,
            active: true,
            activated_at: None,
        }
    }

    #[test]
    fn empty_group_is_never_idle_by_construction() {
        let group = Group {
            name: "g".into(),
            active: true,
            idle_timeout: 30,
            containers: vec![],
        };
        assert!(group.containers.is_empty());
    }

    #[tokio::test]
    async fn group_idle_requires_every_member_idle() {
        let fake = Arc::new(FakeDriver::new());
        let drivers = DriverRegistry::new_uniform(fake.clone() as Arc<dyn crate::driver::WorkloadDriver>);
        let activity = ActivityTracker::new();

        let long_ago = chrono::Utc::now() - chrono::Duration::seconds(120);
        fake.set_running_since("x", long_ago);
        fake.set_running_since("y", long_ago);

        let mut backends = HashMap::new();
        backends.insert("x".to_string(), backend("x"));
        backends.insert("y".to_string(), backend("y"));
        let snapshot = ConfigSnapshot {
            version: 0,
            backends,
            groups: HashMap::new(),
            schedules: vec![],
            pve: None,
        };

        // idle_timeout of zero turns "elapsed since last touch" into the
        // only real constraint, so a short real sleep is enough to cross it.
        let group = Group {
            name: "g".into(),
            active: true,
            idle_timeout: 0,
            containers: vec!["x".to_string(), "y".to_string()],
        };

        activity.touch("x");
        activity.touch("y");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Both members idle past the timeout: the group is idle.
        assert!(group_is_idle(&group, &snapshot, &drivers, &activity).await);

        // y gets fresh activity: group cohesion holds it open (spec.md §8
        // scenario 3), even though x alone would be idle.
        activity.touch("y");
        assert!(!group_is_idle(&group, &snapshot, &drivers, &activity).await);
    }

    #[tokio::test]
    async fn stop_group_skips_members_already_stopping() {
        let fake = Arc::new(FakeDriver::new());
        let drivers = DriverRegistry::new_uniform(fake.clone() as Arc<dyn crate::driver::WorkloadDriver>);
        let activity = ActivityTracker::new();
        fake.set_running_since("a", chrono::Utc::now());
        fake.set_running_since("b", chrono::Utc::now());

        let guard = activity.try_acquire_stop("a").unwrap();
        let group = Group {
            name: "g".into(),
            active: true,
            idle_timeout: 10,
            containers: vec!["a".to_string(), "b".to_string()],
        };
        stop_group(&group, &drivers, &activity).await;

        assert!(fake.is_running("a").await, "a was guarded, must not be stopped");
        assert!(!fake.is_running("b").await, "b had no guard, must be stopped");
        drop(guard);
    }
}
