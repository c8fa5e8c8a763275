//! Activity Tracker + Stop-Guard / Start-Debounce registry (spec.md §4.3, §4.7).
//!
//! Single-writer-per-map discipline: the dispatcher writes `last_activity`
//! and `recently_started`; the reaper and scheduler write `stopping`. Each
//! map is a [`DashMap`], so check-and-set against one key is a single
//! critical section without a process-wide lock.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::info;

/// Started by the dispatcher when it kicks off a `start`; self-expiring.
#[derive(Debug, Clone, Copy)]
pub struct RecentlyStarted {
    pub started_at: Instant,
    pub expiry: Instant,
}

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);
const LOG_RATE_LIMIT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct ActivityTracker {
    last_activity: DashMap<String, Instant>,
    recently_started: DashMap<String, RecentlyStarted>,
    stopping: DashMap<String, ()>,
    activated_at: DashMap<String, Instant>,
    last_logged: DashMap<String, Instant>,
}

/// RAII guard for the `stopping` map: acquired via
/// [`ActivityTracker::try_acquire_stop`] and released on drop, so a stop
/// attempt that panics or returns early still clears the guard.
pub struct StopGuard<'a> {
    tracker: &'a ActivityTracker,
    name: String,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.tracker.stopping.remove(&self.name);
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records inbound activity for `name`. Unconditional on the stored
    /// timestamp; only the *logging* of this event is rate-limited.
    pub fn touch(&self, name: &str) {
        let now = Instant::now();
        self.last_activity.insert(name.to_string(), now);
        let should_log = match self.last_logged.get(name) {
            Some(t) if now.duration_since(*t) < LOG_RATE_LIMIT => false,
            _ => true,
        };
        if should_log {
            self.last_logged.insert(name.to_string(), now);
            info!(backend = name, "activity recorded");
        }
    }

    pub fn last_activity(&self, name: &str) -> Option<Instant> {
        self.last_activity.get(name).map(|v| *v)
    }

    /// Initializes `last_activity` to `now` if unset, also bumping
    /// `activated_at` (DESIGN.md open question #1: every first sighting of a
    /// record gets a concrete activation instant, not a permanent `None`).
    /// Used both on first reaper observation (spec.md §4.5 step 2) and on
    /// config snapshot swap (spec.md §4.8).
    pub fn init_if_absent(&self, name: &str) -> bool {
        if self.last_activity.contains_key(name) {
            return false;
        }
        self.last_activity.insert(name.to_string(), Instant::now());
        self.bump_activated_at(name);
        true
    }

    /// True while a start debounce window is active for `name`.
    pub fn is_recently_started(&self, name: &str) -> bool {
        match self.recently_started.get(name) {
            Some(entry) => Instant::now() < entry.expiry,
            None => false,
        }
    }

    /// Marks that a start was just issued for `name`, opening the debounce
    /// window. Returns `false` (no-op) if a window is already open.
    pub fn mark_started(&self, name: &str) -> bool {
        let now = Instant::now();
        if self.is_recently_started(name) {
            return false;
        }
        self.recently_started.insert(
            name.to_string(),
            RecentlyStarted {
                started_at: now,
                expiry: now + DEBOUNCE_WINDOW,
            },
        );
        true
    }

    /// Tries to acquire the per-name stop guard. `None` if a stop is already
    /// in flight for this name.
    pub fn try_acquire_stop(&self, name: &str) -> Option<StopGuard<'_>> {
        if self.stopping.insert(name.to_string(), ()).is_some() {
            // Someone already held it: put it back and refuse.
            return None;
        }
        Some(StopGuard {
            tracker: self,
            name: name.to_string(),
        })
    }

    pub fn is_stopping(&self, name: &str) -> bool {
        self.stopping.contains_key(name)
    }

    /// `activated_at` monotonically increases across the record's lifetime
    /// (spec.md §3 invariant); called on first sighting and on any admin
    /// toggle of `active`.
    pub fn bump_activated_at(&self, name: &str) {
        self.activated_at.insert(name.to_string(), Instant::now());
    }

    pub fn activated_at(&self, name: &str) -> Option<Instant> {
        self.activated_at.get(name).map(|v| *v)
    }

    /// Test-only: rewinds `last_activity`/`activated_at` by `ago` so idle-
    /// timeout scenarios don't require sleeping real wall-clock seconds.
    #[cfg(any(test, feature = "testing"))]
    pub fn backdate_last_activity(&self, name: &str, ago: Duration) {
        self.last_activity
            .insert(name.to_string(), Instant::now() - ago);
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn backdate_activated_at(&self, name: &str, ago: Duration) {
        self.activated_at
            .insert(name.to_string(), Instant::now() - ago);
    }

    /// Drops every companion entry for names no longer present in the
    /// config snapshot, and initializes entries for brand-new names
    /// (spec.md §4.8). In-flight operations keyed by dropped names are left
    /// to complete; their eventual results are simply discarded by callers
    /// that re-check membership before acting on them.
    pub fn sync_with_snapshot(&self, names: &HashSet<String>) {
        let stale: Vec<String> = self
            .last_activity
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| !names.contains(k))
            .collect();
        for name in stale {
            self.last_activity.remove(&name);
            self.recently_started.remove(&name);
            self.stopping.remove(&name);
            self.activated_at.remove(&name);
            self.last_logged.remove(&name);
        }
        for name in names {
            // `init_if_absent` already bumps `activated_at` for newly-seen
            // names; nothing further to do here.
            self.init_if_absent(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_suppresses_second_start() {
        let t = ActivityTracker::new();
        assert!(t.mark_started("a"));
        assert!(!t.mark_started("a"));
        assert!(t.is_recently_started("a"));
    }

    #[test]
    fn stop_guard_is_exclusive() {
        let t = ActivityTracker::new();
        let g1 = t.try_acquire_stop("b");
        assert!(g1.is_some());
        assert!(t.try_acquire_stop("b").is_none());
        drop(g1);
        assert!(t.try_acquire_stop("b").is_some());
    }

    #[test]
    fn sync_drops_removed_names_and_seeds_new() {
        let t = ActivityTracker::new();
        t.init_if_absent("old");
        let mut keep = HashSet::new();
        keep.insert("new".to_string());
        t.sync_with_snapshot(&keep);
        assert!(t.last_activity("old").is_none());
        assert!(t.last_activity("new").is_some());
        assert!(t.activated_at("new").is_some());
    }

    #[test]
    fn init_if_absent_also_sets_activated_at() {
        // A backend first seen outside of sync_with_snapshot (e.g. the
        // reaper's own first-observation path) must not be left with
        // activated_at == None, or it would be permanently exempt from
        // idle-stopping.
        let t = ActivityTracker::new();
        assert!(t.activated_at("c").is_none());
        assert!(t.init_if_absent("c"));
        assert!(t.activated_at("c").is_some());
        // Second call is a no-op and must not re-bump activated_at's caller
        // contract (init_if_absent returns false, so reaper.rs treats this
        // tick as a normal observation rather than a fresh first-sighting).
        assert!(!t.init_if_absent("c"));
    }
}
