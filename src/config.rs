//! Configuration snapshot consumed from the (externally owned) config store.
//!
//! The store itself — persistence, CRUD, the admin UI — is out of scope
//! (spec.md §1); this module only defines the document shape, loads it from
//! disk, and watches it for changes, swapping an immutable snapshot that the
//! rest of the engine reads through [`ConfigHandle`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

fn default_true() -> bool {
    true
}

/// A single backend workload as described by spec.md §3.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Backend {
    pub name: String,
    #[serde(default, rename = "friendlyName")]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "idleTimeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Instant (millis since epoch) the backend was last toggled active.
    /// `None` until the record is first observed; see DESIGN.md open
    /// question #1 for why the engine sets this on first sighting rather
    /// than leaving it `null` forever.
    #[serde(default, rename = "activatedAt")]
    pub activated_at: Option<i64>,
}

impl Backend {
    /// `label:vmid@node` ⇒ virtualization backend; otherwise runtime.
    pub fn is_virtualization(&self) -> bool {
        matches!((self.name.find(':'), self.name.find('@')), (Some(c), Some(a)) if c < a)
    }
}

fn deserialize_containers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Group {
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, rename = "idleTimeout")]
    pub idle_timeout: u64,
    #[serde(deserialize_with = "deserialize_containers")]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum TargetType {
    #[serde(rename = "container")]
    Container,
    #[serde(rename = "group")]
    Group,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Timer {
    pub days: Vec<u8>,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "stopTime")]
    pub stop_time: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScheduleRule {
    pub target: String,
    #[serde(rename = "targetType")]
    pub target_type: TargetType,
    pub timers: Vec<Timer>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct PveConfig {
    pub hostname: String,
    pub port: u16,
    pub node: String,
    pub user: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ApiKeys {
    #[serde(default)]
    pub pve: Option<PveConfig>,
}

/// The raw document as persisted by the (external) config store.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConfigDocument {
    #[serde(default)]
    pub containers: HashMap<String, Backend>,
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub groups: HashMap<String, Group>,
    #[serde(default, rename = "groupOrder")]
    pub group_order: Vec<String>,
    #[serde(default)]
    pub schedules: Vec<ScheduleRule>,
    #[serde(default, rename = "apiKeys")]
    pub api_keys: ApiKeys,
}

/// The processed, read-only snapshot the rest of the engine consumes.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub backends: HashMap<String, Backend>,
    pub groups: HashMap<String, Group>,
    pub schedules: Vec<ScheduleRule>,
    pub pve: Option<PveConfig>,
}

impl ConfigSnapshot {
    fn from_document(doc: ConfigDocument, version: u64) -> Self {
        ConfigSnapshot {
            version,
            backends: doc.containers,
            groups: doc.groups,
            schedules: doc.schedules,
            pve: doc.api_keys.pve,
        }
    }

    /// Names of groups (active or not) that list `name` as a member.
    pub fn groups_containing<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Group> {
        self.groups.values().filter(move |g| g.containers.iter().any(|c| c == name))
    }

    /// True if `name` is a member of any currently-active group.
    pub fn is_in_active_group(&self, name: &str) -> bool {
        self.groups_containing(name).any(|g| g.active)
    }
}

fn parse_document(bytes: &[u8]) -> anyhow::Result<ConfigDocument> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Hands out the current [`ConfigSnapshot`] and watches the backing file for
/// changes, swapping in a new snapshot atomically (readers never observe a
/// torn mix of old/new state — spec.md §3 Lifecycle).
pub struct ConfigHandle {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
    path: PathBuf,
    changed: watch::Sender<u64>,
}

impl ConfigHandle {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path).await.unwrap_or_default();
        let doc = if bytes.is_empty() {
            ConfigDocument::default()
        } else {
            parse_document(&bytes).unwrap_or_else(|e| {
                error!(error = %e, "config parse failure, starting from an empty document");
                ConfigDocument::default()
            })
        };
        let snapshot = ConfigSnapshot::from_document(doc, 0);
        let (tx, _rx) = watch::channel(0);
        Ok(ConfigHandle {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
            path,
            changed: tx,
        })
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Re-reads the file and swaps the snapshot in if it parses. On parse
    /// failure the last good snapshot is retained and the error logged
    /// (spec.md §7: "Config parse failure: Last good snapshot retained").
    pub async fn reload(&self) {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to read config file");
                return;
            }
        };
        let doc = match parse_document(&bytes) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "config parse failure, keeping previous snapshot");
                return;
            }
        };
        let next_version = self.inner.load().version + 1;
        let snapshot = ConfigSnapshot::from_document(doc, next_version);
        info!(version = next_version, "config snapshot replaced");
        self.inner.store(Arc::new(snapshot));
        let _ = self.changed.send(next_version);
    }

    /// Spawns the file-watcher task with the default 500ms poll ceiling
    /// from spec.md §6.
    pub fn watch(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.watch_with_interval(Duration::from_millis(500))
    }

    /// Same as [`Self::watch`] with a caller-chosen poll interval, still
    /// capped at 500ms per spec.md §6 ("poll interval" reads as a ceiling,
    /// not a target).
    pub fn watch_with_interval(self: &Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        let poll_interval = poll_interval.min(Duration::from_millis(500));
        let handle = Arc::clone(self);
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let path = handle.path.clone();
        let mut watcher: Option<RecommendedWatcher> = match notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = tx.try_send(());
                }
            },
        ) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "failed to construct file watcher, falling back to polling only");
                None
            }
        };
        if let Some(w) = watcher.as_mut() {
            if let Some(parent) = path.parent() {
                let _ = w.watch(parent, RecursiveMode::NonRecursive);
            }
        }
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task.
            let _watcher = watcher;
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = rx.recv() => {}
                }
                handle.reload().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_container_normalizes_to_vec() {
        let json = r#"{"name":"g","containers":"only-one"}"#;
        let g: Group = serde_json::from_str(json).unwrap();
        assert_eq!(g.containers, vec!["only-one".to_string()]);
    }

    #[test]
    fn list_containers_preserved() {
        let json = r#"{"name":"g","containers":["a","b"]}"#;
        let g: Group = serde_json::from_str(json).unwrap();
        assert_eq!(g.containers, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn virtualization_name_shape() {
        let mut b = Backend {
            name: "ubuntu:104@pve1".into(),
            friendly_name: None,
            host: None,
            path: None,
            url: None,
            idle_timeout: 0,
            active: true,
            activated_at: None,
        };
        assert!(b.is_virtualization());
        b.name = "plain-container".into();
        assert!(!b.is_virtualization());
        b.name = "weird@name:only".into();
        assert!(!b.is_virtualization());
    }

    #[test]
    fn empty_document_parses() {
        let doc: ConfigDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.containers.is_empty());
        assert!(doc.groups.is_empty());
    }
}
