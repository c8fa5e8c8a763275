//! In-memory driver used by tests (gated behind the `testing` feature, per
//! the teacher's `features.testing = []` convention).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{DriverError, WorkloadDriver};

#[derive(Default)]
pub struct FakeDriver {
    running: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running_since(&self, name: &str, since: DateTime<Utc>) {
        self.running.lock().insert(name.to_string(), since);
    }
}

#[async_trait]
impl WorkloadDriver for FakeDriver {
    async fn is_running(&self, name: &str) -> bool {
        self.running.lock().contains_key(name)
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        self.running
            .lock()
            .entry(name.to_string())
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        self.running.lock().remove(name);
        Ok(())
    }

    async fn list(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.running.lock().get(name).copied()
    }
}
