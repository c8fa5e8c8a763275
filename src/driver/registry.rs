//! Picks the right driver for a backend name, purely by shape (spec.md §4.1
//! "Driver selection is purely by `name` shape").

use std::sync::Arc;

use super::runtime::RuntimeDriver;
use super::virt::VirtDriver;
use super::WorkloadDriver;
use crate::config::PveConfig;

pub struct DriverRegistry {
    runtime: Arc<dyn WorkloadDriver>,
    virt: Option<Arc<dyn WorkloadDriver>>,
}

impl DriverRegistry {
    pub fn new(runtime: RuntimeDriver, pve: Option<PveConfig>) -> Self {
        DriverRegistry {
            runtime: Arc::new(runtime),
            virt: pve.map(|c| Arc::new(VirtDriver::new(c)) as Arc<dyn WorkloadDriver>),
        }
    }

    /// `None` when `name` has virtualization shape but no `apiKeys.pve` was
    /// configured — callers should treat this like a driver that always
    /// reports "not running" (spec.md §6: "absent ⇒ driver disabled").
    pub fn for_name(&self, name: &str) -> Option<Arc<dyn WorkloadDriver>> {
        if is_virtualization_shape(name) {
            self.virt.clone()
        } else {
            Some(self.runtime.clone())
        }
    }

    /// Test-only constructor: one fake driver services every name,
    /// regardless of shape, so unit tests don't need a real runtime or
    /// Proxmox endpoint.
    #[cfg(any(test, feature = "testing"))]
    pub fn new_uniform(driver: Arc<dyn WorkloadDriver>) -> Self {
        DriverRegistry {
            runtime: driver.clone(),
            virt: Some(driver),
        }
    }
}

pub fn is_virtualization_shape(name: &str) -> bool {
    match (name.find(':'), name.find('@')) {
        (Some(colon), Some(at)) => colon < at,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_detection() {
        assert!(is_virtualization_shape("ubuntu:104@pve1"));
        assert!(!is_virtualization_shape("plain"));
        assert!(!is_virtualization_shape("a@b:c"));
    }
}
