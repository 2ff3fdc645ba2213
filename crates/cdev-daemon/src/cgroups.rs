//! Cgroup device-access arbitration.
//!
//! When a filter rule requests `CGROUP="<controller>"`, the router asks the
//! matching manager to allow (on `add`) or deny (on `remove`) the device
//! for the client's container. Managers expose exactly that narrow
//! interface; everything else about the container runtime stays outside
//! the router.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cdev_core::Device;
use tracing::{info, warn};

/// A container-runtime specific device-cgroup driver.
pub trait ControlGroupManager: Send + Sync {
    /// Grant the container access to the device.
    fn allow(&self, container: &str, dev: &Device) -> std::io::Result<()>;

    /// Revoke the container's access to the device.
    fn deny(&self, container: &str, dev: &Device) -> std::io::Result<()>;
}

/// Registry of managers, keyed by the controller name rules use.
pub struct ManagerRegistry {
    managers: HashMap<String, Arc<dyn ControlGroupManager>>,
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        let mut managers: HashMap<String, Arc<dyn ControlGroupManager>> = HashMap::new();
        managers.insert("lxc".into(), Arc::new(LxcManager::default()));
        Self { managers }
    }
}

impl ManagerRegistry {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ControlGroupManager>> {
        self.managers.get(name).cloned()
    }
}

/// Device-cgroup driver for LXC containers: writes rules into the
/// container's `devices.allow` / `devices.deny` cgroup files.
pub struct LxcManager {
    cgroup_root: PathBuf,
}

impl Default for LxcManager {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup/devices/lxc"),
        }
    }
}

impl LxcManager {
    /// Manager rooted at a non-standard cgroupfs location (tests).
    #[must_use]
    pub fn with_root(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
        }
    }

    fn update(&self, container: &str, dev: &Device, allow: bool) -> std::io::Result<()> {
        let (maj, min) = dev.major_minor();
        if maj == 0 {
            return Ok(());
        }

        let kind = if dev.subsystem() == Some("block") { 'b' } else { 'c' };
        let perms = if allow { "rwm" } else { "rm" };
        let knob = if allow { "devices.allow" } else { "devices.deny" };
        let rule = format!("{kind} {maj}:{min} {perms}");

        info!(container, knob, rule, "updating container device cgroup");

        let path = self.cgroup_root.join(container).join(knob);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)?;
        file.write_all(rule.as_bytes())
    }
}

impl ControlGroupManager for LxcManager {
    fn allow(&self, container: &str, dev: &Device) -> std::io::Result<()> {
        self.update(container, dev, true)
    }

    fn deny(&self, container: &str, dev: &Device) -> std::io::Result<()> {
        self.update(container, dev, false)
    }
}

/// Apply one arbitration request, logging instead of propagating failures:
/// a missing controller or cgroup path must not drop the event.
pub fn arbitrate(
    registry: &ManagerRegistry,
    controller: &str,
    container: &str,
    dev: &Device,
    allow: bool,
) {
    let Some(manager) = registry.get(controller) else {
        warn!(controller, "no such cgroup controller manager");
        return;
    };
    let result = if allow {
        manager.allow(container, dev)
    } else {
        manager.deny(container, dev)
    };
    if let Err(err) = result {
        warn!(controller, container, %err, "cgroup update failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cdev_core::DeviceRegistry;

    use super::*;

    fn sound_device() -> (DeviceRegistry, cdev_core::SharedDevice) {
        let registry = DeviceRegistry::new("/nonexistent-sys");
        let props: BTreeMap<String, String> = [
            ("DEVPATH", "/devices/sound/pcmC0D0p"),
            ("SUBSYSTEM", "sound"),
            ("MAJOR", "116"),
            ("MINOR", "24"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let dev = registry.insert_from_props(&props).unwrap();
        (registry, dev)
    }

    #[test]
    fn allow_writes_a_char_rule() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("steambox")).unwrap();
        let manager = LxcManager::with_root(root.path());

        let (_registry, dev) = sound_device();
        manager.allow("steambox", &dev.read().unwrap()).unwrap();

        let written =
            std::fs::read_to_string(root.path().join("steambox/devices.allow")).unwrap();
        assert_eq!(written, "c 116:24 rwm");
    }

    #[test]
    fn deny_writes_to_the_deny_knob() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("steambox")).unwrap();
        let manager = LxcManager::with_root(root.path());

        let (_registry, dev) = sound_device();
        manager.deny("steambox", &dev.read().unwrap()).unwrap();

        let written =
            std::fs::read_to_string(root.path().join("steambox/devices.deny")).unwrap();
        assert_eq!(written, "c 116:24 rm");
    }

    #[test]
    fn devices_without_a_major_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let manager = LxcManager::with_root(root.path());

        let registry = DeviceRegistry::new("/nonexistent-sys");
        let props: BTreeMap<String, String> =
            [("DEVPATH", "/devices/virtual/net/veth0"), ("SUBSYSTEM", "net")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        let dev = registry.insert_from_props(&props).unwrap();

        manager.allow("steambox", &dev.read().unwrap()).unwrap();
        assert!(!root.path().join("steambox").exists());
    }

    #[test]
    fn unknown_controllers_are_tolerated() {
        let registry = ManagerRegistry::default();
        let (_devreg, dev) = sound_device();
        // Must not panic or error out.
        arbitrate(&registry, "nspawn", "box", &dev.read().unwrap(), true);
    }
}
