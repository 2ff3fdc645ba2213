//! Process-wide device registry with optional runtime-db backing.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::{Device, SharedDevice};

/// Default runtime directory for persisted device state.
pub const DEFAULT_RUNTIME_DIR: &str = "/run/cdev";

/// Errors from the runtime-db backing store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The device has no stable identity to derive a db filename from.
    #[error("device {devpath} has no id filename")]
    NoIdFilename {
        /// Devpath of the offending device.
        devpath: String,
    },

    /// An I/O error occurred while reading or replacing a db file.
    #[error("db I/O error on {}: {source}", path.display())]
    Io {
        /// File the operation targeted.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// In-memory map of sysfs path → device, one entry per canonical path.
///
/// Both daemons own exactly one registry, passed by reference from the
/// top-level daemon value. The registry is only ever mutated from the
/// cooperative scheduler's single thread; the inner locks formalize the
/// sharing, they are never contended.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<PathBuf, SharedDevice>>,
    sys_root: PathBuf,
    runtime_dir: RwLock<Option<PathBuf>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl DeviceRegistry {
    /// Create a registry rooted at the given sysfs mount (normally `/sys`;
    /// tests point this at a fixture tree).
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        let sys_root = sys_root.into();
        let sys_root = std::fs::canonicalize(&sys_root).unwrap_or(sys_root);
        Self {
            devices: RwLock::new(HashMap::new()),
            sys_root,
            runtime_dir: RwLock::new(None),
        }
    }

    /// The sysfs root this registry resolves devpaths against.
    #[must_use]
    pub fn sys_root(&self) -> &Path {
        &self.sys_root
    }

    /// Enable on-disk backing for device state under `dir` (normally
    /// [`DEFAULT_RUNTIME_DIR`]). Idempotent. Until this is called, flushes
    /// and db reads are no-ops, which is exactly what a dry-run agent wants.
    pub fn enable_persistent_registry(&self, dir: impl Into<PathBuf>) -> std::io::Result<()> {
        let dir = dir.into();
        let mut slot = self.runtime_dir.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref() == Some(&dir) {
            return Ok(());
        }
        std::fs::create_dir_all(dir.join("data"))?;
        *slot = Some(dir);
        Ok(())
    }

    /// Directory holding the per-device db files, when persistence is on.
    #[must_use]
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.runtime_dir
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|dir| dir.join("data"))
    }

    /// Runtime directory, when persistence is on.
    #[must_use]
    pub fn runtime_dir(&self) -> Option<PathBuf> {
        self.runtime_dir
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Look up the device at `syspath`, constructing it from sysfs on a
    /// miss. Returns `None` when the path does not denote a device. Two
    /// calls for the same path return the same shared handle.
    pub fn lookup_or_create(&self, syspath: &Path) -> Option<SharedDevice> {
        let real = std::fs::canonicalize(syspath).unwrap_or_else(|_| syspath.to_path_buf());
        if let Some(found) = self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&real)
        {
            return Some(Arc::clone(found));
        }

        let mut dev = super::sysfs::from_syspath(&self.sys_root, &real)?;
        self.load_db(&mut dev);
        Some(self.insert(dev))
    }

    /// [`lookup_or_create`](Self::lookup_or_create) addressed by devpath.
    pub fn lookup_or_create_devpath(&self, devpath: &str) -> Option<SharedDevice> {
        self.lookup_or_create(&self.sys_root.join(devpath.trim_start_matches('/')))
    }

    /// Register a device assembled from uevent properties. An existing
    /// entry for the same syspath is reused as-is; the properties only
    /// seed the device on first observation.
    pub fn insert_from_props(&self, props: &BTreeMap<String, String>) -> Option<SharedDevice> {
        let devpath = props.get("DEVPATH")?;
        let syspath = self.sys_root.join(devpath.trim_start_matches('/'));
        if let Some(found) = self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&syspath)
        {
            return Some(Arc::clone(found));
        }

        let mut dev = super::sysfs::from_props(&self.sys_root, props)?;
        self.load_db(&mut dev);
        Some(self.insert(dev))
    }

    fn insert(&self, dev: Device) -> SharedDevice {
        let syspath = dev.syspath().to_path_buf();
        let shared = Arc::new(RwLock::new(dev));
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(syspath, Arc::clone(&shared));
        shared
    }

    /// Walk up the devpath hierarchy to the nearest registered or
    /// constructible parent device.
    pub fn parent_of(&self, dev: &Device) -> Option<SharedDevice> {
        let mut devpath = dev.devpath().to_string();
        // Don't return pseudo-devices for top-level entries like /devices.
        while let Some(cut) = devpath[1..].rfind('/') {
            devpath.truncate(cut + 1);
            if let Some(parent) = self.lookup_or_create_devpath(&devpath) {
                return Some(parent);
            }
        }
        None
    }

    /// Drop the registry entry for `syspath`. Handles already held stay
    /// valid; later lookups construct a fresh device.
    pub fn invalidate(&self, syspath: &Path) {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(syspath);
    }

    /// Number of live entries (diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the device's mutable state (devlinks, environment, tags) to
    /// its runtime-db file via whole-file replace. No-op while persistence
    /// is disabled.
    pub fn flush(&self, dev: &Device) -> Result<(), DbError> {
        let Some(data_dir) = self.data_dir() else {
            return Ok(());
        };
        let Some(id) = dev.id_filename() else {
            return Err(DbError::NoIdFilename {
                devpath: dev.devpath().to_string(),
            });
        };
        let path = data_dir.join(id);

        let io_err = |source| DbError::Io {
            path: path.clone(),
            source,
        };

        // Temp file in the same directory, then rename over: a crash leaves
        // either the old complete file or the new complete file.
        let mut tmp = tempfile::NamedTempFile::new_in(&data_dir).map_err(io_err)?;
        tmp.write_all(dev.db_lines().as_bytes()).map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        debug!(devpath = dev.devpath(), path = %path.display(), "flushed device db");
        Ok(())
    }

    /// Load the device's runtime-db file into it, if backing is enabled and
    /// the file exists.
    pub fn load_db(&self, dev: &mut Device) {
        let Some(data_dir) = self.data_dir() else {
            return;
        };
        let Some(id) = dev.id_filename() else {
            return;
        };
        let path = data_dir.join(id);
        match std::fs::read_to_string(&path) {
            Ok(content) => dev.load_db_lines(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "failed to read device db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, DeviceRegistry) {
        let root = tempfile::tempdir().unwrap();
        let sys = root.path().join("sys");
        std::fs::create_dir_all(sys.join("devices/card0")).unwrap();
        std::fs::write(
            sys.join("devices/card0/uevent"),
            "MAJOR=226\nMINOR=0\nDEVNAME=dri/card0\n",
        )
        .unwrap();
        let registry = DeviceRegistry::new(sys);
        (root, registry)
    }

    #[test]
    fn lookups_share_one_entity() {
        let (_root, registry) = fixture();
        let path = registry.sys_root().join("devices/card0");

        let a = registry.lookup_or_create(&path).unwrap();
        let b = registry.lookup_or_create(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.write().unwrap().tags_mut().insert("seat".into());
        assert!(b.read().unwrap().tags().contains("seat"));
    }

    #[test]
    fn invalidate_yields_a_fresh_entity() {
        let (_root, registry) = fixture();
        let path = registry.sys_root().join("devices/card0");

        let a = registry.lookup_or_create(&path).unwrap();
        a.write().unwrap().tags_mut().insert("seat".into());

        registry.invalidate(&path);
        // The held handle stays usable.
        assert!(a.read().unwrap().tags().contains("seat"));

        let b = registry.lookup_or_create(&path).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(b.read().unwrap().tags().is_empty());
    }

    #[test]
    fn flush_is_a_noop_without_persistence() {
        let (_root, registry) = fixture();
        let dev = registry
            .lookup_or_create(&registry.sys_root().join("devices/card0"))
            .unwrap();
        registry.flush(&dev.read().unwrap()).unwrap();
        assert_eq!(registry.data_dir(), None);
    }

    #[test]
    fn flush_and_reload_through_the_db() {
        let (root, registry) = fixture();
        registry
            .enable_persistent_registry(root.path().join("run"))
            .unwrap();

        let path = registry.sys_root().join("devices/card0");
        let dev = registry.lookup_or_create(&path).unwrap();
        {
            let mut dev = dev.write().unwrap();
            dev.tags_mut().insert("master-of-seat".into());
            dev.environment_mut()
                .insert("ID_SEAT".into(), "seat0".into());
            registry.flush(&dev).unwrap();
        }

        registry.invalidate(&path);
        let reloaded = registry.lookup_or_create(&path).unwrap();
        let reloaded = reloaded.read().unwrap();
        assert!(reloaded.tags().contains("master-of-seat"));
        assert_eq!(
            reloaded.environment().get("ID_SEAT").map(String::as_str),
            Some("seat0")
        );
    }

    #[test]
    fn enable_persistent_registry_is_idempotent() {
        let (root, registry) = fixture();
        let run = root.path().join("run");
        registry.enable_persistent_registry(&run).unwrap();
        registry.enable_persistent_registry(&run).unwrap();
        assert_eq!(registry.data_dir(), Some(run.join("data")));
    }

    #[test]
    fn insert_from_props_registers_by_devpath() {
        let (_root, registry) = fixture();
        let props: BTreeMap<String, String> = [
            ("DEVPATH", "/devices/virtual/mem/null"),
            ("SUBSYSTEM", "mem"),
            ("MAJOR", "1"),
            ("MINOR", "3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let dev = registry.insert_from_props(&props).unwrap();
        assert_eq!(dev.read().unwrap().major_minor(), (1, 3));

        let again = registry
            .lookup_or_create_devpath("/devices/virtual/mem/null")
            .unwrap();
        assert!(Arc::ptr_eq(&dev, &again));
    }
}
