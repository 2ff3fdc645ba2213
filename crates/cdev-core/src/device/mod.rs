//! The device model shared by the host router and the container agents.
//!
//! A [`Device`] represents one kernel device, keyed by its canonical sysfs
//! path. Identity is by path: all lookups for the same path through a
//! [`DeviceRegistry`] return the same shared handle, so a mutation made
//! during rule evaluation is observed by every later consumer of the event.
//!
//! Mutable state that must survive the process (environment overlays, tags,
//! devlinks) is persisted in the udev runtime-db line format and carried
//! across the host→container boundary as a sync buffer (see [`sync`]).

mod registry;
mod sync;
mod sysfs;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use nix::sys::stat::{major, makedev, minor};

pub use registry::{DbError, DeviceRegistry, DEFAULT_RUNTIME_DIR};
pub use sync::{make_sync_buffer, store_sync_buffer, BadSelector, SyncSelector};

/// Shared handle to a device.
///
/// Guards are short-lived and never held across a suspension point; both
/// daemons run on a single-threaded cooperative scheduler, so the lock only
/// formalizes what the scheduler already guarantees.
pub type SharedDevice = Arc<RwLock<Device>>;

/// One kernel device, as assembled from a sysfs entry, a kernel uevent, or
/// a libudev monitor message.
#[derive(Debug, Default)]
pub struct Device {
    syspath: PathBuf,
    devpath: String,
    sysname: String,
    sysnum: Option<String>,
    subsystem: Option<String>,
    devtype: Option<String>,
    ifindex: Option<u32>,
    /// `dev_t`; 0 means the device has no node.
    devnum: u64,
    /// Node path relative to `/dev`.
    devnode: Option<String>,
    devnode_mode: Option<u32>,
    properties: BTreeMap<String, String>,
    environment: BTreeMap<String, String>,
    devlinks: BTreeSet<String>,
    tags: BTreeSet<String>,
    sysattrs: HashMap<String, Option<String>>,
    /// Runtime-db lines we don't interpret but must not destroy on flush.
    db_unknown: Vec<String>,
    uevent_loaded: bool,
}

impl Device {
    pub(crate) fn set_syspath(&mut self, sys_root: &Path, syspath: &Path) {
        let devpath = syspath
            .strip_prefix(sys_root)
            .map_or_else(|_| syspath.to_string_lossy().into_owned(), |p| {
                format!("/{}", p.to_string_lossy().trim_end_matches('/'))
            });

        self.syspath = syspath.to_path_buf();
        self.devpath = devpath;

        let kernel = self
            .devpath
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        // sysfs encodes '/' in device names as '!'.
        self.sysname = kernel.replace('!', "/");

        let digits = self
            .sysname
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .count();
        if digits > 0 {
            self.sysnum = Some(self.sysname[self.sysname.len() - digits..].to_string());
        }

        self.properties.insert("DEVPATH".into(), self.devpath.clone());
        self.properties.insert("KERNEL".into(), kernel);
    }

    pub(crate) fn set_subsystem(&mut self, subsystem: &str) {
        self.subsystem = Some(subsystem.to_string());
        self.properties.insert("SUBSYSTEM".into(), subsystem.to_string());
    }

    pub(crate) fn set_devtype(&mut self, devtype: &str) {
        self.devtype = Some(devtype.to_string());
        self.properties.insert("DEVTYPE".into(), devtype.to_string());
    }

    pub(crate) fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = Some(ifindex);
        self.properties.insert("IFINDEX".into(), ifindex.to_string());
    }

    /// Record the device node name. Accepts either the bare leaf from a
    /// kernel uevent (`snd/pcmC0D0p`) or the absolute form libudev uses;
    /// stored relative to `/dev`, exported absolute as `DEVNAME`.
    pub(crate) fn set_devnode(&mut self, devnode: &str) {
        let leaf = devnode.strip_prefix("/dev/").unwrap_or(devnode);
        self.devnode = Some(leaf.to_string());
        self.properties
            .insert("DEVNAME".into(), format!("/dev/{leaf}"));
    }

    pub(crate) fn set_devnum(&mut self, maj: u64, min: u64) {
        self.devnum = makedev(maj, min);
    }

    pub(crate) fn set_devnode_mode(&mut self, mode: u32) {
        self.devnode_mode = Some(mode);
    }

    pub(crate) fn mark_uevent_loaded(&mut self) {
        self.uevent_loaded = true;
    }

    pub(crate) fn uevent_loaded(&self) -> bool {
        self.uevent_loaded
    }

    #[must_use]
    pub fn syspath(&self) -> &Path {
        &self.syspath
    }

    /// Sysfs path with the `/sys` prefix removed.
    #[must_use]
    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    #[must_use]
    pub fn sysname(&self) -> &str {
        &self.sysname
    }

    #[must_use]
    pub fn sysnum(&self) -> Option<&str> {
        self.sysnum.as_deref()
    }

    #[must_use]
    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    #[must_use]
    pub fn devtype(&self) -> Option<&str> {
        self.devtype.as_deref()
    }

    #[must_use]
    pub fn ifindex(&self) -> Option<u32> {
        self.ifindex
    }

    /// Raw `dev_t`; 0 means "no node".
    #[must_use]
    pub const fn devnum(&self) -> u64 {
        self.devnum
    }

    /// Major/minor pair; `(0, 0)` means the device has no node.
    #[must_use]
    pub fn major_minor(&self) -> (u64, u64) {
        if self.devnum == 0 {
            (0, 0)
        } else {
            (major(self.devnum), minor(self.devnum))
        }
    }

    /// Device node path relative to `/dev`, if any.
    #[must_use]
    pub fn devnode(&self) -> Option<&str> {
        self.devnode.as_deref()
    }

    /// Node mode requested by the kernel via `DEVMODE`.
    #[must_use]
    pub const fn devnode_mode(&self) -> Option<u32> {
        self.devnode_mode
    }

    /// Kernel uevent properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// The udev environment overlay (runtime-db `E` entries).
    #[must_use]
    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.environment
    }

    #[must_use]
    pub const fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.tags
    }

    /// Alternate `/dev` names, relative to `/dev`.
    #[must_use]
    pub const fn devlinks(&self) -> &BTreeSet<String> {
        &self.devlinks
    }

    pub fn devlinks_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.devlinks
    }

    /// Look up a key in the kernel properties, falling back to the
    /// environment overlay.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .or_else(|| self.environment.get(key))
            .map(String::as_str)
    }

    /// Kernel properties merged with the environment overlay; the overlay
    /// wins on conflicts. This is what a forwarded event carries when `ENV`
    /// forwarding is selected.
    #[must_use]
    pub fn props_and_env(&self) -> BTreeMap<String, String> {
        let mut merged = self.properties.clone();
        merged.extend(
            self.environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    /// Read a sysfs attribute, caching the result (including misses) for
    /// the lifetime of this device entry.
    pub fn sysattr(&mut self, name: &str) -> Option<String> {
        if let Some(cached) = self.sysattrs.get(name) {
            return cached.clone();
        }
        let value = std::fs::read_to_string(self.syspath.join(name))
            .ok()
            .map(|s| s.trim_end_matches('\n').to_string());
        self.sysattrs.insert(name.to_string(), value.clone());
        value
    }

    /// Stable runtime-db filename for this device, derived from its
    /// identity: `b<maj>:<min>` / `c<maj>:<min>` for devices with a node,
    /// `n<ifindex>` for netdevs, `+<subsystem>:<sysname>` otherwise.
    ///
    /// Returns `None` when the subsystem is unknown; such devices have no
    /// persistent state and are never forwarded with a `SYNC`.
    #[must_use]
    pub fn id_filename(&self) -> Option<String> {
        let subsystem = self.subsystem.as_deref()?;
        let (maj, min) = self.major_minor();
        if maj > 0 {
            let kind = if subsystem == "block" { 'b' } else { 'c' };
            return Some(format!("{kind}{maj}:{min}"));
        }
        if let Some(ifindex) = self.ifindex {
            return Some(format!("n{ifindex}"));
        }
        // sysname has '!' translated; the db id wants the raw basename.
        let raw = self.devpath.rsplit('/').next().unwrap_or_default();
        Some(format!("+{subsystem}:{raw}"))
    }

    /// Serialize the mutable state to runtime-db lines
    /// (`S:` devlinks, `E:` environment, `G:` tags).
    #[must_use]
    pub fn db_lines(&self) -> String {
        let mut out = String::new();
        for devlink in &self.devlinks {
            out.push_str("S:");
            out.push_str(devlink);
            out.push('\n');
        }
        for (key, value) in &self.environment {
            out.push_str("E:");
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        for tag in &self.tags {
            out.push_str("G:");
            out.push_str(tag);
            out.push('\n');
        }
        for line in &self.db_unknown {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Load runtime-db lines, replacing the current mutable state.
    /// Unknown record types are preserved verbatim for the next flush.
    pub fn load_db_lines(&mut self, content: &str) {
        self.devlinks.clear();
        self.environment.clear();
        self.tags.clear();
        self.db_unknown.clear();

        for line in content.lines() {
            if let Some(devlink) = line.strip_prefix("S:") {
                self.devlinks.insert(devlink.to_string());
            } else if let Some(entry) = line.strip_prefix("E:") {
                if let Some((key, value)) = entry.split_once('=') {
                    self.environment.insert(key.to_string(), value.to_string());
                } else {
                    tracing::warn!(line, "malformed db environment entry");
                }
            } else if let Some(tag) = line.strip_prefix("G:") {
                self.tags.insert(tag.to_string());
            } else if !line.is_empty() {
                self.db_unknown.push(line.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_at(devpath: &str) -> Device {
        let mut dev = Device::default();
        dev.set_syspath(Path::new("/sys"), &PathBuf::from(format!("/sys{devpath}")));
        dev
    }

    #[test]
    fn syspath_derives_identity_properties() {
        let dev = device_at("/devices/pci0000:00/sda1");
        assert_eq!(dev.devpath(), "/devices/pci0000:00/sda1");
        assert_eq!(dev.sysname(), "sda1");
        assert_eq!(dev.sysnum(), Some("1"));
        assert_eq!(dev.get("DEVPATH"), Some("/devices/pci0000:00/sda1"));
        assert_eq!(dev.get("KERNEL"), Some("sda1"));
    }

    #[test]
    fn bang_in_sysname_translates_to_slash() {
        let dev = device_at("/devices/virtual/block/dm!0");
        assert_eq!(dev.sysname(), "dm/0");
        assert_eq!(dev.get("KERNEL"), Some("dm!0"));
    }

    #[test]
    fn devnode_is_stored_relative_and_exported_absolute() {
        let mut dev = device_at("/devices/snd/pcmC0D0p");
        dev.set_devnode("/dev/snd/pcmC0D0p");
        assert_eq!(dev.devnode(), Some("snd/pcmC0D0p"));
        assert_eq!(dev.get("DEVNAME"), Some("/dev/snd/pcmC0D0p"));

        dev.set_devnode("snd/pcmC0D0c");
        assert_eq!(dev.devnode(), Some("snd/pcmC0D0c"));
    }

    #[test]
    fn id_filename_prefers_devnum_then_ifindex() {
        let mut dev = device_at("/devices/sound/pcmC0D0p");
        assert_eq!(dev.id_filename(), None);

        dev.set_subsystem("sound");
        assert_eq!(dev.id_filename(), Some("+sound:pcmC0D0p".into()));

        dev.set_ifindex(3);
        assert_eq!(dev.id_filename(), Some("n3".into()));

        dev.set_devnum(116, 24);
        assert_eq!(dev.id_filename(), Some("c116:24".into()));
    }

    #[test]
    fn id_filename_block_devices_use_b_prefix() {
        let mut dev = device_at("/devices/block/sda");
        dev.set_subsystem("block");
        dev.set_devnum(8, 0);
        assert_eq!(dev.id_filename(), Some("b8:0".into()));
    }

    #[test]
    fn environment_overlay_loses_to_kernel_properties() {
        let mut dev = device_at("/devices/x");
        dev.set_subsystem("block");
        dev.environment_mut()
            .insert("SUBSYSTEM".into(), "spoofed".into());
        assert_eq!(dev.get("SUBSYSTEM"), Some("block"));

        dev.environment_mut().insert("ID_FS_TYPE".into(), "ext4".into());
        assert_eq!(dev.get("ID_FS_TYPE"), Some("ext4"));
    }

    #[test]
    fn db_lines_round_trip() {
        let mut dev = device_at("/devices/block/sda");
        dev.devlinks_mut().insert("disk/by-id/test".into());
        dev.environment_mut().insert("ID_BUS".into(), "ata".into());
        dev.tags_mut().insert("systemd".into());

        let lines = dev.db_lines();
        let mut restored = device_at("/devices/block/sda");
        restored.load_db_lines(&lines);

        assert_eq!(restored.devlinks(), dev.devlinks());
        assert_eq!(restored.environment(), dev.environment());
        assert_eq!(restored.tags(), dev.tags());
    }

    #[test]
    fn unknown_db_lines_survive_a_round_trip() {
        let mut dev = device_at("/devices/block/sda");
        dev.load_db_lines("S:disk/by-x\nW:7\nG:seat\n");
        assert!(dev.db_lines().contains("W:7\n"));
    }
}
