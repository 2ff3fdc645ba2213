//! Construction of [`Device`]s from sysfs entries and uevent property sets.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use super::Device;

/// Build a device from a sysfs directory, or `None` when the path does not
/// denote a device: outside the sysfs root, the bare root itself, or an
/// entry under `devices/` without a `uevent` file.
pub(super) fn from_syspath(sys_root: &Path, syspath: &Path) -> Option<Device> {
    let real = std::fs::canonicalize(syspath).unwrap_or_else(|_| syspath.to_path_buf());

    let devpath = real.strip_prefix(sys_root).ok()?;
    if devpath.as_os_str().is_empty() {
        return None;
    }

    if devpath.starts_with("devices") {
        // Devices require an uevent file.
        if !real.join("uevent").exists() {
            return None;
        }
    } else if !real.is_dir() {
        warn!(path = %real.display(), "sysfs entry is not a directory");
        return None;
    }

    let mut dev = Device::default();
    dev.set_syspath(sys_root, &real);
    read_uevent_file(&mut dev);
    read_subsystem(&mut dev);
    Some(dev)
}

/// Build a device from uevent properties (netlink path). Needs at least
/// `DEVPATH`; `ACTION` belongs to the event, not the device, and is dropped.
pub(super) fn from_props(
    sys_root: &Path,
    props: &BTreeMap<String, String>,
) -> Option<Device> {
    let devpath = props.get("DEVPATH")?;

    let mut dev = Device::default();
    dev.set_syspath(sys_root, &sys_root.join(devpath.trim_start_matches('/')));

    let mut maj = 0u64;
    let mut min = 0u64;
    for (key, value) in props {
        match key.as_str() {
            "ACTION" | "SEQNUM" => {}
            "SUBSYSTEM" => dev.set_subsystem(value),
            "DEVTYPE" => dev.set_devtype(value),
            "DEVNAME" => dev.set_devnode(value),
            "IFINDEX" => match value.parse() {
                Ok(ifindex) => dev.set_ifindex(ifindex),
                Err(_) => warn!(value, "unparsable IFINDEX property"),
            },
            "DEVMODE" => match u32::from_str_radix(value, 8) {
                Ok(mode) => dev.set_devnode_mode(mode),
                Err(_) => warn!(value, "unparsable DEVMODE property"),
            },
            _ => {
                if key == "MAJOR" {
                    maj = value.parse().unwrap_or(0);
                } else if key == "MINOR" {
                    min = value.parse().unwrap_or(0);
                }
                dev.properties.insert(key.clone(), value.clone());
            }
        }
    }
    dev.set_devnum(maj, min);
    dev.mark_uevent_loaded();
    Some(dev)
}

/// Read `<syspath>/uevent` into the device, if present and not yet loaded.
pub(super) fn read_uevent_file(dev: &mut Device) {
    if dev.uevent_loaded() {
        return;
    }

    let path = dev.syspath().join("uevent");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        // A missing or unreadable uevent file (common on /sys/bus/usb) is
        // not an error; the device simply has no kernel properties.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read uevent file");
            return;
        }
    };
    dev.mark_uevent_loaded();

    let mut maj = 0u64;
    let mut min = 0u64;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "DEVTYPE" => dev.set_devtype(value),
            "DEVNAME" => dev.set_devnode(value),
            "IFINDEX" => {
                if let Ok(ifindex) = value.parse() {
                    dev.set_ifindex(ifindex);
                }
            }
            _ => {
                if key == "MAJOR" {
                    maj = value.parse().unwrap_or(0);
                } else if key == "MINOR" {
                    min = value.parse().unwrap_or(0);
                } else if key == "DEVMODE" {
                    if let Ok(mode) = u32::from_str_radix(value, 8) {
                        dev.set_devnode_mode(mode);
                    }
                }
                dev.properties.insert(key.to_string(), value.to_string());
            }
        }
    }
    dev.set_devnum(maj, min);
}

/// Resolve the subsystem from the `subsystem` link, falling back to the
/// implicit names sysfs uses for non-device object directories.
fn read_subsystem(dev: &mut Device) {
    if dev.subsystem().is_some() {
        return;
    }

    let link = dev.syspath().join("subsystem");
    if let Ok(target) = std::fs::read_link(&link) {
        if let Some(name) = target.file_name() {
            let name = name.to_string_lossy().into_owned();
            dev.set_subsystem(&name);
            return;
        }
    }

    let devpath = dev.devpath().to_string();
    if devpath.starts_with("/module/") {
        dev.set_subsystem("module");
    } else if devpath.starts_with("/drivers/") {
        dev.set_subsystem("drivers");
    } else if devpath.starts_with("/subsystem/")
        || devpath.starts_with("/class/")
        || devpath.starts_with("/bus/")
    {
        dev.set_subsystem("subsystem");
    }
}
