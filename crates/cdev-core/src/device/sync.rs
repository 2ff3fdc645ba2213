//! The sync buffer: the slice of device state that crosses the
//! host→container boundary.
//!
//! A sync buffer is a newline-joined sequence of runtime-db lines restricted
//! to the selected components: `E:KEY=VALUE` for the environment overlay and
//! `G:tag` for tags. The receiver replaces exactly the selected components
//! and leaves everything else untouched.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use super::Device;

/// Which components of device state a sync buffer carries.
///
/// The wire spelling is the concatenation of the component letters, e.g.
/// `"EG"`, `"E"`, `"G"`; parsing is case-insensitive and order-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncSelector {
    /// `E`: the property environment overlay.
    pub env: bool,
    /// `G`: the tag set.
    pub tags: bool,
}

impl SyncSelector {
    /// Both components.
    pub const ALL: Self = Self {
        env: true,
        tags: true,
    };

    /// Environment only.
    pub const ENV: Self = Self {
        env: true,
        tags: false,
    };

    /// Tags only.
    pub const TAGS: Self = Self {
        env: false,
        tags: true,
    };

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.env && !self.tags
    }
}

impl fmt::Display for SyncSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.env {
            f.write_str("E")?;
        }
        if self.tags {
            f.write_str("G")?;
        }
        Ok(())
    }
}

/// Error for unknown selector letters.
#[derive(Debug, thiserror::Error)]
#[error("unknown sync selector component {0:?}")]
pub struct BadSelector(pub char);

impl FromStr for SyncSelector {
    type Err = BadSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sel = Self::default();
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                'E' => sel.env = true,
                'G' => sel.tags = true,
                other => return Err(BadSelector(other)),
            }
        }
        Ok(sel)
    }
}

/// Serialize the selected components of a device into a sync buffer.
#[must_use]
pub fn make_sync_buffer(dev: &Device, sel: SyncSelector) -> Vec<u8> {
    let mut lines = Vec::new();
    if sel.env {
        for (key, value) in dev.environment() {
            lines.push(format!("E:{key}={value}"));
        }
    }
    if sel.tags {
        for tag in dev.tags() {
            lines.push(format!("G:{tag}"));
        }
    }
    lines.join("\n").into_bytes()
}

/// Replace the selected components of a device with the contents of a sync
/// buffer. Lines for unselected components are ignored, as are malformed
/// entries (logged, never fatal).
pub fn store_sync_buffer(dev: &mut Device, sel: SyncSelector, buffer: &[u8]) {
    if sel.env {
        dev.environment_mut().clear();
    }
    if sel.tags {
        dev.tags_mut().clear();
    }

    let content = String::from_utf8_lossy(buffer);
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(entry) = line.strip_prefix("E:") {
            if !sel.env {
                continue;
            }
            if let Some((key, value)) = entry.split_once('=') {
                dev.environment_mut()
                    .insert(key.to_string(), value.to_string());
            } else {
                warn!(line, "could not parse sync environment entry");
            }
        } else if let Some(tag) = line.strip_prefix("G:") {
            if sel.tags {
                dev.tags_mut().insert(tag.to_string());
            }
        } else {
            warn!(line, "unknown sync entry type");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn sample_device() -> Device {
        let mut dev = Device::default();
        dev.set_syspath(Path::new("/sys"), Path::new("/sys/devices/x"));
        dev.environment_mut().insert("ID_BUS".into(), "usb".into());
        dev.environment_mut()
            .insert("ID_MODEL".into(), "Gamepad".into());
        dev.tags_mut().insert("seat".into());
        dev.tags_mut().insert("uaccess".into());
        dev
    }

    #[test]
    fn selector_round_trips_through_strings() {
        for (s, sel) in [
            ("EG", SyncSelector::ALL),
            ("E", SyncSelector::ENV),
            ("G", SyncSelector::TAGS),
            ("", SyncSelector::default()),
        ] {
            assert_eq!(s.parse::<SyncSelector>().unwrap(), sel);
            assert_eq!(sel.to_string(), s);
        }
        assert_eq!("eg".parse::<SyncSelector>().unwrap(), SyncSelector::ALL);
        assert!("EX".parse::<SyncSelector>().is_err());
    }

    #[test]
    fn round_trip_restores_selected_components() {
        let dev = sample_device();
        for sel in [
            SyncSelector::ALL,
            SyncSelector::ENV,
            SyncSelector::TAGS,
            SyncSelector::default(),
        ] {
            let buffer = make_sync_buffer(&dev, sel);

            let mut restored = Device::default();
            restored.set_syspath(Path::new("/sys"), Path::new("/sys/devices/x"));
            store_sync_buffer(&mut restored, sel, &buffer);

            if sel.env {
                assert_eq!(restored.environment(), dev.environment(), "{sel}");
            } else {
                assert!(restored.environment().is_empty(), "{sel}");
            }
            if sel.tags {
                assert_eq!(restored.tags(), dev.tags(), "{sel}");
            } else {
                assert!(restored.tags().is_empty(), "{sel}");
            }
        }
    }

    #[test]
    fn unselected_components_are_untouched_on_store() {
        let mut dev = sample_device();
        let buffer = make_sync_buffer(&sample_device(), SyncSelector::ALL);

        dev.environment_mut().clear();
        dev.environment_mut().insert("KEEP".into(), "1".into());
        store_sync_buffer(&mut dev, SyncSelector::TAGS, &buffer);

        // Tag component replaced, environment component untouched.
        assert_eq!(dev.environment().get("KEEP").map(String::as_str), Some("1"));
        assert!(dev.tags().contains("seat"));
    }

    #[test]
    fn store_replaces_rather_than_merges() {
        let mut dev = sample_device();
        store_sync_buffer(&mut dev, SyncSelector::ENV, b"E:ID_BUS=pci");
        assert_eq!(dev.environment().len(), 1);
        assert_eq!(
            dev.environment().get("ID_BUS").map(String::as_str),
            Some("pci")
        );
        // Tags were not selected and survive.
        assert!(dev.tags().contains("uaccess"));
    }
}
