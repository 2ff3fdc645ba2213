//! The libudev monitor wire format and the raw kernel uevent format.
//!
//! A kernel uevent is a header line `ACTION@DEVPATH` followed by
//! `\0`-separated `KEY=VALUE` properties. The libudev monitor format wraps
//! the same property block in a binary header so subscribers can filter on
//! hashed subsystem/devtype and a tag bloom without parsing properties.
//!
//! Header layout (40 bytes). The canonical userspace udev mixes byte orders
//! here; we reproduce it bit-for-bit:
//!
//! ```text
//! offset  size  field                    order
//!      0     8  prefix "libudev\0"
//!      8     4  magic 0xfeedcafe         big-endian
//!     12     4  header size              native
//!     16     4  properties offset        native
//!     20     4  properties length        native
//!     24     4  filter subsystem hash    big-endian
//!     28     4  filter devtype hash      big-endian
//!     32     4  filter tag bloom (hi)    big-endian
//!     36     4  filter tag bloom (lo)    big-endian
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::device::Device;
use crate::hash::{murmur_hash2, tag_bloom};

/// First 8 bytes of a libudev-format message.
pub const LIBUDEV_PREFIX: &[u8; 8] = b"libudev\0";

/// Magic value carried in the libudev header.
pub const LIBUDEV_MAGIC: u32 = 0xfeed_cafe;

/// Size of the libudev header this implementation writes.
pub const LIBUDEV_HEADER_SIZE: usize = 40;

/// Errors from uevent message parsing.
#[derive(Debug, thiserror::Error)]
pub enum UeventParseError {
    /// Buffer too short to hold the expected structure.
    #[error("uevent message truncated ({len} bytes)")]
    Truncated {
        /// Observed buffer length.
        len: usize,
    },

    /// Libudev prefix present but the magic value is wrong.
    #[error("libudev message with broken magic {magic:#x}")]
    BadMagic {
        /// Observed magic value.
        magic: u32,
    },

    /// Kernel message without an `ACTION@DEVPATH` header line.
    #[error("kernel uevent without ACTION@DEVPATH header")]
    BadHeader,

    /// No `ACTION` could be determined.
    #[error("uevent message without an action")]
    MissingAction,

    /// No `DEVPATH` property.
    #[error("uevent message without a DEVPATH")]
    MissingDevpath,
}

/// One parsed uevent, from either wire format.
#[derive(Debug, Clone)]
pub struct UeventMessage {
    /// Event action (`add`, `remove`, `change`, ...).
    pub action: String,
    /// Devpath of the subject device.
    pub devpath: String,
    /// Properties, not including `ACTION` (that belongs to the event
    /// envelope, not the device).
    pub properties: BTreeMap<String, String>,
    /// MurmurHash2 of the subsystem, for subscriber-side filtering.
    pub subsystem_hash: u32,
    /// MurmurHash2 of the devtype.
    pub devtype_hash: u32,
    /// 64-bit tag bloom filter.
    pub tag_bloom: u64,
    /// The datagram this message was parsed from, reusable for forwarding
    /// without a re-pack. Kernel-format messages never carry one.
    pub original: Option<Bytes>,
    /// True for kernel-origin messages: the header carried no bloom, so it
    /// must be rebuilt from the device's tag set before forwarding.
    pub needs_bloom: bool,
}

impl UeventMessage {
    /// Parse either wire format, discriminating on the libudev prefix.
    pub fn parse(buf: &[u8]) -> Result<Self, UeventParseError> {
        if buf.len() >= LIBUDEV_PREFIX.len() && &buf[..LIBUDEV_PREFIX.len()] == LIBUDEV_PREFIX {
            Self::parse_libudev(buf)
        } else {
            Self::parse_kernel(buf)
        }
    }

    fn parse_libudev(buf: &[u8]) -> Result<Self, UeventParseError> {
        if buf.len() < LIBUDEV_HEADER_SIZE {
            return Err(UeventParseError::Truncated { len: buf.len() });
        }

        let be = |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let ne = |off: usize| u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        let magic = be(8);
        if magic != LIBUDEV_MAGIC {
            return Err(UeventParseError::BadMagic { magic });
        }

        let props_off = ne(16) as usize;
        let props_len = ne(20) as usize;
        let end = props_off.saturating_add(props_len);
        if props_off > buf.len() || end > buf.len() {
            return Err(UeventParseError::Truncated { len: buf.len() });
        }

        let mut action = None;
        let mut properties = BTreeMap::new();
        for segment in buf[props_off..end].split(|&b| b == 0) {
            let Ok(segment) = std::str::from_utf8(segment) else {
                continue;
            };
            let Some((key, value)) = segment.split_once('=') else {
                // The leading ACTION@DEVPATH compatibility line, or padding.
                continue;
            };
            if key == "ACTION" {
                action = Some(value.to_string());
            } else {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        let action = action.ok_or(UeventParseError::MissingAction)?;
        let devpath = properties
            .get("DEVPATH")
            .ok_or(UeventParseError::MissingDevpath)?
            .clone();

        Ok(Self {
            action,
            devpath,
            properties,
            subsystem_hash: be(24),
            devtype_hash: be(28),
            tag_bloom: (u64::from(be(32)) << 32) | u64::from(be(36)),
            original: Some(Bytes::copy_from_slice(buf)),
            needs_bloom: false,
        })
    }

    fn parse_kernel(buf: &[u8]) -> Result<Self, UeventParseError> {
        let mut segments = buf.split(|&b| b == 0);
        let header = segments.next().ok_or(UeventParseError::Truncated { len: 0 })?;
        let header = std::str::from_utf8(header).map_err(|_| UeventParseError::BadHeader)?;
        let (action, devpath) = header.split_once('@').ok_or(UeventParseError::BadHeader)?;

        let mut properties = BTreeMap::new();
        for segment in segments {
            let Ok(segment) = std::str::from_utf8(segment) else {
                continue;
            };
            if let Some((key, value)) = segment.split_once('=') {
                if key != "ACTION" {
                    properties.insert(key.to_string(), value.to_string());
                }
            }
        }

        let mut msg = Self {
            action: action.to_string(),
            devpath: devpath.to_string(),
            properties,
            subsystem_hash: 0,
            devtype_hash: 0,
            tag_bloom: 0,
            original: None,
            needs_bloom: true,
        };
        msg.fill_hashes_from_props();
        Ok(msg)
    }

    /// Build a fresh message from a device and an action. With
    /// `include_env` the property block carries the environment overlay
    /// merged over the kernel properties; without, the bare kernel set.
    #[must_use]
    pub fn from_device(dev: &Device, action: &str, include_env: bool) -> Self {
        let properties = if include_env {
            dev.props_and_env()
        } else {
            dev.properties().clone()
        };

        let mut msg = Self {
            action: action.to_string(),
            devpath: dev.devpath().to_string(),
            properties,
            subsystem_hash: 0,
            devtype_hash: 0,
            tag_bloom: tag_bloom(dev.tags()),
            original: None,
            needs_bloom: false,
        };
        if let Some(subsystem) = dev.subsystem() {
            msg.subsystem_hash = murmur_hash2(subsystem.as_bytes(), 0);
        }
        if let Some(devtype) = dev.devtype() {
            msg.devtype_hash = murmur_hash2(devtype.as_bytes(), 0);
        }
        msg
    }

    /// Shallow copy with a different action. The original buffer is not
    /// carried over; the clone must be packed. Header hashes describe the
    /// same device, so do not use this to retarget a message.
    #[must_use]
    pub fn clone_for_action(&self, action: &str) -> Self {
        Self {
            action: action.to_string(),
            original: None,
            ..self.clone()
        }
    }

    /// Rebuild the tag bloom from the device's current tag set. Kernel
    /// messages arrive without one.
    pub fn fill_bloom_from_device(&mut self, dev: &Device) {
        self.tag_bloom = tag_bloom(dev.tags());
        self.needs_bloom = false;
    }

    fn fill_hashes_from_props(&mut self) {
        if let Some(subsystem) = self.properties.get("SUBSYSTEM") {
            self.subsystem_hash = murmur_hash2(subsystem.as_bytes(), 0);
        }
        if let Some(devtype) = self.properties.get("DEVTYPE") {
            self.devtype_hash = murmur_hash2(devtype.as_bytes(), 0);
        }
    }

    /// Pack into the libudev wire format. The property block leads with the
    /// kernel-compatible `ACTION@DEVPATH` line.
    #[must_use]
    pub fn pack(&self) -> Bytes {
        let mut props = Vec::with_capacity(256);
        props.extend_from_slice(self.action.as_bytes());
        props.push(b'@');
        props.extend_from_slice(self.devpath.as_bytes());
        props.push(0);
        props.extend_from_slice(b"ACTION=");
        props.extend_from_slice(self.action.as_bytes());
        props.push(0);
        for (key, value) in &self.properties {
            props.extend_from_slice(key.as_bytes());
            props.push(b'=');
            props.extend_from_slice(value.as_bytes());
            props.push(0);
        }

        let mut out = Vec::with_capacity(LIBUDEV_HEADER_SIZE + props.len());
        out.extend_from_slice(LIBUDEV_PREFIX);
        out.extend_from_slice(&LIBUDEV_MAGIC.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        {
            out.extend_from_slice(&(LIBUDEV_HEADER_SIZE as u32).to_ne_bytes());
            out.extend_from_slice(&(LIBUDEV_HEADER_SIZE as u32).to_ne_bytes());
            out.extend_from_slice(&(props.len() as u32).to_ne_bytes());
            out.extend_from_slice(&self.subsystem_hash.to_be_bytes());
            out.extend_from_slice(&self.devtype_hash.to_be_bytes());
            out.extend_from_slice(&((self.tag_bloom >> 32) as u32).to_be_bytes());
            out.extend_from_slice(&((self.tag_bloom & 0xffff_ffff) as u32).to_be_bytes());
        }
        out.extend_from_slice(&props);
        Bytes::from(out)
    }

    /// The wire bytes to forward: the original datagram when we have one,
    /// a fresh pack otherwise.
    #[must_use]
    pub fn wire_bytes(&self) -> Bytes {
        self.original.clone().unwrap_or_else(|| self.pack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_datagram() -> Vec<u8> {
        b"add@/devices/sound/pcmC0D0p\0\
          ACTION=add\0\
          DEVPATH=/devices/sound/pcmC0D0p\0\
          SUBSYSTEM=sound\0\
          DEVNAME=snd/pcmC0D0p\0\
          MAJOR=116\0MINOR=24\0SEQNUM=4711\0"
            .to_vec()
    }

    #[test]
    fn parses_kernel_format() {
        let msg = UeventMessage::parse(&kernel_datagram()).unwrap();
        assert_eq!(msg.action, "add");
        assert_eq!(msg.devpath, "/devices/sound/pcmC0D0p");
        assert_eq!(
            msg.properties.get("DEVNAME").map(String::as_str),
            Some("snd/pcmC0D0p")
        );
        assert!(!msg.properties.contains_key("ACTION"));
        assert!(msg.needs_bloom);
        assert!(msg.original.is_none());
        assert_eq!(msg.subsystem_hash, murmur_hash2(b"sound", 0));
    }

    #[test]
    fn rejects_kernel_format_without_header() {
        let err = UeventMessage::parse(b"ACTION=add\0DEVPATH=/devices/x\0").unwrap_err();
        assert!(matches!(err, UeventParseError::BadHeader));
    }

    #[test]
    fn pack_parse_round_trip() {
        let kernel = UeventMessage::parse(&kernel_datagram()).unwrap();
        let wire = kernel.pack();
        assert_eq!(&wire[..8], LIBUDEV_PREFIX);

        let parsed = UeventMessage::parse(&wire).unwrap();
        assert_eq!(parsed.action, kernel.action);
        assert_eq!(parsed.devpath, kernel.devpath);
        assert_eq!(parsed.properties, kernel.properties);
        assert_eq!(parsed.subsystem_hash, kernel.subsystem_hash);
        assert!(!parsed.needs_bloom);
        assert_eq!(parsed.original.as_deref(), Some(wire.as_ref()));
    }

    #[test]
    fn bloom_survives_the_wire() {
        let mut msg = UeventMessage::parse(&kernel_datagram()).unwrap();
        msg.tag_bloom = 0xdead_beef_0bad_cafe;
        msg.needs_bloom = false;

        let parsed = UeventMessage::parse(&msg.pack()).unwrap();
        assert_eq!(parsed.tag_bloom, 0xdead_beef_0bad_cafe);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut wire = UeventMessage::parse(&kernel_datagram()).unwrap().pack().to_vec();
        wire[8] ^= 0xff;
        assert!(matches!(
            UeventMessage::parse(&wire),
            Err(UeventParseError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_property_block_is_rejected() {
        let wire = UeventMessage::parse(&kernel_datagram()).unwrap().pack();
        let cut = &wire[..wire.len() - 10];
        assert!(matches!(
            UeventMessage::parse(cut),
            Err(UeventParseError::Truncated { .. })
        ));
    }

    #[test]
    fn clone_for_action_drops_the_original_buffer() {
        let wire = UeventMessage::parse(&kernel_datagram()).unwrap().pack();
        let msg = UeventMessage::parse(&wire).unwrap();
        let clone = msg.clone_for_action("remove");
        assert_eq!(clone.action, "remove");
        assert_eq!(clone.properties, msg.properties);
        assert!(clone.original.is_none());
    }
}
