//! Shared core of the cdev hotplug fabric.
//!
//! cdev splits the conventional udev function across a trust boundary: a
//! privileged host daemon (`cdevd`) observes real kernel uevents and
//! per-container policy, and one container agent (`cdev-agent`) per container
//! receives filtered events, applies container-local rules, materializes
//! device nodes, and rebroadcasts the events on the container's own uevent
//! netlink channel.
//!
//! This crate holds everything both sides share:
//!
//! - [`device`]: the device model, the process-wide registry keyed by sysfs
//!   path, and the sync-buffer / runtime-db serialization.
//! - [`netlink`]: the `NETLINK_KOBJECT_UEVENT` transport and the libudev
//!   monitor wire format.
//! - [`proto`]: the length-prefixed framed protocol spoken between `cdevd`
//!   and its agents.
//! - [`control`]: the udev control-socket wire format (udevadm
//!   compatibility).
//! - [`rules`]: the rules engine with the host (filter) and container
//!   (client) dialects.
//! - [`hash`]: MurmurHash2 and the 64-bit tag bloom filter, as used by the
//!   canonical userspace udev.

pub mod control;
pub mod device;
pub mod hash;
pub mod netlink;
pub mod proto;
pub mod rules;
pub mod runtime;
pub mod systemd;

pub use device::{Device, DeviceRegistry, SharedDevice, SyncSelector};
pub use netlink::{UeventGroup, UeventMessage, UeventSocket};
pub use proto::{Message, MessageCodec, ProtocolError};
pub use rules::{Dialect, EventSource, RuleContext, RuleSet};
