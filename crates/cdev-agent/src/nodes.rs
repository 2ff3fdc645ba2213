//! Device node and devlink materialization in the container's `/dev`.
//!
//! Creation resolves mode and ownership as: rule-context override, then the
//! device's own `DEVMODE`/`OWNER`/`GROUP`, then `0o660` root:root. Removal
//! is defensive: a devlink is only unlinked when it still points at our
//! node, the node itself only when its `st_rdev` matches, and empty parent
//! directories are pruned but never past the `/dev` root.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use cdev_core::rules::RuleContext;
use cdev_core::Device;
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Group, Uid, User};
use tracing::{debug, error, info, warn};

/// Fallback node mode when neither the rules nor the kernel specify one.
pub const DEFAULT_MODE: u32 = 0o660;

/// Resolve a user name to a uid; a failed lookup falls back to root with a
/// logged error.
fn resolve_uid(name: Option<&str>) -> Uid {
    let Some(name) = name else {
        return Uid::from_raw(0);
    };
    match User::from_name(name) {
        Ok(Some(user)) => user.uid,
        Ok(None) => {
            error!("User '{name}' doesn't exist, defaulting to uid 0");
            Uid::from_raw(0)
        }
        Err(err) => {
            error!(%err, "user lookup for '{name}' failed, defaulting to uid 0");
            Uid::from_raw(0)
        }
    }
}

/// Resolve a group name to a gid; same fallback policy as [`resolve_uid`].
fn resolve_gid(name: Option<&str>) -> Gid {
    let Some(name) = name else {
        return Gid::from_raw(0);
    };
    match Group::from_name(name) {
        Ok(Some(group)) => group.gid,
        Ok(None) => {
            error!("Group '{name}' doesn't exist, defaulting to gid 0");
            Gid::from_raw(0)
        }
        Err(err) => {
            error!(%err, "group lookup for '{name}' failed, defaulting to gid 0");
            Gid::from_raw(0)
        }
    }
}

/// Materialize the device node and its devlinks under `dev_root`.
///
/// Does nothing for devices without a node (`devnum` 0:0 or no devnode).
/// An already existing node path is logged and left alone; devlinks are
/// still (re)attempted so a recovered node keeps its alternate names.
pub fn create_node(dev_root: &Path, dev: &Device, ctx: &RuleContext) {
    let Some(devnode) = dev.devnode() else {
        return;
    };
    if dev.devnum() == 0 {
        return;
    }
    let node_path = dev_root.join(devnode);

    let mode = ctx.mode.or(dev.devnode_mode()).unwrap_or(DEFAULT_MODE);
    let uid = resolve_uid(ctx.user.as_deref().or_else(|| dev.get("OWNER")));
    let gid = resolve_gid(ctx.group.as_deref().or_else(|| dev.get("GROUP")));

    if let Some(parent) = node_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            error!(path = %parent.display(), %err, "cannot create node directory");
            return;
        }
    }

    if node_path.symlink_metadata().is_ok() {
        error!(path = %node_path.display(), "device node already exists, not touching it");
    } else {
        let kind = if dev.subsystem() == Some("block") {
            SFlag::S_IFBLK
        } else {
            SFlag::S_IFCHR
        };
        match mknod(&node_path, kind, Mode::from_bits_truncate(mode), dev.devnum()) {
            Ok(()) => {
                if let Err(err) = chown(&node_path, Some(uid), Some(gid)) {
                    error!(path = %node_path.display(), %err, "chown failed");
                }
                // mknod honors the umask; chmod once more to get the
                // requested bits.
                if let Err(err) = std::fs::set_permissions(
                    &node_path,
                    std::fs::Permissions::from_mode(mode),
                ) {
                    error!(path = %node_path.display(), %err, "chmod failed");
                }
                info!(
                    path = %node_path.display(),
                    mode = format_args!("{mode:o}"),
                    uid = uid.as_raw(),
                    gid = gid.as_raw(),
                    "created device node"
                );
            }
            Err(err) => {
                error!(path = %node_path.display(), %err, "mknod failed");
            }
        }
    }

    for link in dev.devlinks() {
        let link_path = dev_root.join(link);
        if let Some(parent) = link_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(path = %parent.display(), %err, "cannot create devlink directory");
                continue;
            }
        }
        if link_path.symlink_metadata().is_ok() {
            warn!(path = %link_path.display(), "devlink already exists, skipping");
            continue;
        }
        if let Err(err) = std::os::unix::fs::symlink(&node_path, &link_path) {
            error!(path = %link_path.display(), %err, "symlink failed");
        } else {
            debug!(path = %link_path.display(), "created devlink");
        }
    }
}

/// Remove the device node and its devlinks from `dev_root`.
pub fn remove_node(dev_root: &Path, dev: &Device) {
    let Some(devnode) = dev.devnode() else {
        return;
    };
    if dev.devnum() == 0 {
        return;
    }
    let node_path = dev_root.join(devnode);

    for link in dev.devlinks() {
        let link_path = dev_root.join(link);
        match std::fs::read_link(&link_path) {
            Ok(target) => {
                let resolved = if target.is_absolute() {
                    normalize(&target)
                } else {
                    let parent = link_path.parent().unwrap_or(dev_root);
                    normalize(&parent.join(target))
                };
                if resolved != normalize(&node_path) {
                    warn!(path = %link_path.display(), "devlink points elsewhere, leaving it");
                    continue;
                }
                if let Err(err) = std::fs::remove_file(&link_path) {
                    warn!(path = %link_path.display(), %err, "could not remove devlink");
                } else {
                    prune_empty_dirs(&link_path, dev_root);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %link_path.display(), "devlink already gone");
            }
            Err(err) if err.raw_os_error() == Some(nix::errno::Errno::EINVAL as i32) => {
                warn!(path = %link_path.display(), "expected a symlink, leaving it");
            }
            Err(err) => {
                warn!(path = %link_path.display(), %err, "could not inspect devlink");
            }
        }
    }

    match node_path.symlink_metadata() {
        Ok(meta) => {
            if meta.rdev() != dev.devnum() {
                warn!(
                    path = %node_path.display(),
                    "node is not ours anymore (rdev mismatch), leaving it"
                );
                return;
            }
            if let Err(err) = std::fs::remove_file(&node_path) {
                warn!(path = %node_path.display(), %err, "could not remove node");
            } else {
                info!(path = %node_path.display(), "removed device node");
                prune_empty_dirs(&node_path, dev_root);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %node_path.display(), "device node already gone");
        }
        Err(err) => {
            warn!(path = %node_path.display(), %err, "could not stat node");
        }
    }
}

/// Lexical path normalization; no filesystem access.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Remove now-empty parent directories of `removed`, stopping at the
/// `/dev` root (or the first non-empty directory).
fn prune_empty_dirs(removed: &Path, dev_root: &Path) {
    let mut dir = removed.parent();
    while let Some(d) = dir {
        if d == dev_root || !d.starts_with(dev_root) {
            break;
        }
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        debug!(path = %d.display(), "pruned empty directory");
        dir = d.parent();
    }
}
