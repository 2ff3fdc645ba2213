//! systemd socket-activation detection.

use std::os::fd::RawFd;

/// First file descriptor passed by socket activation.
pub const LISTEN_FDS_START: RawFd = 3;

/// Return the activation fd when the environment says one was passed to
/// this very process (`LISTEN_PID` must match; stale values inherited from
/// a parent are ignored).
#[must_use]
pub fn activation_fd() -> Option<RawFd> {
    let pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != std::process::id() {
        return None;
    }
    let count: u32 = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    (count >= 1).then_some(LISTEN_FDS_START)
}
