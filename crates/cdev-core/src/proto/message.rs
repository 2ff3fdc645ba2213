//! Protocol messages and command vocabulary.

use bytes::{BufMut, Bytes, BytesMut};

use super::framing::ProtocolError;
use crate::device::SyncSelector;

/// The protocol command set. Direction is encoded in the case: the server
/// originates uppercase commands, clients lowercase ones.
pub mod command {
    /// S→C handshake probe.
    pub const HELLO: &str = "HELLO";
    /// S→C forwarded event (libudev-format buffer).
    pub const UEVENT: &str = "UEVENT";
    /// S→C cross-boundary state carry (`devpath\0selector\0buffer`).
    pub const SYNC: &str = "SYNC";
    /// S→C bulk-replay opening bracket.
    pub const BEGINCMD: &str = "BEGINCMD";
    /// S→C bulk-replay closing bracket.
    pub const ENDCMD: &str = "ENDCMD";
    /// S→C server-initiated close.
    pub const BYE: &str = "BYE";
    /// S→C echo reply.
    pub const ECHO: &str = "ECHO";

    /// C→S handshake reply carrying the container name.
    pub const CLIENT_HELLO: &str = "hello";
    /// C→S disable host-side persistence and cgroup updates.
    pub const CLIENT_DRY_RUN: &str = "dry_run";
    /// C→S request replay of current devices as `add`.
    pub const CLIENT_BOOT: &str = "boot";
    /// C→S request replay of current devices as `remove`.
    pub const CLIENT_SHUTDOWN: &str = "shutdown";
    /// C→S close.
    pub const CLIENT_BYE: &str = "bye";
    /// C→S diagnostic echo request.
    pub const CLIENT_ECHO: &str = "echo";
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command tag; see [`command`].
    pub command: String,
    /// Format tag for structured payloads; `None` for plain data.
    pub fmt: Option<[u8; 4]>,
    /// Payload bytes.
    pub data: Bytes,
}

impl Message {
    /// Plain data message.
    pub fn new(command: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            fmt: None,
            data: data.into(),
        }
    }

    /// Message without a payload.
    pub fn empty(command: impl Into<String>) -> Self {
        Self::new(command, Bytes::new())
    }

    /// Payload interpreted as text (lossy; diagnostics only).
    #[must_use]
    pub fn data_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Encode a `SYNC` payload: `devpath\0selector\0buffer`.
#[must_use]
pub fn encode_sync(devpath: &str, sel: SyncSelector, buffer: &[u8]) -> Bytes {
    let sel = sel.to_string();
    let mut out = BytesMut::with_capacity(devpath.len() + sel.len() + buffer.len() + 2);
    out.extend_from_slice(devpath.as_bytes());
    out.put_u8(0);
    out.extend_from_slice(sel.as_bytes());
    out.put_u8(0);
    out.extend_from_slice(buffer);
    out.freeze()
}

/// Decode a `SYNC` payload into `(devpath, selector, buffer)`.
pub fn parse_sync(data: &[u8]) -> Result<(String, SyncSelector, Bytes), ProtocolError> {
    let mut parts = data.splitn(3, |&b| b == 0);
    let devpath = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or(ProtocolError::MalformedSync("missing devpath"))?;
    let selector = parts
        .next()
        .ok_or(ProtocolError::MalformedSync("missing selector"))?;
    let buffer = parts
        .next()
        .ok_or(ProtocolError::MalformedSync("missing buffer"))?;

    let devpath = std::str::from_utf8(devpath)
        .map_err(|_| ProtocolError::MalformedSync("devpath is not utf-8"))?
        .to_string();
    let selector = std::str::from_utf8(selector)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::MalformedSync("bad selector"))?;

    Ok((devpath, selector, Bytes::copy_from_slice(buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_payload_round_trip() {
        let payload = encode_sync("/devices/x", SyncSelector::ALL, b"E:A=1\nG:t");
        let (devpath, sel, buffer) = parse_sync(&payload).unwrap();
        assert_eq!(devpath, "/devices/x");
        assert_eq!(sel, SyncSelector::ALL);
        assert_eq!(&buffer[..], b"E:A=1\nG:t");
    }

    #[test]
    fn sync_buffer_may_contain_nul_free_lines_only_in_head() {
        // The buffer part is opaque: embedded NULs after the second
        // separator must survive.
        let payload = encode_sync("/devices/x", SyncSelector::ENV, b"a\0b");
        let (_, _, buffer) = parse_sync(&payload).unwrap();
        assert_eq!(&buffer[..], b"a\0b");
    }

    #[test]
    fn malformed_sync_payloads_are_rejected() {
        assert!(parse_sync(b"").is_err());
        assert!(parse_sync(b"/devices/x").is_err());
        assert!(parse_sync(b"/devices/x\0EG").is_err());
        assert!(parse_sync(b"/devices/x\0XY\0buf").is_err());
    }
}
