//! Wire format of the udev control socket, for compatibility with the
//! standard admin tool (`udevadm control ...`, as shipped with udev 213).
//!
//! The record is read and written whole over a `SOCK_SEQPACKET` connection:
//!
//! ```text
//! struct udev_ctrl_msg_wire {
//!     char version[16];        /* "udev-213" */
//!     unsigned magic;          /* 0xdead1dea, native order */
//!     int type;
//!     union { int intval; char buf[256]; };
//! };
//! ```

/// Version string the compatible tool sends.
pub const CTRL_VERSION: &[u8] = b"udev-213";

/// Control message magic.
pub const CTRL_MAGIC: u32 = 0xdead_1dea;

/// Total wire size of one control record.
pub const CTRL_WIRE_SIZE: usize = 16 + 4 + 4 + 256;

/// Control message types, as numbered by the compatible tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsgType {
    /// Adjust the daemon log level (log-and-ignore here).
    SetLogLevel,
    /// Stop the exec queue (no worker pool here; log-and-ignore).
    StopExecQueue,
    /// Start the exec queue (log-and-ignore).
    StartExecQueue,
    /// Reload the rules.
    Reload,
    /// Set a global property (log-and-ignore).
    SetEnv,
    /// Adjust the worker count (log-and-ignore).
    SetChildrenMax,
    /// Liveness probe.
    Ping,
    /// Terminate the daemon.
    Exit,
    /// Anything else.
    Unknown(u32),
}

impl From<u32> for ControlMsgType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::SetLogLevel,
            2 => Self::StopExecQueue,
            3 => Self::StartExecQueue,
            4 => Self::Reload,
            5 => Self::SetEnv,
            6 => Self::SetChildrenMax,
            7 => Self::Ping,
            8 => Self::Exit,
            other => Self::Unknown(other),
        }
    }
}

impl From<ControlMsgType> for u32 {
    fn from(value: ControlMsgType) -> Self {
        match value {
            ControlMsgType::SetLogLevel => 1,
            ControlMsgType::StopExecQueue => 2,
            ControlMsgType::StartExecQueue => 3,
            ControlMsgType::Reload => 4,
            ControlMsgType::SetEnv => 5,
            ControlMsgType::SetChildrenMax => 6,
            ControlMsgType::Ping => 7,
            ControlMsgType::Exit => 8,
            ControlMsgType::Unknown(other) => other,
        }
    }
}

/// Errors from control record parsing.
#[derive(Debug, thiserror::Error)]
pub enum ControlParseError {
    /// Record shorter than the fixed header.
    #[error("control message truncated ({len} bytes)")]
    Truncated {
        /// Observed length.
        len: usize,
    },

    /// Wrong magic value.
    #[error("control message with broken magic {magic:#x}")]
    BadMagic {
        /// Observed magic.
        magic: u32,
    },
}

/// One udev control message.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    /// Message type.
    pub msg_type: ControlMsgType,
    version: [u8; 16],
    data: [u8; 256],
}

impl ControlMessage {
    /// New message of the given type with zeroed data.
    #[must_use]
    pub fn new(msg_type: ControlMsgType) -> Self {
        let mut version = [0u8; 16];
        version[..CTRL_VERSION.len()].copy_from_slice(CTRL_VERSION);
        Self {
            msg_type,
            version,
            data: [0u8; 256],
        }
    }

    /// New message carrying an integer value.
    #[must_use]
    pub fn with_intval(msg_type: ControlMsgType, value: i32) -> Self {
        let mut msg = Self::new(msg_type);
        msg.data[..4].copy_from_slice(&value.to_ne_bytes());
        msg
    }

    /// New message carrying a string value (truncated to 255 bytes, always
    /// NUL-terminated).
    #[must_use]
    pub fn with_buf(msg_type: ControlMsgType, value: &str) -> Self {
        let mut msg = Self::new(msg_type);
        let len = value.len().min(255);
        msg.data[..len].copy_from_slice(&value.as_bytes()[..len]);
        msg
    }

    /// The peer's version string, up to the first NUL.
    #[must_use]
    pub fn version_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.version.len());
        String::from_utf8_lossy(&self.version[..end])
    }

    /// The data union interpreted as an integer.
    #[must_use]
    pub fn intval(&self) -> i32 {
        i32::from_ne_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// The data union interpreted as a string, up to the first NUL.
    #[must_use]
    pub fn buf_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end])
    }

    /// Parse one wire record. Short data (the tool may send less than the
    /// full union) is accepted and zero-padded.
    pub fn parse(buf: &[u8]) -> Result<Self, ControlParseError> {
        if buf.len() < 24 {
            return Err(ControlParseError::Truncated { len: buf.len() });
        }

        let magic = u32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if magic != CTRL_MAGIC {
            return Err(ControlParseError::BadMagic { magic });
        }

        let mut version = [0u8; 16];
        version.copy_from_slice(&buf[..16]);
        let msg_type = u32::from_ne_bytes([buf[20], buf[21], buf[22], buf[23]]).into();

        let mut data = [0u8; 256];
        let payload = &buf[24..buf.len().min(CTRL_WIRE_SIZE)];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            msg_type,
            version,
            data,
        })
    }

    /// Pack into the wire record.
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CTRL_WIRE_SIZE);
        out.extend_from_slice(&self.version);
        out.extend_from_slice(&CTRL_MAGIC.to_ne_bytes());
        out.extend_from_slice(&u32::from(self.msg_type).to_ne_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_parse_round_trip() {
        let msg = ControlMessage::with_intval(ControlMsgType::SetLogLevel, 6);
        let wire = msg.pack();
        assert_eq!(wire.len(), CTRL_WIRE_SIZE);

        let parsed = ControlMessage::parse(&wire).unwrap();
        assert_eq!(parsed.msg_type, ControlMsgType::SetLogLevel);
        assert_eq!(parsed.intval(), 6);
        assert_eq!(parsed.version_str(), "udev-213");
    }

    #[test]
    fn string_payloads_are_nul_terminated() {
        let msg = ControlMessage::with_buf(ControlMsgType::SetEnv, "KEY=value");
        let parsed = ControlMessage::parse(&msg.pack()).unwrap();
        assert_eq!(parsed.buf_str(), "KEY=value");
    }

    #[test]
    fn unknown_types_are_preserved() {
        let msg = ControlMessage::new(ControlMsgType::Unknown(42));
        let parsed = ControlMessage::parse(&msg.pack()).unwrap();
        assert_eq!(parsed.msg_type, ControlMsgType::Unknown(42));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut wire = ControlMessage::new(ControlMsgType::Ping).pack();
        wire[16] ^= 0xff;
        assert!(matches!(
            ControlMessage::parse(&wire),
            Err(ControlParseError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_records_are_rejected() {
        let wire = ControlMessage::new(ControlMsgType::Ping).pack();
        assert!(matches!(
            ControlMessage::parse(&wire[..20]),
            Err(ControlParseError::Truncated { len: 20 })
        ));
    }

    #[test]
    fn short_data_is_zero_padded() {
        let wire = ControlMessage::with_intval(ControlMsgType::Exit, 0).pack();
        // The tool may send just header + intval.
        let parsed = ControlMessage::parse(&wire[..28]).unwrap();
        assert_eq!(parsed.msg_type, ControlMsgType::Exit);
        assert_eq!(parsed.intval(), 0);
    }
}
