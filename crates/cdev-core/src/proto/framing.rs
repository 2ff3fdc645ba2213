//! Length-prefixed frame codec for the host↔container protocol.
//!
//! Each frame consists of:
//!
//! ```text
//! +---------------------+------+---------+---------+------------+---------+
//! | Length (4 bytes BE) | kind | cmd len | command | fmt (opt.) | payload |
//! +---------------------+------+---------+---------+------------+---------+
//! ```
//!
//! `Length` covers everything after itself. `kind` 0 is a plain data
//! payload; kind 1 carries a 4-byte format tag between command and payload.
//! The frame length is validated before any allocation, and frames above
//! [`MAX_FRAME_SIZE`] are rejected.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// Maximum frame size (1 MiB). Uevent buffers are bounded by the netlink
/// receive buffer, sync buffers by the device db; this leaves ample slack.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the frame header (4 bytes for the u32 length prefix).
const HEADER_LEN: usize = 4;

/// Payload kind tags.
const KIND_DATA: u8 = 0;
const KIND_TAGGED: u8 = 1;

/// Protocol-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Claimed or actual frame size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Command longer than the one-byte length field allows.
    #[error("command of {len} bytes exceeds the 255 byte limit")]
    CommandTooLong {
        /// Actual command length.
        len: usize,
    },

    /// Frame body shorter than its own structure requires.
    #[error("truncated frame body ({len} bytes)")]
    TruncatedFrame {
        /// Observed body length.
        len: usize,
    },

    /// Unknown payload kind tag.
    #[error("unknown payload kind {0:#x}")]
    UnknownKind(u8),

    /// Command bytes are not valid UTF-8.
    #[error("command is not valid utf-8")]
    BadCommand,

    /// A malformed `SYNC` payload.
    #[error("malformed SYNC payload: {0}")]
    MalformedSync(&'static str),

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frame codec for use with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    _private: (),
}

impl MessageCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before allocating.
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(length).freeze();

        if body.len() < 2 {
            return Err(ProtocolError::TruncatedFrame { len: body.len() });
        }
        let kind = body.get_u8();
        let cmd_len = body.get_u8() as usize;

        let fmt_len = match kind {
            KIND_DATA => 0,
            KIND_TAGGED => 4,
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        if body.len() < cmd_len + fmt_len {
            return Err(ProtocolError::TruncatedFrame { len: body.len() });
        }

        let command = std::str::from_utf8(&body.split_to(cmd_len))
            .map_err(|_| ProtocolError::BadCommand)?
            .to_string();
        let fmt = if kind == KIND_TAGGED {
            let tag = body.split_to(4);
            Some([tag[0], tag[1], tag[2], tag[3]])
        } else {
            None
        };

        Ok(Some(Message {
            command,
            fmt,
            data: body,
        }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let cmd = item.command.as_bytes();
        if cmd.len() > u8::MAX as usize {
            return Err(ProtocolError::CommandTooLong { len: cmd.len() });
        }

        let fmt_len = if item.fmt.is_some() { 4 } else { 0 };
        let length = 2 + cmd.len() + fmt_len + item.data.len();
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + length);
        #[allow(clippy::cast_possible_truncation)]
        {
            dst.put_u32(length as u32);
            dst.put_u8(if item.fmt.is_some() { KIND_TAGGED } else { KIND_DATA });
            dst.put_u8(cmd.len() as u8);
        }
        dst.extend_from_slice(cmd);
        if let Some(fmt) = item.fmt {
            dst.extend_from_slice(&fmt);
        }
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}
