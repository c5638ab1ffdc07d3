//! Frame encoding and decoding.
//!
//! Wire layout of a command frame:
//!
//! ```text
//! [u64 frame_length][u32 kind][u64 key_len][key bytes + NUL][u64 value_len][value bytes + NUL]
//! ```
//!
//! All integers are little-endian and written field by field; the decoder
//! never relies on in-memory struct layout. `key_len` and `value_len`
//! include the NUL terminator. A zero-length read at any point signals
//! peer disconnect.

use super::{Command, CommandKind};
use crate::error::{ProtocolError, Result};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Size of the `u64` length prefix preceding every frame.
pub const LEN_PREFIX: usize = 8;

/// Encode a command body (no length prefix) into `buf`.
pub fn encode_command(cmd: &Command, buf: &mut BytesMut) {
    buf.put_u32_le(cmd.kind.to_wire());
    buf.put_u64_le((cmd.key.len() + 1) as u64);
    buf.put_slice(&cmd.key);
    buf.put_u8(0);
    buf.put_u64_le((cmd.value.len() + 1) as u64);
    buf.put_slice(&cmd.value);
    buf.put_u8(0);
}

/// Encode a complete frame: length prefix followed by the command body.
pub fn encode_frame(cmd: &Command) -> Bytes {
    let body_len = cmd.body_len();
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body_len);
    buf.put_u64_le(body_len as u64);
    encode_command(cmd, &mut buf);
    buf.freeze()
}

/// Decode one command body from `buf`.
///
/// Returns the command and the number of body bytes consumed.
pub fn decode_command(buf: &[u8]) -> Result<(Command, usize)> {
    let mut cur = buf;
    if cur.remaining() < 4 + 8 {
        return Err(ProtocolError::Truncated {
            need: 4 + 8,
            have: cur.remaining(),
        }
        .into());
    }
    let kind = CommandKind::from_wire(cur.get_u32_le());
    let key = take_field(&mut cur)?;
    if cur.remaining() < 8 {
        return Err(ProtocolError::Truncated {
            need: 8,
            have: cur.remaining(),
        }
        .into());
    }
    let value = take_field(&mut cur)?;
    let consumed = buf.len() - cur.remaining();
    Ok((Command { kind, key, value }, consumed))
}

/// Read one `[u64 len][bytes]` field, stripping the trailing NUL.
fn take_field(cur: &mut &[u8]) -> Result<Bytes> {
    let len = cur.get_u64_le();
    if len == 0 {
        return Err(ProtocolError::EmptyField.into());
    }
    if len > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    let len = len as usize;
    if cur.remaining() < len {
        return Err(ProtocolError::Truncated {
            need: len,
            have: cur.remaining(),
        }
        .into());
    }
    if cur[len - 1] != 0 {
        return Err(ProtocolError::MissingNul.into());
    }
    let field = Bytes::copy_from_slice(&cur[..len - 1]);
    cur.advance(len);
    Ok(field)
}

/// Try to decode one length-prefixed command frame from an accumulation
/// buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// on success the frame's bytes are consumed from `buf`.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Command>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let body_len = u64::from_le_bytes(buf[..LEN_PREFIX].try_into().expect("8-byte slice"));
    if body_len > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len: body_len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    let body_len = body_len as usize;
    if buf.len() < LEN_PREFIX + body_len {
        return Ok(None);
    }
    buf.advance(LEN_PREFIX);
    let body = buf.split_to(body_len);
    let (cmd, consumed) = decode_command(&body)?;
    if consumed != body_len {
        return Err(ProtocolError::Truncated {
            need: body_len,
            have: consumed,
        }
        .into());
    }
    Ok(Some(cmd))
}

/// Read one command frame from a blocking stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<Command>> {
    let body = match read_blob(stream)? {
        Some(body) => body,
        None => return Ok(None),
    };
    let (cmd, consumed) = decode_command(&body)?;
    if consumed != body.len() {
        return Err(ProtocolError::Truncated {
            need: body.len(),
            have: consumed,
        }
        .into());
    }
    Ok(Some(cmd))
}

/// Write one command frame to a blocking stream.
pub fn write_frame(stream: &mut impl Write, cmd: &Command) -> Result<()> {
    stream.write_all(&encode_frame(cmd))?;
    Ok(())
}

/// Read one `[u64 len][bytes]` unit from a blocking stream.
///
/// Returns `Ok(None)` on a clean end-of-stream before the length prefix.
pub fn read_blob(stream: &mut impl Read) -> Result<Option<Bytes>> {
    let mut prefix = [0u8; LEN_PREFIX];
    match stream.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(prefix);
    if len > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(Some(Bytes::from(body)))
}

/// Write one `[u64 len][bytes]` unit to a blocking stream.
pub fn write_blob(stream: &mut impl Write, payload: &[u8]) -> Result<()> {
    stream.write_all(&(payload.len() as u64).to_le_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}
