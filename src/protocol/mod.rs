//! The length-prefixed binary command protocol.
//!
//! Every unit on the wire is a frame: a `u64` byte length followed by that
//! many payload bytes. Command frames carry a fixed field layout (see
//! [`frame`]); reply and bulk-transfer frames carry raw bytes.

mod command;
mod frame;

pub use command::{Command, CommandKind};
pub use frame::{
    decode_command, decode_frame, encode_command, encode_frame, read_blob, read_frame,
    write_blob, write_frame, LEN_PREFIX,
};
