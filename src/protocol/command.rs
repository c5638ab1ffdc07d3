//! Command types.
//!
//! A [`Command`] is immutable once decoded and is owned by exactly one
//! component at a time: it moves from the decoder, through a queue, into
//! the executor.

use bytes::Bytes;

/// The operation a command frame requests.
///
/// Values are fixed by the wire format; [`CommandKind::Unknown`] preserves
/// unrecognized values so the executor can answer them explicitly instead
/// of the decoder rejecting the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Store or overwrite a key
    Set,
    /// Read a key
    Get,
    /// Dump a snapshot of the key space to disk
    BgSave,
    /// Request an immediate replication tick
    Sync,
    /// Rewrite the base AOF file from the current key space
    AofRewrite,
    /// Stop the server
    Shutdown,
    /// Any value this build does not recognize
    Unknown(u32),
}

impl CommandKind {
    /// Decode from the wire representation.
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            0 => Self::Set,
            1 => Self::Get,
            2 => Self::BgSave,
            3 => Self::Sync,
            4 => Self::AofRewrite,
            5 => Self::Shutdown,
            other => Self::Unknown(other),
        }
    }

    /// Encode to the wire representation.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Set => 0,
            Self::Get => 1,
            Self::BgSave => 2,
            Self::Sync => 3,
            Self::AofRewrite => 4,
            Self::Shutdown => 5,
            Self::Unknown(raw) => raw,
        }
    }

    /// Whether this command mutates the key space and must be propagated
    /// to the replica and the AOF.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Set)
    }
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Requested operation
    pub kind: CommandKind,
    /// Key bytes (without the wire NUL)
    pub key: Bytes,
    /// Value bytes (without the wire NUL)
    pub value: Bytes,
}

impl Command {
    /// Create a SET command.
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: CommandKind::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a GET command.
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self {
            kind: CommandKind::Get,
            key: key.into(),
            value: Bytes::new(),
        }
    }

    /// Create a SHUTDOWN command.
    pub fn shutdown() -> Self {
        Self {
            kind: CommandKind::Shutdown,
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Size of the frame body: kind, two field lengths, and both fields
    /// with their NUL terminators.
    pub fn body_len(&self) -> usize {
        4 + 8 + 8 + (self.key.len() + 1) + (self.value.len() + 1)
    }

    /// The canonical encoded length of this command on the wire, length
    /// prefix included.
    ///
    /// Replication offsets advance by exactly this amount on both the
    /// master (backlog append) and the slave (per-command apply); any other
    /// length formula would make the offsets drift and degrade every sync
    /// to a full resync.
    pub fn wire_len(&self) -> u64 {
        (super::LEN_PREFIX + self.body_len()) as u64
    }
}
