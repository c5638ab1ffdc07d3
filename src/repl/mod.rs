//! Master/slave replication.
//!
//! Both roles speak the same fixed 12-byte status packet and reuse the
//! command frame format for the incremental stream. The master drives
//! heartbeat and sync ticks; the slave blocks on its link and reacts.

mod backlog;
mod master;
mod replica;

pub use backlog::ReplBacklog;
pub use master::run_master;
pub use replica::run_replica;

use crate::error::{ReplError, Result};
use std::io::{Read, Write};

/// Replication session status, also the per-packet discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplStatus {
    /// Initial state
    None = 0,
    /// Link configured, not yet connected
    Connect,
    /// TCP connect in flight
    Connecting,
    /// Heartbeat / handshake probe
    Check,
    /// Full snapshot transfer follows
    FullResync,
    /// Incremental command stream follows
    IncrResync,
    /// One pushed command frame follows
    LongConnect,
    /// Acknowledgement
    Ack,
    /// Error/abort state; the link is unusable
    Null,
}

impl ReplStatus {
    /// Decode from the wire representation.
    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::None,
            1 => Self::Connect,
            2 => Self::Connecting,
            3 => Self::Check,
            4 => Self::FullResync,
            5 => Self::IncrResync,
            6 => Self::LongConnect,
            7 => Self::Ack,
            8 => Self::Null,
            other => return Err(ReplError::UnknownStatus(other).into()),
        })
    }
}

/// The fixed-size packet exchanged on the replication link.
///
/// Sent without a length prefix since both sides know its size. Fields are
/// serialized in declared order, independent of in-memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPacket {
    /// Sender's replication offset
    pub offset: u64,
    /// Sender's session status
    pub status: ReplStatus,
}

impl StatusPacket {
    /// Serialized size in bytes.
    pub const WIRE_LEN: usize = 12;

    /// Build a packet.
    pub fn new(offset: u64, status: ReplStatus) -> Self {
        Self { offset, status }
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..].copy_from_slice(&(self.status as u32).to_le_bytes());
        buf
    }

    /// Deserialize from the fixed wire layout.
    pub fn decode(buf: &[u8; Self::WIRE_LEN]) -> Result<Self> {
        let offset = u64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"));
        let status = ReplStatus::from_wire(u32::from_le_bytes(
            buf[8..].try_into().expect("4-byte slice"),
        ))?;
        Ok(Self { offset, status })
    }

    /// Read one packet from a blocking stream.
    ///
    /// A clean end-of-stream before the first byte maps to
    /// [`ReplError::LinkClosed`]: there is no packet boundary to resume
    /// from on a replication link.
    pub fn read_from(stream: &mut impl Read) -> Result<Self> {
        let mut buf = [0u8; Self::WIRE_LEN];
        stream.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                crate::error::Error::from(ReplError::LinkClosed)
            } else {
                e.into()
            }
        })?;
        Self::decode(&buf)
    }

    /// Write one packet to a blocking stream.
    pub fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_all(&self.encode())?;
        Ok(())
    }
}
