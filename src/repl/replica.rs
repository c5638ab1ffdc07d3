//! Slave side of replication.
//!
//! The slave connects to the master's replication port and then blocks on
//! the link, reacting to whatever the master sends: heartbeats, a full
//! snapshot, an incremental command slice, or single pushed commands.
//! Commands are always decoded to completion before execution, so a
//! mid-stream failure never leaves a half-applied command, and the offset
//! advances per command, never in bulk.

use super::{ReplStatus, StatusPacket};
use crate::error::{Error, ReplError, Result};
use crate::persistence;
use crate::protocol::{decode_frame, read_blob, read_frame};
use crate::server::{executor, Server};
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between reconnect attempts.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Read timeout on the link; each expiry rechecks the stop flag. Twice
/// the master's tick, so a healthy link never times out between
/// heartbeats.
const LINK_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Replication-thread entry point for the slave role.
pub fn run_replica(server: Arc<Server>) {
    let addr = format!("{}:{}", server.config.peer_ip, server.config.peer_port);
    while !server.should_stop() {
        match TcpStream::connect(&addr) {
            Ok(stream) => {
                info!(%addr, "connected to master");
                if let Err(e) = serve_master(&server, stream) {
                    warn!(error = %e, "master session ended");
                }
            }
            Err(e) => {
                debug!(error = %e, %addr, "master not reachable");
            }
        }
        for _ in 0..10 {
            if server.should_stop() {
                return;
            }
            thread::sleep(CONNECT_RETRY);
        }
    }
}

/// Block on the link and apply whatever the master sends.
fn serve_master(server: &Arc<Server>, mut stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(LINK_READ_TIMEOUT))?;
    loop {
        if server.should_stop() {
            return Ok(());
        }
        let packet = match StatusPacket::read_from(&mut stream) {
            Ok(packet) => packet,
            Err(Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };
        handle_packet(server, &mut stream, packet)?;
    }
}

/// React to one packet from the master.
fn handle_packet<S: Read + Write>(
    server: &Arc<Server>,
    stream: &mut S,
    packet: StatusPacket,
) -> Result<()> {
    match packet.status {
        ReplStatus::Check => {
            StatusPacket::new(server.repl_offset(), ReplStatus::Check).write_to(stream)
        }
        ReplStatus::FullResync => {
            let blob = read_blob(stream)?.ok_or(ReplError::LinkClosed)?;
            // Receive to disk first, then bulk-load, like any snapshot.
            let path = server.config.dir.join(persistence::DUMP_FILE_NAME);
            std::fs::write(&path, &blob)?;
            {
                let mut dict = server.dict.lock();
                persistence::load_from(&path, &mut dict)?;
            }
            // The key space now corresponds to the snapshot's offset.
            server.set_repl_offset(packet.offset);
            info!(offset = packet.offset, "full resync applied");
            Ok(())
        }
        ReplStatus::IncrResync => {
            let blob = read_blob(stream)?.ok_or(ReplError::LinkClosed)?;
            let mut buf = BytesMut::from(&blob[..]);
            let mut applied = 0u64;
            while let Some(cmd) = decode_frame(&mut buf)? {
                let advance = cmd.wire_len();
                executor::execute(server, cmd);
                server.advance_repl_offset(advance);
                applied += 1;
            }
            debug!(
                applied,
                offset = server.repl_offset(),
                "incremental resync applied"
            );
            Ok(())
        }
        ReplStatus::LongConnect => {
            // The frame is consumed even when the push is ignored, so the
            // stream stays aligned on packet boundaries.
            let cmd = read_frame(stream)?.ok_or(ReplError::LinkClosed)?;
            if packet.offset == server.repl_offset() {
                let advance = cmd.wire_len();
                executor::execute(server, cmd);
                server.advance_repl_offset(advance);
            } else {
                debug!(
                    pushed_at = packet.offset,
                    applied = server.repl_offset(),
                    "out-of-sequence push ignored, waiting for sync tick"
                );
            }
            Ok(())
        }
        ReplStatus::Null => Err(ReplError::Aborted.into()),
        ReplStatus::None
        | ReplStatus::Connect
        | ReplStatus::Connecting
        | ReplStatus::Ack => Err(ReplError::StatusMismatch {
            expected: ReplStatus::Check as u32,
            got: packet.status as u32,
        }
        .into()),
    }
}
