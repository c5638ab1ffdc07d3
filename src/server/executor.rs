//! Command execution.
//!
//! The single mutation point of the key space. Whichever thread runs
//! [`execute`] is "the executor thread": the reactor in both server
//! configurations, plus the replication apply loop on a slave. Every SET
//! fans out to the dict, the replication backlog, and the AOF buffer in
//! one pass.

use super::Server;
use crate::protocol::{encode_frame, Command, CommandKind};
use crate::repl::{ReplStatus, StatusPacket};
use crate::server::config::Role;
use bytes::Bytes;
use std::io::Write;
use tracing::{debug, info, trace, warn};

/// Reply to a successful write.
pub const REPLY_OK: &[u8] = b"ok";
/// Reply to a GET for an absent key.
pub const REPLY_NOT_FOUND: &[u8] = b"Not found!";
/// Reply to SHUTDOWN.
pub const REPLY_SHUTDOWN: &[u8] = b"server is shutdown!";
/// Reply to a command kind this build does not know.
pub const REPLY_UNKNOWN: &[u8] = b"unknown command";

/// Apply one command and produce its reply payload.
///
/// Total over the command space: protocol-level garbage was already
/// rejected by the decoder, and unknown kinds get an explicit reply rather
/// than an error.
pub fn execute(server: &Server, cmd: Command) -> Bytes {
    trace!(kind = ?cmd.kind, key_len = cmd.key.len(), "executing");
    match cmd.kind {
        CommandKind::Set => {
            let frame = encode_frame(&cmd);
            server.dict.lock().insert(cmd.key.clone(), cmd.value.clone());
            if server.config.role == Role::Master {
                let end_offset = {
                    let mut backlog = server.backlog.lock();
                    backlog.append(&frame);
                    backlog.end_offset()
                };
                push_long_connect(server, end_offset, &frame);
            }
            if let Err(e) = server.aof.lock().append(&cmd) {
                warn!(error = %e, "AOF append failed");
            }
            Bytes::from_static(REPLY_OK)
        }
        CommandKind::Get => match server.dict.lock().find(&cmd.key).cloned() {
            Some(value) => value,
            None => Bytes::from_static(REPLY_NOT_FOUND),
        },
        CommandKind::Shutdown => {
            info!("shutdown requested by command");
            server.request_stop();
            Bytes::from_static(REPLY_SHUTDOWN)
        }
        CommandKind::BgSave => {
            server.spawn_bgsave();
            Bytes::from_static(REPLY_OK)
        }
        CommandKind::Sync => {
            server.request_sync();
            Bytes::from_static(REPLY_OK)
        }
        CommandKind::AofRewrite => {
            let entries = server.dict.lock().snapshot_entries();
            if let Err(e) = server.aof.lock().rewrite(entries) {
                warn!(error = %e, "AOF rewrite failed to start");
            }
            Bytes::from_static(REPLY_OK)
        }
        CommandKind::Unknown(raw) => {
            debug!(raw, "unknown command kind");
            Bytes::from_static(REPLY_UNKNOWN)
        }
    }
}

/// Best-effort push of one freshly-executed command over the established
/// replication link.
///
/// The packet carries the offset of the command's first byte; a slave
/// that is not exactly there ignores the push and waits for the next
/// sync tick. Skipped without blocking whenever the replication thread
/// holds the link (a sync exchange is in progress); the command is in
/// the backlog either way, so the next incremental resync covers it.
fn push_long_connect(server: &Server, end_offset: u64, frame: &[u8]) {
    let Some(mut guard) = server.push_link.try_lock() else {
        return;
    };
    let Some(stream) = guard.as_mut() else {
        return;
    };
    let cmd_start = end_offset - frame.len() as u64;
    let result = StatusPacket::new(cmd_start, ReplStatus::LongConnect)
        .write_to(stream)
        .and_then(|()| {
            stream.write_all(frame)?;
            Ok(())
        });
    if let Err(e) = result {
        warn!(error = %e, "long-connect push failed, dropping link");
        *guard = None;
    }
}
