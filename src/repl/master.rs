//! Master side of replication.
//!
//! The master listens on its replication port and serves one replica at a
//! time. Each tick is a heartbeat handshake followed by the sync
//! decision: up to date, incremental from the backlog, or a full snapshot
//! transfer. Between ticks the link is parked in the server context so
//! the executor can push freshly-executed commands over it.

use super::{ReplStatus, StatusPacket};
use crate::error::{ReplError, Result};
use crate::persistence;
use crate::protocol::write_blob;
use crate::server::Server;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between nonblocking accept attempts.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Time between replication ticks.
const REPL_TICK: Duration = Duration::from_millis(1000);

/// Granularity at which the inter-tick sleep rechecks the stop flag and
/// latched sync requests.
const TICK_POLL: Duration = Duration::from_millis(100);

/// A replica that answers nothing for this long is treated as gone.
const LINK_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Replication-thread entry point for the master role.
pub fn run_master(server: Arc<Server>) {
    let addr = format!("{}:{}", server.config.bind, server.config.repl_port);
    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, %addr, "replication listener failed, replication disabled");
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "replication listener cannot be made nonblocking");
        return;
    }
    info!(%addr, "listening for replica");

    while !server.should_stop() {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "replica connected");
                if let Err(e) = serve_slave(&server, stream) {
                    warn!(error = %e, "replica session ended");
                }
                *server.push_link.lock() = None;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_RETRY),
            Err(e) => {
                warn!(error = %e, "replication accept failed");
                thread::sleep(ACCEPT_RETRY);
            }
        }
    }
}

/// Drive one replica until the link dies or the server stops.
fn serve_slave(server: &Arc<Server>, stream: std::net::TcpStream) -> Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(LINK_READ_TIMEOUT))?;
    *server.push_link.lock() = Some(stream);

    loop {
        if server.should_stop() {
            return Ok(());
        }
        {
            // Holding the link for the whole exchange also suppresses
            // executor pushes, so a command can never arrive both inside
            // and after the slice being synced.
            let mut guard = server.push_link.lock();
            let Some(stream) = guard.as_mut() else {
                return Err(ReplError::LinkClosed.into());
            };
            if let Err(e) = tick(server, stream) {
                *guard = None;
                return Err(e);
            }
        }

        let mut waited = Duration::ZERO;
        while waited < REPL_TICK && !server.should_stop() {
            if server.take_sync_request() {
                break;
            }
            thread::sleep(TICK_POLL);
            waited += TICK_POLL;
        }
    }
}

/// One heartbeat handshake plus the sync decision.
fn tick<S: Read + Write>(server: &Arc<Server>, stream: &mut S) -> Result<()> {
    StatusPacket::new(server.master_offset(), ReplStatus::Check).write_to(stream)?;
    let reply = StatusPacket::read_from(stream)?;
    if reply.status != ReplStatus::Check {
        return Err(ReplError::StatusMismatch {
            expected: ReplStatus::Check as u32,
            got: reply.status as u32,
        }
        .into());
    }
    let slave_offset = reply.offset;

    enum SyncPlan {
        UpToDate,
        Incr { master_offset: u64, bytes: Vec<u8> },
        Full,
    }

    let plan = {
        let backlog = server.backlog.lock();
        let master_offset = backlog.end_offset();
        if slave_offset == master_offset {
            SyncPlan::UpToDate
        } else if let Some(bytes) = backlog.slice_from(slave_offset) {
            SyncPlan::Incr {
                master_offset,
                bytes,
            }
        } else {
            SyncPlan::Full
        }
    };

    match plan {
        SyncPlan::UpToDate => Ok(()),
        SyncPlan::Incr {
            master_offset,
            bytes,
        } => {
            debug!(
                from = slave_offset,
                to = master_offset,
                bytes = bytes.len(),
                "incremental resync"
            );
            StatusPacket::new(master_offset, ReplStatus::IncrResync).write_to(stream)?;
            write_blob(stream, &bytes)?;
            Ok(())
        }
        SyncPlan::Full => {
            // Offset before entries: a command executed in between is
            // covered again by the next incremental pass, and re-applying
            // a SET is idempotent. The other order would lose it.
            let snap_offset = server.backlog.lock().end_offset();
            let entries = server.dict.lock().snapshot_entries();
            info!(
                offset = snap_offset,
                entries = entries.len(),
                "full resync"
            );
            let path = server.config.dir.join(persistence::DUMP_FILE_NAME);
            persistence::dump_to(&path, &entries)?;
            let bytes = std::fs::read(&path)?;
            StatusPacket::new(snap_offset, ReplStatus::FullResync).write_to(stream)?;
            write_blob(stream, &bytes)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, read_blob, Command};
    use crate::server::{Config, Role};

    /// In-memory stand-in for the replication socket: scripted input,
    /// captured output.
    struct FakeLink {
        input: io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeLink {
        fn answering(packet: StatusPacket) -> Self {
            Self {
                input: io::Cursor::new(packet.encode().to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn master_server() -> (Arc<Server>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            role: Role::Master,
            dir: dir.path().to_path_buf(),
            backlog_capacity: 4096,
            ..Config::default()
        };
        (Arc::new(Server::new(config).unwrap()), dir)
    }

    fn feed_set(server: &Arc<Server>, key: &str, value: &str) -> u64 {
        let cmd = Command::set(key.as_bytes().to_vec(), value.as_bytes().to_vec());
        let frame = encode_frame(&cmd);
        server.dict.lock().insert(cmd.key.clone(), cmd.value.clone());
        server.backlog.lock().append(&frame);
        cmd.wire_len()
    }

    #[test]
    fn test_tick_up_to_date_is_noop() {
        let (server, _dir) = master_server();
        feed_set(&server, "a", "1");
        let offset = server.master_offset();

        let mut link = FakeLink::answering(StatusPacket::new(offset, ReplStatus::Check));
        tick(&server, &mut link).unwrap();

        // Only the heartbeat went out.
        assert_eq!(link.output.len(), StatusPacket::WIRE_LEN);
        let sent = StatusPacket::decode(&link.output[..12].try_into().unwrap()).unwrap();
        assert_eq!(sent.status, ReplStatus::Check);
        assert_eq!(sent.offset, offset);
    }

    #[test]
    fn test_tick_incremental_sends_exact_range() {
        let (server, _dir) = master_server();
        let len1 = feed_set(&server, "a", "1");
        let len2 = feed_set(&server, "b", "2");
        let master_offset = server.master_offset();
        assert_eq!(master_offset, len1 + len2);

        // The slave is caught up through the first command.
        let mut link = FakeLink::answering(StatusPacket::new(len1, ReplStatus::Check));
        tick(&server, &mut link).unwrap();

        let mut out = io::Cursor::new(link.output);
        let heartbeat = StatusPacket::read_from(&mut out).unwrap();
        assert_eq!(heartbeat.status, ReplStatus::Check);
        let decision = StatusPacket::read_from(&mut out).unwrap();
        assert_eq!(decision.status, ReplStatus::IncrResync);
        assert_eq!(decision.offset, master_offset);
        let blob = read_blob(&mut out).unwrap().unwrap();
        assert_eq!(blob.len() as u64, len2, "exactly the missing bytes");
        assert_eq!(
            &blob[..],
            &server.backlog.lock().slice_from(len1).unwrap()[..]
        );
    }

    #[test]
    fn test_tick_stale_slave_gets_full_resync() {
        let (server, _dir) = master_server();
        // A tiny backlog that has certainly discarded offset 0.
        {
            let mut backlog = server.backlog.lock();
            *backlog = crate::repl::ReplBacklog::new(64);
        }
        for i in 0..20 {
            feed_set(&server, &format!("key-{i}"), "value");
        }
        assert!(server.backlog.lock().start_offset() > 0);
        let snap_offset = server.master_offset();

        let mut link = FakeLink::answering(StatusPacket::new(0, ReplStatus::Check));
        tick(&server, &mut link).unwrap();

        let mut out = io::Cursor::new(link.output);
        let _heartbeat = StatusPacket::read_from(&mut out).unwrap();
        let decision = StatusPacket::read_from(&mut out).unwrap();
        assert_eq!(decision.status, ReplStatus::FullResync);
        assert_eq!(decision.offset, snap_offset);

        // The blob is a loadable snapshot of the whole key space.
        let blob = read_blob(&mut out).unwrap().unwrap();
        let mut dict = crate::storage::Dict::with_base_exp(2);
        let applied = {
            let tmp = server.config.dir.join("recv.bin");
            std::fs::write(&tmp, &blob).unwrap();
            crate::persistence::load_from(&tmp, &mut dict).unwrap()
        };
        assert_eq!(applied, 20);
        assert_eq!(dict.find(b"key-7").map(|v| &v[..]), Some(&b"value"[..]));
    }

    #[test]
    fn test_tick_handshake_mismatch_is_fatal() {
        let (server, _dir) = master_server();
        let mut link = FakeLink::answering(StatusPacket::new(0, ReplStatus::Ack));
        let err = tick(&server, &mut link).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Replication(ReplError::StatusMismatch { .. })
        ));
    }

    #[test]
    fn test_tick_dead_link_is_fatal() {
        let (server, _dir) = master_server();
        let mut link = FakeLink {
            input: io::Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        let err = tick(&server, &mut link).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Replication(ReplError::LinkClosed)
        ));
    }

    #[test]
    fn test_example_offsets_scenario() {
        // Master offset 600, slave offset 500, buffer retains 500: the
        // sync transfers exactly the bytes for [500, 600).
        let (server, _dir) = master_server();
        server.backlog.lock().append(&vec![0u8; 500]);
        server.backlog.lock().append(&vec![1u8; 100]);
        assert_eq!(server.master_offset(), 600);

        let mut link = FakeLink::answering(StatusPacket::new(500, ReplStatus::Check));
        tick(&server, &mut link).unwrap();
        let mut out = io::Cursor::new(link.output);
        let _ = StatusPacket::read_from(&mut out).unwrap();
        let decision = StatusPacket::read_from(&mut out).unwrap();
        assert_eq!(decision.status, ReplStatus::IncrResync);
        let blob = read_blob(&mut out).unwrap().unwrap();
        assert_eq!(blob.len(), 100);
        assert_eq!(&blob[..], &[1u8; 100][..]);
    }
}
