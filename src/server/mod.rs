//! The server: shared context, event loop, and command execution.
//!
//! [`Server`] is the explicit context handle threaded through every
//! operation; there is no ambient global. The dict, backlog, and AOF sit
//! behind their own locks with a strict discipline: only the executor
//! thread mutates them, the replication thread reads offsets that only
//! move forward.

pub mod config;
mod conn;
pub mod executor;
mod io_threads;
mod reactor;

pub use config::{Config, LogLevel, Role};
pub use conn::{ClientConn, ReadOutcome};
pub use io_threads::{ExecEvent, ExecItem, IoJob, IoThreadPool, Queue};

use crate::error::Result;
use crate::persistence::{self, AofWriter};
use crate::repl::{self, ReplBacklog};
use crate::storage::Dict;
use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// The server context: configuration plus every piece of shared state.
pub struct Server {
    /// Static configuration
    pub config: Config,
    /// The key space; mutated only by the executor thread
    pub dict: Mutex<Dict>,
    /// Replication backlog; written by the executor, read by the
    /// replication thread
    pub backlog: Mutex<ReplBacklog>,
    /// AOF collaborator
    pub aof: Mutex<AofWriter>,
    /// Established replication link for long-connect pushes (master role).
    /// The replication thread holds this lock across a whole sync
    /// exchange; the executor only ever try-locks it.
    pub push_link: Mutex<Option<TcpStream>>,
    stop: AtomicBool,
    sync_requested: AtomicBool,
    /// Offset of the command stream this slave has applied (slave role)
    slave_offset: AtomicU64,
    /// Snapshot dump in flight, retained so shutdown can join it
    bgsave: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Build a server from configuration, opening the AOF in the data
    /// directory.
    pub fn new(config: Config) -> Result<Self> {
        let aof = AofWriter::open(&config.dir)?;
        Ok(Self {
            dict: Mutex::new(Dict::with_base_exp(config.table_base_exp())),
            backlog: Mutex::new(ReplBacklog::new(config.backlog_capacity)),
            aof: Mutex::new(aof),
            push_link: Mutex::new(None),
            stop: AtomicBool::new(false),
            sync_requested: AtomicBool::new(false),
            slave_offset: AtomicU64::new(0),
            bgsave: Mutex::new(None),
            config,
        })
    }

    /// True once a shutdown was requested.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Ask every loop and thread to wind down.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Latch a request for an immediate replication tick.
    pub fn request_sync(&self) {
        self.sync_requested.store(true, Ordering::Relaxed);
    }

    /// Consume a latched sync request.
    pub fn take_sync_request(&self) -> bool {
        self.sync_requested.swap(false, Ordering::Relaxed)
    }

    /// The master's replication offset: the logical end of the backlog.
    pub fn master_offset(&self) -> u64 {
        self.backlog.lock().end_offset()
    }

    /// This server's offset in its current role.
    pub fn repl_offset(&self) -> u64 {
        match self.config.role {
            Role::Master => self.master_offset(),
            Role::Slave => self.slave_offset.load(Ordering::Acquire),
        }
    }

    /// Reset the slave's applied offset (after a full resync).
    pub fn set_repl_offset(&self, offset: u64) {
        self.slave_offset.store(offset, Ordering::Release);
    }

    /// Advance the slave's applied offset by one command's wire length.
    pub fn advance_repl_offset(&self, delta: u64) {
        self.slave_offset.fetch_add(delta, Ordering::AcqRel);
    }

    /// Dump a snapshot of the key space on a background thread.
    ///
    /// The snapshot entries are taken here, at spawn time; later writes
    /// are not reflected. A dump already in flight makes this a no-op.
    pub fn spawn_bgsave(&self) {
        let mut guard = self.bgsave.lock();
        if let Some(handle) = guard.take() {
            if !handle.is_finished() {
                warn!("snapshot dump already in progress, skipping");
                *guard = Some(handle);
                return;
            }
            let _ = handle.join();
        }
        let entries = self.dict.lock().snapshot_entries();
        let path = self.config.dir.join(persistence::DUMP_FILE_NAME);
        let handle = thread::Builder::new()
            .name("bgsave".into())
            .spawn(move || {
                if let Err(e) = persistence::dump_to(&path, &entries) {
                    error!(error = %e, "snapshot dump failed");
                }
            })
            .expect("spawn bgsave thread");
        *guard = Some(handle);
    }

    /// Run the server to completion: replication thread per role, then the
    /// event loop on the calling thread, then an orderly teardown.
    pub fn run(self: Arc<Self>) -> Result<()> {
        info!(
            role = ?self.config.role,
            port = self.config.port,
            io_threads = self.config.io_threads,
            "server starting"
        );

        let repl_handle = match self.config.role {
            Role::Master => {
                let server = Arc::clone(&self);
                thread::Builder::new()
                    .name("repl-master".into())
                    .spawn(move || repl::run_master(server))
                    .expect("spawn replication thread")
            }
            Role::Slave => {
                let server = Arc::clone(&self);
                thread::Builder::new()
                    .name("repl-replica".into())
                    .spawn(move || repl::run_replica(server))
                    .expect("spawn replication thread")
            }
        };

        let result = reactor::run_event_loop(&self);
        // The loop exited (shutdown or fatal poll error); wind everything
        // down either way.
        self.request_stop();
        let _ = repl_handle.join();
        self.finalize();
        info!("server stopped");
        result
    }

    /// Join retained background work and flush durability buffers.
    fn finalize(&self) {
        if let Some(handle) = self.bgsave.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.aof.lock().shutdown() {
            warn!(error = %e, "AOF shutdown flush failed");
        }
    }
}
