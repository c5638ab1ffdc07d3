//! # Arca
//!
//! An in-memory key-value server built around three pieces:
//!
//! - a reactor-style event loop multiplexing every client socket, with an
//!   optional fixed-size I/O worker pool
//! - an incrementally-rehashing hash table (two tables, bounded per-tick
//!   migration work)
//! - master/slave replication with full-resync and incremental-resync
//!   modes fed from a bounded command ring, backed by append-only-file
//!   durability
//!
//! ## Example
//!
//! ```no_run
//! use arca::{Config, Result, Server};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let config = Config::default();
//!     let server = Arc::new(Server::new(config)?);
//!     server.run()
//! }
//! ```

#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::len_without_is_empty,
    clippy::new_without_default
)]

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Error types and result aliases.
pub mod error;
/// AOF and snapshot persistence.
pub mod persistence;
/// The length-prefixed binary command protocol.
pub mod protocol;
/// Master/slave replication.
pub mod repl;
/// Reactor, I/O workers, and command execution.
pub mod server;
/// The incrementally-rehashing storage engine.
pub mod storage;

// ─────────────────────────────────────────────────────────────────────────────
// Common Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use error::{Error, Result};
pub use protocol::{Command, CommandKind};
pub use repl::ReplBacklog;
pub use server::{Config, Role, Server};
pub use storage::Dict;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default client port.
pub const DEFAULT_PORT: u16 = 9000;

/// Upper bound on any single frame or field length (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Commands held in the AOF buffer before a forced flush.
pub const AOF_BUFFER_COMMANDS: usize = 128;

/// Default replication backlog capacity (1 MiB).
pub const DEFAULT_BACKLOG_CAPACITY: usize = 1024 * 1024;

/// Default background-task frequency.
pub const DEFAULT_HZ: u32 = 10;

/// Default initial hash table bucket count.
pub const DEFAULT_TABLE_BASE_SIZE: usize = 128;
