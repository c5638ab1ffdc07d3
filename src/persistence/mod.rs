//! Durability collaborators.
//!
//! The executor only ever talks to the append buffer; everything touching
//! the filesystem lives here. The AOF follows a multi-part layout: a base
//! file rewritten from table snapshots plus an incr file receiving the
//! live command stream.

mod aof;
mod snapshot;

pub use aof::{AofBuffer, AofWriter, BASE_AOF_FILE_NAME, INCR_AOF_FILE_NAME};
pub use snapshot::{dump_to, encode_entries, load_from, DUMP_FILE_NAME};
