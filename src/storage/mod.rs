//! In-memory key-value storage engine.
//!
//! The engine is a dictionary over two internal hash tables with an
//! incremental rehash cursor, so a resize never requires a stop-the-world
//! pass. None of its operations can fail; the only signalled condition is
//! "rehash still in progress".

mod dict;
mod table;

pub use dict::{Dict, DictIter};
pub use table::{Entry, HashTable};
