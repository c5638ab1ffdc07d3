//! AOF (append-only file) persistence.
//!
//! Mutating commands accumulate in a bounded in-memory buffer and reach
//! the incr file when the buffer fills or on the periodic flush tick. The
//! base file is produced by [`AofWriter::rewrite`], which walks a table
//! snapshot on its own thread; the incremental file keeps growing in
//! parallel, so a rewrite in flight never stalls the executor.

use crate::error::Result;
use crate::protocol::Command;
use crate::AOF_BUFFER_COMMANDS;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Base AOF file name inside the data directory.
pub const BASE_AOF_FILE_NAME: &str = "base_aof.txt";
/// Incremental AOF file name inside the data directory.
pub const INCR_AOF_FILE_NAME: &str = "incr_aof.txt";
/// Scratch name the rewrite thread produces before the atomic rename.
const TEMP_BASE_AOF_FILE_NAME: &str = "temp_base_aof.txt";

/// Bounded ring of commands awaiting a flush.
pub struct AofBuffer {
    queue: VecDeque<Command>,
    capacity: usize,
}

impl AofBuffer {
    /// Create a buffer holding up to `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True once the buffer must be flushed before the next push.
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Buffer one command.
    pub fn push(&mut self, cmd: Command) {
        self.queue.push_back(cmd);
    }

    /// Take every buffered command, oldest first.
    pub fn drain(&mut self) -> Vec<Command> {
        self.queue.drain(..).collect()
    }
}

/// The AOF collaborator: buffered append, flush, and detached rewrite.
pub struct AofWriter {
    dir: PathBuf,
    incr: BufWriter<File>,
    buffer: AofBuffer,
    /// Rewrite thread in flight, retained so shutdown can join it instead
    /// of abandoning the work.
    rewrite_handle: Option<JoinHandle<()>>,
}

impl AofWriter {
    /// Open the AOF in `dir`, creating the directory and a fresh incr
    /// file.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let incr = Self::fresh_incr_file(&dir)?;
        Ok(Self {
            dir,
            incr,
            buffer: AofBuffer::new(AOF_BUFFER_COMMANDS),
            rewrite_handle: None,
        })
    }

    fn fresh_incr_file(dir: &Path) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(INCR_AOF_FILE_NAME))?;
        Ok(BufWriter::new(file))
    }

    /// Buffer a command for durability, flushing first when the buffer is
    /// full.
    pub fn append(&mut self, cmd: &Command) -> Result<()> {
        if self.buffer.is_full() {
            self.flush()?;
        }
        self.buffer.push(cmd.clone());
        Ok(())
    }

    /// Drain the buffer into the incr file and push it to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        for cmd in self.buffer.drain() {
            write_record(&mut self.incr, &cmd)?;
        }
        self.incr.flush()?;
        self.incr.get_ref().sync_data()?;
        Ok(())
    }

    /// Number of commands waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Rewrite the base file from a table snapshot on a detached thread.
    ///
    /// The snapshot is taken by the caller at spawn time; commands executed
    /// afterwards land in the fresh incr file and are not reflected in the
    /// base being written. A rewrite already in flight makes this a no-op.
    pub fn rewrite(&mut self, entries: Vec<(Bytes, Bytes)>) -> Result<()> {
        if let Some(handle) = self.rewrite_handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("AOF rewrite already in progress, skipping");
                self.rewrite_handle = Some(handle);
                return Ok(());
            }
        }

        // The snapshot covers everything flushed so far; start the incr
        // file over so it only carries commands newer than the snapshot.
        self.flush()?;
        self.incr = Self::fresh_incr_file(&self.dir)?;

        let base = self.dir.join(BASE_AOF_FILE_NAME);
        let temp = self.dir.join(TEMP_BASE_AOF_FILE_NAME);
        let handle = thread::Builder::new()
            .name("aof-rewrite".into())
            .spawn(move || {
                if let Err(e) = write_base_file(&temp, &base, &entries) {
                    error!(error = %e, "AOF rewrite failed");
                }
            })
            .map_err(crate::error::Error::Io)?;
        self.rewrite_handle = Some(handle);
        Ok(())
    }

    /// Flush outstanding commands and wait for any rewrite to finish.
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush()?;
        if let Some(handle) = self.rewrite_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// Write every snapshot entry as a SET record into `temp`, then rename it
/// over `base` so a crash mid-rewrite leaves the previous base intact.
fn write_base_file(temp: &Path, base: &Path, entries: &[(Bytes, Bytes)]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(temp)?);
    for (key, value) in entries {
        write_record(
            &mut writer,
            &Command::set(key.clone(), value.clone()),
        )?;
    }
    writer.flush()?;
    writer.get_ref().sync_data()?;
    fs::rename(temp, base)?;
    info!(path = %base.display(), entries = entries.len(), "AOF base rewritten");
    Ok(())
}

/// One AOF record: `kind<TAB>key<TAB>value<NL>`.
fn write_record(writer: &mut impl Write, cmd: &Command) -> Result<()> {
    let mut line = Vec::with_capacity(cmd.key.len() + cmd.value.len() + 16);
    line.extend_from_slice(cmd.kind.to_wire().to_string().as_bytes());
    line.push(b'\t');
    line.extend_from_slice(&cmd.key);
    line.push(b'\t');
    line.extend_from_slice(&cmd.value);
    line.push(b'\n');
    writer.write_all(&line)?;
    Ok(())
}
