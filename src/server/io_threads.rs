//! The I/O worker pool.
//!
//! Workers take over socket reads and writes so the reactor thread only
//! polls, accepts, and executes. Two queue kinds connect them: one inbound
//! "news" queue per worker (sharded by token) carrying read/write jobs,
//! and a single shared execution queue carrying decoded commands back to
//! the reactor, which alone may touch the dict.
//!
//! A token in the claimed set has exactly one job in flight, so commands
//! on one connection always execute in arrival order even though different
//! connections run on different workers. Readiness that fires while a
//! token is claimed is parked in the missed set and replayed on release.

use super::conn::{ClientConn, ReadOutcome};
use crate::protocol::Command;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How long a worker blocks on an empty queue before rechecking the stop
/// flag.
const POP_WAIT: Duration = Duration::from_millis(50);

/// A multi-producer/multi-consumer queue with blocking and non-blocking
/// pops.
pub struct Queue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Push an item and wake one waiter.
    pub fn push(&self, item: T) {
        self.inner.lock().push_back(item);
        self.cond.notify_one();
    }

    /// Pop without blocking. Safe to call from the reactor thread.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Pop, waiting up to `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.lock();
        if let Some(item) = guard.pop_front() {
            return Some(item);
        }
        let _ = self.cond.wait_for(&mut guard, timeout);
        guard.pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A job for an I/O worker.
pub enum IoJob {
    /// Drain the socket and decode one frame
    Read {
        /// Connection token
        token: usize,
    },
    /// Serialize and write one reply, then release the token
    Write {
        /// Connection token
        token: usize,
        /// Reply payload (framed by the worker)
        payload: Bytes,
    },
    /// Worker shutdown marker
    Stop,
}

/// What a worker hands back to the reactor.
pub enum ExecEvent {
    /// A decoded command ready for execution
    Cmd(Command),
    /// The connection ended and must be torn down
    Closed,
}

/// One entry on the execution queue.
pub struct ExecItem {
    /// Connection token the event belongs to
    pub token: usize,
    /// The event
    pub event: ExecEvent,
}

struct IoShared {
    news: Vec<Queue<IoJob>>,
    exec: Queue<ExecItem>,
    claimed: DashSet<usize>,
    missed: DashSet<usize>,
    conns: Arc<DashMap<usize, ClientConn>>,
    stop: AtomicBool,
}

/// Fixed-size pool of I/O workers.
pub struct IoThreadPool {
    shared: Arc<IoShared>,
    workers: Vec<JoinHandle<()>>,
}

impl IoThreadPool {
    /// Spawn `worker_count` workers over the shared connection table.
    pub fn spawn(worker_count: usize, conns: Arc<DashMap<usize, ClientConn>>) -> Self {
        assert!(worker_count > 0, "worker pool needs at least one worker");
        let shared = Arc::new(IoShared {
            news: (0..worker_count).map(|_| Queue::new()).collect(),
            exec: Queue::new(),
            claimed: DashSet::new(),
            missed: DashSet::new(),
            conns,
            stop: AtomicBool::new(false),
        });
        let workers = (0..worker_count)
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("io-worker-{i}"))
                    .spawn(move || worker_loop(shared, i))
                    .expect("spawn io worker")
            })
            .collect();
        Self { shared, workers }
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.shared.news.len()
    }

    /// React to read-readiness on a token.
    ///
    /// Claims the token and dispatches a read job, or parks the readiness
    /// when a job for this token is already in flight.
    pub fn on_readable(&self, token: usize) {
        if self.shared.claimed.insert(token) {
            self.shared.news[token % self.worker_count()].push(IoJob::Read { token });
        } else {
            self.shared.missed.insert(token);
        }
    }

    /// Hand a reply to the worker owning this token. The token must be
    /// claimed (it is: replies only follow dispatched reads).
    pub fn dispatch_write(&self, token: usize, payload: Bytes) {
        self.shared.news[token % self.worker_count()].push(IoJob::Write { token, payload });
    }

    /// Non-blocking pop from the execution queue.
    pub fn try_pop_exec(&self) -> Option<ExecItem> {
        self.shared.exec.try_pop()
    }

    /// Drop all claim state for a token being torn down.
    pub fn forget(&self, token: usize) {
        self.shared.claimed.remove(&token);
        self.shared.missed.remove(&token);
    }

    /// Stop the workers and wait for them to exit.
    pub fn shutdown(self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for queue in &self.shared.news {
            queue.push(IoJob::Stop);
        }
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<IoShared>, index: usize) {
    debug!(worker = index, "io worker started");
    loop {
        let job = match shared.news[index].pop_timeout(POP_WAIT) {
            Some(job) => job,
            None => {
                if shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
        };
        match job {
            IoJob::Stop => break,
            IoJob::Read { token } => handle_read(&shared, index, token),
            IoJob::Write { token, payload } => handle_write(&shared, index, token, &payload),
        }
    }
    debug!(worker = index, "io worker stopped");
}

/// Drain the socket, decode at most one frame, and hand it to the
/// executor. The claim stays held while a command is in flight and is
/// released by the write that answers it.
fn handle_read(shared: &Arc<IoShared>, index: usize, token: usize) {
    let Some(mut conn) = shared.conns.get_mut(&token) else {
        release(shared, index, token);
        return;
    };
    let closed = match conn.drain_socket() {
        Ok(ReadOutcome::Open) => false,
        Ok(ReadOutcome::Closed) => true,
        Err(e) => {
            debug!(token, error = %e, "read failed");
            true
        }
    };
    match conn.next_frame() {
        Ok(Some(cmd)) => {
            drop(conn);
            shared.exec.push(ExecItem {
                token,
                event: ExecEvent::Cmd(cmd),
            });
            if closed {
                shared.exec.push(ExecItem {
                    token,
                    event: ExecEvent::Closed,
                });
            }
        }
        Ok(None) => {
            drop(conn);
            if closed {
                shared.exec.push(ExecItem {
                    token,
                    event: ExecEvent::Closed,
                });
            }
            release(shared, index, token);
        }
        Err(e) => {
            drop(conn);
            warn!(token, error = %e, "malformed frame, closing connection");
            shared.exec.push(ExecItem {
                token,
                event: ExecEvent::Closed,
            });
            release(shared, index, token);
        }
    }
}

/// Write one reply, then either continue the pipeline from buffered
/// frames or release the token.
fn handle_write(shared: &Arc<IoShared>, index: usize, token: usize, payload: &[u8]) {
    let Some(mut conn) = shared.conns.get_mut(&token) else {
        release(shared, index, token);
        return;
    };
    conn.queue_reply(payload);
    if let Err(e) = conn.flush_blocking() {
        drop(conn);
        debug!(token, error = %e, "reply write failed");
        shared.exec.push(ExecItem {
            token,
            event: ExecEvent::Closed,
        });
        release(shared, index, token);
        return;
    }
    let more = conn.has_complete_frame();
    drop(conn);
    if more {
        // Keep the claim and continue decoding from the buffer.
        shared.news[index].push(IoJob::Read { token });
    } else {
        release(shared, index, token);
    }
}

/// Release a token's claim, replaying any readiness that arrived while it
/// was held.
fn release(shared: &Arc<IoShared>, index: usize, token: usize) {
    shared.claimed.remove(&token);
    if shared.missed.remove(&token).is_some() && shared.claimed.insert(token) {
        shared.news[index].push(IoJob::Read { token });
    }
}
