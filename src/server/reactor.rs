//! The event loop.
//!
//! One thread multiplexes every client socket through `mio::Poll`,
//! runs the periodic background work (bounded rehash, AOF flush), and is
//! the only thread allowed to execute commands. With I/O workers
//! configured, socket reads and writes move off this thread but execution
//! stays here, fed by the execution queue.

use super::conn::{ClientConn, ReadOutcome};
use super::executor;
use super::io_threads::{ExecEvent, IoThreadPool};
use super::Server;
use crate::error::{Error, Result};
use dashmap::DashMap;
use mio::event::Source;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Token of the listening socket.
const LISTENER: Token = Token(0);

/// First token handed to a client connection.
const FIRST_CLIENT_TOKEN: usize = 1;

/// Event capacity per poll call.
const EVENT_CAPACITY: usize = 1024;

/// Period of the bounded rehash tick, in milliseconds.
const REHASH_TICK_MS: u64 = 100;

/// Budget of one rehash tick.
const REHASH_TICK_BUDGET: Duration = Duration::from_millis(1);

/// Period of the AOF flush tick, in milliseconds.
const AOF_FLUSH_TICK_MS: u64 = 1000;

/// Readiness of one descriptor, with error and hangup conditions already
/// folded in: a broken descriptor reads as both ready so the caller
/// uniformly reacts by using (and then closing) it.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    /// Read (or error/hangup) readiness
    pub readable: bool,
    /// Write (or error/hangup) readiness
    pub writable: bool,
}

/// Interest registry over `mio::Poll`.
///
/// Masks merge on registration and unwind per-direction on
/// deregistration, so independent read and write interest holders never
/// clobber each other.
pub struct Reactor {
    poll: Poll,
    events: Events,
    interests: HashMap<usize, Interest>,
}

impl Reactor {
    /// Create the poller.
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            interests: HashMap::new(),
        })
    }

    /// Add interest for a source, merging with whatever is already
    /// registered for this token.
    pub fn register(
        &mut self,
        source: &mut impl Source,
        token: usize,
        interest: Interest,
    ) -> Result<()> {
        match self.interests.get(&token) {
            Some(&existing) => {
                let merged = existing | interest;
                if merged != existing {
                    self.poll
                        .registry()
                        .reregister(source, Token(token), merged)?;
                    self.interests.insert(token, merged);
                }
            }
            None => {
                self.poll.registry().register(source, Token(token), interest)?;
                self.interests.insert(token, interest);
            }
        }
        Ok(())
    }

    /// Remove one direction of interest; the source is fully deregistered
    /// once no direction remains.
    pub fn deregister(
        &mut self,
        source: &mut impl Source,
        token: usize,
        remove: Interest,
    ) -> Result<()> {
        let Some(&existing) = self.interests.get(&token) else {
            return Ok(());
        };
        match existing.remove(remove) {
            Some(rest) => {
                self.poll.registry().reregister(source, Token(token), rest)?;
                self.interests.insert(token, rest);
            }
            None => {
                self.poll.registry().deregister(source)?;
                self.interests.remove(&token);
            }
        }
        Ok(())
    }

    /// Fully remove a source, ignoring errors: teardown must not fail.
    pub fn remove(&mut self, source: &mut impl Source, token: usize) {
        if self.interests.remove(&token).is_some() {
            let _ = self.poll.registry().deregister(source);
        }
    }

    /// Wait up to `timeout` for readiness.
    ///
    /// A signal interrupt is benign and yields zero events; any other
    /// poll failure is returned and the caller must treat it as fatal.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(usize, Ready)>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e.into());
        }
        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let broken =
                event.is_error() || (event.is_read_closed() && event.is_write_closed());
            ready.push((
                event.token().0,
                Ready {
                    readable: event.is_readable() || event.is_read_closed() || broken,
                    writable: event.is_writable() || broken,
                },
            ));
        }
        Ok(ready)
    }
}

/// Background-task cadence derived from measured loop time.
///
/// The loop has no timer thread; instead each iteration's wall-clock cost
/// feeds an estimate of iterations per second, and a task configured for
/// "every P ms" runs once every `P / iteration_ms` iterations.
pub struct Cron {
    cronloops: u64,
    iter_ms: f64,
}

impl Cron {
    /// Seed the estimate from the configured frequency (the poll timeout
    /// dominates an idle loop).
    pub fn new(hz: u32) -> Self {
        Self {
            cronloops: 0,
            iter_ms: 1000.0 / f64::from(hz.max(1)),
        }
    }

    /// Fold one measured iteration into the estimate.
    pub fn observe(&mut self, elapsed: Duration) {
        let sample = (elapsed.as_secs_f64() * 1000.0).max(0.01);
        self.iter_ms = self.iter_ms * 0.8 + sample * 0.2;
        self.cronloops += 1;
    }

    /// Whether a task with the given period is due this iteration.
    pub fn due(&self, period_ms: u64) -> bool {
        let every = (period_ms as f64 / self.iter_ms).round().max(1.0) as u64;
        self.cronloops % every == 0
    }
}

/// Run the event loop until the stop flag is set.
pub fn run_event_loop(server: &Arc<Server>) -> Result<()> {
    let addr = format!("{}:{}", server.config.bind, server.config.port)
        .parse()
        .map_err(|e| Error::Config(format!("bad bind address: {e}")))?;
    let mut listener = TcpListener::bind(addr)?;
    let mut reactor = Reactor::new()?;
    reactor.register(&mut listener, LISTENER.0, Interest::READABLE)?;
    info!(%addr, "listening for clients");

    let conns: Arc<DashMap<usize, ClientConn>> = Arc::new(DashMap::new());
    let pool = (server.config.io_threads > 0)
        .then(|| IoThreadPool::spawn(server.config.io_threads, conns.clone()));

    let mut next_token = FIRST_CLIENT_TOKEN;
    let mut cron = Cron::new(server.config.hz);
    let poll_timeout = Duration::from_millis(1000 / u64::from(server.config.hz.max(1)));

    let result = loop {
        if server.should_stop() {
            break Ok(());
        }
        let iter_start = Instant::now();

        if cron.due(REHASH_TICK_MS) {
            server.dict.lock().rehash_for_duration(REHASH_TICK_BUDGET);
        }
        if cron.due(AOF_FLUSH_TICK_MS) {
            if let Err(e) = server.aof.lock().flush() {
                warn!(error = %e, "AOF flush tick failed");
            }
        }

        let events = match reactor.poll(Some(poll_timeout)) {
            Ok(events) => events,
            Err(e) => {
                // A broken multiplexing primitive has no recovery path.
                error!(error = %e, "reactor poll failed");
                break Err(e);
            }
        };

        for (token, ready) in events {
            if token == LISTENER.0 {
                accept_clients(server, &mut listener, &mut reactor, &conns, &mut next_token);
            } else {
                match &pool {
                    Some(pool) => {
                        if ready.readable {
                            pool.on_readable(token);
                        }
                    }
                    None => {
                        dispatch_inline(server, &mut reactor, &conns, token, ready);
                    }
                }
            }
        }

        if let Some(pool) = &pool {
            drain_exec_queue(server, pool, &conns, &mut reactor);
        }

        cron.observe(iter_start.elapsed());
    };

    if let Some(pool) = pool {
        pool.shutdown();
    }
    result
}

/// Accept every pending connection on the listener.
fn accept_clients(
    server: &Arc<Server>,
    listener: &mut TcpListener,
    reactor: &mut Reactor,
    conns: &DashMap<usize, ClientConn>,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let token = *next_token;
                *next_token += 1;
                if let Err(e) = reactor.register(&mut stream, token, Interest::READABLE) {
                    warn!(error = %e, %peer, "failed to register client");
                    continue;
                }
                conns.insert(token, ClientConn::new(stream));
                debug!(token, %peer, "client connected");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
        if server.should_stop() {
            break;
        }
    }
}

/// Single-threaded path: read, decode, execute, and reply inline.
fn dispatch_inline(
    server: &Arc<Server>,
    reactor: &mut Reactor,
    conns: &DashMap<usize, ClientConn>,
    token: usize,
    ready: Ready,
) {
    let Some(mut conn) = conns.get_mut(&token) else {
        return;
    };

    let mut close = false;
    if ready.readable {
        match conn.drain_socket() {
            Ok(ReadOutcome::Open) => {}
            Ok(ReadOutcome::Closed) => close = true,
            Err(e) => {
                debug!(token, error = %e, "read failed");
                close = true;
            }
        }
        loop {
            match conn.next_frame() {
                Ok(Some(cmd)) => {
                    let reply = executor::execute(server, cmd);
                    conn.queue_reply(&reply);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(token, error = %e, "protocol error, closing connection");
                    close = true;
                    break;
                }
            }
        }
    }

    if conn.has_pending_output() || ready.writable {
        match conn.flush_out() {
            Ok(true) => {
                if ready.writable {
                    let _ = reactor.deregister(&mut conn.stream, token, Interest::WRITABLE);
                }
            }
            Ok(false) => {
                // Socket full: wait for writability instead of spinning.
                if let Err(e) = reactor.register(&mut conn.stream, token, Interest::WRITABLE) {
                    warn!(token, error = %e, "cannot watch for writability");
                    close = true;
                }
            }
            Err(e) => {
                debug!(token, error = %e, "write failed");
                close = true;
            }
        }
    }

    drop(conn);
    if close {
        teardown(reactor, conns, None, token);
    }
}

/// Execute commands handed back by the workers; replies go out through
/// the worker that owns the connection's shard.
fn drain_exec_queue(
    server: &Arc<Server>,
    pool: &IoThreadPool,
    conns: &DashMap<usize, ClientConn>,
    reactor: &mut Reactor,
) {
    while let Some(item) = pool.try_pop_exec() {
        match item.event {
            ExecEvent::Cmd(cmd) => {
                trace!(token = item.token, "command from worker");
                let reply = executor::execute(server, cmd);
                pool.dispatch_write(item.token, reply);
            }
            ExecEvent::Closed => {
                teardown(reactor, conns, Some(pool), item.token);
            }
        }
    }
}

/// Remove a connection from the poller, the table, and the claim sets.
fn teardown(
    reactor: &mut Reactor,
    conns: &DashMap<usize, ClientConn>,
    pool: Option<&IoThreadPool>,
    token: usize,
) {
    if let Some((_, mut conn)) = conns.remove(&token) {
        reactor.remove(&mut conn.stream, token);
        debug!(token, "client disconnected");
    }
    if let Some(pool) = pool {
        pool.forget(token);
    }
}
