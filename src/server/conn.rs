//! Per-client connection state.
//!
//! A connection owns its nonblocking socket, an inbound accumulation
//! buffer, and an outbound buffer of framed replies. The same type backs
//! both the inline reactor path and the worker-pool path; only who calls
//! into it differs.

use crate::error::Result;
use crate::protocol::{decode_frame, Command, LEN_PREFIX};
use bytes::{Buf, BufMut, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Chunk size for socket reads.
const READ_CHUNK: usize = 4096;

/// Bounded retries for a blocking-style write on a nonblocking socket.
const WRITE_RETRIES: usize = 200;

/// What draining the socket produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket still open; frames may or may not be buffered
    Open,
    /// Peer sent end-of-stream
    Closed,
}

/// One client connection.
pub struct ClientConn {
    /// The nonblocking socket, registered with the reactor
    pub stream: TcpStream,
    /// Inbound bytes not yet decoded
    buf: BytesMut,
    /// Outbound bytes not yet written
    out: BytesMut,
}

impl ClientConn {
    /// Wrap an accepted socket.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            out: BytesMut::new(),
        }
    }

    /// Read from the socket until it would block.
    pub fn drain_socket(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.buf.put_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Decode the next complete frame out of the inbound buffer.
    pub fn next_frame(&mut self) -> Result<Option<Command>> {
        decode_frame(&mut self.buf)
    }

    /// True when the inbound buffer already holds a complete frame.
    pub fn has_complete_frame(&self) -> bool {
        if self.buf.len() < LEN_PREFIX {
            return false;
        }
        let body_len =
            u64::from_le_bytes(self.buf[..LEN_PREFIX].try_into().expect("8-byte slice"));
        (self.buf.len() - LEN_PREFIX) as u64 >= body_len
    }

    /// Queue one framed reply for writing.
    pub fn queue_reply(&mut self, payload: &[u8]) {
        self.out.put_u64_le(payload.len() as u64);
        self.out.put_slice(payload);
    }

    /// Write queued output until done or the socket would block.
    ///
    /// Returns true once the outbound buffer is empty.
    pub fn flush_out(&mut self) -> io::Result<bool> {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Write queued output to completion, retrying a bounded number of
    /// times when the socket is not ready. Worker-thread path only; the
    /// reactor uses [`ClientConn::flush_out`] plus writable interest.
    pub fn flush_blocking(&mut self) -> io::Result<()> {
        for _ in 0..WRITE_RETRIES {
            if self.flush_out()? {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "reply write stalled",
        ))
    }

    /// True while replies wait in the outbound buffer.
    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use mio::net::TcpListener;
    use std::net::TcpStream as StdTcpStream;

    fn pair() -> (ClientConn, StdTcpStream) {
        let mut listener =
            TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind ephemeral");
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        // The accepted side may lag the connect by a beat.
        let accepted = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept: {e}"),
            }
        };
        (ClientConn::new(accepted), client)
    }

    #[test]
    fn test_drain_and_decode() {
        let (mut conn, mut client) = pair();
        let cmd = Command::set(&b"k"[..], &b"v"[..]);
        client.write_all(&encode_frame(&cmd)).unwrap();

        // Wait for the bytes to arrive at the accepted socket.
        let mut tries = 0;
        loop {
            conn.drain_socket().unwrap();
            if conn.has_complete_frame() {
                break;
            }
            tries += 1;
            assert!(tries < 500, "frame never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(conn.next_frame().unwrap().unwrap(), cmd);
        assert!(conn.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_drain_detects_close() {
        let (mut conn, client) = pair();
        drop(client);
        let mut tries = 0;
        loop {
            match conn.drain_socket().unwrap() {
                ReadOutcome::Closed => break,
                ReadOutcome::Open => {
                    tries += 1;
                    assert!(tries < 500, "close never observed");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    #[test]
    fn test_reply_reaches_peer() {
        let (mut conn, mut client) = pair();
        conn.queue_reply(b"ok");
        conn.flush_blocking().unwrap();

        let mut prefix = [0u8; LEN_PREFIX];
        client.read_exact(&mut prefix).unwrap();
        assert_eq!(u64::from_le_bytes(prefix), 2);
        let mut payload = [0u8; 2];
        client.read_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"ok");
    }
}
