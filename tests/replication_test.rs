//! Master/slave replication, end to end.
//!
//! Each test runs a real master and a real slave in-process and drives
//! them through the client protocol, then observes the slave's key space
//! through its own client port.

use arca::protocol::{encode_frame, Command, LEN_PREFIX};
use arca::server::executor::REPLY_OK;
use arca::{Config, Role, Server};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SYNC_DEADLINE: Duration = Duration::from_secs(20);

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Node {
    server: Arc<Server>,
    handle: Option<JoinHandle<arca::Result<()>>>,
    port: u16,
    _dir: tempfile::TempDir,
}

impl Node {
    fn start(config: Config, port: u16, dir: tempfile::TempDir) -> Self {
        let server = Arc::new(Server::new(config).unwrap());
        let runner = Arc::clone(&server);
        let handle = thread::spawn(move || runner.run());
        Self {
            server,
            handle: Some(handle),
            port,
            _dir: dir,
        }
    }

    fn start_master(backlog_capacity: usize) -> (Self, u16) {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let repl_port = free_port();
        let config = Config {
            role: Role::Master,
            port,
            repl_port,
            dir: dir.path().to_path_buf(),
            backlog_capacity,
            ..Config::default()
        };
        (Self::start(config, port, dir), repl_port)
    }

    fn start_slave(master_repl_port: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let config = Config {
            role: Role::Slave,
            port,
            repl_port: free_port(),
            peer_ip: "127.0.0.1".to_string(),
            peer_port: master_repl_port,
            dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        Self::start(config, port, dir)
    }

    fn connect(&self) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(("127.0.0.1", self.port)) {
                Ok(stream) => {
                    stream.set_nodelay(true).unwrap();
                    stream
                        .set_read_timeout(Some(Duration::from_secs(10)))
                        .unwrap();
                    return stream;
                }
                Err(e) => {
                    assert!(Instant::now() < deadline, "server never came up: {e}");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn stop(mut self) {
        self.server.request_stop();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; LEN_PREFIX];
    stream.read_exact(&mut prefix).unwrap();
    let mut payload = vec![0u8; u64::from_le_bytes(prefix) as usize];
    stream.read_exact(&mut payload).unwrap();
    payload
}

fn request(stream: &mut TcpStream, cmd: &Command) -> Vec<u8> {
    stream.write_all(&encode_frame(cmd)).unwrap();
    read_reply(stream)
}

/// Poll the node over its client port until the key holds the value.
fn wait_for_key(node: &Node, key: &str, value: &str) {
    let mut client = node.connect();
    let deadline = Instant::now() + SYNC_DEADLINE;
    loop {
        let reply = request(&mut client, &Command::get(key.as_bytes().to_vec()));
        if reply == value.as_bytes() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "key {key:?} never reached {value:?} (last reply: {:?})",
            String::from_utf8_lossy(&reply)
        );
        thread::sleep(Duration::from_millis(50));
    }
}

fn wait_for_offset_match(master: &Node, slave: &Node) {
    let deadline = Instant::now() + SYNC_DEADLINE;
    loop {
        let m = master.server.master_offset();
        let s = slave.server.repl_offset();
        if m == s && m > 0 {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "offsets never converged: master {m}, slave {s}"
        );
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_incremental_replication() {
    let (master, repl_port) = Node::start_master(1024 * 1024);
    let mut client = master.connect();

    // Writes land before the slave exists; the backlog still retains
    // offset 0, so the slave catches up incrementally.
    assert_eq!(
        request(&mut client, &Command::set(&b"k1"[..], &b"v1"[..])),
        REPLY_OK
    );
    assert_eq!(
        request(&mut client, &Command::set(&b"k2"[..], &b"v2"[..])),
        REPLY_OK
    );

    let slave = Node::start_slave(repl_port);
    wait_for_key(&slave, "k1", "v1");
    wait_for_key(&slave, "k2", "v2");
    wait_for_offset_match(&master, &slave);

    // Writes after the link is up flow through as well.
    assert_eq!(
        request(&mut client, &Command::set(&b"k3"[..], &b"v3"[..])),
        REPLY_OK
    );
    wait_for_key(&slave, "k3", "v3");
    wait_for_offset_match(&master, &slave);

    slave.stop();
    master.stop();
}

#[test]
fn test_full_resync_for_stale_slave() {
    // A 64-byte backlog cannot retain offset 0 after a burst of writes,
    // so a fresh slave must be served a full snapshot.
    let (master, repl_port) = Node::start_master(64);
    let mut client = master.connect();
    for i in 0..30 {
        let reply = request(
            &mut client,
            &Command::set(
                format!("key-{i}").into_bytes(),
                format!("val-{i}").into_bytes(),
            ),
        );
        assert_eq!(reply, REPLY_OK);
    }
    assert!(
        master.server.backlog.lock().start_offset() > 0,
        "backlog should have discarded its oldest bytes"
    );

    let slave = Node::start_slave(repl_port);
    for i in 0..30 {
        wait_for_key(&slave, &format!("key-{i}"), &format!("val-{i}"));
    }
    wait_for_offset_match(&master, &slave);
    assert_eq!(slave.server.dict.lock().len(), 30);

    slave.stop();
    master.stop();
}

#[test]
fn test_replication_survives_updates_of_same_key() {
    let (master, repl_port) = Node::start_master(1024 * 1024);
    let slave = Node::start_slave(repl_port);
    let mut client = master.connect();

    for round in 0..5 {
        let reply = request(
            &mut client,
            &Command::set(&b"counter"[..], round.to_string().into_bytes()),
        );
        assert_eq!(reply, REPLY_OK);
    }
    wait_for_key(&slave, "counter", "4");
    wait_for_offset_match(&master, &slave);
    // Update-in-place on both sides: one entry, not five.
    assert_eq!(slave.server.dict.lock().len(), 1);

    slave.stop();
    master.stop();
}
