//! TCP transport: one persistent outbound socket per peer, kept alive with
//! `SO_KEEPALIVE`/`TCP_NODELAY`, reconnected lazily on send failure. Inbound
//! connections are handled independently — one thread per accepted socket,
//! pushing decoded messages onto a shared queue the consensus thread drains
//! with `receive(timeout)`. No background send thread: `send` either
//! writes synchronously on the caller's thread or drops the message.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{ClusterConfig, Config};
use crate::error::{RaftError, Result};
use crate::message::Message;
use crate::types::NodeId;

use super::{Transport, TransportStats};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_POLL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Counters {
    send_count: AtomicU64,
    recv_count: AtomicU64,
    send_errors: AtomicU64,
    connect_errors: AtomicU64,
    reconnects: AtomicU64,
}

struct OutboundState {
    connections: HashMap<NodeId, TcpStream>,
    last_attempt: HashMap<NodeId, Instant>,
}

pub struct TcpTransport {
    self_id: NodeId,
    addrs: HashMap<NodeId, String>,
    peer_count: usize,
    retry_interval: Duration,
    startup_grace: Duration,
    outbound: Mutex<OutboundState>,
    recv_tx: Sender<Message>,
    recv_rx: Mutex<Receiver<Message>>,
    running: AtomicBool,
    counters: Counters,
}

impl TcpTransport {
    /// Binds the listener and spawns the accept loop. Does not attempt
    /// outbound connections yet — call `connect_all` once peers are
    /// expected to be listening.
    pub fn start(self_id: NodeId, cluster: &ClusterConfig, config: &Config) -> Result<Arc<Self>> {
        let self_addr = cluster
            .node_address(self_id)
            .ok_or_else(|| RaftError::InvalidClusterConfig(format!("unknown node id {self_id}")))?;
        let port: u16 = self_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .ok_or_else(|| RaftError::InvalidClusterConfig(format!("bad address {self_addr}")))?;

        let bind_addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&bind_addr)
            .map_err(|source| RaftError::BindFailed { addr: bind_addr.clone(), source })?;
        listener.set_nonblocking(false)?;

        let (recv_tx, recv_rx) = mpsc::channel();
        let addrs: HashMap<NodeId, String> =
            cluster.nodes.iter().map(|n| (n.id, n.address())).collect();

        let transport = Arc::new(TcpTransport {
            self_id,
            peer_count: cluster.len().saturating_sub(1),
            addrs,
            retry_interval: Duration::from_secs_f64(config.connection_retry_time.min(1.0)),
            startup_grace: Duration::from_secs_f64(config.connection_timeout),
            outbound: Mutex::new(OutboundState {
                connections: HashMap::new(),
                last_attempt: HashMap::new(),
            }),
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let accept_handle = Arc::clone(&transport);
        listener.set_read_timeout(Some(ACCEPT_POLL)).ok();

        log::info!("node {self_id} listening on {bind_addr}");
        std::thread::Builder::new()
            .name(format!("raft-accept-{self_id}"))
            .spawn(move || accept_handle.accept_loop(listener))
            .map_err(RaftError::Io)?;

        Ok(transport)
    }

    /// Establish outbound connections to every peer, retrying up to five
    /// rounds a second apart. Waits out `startup_grace` first so peers that
    /// haven't bound their listener yet get a chance to. Safe to call
    /// again later; existing live sockets are left untouched.
    pub fn connect_all(&self) {
        log::info!(
            "node {} waiting {:.1}s startup grace before connecting to peers",
            self.self_id,
            self.startup_grace.as_secs_f64()
        );
        std::thread::sleep(self.startup_grace);
        for attempt in 0..5 {
            for &peer_id in self.addrs.keys() {
                if peer_id != self.self_id {
                    self.ensure_connection(peer_id);
                }
            }
            let connected = self.outbound.lock().unwrap().connections.len();
            if connected >= self.peer_count {
                break;
            }
            if attempt < 4 {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        let connected = self.outbound.lock().unwrap().connections.len();
        log::info!("node {} initial connections: {}/{}", self.self_id, connected, self.peer_count);
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true).ok();
                    let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));
                    let handler = Arc::clone(&self);
                    std::thread::Builder::new()
                        .name(format!("raft-conn-{}-{}", self.self_id, addr))
                        .spawn(move || handler.handle_client(stream))
                        .ok();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        log::warn!("node {} accept error: {e}", self.self_id);
                    }
                }
            }
        }
    }

    fn handle_client(&self, mut stream: TcpStream) {
        while self.running.load(Ordering::Relaxed) {
            match Message::read_from(&mut stream) {
                Ok(msg) => {
                    self.counters.recv_count.fetch_add(1, Ordering::Relaxed);
                    if self.recv_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(RaftError::Io(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::UnexpectedEof
                    ) =>
                {
                    break;
                }
                Err(e) => {
                    log::debug!("node {} connection closed: {e}", self.self_id);
                    break;
                }
            }
        }
    }

    /// Returns a live outbound socket to `target_id`, reconnecting if the
    /// cached one looks dead and the retry interval has elapsed.
    fn ensure_connection(&self, target_id: NodeId) -> Option<()> {
        let mut state = self.outbound.lock().unwrap();

        if let Some(sock) = state.connections.get(&target_id) {
            if socket_is_alive(sock) {
                return Some(());
            }
            state.connections.remove(&target_id);
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        if let Some(last) = state.last_attempt.get(&target_id) {
            if now.duration_since(*last) < self.retry_interval {
                return None;
            }
        }
        state.last_attempt.insert(target_id, now);

        let addr = self.addrs.get(&target_id)?.clone();
        match TcpStream::connect_timeout(&addr.parse().ok()?, CONNECT_TIMEOUT) {
            Ok(sock) => {
                sock.set_nodelay(true).ok();
                sock.set_write_timeout(Some(SEND_TIMEOUT)).ok();
                log::info!("node {} connected to node {target_id} ({addr})", self.self_id);
                state.connections.insert(target_id, sock);
                Some(())
            }
            Err(e) => {
                self.counters.connect_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("node {} connect to {target_id} failed: {e}", self.self_id);
                None
            }
        }
    }
}

fn socket_is_alive(sock: &TcpStream) -> bool {
    sock.set_nonblocking(true).ok();
    let mut buf = [0u8; 1];
    let alive = match sock.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == ErrorKind::WouldBlock,
    };
    sock.set_nonblocking(false).ok();
    alive
}

impl Transport for TcpTransport {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn send(&self, target_id: NodeId, message: Message) {
        if target_id == self.self_id {
            let _ = self.recv_tx.send(message);
            return;
        }
        if !self.addrs.contains_key(&target_id) {
            log::warn!("node {} send to unknown target {target_id}", self.self_id);
            return;
        }

        for _ in 0..2 {
            if self.ensure_connection(target_id).is_none() {
                continue;
            }
            let encoded = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("node {} failed to encode message: {e}", self.self_id);
                    return;
                }
            };
            let write_result = {
                let mut state = self.outbound.lock().unwrap();
                state
                    .connections
                    .get_mut(&target_id)
                    .map(|sock| std::io::Write::write_all(sock, &encoded))
            };
            match write_result {
                Some(Ok(())) => {
                    self.counters.send_count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Some(Err(_)) | None => {
                    self.outbound.lock().unwrap().connections.remove(&target_id);
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn receive(&self, timeout: Duration) -> Option<Message> {
        self.recv_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    fn connected_count(&self) -> usize {
        self.outbound.lock().unwrap().connections.len() + 1
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            send_count: self.counters.send_count.load(Ordering::Relaxed),
            recv_count: self.counters.recv_count.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            connect_errors: self.counters.connect_errors.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    fn stop(&self) {
        log::info!("node {} stopping transport", self.self_id);
        self.running.store(false, Ordering::Relaxed);
        self.outbound.lock().unwrap().connections.clear();
    }
}
