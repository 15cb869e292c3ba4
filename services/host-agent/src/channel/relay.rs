//! Hypervisor-socket relays.
//!
//! A relayed forward is served by the agent itself. The host endpoint is
//! bound here, and every accepted connection (every peer, for udp) is bridged
//! to the guest over vsock at the forward's relay port. The guest agent is
//! asked to open its half before the host endpoint goes live:
//!
//! ```text
//! -> {"type":"open_relay","port":4113,"protocol":"tcp","connect":"127.0.0.1:8080"}
//! <- {"type":"ok"}
//! -> {"type":"close_relay","port":4113}
//! <- {"type":"error","detail":"no such relay"}
//! ```
//!
//! Datagrams cross the relay stream as a big-endian `u16` length followed by
//! the payload. Tuples without a relay port go to the wrapped channel.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use vmfwd_reconcile::Protocol;

use super::{ChannelError, ControlChannel, Endpoint, ForwardTuple};
use crate::observer::{JsonLinesGuestAgent, ObserveError};

/// How long the datagram loop blocks before checking for a stop request.
const DATAGRAM_POLL: Duration = Duration::from_millis(200);

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const MAX_DATAGRAM: usize = 65_535;

/// Byte stream to the guest half of a relay.
pub trait RelayConn: Read + Write + Send + 'static {
    fn try_clone_conn(&self) -> io::Result<Box<dyn RelayConn>>;

    fn shutdown_conn(&self, how: Shutdown) -> io::Result<()>;
}

impl RelayConn for TcpStream {
    fn try_clone_conn(&self) -> io::Result<Box<dyn RelayConn>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_conn(&self, how: Shutdown) -> io::Result<()> {
        self.shutdown(how)
    }
}

#[cfg(target_os = "linux")]
impl RelayConn for vsock::VsockStream {
    fn try_clone_conn(&self) -> io::Result<Box<dyn RelayConn>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_conn(&self, how: Shutdown) -> io::Result<()> {
        self.shutdown(how)
    }
}

/// Guest half of relayed forwards.
#[async_trait]
pub trait RelayGuest: Send + Sync + 'static {
    /// Have the guest splice connections on relay `port` to `tuple.connect`.
    async fn open(&self, port: u32, tuple: &ForwardTuple) -> Result<(), ChannelError>;

    async fn close(&self, port: u32) -> Result<(), ChannelError>;

    /// Connect to the guest half of relay `port`. Blocks.
    fn dial(&self, port: u32) -> io::Result<Box<dyn RelayConn>>;
}

// =============================================================================
// Guest agent relay control
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayRequest {
    OpenRelay {
        port: u32,
        protocol: &'static str,
        connect: String,
    },
    CloseRelay {
        port: u32,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayReply {
    Ok,
    Error {
        #[serde(default)]
        detail: String,
    },
}

/// Parse the guest agent's answer to a relay request.
pub fn parse_relay_reply(line: &str) -> Result<(), ChannelError> {
    let reply: RelayReply = serde_json::from_str(line.trim())
        .map_err(|e| ChannelError::Unsupported(format!("guest agent relay reply: {e}")))?;

    let detail = match reply {
        RelayReply::Ok => return Ok(()),
        RelayReply::Error { detail } => detail,
    };
    let lower = detail.to_ascii_lowercase();
    if lower.contains("in use") {
        Err(ChannelError::AddressInUse(detail))
    } else if lower.contains("no such relay") || lower.contains("not found") {
        Err(ChannelError::NotFound(detail))
    } else if lower.contains("busy") || lower.contains("not ready") {
        Err(ChannelError::Busy(detail))
    } else {
        Err(ChannelError::Unsupported(detail))
    }
}

/// Guest half driven through the guest agent, dialed over vsock.
pub struct AgentRelayGuest {
    agent: JsonLinesGuestAgent,
    cid: u32,
}

impl AgentRelayGuest {
    pub fn new(agent: JsonLinesGuestAgent, cid: u32) -> Self {
        Self { agent, cid }
    }

    async fn call(&self, request: &RelayRequest) -> Result<(), ChannelError> {
        let line = self.agent.request_line(request).await.map_err(|e| match e {
            ObserveError::Malformed(detail) => ChannelError::Unsupported(detail),
            other => ChannelError::Busy(other.to_string()),
        })?;
        parse_relay_reply(&line)
    }
}

#[async_trait]
impl RelayGuest for AgentRelayGuest {
    async fn open(&self, port: u32, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        self.call(&RelayRequest::OpenRelay {
            port,
            protocol: tuple.protocol.as_str(),
            connect: tuple.connect.to_string(),
        })
        .await
    }

    async fn close(&self, port: u32) -> Result<(), ChannelError> {
        self.call(&RelayRequest::CloseRelay { port }).await
    }

    #[cfg(target_os = "linux")]
    fn dial(&self, port: u32) -> io::Result<Box<dyn RelayConn>> {
        let stream = vsock::VsockStream::connect(&vsock::VsockAddr::new(self.cid, port))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(target_os = "linux"))]
    fn dial(&self, port: u32) -> io::Result<Box<dyn RelayConn>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("vsock relay to cid {} port {port} needs a linux host", self.cid),
        ))
    }
}

// =============================================================================
// Relay servers
// =============================================================================

enum RelayServer {
    Stream(tokio::task::JoinHandle<()>),
    Datagram {
        stop: Arc<AtomicBool>,
        worker: JoinHandle<()>,
    },
}

impl RelayServer {
    /// Stop serving. The host endpoint is released when this returns.
    async fn stop(self) {
        match self {
            Self::Stream(task) => {
                task.abort();
                let _ = task.await;
            }
            Self::Datagram { stop, worker } => {
                stop.store(true, Ordering::SeqCst);
                if !matches!(tokio::task::spawn_blocking(move || worker.join()).await, Ok(Ok(()))) {
                    warn!("Datagram relay worker did not stop cleanly");
                }
            }
        }
    }

    fn abort(&self) {
        match self {
            Self::Stream(task) => task.abort(),
            Self::Datagram { stop, .. } => stop.store(true, Ordering::SeqCst),
        }
    }
}

struct ActiveRelay {
    tuple: ForwardTuple,
    server: RelayServer,
}

/// Control channel that serves relayed tuples itself.
pub struct RelayChannel<C, G> {
    inner: C,
    guest: Arc<G>,
    relays: Mutex<BTreeMap<u32, ActiveRelay>>,
}

impl<C: ControlChannel, G: RelayGuest> RelayChannel<C, G> {
    pub fn new(inner: C, guest: G) -> Self {
        Self {
            inner,
            guest: Arc::new(guest),
            relays: Mutex::new(BTreeMap::new()),
        }
    }

    /// Relay ports currently served.
    pub fn relay_ports(&self) -> Vec<u32> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, ActiveRelay>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn start(&self, port: u32, tuple: &ForwardTuple) -> Result<RelayServer, ChannelError> {
        let bind = match &tuple.bind {
            Endpoint::Inet(addr) => *addr,
            Endpoint::Unix(path) => {
                return Err(ChannelError::Unsupported(format!(
                    "unix socket {} cannot be relayed",
                    path.display()
                )))
            }
        };

        // bind first so a taken host endpoint never reaches the guest
        match tuple.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(bind).await.map_err(|e| bind_error(bind, e))?;
                self.guest.open(port, tuple).await?;
                let task = tokio::spawn(serve_stream(listener, port, self.guest.clone()));
                Ok(RelayServer::Stream(task))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(bind).map_err(|e| bind_error(bind, e))?;
                socket.set_read_timeout(Some(DATAGRAM_POLL))?;
                self.guest.open(port, tuple).await?;

                let stop = Arc::new(AtomicBool::new(false));
                let worker = {
                    let stop = stop.clone();
                    let guest = self.guest.clone();
                    std::thread::Builder::new()
                        .name(format!("udp-relay-{port}"))
                        .spawn(move || serve_datagrams(socket, port, guest, stop))?
                };
                Ok(RelayServer::Datagram { stop, worker })
            }
            Protocol::Unix => Err(ChannelError::Unsupported("unix sockets are not relayed".to_string())),
        }
    }
}

fn bind_error(addr: SocketAddr, e: io::Error) -> ChannelError {
    let detail = format!("{addr}: {e}");
    match e.kind() {
        io::ErrorKind::AddrInUse => ChannelError::AddressInUse(detail),
        io::ErrorKind::PermissionDenied => ChannelError::PermissionDenied(detail),
        io::ErrorKind::AddrNotAvailable => ChannelError::InvalidAddress(detail),
        _ => ChannelError::Io(e),
    }
}

#[async_trait]
impl<C: ControlChannel, G: RelayGuest> ControlChannel for RelayChannel<C, G> {
    async fn add_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        let Some(port) = tuple.relay_port else {
            return self.inner.add_forward(tuple).await;
        };

        let existing = self.lock().get(&port).map(|r| r.tuple.clone());
        if let Some(existing) = existing {
            if existing == *tuple {
                return Ok(());
            }
            return Err(ChannelError::AddressInUse(format!("relay port {port} serves {existing}")));
        }

        let server = self.start(port, tuple).await?;
        info!(forward = %tuple, "Relay started");
        self.lock().insert(
            port,
            ActiveRelay {
                tuple: tuple.clone(),
                server,
            },
        );
        Ok(())
    }

    async fn cancel_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        let Some(port) = tuple.relay_port else {
            return self.inner.cancel_forward(tuple).await;
        };

        let Some(relay) = self.lock().remove(&port) else {
            return Err(ChannelError::NotFound(format!("relay port {port}")));
        };
        relay.server.stop().await;
        if let Err(e) = self.guest.close(port).await {
            debug!(port, error = %e, "Guest relay close failed");
        }
        info!(forward = %relay.tuple, "Relay stopped");
        Ok(())
    }

    async fn check_alive(&self) -> bool {
        self.inner.check_alive().await
    }

    /// Relays do not ride the control connection and survive a reconnect.
    async fn reconnect(&self) -> Result<(), ChannelError> {
        self.inner.reconnect().await
    }
}

impl<C, G> Drop for RelayChannel<C, G> {
    fn drop(&mut self) {
        let relays = self.relays.get_mut().unwrap_or_else(PoisonError::into_inner);
        for relay in relays.values() {
            relay.server.abort();
        }
    }
}

// =============================================================================
// Bridging
// =============================================================================

async fn serve_stream<G: RelayGuest>(listener: TcpListener, port: u32, guest: Arc<G>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(port, error = %e, "Relay accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let host = match stream.into_std() {
            Ok(host) => host,
            Err(e) => {
                debug!(port, peer = %peer, error = %e, "Failed to detach relay connection");
                continue;
            }
        };

        let guest = guest.clone();
        tokio::task::spawn_blocking(move || {
            let result = host
                .set_nonblocking(false)
                .and_then(|()| guest.dial(port))
                .and_then(|conn| bridge_stream(host, conn));
            if let Err(e) = result {
                debug!(port, peer = %peer, error = %e, "Relay connection ended with error");
            }
        });
    }
}

/// Copy both directions until each side has closed its write half.
fn bridge_stream(host: TcpStream, guest: Box<dyn RelayConn>) -> io::Result<()> {
    let mut guest_reader = guest.try_clone_conn()?;
    let mut guest_writer = guest;
    let mut host_reader = host.try_clone()?;
    let mut host_writer = host;

    let upstream = std::thread::spawn(move || {
        let copied = io::copy(&mut host_reader, &mut guest_writer);
        let _ = guest_writer.shutdown_conn(Shutdown::Write);
        copied
    });

    let downstream = io::copy(&mut guest_reader, &mut host_writer);
    let _ = host_writer.shutdown(Shutdown::Write);

    let upstream = upstream
        .join()
        .map_err(|_| io::Error::other("relay upstream thread panicked"))?;
    upstream?;
    downstream?;
    Ok(())
}

struct DatagramPeer {
    writer: Box<dyn RelayConn>,
    reader: JoinHandle<()>,
}

impl DatagramPeer {
    fn open<G: RelayGuest>(socket: &UdpSocket, peer: SocketAddr, port: u32, guest: &G) -> io::Result<Self> {
        let writer = guest.dial(port)?;
        let mut frames = writer.try_clone_conn()?;
        let replies = socket.try_clone()?;

        let reader = std::thread::spawn(move || loop {
            match read_frame(&mut frames) {
                Ok(Some(datagram)) => {
                    if let Err(e) = replies.send_to(&datagram, peer) {
                        debug!(peer = %peer, error = %e, "Relay reply dropped");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Relay stream closed");
                    break;
                }
            }
        });

        Ok(Self { writer, reader })
    }

    fn close(self) {
        let _ = self.writer.shutdown_conn(Shutdown::Both);
        let _ = self.reader.join();
    }
}

fn serve_datagrams<G: RelayGuest>(socket: UdpSocket, port: u32, guest: Arc<G>, stop: Arc<AtomicBool>) {
    let mut peers: HashMap<SocketAddr, DatagramPeer> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !stop.load(Ordering::SeqCst) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!(port, error = %e, "Datagram relay receive failed");
                break;
            }
        };

        let session = match peers.entry(peer) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match DatagramPeer::open(&socket, peer, port, &*guest) {
                Ok(session) => entry.insert(session),
                Err(e) => {
                    debug!(port, peer = %peer, error = %e, "Failed to dial relay for datagram peer");
                    continue;
                }
            },
        };

        if let Err(e) = write_frame(&mut session.writer, &buf[..len]) {
            debug!(port, peer = %peer, error = %e, "Datagram peer relay closed");
            if let Some(session) = peers.remove(&peer) {
                session.close();
            }
        }
    }

    for (_, session) in peers.drain() {
        session.close();
    }
}

fn write_frame<W: Write + ?Sized>(writer: &mut W, datagram: &[u8]) -> io::Result<()> {
    let len = u16::try_from(datagram.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(datagram)?;
    writer.flush()
}

/// `None` on a clean end of stream.
fn read_frame<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 2];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut datagram = vec![0u8; usize::from(u16::from_be_bytes(len))];
    reader.read_exact(&mut datagram)?;
    Ok(Some(datagram))
}
