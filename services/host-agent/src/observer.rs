//! Guest listening-socket observation.
//!
//! The guest agent answers a single request with the sockets currently
//! listening inside the guest:
//!
//! ```text
//! -> {"type":"list_sockets"}
//! <- {"type":"sockets","sockets":[{"protocol":"tcp","address":"0.0.0.0","port":8080}]}
//! <- {"type":"unreachable","detail":"guest agent not ready"}
//! ```
//!
//! A failed poll never empties the desired state: the observer hands back
//! the last good snapshot marked stale.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vmfwd_reconcile::{GuestSocket, GuestSocketSnapshot, Protocol};

use crate::actors::shutdown_signalled;

/// Largest response accepted from the guest agent.
const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("guest poll timed out after {0:?}")]
    Timeout(Duration),

    #[error("guest agent unreachable: {0}")]
    Unreachable(String),

    #[error("guest agent transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed guest agent response: {0}")]
    Malformed(String),
}

/// Source of guest listening sockets.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    async fn list_sockets(&self) -> Result<Vec<GuestSocket>, ObserveError>;
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    ListSockets,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Response {
    Sockets {
        sockets: Vec<WireSocket>,
    },
    Unreachable {
        #[serde(default)]
        detail: String,
    },
}

#[derive(Debug, Deserialize)]
struct WireSocket {
    protocol: String,
    address: String,
    port: u16,
}

impl TryFrom<WireSocket> for GuestSocket {
    type Error = ObserveError;

    fn try_from(wire: WireSocket) -> Result<Self, Self::Error> {
        let protocol = match wire.protocol.parse::<Protocol>() {
            Ok(p @ (Protocol::Tcp | Protocol::Udp)) => p,
            _ => {
                return Err(ObserveError::Malformed(format!(
                    "unsupported protocol '{}'",
                    wire.protocol
                )))
            }
        };
        let address = wire
            .address
            .parse::<IpAddr>()
            .map_err(|_| ObserveError::Malformed(format!("bad address '{}'", wire.address)))?;
        if wire.port == 0 {
            return Err(ObserveError::Malformed("port 0".to_string()));
        }
        Ok(GuestSocket::new(protocol, address, wire.port))
    }
}

/// Parse one response line.
pub fn parse_response(line: &str) -> Result<Vec<GuestSocket>, ObserveError> {
    let response: Response =
        serde_json::from_str(line.trim()).map_err(|e| ObserveError::Malformed(e.to_string()))?;
    match response {
        Response::Sockets { sockets } => sockets.into_iter().map(GuestSocket::try_from).collect(),
        Response::Unreachable { detail } => Err(ObserveError::Unreachable(detail)),
    }
}

// =============================================================================
// JSON-lines guest agent client
// =============================================================================

/// Where the guest agent listens on the host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestAgentAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for GuestAgentAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<SocketAddr>() {
            Ok(addr) => Self::Tcp(addr),
            Err(_) => Self::Unix(PathBuf::from(s)),
        })
    }
}

/// Guest agent spoken to over one JSON line each way.
pub struct JsonLinesGuestAgent {
    address: GuestAgentAddress,
}

impl JsonLinesGuestAgent {
    pub fn new(address: GuestAgentAddress) -> Self {
        Self { address }
    }

    /// Send one request line and return the raw response line.
    pub async fn request_line<R: Serialize>(&self, request: &R) -> Result<String, ObserveError> {
        let mut request = serde_json::to_vec(request).map_err(|e| ObserveError::Malformed(e.to_string()))?;
        request.push(b'\n');

        match &self.address {
            GuestAgentAddress::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| ObserveError::Unreachable(format!("{}: {e}", path.display())))?;
                Self::exchange(stream, &request).await
            }
            GuestAgentAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| ObserveError::Unreachable(format!("{addr}: {e}")))?;
                Self::exchange(stream, &request).await
            }
        }
    }

    async fn exchange<S>(stream: S, request: &[u8]) -> Result<String, ObserveError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(request).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader.take(MAX_RESPONSE_BYTES));
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ObserveError::Unreachable("connection closed before response".to_string()));
        }
        Ok(line)
    }
}

#[async_trait]
impl GuestAgent for JsonLinesGuestAgent {
    async fn list_sockets(&self) -> Result<Vec<GuestSocket>, ObserveError> {
        let line = self.request_line(&Request::ListSockets).await?;
        parse_response(&line)
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Whether a guest socket can be reached through a forward at all.
///
/// Only the canonical loopback addresses are kept from the loopback ranges.
fn is_forwardable(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() && v4 != Ipv4Addr::LOCALHOST)
                && !v4.is_link_local()
                && !v4.is_multicast()
                && !v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            // fe80::/10
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !link_local && !v6.is_multicast()
        }
    }
}

/// Result of one poll.
#[derive(Debug)]
pub struct Observation {
    pub snapshot: GuestSocketSnapshot,
    /// Why the snapshot is stale, if it is.
    pub error: Option<ObserveError>,
    /// Held until the pass that consumes this observation finishes.
    permit: Option<OwnedSemaphorePermit>,
}

impl Observation {
    pub fn fresh(snapshot: GuestSocketSnapshot) -> Self {
        Self {
            snapshot,
            error: None,
            permit: None,
        }
    }

    pub fn failed(previous: GuestSocketSnapshot, error: ObserveError) -> Self {
        Self {
            snapshot: previous.into_stale(),
            error: Some(error),
            permit: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot.is_stale()
    }
}

/// Polls the guest agent and keeps the last good snapshot.
pub struct GuestPortObserver<A> {
    agent: A,
    last: GuestSocketSnapshot,
    consecutive_failures: u32,
}

impl<A: GuestAgent> GuestPortObserver<A> {
    pub fn new(agent: A) -> Self {
        Self {
            agent,
            last: GuestSocketSnapshot::empty(),
            consecutive_failures: 0,
        }
    }

    /// Poll once, bounded by `timeout`.
    pub async fn poll(&mut self, timeout: Duration) -> Observation {
        let result = match tokio::time::timeout(timeout, self.agent.list_sockets()).await {
            Ok(result) => result,
            Err(_) => Err(ObserveError::Timeout(timeout)),
        };

        match result {
            Ok(sockets) => {
                let total = sockets.len();
                let snapshot =
                    GuestSocketSnapshot::new(sockets.into_iter().filter(|s| is_forwardable(s.address)));
                if self.consecutive_failures > 0 {
                    info!(failures = self.consecutive_failures, "Guest agent reachable again");
                }
                debug!(sockets = snapshot.len(), filtered = total - snapshot.len(), "Guest poll succeeded");
                self.consecutive_failures = 0;
                self.last = snapshot.clone();
                Observation::fresh(snapshot)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1 {
                    warn!(error = %e, "Guest poll failed, keeping last snapshot");
                } else {
                    debug!(error = %e, failures = self.consecutive_failures, "Guest poll failed");
                }
                Observation::failed(self.last.clone(), e)
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Runs the observer on its own cadence.
///
/// A poll only starts once the previous observation has been applied, so at
/// most one observation is ever queued for the reconciliation loop.
pub struct ObserverTask<A> {
    observer: GuestPortObserver<A>,
    interval: Duration,
    timeout: Duration,
    gate: Arc<Semaphore>,
}

impl<A: GuestAgent + 'static> ObserverTask<A> {
    pub fn new(observer: GuestPortObserver<A>, interval: Duration, timeout: Duration) -> Self {
        Self {
            observer,
            interval,
            timeout,
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn spawn(
        self,
        tx: mpsc::Sender<Observation>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(tx, shutdown))
    }

    async fn run(mut self, tx: mpsc::Sender<Observation>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }

            let permit = tokio::select! {
                permit = self.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_signalled(&mut shutdown) => break,
            };

            let mut observation = tokio::select! {
                observation = self.observer.poll(self.timeout) => observation,
                _ = shutdown_signalled(&mut shutdown) => break,
            };
            observation.permit = Some(permit);

            if tx.send(observation).await.is_err() {
                debug!("Reconciliation loop gone, stopping observer");
                break;
            }
        }

        info!("Guest observer stopped");
    }
}
